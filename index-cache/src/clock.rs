//! A monotonic time source, injectable for tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A source of monotonic time. The core never calls `Instant::now()`
/// directly so that TTL expiry can be driven deterministically in tests.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;
}

/// The production clock, backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that starts at process start and can be advanced by a fixed
/// offset, for deterministic TTL tests.
pub struct AdvanceableClock {
    base: Instant,
    offset_millis: AtomicU64,
}

impl AdvanceableClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_millis: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for AdvanceableClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for AdvanceableClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_millis.load(Ordering::SeqCst))
    }
}
