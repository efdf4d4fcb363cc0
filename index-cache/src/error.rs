//! Error kinds produced by the core substrate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// The error kinds the core produces, per the propagation policy: the same
/// error is shared with every waiter of a [`crate::singleflight::SingleFlight`]
/// call and delivered as a terminal read error to every subscriber of a
/// [`crate::broadcast::BroadcastSession`]. `Clone` is required for both.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// The requested project or artifact does not exist upstream.
    #[error("not found")]
    NotFound,

    /// Network or 5xx from upstream; transient.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Malformed upstream response. Not retried automatically.
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// A put/get/delete against the `Storage` back-end failed.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// The artifact cannot be cached because it exceeds the size budget.
    /// Non-fatal: stream-through still succeeds.
    #[error("capacity exceeded")]
    CapacityExceeded,

    /// The caller or an operator-initiated shutdown cancelled the operation.
    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}
