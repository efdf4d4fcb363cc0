//! Single-flight call coalescing (spec §4.2).
//!
//! For a given string key, at most one execution of a supplied function runs
//! concurrently; callers arriving while a call is in flight wait for and
//! share its result. The function runs on its own spawned task so that
//! cancelling any individual waiter's future cannot cancel the shared call —
//! it completes on its own budget regardless of who is still listening.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

struct Call<V, E> {
    waiters: AtomicUsize,
    tx: watch::Sender<Option<Result<V, E>>>,
}

struct Inner<V, E> {
    calls: Mutex<HashMap<String, Arc<Call<V, E>>>>,
}

/// A keyed call-coalescing registry. Cheap to clone; clones share the same
/// underlying call table.
pub struct SingleFlight<V, E> {
    inner: Arc<Inner<V, E>>,
}

impl<V, E> Clone for SingleFlight<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V, E> Default for SingleFlight<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V, E> SingleFlight<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                calls: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Runs `f` for `key` if no call for it is already in flight, otherwise
    /// waits for and shares the in-flight call's result. Returns the result
    /// and whether it was shared with at least one other waiter.
    pub async fn do_call<F, Fut>(&self, key: &str, f: F) -> (Result<V, E>, bool)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let mut calls = self.inner.calls.lock().await;

        if let Some(call) = calls.get(key) {
            let call = call.clone();
            call.waiters.fetch_add(1, Ordering::SeqCst);
            drop(calls);

            return (Self::await_result(&call).await, true);
        }

        let (tx, _rx) = watch::channel(None);
        let call = Arc::new(Call {
            waiters: AtomicUsize::new(1),
            tx,
        });
        calls.insert(key.to_string(), call.clone());
        drop(calls);

        let inner = self.inner.clone();
        let owned_key = key.to_string();
        let task_call = call.clone();
        tokio::spawn(async move {
            let result = f().await;
            let _ = task_call.tx.send(Some(result));
            inner.calls.lock().await.remove(&owned_key);
        });

        let result = Self::await_result(&call).await;
        let shared = call.waiters.load(Ordering::SeqCst) > 1;

        (result, shared)
    }

    async fn await_result(call: &Arc<Call<V, E>>) -> Result<V, E> {
        let mut rx = call.tx.subscribe();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }

            rx.changed()
                .await
                .expect("single-flight call task dropped without producing a result");
        }
    }
}
