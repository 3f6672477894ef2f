//! Runs enqueued calls.
//!
//! A [`Dispatcher`] receives [`AsyncCall`]s from [`Call::enqueue`] and
//! decides when and where they run. [`TokioDispatcher`] spawns one tokio
//! task per call and bounds concurrency with semaphores:
//!
//! ```text
//! enqueue ──► spawn task ──► per-host permit ──► global permit ──► run
//!                          (max_requests_per_host)  (max_requests)
//! ```
//!
//! Whatever the dispatcher does, the call's callback fires exactly once:
//! an [`AsyncCall`] dropped without running reports [`Error::Canceled`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::http::Response;

use super::call::Call;

// ============================================================================
// Types
// ============================================================================

/// Completion callback of an enqueued call.
pub type Callback = Box<dyn FnOnce(Result<Response>) + Send + 'static>;

// ============================================================================
// Dispatcher
// ============================================================================

/// Schedules enqueued calls.
pub trait Dispatcher: Send + Sync + 'static {
    /// Takes ownership of `call` and runs it eventually.
    ///
    /// Dropping `call` instead of running it completes it with
    /// [`Error::Canceled`].
    fn enqueue(&self, call: AsyncCall);

    /// Returns the number of calls currently running.
    fn running_calls_count(&self) -> usize;

    /// Returns the number of calls waiting for a permit.
    fn queued_calls_count(&self) -> usize;
}

// ============================================================================
// AsyncCall
// ============================================================================

/// An enqueued call and its pending callback.
pub struct AsyncCall {
    call: Call,
    callback: Option<Callback>,
}

impl AsyncCall {
    pub(crate) fn new(call: Call, callback: Callback) -> Self {
        Self {
            call,
            callback: Some(callback),
        }
    }

    /// Returns the call.
    #[inline]
    #[must_use]
    pub fn call(&self) -> &Call {
        &self.call
    }

    /// Returns the host the request targets, for per-host limits.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        self.call.request().host()
    }

    /// Runs the call and delivers its result to the callback.
    pub async fn run(mut self) {
        let result = self.call.run().await;
        self.complete(result);
    }

    /// Completes the call with `error` without running it.
    pub fn fail(mut self, error: Error) {
        self.complete(Err(error));
    }

    fn complete(&mut self, result: Result<Response>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl Drop for AsyncCall {
    fn drop(&mut self) {
        if self.callback.is_some() {
            debug!(call = %self.call.id(), "Enqueued call dropped before running");
            self.complete(Err(Error::Canceled));
        }
    }
}

impl fmt::Debug for AsyncCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncCall")
            .field("call", &self.call)
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

// ============================================================================
// TokioDispatcher
// ============================================================================

/// Default dispatcher: one tokio task per call, bounded by semaphores.
pub struct TokioDispatcher {
    max_requests_per_host: usize,
    global: Arc<Semaphore>,
    per_host: Mutex<FxHashMap<String, Arc<Semaphore>>>,
    running: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

impl TokioDispatcher {
    /// Creates a dispatcher with the given limits. Zero limits are raised
    /// to one.
    #[must_use]
    pub fn new(max_requests: usize, max_requests_per_host: usize) -> Self {
        Self {
            max_requests_per_host: max_requests_per_host.max(1),
            global: Arc::new(Semaphore::new(max_requests.max(1))),
            per_host: Mutex::new(FxHashMap::default()),
            running: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Returns the semaphore for `host`, dropping entries no task holds.
    fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut per_host = self.per_host.lock();
        per_host.retain(|_, semaphore| Arc::strong_count(semaphore) > 1);
        Arc::clone(
            per_host
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_requests_per_host))),
        )
    }
}

impl Dispatcher for TokioDispatcher {
    fn enqueue(&self, call: AsyncCall) {
        let Ok(handle) = Handle::try_current() else {
            warn!(call = %call.call().id(), "No tokio runtime to run enqueued call");
            call.fail(Error::illegal_state("enqueue requires a tokio runtime"));
            return;
        };

        let global = Arc::clone(&self.global);
        let host = self.host_semaphore(call.host());
        let running = Arc::clone(&self.running);
        let queued = Arc::clone(&self.queued);
        queued.fetch_add(1, Ordering::SeqCst);

        handle.spawn(async move {
            let permits = async {
                let host = host.acquire_owned().await.ok()?;
                let global = global.acquire_owned().await.ok()?;
                Some((host, global))
            }
            .await;
            queued.fetch_sub(1, Ordering::SeqCst);

            let Some(_permits) = permits else {
                // Dropping the call reports cancellation.
                return;
            };

            running.fetch_add(1, Ordering::SeqCst);
            call.run().await;
            running.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn running_calls_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    fn queued_calls_count(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for TokioDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioDispatcher")
            .field("available", &self.global.available_permits())
            .field("max_requests_per_host", &self.max_requests_per_host)
            .field("running", &self.running_calls_count())
            .field("queued", &self.queued_calls_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::sync::oneshot;

    use crate::client::Client;
    use crate::http::Request;

    struct Dropping;

    impl Dispatcher for Dropping {
        fn enqueue(&self, call: AsyncCall) {
            drop(call);
        }

        fn running_calls_count(&self) -> usize {
            0
        }

        fn queued_calls_count(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_dropped_call_completes_once_with_canceled() {
        let client = Client::builder().dispatcher(Dropping).build().expect("client");
        let call = client.new_call(Request::get("http://example.com/").expect("request"));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        call.enqueue(move |result| {
            assert!(matches!(result, Err(Error::Canceled)));
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .expect("enqueue");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_enqueue_without_runtime_fails_callback() {
        let client = Client::builder().build().expect("client");
        let call = client.new_call(Request::get("http://example.com/").expect("request"));
        let (tx, mut rx) = oneshot::channel();

        call.enqueue(move |result| {
            let _ = tx.send(result.is_err());
        })
        .expect("enqueue");

        assert_eq!(rx.try_recv(), Ok(true));
    }

    #[tokio::test]
    async fn test_canceled_call_reports_through_callback() {
        let client = Client::builder().build().expect("client");
        let call = client.new_call(Request::get("http://127.0.0.1:9/").expect("request"));
        call.cancel();
        let (tx, rx) = oneshot::channel();

        call.enqueue(move |result| {
            let _ = tx.send(matches!(result, Err(Error::Canceled)));
        })
        .expect("enqueue");

        let canceled = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("callback in time")
            .expect("callback");
        assert!(canceled);
    }

    #[tokio::test]
    async fn test_counts_settle_to_zero() {
        let dispatcher = TokioDispatcher::new(2, 1);
        let client = Client::builder().build().expect("client");
        let call = client.new_call(Request::get("http://127.0.0.1:9/").expect("request"));
        call.cancel();
        let (tx, rx) = oneshot::channel();

        dispatcher.enqueue(AsyncCall::new(
            call,
            Box::new(move |_| {
                let _ = tx.send(());
            }),
        ));
        rx.await.expect("callback");
        tokio::task::yield_now().await;

        assert_eq!(dispatcher.queued_calls_count(), 0);
        assert!(dispatcher.running_calls_count() <= 1);
    }

    #[test]
    fn test_host_semaphores_are_shared_and_pruned() {
        let dispatcher = TokioDispatcher::new(4, 2);

        let a = dispatcher.host_semaphore("a.test");
        let again = dispatcher.host_semaphore("a.test");
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(a.available_permits(), 2);

        drop(a);
        drop(again);
        let _b = dispatcher.host_semaphore("b.test");
        assert_eq!(dispatcher.per_host.lock().len(), 1);
    }
}
