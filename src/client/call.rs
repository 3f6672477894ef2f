//! One logical request.
//!
//! A [`Call`] runs at most once, either inline with [`Call::execute`] or on
//! the client's dispatcher with [`Call::enqueue`]. Use
//! [`Call::duplicate`] to send the same request again.
//!
//! # Example
//!
//! ```no_run
//! use callwire::{Client, Request};
//!
//! # async fn example() -> callwire::Result<()> {
//! let client = Client::builder().build()?;
//! let call = client.new_call(Request::get("http://example.com/")?);
//!
//! let response = call.execute().await?;
//! assert!(call.execute().await.is_err()); // single execution
//!
//! call.duplicate().enqueue(|result| {
//!     if let Ok(response) = result {
//!         println!("{}", response.code());
//!     }
//! })?;
//! # drop(response);
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::identifiers::CallId;
use crate::pipeline::{self, Chain, RetryAndFollowUp};

use super::core::ClientShared;
use super::dispatcher::AsyncCall;

// ============================================================================
// Types
// ============================================================================

struct CallInner {
    id: CallId,
    client: Arc<ClientShared>,
    original: Request,
    executed: AtomicBool,
    retry: Arc<RetryAndFollowUp>,
}

// ============================================================================
// Call
// ============================================================================

/// A request prepared for execution.
///
/// Clones are handles to the same call: executing or canceling one affects
/// all of them.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

impl Call {
    pub(crate) fn new(client: Arc<ClientShared>, request: Request) -> Self {
        let retry = Arc::new(RetryAndFollowUp::new(Arc::clone(&client)));
        Self {
            inner: Arc::new(CallInner {
                id: CallId::generate(),
                client,
                original: request,
                executed: AtomicBool::new(false),
                retry,
            }),
        }
    }

    /// Returns the call ID used in logs.
    #[inline]
    #[must_use]
    pub fn id(&self) -> CallId {
        self.inner.id
    }

    /// Returns the request as passed to [`Client::new_call`](crate::Client::new_call).
    #[inline]
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.inner.original
    }

    /// Returns `true` once [`execute`](Self::execute) or
    /// [`enqueue`](Self::enqueue) was called.
    #[inline]
    #[must_use]
    pub fn is_executed(&self) -> bool {
        self.inner.executed.load(Ordering::SeqCst)
    }

    /// Returns `true` once [`cancel`](Self::cancel) was called.
    #[inline]
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.retry.is_canceled()
    }

    /// Returns a new, unexecuted call for the same request.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self::new(Arc::clone(&self.inner.client), self.inner.original.clone())
    }
}

// ============================================================================
// Call - Execution
// ============================================================================

impl Call {
    /// Runs the call and returns its response.
    ///
    /// # Errors
    ///
    /// - [`Error::IllegalState`] if the call was already executed
    /// - [`Error::Canceled`] if the call was canceled
    /// - Any unrecoverable transport, protocol or security failure
    pub async fn execute(&self) -> Result<Response> {
        self.mark_executed()?;
        self.run().await
    }

    /// Schedules the call on the client's dispatcher.
    ///
    /// `callback` receives exactly one result, on a dispatcher task.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalState`] if the call was already executed; the
    /// callback is not invoked in that case.
    pub fn enqueue<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<Response>) + Send + 'static,
    {
        self.mark_executed()?;
        let dispatcher = Arc::clone(&self.inner.client.dispatcher);
        dispatcher.enqueue(AsyncCall::new(self.clone(), Box::new(callback)));
        Ok(())
    }

    /// Cancels the call.
    ///
    /// In-flight I/O fails with [`Error::Canceled`]. Canceling a finished
    /// call does nothing.
    pub fn cancel(&self) {
        debug!(call = %self.inner.id, "Call canceled");
        self.inner.retry.cancel();
    }

    fn mark_executed(&self) -> Result<()> {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            return Err(Error::illegal_state("Already Executed"));
        }
        Ok(())
    }

    /// Runs the pipeline. Callers have already marked the call executed.
    pub(crate) async fn run(&self) -> Result<Response> {
        let inner = &self.inner;
        let stages = pipeline::stages(&inner.client, Arc::clone(&inner.retry));
        let mut chain = Chain::new(&stages, inner.original.clone(), &inner.client, inner.id);

        debug!(
            call = %inner.id,
            method = %inner.original.method(),
            url = %redacted_url(&inner.original),
            "Call started"
        );

        let result = chain.proceed(inner.original.clone()).await;

        match &result {
            Ok(response) => debug!(call = %inner.id, status = response.code(), "Call finished"),
            Err(e) => debug!(call = %inner.id, error = %e, "Call failed"),
        }
        result
    }
}

/// URL without credentials, query or fragment, for logs.
pub(crate) fn redacted_url(request: &Request) -> String {
    let url = request.url();
    format!(
        "{}://{}{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.port().map(|port| format!(":{port}")).unwrap_or_default()
    ) + url.path()
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("method", self.inner.original.method())
            .field("url", &redacted_url(&self.inner.original))
            .field("executed", &self.is_executed())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
