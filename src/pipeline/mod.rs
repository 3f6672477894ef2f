//! Interceptor pipeline.
//!
//! A call runs through an ordered list of [`Interceptor`]s. Each stage gets a
//! [`Chain`] positioned after itself and decides whether, and how often, to
//! hand the request on with [`Chain::proceed`].
//!
//! # Stages
//!
//! ```text
//! application interceptors    any number of proceed() calls
//!          │
//! RetryAndFollowUp            owns the StreamAllocation, loops on failures
//!          │                  and redirects/auth challenges
//! Bridge                      fills Host, Content-Length, User-Agent, ...
//!          │
//! Connect                     resolves a connection, binds a codec
//!          │
//! network interceptors        same host/port, exactly one proceed()
//!          │
//! CallServer                  writes the request, reads the response
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `retry` | Retry and follow-up stage |
//! | `bridge` | Default request headers |
//! | `connect` | Connection and codec binding |
//! | `call_server` | Wire exchange |

// ============================================================================
// Submodules
// ============================================================================

/// Default request headers.
pub(crate) mod bridge;

/// Wire exchange stage.
pub(crate) mod call_server;

/// Connection binding stage.
pub(crate) mod connect;

/// Retry and follow-up stage.
pub(crate) mod retry;

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::client::ClientShared;
use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::http::{Request, Response};
use crate::identifiers::CallId;
use crate::transport::allocation::StreamLease;
use crate::transport::{Connection, StreamAllocation};

pub(crate) use bridge::Bridge;
pub(crate) use call_server::CallServer;
pub(crate) use connect::Connect;
pub(crate) use retry::RetryAndFollowUp;

// ============================================================================
// Interceptor
// ============================================================================

/// One stage of the pipeline.
///
/// Application interceptors (added with
/// [`ClientBuilder::interceptor`](crate::ClientBuilder::interceptor)) see the
/// call once and may proceed any number of times. Network interceptors (added
/// with [`ClientBuilder::network_interceptor`](crate::ClientBuilder::network_interceptor))
/// run once per attempt on a bound connection and must proceed exactly once
/// without changing the host or port.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use callwire::{Chain, Interceptor, Response, Result};
///
/// struct Tag;
///
/// #[async_trait]
/// impl Interceptor for Tag {
///     async fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
///         let request = chain
///             .request()
///             .to_builder()
///             .header("x-tag", "on")
///             .build()?;
///         chain.proceed(request).await
///     }
/// }
/// ```
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Handles the chain's request, usually by calling [`Chain::proceed`].
    async fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response>;

    /// Name used in contract-violation errors and logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

// ============================================================================
// Chain
// ============================================================================

/// Codec bound to one attempt, with its completion lease.
pub(crate) struct BoundStream {
    pub(crate) codec: Box<dyn Codec>,
    pub(crate) lease: StreamLease,
}

/// Position of one stage in the pipeline.
pub struct Chain<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    index: usize,
    request: Request,
    client: &'a ClientShared,
    call_id: CallId,
    allocation: Option<Arc<StreamAllocation>>,
    stream: Option<BoundStream>,
    connection: Option<Arc<Connection>>,
    /// Set when this chain was created with a bound codec.
    stream_bound: bool,
    calls: usize,
}

impl<'a> Chain<'a> {
    /// Creates the head of a pipeline.
    pub(crate) fn new(
        interceptors: &'a [Arc<dyn Interceptor>],
        request: Request,
        client: &'a ClientShared,
        call_id: CallId,
    ) -> Self {
        Self {
            interceptors,
            index: 0,
            request,
            client,
            call_id,
            allocation: None,
            stream: None,
            connection: None,
            stream_bound: false,
            calls: 0,
        }
    }

    /// Returns the request this stage received.
    #[inline]
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Returns the connection the request will be sent on.
    ///
    /// `None` for application interceptors.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    /// Returns the ID of the call this chain belongs to.
    #[inline]
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Passes `request` to the next stage and returns its response.
    ///
    /// # Errors
    ///
    /// - [`Error::IllegalState`] if a network interceptor changed the host
    ///   or port, or proceeded more than once
    /// - Any error from later stages
    pub async fn proceed(&mut self, request: Request) -> Result<Response> {
        let allocation = self.allocation.clone();
        let stream = self.stream.take();
        let connection = self.connection.clone();
        self.proceed_with(request, allocation, stream, connection)
            .await
    }

    pub(crate) fn client(&self) -> &'a ClientShared {
        self.client
    }

    pub(crate) fn allocation(&self) -> Option<&Arc<StreamAllocation>> {
        self.allocation.as_ref()
    }

    pub(crate) fn take_stream(&mut self) -> Option<BoundStream> {
        self.stream.take()
    }

    /// Runs the next stage with explicit allocation, stream and connection.
    pub(crate) async fn proceed_with(
        &mut self,
        request: Request,
        allocation: Option<Arc<StreamAllocation>>,
        stream: Option<BoundStream>,
        connection: Option<Arc<Connection>>,
    ) -> Result<Response> {
        let interceptors = self.interceptors;
        let Some(interceptor) = interceptors.get(self.index) else {
            return Err(Error::illegal_state("chain has no stage left to proceed to"));
        };

        self.calls += 1;

        if self.stream_bound {
            let previous = self.previous_name();
            if self
                .connection
                .as_ref()
                .is_some_and(|connection| !connection.supports_url(request.url()))
            {
                return Err(Error::illegal_state(format!(
                    "network interceptor {previous} must retain the same host and port"
                )));
            }
            if self.calls > 1 {
                return Err(Error::illegal_state(format!(
                    "network interceptor {previous} must call proceed() exactly once"
                )));
            }
        }

        let mut next = Chain {
            interceptors,
            index: self.index + 1,
            request,
            client: self.client,
            call_id: self.call_id,
            stream_bound: stream.is_some(),
            allocation,
            stream,
            connection,
            calls: 0,
        };

        let response = interceptor.intercept(&mut next).await?;

        if next.stream_bound && next.index < interceptors.len() && next.calls != 1 {
            return Err(Error::illegal_state(format!(
                "network interceptor {} must call proceed() exactly once",
                interceptor.name()
            )));
        }

        Ok(response)
    }

    fn previous_name(&self) -> &str {
        self.index
            .checked_sub(1)
            .and_then(|i| self.interceptors.get(i))
            .map_or("<head>", |interceptor| interceptor.name())
    }
}

impl fmt::Debug for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("index", &self.index)
            .field("call", &self.call_id)
            .field("url", &self.request.url().as_str())
            .field("stream_bound", &self.stream_bound)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Pipeline Assembly
// ============================================================================

/// Builds the stage list for one call.
pub(crate) fn stages(
    client: &Arc<ClientShared>,
    retry: Arc<RetryAndFollowUp>,
) -> Vec<Arc<dyn Interceptor>> {
    let mut stages: Vec<Arc<dyn Interceptor>> = Vec::with_capacity(
        client.interceptors.len() + client.network_interceptors.len() + 4,
    );
    stages.extend(client.interceptors.iter().cloned());
    stages.push(retry);
    stages.push(Arc::new(Bridge));
    stages.push(Arc::new(Connect));
    stages.extend(client.network_interceptors.iter().cloned());
    stages.push(Arc::new(CallServer));
    stages
}
