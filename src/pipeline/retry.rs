//! Retry and follow-up stage.
//!
//! Owns the call's [`StreamAllocation`]. Each loop iteration sends one
//! attempt down the rest of the pipeline, then either retries a recoverable
//! failure, follows the response up, or hands it to the caller.
//!
//! | Status | Follow-up |
//! |--------|-----------|
//! | 407 | proxy authenticator (HTTP proxies only) |
//! | 401 | origin authenticator |
//! | 300–303 | redirect, switching to GET unless `PROPFIND` |
//! | 307, 308 | redirect for GET and HEAD only |
//! | 408 | replay once, if the body is replayable |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, TRANSFER_ENCODING};
use parking_lot::Mutex;
use tracing::debug;

use crate::client::ClientShared;
use crate::error::{Error, Result};
use crate::http::request::{permits_request_body, redirects_to_get, redirects_with_body};
use crate::http::{Request, Response};
use crate::route::Route;
use crate::transport::StreamAllocation;

use super::{Chain, Interceptor};

// ============================================================================
// Constants
// ============================================================================

/// Redirects and auth challenges followed before giving up.
pub(crate) const MAX_FOLLOW_UPS: usize = 20;

/// Time allowed to drain a followed-up response body.
const DRAIN_LIMIT: Duration = Duration::from_millis(100);

// ============================================================================
// RetryAndFollowUp
// ============================================================================

/// Head stage of every call.
pub(crate) struct RetryAndFollowUp {
    client: Arc<ClientShared>,
    canceled: AtomicBool,
    allocation: Mutex<Option<Arc<StreamAllocation>>>,
}

impl RetryAndFollowUp {
    pub(crate) fn new(client: Arc<ClientShared>) -> Self {
        Self {
            client,
            canceled: AtomicBool::new(false),
            allocation: Mutex::new(None),
        }
    }

    /// Cancels the call's current and future attempts.
    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        let current = self.allocation.lock().clone();
        if let Some(allocation) = current {
            allocation.cancel();
        }
    }

    #[inline]
    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Creates the allocation for `request`'s target and publishes it to
    /// [`cancel`](Self::cancel).
    fn allocate(&self, request: &Request) -> Result<Arc<StreamAllocation>> {
        let address = self.client.address_for(request.url())?;
        let allocation = StreamAllocation::new(self.client.pool.clone(), address);
        *self.allocation.lock() = Some(Arc::clone(&allocation));
        Ok(allocation)
    }
}

// ============================================================================
// RetryAndFollowUp - Stage
// ============================================================================

#[async_trait]
impl Interceptor for RetryAndFollowUp {
    async fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let call = chain.call_id();
        let mut request = chain.request().clone();
        let mut allocation = self.allocate(&request)?;
        let mut follow_ups = 0usize;
        let mut prior: Option<Response> = None;

        loop {
            if self.is_canceled() {
                allocation.release();
                return Err(Error::Canceled);
            }

            let attempt = chain
                .proceed_with(request.clone(), Some(Arc::clone(&allocation)), None, None)
                .await;

            let mut response = match attempt {
                Ok(response) => response,
                Err(error) => {
                    let send_started =
                        !error.is_route_failure() && !matches!(error, Error::ConnectionShutdown);
                    if self.recover(&allocation, &error, send_started, &request).await {
                        debug!(%call, %error, send_started, "Retrying after failure");
                        continue;
                    }
                    allocation.stream_failed(None);
                    allocation.release();
                    return Err(error);
                }
            };

            if let Some(prior) = prior.take() {
                response = response.with_prior(prior);
            }

            let route = allocation
                .route()
                .or_else(|| allocation.connection().map(|c| c.route().clone()));
            let follow_up = match self.follow_up_request(&response, route.as_ref()).await {
                Ok(follow_up) => follow_up,
                Err(e) => {
                    allocation.release();
                    return Err(e);
                }
            };

            let Some(follow_up) = follow_up else {
                allocation.release();
                return Ok(response);
            };

            response.body_mut().discard(DRAIN_LIMIT).await;

            follow_ups += 1;
            if follow_ups > MAX_FOLLOW_UPS {
                allocation.release();
                return Err(Error::TooManyFollowUps { count: follow_ups });
            }

            if follow_up.body().is_some_and(|body| !body.is_replayable()) {
                allocation.release();
                return Err(Error::UnreplayableBody {
                    status: response.code(),
                });
            }

            if !allocation.address().matches_url(follow_up.url()) {
                allocation.release();
                allocation = self.allocate(&follow_up)?;
            } else if allocation.has_codec() {
                allocation.release();
                return Err(Error::illegal_state(format!(
                    "Closing the body of {} {} didn't close its backing stream. Bad interceptor?",
                    response.code(),
                    response.request().url()
                )));
            }

            debug!(
                %call,
                status = response.code(),
                follow_ups,
                method = %follow_up.method(),
                url = %follow_up.url(),
                "Following up"
            );

            request = follow_up;
            prior = Some(response);
        }
    }
}

// ============================================================================
// RetryAndFollowUp - Recovery
// ============================================================================

impl RetryAndFollowUp {
    /// Reports the failure and decides whether another attempt may succeed.
    async fn recover(
        &self,
        allocation: &StreamAllocation,
        error: &Error,
        send_started: bool,
        request: &Request,
    ) -> bool {
        allocation.stream_failed(Some(error));

        if !self.client.config.retry_on_connection_failure {
            return false;
        }

        if send_started && request.body().is_some_and(|body| !body.is_replayable()) {
            return false;
        }

        if !error.is_recoverable(send_started) {
            return false;
        }

        allocation.has_more_routes().await
    }
}

// ============================================================================
// RetryAndFollowUp - Follow-ups
// ============================================================================

impl RetryAndFollowUp {
    /// Returns the request that answers `response`, or `None` to hand
    /// `response` to the caller.
    pub(crate) async fn follow_up_request(
        &self,
        response: &Response,
        route: Option<&Route>,
    ) -> Result<Option<Request>> {
        let method = response.request().method();

        match response.code() {
            407 => {
                let proxy = route.map_or(&self.client.config.proxy, Route::proxy);
                if !proxy.is_http() {
                    return Err(Error::protocol(
                        "Received HTTP_PROXY_AUTH (407) code while not using proxy",
                    ));
                }
                self.client
                    .proxy_authenticator
                    .authenticate(route, response)
                    .await
            }

            401 => self.client.authenticator.authenticate(route, response).await,

            307 | 308 if method != Method::GET && method != Method::HEAD => Ok(None),

            300..=303 | 307 | 308 => self.redirect(response),

            408 => {
                if !self.client.config.retry_on_connection_failure {
                    return Ok(None);
                }
                if !response.request().is_replayable() {
                    return Ok(None);
                }
                if response.prior_response().is_some_and(|prior| prior.code() == 408) {
                    return Ok(None);
                }
                Ok(Some(response.request().clone()))
            }

            _ => Ok(None),
        }
    }

    fn redirect(&self, response: &Response) -> Result<Option<Request>> {
        let config = &self.client.config;
        if !config.follow_redirects {
            return Ok(None);
        }

        let Some(location) = response.header(LOCATION.as_str()) else {
            return Ok(None);
        };

        let request = response.request();
        let Ok(url) = request.url().join(location) else {
            return Ok(None);
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            return Ok(None);
        }

        if url.scheme() != request.url().scheme() && !config.follow_ssl_redirects {
            return Ok(None);
        }

        let mut builder = request.to_builder();
        let method = request.method();
        if permits_request_body(method) {
            let keep_body = redirects_with_body(method);
            builder = if redirects_to_get(method) {
                builder.method(Method::GET, None)
            } else {
                let body = if keep_body { request.body().cloned() } else { None };
                builder.method(method.clone(), body)
            };
            if !keep_body {
                builder = builder
                    .remove_header(TRANSFER_ENCODING.as_str())
                    .remove_header(CONTENT_LENGTH.as_str())
                    .remove_header(CONTENT_TYPE.as_str());
            }
        }

        let same_target = request.url().host_str() == url.host_str()
            && request.url().port_or_known_default() == url.port_or_known_default()
            && request.url().scheme() == url.scheme();
        if !same_target {
            builder = builder.remove_header(AUTHORIZATION.as_str());
        }

        builder.parsed_url(url).build().map(Some)
    }
}

// ============================================================================
// Tests
// ============================================================================
