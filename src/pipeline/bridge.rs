//! Fills in the headers every request needs but callers rarely set.

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING, USER_AGENT};

use crate::error::Result;
use crate::http::{Request, Response};

use super::{Chain, Interceptor};

// ============================================================================
// Bridge
// ============================================================================

/// Adds `Host`, `Connection`, `User-Agent` and body framing headers.
///
/// Headers the caller set are left alone, except the body framing pair:
/// a known length always wins over `Transfer-Encoding`.
pub(crate) struct Bridge;

#[async_trait]
impl Interceptor for Bridge {
    async fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let user_agent = &chain.client().config.user_agent;
        let request = bridged(chain.request(), user_agent)?;
        chain.proceed(request).await
    }

    fn name(&self) -> &str {
        "Bridge"
    }
}

fn bridged(request: &Request, user_agent: &str) -> Result<Request> {
    let mut builder = request.to_builder();

    if let Some(body) = request.body() {
        if let Some(content_type) = body.content_type() {
            builder = builder.header(CONTENT_TYPE.as_str(), content_type);
        }
        builder = match body.content_length() {
            Some(length) => builder
                .header(CONTENT_LENGTH.as_str(), &length.to_string())
                .remove_header(TRANSFER_ENCODING.as_str()),
            None => builder
                .header(TRANSFER_ENCODING.as_str(), "chunked")
                .remove_header(CONTENT_LENGTH.as_str()),
        };
    }

    if request.header(HOST.as_str()).is_none() {
        builder = builder.header(HOST.as_str(), &host_header(request));
    }

    if request.header(CONNECTION.as_str()).is_none() {
        builder = builder.header(CONNECTION.as_str(), "Keep-Alive");
    }

    if request.header(USER_AGENT.as_str()).is_none() && !user_agent.is_empty() {
        builder = builder.header(USER_AGENT.as_str(), user_agent);
    }

    builder.build()
}

/// `host[:port]`, with the port only when it is not the scheme default.
fn host_header(request: &Request) -> String {
    let url = request.url();
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================
