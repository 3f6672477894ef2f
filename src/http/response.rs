//! Response type.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::SystemTime;

use bytes::Bytes;
use http::{HeaderMap, StatusCode, Version};

use crate::error::Result;
use crate::tls::Handshake;

use super::body::ResponseBody;
use super::header_str;
use super::request::Request;

// ============================================================================
// ResponseHead
// ============================================================================

/// Status line and headers of a response, as read by a codec.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Protocol version.
    pub version: Version,
    /// Status code.
    pub status: StatusCode,
    /// Reason phrase, empty when the protocol has none.
    pub reason: String,
    /// Headers.
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Creates an HTTP/1.1 head with no headers.
    #[must_use]
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers: HeaderMap::new(),
        }
    }
}

// ============================================================================
// Response
// ============================================================================

/// An HTTP response.
///
/// The body is a live stream over the connection. Reading it to the end
/// releases the connection for reuse; dropping it early closes the stream.
pub struct Response {
    request: Request,
    head: ResponseHead,
    body: ResponseBody,
    handshake: Option<Handshake>,
    sent_request_at: SystemTime,
    received_response_at: SystemTime,
    prior_response: Option<Box<Response>>,
}

impl Response {
    /// Creates a response for `request`.
    #[must_use]
    pub fn new(request: Request, head: ResponseHead, body: ResponseBody) -> Self {
        let now = SystemTime::now();
        Self {
            request,
            head,
            body,
            handshake: None,
            sent_request_at: now,
            received_response_at: now,
            prior_response: None,
        }
    }

    /// Sets the TLS handshake the response arrived over.
    #[inline]
    #[must_use]
    pub fn with_handshake(mut self, handshake: Option<Handshake>) -> Self {
        self.handshake = handshake;
        self
    }

    /// Sets send and receive timestamps.
    #[inline]
    #[must_use]
    pub fn with_timing(mut self, sent: SystemTime, received: SystemTime) -> Self {
        self.sent_request_at = sent;
        self.received_response_at = received;
        self
    }

    /// Attaches the response that led to this one. The prior body is dropped.
    #[must_use]
    pub(crate) fn with_prior(mut self, prior: Response) -> Self {
        self.prior_response = Some(Box::new(prior.without_body()));
        self
    }

    /// Returns a copy of the metadata with an empty body.
    #[must_use]
    pub(crate) fn without_body(self) -> Self {
        Self {
            body: ResponseBody::empty(),
            ..self
        }
    }

    /// Returns the request that produced this response.
    ///
    /// For follow-ups this is the final request, not the one the caller sent.
    #[inline]
    #[must_use]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Returns the status code.
    #[inline]
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.head.status
    }

    /// Returns the status code as a number.
    #[inline]
    #[must_use]
    pub fn code(&self) -> u16 {
        self.head.status.as_u16()
    }

    /// Returns the reason phrase.
    #[inline]
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.head.reason
    }

    /// Returns the protocol version.
    #[inline]
    #[must_use]
    pub fn version(&self) -> Version {
        self.head.version
    }

    /// Returns all headers.
    #[inline]
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    /// Returns the first value of header `name`.
    #[inline]
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.head.headers, name)
    }

    /// Returns the TLS handshake, `None` for plaintext.
    #[inline]
    #[must_use]
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// Returns when the request headers were sent.
    #[inline]
    #[must_use]
    pub fn sent_request_at(&self) -> SystemTime {
        self.sent_request_at
    }

    /// Returns when the response headers were received.
    #[inline]
    #[must_use]
    pub fn received_response_at(&self) -> SystemTime {
        self.received_response_at
    }

    /// Returns the response that triggered this follow-up, without body.
    #[inline]
    #[must_use]
    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    /// Returns `true` for 2xx responses.
    #[inline]
    #[must_use]
    pub fn is_successful(&self) -> bool {
        self.head.status.is_success()
    }

    /// Returns `true` for 300, 301, 302, 303, 307 and 308.
    #[inline]
    #[must_use]
    pub fn is_redirect(&self) -> bool {
        matches!(self.code(), 300 | 301 | 302 | 303 | 307 | 308)
    }

    /// Returns the body.
    #[inline]
    #[must_use]
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// Returns the body mutably.
    #[inline]
    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Consumes the response and returns its body.
    #[inline]
    #[must_use]
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Reads the whole body.
    ///
    /// # Errors
    ///
    /// Returns the transport or framing error from the underlying stream.
    pub async fn bytes(&mut self) -> Result<Bytes> {
        self.body.bytes().await
    }

    /// Reads the whole body as UTF-8 text.
    ///
    /// # Errors
    ///
    /// See [`ResponseBody::text`].
    pub async fn text(&mut self) -> Result<String> {
        self.body.text().await
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.head.status)
            .field("version", &self.head.version)
            .field("url", &self.request.url().as_str())
            .field("body", &self.body)
            .field("has_prior", &self.prior_response.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request::get("http://example.com/").expect("request")
    }

    #[test]
    fn test_head_defaults() {
        let head = ResponseHead::new(StatusCode::NOT_FOUND);
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.reason, "Not Found");
        assert!(head.headers.is_empty());
    }

    #[test]
    fn test_redirect_codes() {
        for code in [300u16, 301, 302, 303, 307, 308] {
            let status = StatusCode::from_u16(code).expect("status");
            let response = Response::new(request(), ResponseHead::new(status), ResponseBody::empty());
            assert!(response.is_redirect(), "{code} should redirect");
        }

        let ok = Response::new(request(), ResponseHead::new(StatusCode::OK), ResponseBody::empty());
        assert!(!ok.is_redirect());
        assert!(ok.is_successful());
    }

    #[tokio::test]
    async fn test_prior_response_has_no_body() {
        let prior = Response::new(
            request(),
            ResponseHead::new(StatusCode::FOUND),
            ResponseBody::from_bytes("moved"),
        );
        let mut response = Response::new(
            request(),
            ResponseHead::new(StatusCode::OK),
            ResponseBody::from_bytes("done"),
        )
        .with_prior(prior);

        let prior = response.prior_response().expect("prior");
        assert_eq!(prior.code(), 302);
        assert!(prior.body().is_closed());
        assert_eq!(response.text().await.expect("text"), "done");
    }

    #[test]
    fn test_header_lookup() {
        let mut head = ResponseHead::new(StatusCode::OK);
        head.headers
            .insert("content-type", http::HeaderValue::from_static("text/plain"));
        let response = Response::new(request(), head, ResponseBody::empty());
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
        assert!(response.handshake().is_none());
    }
}
