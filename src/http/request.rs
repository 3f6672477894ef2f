//! Request type and builder.
//!
//! A [`Request`] is immutable and cheap to clone: follow-ups and retries clone
//! it freely. Only the body can make a request single-use, see
//! [`RequestBody::streamed`].

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use parking_lot::Mutex;
use url::Url;

use crate::codec::Codec;
use crate::error::{Error, Result};

use super::header_str;

// ============================================================================
// Types
// ============================================================================

/// Single-use stream of request body chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

// ============================================================================
// Request
// ============================================================================

/// An HTTP request.
///
/// # Example
///
/// ```
/// use callwire::{Request, RequestBody};
///
/// let request = Request::builder()
///     .url("https://example.com/upload")
///     .header("X-Trace", "1")
///     .post(RequestBody::text("hello"))
///     .build()
///     .expect("valid request");
///
/// assert_eq!(request.method(), "POST");
/// assert_eq!(request.url().host_str(), Some("example.com"));
/// ```
#[derive(Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<RequestBody>,
}

impl Request {
    /// Creates an empty builder.
    #[inline]
    #[must_use]
    pub fn builder() -> RequestBuilder {
        RequestBuilder::new()
    }

    /// Creates a GET request for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Url`] or [`Error::InvalidRequest`] if `url` is not a
    /// usable `http`/`https` URL.
    pub fn get(url: impl AsRef<str>) -> Result<Self> {
        Self::builder().url(url).build()
    }

    /// Returns a builder initialized from this request.
    #[must_use]
    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder {
            method: self.method.clone(),
            url: Some(self.url.clone()),
            headers: self.headers.clone(),
            body: self.body.clone(),
            error: None,
        }
    }

    /// Returns the method.
    #[inline]
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the target URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Returns all headers.
    #[inline]
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns the first value of header `name`.
    #[inline]
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_str(&self.headers, name)
    }

    /// Returns the body, if any.
    #[inline]
    #[must_use]
    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref()
    }

    /// Returns `true` if this request can be transmitted more than once.
    #[inline]
    #[must_use]
    pub fn is_replayable(&self) -> bool {
        self.body.as_ref().is_none_or(RequestBody::is_replayable)
    }

    /// Returns `true` if the target uses TLS.
    #[inline]
    #[must_use]
    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Returns the target host.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Returns the target port, falling back to the scheme default.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers.len())
            .field("body", &self.body)
            .finish()
    }
}

// ============================================================================
// RequestBuilder
// ============================================================================

/// Builder for [`Request`].
///
/// Errors (bad URL, bad header) are recorded and reported by [`build`](Self::build).
#[derive(Default)]
pub struct RequestBuilder {
    method: Method,
    url: Option<Url>,
    headers: HeaderMap,
    body: Option<RequestBody>,
    error: Option<Error>,
}

impl RequestBuilder {
    /// Creates a GET builder with no URL.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the target URL from a string.
    #[must_use]
    pub fn url(mut self, url: impl AsRef<str>) -> Self {
        match Url::parse(url.as_ref()) {
            Ok(url) => self.url = Some(url),
            Err(e) => self.record(e.into()),
        }
        self
    }

    /// Sets the target URL.
    #[inline]
    #[must_use]
    pub fn parsed_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Sets method and body together.
    #[inline]
    #[must_use]
    pub fn method(mut self, method: Method, body: Option<RequestBody>) -> Self {
        self.method = method;
        self.body = body;
        self
    }

    /// Shorthand for `method(GET, None)`.
    #[inline]
    #[must_use]
    pub fn get(self) -> Self {
        self.method(Method::GET, None)
    }

    /// Shorthand for `method(HEAD, None)`.
    #[inline]
    #[must_use]
    pub fn head(self) -> Self {
        self.method(Method::HEAD, None)
    }

    /// Shorthand for `method(POST, Some(body))`.
    #[inline]
    #[must_use]
    pub fn post(self, body: RequestBody) -> Self {
        self.method(Method::POST, Some(body))
    }

    /// Shorthand for `method(PUT, Some(body))`.
    #[inline]
    #[must_use]
    pub fn put(self, body: RequestBody) -> Self {
        self.method(Method::PUT, Some(body))
    }

    /// Sets header `name`, replacing existing values.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match parse_header(name, value) {
            Ok((name, value)) => {
                self.headers.insert(name, value);
            }
            Err(e) => self.record(e),
        }
        self
    }

    /// Appends a value to header `name`.
    #[must_use]
    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        match parse_header(name, value) {
            Ok((name, value)) => {
                self.headers.append(name, value);
            }
            Err(e) => self.record(e),
        }
        self
    }

    /// Removes every value of header `name`.
    #[must_use]
    pub fn remove_header(mut self, name: &str) -> Self {
        self.headers.remove(name);
        self
    }

    /// Builds the request.
    ///
    /// # Errors
    ///
    /// - [`Error::Url`] if the URL failed to parse
    /// - [`Error::InvalidRequest`] if the URL is missing, not `http`/`https`,
    ///   has no host, a header is malformed, or the body does not fit the method
    pub fn build(self) -> Result<Request> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let url = self
            .url
            .ok_or_else(|| Error::invalid_request("URL is required. Use .url() to set it."))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::invalid_request(format!(
                "unsupported scheme: {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(Error::invalid_request(format!("URL has no host: {url}")));
        }

        if self.body.is_some() && !permits_request_body(&self.method) {
            return Err(Error::invalid_request(format!(
                "method {} must not have a request body",
                self.method
            )));
        }
        if self.body.is_none() && requires_request_body(&self.method) {
            return Err(Error::invalid_request(format!(
                "method {} must have a request body",
                self.method
            )));
        }

        Ok(Request {
            method: self.method,
            url,
            headers: self.headers,
            body: self.body,
        })
    }

    fn record(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| Error::invalid_request(format!("invalid header name: {name:?}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| Error::invalid_request(format!("invalid value for header {name}")))?;
    Ok((name, value))
}

// ============================================================================
// RequestBody
// ============================================================================

/// Request body.
///
/// Byte bodies are replayable and have a known length. Streamed bodies can be
/// written once; a retry or follow-up that would resend one fails instead.
#[derive(Clone)]
pub struct RequestBody {
    content_type: Option<String>,
    kind: BodyKind,
}

#[derive(Clone)]
enum BodyKind {
    Bytes(Bytes),
    Stream(Arc<StreamedBody>),
}

struct StreamedBody {
    content_length: Option<u64>,
    source: Mutex<Option<BodyStream>>,
}

impl RequestBody {
    /// Creates a replayable body from bytes.
    #[inline]
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            content_type: None,
            kind: BodyKind::Bytes(bytes.into()),
        }
    }

    /// Creates a UTF-8 text body.
    #[inline]
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::from_bytes(text.into()).with_content_type("text/plain; charset=utf-8")
    }

    /// Creates a single-use streamed body.
    ///
    /// `content_length` of `None` is sent with chunked transfer encoding.
    #[must_use]
    pub fn streamed<S>(stream: S, content_length: Option<u64>) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            content_type: None,
            kind: BodyKind::Stream(Arc::new(StreamedBody {
                content_length,
                source: Mutex::new(Some(Box::pin(stream))),
            })),
        }
    }

    /// Sets the media type sent as `Content-Type`.
    #[inline]
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Returns the media type.
    #[inline]
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Returns the length in bytes, or `None` if unknown.
    #[inline]
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        match &self.kind {
            BodyKind::Bytes(bytes) => Some(bytes.len() as u64),
            BodyKind::Stream(streamed) => streamed.content_length,
        }
    }

    /// Returns `true` if the body can be written more than once.
    #[inline]
    #[must_use]
    pub fn is_replayable(&self) -> bool {
        matches!(self.kind, BodyKind::Bytes(_))
    }

    /// Writes the body through an open codec body sink.
    pub(crate) async fn write_to(&self, codec: &mut dyn Codec) -> Result<()> {
        match &self.kind {
            BodyKind::Bytes(bytes) => {
                if !bytes.is_empty() {
                    codec.write_body(bytes).await?;
                }
                Ok(())
            }
            BodyKind::Stream(streamed) => {
                let mut source = streamed.source.lock().take().ok_or_else(|| {
                    Error::illegal_state("streamed request body was already consumed")
                })?;
                while let Some(chunk) = source.next().await {
                    let chunk = chunk?;
                    if !chunk.is_empty() {
                        codec.write_body(&chunk).await?;
                    }
                }
                Ok(())
            }
        }
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length())
            .field("replayable", &self.is_replayable())
            .finish()
    }
}

// ============================================================================
// Method Rules
// ============================================================================

/// Returns `true` if `method` may carry a request body.
pub(crate) fn permits_request_body(method: &Method) -> bool {
    !(method == Method::GET || method == Method::HEAD)
}

/// Returns `true` if `method` must carry a request body.
pub(crate) fn requires_request_body(method: &Method) -> bool {
    method == Method::POST
        || method == Method::PUT
        || method == Method::PATCH
        || method.as_str() == "PROPPATCH"
        || method.as_str() == "REPORT"
}

/// Returns `true` if a redirect keeps the body of `method`.
pub(crate) fn redirects_with_body(method: &Method) -> bool {
    method.as_str() == "PROPFIND"
}

/// Returns `true` if a redirect turns `method` into GET.
pub(crate) fn redirects_to_get(method: &Method) -> bool {
    method.as_str() != "PROPFIND"
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_builds_request() {
        let request = Request::get("http://example.com:8080/a?b=c").expect("request");
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.host(), "example.com");
        assert_eq!(request.port(), 8080);
        assert!(!request.is_https());
        assert!(request.is_replayable());
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(Request::get("https://example.com/").expect("request").port(), 443);
        assert_eq!(Request::get("http://example.com/").expect("request").port(), 80);
    }

    #[test]
    fn test_build_fails_without_url() {
        let err = Request::builder().build().unwrap_err();
        assert!(err.to_string().contains("URL is required"));
    }

    #[test]
    fn test_build_rejects_unknown_scheme() {
        let err = Request::get("ftp://example.com/").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
    }

    #[test]
    fn test_build_rejects_body_on_get() {
        let err = Request::builder()
            .url("http://example.com/")
            .method(Method::GET, Some(RequestBody::text("x")))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("must not have a request body"));
    }

    #[test]
    fn test_build_requires_body_on_post() {
        let err = Request::builder()
            .url("http://example.com/")
            .method(Method::POST, None)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("must have a request body"));
    }

    #[test]
    fn test_invalid_header_is_reported() {
        let err = Request::builder()
            .url("http://example.com/")
            .header("bad header", "x")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest { .. }));
    }

    #[test]
    fn test_header_replace_and_append() {
        let request = Request::builder()
            .url("http://example.com/")
            .header("Accept", "a")
            .header("Accept", "b")
            .add_header("X-Multi", "1")
            .add_header("X-Multi", "2")
            .build()
            .expect("request");

        assert_eq!(request.header("accept"), Some("b"));
        assert_eq!(request.headers().get_all("x-multi").iter().count(), 2);
    }

    #[test]
    fn test_to_builder_round_trips_fields() {
        let original = Request::builder()
            .url("http://example.com/x")
            .header("Authorization", "Basic abc")
            .build()
            .expect("request");

        let copy = original
            .to_builder()
            .remove_header("Authorization")
            .build()
            .expect("request");

        assert_eq!(copy.url(), original.url());
        assert!(copy.header("authorization").is_none());
    }

    #[test]
    fn test_streamed_body_is_not_replayable() {
        let stream = futures_util::stream::iter(vec![Ok(Bytes::from_static(b"abc"))]);
        let body = RequestBody::streamed(stream, None);
        assert!(!body.is_replayable());
        assert_eq!(body.content_length(), None);

        let request = Request::builder()
            .url("http://example.com/")
            .post(body)
            .build()
            .expect("request");
        assert!(!request.is_replayable());
    }

    #[test]
    fn test_text_body_metadata() {
        let body = RequestBody::text("hello");
        assert_eq!(body.content_length(), Some(5));
        assert_eq!(body.content_type(), Some("text/plain; charset=utf-8"));
        assert!(body.is_replayable());
    }

    #[test]
    fn test_method_rules() {
        assert!(!permits_request_body(&Method::GET));
        assert!(!permits_request_body(&Method::HEAD));
        assert!(permits_request_body(&Method::DELETE));
        assert!(requires_request_body(&Method::PUT));
        assert!(!requires_request_body(&Method::DELETE));

        let propfind = Method::from_bytes(b"PROPFIND").expect("method");
        assert!(redirects_with_body(&propfind));
        assert!(!redirects_to_get(&propfind));
        assert!(redirects_to_get(&Method::POST));
    }
}
