//! Immutable request/response value types.
//!
//! Header and method types come from the [`http`] crate and URLs from [`url`];
//! this module only adds the pieces the engine needs on top: replayable vs
//! single-use request bodies, streamed response bodies and response metadata.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `request` | [`Request`], [`RequestBuilder`], [`RequestBody`] |
//! | `response` | [`Response`], [`ResponseHead`] |
//! | `body` | [`ResponseBody`] and the [`BodySource`] trait |

// ============================================================================
// Submodules
// ============================================================================

/// Response body stream.
pub mod body;

/// Request type, builder and body.
pub mod request;

/// Response type and head.
pub mod response;

// ============================================================================
// Re-exports
// ============================================================================

pub use body::{BodySource, ResponseBody};
pub use request::{BodyStream, Request, RequestBody, RequestBuilder};
pub use response::{Response, ResponseHead};

// ============================================================================
// Header Helpers
// ============================================================================

use http::HeaderMap;

/// Returns a header value as `&str`, ignoring non-UTF-8 values.
pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Returns the parsed `Content-Length` header, if present and valid.
pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, "content-length").and_then(|value| value.trim().parse().ok())
}

/// Returns `true` if a `Connection` header asks to close the connection.
pub(crate) fn wants_close(headers: &HeaderMap) -> bool {
    headers
        .get_all("connection")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}
