//! Wire codecs.
//!
//! A [`Codec`] carries one request/response exchange over one stream. The
//! engine is agnostic to which variant it drives:
//!
//! | Variant | Streams per connection | Provided by |
//! |---------|------------------------|-------------|
//! | HTTP/1.1 | one at a time | this crate (`http1`) |
//! | multiplexed | many, up to the peer's limit | a [`Multiplexer`] |
//!
//! # Call order
//!
//! ```text
//! write_request_headers
//!   [flush_request → read_response_headers]     (Expect: 100-continue;
//!                                                a final head ends the request)
//!   [begin_body → write_body* → end_body]
//! finish_request
//! read_response_headers                         (repeated while 1xx)
//! open_response_body
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::http::{Request, ResponseBody, ResponseHead};

// ============================================================================
// Submodules
// ============================================================================

/// HTTP/1.1 codec.
pub mod http1;

/// Multiplexed-session collaborator traits.
pub mod multiplexed;

// ============================================================================
// Re-exports
// ============================================================================

pub use multiplexed::{MultiplexedSession, Multiplexer};

// ============================================================================
// IoTimeouts
// ============================================================================

/// Per-attempt read and write timeouts. `None` waits forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoTimeouts {
    /// Limit for each read.
    pub read: Option<Duration>,
    /// Limit for each write.
    pub write: Option<Duration>,
}

// ============================================================================
// Codec
// ============================================================================

/// Aborts the stream a codec is bound to.
pub trait StreamCancel: Send + Sync {
    /// Cancels in-flight and future I/O on the stream.
    fn cancel(&self);
}

/// Encodes one request and decodes its response.
#[async_trait]
pub trait Codec: Send {
    /// Writes the request line (or pseudo-headers) and headers.
    async fn write_request_headers(&mut self, request: &Request) -> Result<()>;

    /// Opens the request body sink. `None` means unknown length.
    async fn begin_body(&mut self, content_length: Option<u64>) -> Result<()>;

    /// Writes one chunk of request body.
    async fn write_body(&mut self, chunk: &[u8]) -> Result<()>;

    /// Closes the request body sink.
    async fn end_body(&mut self) -> Result<()>;

    /// Flushes everything written so far without ending the request.
    async fn flush_request(&mut self) -> Result<()>;

    /// Ends the request and flushes it.
    async fn finish_request(&mut self) -> Result<()>;

    /// Reads the next response head, including interim `1xx` heads.
    async fn read_response_headers(&mut self) -> Result<ResponseHead>;

    /// Opens the response body for `head`.
    ///
    /// Reaching the end of the returned body leaves the stream reusable.
    fn open_response_body(self: Box<Self>, head: &ResponseHead, request: &Request)
    -> Result<ResponseBody>;

    /// Returns a handle that cancels this stream from another task.
    fn canceler(&self) -> Arc<dyn StreamCancel>;
}
