//! Streamed response body.
//!
//! A [`ResponseBody`] pulls chunks from a [`BodySource`]. Codecs provide
//! sources bound to the live stream; when the source reports end of body it
//! hands the connection back for reuse. Dropping an unfinished body drops the
//! source, which releases the stream without reuse.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// BodySource
// ============================================================================

/// Producer of response body chunks.
#[async_trait]
pub trait BodySource: Send {
    /// Reads the next chunk. `Ok(None)` marks the end of the body.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>>;

    /// Returns `true` if the body is delimited by the peer closing the
    /// connection, so the stream cannot be reused after it.
    fn ends_connection(&self) -> bool {
        false
    }
}

/// Source that yields one in-memory buffer.
struct FullSource(Option<Bytes>);

#[async_trait]
impl BodySource for FullSource {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.0.take().filter(|bytes| !bytes.is_empty()))
    }
}

// ============================================================================
// ResponseBody
// ============================================================================

/// Response body.
pub struct ResponseBody {
    /// Only ever accessed through `&mut self`; the mutex makes the body
    /// `Sync` without requiring it of sources.
    source: Option<Mutex<Box<dyn BodySource>>>,
    content_length: Option<u64>,
}

impl ResponseBody {
    /// Creates an empty body.
    #[inline]
    #[must_use]
    pub fn empty() -> Self {
        Self {
            source: None,
            content_length: Some(0),
        }
    }

    /// Creates a body from an in-memory buffer.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        Self {
            content_length: Some(bytes.len() as u64),
            source: Some(Mutex::new(Box::new(FullSource(Some(bytes))))),
        }
    }

    /// Creates a body backed by `source`.
    #[inline]
    #[must_use]
    pub fn from_source(source: Box<dyn BodySource>, content_length: Option<u64>) -> Self {
        Self {
            source: Some(Mutex::new(source)),
            content_length,
        }
    }

    /// Returns the declared length, or `None` if unknown.
    #[inline]
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Returns `true` once the body was fully read or closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.source.is_none()
    }

    /// Reads the next chunk, `None` at end of body.
    ///
    /// # Errors
    ///
    /// Returns the transport or framing error from the underlying stream.
    /// The body is closed after an error.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        let Some(source) = self.source.as_mut().map(Mutex::get_mut) else {
            return Ok(None);
        };

        match source.read_chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.source = None;
                Ok(None)
            }
            Err(e) => {
                self.source = None;
                Err(e)
            }
        }
    }

    /// Reads the remaining body into one buffer.
    ///
    /// # Errors
    ///
    /// See [`chunk`](Self::chunk).
    pub async fn bytes(&mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Reads the remaining body as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the body is not valid UTF-8.
    pub async fn text(&mut self) -> Result<String> {
        let bytes = self.bytes().await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| Error::protocol(format!("response body is not UTF-8: {e}")))
    }

    /// Reads and discards the rest of the body within `limit`.
    ///
    /// Returns `true` if the body reached its end, which lets the stream be
    /// reused. The body is closed either way.
    pub async fn discard(&mut self, limit: Duration) -> bool {
        if self.source.is_none() {
            return true;
        }

        let drained = tokio::time::timeout(limit, async {
            while self.chunk().await?.is_some() {}
            Ok::<_, Error>(())
        })
        .await;

        let complete = matches!(drained, Ok(Ok(())));
        if !complete {
            debug!(?limit, "Response body not drained, closing");
        }
        self.close();
        complete
    }

    /// Closes the body without reading the rest.
    #[inline]
    pub fn close(&mut self) {
        self.source = None;
    }

    /// Replaces the source with `wrap(source)`. Closed bodies stay closed.
    pub(crate) fn map_source<F>(mut self, wrap: F) -> Self
    where
        F: FnOnce(Box<dyn BodySource>) -> Box<dyn BodySource>,
    {
        self.source = self
            .source
            .take()
            .map(|source| Mutex::new(wrap(source.into_inner())));
        self
    }
}

impl Default for ResponseBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("content_length", &self.content_length)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
