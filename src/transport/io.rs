//! Byte-stream plumbing shared by connections and codecs.
//!
//! - [`BoxedIo`] erases the transport type (plain TCP, TLS, test doubles)
//! - [`BufferedIo`] keeps bytes read ahead of the current consumer, so a
//!   health probe or a parsed head never loses data
//! - [`CancelSignal`] lets another task abort in-flight I/O
//! - [`run_io`] applies one timeout and the cancel signal to an I/O future

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Minimum spare capacity reserved before each read.
const READ_CHUNK: usize = 8 * 1024;

// ============================================================================
// Types
// ============================================================================

/// Bidirectional byte stream usable as a connection transport.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased transport.
pub type BoxedIo = Box<dyn AsyncIo>;

// ============================================================================
// BufferedIo
// ============================================================================

/// Transport with a read-ahead buffer.
pub(crate) struct BufferedIo {
    io: BoxedIo,
    read_buf: BytesMut,
}

impl BufferedIo {
    /// Wraps a transport with an empty buffer.
    pub(crate) fn new(io: BoxedIo) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Returns the buffered, unconsumed bytes.
    #[inline]
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.read_buf
    }

    /// Discards `n` buffered bytes.
    #[inline]
    pub(crate) fn consume(&mut self, n: usize) {
        self.read_buf.advance(n);
    }

    /// Removes and returns up to `n` buffered bytes.
    #[inline]
    pub(crate) fn take(&mut self, n: usize) -> Bytes {
        let n = n.min(self.read_buf.len());
        self.read_buf.split_to(n).freeze()
    }

    /// Reads more bytes into the buffer. Returns 0 at end of stream.
    pub(crate) async fn fill(&mut self) -> io::Result<usize> {
        self.read_buf.reserve(READ_CHUNK);
        self.io.read_buf(&mut self.read_buf).await
    }

    /// Writes all of `data`.
    pub(crate) async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.io.write_all(data).await
    }

    /// Flushes the transport.
    pub(crate) async fn flush(&mut self) -> io::Result<()> {
        self.io.flush().await
    }

    /// Returns the transport. Fails if read-ahead bytes would be lost.
    pub(crate) fn into_inner(self) -> Result<BoxedIo> {
        if !self.read_buf.is_empty() {
            return Err(Error::protocol(format!(
                "{} unexpected bytes buffered ahead of handshake",
                self.read_buf.len()
            )));
        }
        Ok(self.io)
    }
}

// ============================================================================
// CancelSignal
// ============================================================================

/// One-shot, sticky cancellation signal.
///
/// Once fired, every current and future [`cancelled`](Self::cancelled) call
/// completes immediately.
#[derive(Debug, Default)]
pub(crate) struct CancelSignal {
    fired: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    /// Fires the signal.
    pub(crate) fn fire(&self) {
        self.fired.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Returns `true` once fired.
    #[inline]
    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Completes when the signal fires.
    pub(crate) async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_fired() {
            return;
        }
        notified.await;
    }
}

// ============================================================================
// run_io
// ============================================================================

/// Runs an I/O future under an optional timeout and a cancel signal.
///
/// Cancellation wins over completion when both are ready.
pub(crate) async fn run_io<T, F>(
    cancel: &CancelSignal,
    operation: &'static str,
    limit: Option<Duration>,
    fut: F,
) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    let bounded = async {
        match limit {
            Some(limit) => timeout(limit, fut)
                .await
                .map_err(|_| Error::timeout(operation, limit.as_millis() as u64))?
                .map_err(Error::from),
            None => fut.await.map_err(Error::from),
        }
    };

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Canceled),
        result = bounded => result,
    }
}

/// Converts a millisecond setting into an optional limit; 0 means none.
#[inline]
pub(crate) fn limit_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

// ============================================================================
// Tests
// ============================================================================
