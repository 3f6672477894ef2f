//! HTTP/1.1 codec.
//!
//! Writes one request and reads one response over a connection's transport.
//! The transport is taken out of the [`Connection`] when the codec is
//! created and handed back when the response body reaches its end with the
//! framing intact. Bodies delimited by connection close, and bodies that are
//! dropped or fail part-way, never hand it back.
//!
//! # Response framing
//!
//! | Condition | Body |
//! |-----------|------|
//! | `HEAD`, `1xx`, `204`, `304` without length headers | empty |
//! | `Transfer-Encoding: chunked` | chunked |
//! | `Content-Length: n` | fixed `n` bytes |
//! | otherwise | until the peer closes |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use tracing::trace;

use crate::error::{Error, Result};
use crate::http::{BodySource, Request, ResponseBody, ResponseHead, content_length, header_str};
use crate::transport::Connection;
use crate::transport::io::{BufferedIo, CancelSignal, run_io};

use super::{Codec, IoTimeouts, StreamCancel};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of response header fields.
const MAX_HEADERS: usize = 100;

/// Maximum size of a response head or a chunk-size line.
const MAX_HEAD_BYTES: usize = 256 * 1024;

/// Buffered request bytes written out before the next body chunk is queued.
const FLUSH_THRESHOLD: usize = 16 * 1024;

// ============================================================================
// Head Helpers
// ============================================================================

/// Appends a start line and header block to `buf`.
pub(crate) fn encode_head(buf: &mut BytesMut, start_line: &str, headers: &HeaderMap) {
    buf.put_slice(start_line.as_bytes());
    buf.put_slice(b"\r\n");
    for (name, value) in headers {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
}

/// Parses a complete response head from `buf`.
///
/// Returns the head and its length in bytes, or `None` if more input is
/// needed.
fn parse_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut slots);

    let length = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(length)) => length,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(Error::protocol(format!("malformed response head: {e}"))),
    };

    let code = parsed
        .code
        .ok_or_else(|| Error::protocol("response head without status code"))?;
    let status = StatusCode::from_u16(code)
        .map_err(|_| Error::protocol(format!("invalid status code {code}")))?;

    let mut headers = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| Error::protocol(format!("invalid header name {:?}", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| Error::protocol(format!("invalid value for header {name}")))?;
        headers.append(name, value);
    }

    let head = ResponseHead {
        version: if parsed.version == Some(0) {
            Version::HTTP_10
        } else {
            Version::HTTP_11
        },
        status,
        reason: parsed.reason.unwrap_or_default().to_string(),
        headers,
    };
    Ok(Some((head, length)))
}

/// Reads one response head, filling the buffer as needed.
///
/// # Errors
///
/// - [`Error::ConnectionClosed`] if the peer closes before a full head
/// - [`Error::Protocol`] for malformed or oversized heads
pub(crate) async fn read_head(
    io: &mut BufferedIo,
    cancel: &CancelSignal,
    limit: Option<Duration>,
) -> Result<ResponseHead> {
    loop {
        if let Some((head, length)) = parse_head(io.buffer())? {
            io.consume(length);
            return Ok(head);
        }
        if io.buffer().len() > MAX_HEAD_BYTES {
            return Err(Error::protocol(format!(
                "response head exceeds {MAX_HEAD_BYTES} bytes"
            )));
        }
        if run_io(cancel, "read", limit, io.fill()).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
    }
}

/// Reads and drops exactly `length` bytes.
pub(crate) async fn skip_exact(
    io: &mut BufferedIo,
    mut length: u64,
    cancel: &CancelSignal,
    limit: Option<Duration>,
) -> Result<()> {
    while length > 0 {
        if io.buffer().is_empty() && run_io(cancel, "read", limit, io.fill()).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
        let n = (io.buffer().len() as u64).min(length) as usize;
        io.consume(n);
        length -= n as u64;
    }
    Ok(())
}

fn is_chunked(headers: &HeaderMap) -> bool {
    header_str(headers, "transfer-encoding").is_some_and(|value| {
        value
            .rsplit(',')
            .next()
            .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
    })
}

/// Returns `true` if the response carries a body, even an empty one.
fn has_body(method: &Method, head: &ResponseHead) -> bool {
    if *method == Method::HEAD {
        return false;
    }

    let code = head.status.as_u16();
    if !(100..200).contains(&code) && code != 204 && code != 304 {
        return true;
    }

    // Length headers that contradict the status line win.
    content_length(&head.headers).is_some() || is_chunked(&head.headers)
}

// ============================================================================
// Http1Codec
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    OpenRequestBody,
    WritingRequestBody,
    ReadResponseHeaders,
    OpenResponseBody,
}

#[derive(Debug, Clone, Copy)]
enum RequestSink {
    Fixed { remaining: u64 },
    Chunked,
}

/// Codec for one HTTP/1.1 exchange.
pub(crate) struct Http1Codec {
    connection: Arc<Connection>,
    io: BufferedIo,
    timeouts: IoTimeouts,
    cancel: Arc<CancelSignal>,
    out: BytesMut,
    sink: Option<RequestSink>,
    state: State,
}

impl Http1Codec {
    pub(crate) fn new(connection: Arc<Connection>, io: BufferedIo, timeouts: IoTimeouts) -> Self {
        Self {
            cancel: connection.cancel_signal(),
            connection,
            io,
            timeouts,
            out: BytesMut::new(),
            sink: None,
            state: State::Idle,
        }
    }

    fn expect_state(&self, allowed: &[State], operation: &str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::illegal_state(format!(
                "{operation} called in state {:?}",
                self.state
            )))
        }
    }

    /// Origin-form target, or absolute-form through a plain HTTP proxy.
    fn request_target(&self, request: &Request) -> String {
        let url = request.url();
        if self.connection.route().proxy().is_http() && !request.is_https() {
            let mut absolute = url.clone();
            absolute.set_fragment(None);
            return absolute.into();
        }

        let mut target = url.path().to_string();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        target
    }

    async fn write_out(&mut self) -> Result<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        let pending = self.out.split().freeze();
        run_io(&self.cancel, "write", self.timeouts.write, self.io.write_all(&pending)).await
    }

    async fn flush_out(&mut self) -> Result<()> {
        self.write_out().await?;
        run_io(&self.cancel, "write", self.timeouts.write, self.io.flush()).await
    }
}

#[async_trait]
impl Codec for Http1Codec {
    async fn write_request_headers(&mut self, request: &Request) -> Result<()> {
        self.expect_state(&[State::Idle], "write_request_headers")?;

        let start_line = format!("{} {} HTTP/1.1", request.method(), self.request_target(request));
        encode_head(&mut self.out, &start_line, request.headers());
        self.state = State::OpenRequestBody;

        trace!(connection = %self.connection.id(), %start_line, "Request head queued");
        Ok(())
    }

    async fn begin_body(&mut self, content_length: Option<u64>) -> Result<()> {
        self.expect_state(&[State::OpenRequestBody], "begin_body")?;
        self.sink = Some(match content_length {
            Some(remaining) => RequestSink::Fixed { remaining },
            None => RequestSink::Chunked,
        });
        self.state = State::WritingRequestBody;
        Ok(())
    }

    async fn write_body(&mut self, chunk: &[u8]) -> Result<()> {
        self.expect_state(&[State::WritingRequestBody], "write_body")?;

        match self.sink.as_mut() {
            Some(RequestSink::Fixed { remaining }) => {
                let length = chunk.len() as u64;
                if length > *remaining {
                    return Err(Error::protocol(format!(
                        "expected {remaining} more bytes but received {length}"
                    )));
                }
                *remaining -= length;
                self.out.put_slice(chunk);
            }
            Some(RequestSink::Chunked) => {
                if chunk.is_empty() {
                    return Ok(());
                }
                self.out.put_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
                self.out.put_slice(chunk);
                self.out.put_slice(b"\r\n");
            }
            None => return Err(Error::illegal_state("request body sink is not open")),
        }

        if self.out.len() >= FLUSH_THRESHOLD {
            self.write_out().await?;
        }
        Ok(())
    }

    async fn end_body(&mut self) -> Result<()> {
        self.expect_state(&[State::WritingRequestBody], "end_body")?;

        match self.sink.take() {
            Some(RequestSink::Fixed { remaining: 0 }) => {}
            Some(RequestSink::Fixed { remaining }) => {
                return Err(Error::protocol(format!(
                    "unexpected end of request body: {remaining} bytes missing"
                )));
            }
            Some(RequestSink::Chunked) => self.out.put_slice(b"0\r\n\r\n"),
            None => return Err(Error::illegal_state("request body sink is not open")),
        }

        self.state = State::ReadResponseHeaders;
        Ok(())
    }

    async fn flush_request(&mut self) -> Result<()> {
        self.flush_out().await
    }

    async fn finish_request(&mut self) -> Result<()> {
        self.expect_state(
            &[State::OpenRequestBody, State::ReadResponseHeaders],
            "finish_request",
        )?;
        self.flush_out().await?;
        self.state = State::ReadResponseHeaders;
        Ok(())
    }

    async fn read_response_headers(&mut self) -> Result<ResponseHead> {
        self.expect_state(
            &[State::OpenRequestBody, State::ReadResponseHeaders],
            "read_response_headers",
        )?;

        let head = read_head(&mut self.io, &self.cancel, self.timeouts.read).await?;
        let code = head.status.as_u16();

        // Interim responses leave the exchange where it was.
        if !(100..200).contains(&code) || code == 101 {
            self.state = State::OpenResponseBody;
        }

        trace!(connection = %self.connection.id(), status = code, "Response head read");
        Ok(head)
    }

    fn open_response_body(
        self: Box<Self>,
        head: &ResponseHead,
        request: &Request,
    ) -> Result<ResponseBody> {
        self.expect_state(&[State::OpenResponseBody], "open_response_body")?;

        let framing = if !has_body(request.method(), head) {
            Framing::Fixed { remaining: 0 }
        } else if is_chunked(&head.headers) {
            Framing::Chunked {
                remaining: 0,
                started: false,
            }
        } else if let Some(remaining) = content_length(&head.headers) {
            Framing::Fixed { remaining }
        } else {
            Framing::CloseDelimited
        };

        let Self {
            connection,
            io,
            timeouts,
            cancel,
            ..
        } = *self;

        let declared = match framing {
            Framing::Fixed { remaining } => Some(remaining),
            _ => None,
        };

        if declared == Some(0) {
            connection.restore_io(io);
            return Ok(ResponseBody::empty());
        }

        let source = Http1Body {
            connection,
            io: Some(io),
            cancel,
            read_timeout: timeouts.read,
            framing,
            finished: false,
        };
        Ok(ResponseBody::from_source(Box::new(source), declared))
    }

    fn canceler(&self) -> Arc<dyn StreamCancel> {
        self.connection.clone()
    }
}

// ============================================================================
// Http1Body
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Framing {
    Fixed { remaining: u64 },
    Chunked { remaining: u64, started: bool },
    CloseDelimited,
}

/// Response body source bound to the transport.
struct Http1Body {
    connection: Arc<Connection>,
    io: Option<BufferedIo>,
    cancel: Arc<CancelSignal>,
    read_timeout: Option<Duration>,
    framing: Framing,
    finished: bool,
}

impl Http1Body {
    fn io(&mut self) -> Result<&mut BufferedIo> {
        self.io.as_mut().ok_or(Error::ConnectionClosed)
    }

    /// Reads more bytes. Returns 0 at end of stream.
    async fn fill(&mut self) -> Result<usize> {
        let cancel = Arc::clone(&self.cancel);
        let limit = self.read_timeout;
        let io = self.io()?;
        run_io(&cancel, "read", limit, io.fill()).await
    }

    /// Ensures at least one byte is buffered. End of stream is an error.
    async fn require_bytes(&mut self) -> Result<()> {
        if self.io()?.buffer().is_empty() && self.fill().await? == 0 {
            return Err(Error::protocol("unexpected end of stream"));
        }
        Ok(())
    }

    /// Reads one CRLF-terminated line, without the terminator.
    async fn read_line(&mut self) -> Result<String> {
        loop {
            let io = self.io()?;
            if let Some(end) = io.buffer().iter().position(|&b| b == b'\n') {
                let taken = io.take(end + 1);
                let line: &[u8] = &taken;
                let line = line.strip_suffix(b"\n").unwrap_or(line);
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                return String::from_utf8(line.to_vec())
                    .map_err(|_| Error::protocol("line is not valid UTF-8"));
            }
            if io.buffer().len() > MAX_HEAD_BYTES {
                return Err(Error::protocol("line too long"));
            }
            if self.fill().await? == 0 {
                return Err(Error::protocol("unexpected end of stream"));
            }
        }
    }

    /// Reads the next chunk-size line. Returns 0 for the last chunk, after
    /// consuming the trailers.
    async fn read_chunk_size(&mut self, started: bool) -> Result<u64> {
        if started {
            let end = self.read_line().await?;
            if !end.is_empty() {
                return Err(Error::protocol(format!("expected CRLF after chunk but was {end:?}")));
            }
        }

        let line = self.read_line().await?;
        let digits = line.split(';').next().unwrap_or_default().trim();
        let size = u64::from_str_radix(digits, 16)
            .map_err(|_| Error::protocol(format!("expected chunk size but was {line:?}")))?;

        if size == 0 {
            while !self.read_line().await?.is_empty() {}
        }
        Ok(size)
    }

    /// Marks the body complete and hands the transport back if reusable.
    fn complete(&mut self) {
        self.finished = true;
        if let Some(io) = self.io.take() {
            if matches!(self.framing, Framing::CloseDelimited) {
                return;
            }
            trace!(connection = %self.connection.id(), "Response body complete");
            self.connection.restore_io(io);
        }
    }

    async fn take_buffered(&mut self, limit: u64) -> Result<Bytes> {
        self.require_bytes().await?;
        let io = self.io()?;
        let n = (io.buffer().len() as u64).min(limit) as usize;
        Ok(io.take(n))
    }
}

#[async_trait]
impl BodySource for Http1Body {
    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }

        match self.framing {
            Framing::Fixed { remaining: 0 } => {
                self.complete();
                Ok(None)
            }
            Framing::Fixed { remaining } => {
                let chunk = self.take_buffered(remaining).await?;
                let remaining = remaining - chunk.len() as u64;
                self.framing = Framing::Fixed { remaining };
                if remaining == 0 {
                    self.complete();
                }
                Ok(Some(chunk))
            }
            Framing::Chunked { remaining, started } => {
                let remaining = if remaining == 0 {
                    let size = self.read_chunk_size(started).await?;
                    if size == 0 {
                        self.complete();
                        return Ok(None);
                    }
                    size
                } else {
                    remaining
                };

                let chunk = self.take_buffered(remaining).await?;
                self.framing = Framing::Chunked {
                    remaining: remaining - chunk.len() as u64,
                    started: true,
                };
                Ok(Some(chunk))
            }
            Framing::CloseDelimited => {
                if self.io()?.buffer().is_empty() && self.fill().await? == 0 {
                    self.complete();
                    return Ok(None);
                }
                let io = self.io()?;
                let n = io.buffer().len();
                Ok(Some(io.take(n)))
            }
        }
    }

    fn ends_connection(&self) -> bool {
        matches!(self.framing, Framing::CloseDelimited)
    }
}

// ============================================================================
// Tests
// ============================================================================
