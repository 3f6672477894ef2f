//! Scripted HTTP/1.1 server for integration tests.
//!
//! The server answers each request it reads with the next queued
//! [`Reply`] and records what it saw, so tests can assert on connection
//! reuse and on the exact follow-up requests a call produced.

#![allow(dead_code)]

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

// ============================================================================
// Tracing
// ============================================================================

/// Installs a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Types
// ============================================================================

/// What the server does after reading one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Writes the bytes and keeps the connection open.
    Send(String),
    /// Writes the bytes, then closes the connection.
    SendThenClose(String),
    /// Never answers.
    Hang,
    /// Closes the connection without answering.
    Close,
    /// Reads the request head, then drops the connection with the body
    /// unread.
    ResetMidBody,
}

/// A request as read off the wire.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Zero-based index of the accepted connection.
    pub connection: usize,
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// Returns the first header named `name`, case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
struct State {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Option<Reply>>,
    requests: Mutex<Vec<RecordedRequest>>,
    closed: Mutex<Vec<usize>>,
    accepted: AtomicUsize,
}

// ============================================================================
// MockServer
// ============================================================================

/// Loopback server answering from a reply queue.
pub struct MockServer {
    addr: SocketAddr,
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Binds to an ephemeral loopback port and starts accepting.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(State::default());

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = accept_state.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, index, Arc::clone(&accept_state)));
            }
        });

        Self { addr, state, task }
    }

    /// Queues the next reply.
    pub fn enqueue(&self, reply: Reply) {
        self.state.replies.lock().push_back(reply);
    }

    /// Sets the reply used once the queue is empty.
    pub fn set_fallback(&self, reply: Reply) {
        *self.state.fallback.lock() = Some(reply);
    }

    /// Returns the bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns an absolute URL for `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Returns every request read so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().clone()
    }

    /// Returns the number of accepted connections.
    pub fn connection_count(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Returns the indexes of connections that reached EOF or were closed.
    pub fn closed_connections(&self) -> Vec<usize> {
        self.state.closed.lock().clone()
    }

    /// Waits until `condition` holds, failing the test after five seconds.
    pub async fn wait_until(&self, condition: impl Fn(&Self) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition(self) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Replies
// ============================================================================

/// Builds a response with a `Content-Length` header.
pub fn response(status_line: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!("HTTP/1.1 {status_line}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    out
}

/// Builds a `200 OK` with `body`.
pub fn ok(body: &str) -> Reply {
    Reply::Send(response("200 OK", &[], body))
}

/// Builds a redirect to `location`.
pub fn redirect(code: u16, location: &str) -> Reply {
    let status = format!("{code} Redirect");
    Reply::Send(response(&status, &[("Location", location)], ""))
}

// ============================================================================
// Connection Handling
// ============================================================================

async fn serve(stream: TcpStream, index: usize, state: Arc<State>) {
    let mut stream = BufReader::new(stream);

    loop {
        let Some(mut request) = read_head(&mut stream, index).await else {
            state.closed.lock().push(index);
            return;
        };

        let reset = matches!(state.replies.lock().front(), Some(Reply::ResetMidBody));
        if reset {
            state.replies.lock().pop_front();
            state.requests.lock().push(request);
            state.closed.lock().push(index);
            return;
        }

        if read_body(&mut stream, &mut request).await.is_none() {
            state.closed.lock().push(index);
            return;
        }
        state.requests.lock().push(request);

        let queued = state.replies.lock().pop_front();
        let reply = queued
            .or_else(|| state.fallback.lock().clone())
            .unwrap_or_else(|| Reply::Send(response("500 No Reply Queued", &[], "")));

        match reply {
            Reply::Send(bytes) => {
                if stream.get_mut().write_all(bytes.as_bytes()).await.is_err() {
                    state.closed.lock().push(index);
                    return;
                }
            }
            Reply::SendThenClose(bytes) => {
                let _ = stream.get_mut().write_all(bytes.as_bytes()).await;
                let _ = stream.get_mut().shutdown().await;
                state.closed.lock().push(index);
                return;
            }
            Reply::Hang => std::future::pending::<()>().await,
            Reply::Close | Reply::ResetMidBody => {
                state.closed.lock().push(index);
                return;
            }
        }
    }
}

async fn read_head(
    stream: &mut BufReader<TcpStream>,
    connection: usize,
) -> Option<RecordedRequest> {
    let request_line = read_line(stream).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let mut headers = Vec::new();
    loop {
        let line = read_line(stream).await?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Some(RecordedRequest {
        connection,
        method,
        target,
        headers,
        body: Vec::new(),
    })
}

async fn read_body(stream: &mut BufReader<TcpStream>, request: &mut RecordedRequest) -> Option<()> {
    if let Some(length) = request.header("Content-Length") {
        let length: usize = length.parse().ok()?;
        let mut body = vec![0; length];
        stream.read_exact(&mut body).await.ok()?;
        request.body = body;
    } else if request
        .header("Transfer-Encoding")
        .is_some_and(|value| value.eq_ignore_ascii_case("chunked"))
    {
        request.body = read_chunked(stream).await?;
    }

    Some(())
}

async fn read_chunked(stream: &mut BufReader<TcpStream>) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let size_line = read_line(stream).await?;
        let size = usize::from_str_radix(size_line.split(';').next()?.trim(), 16).ok()?;
        if size == 0 {
            // Trailers end with an empty line.
            while !read_line(stream).await?.is_empty() {}
            return Some(body);
        }
        let mut chunk = vec![0; size];
        stream.read_exact(&mut chunk).await.ok()?;
        body.extend_from_slice(&chunk);
        read_line(stream).await?;
    }
}

/// Reads one CRLF-terminated line without the terminator; `None` on EOF.
async fn read_line(stream: &mut BufReader<TcpStream>) -> Option<String> {
    let mut line = String::new();
    match stream.read_line(&mut line).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}
