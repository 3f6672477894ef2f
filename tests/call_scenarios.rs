//! End-to-end call scenarios against a scripted loopback server.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use http::StatusCode;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, oneshot};
use tokio::task::JoinHandle;

use callwire::transport::BoxedIo;
use callwire::{
    BasicAuthenticator, Call, CertificatePinner, Chain, Client, Codec, Dns, Error, Handshake,
    HostnameVerifier, Interceptor, IoTimeouts, MultiplexedSession, Multiplexer, PoolConfig,
    Protocol, Request, RequestBody, Response, ResponseBody, ResponseHead, Result, StreamCancel,
    TlsConfig, TlsConnector, TlsFailure,
};

use common::{MockServer, Reply, init_tracing, ok, redirect, response};

// ============================================================================
// Helpers
// ============================================================================

fn client() -> Client {
    Client::builder().build().expect("client")
}

fn get(url: &str) -> Request {
    Request::get(url).expect("request")
}

/// Resolves every name through a fixed table, ignoring the port.
struct StaticDns {
    table: Vec<(&'static str, Vec<SocketAddr>)>,
}

#[async_trait]
impl Dns for StaticDns {
    async fn lookup(&self, host: &str, _port: u16) -> Result<Vec<SocketAddr>> {
        self.table
            .iter()
            .find(|(name, _)| *name == host)
            .map(|(_, addrs)| addrs.clone())
            .ok_or_else(|| Error::connection(format!("Unable to resolve host {host}")))
    }
}

/// Returns a loopback address nothing listens on.
async fn refused_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    listener.local_addr().expect("local addr")
}

// ============================================================================
// Connection Reuse
// ============================================================================

#[tokio::test]
async fn test_sequential_calls_share_one_connection() {
    init_tracing();
    let server = MockServer::start().await;
    for body in ["a", "b", "c"] {
        server.enqueue(ok(body));
    }
    let client = client();

    for expected in ["a", "b", "c"] {
        let mut response = client
            .new_call(get(&server.url("/")))
            .execute()
            .await
            .expect("response");
        assert_eq!(response.text().await.expect("body"), expected);
    }

    assert_eq!(server.connection_count(), 1);
    assert_eq!(client.pool().connection_count(), 1);
    assert_eq!(client.pool().idle_connection_count(), 1);
}

#[tokio::test]
async fn test_six_consumed_calls_keep_idle_count_within_limit() {
    init_tracing();
    let server = MockServer::start().await;
    for _ in 0..6 {
        server.enqueue(ok("x"));
    }
    let client = Client::builder()
        .pool_config(PoolConfig {
            max_idle_connections: 5,
            keep_alive_ms: 300_000,
        })
        .build()
        .expect("client");

    // Holding each body open forces a fresh connection per call.
    let mut responses = Vec::new();
    for _ in 0..6 {
        let response = client
            .new_call(get(&server.url("/")))
            .execute()
            .await
            .expect("response");
        responses.push(response);
    }
    assert_eq!(server.connection_count(), 6);

    for response in &mut responses {
        assert_eq!(response.text().await.expect("body"), "x");
    }

    server
        .wait_until(|server| server.closed_connections().contains(&0))
        .await;
    assert!(client.pool().idle_connection_count() <= 5);
    assert_eq!(server.closed_connections(), vec![0]);
}

#[tokio::test]
async fn test_connection_close_prevents_reuse() {
    let server = MockServer::start().await;
    for _ in 0..2 {
        server.enqueue(Reply::Send(response(
            "200 OK",
            &[("Connection", "close")],
            "bye",
        )));
    }
    let client = client();

    for _ in 0..2 {
        let mut response = client
            .new_call(get(&server.url("/")))
            .execute()
            .await
            .expect("response");
        assert_eq!(response.text().await.expect("body"), "bye");
    }

    assert_eq!(server.connection_count(), 2);
    assert_eq!(client.pool().idle_connection_count(), 0);
}

#[tokio::test]
async fn test_stale_pooled_connection_is_retried_on_fresh_one() {
    init_tracing();
    let server = MockServer::start().await;
    server.enqueue(Reply::SendThenClose(response("200 OK", &[], "first")));
    server.enqueue(ok("second"));
    let client = client();

    let mut first = client
        .new_call(get(&server.url("/")))
        .execute()
        .await
        .expect("first response");
    assert_eq!(first.text().await.expect("body"), "first");
    server
        .wait_until(|server| server.closed_connections().contains(&0))
        .await;

    let mut second = client
        .new_call(get(&server.url("/")))
        .execute()
        .await
        .expect("second response");

    assert_eq!(second.text().await.expect("body"), "second");
    assert_eq!(server.connection_count(), 2);
}

// ============================================================================
// Request Shaping
// ============================================================================

#[tokio::test]
async fn test_bridge_headers_reach_the_wire() {
    let server = MockServer::start().await;
    server.enqueue(ok("created"));
    let client = Client::builder()
        .user_agent("scenario/1.0")
        .build()
        .expect("client");
    let request = Request::builder()
        .url(server.url("/items"))
        .post(RequestBody::text("hello"))
        .build()
        .expect("request");

    let mut response = client.new_call(request).execute().await.expect("response");
    response.text().await.expect("body");

    let requests = server.requests();
    let sent = &requests[0];
    assert_eq!(sent.method, "POST");
    assert_eq!(sent.target, "/items");
    assert_eq!(sent.body, b"hello");
    assert_eq!(sent.header("Content-Length"), Some("5"));
    assert_eq!(
        sent.header("Content-Type"),
        Some("text/plain; charset=utf-8")
    );
    assert_eq!(sent.header("Host"), Some(server.addr().to_string().as_str()));
    assert_eq!(sent.header("Connection"), Some("Keep-Alive"));
    assert_eq!(sent.header("User-Agent"), Some("scenario/1.0"));
}

#[tokio::test]
async fn test_chunked_response_is_decoded_and_connection_reused() {
    let server = MockServer::start().await;
    server.enqueue(Reply::Send(
        "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
         5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
            .to_string(),
    ));
    server.enqueue(ok("again"));
    let client = client();

    let mut first = client
        .new_call(get(&server.url("/")))
        .execute()
        .await
        .expect("response");
    assert_eq!(first.text().await.expect("body"), "hello world");

    let mut second = client
        .new_call(get(&server.url("/")))
        .execute()
        .await
        .expect("response");
    assert_eq!(second.text().await.expect("body"), "again");
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_no_content_with_body_length_is_protocol_error() {
    let server = MockServer::start().await;
    server.enqueue(Reply::Send(response("204 No Content", &[], "hello")));
    let client = client();

    let result = client.new_call(get(&server.url("/"))).execute().await;

    let error = result.expect_err("protocol error");
    assert!(error.is_protocol_error());
    assert!(error.to_string().contains("non-zero Content-Length: 5"));
}

// ============================================================================
// Follow-ups
// ============================================================================

#[tokio::test]
async fn test_moved_permanently_follows_with_get_on_same_connection() {
    init_tracing();
    let server = MockServer::start().await;
    server.enqueue(redirect(301, "/next"));
    server.enqueue(ok("arrived"));
    let client = client();

    let mut response = client
        .new_call(get(&server.url("/start")))
        .execute()
        .await
        .expect("response");

    assert_eq!(response.text().await.expect("body"), "arrived");
    assert_eq!(response.request().url().as_str(), server.url("/next"));
    assert_eq!(
        response.prior_response().map(Response::code),
        Some(301)
    );

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].method, "GET");
    assert_eq!(requests[1].target, "/next");
    assert_eq!(requests[0].connection, requests[1].connection);
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_too_many_follow_ups_fails_the_call() {
    let server = MockServer::start().await;
    for _ in 0..21 {
        server.enqueue(redirect(302, "/loop"));
    }
    let client = client();

    let result = client.new_call(get(&server.url("/loop"))).execute().await;

    assert!(matches!(result, Err(Error::TooManyFollowUps { count: 21 })));
    assert_eq!(server.requests().len(), 21);
}

#[tokio::test]
async fn test_unauthorized_is_answered_once_with_credentials() {
    let server = MockServer::start().await;
    server.enqueue(Reply::Send(response(
        "401 Unauthorized",
        &[("WWW-Authenticate", "Basic realm=\"scenario\"")],
        "",
    )));
    server.enqueue(ok("welcome"));
    let client = Client::builder()
        .authenticator(BasicAuthenticator::new("user", "pass"))
        .build()
        .expect("client");

    let mut response = client
        .new_call(get(&server.url("/private")))
        .execute()
        .await
        .expect("response");

    assert_eq!(response.text().await.expect("body"), "welcome");
    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].header("Authorization"), None);
    assert_eq!(requests[1].target, "/private");
    assert_eq!(
        requests[1].header("Authorization"),
        Some("Basic dXNlcjpwYXNz")
    );
}

#[tokio::test]
async fn test_rejected_credentials_are_not_retried() {
    let server = MockServer::start().await;
    for _ in 0..2 {
        server.enqueue(Reply::Send(response(
            "401 Unauthorized",
            &[("WWW-Authenticate", "Basic realm=\"scenario\"")],
            "",
        )));
    }
    let client = Client::builder()
        .authenticator(BasicAuthenticator::new("user", "wrong"))
        .build()
        .expect("client");

    let response = client
        .new_call(get(&server.url("/private")))
        .execute()
        .await
        .expect("response");

    assert_eq!(response.code(), 401);
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test]
async fn test_request_timeout_is_replayed_once() {
    let server = MockServer::start().await;
    server.enqueue(Reply::Send(response("408 Request Timeout", &[], "")));
    server.enqueue(ok("done"));
    let client = client();

    let mut response = client
        .new_call(get(&server.url("/")))
        .execute()
        .await
        .expect("response");

    assert_eq!(response.text().await.expect("body"), "done");
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test]
async fn test_cross_host_redirect_drops_authorization() {
    let origin = MockServer::start().await;
    let other = MockServer::start().await;
    let location = format!("http://b.test:{}/landing", other.addr().port());
    origin.enqueue(redirect(302, &location));
    other.enqueue(ok("landed"));
    let client = Client::builder()
        .dns(StaticDns {
            table: vec![("a.test", vec![origin.addr()]), ("b.test", vec![other.addr()])],
        })
        .build()
        .expect("client");
    let request = Request::builder()
        .url(format!("http://a.test:{}/start", origin.addr().port()))
        .header("Authorization", "Bearer secret")
        .build()
        .expect("request");

    let mut response = client.new_call(request).execute().await.expect("response");

    assert_eq!(response.text().await.expect("body"), "landed");
    assert_eq!(
        origin.requests()[0].header("Authorization"),
        Some("Bearer secret")
    );
    let landed = &other.requests()[0];
    assert_eq!(landed.target, "/landing");
    assert_eq!(landed.header("Authorization"), None);
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_refused_route_falls_through_to_next_address() {
    init_tracing();
    let server = MockServer::start().await;
    server.enqueue(ok("reachable"));
    let dead = refused_addr().await;
    let client = Client::builder()
        .dns(StaticDns {
            table: vec![("multi.test", vec![dead, server.addr()])],
        })
        .build()
        .expect("client");

    let mut response = client
        .new_call(get(&format!("http://multi.test:{}/", server.addr().port())))
        .execute()
        .await
        .expect("response");

    assert_eq!(response.text().await.expect("body"), "reachable");
    assert_eq!(server.connection_count(), 1);
}

#[tokio::test]
async fn test_every_route_refused_surfaces_route_error() {
    let dead = refused_addr().await;
    let client = Client::builder()
        .dns(StaticDns {
            table: vec![("dead.test", vec![dead])],
        })
        .build()
        .expect("client");

    let result = client
        .new_call(get(&format!("http://dead.test:{}/", dead.port())))
        .execute()
        .await;

    let error = result.expect_err("route error");
    assert!(error.is_route_failure());
}

#[tokio::test]
async fn test_failed_streamed_body_is_not_retried() {
    init_tracing();
    let server = MockServer::start().await;
    server.enqueue(ok("unreachable"));
    let chunks = stream::iter(vec![
        Ok(Bytes::from_static(b"x")),
        Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "source failed",
        )),
    ]);
    let request = Request::builder()
        .url(server.url("/upload"))
        .post(RequestBody::streamed(chunks, None))
        .build()
        .expect("request");
    let client = client();

    let result = client.new_call(request).execute().await;

    assert!(matches!(result, Err(Error::Io(_))));
    server.wait_until(|server| server.connection_count() >= 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.connection_count(), 1);
    assert!(server.requests().is_empty());
}

#[tokio::test]
async fn test_peer_reset_during_streamed_body_surfaces_transport_error() {
    init_tracing();
    let server = MockServer::start().await;
    server.enqueue(Reply::ResetMidBody);
    server.enqueue(ok("unreachable"));
    // One byte first, then enough data after the peer is gone to hit the reset.
    let chunks = stream::unfold(0usize, |sent| async move {
        if sent == 1 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        (sent <= 64).then(|| {
            let size = if sent == 0 { 1 } else { 64 * 1024 };
            (Ok::<_, std::io::Error>(Bytes::from(vec![b'x'; size])), sent + 1)
        })
    });
    let request = Request::builder()
        .url(server.url("/upload"))
        .post(RequestBody::streamed(chunks, None))
        .build()
        .expect("request");
    let client = client();

    let result = client.new_call(request).execute().await;

    let error = result.expect_err("transport error");
    assert!(matches!(error, Error::Io(_)), "unexpected error: {error}");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.connection_count(), 1);
    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].method, "POST");
}

// ============================================================================
// Cancellation and Dispatch
// ============================================================================

#[tokio::test]
async fn test_second_execute_fails_without_reaching_server() {
    let server = MockServer::start().await;
    server.enqueue(ok("once"));
    server.enqueue(ok("twice"));
    let client = client();
    let call = client.new_call(get(&server.url("/")));

    let mut first = call.execute().await.expect("first execute");
    let second = call.execute().await;

    assert_eq!(first.text().await.expect("body"), "once");
    let error = second.expect_err("second execute");
    assert!(matches!(error, Error::IllegalState { .. }));
    assert!(error.to_string().contains("Already Executed"));
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn test_second_enqueue_fails_and_call_runs_once() {
    let server = MockServer::start().await;
    server.enqueue(ok("once"));
    server.enqueue(ok("twice"));
    let client = client();
    let call = client.new_call(get(&server.url("/")));
    let (tx, rx) = oneshot::channel();
    let extra_callbacks = Arc::new(AtomicUsize::new(0));

    call.enqueue(move |result| {
        let _ = tx.send(result.map(|response| response.code()));
    })
    .expect("first enqueue");
    let counter = Arc::clone(&extra_callbacks);
    let second = call.enqueue(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(matches!(second, Err(Error::IllegalState { .. })));
    let code = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("callback in time")
        .expect("callback");
    assert_eq!(code.expect("response"), 200);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.requests().len(), 1);
    assert_eq!(extra_callbacks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_interrupts_pending_read() {
    let server = MockServer::start().await;
    server.enqueue(Reply::Hang);
    let client = client();
    let call = client.new_call(get(&server.url("/slow")));

    let running = call.clone();
    let task = tokio::spawn(async move { running.execute().await });
    server.wait_until(|server| server.requests().len() == 1).await;
    call.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("call finished in time")
        .expect("task");
    assert!(matches!(result, Err(Error::Canceled)));
}

#[tokio::test]
async fn test_enqueued_call_delivers_one_result() {
    let server = MockServer::start().await;
    server.enqueue(ok("queued"));
    let client = client();
    let (tx, rx) = oneshot::channel();

    client
        .new_call(get(&server.url("/")))
        .enqueue(move |result| {
            let _ = tx.send(result.map(|response| response.code()));
        })
        .expect("enqueue");

    let code = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("callback in time")
        .expect("callback");
    assert_eq!(code.expect("response"), 200);
}

// ============================================================================
// Interceptors
// ============================================================================

struct Cached;

#[async_trait]
impl Interceptor for Cached {
    async fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let head = ResponseHead::new(StatusCode::OK);
        Ok(Response::new(
            chain.request().clone(),
            head,
            ResponseBody::from_bytes("cached"),
        ))
    }
}

struct ProceedTwice;

#[async_trait]
impl Interceptor for ProceedTwice {
    async fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let request = chain.request().clone();
        let first = chain.proceed(request.clone()).await?;
        drop(first);
        chain.proceed(request).await
    }
}

struct Redirector {
    port: u16,
}

#[async_trait]
impl Interceptor for Redirector {
    async fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let moved = chain
            .request()
            .to_builder()
            .url(format!("http://127.0.0.1:{}/", self.port))
            .build()?;
        chain.proceed(moved).await
    }
}

struct Observer {
    tx: parking_lot::Mutex<Option<oneshot::Sender<bool>>>,
}

#[async_trait]
impl Interceptor for Observer {
    async fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let bound = chain.connection().is_some();
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(bound);
        }
        let request = chain.request().clone();
        chain.proceed(request).await
    }
}

#[tokio::test]
async fn test_application_interceptor_can_short_circuit() {
    let server = MockServer::start().await;
    let client = Client::builder().interceptor(Cached).build().expect("client");

    let mut response = client
        .new_call(get(&server.url("/")))
        .execute()
        .await
        .expect("response");

    assert_eq!(response.text().await.expect("body"), "cached");
    assert_eq!(server.connection_count(), 0);
}

#[tokio::test]
async fn test_network_interceptor_sees_bound_connection() {
    let server = MockServer::start().await;
    server.enqueue(ok("seen"));
    let (tx, rx) = oneshot::channel();
    let client = Client::builder()
        .network_interceptor(Observer {
            tx: parking_lot::Mutex::new(Some(tx)),
        })
        .build()
        .expect("client");

    let mut response = client
        .new_call(get(&server.url("/")))
        .execute()
        .await
        .expect("response");

    assert_eq!(response.text().await.expect("body"), "seen");
    assert!(rx.await.expect("observed"));
}

#[tokio::test]
async fn test_network_interceptor_must_proceed_once() {
    let server = MockServer::start().await;
    server.enqueue(ok("one"));
    server.enqueue(ok("two"));
    let client = Client::builder()
        .network_interceptor(ProceedTwice)
        .build()
        .expect("client");

    let result = client.new_call(get(&server.url("/"))).execute().await;

    let error = result.expect_err("contract violation");
    assert!(matches!(error, Error::IllegalState { .. }));
    assert!(error.to_string().contains("exactly once"));
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn test_network_interceptor_must_keep_host_and_port() {
    let server = MockServer::start().await;
    let elsewhere = MockServer::start().await;
    server.enqueue(ok("origin"));
    let client = Client::builder()
        .network_interceptor(Redirector {
            port: elsewhere.addr().port(),
        })
        .build()
        .expect("client");

    let result = client.new_call(get(&server.url("/"))).execute().await;

    let error = result.expect_err("contract violation");
    assert!(matches!(error, Error::IllegalState { .. }));
    assert!(error.to_string().contains("same host and port"));
    assert!(server.requests().is_empty());
    assert!(elsewhere.requests().is_empty());
}

// ============================================================================
// TLS
// ============================================================================

/// Reports a TLS session over the plain socket.
struct PlainTls {
    alpn: Option<Protocol>,
    failures_left: AtomicUsize,
    handshakes: AtomicUsize,
}

impl PlainTls {
    fn new(alpn: Option<Protocol>) -> Arc<Self> {
        Self::failing(alpn, 0)
    }

    fn failing(alpn: Option<Protocol>, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            alpn,
            failures_left: AtomicUsize::new(failures),
            handshakes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TlsConnector for PlainTls {
    async fn connect(
        &self,
        _host: &str,
        alpn: &[Protocol],
        io: BoxedIo,
    ) -> Result<(BoxedIo, Handshake)> {
        self.handshakes.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::tls(TlsFailure::Handshake, "handshake aborted"));
        }

        let handshake = Handshake {
            tls_version: "TLSv1.3".into(),
            cipher_suite: "TLS_AES_128_GCM_SHA256".into(),
            peer_certificates: vec![Bytes::from_static(b"leaf")],
            alpn: self.alpn.filter(|protocol| alpn.contains(protocol)),
        };
        Ok((io, handshake))
    }
}

struct RejectHost(&'static str);

impl HostnameVerifier for RejectHost {
    fn verify(&self, host: &str, _handshake: &Handshake) -> bool {
        host != self.0
    }
}

struct PinnedTo(&'static [u8]);

impl CertificatePinner for PinnedTo {
    fn check(&self, host: &str, peer_certificates: &[Bytes]) -> Result<()> {
        if peer_certificates.first().is_some_and(|leaf| leaf.as_ref() == self.0) {
            return Ok(());
        }
        Err(Error::tls(
            TlsFailure::PeerUnverified,
            format!("Certificate pinning failure for {host}"),
        ))
    }
}

fn secure_client(tls: TlsConfig, servers: &[&MockServer]) -> Client {
    Client::builder()
        .tls(tls)
        .dns(StaticDns {
            table: vec![(
                "secure.test",
                servers.iter().map(|server| server.addr()).collect(),
            )],
        })
        .build()
        .expect("client")
}

fn secure_url(server: &MockServer) -> String {
    format!("https://secure.test:{}/", server.addr().port())
}

fn assert_peer_unverified(error: &Error) {
    assert!(error.is_route_failure(), "unexpected error: {error}");
    assert!(error.last_connect_error().is_security_error());
    assert!(matches!(
        error.last_connect_error(),
        Error::Tls {
            kind: TlsFailure::PeerUnverified,
            ..
        }
    ));
}

#[tokio::test]
async fn test_tls_handshake_is_reported_on_response() {
    let server = MockServer::start().await;
    server.enqueue(ok("secure"));
    let connector = PlainTls::new(None);
    let client = secure_client(TlsConfig::new(connector.clone()), &[&server]);

    let mut response = client
        .new_call(get(&secure_url(&server)))
        .execute()
        .await
        .expect("response");

    assert_eq!(response.text().await.expect("body"), "secure");
    let handshake = response.handshake().expect("handshake");
    assert_eq!(handshake.tls_version, "TLSv1.3");
    assert_eq!(handshake.alpn, None);
    assert_eq!(connector.handshakes.load(Ordering::SeqCst), 1);
    let expected_host = format!("secure.test:{}", server.addr().port());
    assert_eq!(
        server.requests()[0].header("Host"),
        Some(expected_host.as_str())
    );
}

#[tokio::test]
async fn test_hostname_mismatch_is_not_retried_on_another_route() {
    init_tracing();
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    let tls = TlsConfig::new(PlainTls::new(None))
        .with_hostname_verifier(Arc::new(RejectHost("secure.test")));
    let client = secure_client(tls, &[&first, &second]);

    let result = client.new_call(get(&secure_url(&first))).execute().await;

    assert_peer_unverified(&result.expect_err("verification failure"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(first.connection_count(), 1);
    assert_eq!(second.connection_count(), 0);
}

#[tokio::test]
async fn test_pin_mismatch_is_not_retried_on_another_route() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    let tls = TlsConfig::new(PlainTls::new(None))
        .with_certificate_pinner(Arc::new(PinnedTo(b"another leaf")));
    let client = secure_client(tls, &[&first, &second]);

    let result = client.new_call(get(&secure_url(&first))).execute().await;

    assert_peer_unverified(&result.expect_err("pinning failure"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(second.connection_count(), 0);
}

#[tokio::test]
async fn test_matching_pin_is_accepted() {
    let server = MockServer::start().await;
    server.enqueue(ok("pinned"));
    let tls = TlsConfig::new(PlainTls::new(None))
        .with_certificate_pinner(Arc::new(PinnedTo(b"leaf")));
    let client = secure_client(tls, &[&server]);

    let mut response = client
        .new_call(get(&secure_url(&server)))
        .execute()
        .await
        .expect("response");

    assert_eq!(response.text().await.expect("body"), "pinned");
}

#[tokio::test]
async fn test_handshake_failure_moves_to_next_route() {
    let first = MockServer::start().await;
    let second = MockServer::start().await;
    second.enqueue(ok("second route"));
    let connector = PlainTls::failing(None, 1);
    let client = secure_client(TlsConfig::new(connector.clone()), &[&first, &second]);

    let mut response = client
        .new_call(get(&secure_url(&first)))
        .execute()
        .await
        .expect("response");

    assert_eq!(response.text().await.expect("body"), "second route");
    assert_eq!(connector.handshakes.load(Ordering::SeqCst), 2);
    assert!(first.requests().is_empty());
    assert_eq!(second.requests().len(), 1);
}

// ============================================================================
// Multiplexed Sessions
// ============================================================================

/// Counters and controls shared by every session a multiplexer creates.
struct MuxState {
    limit: AtomicUsize,
    handshakes: AtomicUsize,
    opened: AtomicUsize,
    canceled: AtomicUsize,
    shutdowns: AtomicUsize,
    /// One permit answers one pending stream.
    release: Semaphore,
}

impl MuxState {
    fn with_limit(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit: AtomicUsize::new(limit),
            handshakes: AtomicUsize::new(0),
            opened: AtomicUsize::new(0),
            canceled: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            release: Semaphore::new(0),
        })
    }

    async fn wait_for_streams(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.opened.load(Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("streams opened in time");
    }
}

struct MockMultiplexer {
    state: Arc<MuxState>,
}

#[async_trait]
impl Multiplexer for MockMultiplexer {
    async fn handshake(&self, io: BoxedIo) -> Result<Arc<dyn MultiplexedSession>> {
        self.state.handshakes.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession {
            state: Arc::clone(&self.state),
            shutdown: AtomicBool::new(false),
            io: Mutex::new(Some(io)),
        }))
    }
}

struct MockSession {
    state: Arc<MuxState>,
    shutdown: AtomicBool,
    io: Mutex<Option<BoxedIo>>,
}

impl MultiplexedSession for MockSession {
    fn max_concurrent_streams(&self) -> usize {
        self.state.limit.load(Ordering::SeqCst)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn new_codec(&self, _timeouts: IoTimeouts) -> Result<Box<dyn Codec>> {
        if self.is_shutdown() {
            return Err(Error::ConnectionShutdown);
        }
        self.state.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockStream {
            state: Arc::clone(&self.state),
            flag: Arc::new(StreamFlag::default()),
        }))
    }

    fn shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            self.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
        self.io.lock().take();
    }
}

#[derive(Default)]
struct StreamFlag {
    canceled: AtomicBool,
    notify: Notify,
}

impl StreamCancel for StreamFlag {
    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

/// One stream that answers `200 mux` once the test releases it.
struct MockStream {
    state: Arc<MuxState>,
    flag: Arc<StreamFlag>,
}

#[async_trait]
impl Codec for MockStream {
    async fn write_request_headers(&mut self, _request: &Request) -> Result<()> {
        Ok(())
    }

    async fn begin_body(&mut self, _content_length: Option<u64>) -> Result<()> {
        Ok(())
    }

    async fn write_body(&mut self, _chunk: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn end_body(&mut self) -> Result<()> {
        Ok(())
    }

    async fn flush_request(&mut self) -> Result<()> {
        Ok(())
    }

    async fn finish_request(&mut self) -> Result<()> {
        Ok(())
    }

    async fn read_response_headers(&mut self) -> Result<ResponseHead> {
        if self.flag.canceled.load(Ordering::SeqCst) {
            return Err(Error::Canceled);
        }
        tokio::select! {
            permit = self.state.release.acquire() => {
                permit.map_err(|_| Error::ConnectionShutdown)?.forget();
                Ok(ResponseHead::new(StatusCode::OK))
            }
            () = self.flag.notify.notified() => {
                self.state.canceled.fetch_add(1, Ordering::SeqCst);
                Err(Error::Canceled)
            }
        }
    }

    fn open_response_body(
        self: Box<Self>,
        _head: &ResponseHead,
        _request: &Request,
    ) -> Result<ResponseBody> {
        Ok(ResponseBody::from_bytes("mux"))
    }

    fn canceler(&self) -> Arc<dyn StreamCancel> {
        Arc::clone(&self.flag) as Arc<dyn StreamCancel>
    }
}

fn mux_client(state: &Arc<MuxState>, server: &MockServer) -> Client {
    Client::builder()
        .tls(TlsConfig::new(PlainTls::new(Some(Protocol::Http2))))
        .multiplexer(MockMultiplexer {
            state: Arc::clone(state),
        })
        .dns(StaticDns {
            table: vec![("mux.test", vec![server.addr()])],
        })
        .build()
        .expect("client")
}

fn mux_url(server: &MockServer) -> String {
    format!("https://mux.test:{}/", server.addr().port())
}

fn spawn_text(call: &Call) -> JoinHandle<Result<String>> {
    let call = call.clone();
    tokio::spawn(async move {
        let mut response = call.execute().await?;
        response.text().await
    })
}

async fn joined(task: JoinHandle<Result<String>>) -> Result<String> {
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("call finished in time")
        .expect("task")
}

#[tokio::test]
async fn test_concurrent_streams_share_one_multiplexed_connection() {
    init_tracing();
    let server = MockServer::start().await;
    let state = MuxState::with_limit(2);
    let client = mux_client(&state, &server);

    let first = spawn_text(&client.new_call(get(&mux_url(&server))));
    state.wait_for_streams(1).await;
    let second = spawn_text(&client.new_call(get(&mux_url(&server))));
    state.wait_for_streams(2).await;
    state.release.add_permits(2);

    assert_eq!(joined(first).await.expect("first"), "mux");
    assert_eq!(joined(second).await.expect("second"), "mux");
    assert_eq!(state.handshakes.load(Ordering::SeqCst), 1);
    assert_eq!(server.connection_count(), 1);
    assert_eq!(client.pool().connection_count(), 1);
}

#[tokio::test]
async fn test_stream_limit_bounds_sharing() {
    let server = MockServer::start().await;
    let state = MuxState::with_limit(1);
    let client = mux_client(&state, &server);

    let first = spawn_text(&client.new_call(get(&mux_url(&server))));
    state.wait_for_streams(1).await;
    let second = spawn_text(&client.new_call(get(&mux_url(&server))));
    state.wait_for_streams(2).await;
    state.release.add_permits(2);

    assert_eq!(joined(first).await.expect("first"), "mux");
    assert_eq!(joined(second).await.expect("second"), "mux");
    assert_eq!(state.handshakes.load(Ordering::SeqCst), 2);
    assert_eq!(server.connection_count(), 2);
}

#[tokio::test]
async fn test_cancel_on_multiplexed_call_only_ends_its_stream() {
    let server = MockServer::start().await;
    let state = MuxState::with_limit(2);
    let client = mux_client(&state, &server);

    let canceled = client.new_call(get(&mux_url(&server)));
    let first = spawn_text(&canceled);
    state.wait_for_streams(1).await;
    let second = spawn_text(&client.new_call(get(&mux_url(&server))));
    state.wait_for_streams(2).await;

    canceled.cancel();
    let result = joined(first).await;

    assert!(matches!(result, Err(Error::Canceled)));
    assert_eq!(state.canceled.load(Ordering::SeqCst), 1);

    state.release.add_permits(1);
    assert_eq!(joined(second).await.expect("second"), "mux");
    assert_eq!(state.shutdowns.load(Ordering::SeqCst), 0);
    assert_eq!(state.handshakes.load(Ordering::SeqCst), 1);
    assert_eq!(client.pool().connection_count(), 1);
}
