//! Physical connection: one socket, its handshake and its stream bookkeeping.
//!
//! # Lifecycle
//!
//! 1. [`Connection::new`] - unconnected, registered by its creating allocation
//! 2. `connect` - TCP connect, optional `CONNECT` tunnel, optional TLS + ALPN,
//!    optional multiplexed-session handshake
//! 3. streams - codecs borrow the transport and return it when a body ends
//! 4. `shutdown` - pool eviction or cancellation closes the transport
//!
//! # Bookkeeping
//!
//! The allocation records, `no_new_streams` flag, idle timestamp and success
//! count live in a [`Guarded`] cell and are only touched under the pool lock.
//! The transport itself is behind a separate short-lived mutex and is never
//! held across an await point.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::codec::http1::{self, Http1Codec};
use crate::codec::{Codec, IoTimeouts, Multiplexer, MultiplexedSession, StreamCancel};
use crate::error::{Error, Result, TlsFailure};
use crate::http::{Request, Response, ResponseBody, content_length, wants_close};
use crate::identifiers::{AllocationId, ConnectionId};
use crate::route::{Address, Route};
use crate::tls::{Handshake, Protocol, TlsConfig};

use super::guard::{Guarded, PoolGuard};
use super::io::{BufferedIo, CancelSignal, run_io};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of proxy connections opened while establishing a tunnel.
const MAX_TUNNEL_ATTEMPTS: usize = 21;

/// Read timeout of the extensive health probe.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_millis(1);

// ============================================================================
// Types
// ============================================================================

/// Settings applied while connecting and to codecs created afterwards.
#[derive(Clone, Default)]
pub(crate) struct ConnectParams {
    /// Limit for the TCP connect.
    pub connect_timeout: Option<Duration>,
    /// Read/write limits for tunnel exchanges and codecs.
    pub timeouts: IoTimeouts,
    /// Session factory used when ALPN selects a multiplexed protocol.
    pub multiplexer: Option<Arc<dyn Multiplexer>>,
    /// `User-Agent` sent on tunnel requests.
    pub user_agent: String,
}

/// Registration of one allocation using a connection.
///
/// Holds only a weak reference to the allocation's liveness token: a dead
/// token means the allocation was dropped without being released.
#[derive(Debug, Clone)]
pub(crate) struct AllocationRecord {
    pub id: AllocationId,
    pub token: Weak<()>,
}

/// Pool-guarded state of a connection.
#[derive(Debug, Default)]
pub(crate) struct Bookkeeping {
    /// Allocations currently using this connection.
    pub allocations: Vec<AllocationRecord>,
    /// Once set, never cleared: no further streams may be created.
    pub no_new_streams: bool,
    /// When the last allocation detached. Meaningful only while idle.
    pub idle_at: Option<Instant>,
    /// Streams that completed without error.
    pub success_count: u64,
}

/// Result of protocol negotiation, fixed once connected.
struct Negotiated {
    protocol: Protocol,
    handshake: Option<Handshake>,
    session: Option<Arc<dyn MultiplexedSession>>,
}

/// Outcome of one tunnel exchange.
enum Tunnel {
    Established,
    Reconnect(Request),
}

// ============================================================================
// Connection
// ============================================================================

/// One physical connection to a route.
pub struct Connection {
    id: ConnectionId,
    route: Route,
    book: Guarded<Bookkeeping>,
    link: Mutex<Option<BufferedIo>>,
    negotiated: OnceLock<Negotiated>,
    cancel: Arc<CancelSignal>,
}

impl Connection {
    /// Creates an unconnected connection to `route`.
    pub(crate) fn new(route: Route) -> Self {
        Self {
            id: ConnectionId::next(),
            route,
            book: Guarded::new(Bookkeeping::default()),
            link: Mutex::new(None),
            negotiated: OnceLock::new(),
            cancel: Arc::new(CancelSignal::default()),
        }
    }
}

// ============================================================================
// Connection - Accessors
// ============================================================================

impl Connection {
    /// Returns the connection ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the route this connection was dialed on.
    #[inline]
    #[must_use]
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Returns the negotiated protocol, HTTP/1.1 until connected.
    #[inline]
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.negotiated
            .get()
            .map_or(Protocol::Http11, |negotiated| negotiated.protocol)
    }

    /// Returns the TLS handshake, `None` for plaintext or before connect.
    #[inline]
    #[must_use]
    pub fn handshake(&self) -> Option<&Handshake> {
        self.negotiated
            .get()
            .and_then(|negotiated| negotiated.handshake.as_ref())
    }

    /// Returns `true` once `connect` succeeded.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.negotiated.get().is_some()
    }

    /// Returns `true` if this connection carries a multiplexed session.
    #[inline]
    #[must_use]
    pub fn is_multiplexed(&self) -> bool {
        self.session().is_some()
    }

    /// Returns `true` once the connection was canceled or shut down.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_fired()
    }

    /// Maximum concurrent streams. Live for multiplexed sessions, 1 otherwise
    /// (including while connecting).
    #[must_use]
    pub fn allocation_limit(&self) -> usize {
        self.session()
            .map_or(1, |session| session.max_concurrent_streams())
    }

    /// Returns `true` if requests to `url` may use this connection.
    #[inline]
    #[must_use]
    pub fn supports_url(&self, url: &url::Url) -> bool {
        self.route.address().matches_url(url)
    }

    pub(crate) fn book(&self) -> &Guarded<Bookkeeping> {
        &self.book
    }

    pub(crate) fn cancel_signal(&self) -> Arc<CancelSignal> {
        Arc::clone(&self.cancel)
    }

    fn session(&self) -> Option<&Arc<dyn MultiplexedSession>> {
        self.negotiated
            .get()
            .and_then(|negotiated| negotiated.session.as_ref())
    }
}

// ============================================================================
// Connection - Pool Queries
// ============================================================================

impl Connection {
    /// Returns `true` if a new stream to `address` may be carried here.
    pub(crate) fn is_eligible(&self, guard: &PoolGuard<'_>, address: &Address) -> bool {
        if !self.is_connected() || self.is_closed() || self.route.address() != address {
            return false;
        }
        let book = self.book.lock(guard);
        !book.no_new_streams && book.allocations.len() < self.allocation_limit()
    }
}

// ============================================================================
// Connection - Connect
// ============================================================================

impl Connection {
    /// Establishes the connection. Runs once.
    ///
    /// # Errors
    ///
    /// - [`Error::IllegalState`] if already connected
    /// - [`Error::Canceled`] if canceled meanwhile
    /// - transport, tunnel, TLS and session-handshake failures
    pub(crate) async fn connect(&self, params: &ConnectParams) -> Result<()> {
        if self.is_connected() {
            return Err(Error::illegal_state(format!("{} is already connected", self.id)));
        }

        let address = self.route.address();
        if address.is_https() && address.tls().is_none() {
            return Err(Error::config(format!(
                "No TLS connector configured for {address}"
            )));
        }

        let started = Instant::now();
        let established = tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Canceled),
            result = self.establish(params) => result,
        };

        let (io, negotiated) = match established {
            Ok(established) => established,
            Err(e) => {
                debug!(connection = %self.id, route = %self.route, error = %e, "Connect failed");
                return Err(e);
            }
        };

        if self.is_closed() {
            if let Some(session) = &negotiated.session {
                session.shutdown();
            }
            return Err(Error::Canceled);
        }

        let protocol = negotiated.protocol;
        *self.link.lock() = io;
        if self.negotiated.set(negotiated).is_err() {
            return Err(Error::illegal_state(format!("{} is already connected", self.id)));
        }

        debug!(
            connection = %self.id,
            route = %self.route,
            %protocol,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Connection established"
        );
        Ok(())
    }

    async fn establish(&self, params: &ConnectParams) -> Result<(Option<BufferedIo>, Negotiated)> {
        let io = if self.route.requires_tunnel() {
            self.connect_tunnel(params).await?
        } else {
            self.connect_socket(params).await?
        };

        let address = self.route.address();
        match address.tls() {
            Some(tls) if address.is_https() => self.connect_tls(tls, io, params).await,
            _ => Ok((
                Some(io),
                Negotiated {
                    protocol: Protocol::Http11,
                    handshake: None,
                    session: None,
                },
            )),
        }
    }

    async fn connect_socket(&self, params: &ConnectParams) -> Result<BufferedIo> {
        let addr = self.route.socket_addr();
        let stream = match params.connect_timeout {
            Some(limit) => timeout(limit, TcpStream::connect(addr))
                .await
                .map_err(|_| Error::timeout("connect", limit.as_millis() as u64))??,
            None => TcpStream::connect(addr).await?,
        };
        stream.set_nodelay(true)?;

        trace!(connection = %self.id, %addr, "Socket connected");
        Ok(BufferedIo::new(Box::new(stream)))
    }

    async fn connect_tls(
        &self,
        tls: &TlsConfig,
        io: BufferedIo,
        params: &ConnectParams,
    ) -> Result<(Option<BufferedIo>, Negotiated)> {
        let address = self.route.address();
        let host = address.host();

        let (io, handshake) = tls
            .connector()
            .connect(host, address.protocols(), io.into_inner()?)
            .await?;

        if !tls.hostname_verifier().verify(host, &handshake) {
            return Err(Error::tls(
                TlsFailure::PeerUnverified,
                format!("Hostname {host} not verified"),
            ));
        }
        tls.certificate_pinner()
            .check(host, &handshake.peer_certificates)?;

        let protocol = handshake
            .alpn
            .filter(|protocol| address.protocols().contains(protocol))
            .unwrap_or(Protocol::Http11);

        debug!(
            connection = %self.id,
            host,
            tls_version = %handshake.tls_version,
            %protocol,
            "TLS handshake completed"
        );

        if !protocol.is_multiplexed() {
            return Ok((
                Some(BufferedIo::new(io)),
                Negotiated {
                    protocol,
                    handshake: Some(handshake),
                    session: None,
                },
            ));
        }

        let multiplexer = params.multiplexer.as_ref().ok_or_else(|| {
            Error::protocol(format!("{protocol} negotiated but no multiplexer is installed"))
        })?;
        let session = multiplexer.handshake(io).await?;

        Ok((
            None,
            Negotiated {
                protocol,
                handshake: Some(handshake),
                session: Some(session),
            },
        ))
    }
}

// ============================================================================
// Connection - Tunnel
// ============================================================================

impl Connection {
    async fn connect_tunnel(&self, params: &ConnectParams) -> Result<BufferedIo> {
        let mut request = self.tunnel_request(params)?;

        for attempt in 1..=MAX_TUNNEL_ATTEMPTS {
            let mut io = self.connect_socket(params).await?;
            match self.create_tunnel(&mut io, request, params).await? {
                Tunnel::Established => {
                    debug!(connection = %self.id, attempt, "Tunnel established");
                    return Ok(io);
                }
                Tunnel::Reconnect(next) => {
                    debug!(connection = %self.id, attempt, "Proxy closed after challenge, reconnecting");
                    request = next;
                }
            }
        }

        Err(Error::protocol(format!(
            "Too many tunnel connections attempted: {MAX_TUNNEL_ATTEMPTS}"
        )))
    }

    fn tunnel_request(&self, params: &ConnectParams) -> Result<Request> {
        let address = self.route.address();
        let mut builder = Request::builder()
            .url(format!("{}://{}/", address.scheme(), address.authority()))
            .header("Host", &address.authority())
            .header("Proxy-Connection", "Keep-Alive");
        if !params.user_agent.is_empty() {
            builder = builder.header("User-Agent", &params.user_agent);
        }
        builder.build()
    }

    /// Runs `CONNECT` exchanges on one proxy connection until the tunnel is
    /// up, the proxy wants a fresh connection, or authentication gives up.
    async fn create_tunnel(
        &self,
        io: &mut BufferedIo,
        mut request: Request,
        params: &ConnectParams,
    ) -> Result<Tunnel> {
        let address = self.route.address();
        let request_line = format!("CONNECT {} HTTP/1.1", address.authority());

        loop {
            let mut head = BytesMut::new();
            http1::encode_head(&mut head, &request_line, request.headers());
            run_io(&self.cancel, "write", params.timeouts.write, io.write_all(&head)).await?;
            run_io(&self.cancel, "write", params.timeouts.write, io.flush()).await?;

            let response_head = http1::read_head(io, &self.cancel, params.timeouts.read).await?;
            match response_head.status.as_u16() {
                200 => {
                    // The proxy must not send anything before the TLS handshake.
                    if !io.buffer().is_empty() {
                        return Err(Error::protocol("TLS tunnel buffered too many bytes!"));
                    }
                    return Ok(Tunnel::Established);
                }
                407 => {
                    let length = content_length(&response_head.headers).unwrap_or(0);
                    http1::skip_exact(io, length, &self.cancel, params.timeouts.read).await?;

                    let close = wants_close(&response_head.headers);
                    let challenge = Response::new(request, response_head, ResponseBody::empty());
                    let next = address
                        .proxy_authenticator()
                        .authenticate(Some(&self.route), &challenge)
                        .await?
                        .ok_or_else(|| Error::connection("Failed to authenticate with proxy"))?;

                    if close {
                        return Ok(Tunnel::Reconnect(next));
                    }
                    request = next;
                }
                code => {
                    return Err(Error::connection(format!(
                        "Unexpected response code for CONNECT: {code}"
                    )));
                }
            }
        }
    }
}

// ============================================================================
// Connection - Streams
// ============================================================================

impl Connection {
    /// Creates a codec for one new stream.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionClosed`] if the transport is gone or in use
    /// - session errors for multiplexed connections
    pub(crate) fn new_codec(self: &Arc<Self>, timeouts: IoTimeouts) -> Result<Box<dyn Codec>> {
        if let Some(session) = self.session() {
            return session.new_codec(timeouts);
        }

        let io = self.take_io().ok_or(Error::ConnectionClosed)?;
        Ok(Box::new(Http1Codec::new(Arc::clone(self), io, timeouts)))
    }

    /// Checks whether the connection can carry a new stream.
    ///
    /// The extensive check reads with a 1 ms timeout: a timeout means the
    /// peer is quiet and the connection is healthy, end of stream or an
    /// error means it is not. Bytes read are kept for the next stream.
    pub(crate) async fn is_healthy(&self, extensive: bool) -> bool {
        if self.is_closed() {
            return false;
        }

        if let Some(session) = self.session() {
            return !session.is_shutdown();
        }

        if !extensive {
            return self.link.lock().is_some();
        }

        let Some(mut io) = self.take_io() else {
            return false;
        };

        let healthy = match timeout(HEALTH_PROBE_TIMEOUT, io.fill()).await {
            Err(_) => true,
            Ok(Ok(0)) => false,
            Ok(Ok(_)) => true,
            Ok(Err(_)) => false,
        };

        if healthy {
            self.restore_io(io);
        } else {
            trace!(connection = %self.id, "Health probe failed");
        }
        healthy
    }

    /// Takes the transport out for exclusive use.
    pub(crate) fn take_io(&self) -> Option<BufferedIo> {
        self.link.lock().take()
    }

    /// Returns the transport after a stream ended cleanly.
    pub(crate) fn restore_io(&self, io: BufferedIo) {
        if self.is_closed() {
            return;
        }
        *self.link.lock() = Some(io);
    }

    /// Closes the transport. In-flight I/O fails with [`Error::Canceled`].
    pub(crate) fn shutdown(&self) {
        if self.cancel.is_fired() {
            return;
        }
        self.cancel.fire();
        let io = self.link.lock().take();
        drop(io);
        if let Some(session) = self.session() {
            session.shutdown();
        }
        debug!(connection = %self.id, route = %self.route, "Connection closed");
    }
}

#[cfg(test)]
impl Connection {
    /// Creates a connection that reports as connected over plain HTTP/1.1,
    /// optionally with a transport.
    pub(crate) fn connected_for_tests(route: Route, io: Option<BufferedIo>) -> Self {
        let connection = Self::new(route);
        *connection.link.lock() = io;
        let _ = connection.negotiated.set(Negotiated {
            protocol: Protocol::Http11,
            handshake: None,
            session: None,
        });
        connection
    }
}

impl StreamCancel for Connection {
    fn cancel(&self) {
        debug!(connection = %self.id, "Connection canceled");
        self.shutdown();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("protocol", &self.protocol())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
