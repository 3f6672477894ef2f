//! callwire - Pooled HTTP client engine.
//!
//! This library turns logical requests into bytes on reusable connections,
//! recovers from transient failures, and follows redirects and auth
//! challenges, while sharing a bounded set of connections across many
//! concurrent calls.
//!
//! # Architecture
//!
//! Every call runs through an ordered pipeline of interceptors:
//!
//! ```text
//! Call ─► application interceptors
//!      ─► RetryAndFollowUp    (owns the StreamAllocation)
//!      ─► Bridge              (default headers)
//!      ─► Connect             (pool lookup or new connection, codec)
//!      ─► network interceptors
//!      ─► CallServer          (wire exchange)
//! ```
//!
//! Key design principles:
//!
//! - One [`ConnectionPool`] per client, guarded by a single lock; no I/O
//!   happens while it is held
//! - A [`StreamAllocation`] binds one call to at most one connection and one
//!   stream at a time
//! - Recoverable failures are retried inside the pipeline; callers see
//!   exactly one response or one error per call
//! - TLS, DNS and multiplexed framing are pluggable collaborators
//!
//! # Quick Start
//!
//! ```no_run
//! use callwire::{Client, Request, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::builder().build()?;
//!
//!     let request = Request::get("http://example.com/")?;
//!     let mut response = client.new_call(request).execute().await?;
//!
//!     println!("{} {}", response.code(), response.text().await?);
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | [`Client`], [`ClientBuilder`], [`Call`], configuration, dispatcher |
//! | [`http`](mod@crate::http) | [`Request`], [`Response`] and body types |
//! | [`pipeline`] | [`Interceptor`] trait and [`Chain`] |
//! | [`transport`] | [`ConnectionPool`], [`StreamAllocation`], [`Connection`] |
//! | [`codec`] | [`Codec`] trait, HTTP/1.1 codec, multiplexer traits |
//! | [`route`] | [`Address`], [`Route`], proxies, DNS |
//! | [`tls`] | TLS collaborator traits and [`Handshake`] |
//! | [`auth`] | [`Authenticator`] trait and Basic authentication |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |

// ============================================================================
// Modules
// ============================================================================

/// Authentication challenge handling.
pub mod auth;

/// Client entry point: builder, configuration, calls and dispatcher.
///
/// Use [`Client::builder()`] to create a configured client.
pub mod client;

/// Wire codecs.
///
/// The HTTP/1.1 codec lives here; multiplexed protocols plug in through
/// [`Multiplexer`].
pub mod codec;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Request and response types.
pub mod http;

/// Type-safe identifiers for logs.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Interceptor pipeline.
pub mod pipeline;

/// Addresses, routes, proxies and name resolution.
pub mod route;

/// TLS collaborator traits.
pub mod tls;

/// Connection management: pool, allocation and physical connections.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Client types
pub use client::{
    AsyncCall, Call, Callback, Client, ClientBuilder, ClientConfig, Dispatcher, PoolConfig,
    TokioDispatcher,
};

// Request and response types
pub use crate::http::{
    BodySource, BodyStream, Request, RequestBody, RequestBuilder, Response, ResponseBody,
    ResponseHead,
};

// Pipeline types
pub use pipeline::{Chain, Interceptor};

// Connection types
pub use transport::{CleanupOutcome, Connection, ConnectionPool, StreamAllocation};

// Codec types
pub use codec::{Codec, IoTimeouts, MultiplexedSession, Multiplexer, StreamCancel};

// Route types
pub use route::{Address, Dns, Proxy, ProxyType, Route, RouteDatabase, SystemDns};

// TLS types
pub use tls::{CertificatePinner, Handshake, HostnameVerifier, Protocol, TlsConfig, TlsConnector};

// Auth types
pub use auth::{Authenticator, BasicAuthenticator, NoAuthenticator};

// Error types
pub use error::{Error, ResetCode, Result, TlsFailure};

// Identifier types
pub use identifiers::{AllocationId, CallId, CodecId, ConnectionId};
