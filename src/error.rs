//! Error types for the client engine.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use callwire::{Client, Request, Result};
//!
//! async fn example(client: &Client) -> Result<()> {
//!     let request = Request::get("http://example.com/")?;
//!     let response = client.new_call(request).execute().await?;
//!     println!("{}", response.status());
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`], [`Error::InvalidRequest`] |
//! | Route | [`Error::Route`] |
//! | Transport | [`Error::Io`], [`Error::Connection`], [`Error::ConnectionClosed`], [`Error::Timeout`], [`Error::StreamReset`], [`Error::ConnectionShutdown`] |
//! | Protocol | [`Error::Protocol`], [`Error::TooManyFollowUps`], [`Error::UnreplayableBody`] |
//! | Security | [`Error::Tls`] |
//! | Lifecycle | [`Error::Canceled`], [`Error::IllegalState`] |
//! | External | [`Error::Url`] |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use url::ParseError as UrlError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Supporting Types
// ============================================================================

/// Reset code carried by a multiplexed stream reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetCode {
    /// The peer refused the stream before doing any work on it.
    RefusedStream,
    /// The stream was canceled.
    Cancel,
    /// The peer detected a protocol violation.
    ProtocolError,
    /// Any other reset code, as sent on the wire.
    Other(u32),
}

impl fmt::Display for ResetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RefusedStream => f.write_str("REFUSED_STREAM"),
            Self::Cancel => f.write_str("CANCEL"),
            Self::ProtocolError => f.write_str("PROTOCOL_ERROR"),
            Self::Other(code) => write!(f, "0x{code:x}"),
        }
    }
}

/// Kind of TLS failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TlsFailure {
    /// Handshake failed for a reason unrelated to the certificate chain.
    Handshake,
    /// The certificate chain was rejected.
    Certificate,
    /// The peer could not be verified (hostname mismatch or pinning failure).
    PeerUnverified,
}

impl fmt::Display for TlsFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handshake => f.write_str("handshake"),
            Self::Certificate => f.write_str("certificate"),
            Self::PeerUnverified => f.write_str("peer unverified"),
        }
    }
}

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes relevant context for debugging.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when client or pool configuration is invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    /// Request could not be built.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// Description of the problem.
        message: String,
    },

    // ========================================================================
    // Route Errors
    // ========================================================================
    /// No connection could be established to the target.
    ///
    /// The request was never sent. Wraps the last connect failure.
    #[error("Failed to connect to {address}: {source}")]
    Route {
        /// Target address (`host:port`).
        address: String,
        /// The last connect failure.
        #[source]
        source: Box<Error>,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// Connection-level failure with a message (tunnel, DNS, routing).
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Peer closed the connection unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Operation timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Operation that timed out (`connect`, `read`, `write`).
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Multiplexed stream was reset by the peer.
    #[error("Stream was reset: {code}")]
    StreamReset {
        /// Reset code.
        code: ResetCode,
    },

    /// Multiplexed connection was shut down before the stream could start.
    #[error("Connection shut down")]
    ConnectionShutdown,

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Protocol violation or unexpected response.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Follow-up limit exceeded.
    #[error("Too many follow-up requests: {count}")]
    TooManyFollowUps {
        /// Follow-ups attempted.
        count: usize,
    },

    /// A follow-up would replay a single-use request body.
    #[error("Cannot retry streamed HTTP body (status {status})")]
    UnreplayableBody {
        /// Status code that asked for the follow-up.
        status: u16,
    },

    // ========================================================================
    // Security Errors
    // ========================================================================
    /// TLS failure.
    #[error("TLS {kind} failure: {message}")]
    Tls {
        /// Failure kind.
        kind: TlsFailure,
        /// Description.
        message: String,
    },

    // ========================================================================
    // Lifecycle Errors
    // ========================================================================
    /// The call was canceled.
    #[error("Canceled")]
    Canceled,

    /// API misuse or a broken stage contract.
    #[error("Illegal state: {message}")]
    IllegalState {
        /// Description of the violated contract.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// URL parse error.
    #[error("URL error: {0}")]
    Url(#[from] UrlError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid request error.
    #[inline]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Wraps a connect failure as a route failure.
    #[inline]
    pub fn route(address: impl Into<String>, source: Error) -> Self {
        Self::Route {
            address: address.into(),
            source: Box::new(source),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Creates a stream reset error.
    #[inline]
    pub fn stream_reset(code: ResetCode) -> Self {
        Self::StreamReset { code }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates a TLS error.
    #[inline]
    pub fn tls(kind: TlsFailure, message: impl Into<String>) -> Self {
        Self::Tls {
            kind,
            message: message.into(),
        }
    }

    /// Creates an illegal state error.
    #[inline]
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Returns `true` if the call was canceled.
    #[inline]
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Returns `true` if this is a route failure.
    #[inline]
    #[must_use]
    pub fn is_route_failure(&self) -> bool {
        matches!(self, Self::Route { .. })
    }

    /// Returns `true` if this is a TLS certificate or peer verification failure.
    #[inline]
    #[must_use]
    pub fn is_security_error(&self) -> bool {
        matches!(
            self,
            Self::Tls {
                kind: TlsFailure::Certificate | TlsFailure::PeerUnverified,
                ..
            }
        )
    }

    /// Returns `true` if this is a protocol failure.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::TooManyFollowUps { .. } | Self::UnreplayableBody { .. }
        )
    }

    /// Returns `true` if this is a transport-level error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionClosed
                | Self::ConnectionShutdown
                | Self::StreamReset { .. }
                | Self::Timeout { .. }
                | Self::Io(_)
        )
    }

    /// Returns `true` if a fresh attempt may succeed.
    ///
    /// `request_send_started` tells whether request bytes may already have
    /// reached the server. Timeouts are only retried before that point.
    #[must_use]
    pub fn is_recoverable(&self, request_send_started: bool) -> bool {
        match self {
            Self::Route { source, .. } => source.is_recoverable(request_send_started),
            Self::Protocol { .. }
            | Self::TooManyFollowUps { .. }
            | Self::UnreplayableBody { .. }
            | Self::Canceled
            | Self::IllegalState { .. }
            | Self::Config { .. }
            | Self::InvalidRequest { .. }
            | Self::Url(_) => false,
            Self::Tls { kind, .. } => *kind == TlsFailure::Handshake,
            Self::Io(e) if e.kind() == std::io::ErrorKind::Interrupted => false,
            err if err.is_timeout() => !request_send_started,
            _ => true,
        }
    }

    /// Returns the innermost connect failure for route errors, `self` otherwise.
    #[must_use]
    pub fn last_connect_error(&self) -> &Error {
        match self {
            Self::Route { source, .. } => source.last_connect_error(),
            other => other,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
