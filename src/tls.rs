//! TLS collaborator traits and negotiated-session metadata.
//!
//! The engine never performs cryptography itself. A [`TlsConnector`] wraps a
//! connected transport and reports the [`Handshake`]; the engine then applies
//! the [`HostnameVerifier`] and [`CertificatePinner`] and picks the
//! application [`Protocol`] from the negotiated ALPN value.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::transport::BoxedIo;

// ============================================================================
// Protocol
// ============================================================================

/// Application protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Protocol {
    /// One request/response stream at a time.
    #[default]
    #[serde(rename = "http/1.1")]
    Http11,

    /// Multiplexed streams, served by a [`Multiplexer`](crate::codec::Multiplexer).
    #[serde(rename = "h2")]
    Http2,
}

impl Protocol {
    /// Returns the ALPN identifier.
    #[inline]
    #[must_use]
    pub fn alpn_id(&self) -> &'static str {
        match self {
            Self::Http11 => "http/1.1",
            Self::Http2 => "h2",
        }
    }

    /// Parses an ALPN identifier.
    #[must_use]
    pub fn from_alpn(id: &[u8]) -> Option<Self> {
        match id {
            b"http/1.1" => Some(Self::Http11),
            b"h2" => Some(Self::Http2),
            _ => None,
        }
    }

    /// Returns `true` if this protocol carries many concurrent streams.
    #[inline]
    #[must_use]
    pub fn is_multiplexed(&self) -> bool {
        matches!(self, Self::Http2)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.alpn_id())
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Result of a completed TLS handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// TLS version, e.g. `TLSv1.3`.
    pub tls_version: String,
    /// Negotiated cipher suite name.
    pub cipher_suite: String,
    /// Peer certificate chain, DER encoded, leaf first.
    pub peer_certificates: Vec<Bytes>,
    /// Protocol selected through ALPN, if any.
    pub alpn: Option<Protocol>,
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Performs the TLS handshake over a connected transport.
#[async_trait]
pub trait TlsConnector: Send + Sync + 'static {
    /// Runs the handshake for `host`, offering `alpn` in preference order.
    ///
    /// Certificate-chain rejections should be reported as
    /// [`TlsFailure::Certificate`](crate::error::TlsFailure::Certificate) so
    /// they are never retried.
    async fn connect(&self, host: &str, alpn: &[Protocol], io: BoxedIo)
    -> Result<(BoxedIo, Handshake)>;
}

/// Decides whether a handshake is acceptable for a host name.
pub trait HostnameVerifier: Send + Sync + 'static {
    /// Returns `true` if `handshake` authenticates `host`.
    fn verify(&self, host: &str, handshake: &Handshake) -> bool;
}

/// Checks the peer certificate chain against configured pins.
pub trait CertificatePinner: Send + Sync + 'static {
    /// Fails with a peer-verification error when no pin matches.
    ///
    /// # Errors
    ///
    /// [`Error::Tls`](crate::Error::Tls) with
    /// [`TlsFailure::PeerUnverified`](crate::error::TlsFailure::PeerUnverified).
    fn check(&self, host: &str, peer_certificates: &[Bytes]) -> Result<()>;
}

/// Accepts whatever the connector accepted.
///
/// Suitable when the [`TlsConnector`] already verifies host names.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectorVerified;

impl HostnameVerifier for ConnectorVerified {
    fn verify(&self, _host: &str, _handshake: &Handshake) -> bool {
        true
    }
}

/// Pins nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPins;

impl CertificatePinner for NoPins {
    fn check(&self, _host: &str, _peer_certificates: &[Bytes]) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// TlsConfig
// ============================================================================

/// TLS parameters of an [`Address`](crate::route::Address).
///
/// Two configs are equal only if they share the same collaborator instances.
#[derive(Clone)]
pub struct TlsConfig {
    connector: Arc<dyn TlsConnector>,
    hostname_verifier: Arc<dyn HostnameVerifier>,
    certificate_pinner: Arc<dyn CertificatePinner>,
}

impl TlsConfig {
    /// Creates a config with connector-side host verification and no pins.
    #[must_use]
    pub fn new(connector: Arc<dyn TlsConnector>) -> Self {
        Self {
            connector,
            hostname_verifier: Arc::new(ConnectorVerified),
            certificate_pinner: Arc::new(NoPins),
        }
    }

    /// Sets the hostname verifier.
    #[inline]
    #[must_use]
    pub fn with_hostname_verifier(mut self, verifier: Arc<dyn HostnameVerifier>) -> Self {
        self.hostname_verifier = verifier;
        self
    }

    /// Sets the certificate pinner.
    #[inline]
    #[must_use]
    pub fn with_certificate_pinner(mut self, pinner: Arc<dyn CertificatePinner>) -> Self {
        self.certificate_pinner = pinner;
        self
    }

    /// Returns the connector.
    #[inline]
    #[must_use]
    pub fn connector(&self) -> &Arc<dyn TlsConnector> {
        &self.connector
    }

    /// Returns the hostname verifier.
    #[inline]
    #[must_use]
    pub fn hostname_verifier(&self) -> &Arc<dyn HostnameVerifier> {
        &self.hostname_verifier
    }

    /// Returns the certificate pinner.
    #[inline]
    #[must_use]
    pub fn certificate_pinner(&self) -> &Arc<dyn CertificatePinner> {
        &self.certificate_pinner
    }
}

impl PartialEq for TlsConfig {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.connector, &other.connector)
            && Arc::ptr_eq(&self.hostname_verifier, &other.hostname_verifier)
            && Arc::ptr_eq(&self.certificate_pinner, &other.certificate_pinner)
    }
}

impl Eq for TlsConfig {}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
