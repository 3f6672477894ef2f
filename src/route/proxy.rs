//! Proxy configuration types.
//!
//! # Example
//!
//! ```
//! use callwire::Proxy;
//!
//! // Direct connection
//! let direct = Proxy::direct();
//!
//! // HTTP proxy with Basic credentials
//! let proxy = Proxy::http("proxy.example.com", 8080).with_credentials("user", "pass");
//! assert!(proxy.has_auth());
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// ProxyType
// ============================================================================

/// Proxy protocol type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    /// HTTP proxy. Plaintext requests are forwarded, TLS targets are tunneled
    /// with `CONNECT`.
    Http,

    /// Direct connection (no proxy).
    #[default]
    Direct,
}

impl ProxyType {
    /// Returns the string representation.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Direct => "direct",
        }
    }
}

// ============================================================================
// Proxy
// ============================================================================

/// Proxy selection for an address.
///
/// Credentials are not part of proxy identity: two proxies that differ only
/// in credentials share connections.
#[derive(Clone, Serialize, Deserialize)]
pub struct Proxy {
    /// Proxy type.
    #[serde(rename = "type")]
    pub proxy_type: ProxyType,

    /// Proxy hostname.
    #[serde(default)]
    pub host: String,

    /// Proxy port.
    #[serde(default)]
    pub port: u16,

    /// Username for Basic proxy authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    /// Password for Basic proxy authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

// ============================================================================
// Proxy - Constructors
// ============================================================================

impl Proxy {
    /// Creates an HTTP proxy configuration.
    #[must_use]
    pub fn http(host: impl Into<String>, port: u16) -> Self {
        Self {
            proxy_type: ProxyType::Http,
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    /// Creates a direct (no proxy) configuration.
    #[inline]
    #[must_use]
    pub fn direct() -> Self {
        Self {
            proxy_type: ProxyType::Direct,
            host: String::new(),
            port: 0,
            username: None,
            password: None,
        }
    }
}

impl Default for Proxy {
    fn default() -> Self {
        Self::direct()
    }
}

// ============================================================================
// Proxy - Builder Methods
// ============================================================================

impl Proxy {
    /// Sets Basic authentication credentials.
    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

// ============================================================================
// Proxy - Predicates
// ============================================================================

impl Proxy {
    /// Returns `true` if credentials are configured.
    #[inline]
    #[must_use]
    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Returns `true` for an HTTP proxy.
    #[inline]
    #[must_use]
    pub fn is_http(&self) -> bool {
        self.proxy_type == ProxyType::Http
    }

    /// Returns `true` for a direct connection.
    #[inline]
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.proxy_type == ProxyType::Direct
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        match (self.proxy_type, other.proxy_type) {
            (ProxyType::Direct, ProxyType::Direct) => true,
            (ProxyType::Http, ProxyType::Http) => self.host == other.host && self.port == other.port,
            _ => false,
        }
    }
}

impl Eq for Proxy {}

impl std::hash::Hash for Proxy {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.proxy_type.hash(state);
        if self.is_http() {
            self.host.hash(state);
            self.port.hash(state);
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proxy_type {
            ProxyType::Direct => f.write_str("Proxy(direct)"),
            ProxyType::Http => write!(f, "Proxy(http://{}:{})", self.host, self.port),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
