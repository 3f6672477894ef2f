//! Client and pool configuration.
//!
//! Both types are plain serde structs so they can be loaded from any serde
//! format. Every field has a default; timeouts of `0` mean "no timeout".
//!
//! # Example
//!
//! ```
//! use callwire::ClientConfig;
//!
//! let config: ClientConfig = serde_json::from_str(
//!     r#"{ "read_timeout_ms": 2500, "pool": { "max_idle_connections": 2 } }"#,
//! ).expect("valid config");
//!
//! assert_eq!(config.read_timeout_ms, 2500);
//! assert_eq!(config.pool.max_idle_connections, 2);
//! assert!(config.follow_redirects);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::route::Proxy;
use crate::tls::Protocol;

// ============================================================================
// PoolConfig
// ============================================================================

/// Connection pool limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept per pool.
    pub max_idle_connections: usize,

    /// Time an idle connection is kept, in milliseconds.
    pub keep_alive_ms: u64,
}

impl PoolConfig {
    /// Default idle connection limit.
    pub const DEFAULT_MAX_IDLE_CONNECTIONS: usize = 5;

    /// Default keep-alive window (5 minutes).
    pub const DEFAULT_KEEP_ALIVE_MS: u64 = 300_000;

    /// Returns the keep-alive window.
    #[inline]
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Checks the limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the keep-alive window is zero.
    pub fn validate(&self) -> Result<()> {
        if self.keep_alive_ms == 0 {
            return Err(Error::config(format!(
                "keep_alive_ms must be positive, got {}",
                self.keep_alive_ms
            )));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_connections: Self::DEFAULT_MAX_IDLE_CONNECTIONS,
            keep_alive_ms: Self::DEFAULT_KEEP_ALIVE_MS,
        }
    }
}

// ============================================================================
// ClientConfig
// ============================================================================

/// Client behavior and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Per-read timeout in milliseconds.
    pub read_timeout_ms: u64,

    /// Per-write timeout in milliseconds.
    pub write_timeout_ms: u64,

    /// Retry requests after connectivity failures.
    pub retry_on_connection_failure: bool,

    /// Follow `3xx` redirects.
    pub follow_redirects: bool,

    /// Follow redirects that switch between `http` and `https`.
    pub follow_ssl_redirects: bool,

    /// Proxy used for every request.
    pub proxy: Proxy,

    /// Protocols offered during TLS negotiation.
    pub protocols: Vec<Protocol>,

    /// Calls the dispatcher runs at once.
    pub max_requests: usize,

    /// Calls to one host the dispatcher runs at once.
    pub max_requests_per_host: usize,

    /// `User-Agent` added when a request has none. Empty sends none.
    pub user_agent: String,

    /// Connection pool limits.
    pub pool: PoolConfig,
}

impl ClientConfig {
    /// Default connect, read and write timeout (10 seconds).
    pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

    /// Default dispatcher limit.
    pub const DEFAULT_MAX_REQUESTS: usize = 64;

    /// Default dispatcher per-host limit.
    pub const DEFAULT_MAX_REQUESTS_PER_HOST: usize = 5;

    /// Checks limits and protocol list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(Error::config("max_requests must be at least 1"));
        }
        if self.max_requests_per_host == 0 {
            return Err(Error::config("max_requests_per_host must be at least 1"));
        }
        if !self.protocols.contains(&Protocol::Http11) {
            return Err(Error::config(format!(
                "protocols must contain http/1.1: {:?}",
                self.protocols
            )));
        }
        if self.proxy.is_http() && (self.proxy.host.is_empty() || self.proxy.port == 0) {
            return Err(Error::config(format!(
                "HTTP proxy needs a host and port, got {}:{}",
                self.proxy.host, self.proxy.port
            )));
        }
        if http::HeaderValue::from_str(&self.user_agent).is_err() {
            return Err(Error::config(format!(
                "user_agent is not a valid header value: {:?}",
                self.user_agent
            )));
        }
        self.pool.validate()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            read_timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            write_timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            retry_on_connection_failure: true,
            follow_redirects: true,
            follow_ssl_redirects: true,
            proxy: Proxy::direct(),
            protocols: vec![Protocol::Http11],
            max_requests: Self::DEFAULT_MAX_REQUESTS,
            max_requests_per_host: Self::DEFAULT_MAX_REQUESTS_PER_HOST,
            user_agent: concat!("callwire/", env!("CARGO_PKG_VERSION")).to_string(),
            pool: PoolConfig::default(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
