//! Client handle and its shared state.
//!
//! # Example
//!
//! ```no_run
//! use callwire::{Client, Request};
//!
//! # async fn example() -> callwire::Result<()> {
//! let client = Client::builder().build()?;
//!
//! let request = Request::get("http://example.com/")?;
//! let mut response = client.new_call(request).execute().await?;
//! println!("{} {}", response.code(), response.text().await?);
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::auth::Authenticator;
use crate::codec::{IoTimeouts, Multiplexer};
use crate::error::{Error, Result};
use crate::http::Request;
use crate::pipeline::Interceptor;
use crate::route::address::url_host;
use crate::route::{Address, Dns};
use crate::tls::TlsConfig;
use crate::transport::ConnectionPool;
use crate::transport::connection::ConnectParams;
use crate::transport::io::limit_from_ms;

use super::builder::ClientBuilder;
use super::call::Call;
use super::config::ClientConfig;
use super::dispatcher::Dispatcher;

// ============================================================================
// Types
// ============================================================================

/// State shared by a client and all of its calls.
pub(crate) struct ClientShared {
    /// Validated configuration.
    pub config: ClientConfig,

    /// Connection pool.
    pub pool: ConnectionPool,

    /// Host name resolver.
    pub dns: Arc<dyn Dns>,

    /// TLS settings for `https` targets; `None` rejects them.
    pub tls: Option<TlsConfig>,

    /// Session factory for multiplexed protocols.
    pub multiplexer: Option<Arc<dyn Multiplexer>>,

    /// Answers origin `401` challenges.
    pub authenticator: Arc<dyn Authenticator>,

    /// Answers proxy `407` challenges.
    pub proxy_authenticator: Arc<dyn Authenticator>,

    /// Stages that run once per call.
    pub interceptors: Vec<Arc<dyn Interceptor>>,

    /// Stages that run once per attempt on a bound connection.
    pub network_interceptors: Vec<Arc<dyn Interceptor>>,

    /// Runs enqueued calls.
    pub dispatcher: Arc<dyn Dispatcher>,
}

impl ClientShared {
    /// Builds the connection-sharing identity for `url`.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] for an `https` URL without TLS settings
    /// - [`Error::InvalidRequest`] for a URL without a host
    pub(crate) fn address_for(&self, url: &Url) -> Result<Address> {
        let https = url.scheme() == "https";
        if https && self.tls.is_none() {
            return Err(Error::config(format!(
                "No TLS connector configured for {url}"
            )));
        }

        let host = url_host(url)
            .ok_or_else(|| Error::invalid_request(format!("URL has no host: {url}")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::invalid_request(format!("URL has no port: {url}")))?;

        Ok(Address::new(host, port, https)
            .with_proxy(self.config.proxy.clone())
            .with_tls(if https { self.tls.clone() } else { None })
            .with_dns(Arc::clone(&self.dns))
            .with_protocols(self.config.protocols.clone())
            .with_proxy_authenticator(Arc::clone(&self.proxy_authenticator)))
    }

    /// Connect and I/O settings for new connections and codecs.
    pub(crate) fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            connect_timeout: limit_from_ms(self.config.connect_timeout_ms),
            timeouts: IoTimeouts {
                read: limit_from_ms(self.config.read_timeout_ms),
                write: limit_from_ms(self.config.write_timeout_ms),
            },
            multiplexer: self.multiplexer.clone(),
            user_agent: self.config.user_agent.clone(),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// HTTP client.
///
/// Cheap to clone; clones share the connection pool, dispatcher and
/// configuration. Create one per application and reuse it.
#[derive(Clone)]
pub struct Client {
    pub(crate) shared: Arc<ClientShared>,
}

// ============================================================================
// Client - Display
// ============================================================================

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.shared.config)
            .field("pool", &self.shared.pool)
            .field("interceptors", &self.shared.interceptors.len())
            .field("network_interceptors", &self.shared.network_interceptors.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Client - Public API
// ============================================================================

impl Client {
    /// Creates a configuration builder.
    #[inline]
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Creates a call for `request`. Nothing is sent until the call runs.
    #[must_use]
    pub fn new_call(&self, request: Request) -> Call {
        Call::new(Arc::clone(&self.shared), request)
    }

    /// Returns a builder seeded with this client's settings.
    ///
    /// The built client shares this client's connection pool and
    /// dispatcher.
    #[must_use]
    pub fn to_builder(&self) -> ClientBuilder {
        ClientBuilder::from_shared(&self.shared)
    }

    /// Returns the configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Returns the connection pool.
    #[inline]
    #[must_use]
    pub fn pool(&self) -> &ConnectionPool {
        &self.shared.pool
    }

    /// Returns the dispatcher.
    #[inline]
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<dyn Dispatcher> {
        &self.shared.dispatcher
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<ClientShared> {
        &self.shared
    }
}

// ============================================================================
// Tests
// ============================================================================
