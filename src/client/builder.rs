//! Builder pattern for client configuration.
//!
//! Provides a fluent API for configuring and creating [`Client`] instances.
//!
//! # Example
//!
//! ```
//! use callwire::{Client, Proxy};
//!
//! # fn example() -> callwire::Result<()> {
//! let client = Client::builder()
//!     .connect_timeout_ms(5_000)
//!     .proxy(Proxy::http("proxy.internal", 3128).with_credentials("svc", "secret"))
//!     .follow_ssl_redirects(false)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use crate::auth::{Authenticator, BasicAuthenticator, NoAuthenticator};
use crate::codec::Multiplexer;
use crate::error::{Error, Result};
use crate::pipeline::Interceptor;
use crate::route::{Dns, Proxy, SystemDns};
use crate::tls::{Protocol, TlsConfig};
use crate::transport::ConnectionPool;

use super::config::{ClientConfig, PoolConfig};
use super::core::{Client, ClientShared};
use super::dispatcher::{Dispatcher, TokioDispatcher};

// ============================================================================
// ClientBuilder
// ============================================================================

/// Builder for configuring a [`Client`] instance.
///
/// Use [`Client::builder()`] to create a new builder.
#[derive(Clone, Default)]
pub struct ClientBuilder {
    /// Behavior and limits.
    config: ClientConfig,
    /// Pool shared with another client.
    pool: Option<ConnectionPool>,
    /// Resolver override.
    dns: Option<Arc<dyn Dns>>,
    /// TLS settings for `https`.
    tls: Option<TlsConfig>,
    /// Multiplexed session factory.
    multiplexer: Option<Arc<dyn Multiplexer>>,
    /// Origin challenge handler.
    authenticator: Option<Arc<dyn Authenticator>>,
    /// Proxy challenge handler.
    proxy_authenticator: Option<Arc<dyn Authenticator>>,
    /// Application interceptors, outermost first.
    interceptors: Vec<Arc<dyn Interceptor>>,
    /// Network interceptors, outermost first.
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    /// Dispatcher override.
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

// ============================================================================
// ClientBuilder - Display
// ============================================================================

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("shared_pool", &self.pool.is_some())
            .field("tls", &self.tls.is_some())
            .field("multiplexer", &self.multiplexer.is_some())
            .field("interceptors", &self.interceptors.len())
            .field("network_interceptors", &self.network_interceptors.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// ClientBuilder - Constructors
// ============================================================================

impl ClientBuilder {
    /// Creates a builder with default configuration.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder that shares `shared`'s pool and dispatcher.
    pub(crate) fn from_shared(shared: &ClientShared) -> Self {
        Self {
            config: shared.config.clone(),
            pool: Some(shared.pool.clone()),
            dns: Some(Arc::clone(&shared.dns)),
            tls: shared.tls.clone(),
            multiplexer: shared.multiplexer.clone(),
            authenticator: Some(Arc::clone(&shared.authenticator)),
            proxy_authenticator: Some(Arc::clone(&shared.proxy_authenticator)),
            interceptors: shared.interceptors.clone(),
            network_interceptors: shared.network_interceptors.clone(),
            dispatcher: Some(Arc::clone(&shared.dispatcher)),
        }
    }
}

// ============================================================================
// ClientBuilder - Settings
// ============================================================================

impl ClientBuilder {
    /// Replaces the whole configuration.
    #[inline]
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the TCP connect timeout. `0` waits forever.
    #[inline]
    #[must_use]
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    /// Sets the per-read timeout. `0` waits forever.
    #[inline]
    #[must_use]
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Sets the per-write timeout. `0` waits forever.
    #[inline]
    #[must_use]
    pub fn write_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_timeout_ms = ms;
        self
    }

    /// Enables or disables retries after connectivity failures.
    #[inline]
    #[must_use]
    pub fn retry_on_connection_failure(mut self, enabled: bool) -> Self {
        self.config.retry_on_connection_failure = enabled;
        self
    }

    /// Enables or disables redirect following.
    #[inline]
    #[must_use]
    pub fn follow_redirects(mut self, enabled: bool) -> Self {
        self.config.follow_redirects = enabled;
        self
    }

    /// Enables or disables redirects between `http` and `https`.
    #[inline]
    #[must_use]
    pub fn follow_ssl_redirects(mut self, enabled: bool) -> Self {
        self.config.follow_ssl_redirects = enabled;
        self
    }

    /// Routes every request through `proxy`.
    ///
    /// A proxy with credentials answers `407` challenges with Basic
    /// authentication unless a proxy authenticator is set.
    #[inline]
    #[must_use]
    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.config.proxy = proxy;
        self
    }

    /// Sets the protocols offered during TLS negotiation.
    #[inline]
    #[must_use]
    pub fn protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.config.protocols = protocols;
        self
    }

    /// Sets the default `User-Agent`.
    #[inline]
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Sets the dispatcher's global limit.
    #[inline]
    #[must_use]
    pub fn max_requests(mut self, max: usize) -> Self {
        self.config.max_requests = max;
        self
    }

    /// Sets the dispatcher's per-host limit.
    #[inline]
    #[must_use]
    pub fn max_requests_per_host(mut self, max: usize) -> Self {
        self.config.max_requests_per_host = max;
        self
    }

    /// Sets the pool limits used when the builder creates the pool.
    #[inline]
    #[must_use]
    pub fn pool_config(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }
}

// ============================================================================
// ClientBuilder - Collaborators
// ============================================================================

impl ClientBuilder {
    /// Shares an existing pool instead of creating one.
    #[inline]
    #[must_use]
    pub fn connection_pool(mut self, pool: ConnectionPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sets the host name resolver.
    #[must_use]
    pub fn dns(mut self, dns: impl Dns) -> Self {
        self.dns = Some(Arc::new(dns));
        self
    }

    /// Enables `https` targets.
    #[inline]
    #[must_use]
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Sets the session factory for `h2` and offers `h2` during negotiation.
    #[must_use]
    pub fn multiplexer(mut self, multiplexer: impl Multiplexer) -> Self {
        self.multiplexer = Some(Arc::new(multiplexer));
        self
    }

    /// Sets the handler for origin `401` challenges.
    #[must_use]
    pub fn authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Sets the handler for proxy `407` challenges.
    #[must_use]
    pub fn proxy_authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.proxy_authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Appends an application interceptor.
    #[must_use]
    pub fn interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Appends a network interceptor.
    #[must_use]
    pub fn network_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.network_interceptors.push(Arc::new(interceptor));
        self
    }

    /// Sets the dispatcher that runs enqueued calls.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: impl Dispatcher) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    /// Builds the client with validation.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if a limit, timeout or protocol setting is invalid
    /// - [`Error::Config`] if `h2` is offered without a multiplexer
    pub fn build(self) -> Result<Client> {
        let config = self.validate_config()?;
        let pool = match self.pool {
            Some(pool) => pool,
            None => ConnectionPool::new(&config.pool)?,
        };

        let dispatcher = self.dispatcher.unwrap_or_else(|| {
            Arc::new(TokioDispatcher::new(
                config.max_requests,
                config.max_requests_per_host,
            ))
        });

        let proxy_authenticator = self
            .proxy_authenticator
            .unwrap_or_else(|| default_proxy_authenticator(&config.proxy));

        let shared = ClientShared {
            pool,
            dns: self.dns.unwrap_or_else(|| Arc::new(SystemDns)),
            tls: self.tls,
            multiplexer: self.multiplexer,
            authenticator: self
                .authenticator
                .unwrap_or_else(|| Arc::new(NoAuthenticator)),
            proxy_authenticator,
            interceptors: self.interceptors,
            network_interceptors: self.network_interceptors,
            dispatcher,
            config,
        };

        Ok(Client {
            shared: Arc::new(shared),
        })
    }
}

// ============================================================================
// Validation
// ============================================================================

impl ClientBuilder {
    /// Validates the configuration and completes the protocol list.
    fn validate_config(&self) -> Result<ClientConfig> {
        let mut config = self.config.clone();

        if self.multiplexer.is_some() && !config.protocols.contains(&Protocol::Http2) {
            config.protocols.push(Protocol::Http2);
        }

        if self.multiplexer.is_none() && config.protocols.contains(&Protocol::Http2) {
            return Err(Error::config(
                "h2 is offered but no multiplexer is set. Use .multiplexer() to set one.",
            ));
        }

        config.validate()?;
        Ok(config)
    }
}

fn default_proxy_authenticator(proxy: &Proxy) -> Arc<dyn Authenticator> {
    match (&proxy.username, &proxy.password) {
        (Some(username), Some(password)) if proxy.is_http() => {
            Arc::new(BasicAuthenticator::for_proxy(username, password))
        }
        _ => Arc::new(NoAuthenticator),
    }
}

// ============================================================================
// Tests
// ============================================================================
