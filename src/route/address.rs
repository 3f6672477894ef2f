//! Connection target descriptor.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use url::{Host, Url};

use crate::auth::{Authenticator, NoAuthenticator};
use crate::error::{Error, Result};
use crate::tls::{Protocol, TlsConfig};

use super::dns::{Dns, SystemDns};
use super::proxy::Proxy;

// ============================================================================
// Address
// ============================================================================

/// Everything that decides whether two requests may share a connection.
///
/// Collaborators (DNS, TLS, proxy authenticator) compare by identity, so
/// addresses built by the same client for the same origin are equal.
#[derive(Clone)]
pub struct Address {
    https: bool,
    host: String,
    port: u16,
    proxy: Proxy,
    tls: Option<TlsConfig>,
    dns: Arc<dyn Dns>,
    protocols: Vec<Protocol>,
    proxy_authenticator: Arc<dyn Authenticator>,
}

impl Address {
    /// Creates a direct, HTTP/1.1-only address with the system resolver.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, https: bool) -> Self {
        Self {
            https,
            host: host.into(),
            port,
            proxy: Proxy::direct(),
            tls: None,
            dns: Arc::new(SystemDns),
            protocols: vec![Protocol::Http11],
            proxy_authenticator: Arc::new(NoAuthenticator),
        }
    }

    /// Creates an address for the origin of `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if `url` has no host or port.
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url_host(url)
            .ok_or_else(|| Error::invalid_request(format!("URL has no host: {url}")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::invalid_request(format!("URL has no port: {url}")))?;

        Ok(Self::new(host, port, url.scheme() == "https"))
    }

    /// Sets the proxy.
    #[inline]
    #[must_use]
    pub fn with_proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = proxy;
        self
    }

    /// Sets TLS parameters.
    #[inline]
    #[must_use]
    pub fn with_tls(mut self, tls: Option<TlsConfig>) -> Self {
        self.tls = tls;
        self
    }

    /// Sets the resolver.
    #[inline]
    #[must_use]
    pub fn with_dns(mut self, dns: Arc<dyn Dns>) -> Self {
        self.dns = dns;
        self
    }

    /// Sets the protocols offered during ALPN, in preference order.
    #[inline]
    #[must_use]
    pub fn with_protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.protocols = protocols;
        self
    }

    /// Sets the authenticator answering `407` challenges.
    #[inline]
    #[must_use]
    pub fn with_proxy_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.proxy_authenticator = authenticator;
        self
    }
}

// ============================================================================
// Address - Accessors
// ============================================================================

impl Address {
    /// Returns `true` for TLS targets.
    #[inline]
    #[must_use]
    pub fn is_https(&self) -> bool {
        self.https
    }

    /// Returns the target host.
    #[inline]
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Returns the target port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns `host:port`.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Returns the scheme.
    #[inline]
    #[must_use]
    pub fn scheme(&self) -> &'static str {
        if self.https { "https" } else { "http" }
    }

    /// Returns the proxy.
    #[inline]
    #[must_use]
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Returns TLS parameters, `None` for plaintext.
    #[inline]
    #[must_use]
    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    /// Returns the resolver.
    #[inline]
    #[must_use]
    pub fn dns(&self) -> &Arc<dyn Dns> {
        &self.dns
    }

    /// Returns the offered protocols.
    #[inline]
    #[must_use]
    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    /// Returns the proxy authenticator.
    #[inline]
    #[must_use]
    pub fn proxy_authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.proxy_authenticator
    }

    /// Returns `true` if requests to `url` can use connections to this address.
    #[must_use]
    pub fn matches_url(&self, url: &Url) -> bool {
        url_host(url).as_deref() == Some(self.host.as_str())
            && url.port_or_known_default() == Some(self.port)
            && (url.scheme() == "https") == self.https
    }
}

/// Returns the host of `url` without IPv6 brackets.
pub(crate) fn url_host(url: &Url) -> Option<String> {
    match url.host()? {
        Host::Domain(domain) if !domain.is_empty() => Some(domain.to_string()),
        Host::Domain(_) => None,
        Host::Ipv4(addr) => Some(addr.to_string()),
        Host::Ipv6(addr) => Some(addr.to_string()),
    }
}

// ============================================================================
// Address - Identity
// ============================================================================

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.https == other.https
            && self.host == other.host
            && self.port == other.port
            && self.proxy == other.proxy
            && self.tls == other.tls
            && self.protocols == other.protocols
            && Arc::ptr_eq(&self.dns, &other.dns)
            && Arc::ptr_eq(&self.proxy_authenticator, &other.proxy_authenticator)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.https.hash(state);
        self.host.hash(state);
        self.port.hash(state);
        self.proxy.hash(state);
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("scheme", &self.scheme())
            .field("authority", &self.authority())
            .field("proxy", &self.proxy)
            .field("protocols", &self.protocols)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme(), self.authority())
    }
}

// ============================================================================
// Tests
// ============================================================================
