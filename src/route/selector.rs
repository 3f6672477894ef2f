//! Route selection and failed-route memory.
//!
//! A [`RouteSelector`] walks the candidate routes of one address: for each
//! proxy it resolves the next-hop host and yields one [`Route`] per socket
//! address. Routes recorded as failed in the shared [`RouteDatabase`] are
//! postponed until every fresh candidate was tried.

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::error::{Error, Result};

use super::address::Address;
use super::proxy::Proxy;

// ============================================================================
// Route
// ============================================================================

/// One concrete path to an address.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Route {
    address: Address,
    proxy: Proxy,
    socket_addr: SocketAddr,
}

impl Route {
    /// Creates a route.
    #[must_use]
    pub fn new(address: Address, proxy: Proxy, socket_addr: SocketAddr) -> Self {
        Self {
            address,
            proxy,
            socket_addr,
        }
    }

    /// Returns the target address.
    #[inline]
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Returns the proxy this route goes through.
    #[inline]
    #[must_use]
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// Returns the socket address dialed: the proxy's or the target's.
    #[inline]
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// Returns `true` if a `CONNECT` tunnel is needed: TLS through an HTTP proxy.
    #[inline]
    #[must_use]
    pub fn requires_tunnel(&self) -> bool {
        self.address.is_https() && self.proxy.is_http()
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("address", &self.address.to_string())
            .field("proxy", &self.proxy)
            .field("socket_addr", &self.socket_addr)
            .finish()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.address, self.socket_addr)
    }
}

// ============================================================================
// RouteDatabase
// ============================================================================

/// Routes that recently failed to connect.
#[derive(Debug, Default)]
pub struct RouteDatabase {
    failed: Mutex<FxHashSet<Route>>,
}

impl RouteDatabase {
    /// Creates an empty database.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a connect failure.
    pub fn failed(&self, route: &Route) {
        debug!(route = %route, "Route marked as failed");
        self.failed.lock().insert(route.clone());
    }

    /// Forgets a failure after a successful connect.
    pub fn connected(&self, route: &Route) {
        self.failed.lock().remove(route);
    }

    /// Returns `true` if `route` failed recently and should be tried last.
    #[must_use]
    pub fn should_postpone(&self, route: &Route) -> bool {
        self.failed.lock().contains(route)
    }

    /// Returns the number of remembered failures.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.failed.lock().len()
    }
}

// ============================================================================
// RouteSelector
// ============================================================================

/// Iterates the candidate routes of one address.
pub struct RouteSelector {
    address: Address,
    database: Arc<RouteDatabase>,
    proxies: Vec<Proxy>,
    next_proxy: usize,
    pending: VecDeque<Route>,
    postponed: Vec<Route>,
}

impl RouteSelector {
    /// Creates a selector for `address`.
    #[must_use]
    pub fn new(address: Address, database: Arc<RouteDatabase>) -> Self {
        let proxies = vec![address.proxy().clone()];
        Self {
            address,
            database,
            proxies,
            next_proxy: 0,
            pending: VecDeque::new(),
            postponed: Vec::new(),
        }
    }

    /// Returns `true` if another route may be produced.
    #[inline]
    #[must_use]
    pub fn has_next(&self) -> bool {
        !self.pending.is_empty() || self.next_proxy < self.proxies.len() || !self.postponed.is_empty()
    }

    /// Returns the next route, resolving the next proxy's host when needed.
    ///
    /// # Errors
    ///
    /// - DNS failures from the address' resolver
    /// - [`Error::Connection`] when no route is left
    pub async fn next(&mut self) -> Result<Route> {
        loop {
            if let Some(route) = self.pending.pop_front() {
                return Ok(route);
            }

            if self.next_proxy < self.proxies.len() {
                let proxy = self.proxies[self.next_proxy].clone();
                self.next_proxy += 1;
                self.reset_next_proxy(proxy).await?;
                continue;
            }

            if !self.postponed.is_empty() {
                self.pending.extend(self.postponed.drain(..));
                continue;
            }

            return Err(Error::connection(format!(
                "No more routes to {}",
                self.address
            )));
        }
    }

    async fn reset_next_proxy(&mut self, proxy: Proxy) -> Result<()> {
        let (host, port) = if proxy.is_http() {
            (proxy.host.clone(), proxy.port)
        } else {
            (self.address.host().to_string(), self.address.port())
        };

        if port == 0 {
            return Err(Error::connection(format!(
                "No route to {host}:{port}; port is out of range"
            )));
        }

        let addrs = self.address.dns().lookup(&host, port).await?;
        if addrs.is_empty() {
            return Err(Error::connection(format!(
                "{host} returned no addresses"
            )));
        }

        for socket_addr in addrs {
            let route = Route::new(self.address.clone(), proxy.clone(), socket_addr);
            if self.database.should_postpone(&route) {
                self.postponed.push(route);
            } else {
                self.pending.push_back(route);
            }
        }

        debug!(
            address = %self.address,
            pending = self.pending.len(),
            postponed = self.postponed.len(),
            "Resolved routes"
        );
        Ok(())
    }
}

impl fmt::Debug for RouteSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteSelector")
            .field("address", &self.address.to_string())
            .field("pending", &self.pending.len())
            .field("postponed", &self.postponed.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
