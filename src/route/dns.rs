//! Host name resolution.

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tracing::trace;

use crate::error::{Error, Result};

// ============================================================================
// Dns
// ============================================================================

/// Resolves a host name to socket addresses.
#[async_trait]
pub trait Dns: Send + Sync + 'static {
    /// Returns every address for `host`, in preference order, with `port` applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the host cannot be resolved or has no addresses.
    async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemDns;

#[async_trait]
impl Dns for SystemDns {
    async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| Error::connection(format!("Unable to resolve host {host}: {e}")))?
            .collect();

        if addrs.is_empty() {
            return Err(Error::connection(format!(
                "Unable to resolve host {host}: no addresses"
            )));
        }

        trace!(host, count = addrs.len(), "Resolved host");
        Ok(addrs)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_ip_literal() {
        let addrs = SystemDns.lookup("127.0.0.1", 8080).await.expect("lookup");
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse().expect("addr")]);
    }

    #[tokio::test]
    async fn test_invalid_host_is_connection_error() {
        let err = SystemDns
            .lookup("invalid host name with spaces", 80)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Unable to resolve host"));
    }
}
