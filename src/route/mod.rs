//! Connection targets and the paths to reach them.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `address` | [`Address`]: the connection-sharing key |
//! | `proxy` | [`Proxy`] configuration |
//! | `selector` | [`Route`], [`RouteSelector`], [`RouteDatabase`] |
//! | `dns` | [`Dns`] resolver trait and [`SystemDns`] |

// ============================================================================
// Submodules
// ============================================================================

/// Connection target descriptor.
pub mod address;

/// Host name resolution.
pub mod dns;

/// Proxy configuration.
pub mod proxy;

/// Route selection.
pub mod selector;

// ============================================================================
// Re-exports
// ============================================================================

pub use address::Address;
pub use dns::{Dns, SystemDns};
pub use proxy::{Proxy, ProxyType};
pub use selector::{Route, RouteDatabase, RouteSelector};
