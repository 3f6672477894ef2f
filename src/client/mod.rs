//! Client entry point.
//!
//! # Components
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Client`] | Shared pool, configuration and pipeline |
//! | [`ClientBuilder`] | Fluent configuration builder |
//! | [`ClientConfig`] | Serde-loadable behavior and limits |
//! | [`PoolConfig`] | Connection pool limits |
//! | [`Call`] | One logical request, executed once |
//! | [`Dispatcher`] | Scheduler for enqueued calls |
//!
//! # Example
//!
//! ```no_run
//! use callwire::{Client, Request, Result};
//!
//! # async fn example() -> Result<()> {
//! let client = Client::builder().read_timeout_ms(2_000).build()?;
//!
//! let mut response = client
//!     .new_call(Request::get("http://example.com/")?)
//!     .execute()
//!     .await?;
//! let body = response.text().await?;
//! # drop(body);
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Submodules
// ============================================================================

/// Fluent builder for client configuration.
pub mod builder;

/// Single-execution call handle.
pub mod call;

/// Configuration types.
pub mod config;

/// Client handle and shared state.
pub mod core;

/// Enqueued call scheduling.
pub mod dispatcher;

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::ClientBuilder;
pub use call::Call;
pub use config::{ClientConfig, PoolConfig};
pub use core::Client;
pub(crate) use core::ClientShared;
pub use dispatcher::{AsyncCall, Callback, Dispatcher, TokioDispatcher};
