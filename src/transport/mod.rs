//! Connection management.
//!
//! Physical connections, the pool that shares them between calls, and the
//! per-call allocation that binds a call to a connection and a stream.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   get / put    ┌──────────────────┐
//! │ StreamAllocation │◄──────────────►│  ConnectionPool  │
//! │  (one per call)  │                │ (one per client) │
//! └────────┬─────────┘                └────────┬─────────┘
//!          │ new_stream                         │ cleanup
//!          ▼                                    ▼
//! ┌──────────────────┐   new_codec    ┌──────────────────┐
//! │    Connection    │───────────────►│      Codec       │
//! │ socket/TLS/tunnel│                │ HTTP/1.1 or mux  │
//! └──────────────────┘                └──────────────────┘
//! ```
//!
//! # Locking
//!
//! One `parking_lot` mutex per pool guards pool membership, connection
//! bookkeeping and allocation state. Guarded state is reachable only
//! through a `PoolGuard`. No I/O happens while the lock is held.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `allocation` | Call to connection/stream binding |
//! | `connection` | Physical connection and handshakes |
//! | `guard` | Pool lock token and guarded cells |
//! | `io` | Buffered transport, cancel signal, I/O timeouts |
//! | `pool` | Connection pool and maintenance task |

// ============================================================================
// Submodules
// ============================================================================

/// Call to connection/stream binding.
pub mod allocation;

/// Physical connection.
pub mod connection;

/// Pool lock token.
pub(crate) mod guard;

/// Transport plumbing.
pub(crate) mod io;

/// Connection pool.
pub mod pool;

// ============================================================================
// Re-exports
// ============================================================================

pub use allocation::StreamAllocation;
pub use connection::Connection;
pub use io::{AsyncIo, BoxedIo};
pub use pool::{CleanupOutcome, ConnectionPool};
