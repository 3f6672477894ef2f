//! Collaborator traits for multiplexed protocols.
//!
//! Frame-level encoding lives outside this crate. A [`Multiplexer`] turns a
//! negotiated transport into a [`MultiplexedSession`]; the session hands out
//! one [`Codec`] per stream and reports its live stream limit, which the
//! pool uses as the connection's capacity.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::tls::Protocol;
use crate::transport::BoxedIo;

use super::{Codec, IoTimeouts};

// ============================================================================
// Traits
// ============================================================================

/// Establishes multiplexed sessions.
#[async_trait]
pub trait Multiplexer: Send + Sync + 'static {
    /// Protocol this multiplexer speaks.
    fn protocol(&self) -> Protocol {
        Protocol::Http2
    }

    /// Runs the connection preface and settings exchange over `io`.
    async fn handshake(&self, io: BoxedIo) -> Result<Arc<dyn MultiplexedSession>>;
}

/// One established multiplexed connection.
pub trait MultiplexedSession: Send + Sync + 'static {
    /// Current peer limit on concurrent streams.
    fn max_concurrent_streams(&self) -> usize;

    /// Returns `true` once the session stopped accepting streams (GOAWAY,
    /// transport failure, local shutdown).
    fn is_shutdown(&self) -> bool;

    /// Creates a codec for a new stream.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionShutdown`](crate::Error::ConnectionShutdown) if the
    /// session no longer accepts streams.
    fn new_codec(&self, timeouts: IoTimeouts) -> Result<Box<dyn Codec>>;

    /// Closes the session and its transport.
    fn shutdown(&self);
}
