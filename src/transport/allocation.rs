//! Stream allocation: binds one call to one connection and one stream.
//!
//! A [`StreamAllocation`] lives as long as its call's attempts target the
//! same address. It resolves a connection in this order:
//!
//! | Step | Source | Notes |
//! |------|--------|-------|
//! | 1 | connection already bound | dropped first if `no_new_streams` |
//! | 2 | pool lookup by address | registers this allocation |
//! | 3 | next route, new connection | pooled before the handshake |
//!
//! All state changes happen under the pool lock; connecting and health
//! probing happen with the lock released. Connections detached with no
//! allocations left are handed to the pool, and closed outside the lock if
//! the pool does not keep them.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::codec::{Codec, StreamCancel};
use crate::error::{Error, ResetCode, Result};
use crate::identifiers::{AllocationId, CodecId};
use crate::route::{Address, Route, RouteSelector};

use super::connection::{AllocationRecord, ConnectParams, Connection};
use super::guard::{Guarded, PoolGuard};
use super::pool::{self, ConnectionPool};

// ============================================================================
// Types
// ============================================================================

/// Codec currently bound to an allocation.
struct CodecHandle {
    id: CodecId,
    canceler: Arc<dyn StreamCancel>,
}

#[derive(Default)]
struct AllocationState {
    route: Option<Route>,
    refused_stream_count: u32,
    connection: Option<Arc<Connection>>,
    codec: Option<CodecHandle>,
    released: bool,
    canceled: bool,
}

// ============================================================================
// StreamAllocation
// ============================================================================

/// Coordinates connections and streams for one call.
pub struct StreamAllocation {
    id: AllocationId,
    address: Address,
    pool: ConnectionPool,
    /// Liveness token; connections only hold weak references to it.
    token: Arc<()>,
    selector: tokio::sync::Mutex<RouteSelector>,
    state: Guarded<AllocationState>,
}

impl StreamAllocation {
    /// Creates an allocation for `address` on `pool`.
    pub(crate) fn new(pool: ConnectionPool, address: Address) -> Arc<Self> {
        let selector = RouteSelector::new(address.clone(), Arc::clone(pool.route_database()));
        let allocation = Arc::new(Self {
            id: AllocationId::next(),
            address,
            pool,
            token: Arc::new(()),
            selector: tokio::sync::Mutex::new(selector),
            state: Guarded::new(AllocationState::default()),
        });
        trace!(allocation = %allocation.id, address = %allocation.address, "Allocation created");
        allocation
    }

    /// Returns the allocation ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> AllocationId {
        self.id
    }

    /// Returns the target address.
    #[inline]
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Returns the bound connection, if any.
    #[must_use]
    pub fn connection(&self) -> Option<Arc<Connection>> {
        let guard = self.pool.lock();
        self.state.lock(&guard).connection.clone()
    }

    /// Returns the chosen route, if any.
    #[must_use]
    pub fn route(&self) -> Option<Route> {
        let guard = self.pool.lock();
        self.state.lock(&guard).route.clone()
    }

    /// Returns `true` while a codec is bound.
    #[must_use]
    pub fn has_codec(&self) -> bool {
        let guard = self.pool.lock();
        self.state.lock(&guard).codec.is_some()
    }

    fn record(&self) -> AllocationRecord {
        AllocationRecord {
            id: self.id,
            token: Arc::downgrade(&self.token),
        }
    }
}

// ============================================================================
// StreamAllocation - Streams
// ============================================================================

impl StreamAllocation {
    /// Finds a healthy connection and binds a new codec on it.
    ///
    /// # Errors
    ///
    /// - [`Error::Route`] wrapping the connect or codec failure
    /// - [`Error::Canceled`] if the allocation was canceled
    /// - [`Error::IllegalState`] if released or a codec is already bound
    pub(crate) async fn new_stream(
        self: &Arc<Self>,
        params: &ConnectParams,
        extensive_health_check: bool,
    ) -> Result<(Box<dyn Codec>, StreamLease)> {
        let bound = async {
            let connection = self
                .find_healthy_connection(params, extensive_health_check)
                .await?;
            let codec = connection.new_codec(params.timeouts)?;
            Ok::<_, Error>((connection, codec))
        }
        .await;

        let (connection, codec) = bound.map_err(|e| self.route_error(e))?;
        let canceler = codec.canceler();
        let codec_id = CodecId::next();

        let canceled = {
            let guard = self.pool.lock();
            let mut state = self.state.lock(&guard);
            if !state.canceled {
                state.codec = Some(CodecHandle {
                    id: codec_id,
                    canceler: Arc::clone(&canceler),
                });
            }
            state.canceled
        };

        if canceled {
            canceler.cancel();
            return Err(Error::Canceled);
        }

        debug!(
            allocation = %self.id,
            connection = %connection.id(),
            codec = %codec_id,
            protocol = %connection.protocol(),
            "Stream bound"
        );

        Ok((
            codec,
            StreamLease {
                allocation: Arc::clone(self),
                codec_id,
            },
        ))
    }

    fn route_error(&self, error: Error) -> Error {
        match error {
            Error::Canceled | Error::IllegalState { .. } | Error::Route { .. } => error,
            other => Error::route(self.address.authority(), other),
        }
    }

    async fn find_healthy_connection(
        &self,
        params: &ConnectParams,
        extensive: bool,
    ) -> Result<Arc<Connection>> {
        loop {
            let connection = self.find_connection(params).await?;

            let trusted = {
                let guard = self.pool.lock();
                connection.book().lock(&guard).success_count == 0
            };
            if trusted || connection.is_healthy(extensive).await {
                return Ok(connection);
            }

            debug!(allocation = %self.id, connection = %connection.id(), "Connection failed health check");
            self.no_new_streams();
        }
    }

    async fn find_connection(&self, params: &ConnectParams) -> Result<Arc<Connection>> {
        let (found, selected_route, released) = {
            let guard = self.pool.lock();
            let mut state = self.state.lock(&guard);

            if state.released {
                return Err(Error::illegal_state("stream allocation was released"));
            }
            if state.codec.is_some() {
                return Err(Error::illegal_state("stream allocation already has a codec"));
            }
            if state.canceled {
                return Err(Error::Canceled);
            }

            let released = if state
                .connection
                .as_ref()
                .is_some_and(|connection| connection.book().lock(&guard).no_new_streams)
            {
                self.deallocate(&guard, &mut state, false, false, true)
            } else {
                None
            };

            let found = match &state.connection {
                Some(connection) => Some(Arc::clone(connection)),
                None => {
                    let pooled = self.pool.get(&guard, &self.address, self.record());
                    state.connection.clone_from(&pooled);
                    pooled
                }
            };
            (found, state.route.clone(), released)
        };

        close(released);

        if let Some(connection) = found {
            trace!(allocation = %self.id, connection = %connection.id(), "Reusing connection");
            return Ok(connection);
        }

        let route = match selected_route {
            Some(route) => route,
            None => self.selector.lock().await.next().await?,
        };

        let connection = Arc::new(Connection::new(route.clone()));
        {
            let guard = self.pool.lock();
            let mut state = self.state.lock(&guard);
            if state.canceled {
                return Err(Error::Canceled);
            }

            state.route = Some(route.clone());
            state.refused_stream_count = 0;
            connection.book().lock(&guard).allocations.push(self.record());
            state.connection = Some(Arc::clone(&connection));
            self.pool.put(&guard, Arc::clone(&connection));
        }

        debug!(allocation = %self.id, connection = %connection.id(), %route, "Connecting");

        if let Err(e) = connection.connect(params).await {
            let guard = self.pool.lock();
            connection.book().lock(&guard).no_new_streams = true;
            return Err(e);
        }

        self.pool.route_database().connected(&route);
        Ok(connection)
    }
}

// ============================================================================
// StreamAllocation - Bookkeeping
// ============================================================================

impl StreamAllocation {
    /// Reports the end of the stream bound as `codec_id`.
    ///
    /// A finish for a codec that is no longer bound is ignored.
    pub(crate) fn stream_finished(&self, no_new_streams: bool, codec_id: CodecId) {
        let released = {
            let guard = self.pool.lock();
            let mut state = self.state.lock(&guard);

            if state.codec.as_ref().is_none_or(|codec| codec.id != codec_id) {
                debug!(allocation = %self.id, codec = %codec_id, "Ignoring finish for unbound codec");
                return;
            }

            if !no_new_streams && let Some(connection) = &state.connection {
                connection.book().lock(&guard).success_count += 1;
            }
            self.deallocate(&guard, &mut state, no_new_streams, false, true)
        };

        trace!(allocation = %self.id, codec = %codec_id, no_new_streams, "Stream finished");
        close(released);
    }

    /// Records a failed stream or connect attempt.
    ///
    /// The first `REFUSED_STREAM` reset keeps the connection; other resets
    /// and a second refusal retire it and forget the route. Other failures
    /// retire single-stream connections, and shut-down multiplexed ones. If
    /// the connection never completed a stream, its route is recorded as
    /// failed.
    pub(crate) fn stream_failed(&self, error: Option<&Error>) {
        let released = {
            let guard = self.pool.lock();
            let mut state = self.state.lock(&guard);
            let cause = error.map(Error::last_connect_error);
            let mut no_new_streams = false;

            if let Some(Error::StreamReset { code }) = cause {
                if *code == ResetCode::RefusedStream {
                    state.refused_stream_count += 1;
                }
                if *code != ResetCode::RefusedStream || state.refused_stream_count > 1 {
                    no_new_streams = true;
                    state.route = None;
                }
            } else if let Some(connection) = state.connection.clone() {
                let shut_down = matches!(cause, Some(Error::ConnectionShutdown));
                if !connection.is_multiplexed() || shut_down {
                    no_new_streams = true;
                    if connection.book().lock(&guard).success_count == 0 {
                        if let (Some(route), Some(_)) = (&state.route, cause) {
                            self.pool.route_database().failed(route);
                        }
                        state.route = None;
                    }
                }
            }

            debug!(
                allocation = %self.id,
                no_new_streams,
                error = error.map(ToString::to_string),
                "Stream failed"
            );
            self.deallocate(&guard, &mut state, no_new_streams, false, true)
        };

        close(released);
    }

    /// Detaches from the connection once no stream is active.
    pub(crate) fn release(&self) {
        let released = {
            let guard = self.pool.lock();
            let mut state = self.state.lock(&guard);
            self.deallocate(&guard, &mut state, false, true, false)
        };
        trace!(allocation = %self.id, "Allocation released");
        close(released);
    }

    /// Forbids new streams on the bound connection.
    pub(crate) fn no_new_streams(&self) {
        let released = {
            let guard = self.pool.lock();
            let mut state = self.state.lock(&guard);
            self.deallocate(&guard, &mut state, true, false, false)
        };
        close(released);
    }

    /// Cancels the bound stream, or the whole connection while connecting.
    pub fn cancel(&self) {
        let (codec, connection) = {
            let guard = self.pool.lock();
            let mut state = self.state.lock(&guard);
            state.canceled = true;
            (
                state.codec.as_ref().map(|codec| Arc::clone(&codec.canceler)),
                state.connection.clone(),
            )
        };

        debug!(allocation = %self.id, "Allocation canceled");
        match (codec, connection) {
            (Some(codec), _) => codec.cancel(),
            (None, Some(connection)) => StreamCancel::cancel(connection.as_ref()),
            (None, None) => {}
        }
    }

    /// Returns `true` if another attempt could use a different route.
    pub(crate) async fn has_more_routes(&self) -> bool {
        if self.route().is_some() {
            return true;
        }
        self.selector.lock().await.has_next()
    }

    /// Applies a state change and detaches the connection when it has no
    /// active stream and is released or retired.
    ///
    /// Returns a connection the caller must close after unlocking.
    fn deallocate(
        &self,
        guard: &PoolGuard<'_>,
        state: &mut AllocationState,
        no_new_streams: bool,
        released: bool,
        stream_finished: bool,
    ) -> Option<Arc<Connection>> {
        if stream_finished {
            state.codec = None;
        }
        if released {
            state.released = true;
        }

        let connection = state.connection.clone()?;
        let retired = {
            let mut book = connection.book().lock(guard);
            if no_new_streams {
                book.no_new_streams = true;
            }
            book.no_new_streams
        };

        if state.codec.is_some() || !(state.released || retired) {
            return None;
        }

        let now_idle = {
            let mut book = connection.book().lock(guard);
            book.allocations.retain(|record| record.id != self.id);
            if book.allocations.is_empty() {
                book.idle_at = Some(pool::now());
            }
            book.allocations.is_empty()
        };
        state.connection = None;

        (now_idle && self.pool.connection_became_idle(guard, &connection)).then_some(connection)
    }
}

fn close(connection: Option<Arc<Connection>>) {
    if let Some(connection) = connection {
        connection.shutdown();
    }
}

impl Drop for StreamAllocation {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(connection) = &state.connection {
            // The pool prunes the record on its next cleanup pass.
            debug!(
                allocation = %self.id,
                connection = %connection.id(),
                released = state.released,
                "Allocation dropped while still attached"
            );
        }
    }
}

impl fmt::Debug for StreamAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamAllocation")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// StreamLease
// ============================================================================

/// Obligation to report the end of one bound stream.
///
/// Consumed by [`finish`](Self::finish). Dropping a lease reports nothing;
/// failures go through [`StreamAllocation::stream_failed`].
pub(crate) struct StreamLease {
    allocation: Arc<StreamAllocation>,
    codec_id: CodecId,
}

impl StreamLease {
    /// Reports the stream finished. `no_new_streams` retires the connection.
    pub(crate) fn finish(self, no_new_streams: bool) {
        self.allocation.stream_finished(no_new_streams, self.codec_id);
    }

    pub(crate) fn allocation(&self) -> &Arc<StreamAllocation> {
        &self.allocation
    }
}

impl fmt::Debug for StreamLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamLease")
            .field("allocation", &self.allocation.id)
            .field("codec", &self.codec_id)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
