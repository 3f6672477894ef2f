//! Connection pool shared by every call of a client.
//!
//! Keeps connections for all addresses in one membership list and evicts
//! idle ones by age and count.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ ConnectionPool                               │
//! │   lock: Mutex<()>  ──► PoolGuard             │
//! │   members (Guarded)                          │
//! │   ┌────────────────────────────────────────┐ │
//! │   │ conn#1  example.com:443  2 allocations │ │
//! │   │ conn#2  example.com:443  idle 40s      │ │
//! │   │ conn#3  api.local:80     idle 3s       │ │
//! │   └────────────────────────────────────────┘ │
//! │   maintenance task ◄── Notify                │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The maintenance task starts with the first insertion, runs [`cleanup`]
//! passes, sleeps until the next connection could expire, and exits when the
//! pool is empty or dropped.
//!
//! [`cleanup`]: ConnectionPool::cleanup

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::client::PoolConfig;
use crate::error::Result;
use crate::route::{Address, RouteDatabase};

use super::connection::{AllocationRecord, Bookkeeping, Connection};
use super::guard::{Guarded, PoolGuard};

// ============================================================================
// Types
// ============================================================================

/// What the maintenance task should do after a [`cleanup`](ConnectionPool::cleanup) pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// A connection was evicted; run another pass immediately.
    RunAgain,
    /// Nothing to evict before this much time has passed.
    WaitFor(Duration),
    /// The pool is empty; the task exits.
    Stop,
}

#[derive(Default)]
struct Members {
    connections: VecDeque<Arc<Connection>>,
    cleanup_running: bool,
    task: Option<JoinHandle<()>>,
}

struct PoolInner {
    max_idle_connections: usize,
    keep_alive: Duration,
    lock: Mutex<()>,
    members: Guarded<Members>,
    wake: Arc<Notify>,
    route_database: Arc<RouteDatabase>,
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// Pool of physical connections.
///
/// Cloning is cheap and shares the same pool.
///
/// # Example
///
/// ```
/// use callwire::{ConnectionPool, PoolConfig};
///
/// let pool = ConnectionPool::new(&PoolConfig::default()).expect("valid config");
/// assert_eq!(pool.connection_count(), 0);
/// ```
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

// ============================================================================
// ConnectionPool - Constructor
// ============================================================================

impl ConnectionPool {
    /// Creates an empty pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) if `config` is invalid.
    pub fn new(config: &PoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_limits(config.max_idle_connections, config.keep_alive()))
    }

    fn with_limits(max_idle_connections: usize, keep_alive: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                max_idle_connections,
                keep_alive,
                lock: Mutex::new(()),
                members: Guarded::new(Members::default()),
                wake: Arc::new(Notify::new()),
                route_database: Arc::new(RouteDatabase::new()),
            }),
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::with_limits(
            PoolConfig::DEFAULT_MAX_IDLE_CONNECTIONS,
            Duration::from_millis(PoolConfig::DEFAULT_KEEP_ALIVE_MS),
        )
    }
}

// ============================================================================
// ConnectionPool - Public API
// ============================================================================

impl ConnectionPool {
    /// Returns the number of connections without allocations.
    #[must_use]
    pub fn idle_connection_count(&self) -> usize {
        let guard = self.lock();
        let members = self.inner.members.lock(&guard);
        members
            .connections
            .iter()
            .filter(|connection| connection.book().lock(&guard).allocations.is_empty())
            .count()
    }

    /// Returns the number of connections in the pool.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        let guard = self.lock();
        self.inner.members.lock(&guard).connections.len()
    }

    /// Returns the keep-alive window.
    #[inline]
    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        self.inner.keep_alive
    }

    /// Returns the maximum number of idle connections kept.
    #[inline]
    #[must_use]
    pub fn max_idle_connections(&self) -> usize {
        self.inner.max_idle_connections
    }

    /// Returns `true` if both handles refer to the same pool.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Closes every idle connection. Connections in use are left alone.
    pub fn evict_all(&self) {
        let evicted: Vec<Arc<Connection>> = {
            let guard = self.lock();
            let mut members = self.inner.members.lock(&guard);

            let mut evicted = Vec::new();
            members.connections.retain(|connection| {
                let mut book = connection.book().lock(&guard);
                if !book.allocations.is_empty() {
                    return true;
                }
                book.no_new_streams = true;
                evicted.push(Arc::clone(connection));
                false
            });
            evicted
        };

        for connection in &evicted {
            connection.shutdown();
        }
        debug!(count = evicted.len(), "Evicted idle connections");
    }
}

// ============================================================================
// ConnectionPool - Guarded Operations
// ============================================================================

impl ConnectionPool {
    /// Acquires the pool lock.
    pub(crate) fn lock(&self) -> PoolGuard<'_> {
        PoolGuard::acquire(&self.inner.lock)
    }

    /// Route failure history shared by every allocation on this pool.
    pub(crate) fn route_database(&self) -> &Arc<RouteDatabase> {
        &self.inner.route_database
    }

    /// Finds a connection able to carry a new stream to `address` and
    /// registers `record` on it.
    pub(crate) fn get(
        &self,
        guard: &PoolGuard<'_>,
        address: &Address,
        record: AllocationRecord,
    ) -> Option<Arc<Connection>> {
        let members = self.inner.members.lock(guard);
        let connection = members
            .connections
            .iter()
            .find(|connection| connection.is_eligible(guard, address))?;

        connection.book().lock(guard).allocations.push(record);
        trace!(connection = %connection.id(), %address, "Pooled connection acquired");
        Some(Arc::clone(connection))
    }

    /// Adds `connection` and makes sure the maintenance task runs.
    pub(crate) fn put(&self, guard: &PoolGuard<'_>, connection: Arc<Connection>) {
        let mut members = self.inner.members.lock(guard);

        if !members.cleanup_running {
            members.task = self.spawn_maintenance();
            members.cleanup_running = members.task.is_some();
        }

        debug!(connection = %connection.id(), route = %connection.route(), "Connection added to pool");
        members.connections.push_back(connection);
    }

    /// Reports that `connection` has no allocations left.
    ///
    /// Returns `true` if the connection was removed and the caller must close
    /// it. Otherwise it stays pooled as idle and the maintenance task is woken
    /// to recompute its deadline.
    pub(crate) fn connection_became_idle(
        &self,
        guard: &PoolGuard<'_>,
        connection: &Arc<Connection>,
    ) -> bool {
        let no_new_streams = connection.book().lock(guard).no_new_streams;

        if no_new_streams || self.inner.max_idle_connections == 0 {
            self.inner
                .members
                .lock(guard)
                .connections
                .retain(|member| !Arc::ptr_eq(member, connection));
            debug!(connection = %connection.id(), no_new_streams, "Idle connection removed");
            true
        } else {
            self.inner.wake.notify_one();
            false
        }
    }

    /// Runs one maintenance pass at `now`.
    ///
    /// Prunes leaked allocation records, then evicts the longest-idle
    /// connection if it outlived the keep-alive window or the idle count is
    /// over the limit. The evicted connection leaves the pool under the lock
    /// and is closed after the lock is released.
    pub fn cleanup(&self, now: Instant) -> CleanupOutcome {
        self.inner.cleanup(now)
    }

    fn spawn_maintenance(&self) -> Option<JoinHandle<()>> {
        let handle = Handle::try_current().ok()?;
        let pool = Arc::downgrade(&self.inner);
        let wake = Arc::clone(&self.inner.wake);
        Some(handle.spawn(run_maintenance(pool, wake)))
    }
}

// ============================================================================
// Maintenance
// ============================================================================

impl PoolInner {
    fn cleanup(&self, now: Instant) -> CleanupOutcome {
        let mut in_use = 0usize;
        let mut idle = 0usize;
        let mut longest: Option<(Arc<Connection>, Duration)> = None;

        let (outcome, evicted) = {
            let guard = PoolGuard::acquire(&self.lock);
            let mut members = self.members.lock(&guard);

            for connection in &members.connections {
                let mut book = connection.book().lock(&guard);
                prune_leaks(connection, &mut book, now);

                if !book.allocations.is_empty() {
                    in_use += 1;
                    continue;
                }

                idle += 1;
                let idle_for = if book.no_new_streams {
                    self.keep_alive
                } else {
                    book.idle_at
                        .map_or(Duration::ZERO, |at| now.saturating_duration_since(at))
                };

                if longest.as_ref().is_none_or(|(_, longest)| idle_for > *longest) {
                    longest = Some((Arc::clone(connection), idle_for));
                }
            }

            match longest {
                Some((connection, idle_for))
                    if idle_for >= self.keep_alive || idle > self.max_idle_connections =>
                {
                    members
                        .connections
                        .retain(|member| !Arc::ptr_eq(member, &connection));
                    (CleanupOutcome::RunAgain, Some((connection, idle_for)))
                }
                Some((_, idle_for)) => (CleanupOutcome::WaitFor(self.keep_alive - idle_for), None),
                None if in_use > 0 => (CleanupOutcome::WaitFor(self.keep_alive), None),
                None => {
                    members.cleanup_running = false;
                    (CleanupOutcome::Stop, None)
                }
            }
        };

        if let Some((connection, idle_for)) = evicted {
            debug!(
                connection = %connection.id(),
                idle_ms = idle_for.as_millis() as u64,
                idle,
                "Evicting idle connection"
            );
            connection.shutdown();
        }

        trace!(in_use, idle, ?outcome, "Cleanup pass");
        outcome
    }
}

/// Drops records of allocations that were dropped without being released.
fn prune_leaks(connection: &Connection, book: &mut Bookkeeping, now: Instant) {
    let before = book.allocations.len();
    book.allocations.retain(|record| {
        if record.token.strong_count() > 0 {
            return true;
        }
        warn!(
            connection = %connection.id(),
            allocation = %record.id,
            route = %connection.route(),
            "A connection was leaked. Did you forget to close a response body?"
        );
        false
    });

    if book.allocations.len() < before {
        book.no_new_streams = true;
        if book.allocations.is_empty() {
            book.idle_at = Some(now);
        }
    }
}

/// Current time on the runtime clock, which tests may pause.
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn run_maintenance(pool: Weak<PoolInner>, wake: Arc<Notify>) {
    loop {
        let outcome = {
            let Some(inner) = pool.upgrade() else {
                return;
            };
            inner.cleanup(now())
        };

        match outcome {
            CleanupOutcome::RunAgain => tokio::task::yield_now().await,
            CleanupOutcome::WaitFor(delay) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = wake.notified() => {}
                }
            }
            CleanupOutcome::Stop => return,
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(task) = self.members.get_mut().task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_idle_connections", &self.inner.max_idle_connections)
            .field("keep_alive", &self.inner.keep_alive)
            .field("connections", &self.connection_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
