//! Pool lock token and the state it guards.
//!
//! Pool membership, connection bookkeeping and allocation state all live in
//! [`Guarded`] cells. A cell can only be opened with a [`PoolGuard`], which
//! only exists while the pool's lock is held, so unlocked access does not
//! compile. The cell's own mutex is uncontended: every opener already holds
//! the pool lock.
//!
//! A cell must not be opened twice in the same scope.

// ============================================================================
// Imports
// ============================================================================

use parking_lot::{Mutex, MutexGuard};

// ============================================================================
// PoolGuard
// ============================================================================

/// Proof that the pool lock is held.
pub(crate) struct PoolGuard<'a> {
    _lock: MutexGuard<'a, ()>,
}

impl<'a> PoolGuard<'a> {
    /// Acquires `lock`.
    pub(crate) fn acquire(lock: &'a Mutex<()>) -> Self {
        Self { _lock: lock.lock() }
    }
}

// ============================================================================
// Guarded
// ============================================================================

/// State readable and writable only under the pool lock.
#[derive(Debug, Default)]
pub(crate) struct Guarded<T> {
    cell: Mutex<T>,
}

impl<T> Guarded<T> {
    /// Wraps `value`.
    pub(crate) fn new(value: T) -> Self {
        Self {
            cell: Mutex::new(value),
        }
    }

    /// Opens the cell for as long as `guard` is borrowed.
    #[inline]
    pub(crate) fn lock<'g>(&'g self, _guard: &'g PoolGuard<'_>) -> MutexGuard<'g, T> {
        self.cell.lock()
    }

    /// Returns the value through exclusive access, no lock needed.
    #[inline]
    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }
}

// ============================================================================
// Tests
// ============================================================================
