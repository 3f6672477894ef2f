//! Type-safe identifiers.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time and give
//! log lines a stable correlation key.
//!
//! | Type | Source | Used by |
//! |------|--------|---------|
//! | [`ConnectionId`] | process-wide counter | physical connections |
//! | [`AllocationId`] | process-wide counter | stream allocations |
//! | [`CodecId`] | process-wide counter | bound codecs |
//! | [`CallId`] | UUID v4 | calls |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

// ============================================================================
// Counter-backed IDs
// ============================================================================

macro_rules! counter_id {
    ($(#[$meta:meta])* $name:ident, $counter:ident, $prefix:literal) => {
        static $counter: AtomicU64 = AtomicU64::new(1);

        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// Allocates the next identifier.
            #[inline]
            #[must_use]
            pub fn next() -> Self {
                Self($counter.fetch_add(1, Ordering::Relaxed))
            }

            /// Returns the raw value.
            #[inline]
            #[must_use]
            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

counter_id!(
    /// Identifies one physical connection.
    ConnectionId,
    NEXT_CONNECTION_ID,
    "conn"
);

counter_id!(
    /// Identifies one stream allocation.
    AllocationId,
    NEXT_ALLOCATION_ID,
    "alloc"
);

counter_id!(
    /// Identifies one codec bound to an allocation.
    CodecId,
    NEXT_CODEC_ID,
    "codec"
);

// ============================================================================
// CallId
// ============================================================================

/// Identifies one logical call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(Uuid);

impl CallId {
    /// Generates a new random call ID.
    #[inline]
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_display_prefix() {
        let id = AllocationId::next();
        assert!(id.to_string().starts_with("alloc-"));
    }

    #[test]
    fn test_call_ids_are_random() {
        assert_ne!(CallId::generate(), CallId::generate());
    }
}
