//! Entity keys and key allocation.
//!
//! An [`EntityKey`] is a stable `u64` identifier for a particle. Keys are
//! independent of any code: a code only ever sees its own indices, and the
//! storage translates between the two.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A unique, immutable particle identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey(pub u64);

impl EntityKey {
    /// The "no key" sentinel, returned for indices that have no mapping.
    pub const NONE: EntityKey = EntityKey(0);

    /// Create a key from a raw `u64` identifier.
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw `u64` identifier.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }

    /// Returns `true` if this is a real key (not [`EntityKey::NONE`]).
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntityKey({})", self.0)
    }
}

/// Hands out monotonically increasing entity keys.
///
/// Clones share one counter, so every storage built from clones of the same
/// allocator draws from the same key space and keys are never reused.
#[derive(Debug, Clone)]
pub struct KeyAllocator {
    next_id: Arc<AtomicU64>,
}

impl KeyAllocator {
    /// Creates a new allocator. Keys start at 1 (0 is [`EntityKey::NONE`]).
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Creates an allocator whose first key is `first`.
    ///
    /// # Panics
    ///
    /// Panics if `first` is 0, which is reserved for [`EntityKey::NONE`].
    #[must_use]
    pub fn starting_at(first: u64) -> Self {
        assert!(first != 0, "key 0 is reserved for EntityKey::NONE");
        Self {
            next_id: Arc::new(AtomicU64::new(first)),
        }
    }

    /// Allocates a fresh key.
    pub fn allocate(&self) -> EntityKey {
        EntityKey(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Allocates `n` consecutive fresh keys.
    pub fn allocate_many(&self, n: usize) -> Vec<EntityKey> {
        let first = self.next_id.fetch_add(n as u64, Ordering::Relaxed);
        (first..first + n as u64).map(EntityKey).collect()
    }

    /// Returns the key the next call to [`KeyAllocator::allocate`] will hand out.
    #[must_use]
    pub fn peek(&self) -> EntityKey {
        EntityKey(self.next_id.load(Ordering::Relaxed))
    }
}

impl Default for KeyAllocator {
    fn default() -> Self {
        Self::new()
    }
}
