//! Bidirectional mapping between entity keys and code indices.

use std::collections::{HashMap, HashSet};

use crate::error::{StorageError, StorageResult};
use crate::key::EntityKey;
use crate::value::CodeIndex;

/// Resolves code indices back to entity keys.
///
/// Getters with index outputs and the selection adapters use this to turn
/// the raw indices a code returns into particle references.
pub trait KeyLookup {
    /// Returns the key mapped to `index`, or [`EntityKey::NONE`].
    fn key_of(&self, index: CodeIndex) -> EntityKey;

    /// Returns the key for every index, [`EntityKey::NONE`] where unmapped.
    fn keys_of(&self, indices: &[CodeIndex]) -> Vec<EntityKey> {
        indices.iter().map(|&i| self.key_of(i)).collect()
    }
}

/// A lookup for storages without keys (grids); every index is unmapped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoKeys;

impl KeyLookup for NoKeys {
    fn key_of(&self, _index: CodeIndex) -> EntityKey {
        EntityKey::NONE
    }
}

/// Key <-> index bijection plus the ordered list of live keys.
///
/// Every mutating method validates its whole batch before touching the
/// maps, so a failed call leaves the mapping unchanged.
#[derive(Debug, Clone, Default)]
pub struct KeyIndexMap {
    key_to_index: HashMap<EntityKey, CodeIndex>,
    index_to_key: HashMap<CodeIndex, EntityKey>,
    /// Live keys in insertion order.
    keys: Vec<EntityKey>,
}

impl KeyIndexMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of mapped keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Returns `true` if no keys are mapped.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Returns the live keys in insertion order.
    #[must_use]
    pub fn keys(&self) -> &[EntityKey] {
        &self.keys
    }

    /// Returns the index of every live key, in insertion order.
    #[must_use]
    pub fn indices(&self) -> Vec<CodeIndex> {
        self.keys.iter().map(|k| self.key_to_index[k]).collect()
    }

    /// Returns `true` if `key` is mapped.
    #[must_use]
    pub fn contains_key(&self, key: EntityKey) -> bool {
        self.key_to_index.contains_key(&key)
    }

    /// Returns `true` if `index` is mapped.
    #[must_use]
    pub fn contains_index(&self, index: CodeIndex) -> bool {
        self.index_to_key.contains_key(&index)
    }

    /// Returns the index mapped to `key`.
    #[must_use]
    pub fn index_of(&self, key: EntityKey) -> Option<CodeIndex> {
        self.key_to_index.get(&key).copied()
    }

    /// Resolves every key to its index.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownKey`] for the first unmapped key.
    pub fn indices_of(&self, keys: &[EntityKey]) -> StorageResult<Vec<CodeIndex>> {
        keys.iter()
            .map(|&k| self.index_of(k).ok_or(StorageError::UnknownKey(k)))
            .collect()
    }

    /// Checks that every key could be inserted: valid, not mapped and not
    /// repeated in the batch.
    ///
    /// # Errors
    ///
    /// - [`StorageError::InvalidKey`] for [`EntityKey::NONE`].
    /// - [`StorageError::DuplicateKey`] if a key is already mapped or repeated.
    pub fn check_new_keys(&self, keys: &[EntityKey]) -> StorageResult<()> {
        let mut seen = HashSet::with_capacity(keys.len());
        for &key in keys {
            if !key.is_valid() {
                return Err(StorageError::InvalidKey(key));
            }
            if self.contains_key(key) || !seen.insert(key) {
                return Err(StorageError::DuplicateKey(key));
            }
        }
        Ok(())
    }

    /// Checks that no index is already mapped or repeated in the batch.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateIndex`] for the first offending index.
    pub fn check_new_indices(&self, indices: &[CodeIndex]) -> StorageResult<()> {
        let mut seen = HashSet::with_capacity(indices.len());
        for &index in indices {
            if self.contains_index(index) || !seen.insert(index) {
                return Err(StorageError::DuplicateIndex(index));
            }
        }
        Ok(())
    }

    /// Maps each key to the index at the same position.
    ///
    /// # Errors
    ///
    /// - [`StorageError::AllocationMismatch`] if the slices differ in length.
    /// - [`StorageError::InvalidKey`] or [`StorageError::DuplicateKey`], see
    ///   [`Self::check_new_keys`].
    /// - [`StorageError::DuplicateIndex`] if an index is already mapped or repeated.
    pub fn insert_all(&mut self, keys: &[EntityKey], indices: &[CodeIndex]) -> StorageResult<()> {
        if keys.len() != indices.len() {
            return Err(StorageError::AllocationMismatch {
                expected: keys.len(),
                actual: indices.len(),
            });
        }

        self.check_new_keys(keys)?;
        self.check_new_indices(indices)?;

        for (&key, &index) in keys.iter().zip(indices) {
            self.key_to_index.insert(key, index);
            self.index_to_key.insert(index, key);
        }
        self.keys.extend_from_slice(keys);
        Ok(())
    }

    /// Unmaps every key and returns the indices they were mapped to.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownKey`] (and changes nothing) if any key
    /// is unmapped.
    pub fn remove_keys(&mut self, keys: &[EntityKey]) -> StorageResult<Vec<CodeIndex>> {
        let indices = self.indices_of(keys)?;
        for (key, index) in keys.iter().zip(&indices) {
            self.key_to_index.remove(key);
            self.index_to_key.remove(index);
        }
        self.retain_live(keys);
        Ok(indices)
    }

    /// Unmaps every mapped index in `indices` and returns the dropped keys.
    /// Unmapped indices are ignored.
    pub fn remove_indices(&mut self, indices: &[CodeIndex]) -> Vec<EntityKey> {
        let mut removed = Vec::new();
        for index in indices {
            if let Some(key) = self.index_to_key.remove(index) {
                self.key_to_index.remove(&key);
                removed.push(key);
            }
        }
        self.retain_live(&removed);
        removed
    }

    fn retain_live(&mut self, removed: &[EntityKey]) {
        if removed.is_empty() {
            return;
        }
        let removed: HashSet<&EntityKey> = removed.iter().collect();
        self.keys.retain(|k| !removed.contains(k));
    }
}

impl KeyLookup for KeyIndexMap {
    fn key_of(&self, index: CodeIndex) -> EntityKey {
        self.index_to_key
            .get(&index)
            .copied()
            .unwrap_or(EntityKey::NONE)
    }
}
