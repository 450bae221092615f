//! Detached copies of storage contents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::StorageResult;
use crate::key::EntityKey;
use crate::value::Quantity;

/// Every readable attribute of every particle in a storage, in key order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParticleSnapshot {
    pub keys: Vec<EntityKey>,
    pub attributes: BTreeMap<String, Quantity>,
}

impl ParticleSnapshot {
    /// Number of particles captured.
    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Values of one attribute.
    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&Quantity> {
        self.attributes.get(attribute)
    }

    /// Encode to MessagePack.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Encode`] if serialisation fails.
    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        codec::encode(self)
    }

    /// Decode from MessagePack.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Decode`] if the bytes are not a snapshot.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        codec::decode(bytes)
    }
}

/// Every readable attribute of every grid point, shaped like the grid.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub shape: Vec<usize>,
    pub attributes: BTreeMap<String, Quantity>,
}

impl GridSnapshot {
    /// Values of one attribute.
    #[must_use]
    pub fn get(&self, attribute: &str) -> Option<&Quantity> {
        self.attributes.get(attribute)
    }

    /// Encode to MessagePack.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Encode`] if serialisation fails.
    pub fn to_bytes(&self) -> StorageResult<Vec<u8>> {
        codec::encode(self)
    }

    /// Decode from MessagePack.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::Decode`] if the bytes are not a snapshot.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        codec::decode(bytes)
    }
}
