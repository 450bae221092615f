//! MessagePack codec helpers.
//!
//! Snapshots and method descriptors are persisted with `rmp-serde`.

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Encode a value to MessagePack bytes.
///
/// # Errors
///
/// Returns [`StorageError::Encode`] if serialisation fails.
pub fn encode<T: Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(StorageError::Encode)
}

/// Decode a value from MessagePack bytes.
///
/// # Errors
///
/// Returns [`StorageError::Decode`] if deserialisation fails.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> StorageResult<T> {
    rmp_serde::from_slice(bytes).map_err(StorageError::Decode)
}
