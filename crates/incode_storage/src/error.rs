//! Storage-layer error types.

use crate::key::EntityKey;
use crate::value::CodeIndex;

/// An error reported by an external code function.
///
/// Codes signal failure with an integer error code; the message is whatever
/// context the code (or its binding) could provide.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("code returned error {code}: {message}")]
pub struct CodeError {
    /// The integer error code reported by the code.
    pub code: i32,
    /// Human-readable description.
    pub message: String,
}

impl CodeError {
    /// Create a new code error.
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Result type returned by external code functions.
pub type CodeResult<T> = Result<T, CodeError>;

/// Errors that can occur while mapping attributes onto a code.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No getter provides these attributes.
    #[error("do not have attributes {0:?}")]
    UnknownAttribute(Vec<String>),

    /// No combination of setters can write these attributes.
    #[error("cannot set attributes {0:?}")]
    UnknownWritableAttribute(Vec<String>),

    /// A setter or creator needs a value the caller did not supply.
    #[error("method '{method}' needs a value for the '{attribute}' attribute")]
    MissingRequiredAttribute { method: String, attribute: String },

    /// A supplied value follows an argument that was left to its default.
    #[error("method '{method}' got a value for '{attribute}' after an argument left to its default")]
    InvalidDefaultOrdering { method: String, attribute: String },

    /// A scalar-only code function was asked for more than one entity.
    #[error("method '{method}' cannot handle arrays ({count} indices requested)")]
    UnsupportedBatchOperation { method: String, count: usize },

    /// The key is not managed by this storage.
    #[error("unknown key {0}")]
    UnknownKey(EntityKey),

    /// The code allocated a different number of entities than requested.
    #[error("code allocated {actual} entities, expected {expected}")]
    AllocationMismatch { expected: usize, actual: usize },

    /// The key is the "no key" sentinel and cannot name a particle.
    #[error("{0} is reserved and cannot be stored")]
    InvalidKey(EntityKey),

    /// The key is already managed by this storage.
    #[error("key {0} is already managed by this storage")]
    DuplicateKey(EntityKey),

    /// The index is already mapped to a key; bookkeeping is broken.
    #[error("adding an index that is already managed: {0}")]
    DuplicateIndex(CodeIndex),

    /// The operation is not supported by this kind of storage.
    #[error("{0} is not supported by this storage")]
    UnsupportedOperation(&'static str),

    /// An external code function failed.
    #[error("call to '{method}' failed: {source}")]
    Code {
        method: String,
        #[source]
        source: CodeError,
    },

    /// A code function returned the wrong number of arrays.
    #[error("method '{method}' returned {actual} arrays, expected {expected}")]
    ResultArity {
        method: String,
        expected: usize,
        actual: usize,
    },

    /// A value array does not have one element per entity.
    #[error("values for '{attribute}' have length {actual}, expected {expected}")]
    LengthMismatch {
        attribute: String,
        expected: usize,
        actual: usize,
    },

    /// A grid selection does not fit the current grid.
    #[error("invalid grid selection: {0}")]
    InvalidSelection(String),

    /// Failed to encode a snapshot to MessagePack.
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// Failed to decode a snapshot from MessagePack.
    #[error("failed to decode snapshot: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

impl StorageError {
    pub(crate) fn code(method: &str, source: CodeError) -> Self {
        Self::Code {
            method: method.to_string(),
            source,
        }
    }
}

/// Result type used throughout the storage layer.
pub type StorageResult<T> = Result<T, StorageError>;
