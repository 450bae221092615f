//! Demo error types.

use std::path::PathBuf;

use incode_storage::{CodeError, StorageError};

/// Errors that can occur while loading configuration or running a scenario.
#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    /// The configuration file could not be read.
    #[error("failed to read config {path}: {source}")]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`crate::DemoConfig`].
    #[error("invalid config: {0}")]
    ParseConfig(#[from] serde_json::Error),

    /// A storage operation failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A code call made outside any storage failed.
    #[error("code call failed: {0}")]
    Code(#[from] CodeError),

    /// A scenario step observed something it should not have.
    #[error("scenario check failed: {0}")]
    Check(String),
}

/// Convenience alias.
pub type DemoResult<T> = Result<T, DemoError>;
