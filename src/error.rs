//! Error Module
//!
//! Defines the error taxonomy shared by every cache component.
//!
//! Errors carry rendered messages rather than source errors so that a single
//! producer failure can be cloned and delivered to every coalesced waiter.

use thiserror::Error;

/// Main error type for the disk cache
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IoError(String),

    /// The caller-supplied producer (network fetch, render) failed
    #[error("Producer error: {0}")]
    ProducerError(String),

    /// Persisting a payload failed; the entry is still missing
    #[error("Write error: {0}")]
    WriteError(String),

    /// The namespace root could not be enumerated
    #[error("Scan error: {0}")]
    ScanError(String),

    #[error("Delete error: {0}")]
    DeleteError(String),

    /// The shared fetch ended without reporting an outcome (panicked or aborted)
    #[error("Fetch abandoned: {0}")]
    FetchAbandoned(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl CacheError {
    /// Wrap an arbitrary producer failure.
    pub fn producer(err: impl std::fmt::Display) -> Self {
        CacheError::ProducerError(err.to_string())
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(err: serde_yaml::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

/// Result type alias for the disk cache
pub type Result<T> = std::result::Result<T, CacheError>;
