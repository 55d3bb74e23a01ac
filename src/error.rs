//! Unified error handling for the proxyrank crate
//!
//! Domain-specific errors (fetch, probe, storage) are consolidated into a
//! single [`Error`] enum so the run controller and the CLI can share one
//! `Result` type.
//!
//! # Architecture
//!
//! - [`ProxyrankErrorTrait`] - Common interface implemented by all error types
//! - [`ErrorCategory`] - Classification of errors for handling strategies
//! - [`Error`] - Unified error enum wrapping all domain-specific errors
//!
//! # Usage
//!
//! ```rust,ignore
//! use proxyrank::error::{Error, ProxyrankErrorTrait};
//!
//! fn handle_error(err: Error) {
//!     if err.is_recoverable() {
//!         tracing::warn!(error = %err, "retrying");
//!     } else {
//!         tracing::error!(error = %err, category = %err.category(), "giving up");
//!     }
//! }
//! ```

use std::io;
use thiserror::Error;

pub use crate::utils::error::{FetchError, ProbeError, StorageError};

/// Common trait for all proxyrank error types
pub trait ProxyrankErrorTrait: std::error::Error {
    /// Check if this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Get the error category for handling strategies
    fn category(&self) -> ErrorCategory;
}

/// Classification of errors for handling strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Subscription download and decoding
    Network,
    /// Latency probing
    Probe,
    /// Repository and I/O errors
    Storage,
    /// Other/unknown errors
    Other,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Network => write!(f, "network"),
            Self::Probe => write!(f, "probe"),
            Self::Storage => write!(f, "storage"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Unified error type for the proxyrank crate
#[derive(Error, Debug)]
pub enum Error {
    /// Subscription fetch errors
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Probe errors
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Repository errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Generic error with context
    #[error("{context}")]
    Other {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ProxyrankErrorTrait for Error {
    fn is_recoverable(&self) -> bool {
        match self {
            Self::Fetch(e) => e.is_recoverable(),
            Self::Probe(e) => !matches!(e, ProbeError::Unsupported(_)),
            Self::Storage(e) => matches!(e, StorageError::Database(_)),
            Self::Io(_) => true,
            Self::Other { .. } => false,
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Fetch(_) => ErrorCategory::Network,
            Self::Probe(_) => ErrorCategory::Probe,
            Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::Other { .. } => ErrorCategory::Other,
        }
    }
}

impl Error {
    /// Create a generic error with context and source
    pub fn with_source(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Other {
            context: context.into(),
            source: Some(Box::new(source)),
        }
    }
}

// Repository implementations bubble rusqlite errors with `?`
impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Database(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(StorageError::Serialization(err))
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::with_source("Background task failed", err)
    }
}

/// Result type alias using the unified Error type
pub type Result<T> = std::result::Result<T, Error>;
