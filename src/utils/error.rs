//! Error types for proxyrank collaborators
//!
//! This module defines the domain errors raised by the subscription fetcher,
//! the probe engine and the server repository.

use thiserror::Error;

/// Errors that can occur while refreshing a subscription
#[derive(Error, Debug)]
pub enum FetchError {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Server answered with a non-success status code
    #[error("Subscription server returned status {0}")]
    Status(u16),

    /// Group has no remote URL
    #[error("Group has no subscription URL")]
    EmptyUrl,

    /// Payload could not be decoded
    #[error("Decoding error: {0}")]
    Decode(String),

    /// Payload decoded but contained no usable server
    #[error("Subscription contained no servers")]
    NoServers,

    /// Maximum retry attempts exceeded
    #[error("Maximum retry attempts exceeded: {0}")]
    MaxRetriesExceeded(String),
}

impl FetchError {
    /// Whether retrying the same request might succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Http(_) | Self::MaxRetriesExceeded(_) => true,
            Self::Status(code) => *code >= 500 || *code == 429,
            Self::EmptyUrl | Self::Decode(_) | Self::NoServers => false,
        }
    }
}

/// Errors produced by a single latency probe
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// Probe did not finish in time
    #[error("Probe timed out")]
    Timeout,

    /// Server refused or dropped the connection
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    /// Server parameters do not name a reachable endpoint
    #[error("Unsupported server parameters: {0}")]
    Unsupported(String),

    /// Probe engine could not be initialized
    #[error("Probe environment unavailable: {0}")]
    Environment(String),
}

/// Errors raised by server repositories
#[derive(Error, Debug)]
pub enum StorageError {
    /// SQLite failure
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored payload could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Group id is not known to the repository
    #[error("Group not found: {0}")]
    GroupNotFound(String),

    /// Server id is not known to the repository
    #[error("Server not found: {0}")]
    ServerNotFound(String),

    /// A lock guarding repository state was poisoned
    #[error("Repository lock poisoned")]
    Poisoned,
}
