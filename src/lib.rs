//! proxyrank - proxy server list reconciliation and latency ranking
//!
//! Keeps subscribed groups of proxy servers up to date, removes duplicate
//! configurations, probes every server concurrently and ranks them by
//! measured latency, optionally selecting the fastest one.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Core data structures and types
//! - [`storage`] - Server repository (SQLite, in-memory)
//! - [`subscription`] - Subscription download and share-link parsing
//! - [`probe`] - Latency probes and probe engine setup
//! - [`pipeline`] - Dedup, concurrent probing, ranking and the run controller
//! - [`utils`] - Common utilities and helpers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use proxyrank::config::Config;
//! use proxyrank::pipeline::RunController;
//! use proxyrank::probe::TcpProbe;
//! use proxyrank::storage::SqliteServerRepository;
//! use proxyrank::subscription::HttpSubscriptionFetcher;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let repo = Arc::new(SqliteServerRepository::new(&config.storage.sqlite_path)?);
//!     let fetcher = Arc::new(HttpSubscriptionFetcher::from_config(&config)?);
//!     let probe = Arc::new(TcpProbe::new(config.probe_timeout()));
//!
//!     let controller = RunController::new(repo, fetcher, probe, &config.prober);
//!     controller.run_for_all_enabled_groups().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod probe;
pub mod storage;
pub mod subscription;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, ProxyrankErrorTrait, Result};
    pub use crate::models::{
        AffiliationInfo, Group, Outbound, RunPhase, SelectedServer, ServerConfig, ServerEntry,
    };
    pub use crate::pipeline::{RunController, RunOutcome, RunReport, Snapshot};
    pub use crate::probe::{Probe, TcpProbe};
    pub use crate::storage::{MemoryServerRepository, ServerRepository, SqliteServerRepository};
    pub use crate::subscription::{HttpSubscriptionFetcher, SubscriptionFetcher};
}

// Direct re-exports for convenience
pub use models::{AffiliationInfo, Group, RunPhase, SelectedServer, ServerConfig};
