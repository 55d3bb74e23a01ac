//! Latency probes
//!
//! A [`Probe`] measures one server. Engines that need global setup before
//! the first measurement (loading assets, starting a core) do it in
//! [`Probe::initialize`], which [`ProbeEnvironment`] runs exactly once and
//! then shares across every later batch.

pub mod tcp;

pub use tcp::TcpProbe;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::models::ServerConfig;
use crate::utils::error::ProbeError;

/// Connectivity/latency measurement against one server
#[async_trait]
pub trait Probe: Send + Sync {
    /// One-time engine setup, run before the first batch
    async fn initialize(&self) -> Result<(), ProbeError> {
        Ok(())
    }

    /// Measure the server; the probe owns its own timeout
    async fn probe(&self, config: &ServerConfig) -> Result<Duration, ProbeError>;
}

/// Scoped access to an initialized probe engine
pub struct ProbeEnvironment {
    probe: Arc<dyn Probe>,
    initialized: OnceCell<()>,
}

impl ProbeEnvironment {
    pub fn new(probe: Arc<dyn Probe>) -> Self {
        Self {
            probe,
            initialized: OnceCell::new(),
        }
    }

    /// Initialize the engine on first use and hand out the probe.
    ///
    /// A failed initialization is retried by the next caller.
    pub async fn acquire(&self) -> Result<Arc<dyn Probe>, ProbeError> {
        self.initialized
            .get_or_try_init(|| async {
                self.probe.initialize().await?;
                tracing::debug!("Probe environment initialized");
                Ok::<(), ProbeError>(())
            })
            .await?;

        Ok(Arc::clone(&self.probe))
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.initialized()
    }
}
