pub mod groups;
pub mod run;
pub mod servers;

// Re-export command functions for convenience
pub use groups::{add_group, enable_groups, list_groups};
pub use run::{run, RunTarget};
pub use servers::{list_servers, select_server};

use std::sync::Arc;

use anyhow::{Context, Result};

use proxyrank::config::Config;
use proxyrank::pipeline::RunController;
use proxyrank::probe::TcpProbe;
use proxyrank::storage::{ServerRepository, SqliteServerRepository};
use proxyrank::subscription::HttpSubscriptionFetcher;

/// Open the configured SQLite repository, creating its directory if needed
pub fn open_repository(config: &Config) -> Result<Arc<dyn ServerRepository>> {
    let path = &config.storage.sqlite_path;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
    }

    let repo = SqliteServerRepository::new(path)
        .with_context(|| format!("Failed to open database: {}", path.display()))?;

    Ok(Arc::new(repo))
}

/// Wire the production fetcher and probe into a controller
pub fn build_controller(config: &Config, repo: Arc<dyn ServerRepository>) -> Result<Arc<RunController>> {
    let fetcher = HttpSubscriptionFetcher::from_config(config)
        .context("Failed to create subscription fetcher")?;
    let probe = TcpProbe::new(config.probe_timeout());

    Ok(Arc::new(RunController::new(
        repo,
        Arc::new(fetcher),
        Arc::new(probe),
        &config.prober,
    )))
}
