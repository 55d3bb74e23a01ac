//! Duplicate server removal
//!
//! Two servers are duplicates when their protocol kind and parameters are
//! structurally equal; names and ids do not count. The earliest server in
//! stored order survives, later copies are removed.
//!
//! The scan is pairwise (O(n²)) over one group at a time. Groups hold
//! hundreds of servers, not millions; `benches/dedup_bench.rs` tracks the
//! cost if that assumption changes.

use crate::error::Result;
use crate::models::ServerConfig;
use crate::storage::ServerRepository;

/// Ids of servers that duplicate an earlier server, in input order.
///
/// Pure function: nothing is removed here.
pub fn deduplicate(servers: &[ServerConfig]) -> Vec<String> {
    let mut marked = vec![false; servers.len()];
    let mut removals = Vec::new();

    for (i, kept) in servers.iter().enumerate() {
        if marked[i] {
            // Anything equal to a removed server was already marked by its original
            continue;
        }
        for (j, candidate) in servers.iter().enumerate().skip(i + 1) {
            if !marked[j] && kept.is_duplicate_of(candidate) {
                marked[j] = true;
            }
        }
    }

    for (server, removed) in servers.iter().zip(&marked) {
        if *removed {
            removals.push(server.id.clone());
        }
    }

    removals
}

/// Outcome of deduplicating one group
#[derive(Debug, Clone, Default)]
pub struct DedupReport {
    /// Ids removed from the repository
    pub removed: Vec<String>,

    /// Surviving servers in stored order
    pub remaining: Vec<ServerConfig>,
}

/// Deduplicate a group in place and return the survivors
pub async fn remove_duplicates(repo: &dyn ServerRepository, group_id: &str) -> Result<DedupReport> {
    let servers = repo.list_group_configs(group_id).await?;
    let removed = deduplicate(&servers);

    for id in &removed {
        repo.remove_server(id).await?;
    }

    if !removed.is_empty() {
        tracing::info!(group_id, removed = removed.len(), "Removed duplicate servers");
    }

    let remaining = servers
        .into_iter()
        .filter(|server| !removed.contains(&server.id))
        .collect();

    Ok(DedupReport { removed, remaining })
}
