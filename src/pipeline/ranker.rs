//! Latency ranking and best-server selection
//!
//! Usable servers sort by ascending latency; servers without a usable
//! measurement go last. The sort is stable, so equal latencies (and the whole
//! unusable tail) keep their previous stored order.

use std::sync::Arc;

use crate::error::Result;
use crate::models::{AffiliationInfo, SelectedServer};
use crate::storage::ServerRepository;

/// Sort key: unusable servers rank after every real latency
fn rank_key(info: Option<&AffiliationInfo>) -> i64 {
    match info {
        Some(info) if info.is_usable() => info.latency_ms,
        _ => i64::MAX,
    }
}

/// Order `entries` by latency, keeping input order among equals
pub fn rank_order(entries: &[(String, Option<AffiliationInfo>)]) -> Vec<String> {
    let mut ranked: Vec<&(String, Option<AffiliationInfo>)> = entries.iter().collect();
    ranked.sort_by_key(|(_, info)| rank_key(info.as_ref()));
    ranked.into_iter().map(|(id, _)| id.clone()).collect()
}

/// Applies latency ranking to stored groups
pub struct Ranker {
    repo: Arc<dyn ServerRepository>,
}

impl Ranker {
    pub fn new(repo: Arc<dyn ServerRepository>) -> Self {
        Self { repo }
    }

    /// Reorder a group by latency and persist the new order
    pub async fn rank(&self, group_id: &str) -> Result<Vec<String>> {
        let entries = self.measured_members(group_id).await?;
        let order = rank_order(&entries);

        self.repo.set_server_order(group_id, &order).await?;

        tracing::debug!(group_id, servers = order.len(), "Ranked group");
        Ok(order)
    }

    /// Fastest usable server across `group_ids`.
    ///
    /// Ties go to the group listed first, then to the earlier stored position.
    pub async fn select_best(&self, group_ids: &[String]) -> Result<Option<SelectedServer>> {
        let mut best: Option<(i64, SelectedServer)> = None;

        for group_id in group_ids {
            for (server_id, info) in self.measured_members(group_id).await? {
                let Some(info) = info.filter(AffiliationInfo::is_usable) else {
                    continue;
                };
                if best.as_ref().is_some_and(|(latency, _)| *latency <= info.latency_ms) {
                    continue;
                }
                best = Some((
                    info.latency_ms,
                    SelectedServer {
                        group_id: group_id.clone(),
                        server_id,
                    },
                ));
            }
        }

        Ok(best.map(|(_, selected)| selected))
    }

    async fn measured_members(&self, group_id: &str) -> Result<Vec<(String, Option<AffiliationInfo>)>> {
        let ids = self.repo.list_server_ids(group_id).await?;
        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let info = self.repo.get_affiliation(&id).await?;
            entries.push((id, info));
        }
        Ok(entries)
    }
}
