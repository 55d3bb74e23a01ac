//! Run controller
//!
//! Sequences one run through its phases:
//!
//! ```text
//! Idle ─▶ UpdatingSubscription ─▶ Deduplicating ─▶ Probing{n,total} ─▶ Ranking ─▶ Done ─▶ Idle
//!   ▲                                                                                       │
//!   └──────────────────────────────── cancel() from any phase ◀─────────────────────────────┘
//! ```
//!
//! Phase changes and cancellation are serialized through the active-run slot:
//! once `cancel()` has published `Idle`, the cancelled run can no longer
//! publish anything. Starting a run cancels the run in progress, if any.
//!
//! Only cancellation ends a run early. A failed subscription fetch is logged
//! and the run continues with the servers already stored; probe failures are
//! recorded as unusable measurements.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::dedup::remove_duplicates;
use super::prober::ConcurrentProber;
use super::ranker::Ranker;
use super::{cancel_pair, CancelHandle, CancelToken};
use crate::config::ProberConfig;
use crate::error::Result;
use crate::models::{Group, RunPhase, SelectedServer, ServerConfig, ServerEntry};
use crate::probe::{Probe, ProbeEnvironment};
use crate::storage::ServerRepository;
use crate::subscription::SubscriptionFetcher;
use crate::utils::error::{FetchError, StorageError};

/// Repository view published for observers
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Every server in stored order with its measurement
    pub servers: Vec<ServerEntry>,
    pub selected: Option<SelectedServer>,
    pub groups: Vec<Group>,
}

/// Summary of a completed run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    /// Groups covered by the run
    pub groups: Vec<String>,

    /// Duplicates removed
    pub removed: usize,

    /// Servers probed
    pub probed: usize,

    /// Servers with a usable measurement
    pub reachable: usize,

    /// Server selected by this run, if auto-select picked one
    pub selected: Option<SelectedServer>,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunReport),
    Cancelled,
}

impl RunOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

struct ActiveRun {
    id: u64,
    cancel: CancelHandle,
}

/// Orchestrates fetch, dedup, probe and rank over stored groups
pub struct RunController {
    repo: Arc<dyn ServerRepository>,
    fetcher: Arc<dyn SubscriptionFetcher>,
    prober: ConcurrentProber,
    ranker: Ranker,
    auto_select: bool,
    phase_tx: watch::Sender<RunPhase>,
    snapshot_tx: watch::Sender<Snapshot>,
    active: Mutex<Option<ActiveRun>>,
    next_run_id: AtomicU64,
}

impl RunController {
    pub fn new(
        repo: Arc<dyn ServerRepository>,
        fetcher: Arc<dyn SubscriptionFetcher>,
        probe: Arc<dyn Probe>,
        config: &ProberConfig,
    ) -> Self {
        let env = Arc::new(ProbeEnvironment::new(probe));
        let prober = ConcurrentProber::new(Arc::clone(&repo), env, config);

        Self {
            ranker: Ranker::new(Arc::clone(&repo)),
            repo,
            fetcher,
            prober,
            auto_select: config.auto_select,
            phase_tx: watch::channel(RunPhase::Idle).0,
            snapshot_tx: watch::channel(Snapshot::default()).0,
            active: Mutex::new(None),
            next_run_id: AtomicU64::new(1),
        }
    }

    /// Observe the current phase
    pub fn phase(&self) -> watch::Receiver<RunPhase> {
        self.phase_tx.subscribe()
    }

    /// Observe the repository view
    pub fn snapshot(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn current_phase(&self) -> RunPhase {
        *self.phase_tx.borrow()
    }

    /// Reload the published snapshot from the repository
    pub async fn refresh(&self) -> Result<()> {
        let snapshot = Snapshot {
            servers: self.repo.list_entries().await?,
            selected: self.repo.get_selected().await?,
            groups: self.repo.list_groups().await?,
        };
        self.snapshot_tx.send_replace(snapshot);
        Ok(())
    }

    /// Run the full pipeline for one group
    pub async fn run_for_group(&self, group_id: &str) -> Result<RunOutcome> {
        let group = self
            .repo
            .get_group(group_id)
            .await?
            .ok_or_else(|| StorageError::GroupNotFound(group_id.to_string()))?;

        self.run(vec![group]).await
    }

    /// Run the full pipeline over every enabled group as one combined batch
    pub async fn run_for_all_enabled_groups(&self) -> Result<RunOutcome> {
        let groups: Vec<Group> = self
            .repo
            .list_groups()
            .await?
            .into_iter()
            .filter(|group| group.enabled)
            .collect();

        self.run(groups).await
    }

    /// Spawn [`run_for_group`](Self::run_for_group) in the background
    pub fn start_run_for_group(self: &Arc<Self>, group_id: impl Into<String>) -> JoinHandle<Result<RunOutcome>> {
        self.cancel_active_run();
        let controller = Arc::clone(self);
        let group_id = group_id.into();
        tokio::spawn(async move { controller.run_for_group(&group_id).await })
    }

    /// Spawn [`run_for_all_enabled_groups`](Self::run_for_all_enabled_groups) in the background
    pub fn start_run_for_all(self: &Arc<Self>) -> JoinHandle<Result<RunOutcome>> {
        self.cancel_active_run();
        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.run_for_all_enabled_groups().await })
    }

    /// Cancel the run in progress, settle in `Idle` and refresh the snapshot
    pub async fn cancel(&self) {
        if self.cancel_active_run() {
            tracing::info!("Run cancelled");
        }

        if let Err(e) = self.refresh().await {
            tracing::warn!(error = %e, "Failed to refresh after cancel");
        }
    }

    /// Manually select a server
    pub async fn select_server(&self, server_id: &str) -> Result<()> {
        let config = self
            .repo
            .get_config(server_id)
            .await?
            .ok_or_else(|| StorageError::ServerNotFound(server_id.to_string()))?;

        let selected = SelectedServer {
            group_id: config.group_id,
            server_id: config.id,
        };
        if self.repo.get_selected().await?.as_ref() == Some(&selected) {
            return Ok(());
        }

        self.repo.set_selected(&selected).await?;
        tracing::info!(server_id, group_id = %selected.group_id, "Server selected");
        self.refresh().await
    }

    /// Enable exactly the listed groups and disable the rest
    pub async fn select_groups(&self, group_ids: &[String]) -> Result<()> {
        for mut group in self.repo.list_groups().await? {
            let enabled = group_ids.contains(&group.id);
            if group.enabled != enabled {
                group.enabled = enabled;
                self.repo.save_group(&group).await?;
            }
        }

        for id in group_ids {
            if self.repo.get_group(id).await?.is_none() {
                tracing::debug!(group_id = %id, "Ignoring unknown group");
            }
        }

        self.refresh().await
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal and forget the active run; publishes `Idle`
    fn cancel_active_run(&self) -> bool {
        let mut active = self.lock_active();
        let Some(run) = active.take() else {
            return false;
        };
        run.cancel.cancel();
        self.phase_tx.send_replace(RunPhase::Idle);
        true
    }

    fn begin_run(&self) -> (u64, CancelToken) {
        let id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let (cancel, token) = cancel_pair();

        let mut active = self.lock_active();
        if let Some(previous) = active.replace(ActiveRun { id, cancel }) {
            tracing::info!(previous = previous.id, "Cancelling previous run");
            previous.cancel.cancel();
        }

        (id, token)
    }

    /// Publish `phase` if run `id` is still the active one
    fn set_phase(&self, id: u64, phase: RunPhase) -> bool {
        let active = self.lock_active();
        match active.as_ref() {
            Some(run) if run.id == id => {
                self.phase_tx.send_replace(phase);
                true
            }
            _ => false,
        }
    }

    /// Release run `id`, publishing `Idle` if it was still active
    fn end_run(&self, id: u64) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|run| run.id == id) {
            *active = None;
            self.phase_tx.send_replace(RunPhase::Idle);
        }
    }

    async fn run(&self, groups: Vec<Group>) -> Result<RunOutcome> {
        let (id, cancel) = self.begin_run();
        let group_ids: Vec<String> = groups.iter().map(|g| g.id.clone()).collect();
        tracing::info!(run = id, groups = ?group_ids, "Run started");

        let result = self.execute(id, cancel, groups).await;

        match &result {
            Ok(RunOutcome::Completed(report)) => {
                tracing::info!(
                    run = id,
                    removed = report.removed,
                    probed = report.probed,
                    reachable = report.reachable,
                    "Run completed"
                );
            }
            Ok(RunOutcome::Cancelled) => tracing::info!(run = id, "Run stopped after cancel"),
            Err(e) => tracing::warn!(run = id, error = %e, "Run failed"),
        }

        self.end_run(id);
        if let Err(e) = self.refresh().await {
            tracing::warn!(error = %e, "Failed to refresh after run");
        }

        result
    }

    async fn execute(&self, id: u64, mut cancel: CancelToken, groups: Vec<Group>) -> Result<RunOutcome> {
        let mut report = RunReport {
            groups: groups.iter().map(|g| g.id.clone()).collect(),
            ..Default::default()
        };

        // Fetch
        let subscribed: Vec<&Group> = groups.iter().filter(|g| g.is_subscribed()).collect();
        if !subscribed.is_empty() {
            if !self.set_phase(id, RunPhase::UpdatingSubscription) {
                return Ok(RunOutcome::Cancelled);
            }
            for group in subscribed {
                let fetched = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(RunOutcome::Cancelled),
                    fetched = self.fetcher.fetch(group) => fetched,
                };
                self.apply_fetch(group, fetched).await?;
            }
            if let Err(e) = self.refresh().await {
                tracing::warn!(error = %e, "Failed to refresh after fetch");
            }
        }

        // Deduplicate
        if !self.set_phase(id, RunPhase::Deduplicating) {
            return Ok(RunOutcome::Cancelled);
        }
        let mut servers: Vec<ServerConfig> = Vec::new();
        for group in &groups {
            let dedup = remove_duplicates(self.repo.as_ref(), &group.id).await?;
            report.removed += dedup.removed.len();
            servers.extend(dedup.remaining);
        }

        // Probe
        let total = servers.len();
        if !self.set_phase(id, RunPhase::Probing { completed: 0, total }) {
            return Ok(RunOutcome::Cancelled);
        }
        let mut batch = self.prober.start(servers, cancel.clone()).await?;
        while let Some(progress) = batch.next_progress().await {
            self.set_phase(
                id,
                RunPhase::Probing {
                    completed: progress.completed,
                    total: progress.total,
                },
            );
        }
        let summary = batch.finish().await?;
        if summary.cancelled || cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }
        report.probed = summary.completed;
        report.reachable = summary.reachable();

        // Rank
        if !self.set_phase(id, RunPhase::Ranking) {
            return Ok(RunOutcome::Cancelled);
        }
        for group in &groups {
            self.ranker.rank(&group.id).await?;
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
        }

        if self.auto_select {
            let best = self.ranker.select_best(&report.groups).await?;
            // A cancelled run must not move the selection
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            match &best {
                Some(selected) => {
                    self.repo.set_selected(selected).await?;
                    tracing::info!(
                        server_id = %selected.server_id,
                        group_id = %selected.group_id,
                        "Selected fastest server"
                    );
                }
                None => tracing::info!("No usable server, selection unchanged"),
            }
            report.selected = best;
        }

        if !self.set_phase(id, RunPhase::Done) {
            return Ok(RunOutcome::Cancelled);
        }

        Ok(RunOutcome::Completed(report))
    }

    async fn apply_fetch(
        &self,
        group: &Group,
        fetched: std::result::Result<Vec<ServerConfig>, FetchError>,
    ) -> Result<()> {
        match fetched {
            Ok(configs) => {
                let ids = self.repo.replace_group_servers(&group.id, configs).await?;
                tracing::info!(group_id = %group.id, servers = ids.len(), "Subscription updated");
            }
            Err(e) => {
                tracing::warn!(
                    group_id = %group.id,
                    error = %e,
                    "Subscription update failed, keeping stored servers"
                );
            }
        }
        Ok(())
    }
}
