//! Concurrent latency probing
//!
//! One task per server, bounded by a semaphore. Each task writes its own
//! measurement as soon as it finishes; the driver task counts completions
//! and emits `(completed, total)` progress events in completion order, so
//! `completed` never decreases and the last event of an uncancelled batch is
//! `(total, total)`.
//!
//! ```text
//!                 ┌──────────┐
//!   servers ────▶ │  driver  │ ── spawn ──▶ probe task × N (≤ max_concurrency running)
//!                 └──────────┘                    │
//!                      ▲                          ├── set_affiliation(id, info)
//!                      └──── join_next ───────────┘
//!                      │
//!                      ▼
//!              mpsc<ProbeProgress> (bounded)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use super::CancelToken;
use crate::config::ProberConfig;
use crate::error::Result;
use crate::models::{AffiliationInfo, ServerConfig};
use crate::probe::{Probe, ProbeEnvironment};
use crate::storage::ServerRepository;
use crate::utils::error::ProbeError;

/// Incremental progress of a probe batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeProgress {
    pub completed: usize,
    pub total: usize,
}

impl ProbeProgress {
    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }
}

/// Final result of a probe batch
#[derive(Debug, Clone, Default)]
pub struct ProbeSummary {
    /// Servers submitted
    pub total: usize,

    /// Probes that finished before the batch ended
    pub completed: usize,

    /// Measured latency per server id; `None` for failed probes
    pub latencies: HashMap<String, Option<Duration>>,

    /// Batch was cancelled before every probe finished
    pub cancelled: bool,
}

impl ProbeSummary {
    /// Number of servers with a usable measurement
    pub fn reachable(&self) -> usize {
        self.latencies.values().filter(|l| l.is_some()).count()
    }
}

/// Fan-out engine running a probe over many servers
pub struct ConcurrentProber {
    repo: Arc<dyn ServerRepository>,
    env: Arc<ProbeEnvironment>,
    max_concurrency: usize,
    progress_buffer: usize,
}

impl ConcurrentProber {
    pub fn new(
        repo: Arc<dyn ServerRepository>,
        env: Arc<ProbeEnvironment>,
        config: &ProberConfig,
    ) -> Self {
        Self::with_limits(repo, env, config.max_concurrency, config.progress_buffer)
    }

    pub fn with_limits(
        repo: Arc<dyn ServerRepository>,
        env: Arc<ProbeEnvironment>,
        max_concurrency: usize,
        progress_buffer: usize,
    ) -> Self {
        Self {
            repo,
            env,
            max_concurrency: max_concurrency.max(1),
            progress_buffer: progress_buffer.max(1),
        }
    }

    /// Start probing `servers`.
    ///
    /// Existing measurements for exactly these servers are cleared before any
    /// probe runs. The returned batch yields progress events and the final
    /// summary.
    pub async fn start(&self, servers: Vec<ServerConfig>, cancel: CancelToken) -> Result<ProbeBatch> {
        let ids: Vec<String> = servers.iter().map(|s| s.id.clone()).collect();
        self.repo.clear_affiliations(&ids).await?;

        let total = servers.len();
        let (progress_tx, progress_rx) = mpsc::channel(self.progress_buffer);

        tracing::info!(
            total,
            max_concurrency = self.max_concurrency,
            "Starting probe batch"
        );

        let handle = tokio::spawn(drive(
            Arc::clone(&self.repo),
            Arc::clone(&self.env),
            servers,
            self.max_concurrency,
            progress_tx,
            cancel,
        ));

        Ok(ProbeBatch {
            progress: progress_rx,
            handle,
            total,
        })
    }

    /// Probe `servers` to completion, discarding progress events
    pub async fn probe_all(&self, servers: Vec<ServerConfig>, cancel: CancelToken) -> Result<ProbeSummary> {
        self.start(servers, cancel).await?.finish().await
    }
}

/// A running probe batch
pub struct ProbeBatch {
    progress: mpsc::Receiver<ProbeProgress>,
    handle: JoinHandle<ProbeSummary>,
    total: usize,
}

impl ProbeBatch {
    pub fn total(&self) -> usize {
        self.total
    }

    /// Next progress event; `None` once the batch has ended
    pub async fn next_progress(&mut self) -> Option<ProbeProgress> {
        self.progress.recv().await
    }

    /// Progress events as a stream
    pub fn progress_stream(&mut self) -> impl Stream<Item = ProbeProgress> + '_ {
        futures::stream::poll_fn(move |cx| self.progress.poll_recv(cx))
    }

    /// Wait for the batch to end and collect its summary
    pub async fn finish(self) -> Result<ProbeSummary> {
        drop(self.progress);
        Ok(self.handle.await?)
    }
}

async fn drive(
    repo: Arc<dyn ServerRepository>,
    env: Arc<ProbeEnvironment>,
    servers: Vec<ServerConfig>,
    max_concurrency: usize,
    progress_tx: mpsc::Sender<ProbeProgress>,
    mut cancel: CancelToken,
) -> ProbeSummary {
    let total = servers.len();
    let mut summary = ProbeSummary {
        total,
        ..Default::default()
    };

    // Receiver gone means nobody is watching; keep probing anyway
    let _ = progress_tx.send(ProbeProgress { completed: 0, total }).await;
    if total == 0 {
        return summary;
    }

    let probe = match env.acquire().await {
        Ok(probe) => Some(probe),
        Err(e) => {
            tracing::warn!(error = %e, "Probe environment unavailable, marking batch unreachable");
            None
        }
    };

    let semaphore = Arc::new(Semaphore::new(max_concurrency));
    let mut tasks = JoinSet::new();

    for server in servers {
        tasks.spawn(probe_one(
            Arc::clone(&repo),
            probe.clone(),
            Arc::clone(&semaphore),
            server,
            cancel.clone(),
        ));
    }

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                summary.cancelled = true;
                tasks.abort_all();
                break;
            }

            joined = tasks.join_next() => {
                match joined {
                    None => break,
                    Some(Ok(Some((id, latency)))) => {
                        summary.completed += 1;
                        summary.latencies.insert(id, latency);
                    }
                    // Cancelled before acquiring a permit
                    Some(Ok(None)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Probe task failed");
                        summary.completed += 1;
                    }
                }

                let _ = progress_tx
                    .send(ProbeProgress {
                        completed: summary.completed,
                        total,
                    })
                    .await;
            }
        }
    }

    // Reap aborted tasks; probes that already finished may still have written
    while let Some(joined) = tasks.join_next().await {
        if let Ok(Some((id, latency))) = joined {
            summary.latencies.insert(id, latency);
        }
    }

    tracing::info!(
        total,
        completed = summary.completed,
        reachable = summary.reachable(),
        cancelled = summary.cancelled,
        "Probe batch finished"
    );

    summary
}

async fn probe_one(
    repo: Arc<dyn ServerRepository>,
    probe: Option<Arc<dyn Probe>>,
    semaphore: Arc<Semaphore>,
    server: ServerConfig,
    mut cancel: CancelToken,
) -> Option<(String, Option<Duration>)> {
    let outcome = match probe {
        None => Err(ProbeError::Environment("probe engine not initialized".into())),
        Some(probe) => {
            let _permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit.ok(),
                _ = cancel.cancelled() => return None,
            };
            probe.probe(&server).await
        }
    };

    let info = match &outcome {
        Ok(latency) => AffiliationInfo::measured(*latency),
        Err(e) => {
            tracing::debug!(server_id = %server.id, name = %server.name, error = %e, "Probe failed");
            AffiliationInfo::unreachable()
        }
    };

    if let Err(e) = repo.set_affiliation(&server.id, &info).await {
        tracing::warn!(server_id = %server.id, error = %e, "Failed to store measurement");
    }

    Some((server.id, info.latency()))
}
