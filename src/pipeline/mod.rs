//! Server-list reconciliation pipeline
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Subscription │   │    Dedup     │   │  Concurrent  │   │    Ranker    │
//! │   Fetcher    │──▶│              │──▶│    Prober    │──▶│              │
//! └──────────────┘   └──────────────┘   └──────────────┘   └──────────────┘
//!        │                  │                  │                  │
//!        └──────────────────┴────────┬─────────┴──────────────────┘
//!                                    │
//!                         RunController (RunPhase)
//! ```
//!
//! - [`dedup`] - pure duplicate detection plus repository application
//! - [`prober`] - bounded fan-out of latency probes with progress events
//! - [`ranker`] - latency ordering and best-server selection
//! - [`controller`] - the run state machine that sequences the stages

pub mod controller;
pub mod dedup;
pub mod prober;
pub mod ranker;

pub use controller::{RunController, RunOutcome, RunReport, Snapshot};
pub use dedup::{deduplicate, remove_duplicates, DedupReport};
pub use prober::{ConcurrentProber, ProbeBatch, ProbeProgress, ProbeSummary};
pub use ranker::{rank_order, Ranker};

use tokio::sync::watch;

/// Sender side of a cooperative cancellation signal
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Receiver side of a cooperative cancellation signal
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

/// Create a linked cancellation handle and token
pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    /// Signal every token linked to this handle
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Another token for the same signal
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        cancel_pair().1
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested.
    ///
    /// Never resolves if the handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
