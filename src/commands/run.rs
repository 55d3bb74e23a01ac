use std::sync::Arc;

use anyhow::{Context, Result};

use proxyrank::error::ProxyrankErrorTrait;
use proxyrank::models::RunPhase;
use proxyrank::pipeline::{RunController, RunOutcome};

/// What a `run` command covers
#[derive(Debug, Clone)]
pub enum RunTarget {
    Group(String),
    AllEnabled,
}

pub async fn run(controller: Arc<RunController>, target: RunTarget) -> Result<()> {
    controller.refresh().await?;

    let mut phase = controller.phase();
    let mut handle = match &target {
        RunTarget::Group(id) => controller.start_run_for_group(id.clone()),
        RunTarget::AllEnabled => controller.start_run_for_all(),
    };

    let watcher = tokio::spawn(async move {
        let mut last = RunPhase::Idle;
        while phase.changed().await.is_ok() {
            let current = *phase.borrow_and_update();
            if current == last {
                continue;
            }
            match current {
                RunPhase::Probing { completed, total } => {
                    tracing::info!(completed, total, "Probing");
                }
                other => tracing::info!(phase = %other, "Phase changed"),
            }
            last = current;
        }
    });

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, cancelling run");
            controller.cancel().await;
            handle.await
        }
    };
    watcher.abort();

    let outcome = match joined.context("Run task failed")? {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(
                error = %e,
                category = %e.category(),
                recoverable = e.is_recoverable(),
                "Run failed"
            );
            return Err(e.into());
        }
    };

    match outcome {
        RunOutcome::Completed(report) => {
            println!("Run complete");
            println!("================================");
            println!("  Groups: {}", report.groups.len());
            println!("  Duplicates removed: {}", report.removed);
            println!("  Probed: {}", report.probed);
            println!("  Reachable: {}", report.reachable);
            match report.selected {
                Some(selected) => println!("  Selected: {}", selected.server_id),
                None => println!("  Selected: unchanged"),
            }
        }
        RunOutcome::Cancelled => {
            println!("Run cancelled; measurements taken so far were kept.");
        }
    }

    Ok(())
}
