//! End-to-end pipeline integration tests
//!
//! Tests the complete workflow:
//! 1. Subscription refresh (scripted)
//! 2. Duplicate removal
//! 3. Concurrent probing
//! 4. Ranking and auto-selection

use std::sync::{Arc, Mutex};
use std::time::Duration;

use proxyrank::models::{RunPhase, SelectedServer};
use proxyrank::pipeline::{CancelToken, ConcurrentProber, ProbeProgress, RunOutcome, RunReport};
use proxyrank::probe::ProbeEnvironment;
use proxyrank::storage::{MemoryServerRepository, ServerRepository, SqliteServerRepository};
use tempfile::TempDir;

use super::fixtures::{encoded, numbered_hosts, LINKS_WITH_DUPLICATE, SAMPLE_LINKS};
use crate::common::{
    create_controller, create_server, seed_group, FetchScript, ProbeScript, ScriptedFetcher,
    ScriptedProbe,
};

fn completed(outcome: RunOutcome) -> RunReport {
    match outcome {
        RunOutcome::Completed(report) => report,
        RunOutcome::Cancelled => panic!("run was cancelled"),
    }
}

fn stage(phase: &RunPhase) -> u8 {
    match phase {
        RunPhase::Idle => 0,
        RunPhase::UpdatingSubscription => 1,
        RunPhase::Deduplicating => 2,
        RunPhase::Probing { .. } => 3,
        RunPhase::Ranking => 4,
        RunPhase::Done => 5,
    }
}

// ============================================================================
// Complete Pipeline Tests
// ============================================================================

#[tokio::test]
async fn test_fetch_failure_keeps_stored_servers() {
    let repo = Arc::new(MemoryServerRepository::new());
    let hosts = numbered_hosts(10);
    let pairs: Vec<(&str, &str)> = hosts.iter().map(|(n, h)| (n.as_str(), h.as_str())).collect();
    let (group, servers) = seed_group(repo.as_ref(), "remote", "https://sub.example/feed", &pairs).await;

    let fetcher = Arc::new(ScriptedFetcher::new().script(&group.id, FetchScript::Fail(502)));
    let scripts: Vec<(&str, ProbeScript)> = hosts
        .iter()
        .enumerate()
        .map(|(i, (_, h))| (h.as_str(), ProbeScript::Latency(10 + i as u64)))
        .collect();
    let probe = Arc::new(ScriptedProbe::new(&scripts));
    let controller = create_controller(repo.clone(), fetcher.clone(), probe.clone(), true);

    let report = completed(controller.run_for_group(&group.id).await.unwrap());

    assert_eq!(fetcher.calls(), 1);
    assert_eq!(report.removed, 0);
    assert_eq!(report.probed, 10);
    assert_eq!(report.reachable, 10);
    assert_eq!(probe.probed(), 10);

    let ids = repo.list_server_ids(&group.id).await.unwrap();
    let expected: Vec<String> = servers.iter().map(|s| s.id.clone()).collect();
    assert_eq!(ids, expected, "latencies ascend with stored order");
    assert_eq!(controller.current_phase(), RunPhase::Idle);
}

#[tokio::test]
async fn test_duplicate_removed_before_probing() {
    let repo = Arc::new(MemoryServerRepository::new());
    let (group, servers) = seed_group(
        repo.as_ref(),
        "local",
        "",
        &[
            ("a", "a.example"),
            ("b", "b.example"),
            ("c", "c.example"),
            ("d", "d.example"),
            ("a again", "a.example"),
        ],
    )
    .await;

    let probe = Arc::new(ScriptedProbe::new(&[
        ("a.example", ProbeScript::Latency(80)),
        ("b.example", ProbeScript::Latency(40)),
        ("c.example", ProbeScript::Latency(200)),
        ("d.example", ProbeScript::Timeout),
    ]));
    let controller = create_controller(repo.clone(), Arc::new(ScriptedFetcher::new()), probe.clone(), true);

    let report = completed(controller.run_for_group(&group.id).await.unwrap());

    assert_eq!(report.removed, 1);
    assert_eq!(report.probed, 4);
    assert_eq!(probe.probed(), 4);
    assert!(repo.get_config(&servers[4].id).await.unwrap().is_none());

    let ids = repo.list_server_ids(&group.id).await.unwrap();
    assert_eq!(
        ids,
        vec![
            servers[1].id.clone(),
            servers[0].id.clone(),
            servers[2].id.clone(),
            servers[3].id.clone(),
        ]
    );

    let expected = SelectedServer {
        group_id: group.id.clone(),
        server_id: servers[1].id.clone(),
    };
    assert_eq!(report.selected.as_ref(), Some(&expected));
    assert_eq!(repo.get_selected().await.unwrap(), Some(expected));
}

#[tokio::test]
async fn test_timeout_ranked_after_reachable() {
    let repo = Arc::new(MemoryServerRepository::new());
    let (group, servers) = seed_group(
        repo.as_ref(),
        "local",
        "",
        &[("X", "x.example"), ("Y", "y.example")],
    )
    .await;
    let probe = Arc::new(ScriptedProbe::new(&[
        ("x.example", ProbeScript::Timeout),
        ("y.example", ProbeScript::Latency(120)),
    ]));
    let controller = create_controller(repo.clone(), Arc::new(ScriptedFetcher::new()), probe, false);

    completed(controller.run_for_group(&group.id).await.unwrap());

    let (x, y) = (&servers[0], &servers[1]);
    assert_eq!(
        repo.list_server_ids(&group.id).await.unwrap(),
        vec![y.id.clone(), x.id.clone()]
    );

    let x_info = repo.get_affiliation(&x.id).await.unwrap().unwrap();
    let y_info = repo.get_affiliation(&y.id).await.unwrap().unwrap();
    assert!(!x_info.is_usable());
    assert_eq!(x_info.latency_label(), "");
    assert_eq!(y_info.latency_ms, 120);
    assert_eq!(y_info.latency_label(), "120ms");
}

#[tokio::test]
async fn test_fetch_success_replaces_servers() {
    let repo = Arc::new(MemoryServerRepository::new());
    let (group, old) = seed_group(
        repo.as_ref(),
        "remote",
        "https://sub.example/feed",
        &[("stale 1", "old1.example"), ("stale 2", "old2.example")],
    )
    .await;

    let fetcher = Arc::new(
        ScriptedFetcher::new().script(&group.id, FetchScript::Payload(encoded(LINKS_WITH_DUPLICATE))),
    );
    let probe = Arc::new(ScriptedProbe::new(&[
        ("tokyo.example.com", ProbeScript::Latency(50)),
        ("osaka.example.com", ProbeScript::Latency(30)),
    ]));
    let controller = create_controller(repo.clone(), fetcher, probe, true);

    let report = completed(controller.run_for_group(&group.id).await.unwrap());
    assert_eq!(report.removed, 1);
    assert_eq!(report.probed, 2);

    for stale in &old {
        assert!(repo.get_config(&stale.id).await.unwrap().is_none());
    }

    let names: Vec<String> = repo
        .list_group_configs(&group.id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.name)
        .collect();
    assert_eq!(names, vec!["Osaka", "Tokyo"]);
}

#[tokio::test]
async fn test_refresh_drops_selection_of_replaced_server() {
    let repo = Arc::new(MemoryServerRepository::new());
    let (group, old) = seed_group(
        repo.as_ref(),
        "remote",
        "https://sub.example/feed",
        &[("stale", "old.example")],
    )
    .await;
    repo.set_selected(&SelectedServer {
        group_id: group.id.clone(),
        server_id: old[0].id.clone(),
    })
    .await
    .unwrap();

    let fetcher = Arc::new(
        ScriptedFetcher::new().script(&group.id, FetchScript::Payload(encoded(SAMPLE_LINKS))),
    );
    let controller = create_controller(repo.clone(), fetcher, Arc::new(ScriptedProbe::new(&[])), false);

    completed(controller.run_for_group(&group.id).await.unwrap());

    assert!(repo.get_selected().await.unwrap().is_none());
    assert!(controller.snapshot().borrow().selected.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_phases_run_in_order() {
    let repo = Arc::new(MemoryServerRepository::new());
    let (group, _) = seed_group(repo.as_ref(), "remote", "https://sub.example/feed", &[]).await;

    let fetcher = Arc::new(ScriptedFetcher::new().script(&group.id, FetchScript::Payload(SAMPLE_LINKS.to_string())));
    let probe = Arc::new(
        ScriptedProbe::new(&[
            ("tokyo.example.com", ProbeScript::Latency(70)),
            ("osaka.example.com", ProbeScript::Latency(20)),
        ])
        .with_delay(Duration::from_millis(10)),
    );
    let controller = create_controller(repo.clone(), fetcher, probe, true);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut phase = controller.phase();
    let collector = {
        let seen = Arc::clone(&seen);
        tokio::spawn(async move {
            while phase.changed().await.is_ok() {
                let current = *phase.borrow_and_update();
                seen.lock().unwrap().push(current);
                if current == RunPhase::Idle {
                    break;
                }
            }
        })
    };

    let report = completed(controller.start_run_for_group(group.id.clone()).await.unwrap().unwrap());
    tokio::time::timeout(Duration::from_secs(5), collector)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.probed, 3);
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.last(), Some(&RunPhase::Idle));

    let running = &seen[..seen.len() - 1];
    assert!(running.windows(2).all(|w| stage(&w[0]) <= stage(&w[1])), "{seen:?}");

    let progress: Vec<usize> = running
        .iter()
        .filter_map(|p| match p {
            RunPhase::Probing { completed, total } => {
                assert_eq!(*total, 3);
                Some(*completed)
            }
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
}

#[tokio::test]
async fn test_progress_monotonic_and_complete() {
    let repo = Arc::new(MemoryServerRepository::new());
    let hosts = numbered_hosts(30);
    let servers: Vec<_> = hosts.iter().map(|(n, h)| create_server("g", n, h)).collect();
    let scripts: Vec<(&str, ProbeScript)> = hosts
        .iter()
        .enumerate()
        .map(|(i, (_, h))| {
            let script = if i % 4 == 0 {
                ProbeScript::Timeout
            } else {
                ProbeScript::Latency(5 + (i as u64 * 7) % 40)
            };
            (h.as_str(), script)
        })
        .collect();
    let probe = Arc::new(ScriptedProbe::new(&scripts).with_delay(Duration::from_millis(2)));
    let prober = ConcurrentProber::with_limits(repo.clone(), Arc::new(ProbeEnvironment::new(probe)), 5, 4);

    let mut batch = prober.start(servers.clone(), CancelToken::never()).await.unwrap();
    let mut events = Vec::new();
    while let Some(progress) = batch.next_progress().await {
        events.push(progress);
    }
    let summary = batch.finish().await.unwrap();

    assert_eq!(events.first(), Some(&ProbeProgress { completed: 0, total: 30 }));
    assert_eq!(events.last(), Some(&ProbeProgress { completed: 30, total: 30 }));
    assert!(events.windows(2).all(|w| w[0].completed <= w[1].completed));
    assert_eq!(summary.completed, 30);

    for server in &servers {
        let info = repo.get_affiliation(&server.id).await.unwrap().unwrap();
        assert!(info.latency_ms >= 0);
    }
}

#[tokio::test]
async fn test_run_all_enabled_groups_as_one_batch() {
    let repo = Arc::new(MemoryServerRepository::new());
    let (a, _) = seed_group(repo.as_ref(), "A", "", &[("a1", "a1.example"), ("a2", "a2.example")]).await;
    let (b, b_servers) =
        seed_group(repo.as_ref(), "B", "", &[("b1", "b1.example"), ("b2", "b2.example")]).await;
    let (mut c, c_servers) = seed_group(repo.as_ref(), "C", "", &[("c1", "c1.example")]).await;
    c.enabled = false;
    repo.save_group(&c).await.unwrap();

    let probe = Arc::new(ScriptedProbe::new(&[
        ("a1.example", ProbeScript::Latency(90)),
        ("a2.example", ProbeScript::Timeout),
        ("b1.example", ProbeScript::Latency(60)),
        ("b2.example", ProbeScript::Latency(25)),
        ("c1.example", ProbeScript::Latency(5)),
    ]));
    let controller = create_controller(repo.clone(), Arc::new(ScriptedFetcher::new()), probe.clone(), true);

    let report = completed(controller.run_for_all_enabled_groups().await.unwrap());

    assert_eq!(report.groups, vec![a.id.clone(), b.id.clone()]);
    assert_eq!(report.probed, 4);
    assert_eq!(probe.probed(), 4);
    assert_eq!(
        report.selected,
        Some(SelectedServer {
            group_id: b.id.clone(),
            server_id: b_servers[1].id.clone(),
        })
    );
    assert!(repo.get_affiliation(&c_servers[0].id).await.unwrap().is_none());
    assert_eq!(
        repo.list_server_ids(&b.id).await.unwrap(),
        vec![b_servers[1].id.clone(), b_servers[0].id.clone()]
    );
}

#[tokio::test]
async fn test_auto_select_disabled_keeps_selection() {
    let repo = Arc::new(MemoryServerRepository::new());
    let (group, servers) = seed_group(
        repo.as_ref(),
        "local",
        "",
        &[("slow", "slow.example"), ("fast", "fast.example")],
    )
    .await;
    let manual = SelectedServer {
        group_id: group.id.clone(),
        server_id: servers[0].id.clone(),
    };
    repo.set_selected(&manual).await.unwrap();

    let probe = Arc::new(ScriptedProbe::new(&[
        ("slow.example", ProbeScript::Latency(400)),
        ("fast.example", ProbeScript::Latency(15)),
    ]));
    let controller = create_controller(repo.clone(), Arc::new(ScriptedFetcher::new()), probe, false);

    let report = completed(controller.run_for_group(&group.id).await.unwrap());

    assert!(report.selected.is_none());
    assert_eq!(repo.get_selected().await.unwrap(), Some(manual));
}

#[tokio::test]
async fn test_no_usable_server_keeps_selection() {
    let repo = Arc::new(MemoryServerRepository::new());
    let (group, servers) =
        seed_group(repo.as_ref(), "local", "", &[("x", "x.example"), ("y", "y.example")]).await;
    let previous = SelectedServer {
        group_id: group.id.clone(),
        server_id: servers[1].id.clone(),
    };
    repo.set_selected(&previous).await.unwrap();

    let probe = Arc::new(ScriptedProbe::new(&[]));
    let controller = create_controller(repo.clone(), Arc::new(ScriptedFetcher::new()), probe, true);

    let report = completed(controller.run_for_group(&group.id).await.unwrap());

    assert_eq!(report.reachable, 0);
    assert!(report.selected.is_none());
    assert_eq!(repo.get_selected().await.unwrap(), Some(previous));
}

#[tokio::test]
async fn test_snapshot_refreshed_after_run() {
    let repo = Arc::new(MemoryServerRepository::new());
    let (group, servers) =
        seed_group(repo.as_ref(), "local", "", &[("x", "x.example"), ("y", "y.example")]).await;
    let probe = Arc::new(ScriptedProbe::new(&[
        ("x.example", ProbeScript::Latency(300)),
        ("y.example", ProbeScript::Latency(30)),
    ]));
    let controller = create_controller(repo, Arc::new(ScriptedFetcher::new()), probe, true);
    let snapshot = controller.snapshot();
    assert!(snapshot.borrow().servers.is_empty());

    completed(controller.run_for_group(&group.id).await.unwrap());

    let view = snapshot.borrow().clone();
    assert_eq!(view.groups.len(), 1);
    assert_eq!(view.servers.len(), 2);
    assert_eq!(view.servers[0].config.id, servers[1].id);
    assert_eq!(view.servers[0].latency_ms(), Some(30));
    assert_eq!(view.selected.map(|s| s.server_id), Some(servers[1].id.clone()));
}

#[tokio::test]
async fn test_sqlite_backed_run_persists() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("proxyrank.db");

    let (group, servers) = {
        let repo = Arc::new(SqliteServerRepository::new(&db_path).unwrap());
        let (group, servers) = seed_group(
            repo.as_ref(),
            "local",
            "",
            &[("x", "x.example"), ("y", "y.example"), ("x dup", "x.example")],
        )
        .await;
        let probe = Arc::new(ScriptedProbe::new(&[
            ("x.example", ProbeScript::Latency(250)),
            ("y.example", ProbeScript::Latency(45)),
        ]));
        let controller = create_controller(repo, Arc::new(ScriptedFetcher::new()), probe, true);

        let report = completed(controller.run_for_group(&group.id).await.unwrap());
        assert_eq!(report.removed, 1);
        (group, servers)
    };

    let reopened = SqliteServerRepository::new(&db_path).unwrap();
    assert_eq!(
        reopened.list_server_ids(&group.id).await.unwrap(),
        vec![servers[1].id.clone(), servers[0].id.clone()]
    );
    assert_eq!(
        reopened.get_selected().await.unwrap().map(|s| s.server_id),
        Some(servers[1].id.clone())
    );
    assert_eq!(
        reopened.get_affiliation(&servers[1].id).await.unwrap().unwrap().latency_ms,
        45
    );
}

// ============================================================================
// Cancellation Tests
// ============================================================================

#[tokio::test]
async fn test_cancel_mid_probe() {
    let repo = Arc::new(MemoryServerRepository::new());
    let (group, _) = seed_group(
        repo.as_ref(),
        "local",
        "",
        &[
            ("fast", "fast.example"),
            ("h1", "h1.example"),
            ("h2", "h2.example"),
            ("h3", "h3.example"),
        ],
    )
    .await;
    let probe = Arc::new(ScriptedProbe::new(&[
        ("fast.example", ProbeScript::Latency(10)),
        ("h1.example", ProbeScript::Hang),
        ("h2.example", ProbeScript::Hang),
        ("h3.example", ProbeScript::Hang),
    ]));
    let controller = create_controller(repo.clone(), Arc::new(ScriptedFetcher::new()), probe, true);
    let mut phase = controller.phase();

    let run = controller.start_run_for_group(group.id.clone());
    phase
        .wait_for(|p| matches!(p, RunPhase::Probing { completed, .. } if *completed >= 1))
        .await
        .unwrap();

    controller.cancel().await;
    assert_eq!(controller.current_phase(), RunPhase::Idle);

    let outcome = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
    assert_eq!(controller.current_phase(), RunPhase::Idle);

    let ids = repo.list_server_ids(&group.id).await.unwrap();
    assert_eq!(ids.len(), 4);
    assert_eq!(controller.snapshot().borrow().servers.len(), 4);
    // Nothing ran to Ranking, so no selection was made
    assert!(repo.get_selected().await.unwrap().is_none());
}

#[tokio::test]
async fn test_new_run_cancels_previous() {
    let repo = Arc::new(MemoryServerRepository::new());
    let (stuck, _) = seed_group(repo.as_ref(), "stuck", "", &[("h", "hang.example")]).await;
    let (quick, quick_servers) = seed_group(repo.as_ref(), "quick", "", &[("q", "quick.example")]).await;
    let probe = Arc::new(ScriptedProbe::new(&[
        ("hang.example", ProbeScript::Hang),
        ("quick.example", ProbeScript::Latency(12)),
    ]));
    let controller = create_controller(repo.clone(), Arc::new(ScriptedFetcher::new()), probe, true);
    let mut phase = controller.phase();

    let first = controller.start_run_for_group(stuck.id.clone());
    phase
        .wait_for(|p| matches!(p, RunPhase::Probing { .. }))
        .await
        .unwrap();

    let second = controller.start_run_for_group(quick.id.clone());

    let first = tokio::time::timeout(Duration::from_secs(5), first)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), second)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(first.is_cancelled());
    let report = completed(second);
    assert_eq!(
        report.selected.map(|s| s.server_id),
        Some(quick_servers[0].id.clone())
    );
    assert_eq!(controller.current_phase(), RunPhase::Idle);
}
