//! Common test utilities

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use proxyrank::config::ProberConfig;
use proxyrank::models::{Group, Outbound, ServerConfig};
use proxyrank::pipeline::RunController;
use proxyrank::probe::tcp::endpoint;
use proxyrank::probe::Probe;
use proxyrank::storage::ServerRepository;
use proxyrank::subscription::{parse_subscription, SubscriptionFetcher};
use proxyrank::utils::error::{FetchError, ProbeError};

/// Create a trojan server whose endpoint is `host:443`
pub fn create_server(group_id: &str, name: &str, host: &str) -> ServerConfig {
    ServerConfig::new(
        group_id,
        name,
        Outbound::new("trojan", json!({ "uri": format!("secret@{host}:443") })),
    )
}

/// Store a group with one server per `(name, host)` pair, in order
pub async fn seed_group(
    repo: &dyn ServerRepository,
    name: &str,
    url: &str,
    servers: &[(&str, &str)],
) -> (Group, Vec<ServerConfig>) {
    let group = Group::new(name, url);
    repo.save_group(&group).await.unwrap();

    let mut stored = Vec::with_capacity(servers.len());
    for (server_name, host) in servers {
        let server = create_server(&group.id, server_name, host);
        repo.add_server(&server).await.unwrap();
        stored.push(server);
    }

    (group, stored)
}

/// What the scripted fetcher answers for a group
#[derive(Debug, Clone)]
pub enum FetchScript {
    Fail(u16),
    Payload(String),
}

/// Fetcher answering from a per-group script; unscripted groups fail
#[derive(Default)]
pub struct ScriptedFetcher {
    scripts: Mutex<HashMap<String, FetchScript>>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, group_id: &str, script: FetchScript) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(group_id.to_string(), script);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SubscriptionFetcher for ScriptedFetcher {
    async fn fetch(&self, group: &Group) -> Result<Vec<ServerConfig>, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().get(&group.id).cloned();

        match script {
            Some(FetchScript::Payload(payload)) => parse_subscription(&group.id, &payload),
            Some(FetchScript::Fail(status)) => Err(FetchError::Status(status)),
            None => Err(FetchError::Status(503)),
        }
    }
}

/// How the scripted probe answers for a host
#[derive(Debug, Clone, Copy)]
pub enum ProbeScript {
    Latency(u64),
    Timeout,
    Hang,
    Panic,
}

/// Probe answering per endpoint host; unscripted hosts time out
pub struct ScriptedProbe {
    hosts: HashMap<String, ProbeScript>,
    delay: Duration,
    init_error: Option<String>,
    probed: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(hosts: &[(&str, ProbeScript)]) -> Self {
        Self {
            hosts: hosts
                .iter()
                .map(|(host, script)| (host.to_string(), *script))
                .collect(),
            delay: Duration::ZERO,
            init_error: None,
            probed: AtomicUsize::new(0),
        }
    }

    /// Every probe sleeps `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Engine initialization fails with `message`
    pub fn failing_init(mut self, message: &str) -> Self {
        self.init_error = Some(message.to_string());
        self
    }

    pub fn probed(&self) -> usize {
        self.probed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn initialize(&self) -> Result<(), ProbeError> {
        match &self.init_error {
            Some(message) => Err(ProbeError::Environment(message.clone())),
            None => Ok(()),
        }
    }

    async fn probe(&self, config: &ServerConfig) -> Result<Duration, ProbeError> {
        self.probed.fetch_add(1, Ordering::SeqCst);
        let (host, _) = endpoint(&config.outbound)?;

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.hosts.get(&host).copied().unwrap_or(ProbeScript::Timeout) {
            ProbeScript::Latency(ms) => Ok(Duration::from_millis(ms)),
            ProbeScript::Timeout => Err(ProbeError::Timeout),
            ProbeScript::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ProbeError::Timeout)
            }
            ProbeScript::Panic => panic!("probe engine crashed on {host}"),
        }
    }
}

/// Controller over the given collaborators
pub fn create_controller(
    repo: Arc<dyn ServerRepository>,
    fetcher: Arc<dyn SubscriptionFetcher>,
    probe: Arc<dyn Probe>,
    auto_select: bool,
) -> Arc<RunController> {
    let config = ProberConfig {
        max_concurrency: 8,
        auto_select,
        ..Default::default()
    };
    Arc::new(RunController::new(repo, fetcher, probe, &config))
}
