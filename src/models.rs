// Core data structures for proxyrank

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Protocol kind plus protocol-specific parameters of a server.
///
/// This is the part of a server definition that identifies the endpoint:
/// two servers are duplicates when their outbounds compare equal, whatever
/// their display names or ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outbound {
    /// Share-link scheme such as `vless`, `vmess`, `trojan`, `ss`
    pub protocol: String,

    /// Opaque protocol parameters
    pub params: serde_json::Value,
}

impl Outbound {
    pub fn new(protocol: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            protocol: protocol.into(),
            params,
        }
    }
}

/// One proxy server definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique id, stable for the lifetime of the server
    pub id: String,

    /// Owning group
    pub group_id: String,

    /// Display name
    pub name: String,

    pub outbound: Outbound,
}

impl ServerConfig {
    /// Create a server with a freshly generated id
    pub fn new(group_id: impl Into<String>, name: impl Into<String>, outbound: Outbound) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            group_id: group_id.into(),
            name: name.into(),
            outbound,
        }
    }

    /// Whether both servers describe the same endpoint
    pub fn is_duplicate_of(&self, other: &ServerConfig) -> bool {
        self.outbound == other.outbound
    }
}

/// A named collection of servers, optionally synced from a remote URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,

    /// Subscription URL; empty for manually curated groups
    #[serde(default)]
    pub url: String,

    /// Participates in "run all enabled groups"
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Group {
    /// Create an enabled group with a generated id
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            url: url.into(),
            enabled: true,
        }
    }

    /// Whether the group is backed by a remote subscription
    pub fn is_subscribed(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

/// Measured metadata about one server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffiliationInfo {
    /// Last measured latency in milliseconds; `0` means unreachable
    pub latency_ms: i64,

    /// When the measurement was taken
    pub tested_at: DateTime<Utc>,
}

impl AffiliationInfo {
    /// Record a successful measurement
    pub fn measured(latency: Duration) -> Self {
        let millis = i64::try_from(latency.as_millis()).unwrap_or(i64::MAX);
        Self {
            latency_ms: millis.max(1),
            tested_at: Utc::now(),
        }
    }

    /// Record a failed measurement
    pub fn unreachable() -> Self {
        Self {
            latency_ms: 0,
            tested_at: Utc::now(),
        }
    }

    /// Zero and negative values carry no usable measurement
    pub fn is_usable(&self) -> bool {
        self.latency_ms > 0
    }

    /// Usable latency, if any
    pub fn latency(&self) -> Option<Duration> {
        self.is_usable()
            .then(|| Duration::from_millis(self.latency_ms as u64))
    }

    /// Human readable latency, empty when there is nothing to show
    pub fn latency_label(&self) -> String {
        if !self.is_usable() {
            return String::new();
        }
        format!("{}ms", self.latency_ms)
    }
}

/// The currently active server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedServer {
    pub group_id: String,
    pub server_id: String,
}

/// Observable phase of the run controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPhase {
    #[default]
    Idle,
    UpdatingSubscription,
    Deduplicating,
    Probing {
        completed: usize,
        total: usize,
    },
    Ranking,
    Done,
}

impl RunPhase {
    /// Whether a run is in progress
    pub fn is_busy(&self) -> bool {
        !matches!(self, Self::Idle | Self::Done)
    }

    /// Probe completion in percent, when probing
    pub fn progress_percentage(&self) -> Option<f64> {
        match *self {
            Self::Probing { total: 0, .. } => Some(100.0),
            Self::Probing { completed, total } => {
                Some((completed as f64 / total as f64) * 100.0)
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::UpdatingSubscription => write!(f, "updating subscription"),
            Self::Deduplicating => write!(f, "deduplicating"),
            Self::Probing { completed, total } => write!(f, "probing {completed}/{total}"),
            Self::Ranking => write!(f, "ranking"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// A server together with its last measurement, as shown to users
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEntry {
    pub config: ServerConfig,
    pub affiliation: Option<AffiliationInfo>,
}

impl ServerEntry {
    /// Usable latency in milliseconds, if any
    pub fn latency_ms(&self) -> Option<i64> {
        self.affiliation
            .filter(AffiliationInfo::is_usable)
            .map(|info| info.latency_ms)
    }
}
