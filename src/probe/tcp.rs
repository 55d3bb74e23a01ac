//! TCP connect probe
//!
//! Measures the time to open a TCP connection to the server's endpoint. This
//! does not speak the proxy protocol; it answers "is something listening and
//! how far away is it".

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::{Host, Url};

use super::Probe;
use crate::models::{Outbound, ServerConfig};
use crate::utils::error::ProbeError;

/// Probe that times a TCP handshake
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// Extract `(host, port)` from opaque protocol parameters
pub fn endpoint(outbound: &Outbound) -> Result<(String, u16), ProbeError> {
    if let Some(uri) = outbound.params.get("uri").and_then(|v| v.as_str()) {
        let url = Url::parse(&format!("{}://{uri}", outbound.protocol))
            .map_err(|e| ProbeError::Unsupported(e.to_string()))?;

        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(ProbeError::Unsupported("missing host".into())),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProbeError::Unsupported("missing port".into()))?;

        return Ok((host, port));
    }

    // vmess style JSON: {"add": host, "port": "443" | 443}
    let host = outbound
        .params
        .get("add")
        .and_then(|v| v.as_str())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ProbeError::Unsupported(format!("{} without address", outbound.protocol)))?;

    let port = match outbound.params.get("port") {
        Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Some(serde_json::Value::String(s)) => s.trim().parse::<u16>().ok(),
        _ => None,
    }
    .ok_or_else(|| ProbeError::Unsupported(format!("{} without port", outbound.protocol)))?;

    Ok((host.to_string(), port))
}

#[async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, config: &ServerConfig) -> Result<Duration, ProbeError> {
        let (host, port) = endpoint(&config.outbound)?;
        let start = Instant::now();

        match timeout(self.timeout, TcpStream::connect((host.as_str(), port))).await {
            Err(_) => Err(ProbeError::Timeout),
            Ok(Err(e)) => Err(ProbeError::Unreachable(e.to_string())),
            Ok(Ok(_stream)) => Ok(start.elapsed()),
        }
    }
}
