//! Subscription refresh
//!
//! A subscribed group points at a remote URL serving a list of share links,
//! usually base64 encoded:
//!
//! ```text
//! vless://uuid@host:443?security=tls#Tokyo%201
//! trojan://password@host:443#Osaka
//! vmess://eyJhZGQiOiJob3N0IiwicG9ydCI6IjQ0MyIsInBzIjoiU2VvdWwifQ==
//! ```
//!
//! [`parse_subscription`] turns such a payload into [`ServerConfig`]s whose
//! protocol parameters are kept opaque; [`SubscriptionFetcher`] is the seam the
//! run controller consumes.

pub mod fetcher;

pub use fetcher::HttpSubscriptionFetcher;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::models::{Group, Outbound, ServerConfig};
use crate::utils::error::FetchError;
use crate::utils::{decode_base64_lenient, decode_fragment};

/// Share-link schemes recognised as servers
const KNOWN_SCHEMES: &[&str] = &[
    "vmess",
    "vless",
    "trojan",
    "ss",
    "ssr",
    "socks",
    "http",
    "hysteria",
    "hysteria2",
    "hy2",
    "tuic",
    "wireguard",
];

/// Retrieves the current server list of a subscribed group
#[async_trait]
pub trait SubscriptionFetcher: Send + Sync {
    /// Download and parse the group's subscription.
    ///
    /// Returned servers carry fresh ids and `group.id` as their group.
    async fn fetch(&self, group: &Group) -> Result<Vec<ServerConfig>, FetchError>;
}

/// Parse a subscription payload into servers of `group_id`.
///
/// The payload may be plain text or base64; unknown lines are skipped.
pub fn parse_subscription(group_id: &str, content: &str) -> Result<Vec<ServerConfig>, FetchError> {
    let text = decode_payload(content)?;

    let servers: Vec<ServerConfig> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let parsed = parse_share_link(group_id, line);
            if parsed.is_none() {
                debug!(line = %crate::utils::truncate_text(line, 48), "Skipping unrecognised line");
            }
            parsed
        })
        .collect();

    if servers.is_empty() {
        return Err(FetchError::NoServers);
    }

    debug!(group_id, count = servers.len(), "Parsed subscription");
    Ok(servers)
}

fn decode_payload(content: &str) -> Result<String, FetchError> {
    let trimmed = content.trim();
    if trimmed.contains("://") {
        return Ok(trimmed.to_string());
    }

    let bytes = decode_base64_lenient(trimmed)
        .ok_or_else(|| FetchError::Decode("payload is neither share links nor base64".into()))?;

    String::from_utf8(bytes).map_err(|e| FetchError::Decode(e.to_string()))
}

/// Parse one share link; `None` for anything that is not a known server link
pub fn parse_share_link(group_id: &str, line: &str) -> Option<ServerConfig> {
    let (scheme, rest) = line.split_once("://")?;
    let scheme = scheme.to_ascii_lowercase();
    if !KNOWN_SCHEMES.contains(&scheme.as_str()) || rest.is_empty() {
        return None;
    }

    if scheme == "vmess" {
        return parse_vmess(group_id, rest);
    }

    let (body, fragment) = match rest.split_once('#') {
        Some((body, fragment)) => (body, Some(fragment)),
        None => (rest, None),
    };

    let name = fragment
        .map(decode_fragment)
        .filter(|name| !name.trim().is_empty())
        .or_else(|| host_of(&scheme, body))
        .unwrap_or_else(|| scheme.clone());

    Some(ServerConfig::new(
        group_id,
        name,
        Outbound::new(scheme, json!({ "uri": body })),
    ))
}

fn parse_vmess(group_id: &str, body: &str) -> Option<ServerConfig> {
    let bytes = decode_base64_lenient(body)?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let serde_json::Value::Object(mut params) = value else {
        return None;
    };

    // The display name is not part of the endpoint
    let name = params
        .remove("ps")
        .and_then(|ps| ps.as_str().map(str::to_string))
        .filter(|ps| !ps.trim().is_empty())
        .or_else(|| params.get("add").and_then(|a| a.as_str()).map(str::to_string))
        .unwrap_or_else(|| "vmess".to_string());

    Some(ServerConfig::new(
        group_id,
        name,
        Outbound::new("vmess", serde_json::Value::Object(params)),
    ))
}

fn host_of(scheme: &str, body: &str) -> Option<String> {
    url::Url::parse(&format!("{scheme}://{body}"))
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
}

/// Whether a group may be handed to a fetcher
pub fn ensure_subscribed(group: &Group) -> Result<&str, FetchError> {
    if group.is_subscribed() {
        Ok(group.url.trim())
    } else {
        Err(FetchError::EmptyUrl)
    }
}
