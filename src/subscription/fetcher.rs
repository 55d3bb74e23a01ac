//! HTTP subscription fetcher
//!
//! Downloads a group's subscription URL with retry and exponential backoff,
//! then hands the payload to [`parse_subscription`](super::parse_subscription).

use async_trait::async_trait;
use reqwest::{header::USER_AGENT, Client};
use std::time::Duration;

use super::{ensure_subscribed, parse_subscription, SubscriptionFetcher};
use crate::config::Config;
use crate::models::{Group, ServerConfig};
use crate::utils::error::FetchError;
use crate::utils::retry::{with_retry_if, RetryConfig};

/// Subscription fetcher backed by reqwest
pub struct HttpSubscriptionFetcher {
    /// HTTP client with configured timeout and compression
    client: Client,

    /// User agent sent with every request
    user_agent: String,

    /// Retry policy for transient failures
    retry: RetryConfig,
}

impl HttpSubscriptionFetcher {
    /// Create a fetcher with explicit settings
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Http` if the HTTP client cannot be created
    pub fn new(
        timeout: Duration,
        user_agent: impl Into<String>,
        retry: RetryConfig,
    ) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).gzip(true).build()?;

        Ok(Self {
            client,
            user_agent: user_agent.into(),
            retry,
        })
    }

    /// Create a fetcher from the application configuration
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Http` if the HTTP client cannot be created
    pub fn from_config(config: &Config) -> Result<Self, FetchError> {
        Self::new(
            config.request_timeout(),
            config.subscription.user_agent.clone(),
            config.retry(),
        )
    }

    /// Download the raw subscription body
    async fn download(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        Ok(response.text().await?)
    }
}

#[async_trait]
impl SubscriptionFetcher for HttpSubscriptionFetcher {
    async fn fetch(&self, group: &Group) -> Result<Vec<ServerConfig>, FetchError> {
        let url = ensure_subscribed(group)?;

        tracing::debug!(group_id = %group.id, url, "Downloading subscription");

        let body = with_retry_if(&self.retry, || self.download(url), FetchError::is_recoverable)
            .await?;

        let servers = parse_subscription(&group.id, &body)?;
        tracing::info!(
            group_id = %group.id,
            servers = servers.len(),
            "Subscription refreshed"
        );
        Ok(servers)
    }
}
