//! CloudEvents HTTP sink
//!
//! Posts each event in binary content mode: envelope attributes travel as `ce-*`
//! headers, the payload is the request body.
//!
//! # Retry behavior
//!
//! - 2xx: ack
//! - 5xx, 429, connection errors, timeouts: retried with exponential backoff
//! - other 4xx: nack without retrying

use super::Sink;
use crate::error::{ConnectorError, ConnectorResult};
use crate::event::NormalizedEvent;
use crate::retry::{retry, RetryConfig};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use validator::Validate;

/// HTTP sink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct HttpSinkConfig {
    /// Event receiver URL
    #[validate(url)]
    pub url: String,

    /// Per-request timeout (default: 30s)
    #[serde(default = "default_timeout", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub request_timeout: Duration,

    /// Transport retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Extra headers sent with every request
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Delivery counters
#[derive(Debug, Default)]
pub struct HttpSinkStats {
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
}

pub struct HttpSink {
    client: reqwest::Client,
    config: HttpSinkConfig,
    stats: HttpSinkStats,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig) -> ConnectorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ConnectorError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config,
            stats: HttpSinkStats::default(),
        })
    }

    pub fn stats(&self) -> &HttpSinkStats {
        &self.stats
    }

    async fn post(&self, event: &NormalizedEvent) -> ConnectorResult<()> {
        let mut request = self
            .client
            .post(&self.config.url)
            .header("ce-specversion", "1.0")
            .header("ce-id", event.id.as_str())
            .header("ce-source", event.source.as_str())
            .header("ce-type", event.event_type.as_str())
            .header("ce-time", event.time.to_rfc3339())
            .header("content-type", event.content_type.as_str());

        for (name, value) in &event.extensions {
            request = request.header(format!("ce-{}", name), value.as_str());
        }
        for (name, value) in &self.config.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.body(event.payload.clone()).send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        let status = status.as_u16();
        if status == 429 || status >= 500 {
            Err(ConnectorError::UnexpectedStatus {
                status,
                message: body,
            })
        } else {
            Err(ConnectorError::Rejected(format!("status {}: {}", status, body)))
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn send(&self, event: &NormalizedEvent) -> ConnectorResult<()> {
        match retry(&self.config.retry, || self.post(event)).await {
            Ok(()) => {
                self.stats.acked.fetch_add(1, Ordering::Relaxed);
                debug!(id = %event.id, event_type = %event.event_type, "event delivered");
                Ok(())
            }
            Err(e) => {
                self.stats.nacked.fetch_add(1, Ordering::Relaxed);
                warn!(id = %event.id, error = %e, "sink did not accept event");
                Err(e)
            }
        }
    }
}
