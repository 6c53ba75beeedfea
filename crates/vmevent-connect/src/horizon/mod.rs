//! VMware Horizon audit-event adapter
//!
//! Polls the audit-event REST API by time. The position is the timestamp of the newest
//! processed event; because the time filter is inclusive, every event at that timestamp
//! comes back in the next batch and is dropped by id. The position lives in memory only, so a restart
//! begins with the most recent page again.
//!
//! # Configuration
//!
//! ```yaml
//! connector:
//!   kind: horizon
//!   server_url: https://horizon.example.com
//!   domain: EXAMPLE
//!   username: svc-events
//!   password: ${HORIZON_PASSWORD}
//!   poll_interval: 1s
//!   backoff: { initial: 1s, max: 5s }
//! ```

pub mod auth;
pub mod client;
pub mod event;

pub use client::{AuditEventApi, HorizonClient};
pub use event::{AuditEventSummary, HorizonConverter};

use crate::backoff::BackoffConfig;
use crate::dedup::{prepare_newest_first, Prepared, Watermark};
use crate::error::ConnectorResult;
use crate::event::PayloadEncoding;
use crate::poll::{CycleOutcome, PollingAdapter};
use crate::sender::DeliveryPolicy;
use crate::sink::Sink;
use crate::types::SensitiveString;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use validator::Validate;

/// Default delay between productive polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Size of the cold-start page
pub const DEFAULT_PAGE_SIZE: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct HorizonConfig {
    /// Horizon Connection Server base URL
    #[validate(url)]
    pub server_url: String,

    /// Active Directory domain of the service account
    #[validate(length(min = 1))]
    pub domain: String,

    #[validate(length(min = 1))]
    pub username: String,

    pub password: SensitiveString,

    /// Accept self-signed server certificates
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Delay after a poll that delivered events (default: 1s)
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub poll_interval: Duration,

    /// Idle backoff (default: 1s doubling up to 5s)
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Events fetched on cold start (default: 10)
    #[serde(default = "default_page_size")]
    #[validate(range(min = 1, max = 1000))]
    pub page_size: u32,

    #[serde(default)]
    pub payload_encoding: PayloadEncoding,

    /// Default: skip_and_continue
    #[serde(default = "default_delivery_policy")]
    pub delivery_policy: DeliveryPolicy,

    /// Per-request timeout (default: 30s)
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub request_timeout: Duration,
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_delivery_policy() -> DeliveryPolicy {
    DeliveryPolicy::SkipAndContinue
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl HorizonConfig {
    /// Cross-field checks the derive cannot express
    pub fn validate_settings(&self) -> std::result::Result<(), String> {
        if self.password.is_empty() {
            return Err("horizon password must not be empty".to_string());
        }
        self.backoff.check()?;
        Ok(())
    }
}

pub struct HorizonAdapter<A, S> {
    name: String,
    api: A,
    sink: S,
    converter: HorizonConverter,
    policy: DeliveryPolicy,
    last_event_id: Option<i64>,
    watermark: Watermark<i64>,
}

impl<S: Sink> HorizonAdapter<HorizonClient, S> {
    pub fn from_config(name: impl Into<String>, config: &HorizonConfig, sink: S) -> ConnectorResult<Self> {
        let api = HorizonClient::new(config)?;
        let converter = HorizonConverter::new(config.server_url.as_str(), config.payload_encoding);
        Ok(Self::new(name, api, sink, converter, config.delivery_policy))
    }
}

impl<A: AuditEventApi, S: Sink> HorizonAdapter<A, S> {
    pub fn new(
        name: impl Into<String>,
        api: A,
        sink: S,
        converter: HorizonConverter,
        policy: DeliveryPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            api,
            sink,
            converter,
            policy,
            last_event_id: None,
            watermark: Watermark::default(),
        }
    }

    /// Millisecond timestamp the next fetch starts from, 0 before the first delivery
    pub fn position(&self) -> i64 {
        self.watermark.position()
    }

    pub fn last_event_id(&self) -> Option<i64> {
        self.last_event_id
    }

    pub fn api(&self) -> &A {
        &self.api
    }
}

#[async_trait]
impl<A: AuditEventApi, S: Sink> PollingAdapter for HorizonAdapter<A, S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> ConnectorResult<()> {
        self.api.login().await
    }

    async fn poll(&mut self) -> ConnectorResult<CycleOutcome> {
        let batch = self.api.fetch_since(self.watermark.position()).await?;

        let events = match prepare_newest_first(batch, self.watermark.seen(), |e| e.id) {
            Prepared::Idle => {
                debug!(connector = %self.name, position = self.watermark.position(), "no new audit events");
                return Ok(CycleOutcome::Idle);
            }
            Prepared::Ready(events) => events,
        };

        let report = self.policy.deliver(&events, &self.converter, &self.sink).await;
        let Some(index) = report.last_delivered else {
            return Ok(CycleOutcome::Idle);
        };

        // Everything up to the last delivery was either delivered or skipped by the policy
        for event in &events[..=index] {
            self.watermark.record(event.time, event.id);
        }
        let last = &events[index];
        self.last_event_id = Some(last.id);
        info!(
            connector = %self.name,
            delivered = report.delivered,
            failed = report.failed,
            last_event_id = last.id,
            position = self.watermark.position(),
            "delivered audit events"
        );
        Ok(CycleOutcome::Progress)
    }

    async fn shutdown(&mut self) -> ConnectorResult<()> {
        self.api.logout().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_yaml() -> &'static str {
        r#"
server_url: https://horizon.example.com
domain: EXAMPLE
username: svc
password: secret
"#
    }

    #[test]
    fn test_config_defaults() {
        let config: HorizonConfig = serde_yaml::from_str(config_yaml()).unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.backoff, BackoffConfig::default());
        assert_eq!(config.page_size, 10);
        assert_eq!(config.delivery_policy, DeliveryPolicy::SkipAndContinue);
        assert_eq!(config.payload_encoding, PayloadEncoding::Json);
        assert!(config.validate().is_ok());
        assert!(config.validate_settings().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let mut config: HorizonConfig = serde_yaml::from_str(config_yaml()).unwrap();
        config.password = SensitiveString::new("");
        assert!(config.validate_settings().is_err());

        let mut config: HorizonConfig = serde_yaml::from_str(config_yaml()).unwrap();
        config.backoff.initial = Duration::from_secs(10);
        assert!(config.validate_settings().is_err());

        let raw = format!("{}backoff: {{ initial: 0s, max: 5s }}\n", config_yaml());
        let config: HorizonConfig = serde_yaml::from_str(&raw).unwrap();
        assert!(config.validate_settings().is_err());

        let mut config: HorizonConfig = serde_yaml::from_str(config_yaml()).unwrap();
        config.server_url = "horizon".to_string();
        assert!(config.validate().is_err());

        let raw = format!("{}poll_interval: 5\n", config_yaml());
        assert!(serde_yaml::from_str::<HorizonConfig>(&raw).is_err());
    }
}
