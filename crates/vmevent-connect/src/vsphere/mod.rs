//! VMware vSphere event adapter
//!
//! Streams events from a vCenter event history collector. The collector is opened at
//! a begin time derived from the persisted checkpoint and the replay window, then read
//! forward in batches. Delivery stops at the first rejected event; the collector is
//! then reopened at the checkpoint so the next poll starts over from the failure.
//!
//! # Configuration
//!
//! ```yaml
//! connector:
//!   kind: vsphere
//!   address: https://vcenter.example.com/sdk
//!   username: administrator@vsphere.local
//!   password: ${VCENTER_PASSWORD}
//!   checkpoint:
//!     maxAge: 5m
//!     period: 10s
//!   store:
//!     type: file
//!     path: /var/lib/vmevent/checkpoints.json
//! ```

pub mod event;
pub mod soap;
pub mod xml;

pub use event::{EventKind, VsphereConverter, VsphereEvent};
pub use soap::{SoapClient, VsphereApi};

use crate::backoff::BackoffConfig;
use crate::checkpoint::{Checkpoint, CheckpointConfig, CheckpointStore, KvStore, StoreConfig};
use crate::dedup::remove_seen;
use crate::error::{ConnectorError, ConnectorResult};
use crate::event::PayloadEncoding;
use crate::poll::{CycleOutcome, PollingAdapter};
use crate::sender::DeliveryPolicy;
use crate::sink::Sink;
use crate::types::SensitiveString;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use validator::Validate;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Events requested per `ReadNextEvents`
pub const DEFAULT_BATCH_SIZE: u32 = 100;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, JsonSchema)]
pub struct VsphereConfig {
    /// vCenter SDK URL; a bare host gets `/sdk` appended
    #[validate(url)]
    pub address: String,

    #[validate(length(min = 1))]
    pub username: String,

    pub password: SensitiveString,

    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Delay after a poll that delivered events (default: 1s)
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub poll_interval: Duration,

    #[serde(default)]
    pub backoff: BackoffConfig,

    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 1000))]
    pub batch_size: u32,

    /// Replay window and flush period (default: 5m / 10s)
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub payload_encoding: PayloadEncoding,

    /// Default: stop_at_first_failure
    #[serde(default = "default_delivery_policy")]
    pub delivery_policy: DeliveryPolicy,

    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub request_timeout: Duration,
}

fn default_poll_interval() -> Duration {
    DEFAULT_POLL_INTERVAL
}

fn default_batch_size() -> u32 {
    DEFAULT_BATCH_SIZE
}

fn default_delivery_policy() -> DeliveryPolicy {
    DeliveryPolicy::StopAtFirstFailure
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

impl VsphereConfig {
    pub fn validate_settings(&self) -> std::result::Result<(), String> {
        if self.password.is_empty() {
            return Err("vsphere password must not be empty".to_string());
        }
        self.backoff.check()?;
        if let StoreConfig::File { path } = &self.store {
            if path.as_os_str().is_empty() {
                return Err("store.path must not be empty".to_string());
            }
        }
        Ok(())
    }
}

/// Where the event history collector starts.
///
/// No checkpoint starts at `now` (no backfill). A checkpoint older than the replay
/// window is clamped to `now - max_age`, otherwise the stream resumes at the
/// checkpoint's timestamp.
pub fn compute_begin_time(
    now: DateTime<Utc>,
    checkpoint: Option<&Checkpoint>,
    max_age: Duration,
) -> DateTime<Utc> {
    let Some(checkpoint) = checkpoint else {
        return now;
    };

    let window_start = chrono::Duration::from_std(max_age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age));

    match window_start {
        Some(start) if start > checkpoint.last_event_timestamp => {
            warn!(
                checkpoint = %checkpoint.last_event_timestamp,
                begin = %start,
                max_age = ?max_age,
                "checkpoint is older than the replay window, events in between may be lost"
            );
            start
        }
        _ => checkpoint.last_event_timestamp,
    }
}

pub struct VsphereAdapter<A, S> {
    name: String,
    api: A,
    sink: S,
    converter: VsphereConverter,
    policy: DeliveryPolicy,
    batch_size: u32,
    checkpoint_config: CheckpointConfig,
    store: CheckpointStore,
    collector_open: bool,
    /// Begin time of the collector opened last
    collector_begin: Option<DateTime<Utc>>,
    /// Begin time for the next collector when no checkpoint exists yet
    rewind_to: Option<DateTime<Utc>>,
}

impl<S: Sink> VsphereAdapter<SoapClient, S> {
    pub fn from_config(name: impl Into<String>, config: &VsphereConfig, sink: S) -> ConnectorResult<Self> {
        let api = SoapClient::new(config)?;
        Ok(Self::new(name, api, sink, config, config.store.open()))
    }
}

impl<A: VsphereApi, S: Sink> VsphereAdapter<A, S> {
    pub fn new(
        name: impl Into<String>,
        api: A,
        sink: S,
        config: &VsphereConfig,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        let name = name.into();
        let converter = VsphereConverter::new(api.source_identity(), config.payload_encoding);
        Self {
            store: CheckpointStore::new(kv, name.as_str()),
            name,
            api,
            sink,
            converter,
            policy: config.delivery_policy,
            batch_size: config.batch_size,
            checkpoint_config: config.checkpoint,
            collector_open: false,
            collector_begin: None,
            rewind_to: None,
        }
    }

    pub fn current_checkpoint(&self) -> Option<&Checkpoint> {
        self.store.current()
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Open a collector at the begin time derived from the in-memory checkpoint.
    /// Without a checkpoint, a pending rewind target (or the server's now) is used.
    async fn open_collector(&mut self) -> ConnectorResult<()> {
        self.collector_open = false;
        let now = self.api.current_time().await?;
        let begin = match (self.store.current(), self.rewind_to) {
            (None, Some(target)) => target,
            (checkpoint, _) => compute_begin_time(now, checkpoint, self.checkpoint_config.max_age),
        };

        info!(connector = %self.name, begin = %begin, server_time = %now, "opening event collector");
        self.api.create_collector(begin).await?;
        self.collector_open = true;
        self.collector_begin = Some(begin);
        self.rewind_to = None;
        Ok(())
    }

    /// Re-read from the checkpoint after a partial delivery
    async fn rewind(&mut self, failed_at: DateTime<Utc>) -> ConnectorResult<()> {
        if let Err(e) = self.api.destroy_collector().await {
            warn!(connector = %self.name, error = %e, "failed to destroy event collector");
        }
        self.rewind_to = Some(failed_at);
        self.open_collector().await
    }

    /// Log in again and rebuild the collector. Without a checkpoint nothing has been
    /// delivered yet, so the new collector starts where the lost one did.
    async fn recover_session(&mut self) -> ConnectorResult<()> {
        info!(connector = %self.name, "vCenter session expired, logging in again");
        self.collector_open = false;
        if self.store.current().is_none() {
            self.rewind_to = self.rewind_to.or(self.collector_begin);
        }
        self.api.login().await?;
        self.converter.set_api_version(self.api.api_version());
        self.open_collector().await
    }
}

#[async_trait]
impl<A: VsphereApi, S: Sink> PollingAdapter for VsphereAdapter<A, S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> ConnectorResult<()> {
        self.api.login().await?;
        self.converter.set_api_version(self.api.api_version());
        self.store.load().await?;
        self.open_collector().await
    }

    async fn poll(&mut self) -> ConnectorResult<CycleOutcome> {
        if !self.collector_open {
            self.open_collector().await?;
        }

        let batch = match self.api.read_next_events(self.batch_size).await {
            Ok(batch) => batch,
            Err(ConnectorError::SessionExpired(reason)) => {
                warn!(connector = %self.name, reason = %reason, "vCenter session lost");
                self.recover_session().await?;
                return Ok(CycleOutcome::Idle);
            }
            Err(e) => return Err(e),
        };

        let events = match self.store.current() {
            Some(checkpoint) => remove_seen(batch, &checkpoint.last_event_key, |e| e.key),
            None => batch,
        };
        if events.is_empty() {
            debug!(connector = %self.name, "no new vCenter events");
            return Ok(CycleOutcome::Idle);
        }

        let report = self.policy.deliver(&events, &self.converter, &self.sink).await;

        if let Some(index) = report.last_delivered {
            let last = &events[index];
            let checkpoint = Checkpoint::new(
                self.api.source_identity(),
                last.key,
                last.classify().event_type,
                last.created_time,
            );
            self.store.advance(checkpoint).await?;
        }

        if let Some(stopped) = report.stopped_at {
            warn!(
                connector = %self.name,
                delivered = report.delivered,
                failed_key = events[stopped].key,
                "partial delivery, rewinding collector to the checkpoint"
            );
            self.rewind(events[stopped].created_time).await?;
        }

        if report.made_progress() {
            info!(
                connector = %self.name,
                delivered = report.delivered,
                failed = report.failed,
                last_event_key = self.store.current().map(|c| c.last_event_key),
                "delivered vCenter events"
            );
            Ok(CycleOutcome::Progress)
        } else {
            Ok(CycleOutcome::Idle)
        }
    }

    fn checkpoint_period(&self) -> Option<Duration> {
        Some(self.checkpoint_config.period)
    }

    async fn checkpoint(&mut self) -> ConnectorResult<()> {
        self.store.maybe_flush().await.map(|_| ())
    }

    async fn shutdown(&mut self) -> ConnectorResult<()> {
        if let Err(e) = self.store.maybe_flush().await {
            warn!(connector = %self.name, error = %e, "final checkpoint flush failed");
        }
        if let Err(e) = self.api.destroy_collector().await {
            warn!(connector = %self.name, error = %e, "failed to destroy event collector");
        }
        self.api.logout().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn checkpoint_at(secs: i64) -> Checkpoint {
        Checkpoint::new("https://vc.local/sdk", 1, "VmPoweredOnEvent", at(secs))
    }

    #[test]
    fn test_begin_time_without_checkpoint() {
        assert_eq!(compute_begin_time(at(0), None, Duration::from_secs(300)), at(0));
    }

    #[test]
    fn test_begin_time_clamped_to_window() {
        let cp = checkpoint_at(-3600);
        assert_eq!(
            compute_begin_time(at(0), Some(&cp), Duration::from_secs(300)),
            at(-300)
        );
    }

    #[test]
    fn test_begin_time_resumes_inside_window() {
        let cp = checkpoint_at(-60);
        assert_eq!(compute_begin_time(at(0), Some(&cp), Duration::from_secs(300)), at(-60));

        let cp = checkpoint_at(-300);
        assert_eq!(compute_begin_time(at(0), Some(&cp), Duration::from_secs(300)), at(-300));
    }

    #[test]
    fn test_begin_time_zero_window() {
        let cp = checkpoint_at(-1);
        assert_eq!(compute_begin_time(at(0), Some(&cp), Duration::ZERO), at(0));
    }

    #[test]
    fn test_config_defaults() {
        let config: VsphereConfig = serde_yaml::from_str(
            "address: https://vc.local/sdk\nusername: administrator@vsphere.local\npassword: secret\n",
        )
        .unwrap();

        assert_eq!(config.batch_size, 100);
        assert_eq!(config.delivery_policy, DeliveryPolicy::StopAtFirstFailure);
        assert_eq!(config.checkpoint, CheckpointConfig::default());
        assert_eq!(config.store, StoreConfig::Memory);
        assert!(config.validate().is_ok());
        assert!(config.validate_settings().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_backoff() {
        let config: VsphereConfig = serde_yaml::from_str(
            "address: https://vc.local/sdk\nusername: u\npassword: p\nbackoff:\n  initial: 0s\n",
        )
        .unwrap();
        let err = config.validate_settings().unwrap_err();
        assert!(err.contains("backoff.initial"));
    }

    #[test]
    fn test_config_checkpoint_section() {
        let config: VsphereConfig = serde_yaml::from_str(
            "address: https://vc.local/sdk\nusername: u\npassword: p\ncheckpoint:\n  maxAge: 1h\n",
        )
        .unwrap();
        assert_eq!(config.checkpoint.max_age, Duration::from_secs(3600));
        assert_eq!(config.checkpoint.period, Duration::from_secs(10));

        let result = serde_yaml::from_str::<VsphereConfig>(
            "address: https://vc.local/sdk\nusername: u\npassword: p\ncheckpoint:\n  period: \"-1s\"\n",
        );
        assert!(result.is_err());
    }
}
