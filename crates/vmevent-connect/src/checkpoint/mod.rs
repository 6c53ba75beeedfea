//! Resumption checkpoints
//!
//! One checkpoint per connector instance, stored as a single JSON value in a
//! key-value store. The position moves in memory (and into the store's write set)
//! after every delivered event; [`CheckpointStore::maybe_flush`] runs on the
//! checkpoint timer and only calls the store's `save` when the tracked key moved.
//!
//! Persisted form:
//!
//! ```json
//! {"vCenter":"https://vc.local/sdk","lastEventKey":1042,"lastEventType":"VmPoweredOnEvent",
//!  "lastEventKeyTimestamp":"2024-03-01T10:00:00Z","createdTimestamp":"2024-03-01T10:00:01Z"}
//! ```

mod kv;

pub use kv::{FileKvStore, KvStore, MemoryKvStore, StoreConfig};

use crate::error::{ConnectorError, ConnectorResult};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default replay window
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(5 * 60);

/// Default flush period
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(10);

/// Last successfully delivered event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Identity of the event source, e.g. the vCenter SDK URL
    #[serde(rename = "vCenter")]
    pub source_identity: String,
    #[serde(rename = "lastEventKey")]
    pub last_event_key: i32,
    #[serde(rename = "lastEventType")]
    pub last_event_type: String,
    #[serde(rename = "lastEventKeyTimestamp")]
    pub last_event_timestamp: DateTime<Utc>,
    #[serde(rename = "createdTimestamp")]
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        source_identity: impl Into<String>,
        last_event_key: i32,
        last_event_type: impl Into<String>,
        last_event_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            source_identity: source_identity.into(),
            last_event_key,
            last_event_type: last_event_type.into(),
            last_event_timestamp,
            created_at: Utc::now(),
        }
    }
}

/// Replay window and flush period.
///
/// Durations travel as human-readable strings (`"5m"`, `"10s"`). Absent or empty
/// strings fall back to the defaults; bare integers are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "CheckpointConfigWire", try_from = "CheckpointConfigWire")]
pub struct CheckpointConfig {
    pub max_age: Duration,
    pub period: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_age: DEFAULT_MAX_AGE,
            period: DEFAULT_PERIOD,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct CheckpointConfigWire {
    /// How far back a stale checkpoint may resume from (default: 5m)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_age: Option<String>,
    /// How often the checkpoint is flushed (default: 10s)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    period: Option<String>,
}

impl CheckpointConfig {
    fn encode(&self) -> CheckpointConfigWire {
        CheckpointConfigWire {
            max_age: Some(humantime::format_duration(self.max_age).to_string()),
            period: Some(humantime::format_duration(self.period).to_string()),
        }
    }

    fn decode(wire: CheckpointConfigWire) -> ConnectorResult<Self> {
        Ok(Self {
            max_age: decode_duration("maxAge", wire.max_age.as_deref(), DEFAULT_MAX_AGE)?,
            period: decode_duration("period", wire.period.as_deref(), DEFAULT_PERIOD)?,
        })
    }

    pub fn to_json(&self) -> ConnectorResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> ConnectorResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

fn decode_duration(field: &str, raw: Option<&str>, default: Duration) -> ConnectorResult<Duration> {
    let raw = match raw.map(str::trim) {
        None | Some("") => return Ok(default),
        Some(raw) => raw,
    };
    if raw.starts_with('-') {
        return Err(ConnectorError::config(format!(
            "checkpoint {} must not be negative: '{}'",
            field, raw
        )));
    }
    humantime::parse_duration(raw).map_err(|e| {
        ConnectorError::config(format!("invalid checkpoint {} '{}': {}", field, raw, e))
    })
}

impl From<CheckpointConfig> for CheckpointConfigWire {
    fn from(config: CheckpointConfig) -> Self {
        config.encode()
    }
}

impl TryFrom<CheckpointConfigWire> for CheckpointConfig {
    type Error = ConnectorError;

    fn try_from(wire: CheckpointConfigWire) -> Result<Self, Self::Error> {
        Self::decode(wire)
    }
}

impl JsonSchema for CheckpointConfig {
    fn schema_name() -> String {
        "CheckpointConfig".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        CheckpointConfigWire::json_schema(gen)
    }
}

/// Tracks the checkpoint of one connector instance on top of a [`KvStore`]
pub struct CheckpointStore {
    kv: Arc<dyn KvStore>,
    key: String,
    current: Option<Checkpoint>,
    last_flushed_key: Option<i32>,
}

impl CheckpointStore {
    pub fn new(kv: Arc<dyn KvStore>, key: impl Into<String>) -> Self {
        Self {
            kv,
            key: key.into(),
            current: None,
            last_flushed_key: None,
        }
    }

    /// Initialize the backing store and read the persisted checkpoint, if any
    pub async fn load(&mut self) -> ConnectorResult<Option<Checkpoint>> {
        self.kv.init().await?;

        let checkpoint = match self.kv.get(&self.key).await? {
            Some(raw) => {
                let cp: Checkpoint = serde_json::from_str(&raw).map_err(|e| {
                    ConnectorError::state(format!("corrupt checkpoint '{}': {}", self.key, e))
                })?;
                info!(
                    key = %self.key,
                    last_event_key = cp.last_event_key,
                    timestamp = %cp.last_event_timestamp,
                    "loaded checkpoint"
                );
                Some(cp)
            }
            None => {
                info!(key = %self.key, "no checkpoint found");
                None
            }
        };

        self.last_flushed_key = checkpoint.as_ref().map(|cp| cp.last_event_key);
        self.current = checkpoint.clone();
        Ok(checkpoint)
    }

    pub fn current(&self) -> Option<&Checkpoint> {
        self.current.as_ref()
    }

    /// Move the position forward and hand the value to the store
    pub async fn advance(&mut self, checkpoint: Checkpoint) -> ConnectorResult<()> {
        let value = serde_json::to_string(&checkpoint)?;
        self.kv.set(&self.key, value).await?;
        debug!(key = %self.key, last_event_key = checkpoint.last_event_key, "checkpoint advanced");
        self.current = Some(checkpoint);
        Ok(())
    }

    /// Persist the position if it moved since the previous flush.
    ///
    /// Returns `true` when the store was saved.
    pub async fn maybe_flush(&mut self) -> ConnectorResult<bool> {
        let Some(current) = self.current.as_ref() else {
            return Ok(false);
        };
        if self.last_flushed_key == Some(current.last_event_key) {
            debug!(key = %self.key, "checkpoint unchanged, skipping flush");
            return Ok(false);
        }

        let flushed = current.last_event_key;
        self.kv.save().await?;
        self.last_flushed_key = Some(flushed);
        debug!(key = %self.key, last_event_key = flushed, "checkpoint flushed");
        Ok(true)
    }
}
