//! Normalized event envelope
//!
//! Both adapters convert their vendor records into a [`NormalizedEvent`], which maps
//! one-to-one onto a CloudEvents 1.0 envelope when it reaches the sink.

use crate::error::{ConnectorError, ConnectorResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// CloudEvents extension names: lowercase alphanumerics, at most 20 characters
static EXTENSION_NAME: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[a-z0-9]{1,20}$").expect("extension name pattern is invalid - this is a bug")
});

/// Attribute names owned by the envelope itself
const RESERVED_ATTRIBUTES: &[&str] = &[
    "id",
    "source",
    "specversion",
    "type",
    "time",
    "datacontenttype",
    "dataschema",
    "subject",
    "data",
];

/// Encoding of the event payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    #[default]
    Json,
    Xml,
}

impl PayloadEncoding {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Xml => "application/xml",
        }
    }

    /// Serialize a raw vendor record. `root` names the XML document element.
    pub fn encode<T: Serialize>(&self, root: &str, value: &T) -> ConnectorResult<Bytes> {
        match self {
            Self::Json => Ok(Bytes::from(serde_json::to_vec(value)?)),
            Self::Xml => {
                let xml = quick_xml::se::to_string_with_root(root, value)
                    .map_err(|e| ConnectorError::Serialization(e.to_string()))?;
                Ok(Bytes::from(xml))
            }
        }
    }
}

/// Maps one raw vendor record onto a [`NormalizedEvent`].
///
/// Implementations validate the envelope before returning it; an `Err` is a
/// per-event failure and never aborts the batch it came from.
pub trait EventConverter<R>: Send + Sync {
    fn convert(&self, raw: &R) -> ConnectorResult<NormalizedEvent>;
}

/// Vendor-agnostic event handed to the sink
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub id: String,
    pub source: String,
    pub event_type: String,
    pub time: DateTime<Utc>,
    pub extensions: BTreeMap<String, String>,
    pub content_type: String,
    pub payload: Bytes,
}

impl NormalizedEvent {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        event_type: impl Into<String>,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            event_type: event_type.into(),
            time,
            extensions: BTreeMap::new(),
            content_type: PayloadEncoding::Json.content_type().to_string(),
            payload: Bytes::new(),
        }
    }

    pub fn with_extension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(name.into(), value.into());
        self
    }

    pub fn with_payload(mut self, encoding: PayloadEncoding, payload: Bytes) -> Self {
        self.content_type = encoding.content_type().to_string();
        self.payload = payload;
        self
    }

    /// Check the envelope against the CloudEvents attribute rules
    pub fn validate(&self) -> ConnectorResult<()> {
        if self.id.is_empty() {
            return Err(ConnectorError::conversion("event id is empty"));
        }
        if self.source.is_empty() {
            return Err(ConnectorError::conversion("event source is empty"));
        }
        if self.event_type.is_empty() {
            return Err(ConnectorError::conversion("event type is empty"));
        }
        for name in self.extensions.keys() {
            if !EXTENSION_NAME.is_match(name) || RESERVED_ATTRIBUTES.contains(&name.as_str()) {
                return Err(ConnectorError::conversion(format!(
                    "invalid extension attribute name '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Structured-mode JSON rendering, used for logging and the in-memory sink
    pub fn to_cloud_event(&self) -> serde_json::Value {
        let data = if self.content_type == PayloadEncoding::Json.content_type() {
            serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
        } else {
            serde_json::Value::String(String::from_utf8_lossy(&self.payload).into_owned())
        };

        let mut ce = serde_json::json!({
            "specversion": "1.0",
            "id": self.id,
            "source": self.source,
            "type": self.event_type,
            "time": self.time.to_rfc3339(),
            "datacontenttype": self.content_type,
            "data": data,
        });
        if let Some(obj) = ce.as_object_mut() {
            for (name, value) in &self.extensions {
                obj.insert(name.clone(), serde_json::Value::String(value.clone()));
            }
        }
        ce
    }
}
