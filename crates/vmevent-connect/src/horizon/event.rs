//! Horizon audit events and their CloudEvents mapping

use crate::error::{ConnectorError, ConnectorResult};
use crate::event::{EventConverter, NormalizedEvent, PayloadEncoding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One record of `GET /rest/external/v1/audit-events`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEventSummary {
    pub id: i64,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Milliseconds since the Unix epoch
    pub time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desktop_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_id: Option<String>,
}

impl AuditEventSummary {
    pub fn timestamp(&self) -> ConnectorResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.time).ok_or_else(|| {
            ConnectorError::conversion(format!("event {} has invalid time {}", self.id, self.time))
        })
    }
}

/// `LOGIN_FAILED` becomes `com.vmware.horizon.login_failed.v0`
pub fn cloud_event_type(vendor_type: &str) -> String {
    format!("com.vmware.horizon.{}.v0", vendor_type.to_lowercase())
}

pub struct HorizonConverter {
    source: String,
    encoding: PayloadEncoding,
}

impl HorizonConverter {
    pub fn new(source: impl Into<String>, encoding: PayloadEncoding) -> Self {
        Self {
            source: source.into(),
            encoding,
        }
    }
}

impl EventConverter<AuditEventSummary> for HorizonConverter {
    fn convert(&self, raw: &AuditEventSummary) -> ConnectorResult<NormalizedEvent> {
        let payload = self.encoding.encode("AuditEventSummary", raw)?;
        let event = NormalizedEvent::new(
            raw.id.to_string(),
            self.source.as_str(),
            cloud_event_type(&raw.event_type),
            raw.timestamp()?,
        )
        .with_payload(self.encoding, payload);

        event.validate()?;
        Ok(event)
    }
}
