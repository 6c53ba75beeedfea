//! vSphere events and their CloudEvents mapping
//!
//! vCenter reports three shapes of event:
//!
//! | class           | wire form                       | CloudEvents type suffix |
//! |-----------------|---------------------------------|-------------------------|
//! | `event`         | concrete subclass of `Event`    | the `xsi:type`          |
//! | `eventex`       | `EventEx` with `eventTypeId`    | the `eventTypeId`       |
//! | `extendedevent` | `ExtendedEvent` with `eventTypeId` | the `eventTypeId`    |

use super::xml::Element;
use crate::error::{ConnectorError, ConnectorResult};
use crate::event::{EventConverter, NormalizedEvent, PayloadEncoding};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Event { type_name: String },
    EventEx { event_type_id: String },
    ExtendedEvent { event_type_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventClassification {
    pub class: &'static str,
    pub event_type: String,
}

impl EventKind {
    pub fn classify(&self) -> EventClassification {
        match self {
            Self::Event { type_name } => EventClassification {
                class: "event",
                event_type: type_name.clone(),
            },
            Self::EventEx { event_type_id } => EventClassification {
                class: "eventex",
                event_type: event_type_id.clone(),
            },
            Self::ExtendedEvent { event_type_id } => EventClassification {
                class: "extendedevent",
                event_type: event_type_id.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VsphereEvent {
    pub kind: EventKind,
    pub key: i32,
    pub chain_id: i32,
    pub created_time: DateTime<Utc>,
    pub user_name: Option<String>,
    pub full_formatted_message: Option<String>,
    /// The event element as returned by `ReadNextEvents`
    pub raw: Element,
}

impl VsphereEvent {
    pub fn from_element(element: Element) -> ConnectorResult<Self> {
        let type_name = element
            .xsi_type()
            .ok_or_else(|| ConnectorError::protocol("event without xsi:type"))?
            .to_string();

        let kind = match type_name.as_str() {
            "EventEx" => EventKind::EventEx {
                event_type_id: required(&element, "eventTypeId")?.to_string(),
            },
            "ExtendedEvent" => EventKind::ExtendedEvent {
                event_type_id: required(&element, "eventTypeId")?.to_string(),
            },
            _ => EventKind::Event { type_name },
        };

        let key = parse_int(&element, "key")?;
        let chain_id = match element.child_text("chainId") {
            Some(_) => parse_int(&element, "chainId")?,
            None => key,
        };
        let created_time = DateTime::parse_from_rfc3339(required(&element, "createdTime")?)
            .map_err(|e| ConnectorError::protocol(format!("event {} has invalid createdTime: {}", key, e)))?
            .with_timezone(&Utc);

        Ok(Self {
            kind,
            key,
            chain_id,
            created_time,
            user_name: element.child_text("userName").map(str::to_string),
            full_formatted_message: element.child_text("fullFormattedMessage").map(str::to_string),
            raw: element,
        })
    }

    pub fn classify(&self) -> EventClassification {
        self.kind.classify()
    }

    /// JSON rendering of the raw event with its wire type under `@type`
    pub fn to_json(&self) -> Value {
        let mut json = self.raw.to_json();
        if let (Value::Object(map), Some(type_name)) = (&mut json, self.raw.xsi_type()) {
            map.insert("@type".to_string(), Value::String(type_name.to_string()));
        }
        json
    }
}

fn required<'a>(element: &'a Element, name: &str) -> ConnectorResult<&'a str> {
    element
        .child_text(name)
        .ok_or_else(|| ConnectorError::protocol(format!("event without {}", name)))
}

fn parse_int(element: &Element, name: &str) -> ConnectorResult<i32> {
    let raw = required(element, name)?;
    raw.trim()
        .parse()
        .map_err(|_| ConnectorError::protocol(format!("invalid {} '{}'", name, raw)))
}

pub struct VsphereConverter {
    source: String,
    api_version: String,
    encoding: PayloadEncoding,
}

impl VsphereConverter {
    pub fn new(source: impl Into<String>, encoding: PayloadEncoding) -> Self {
        Self {
            source: source.into(),
            api_version: String::new(),
            encoding,
        }
    }

    /// Known only after login
    pub fn set_api_version(&mut self, version: impl Into<String>) {
        self.api_version = version.into();
    }
}

impl EventConverter<VsphereEvent> for VsphereConverter {
    fn convert(&self, raw: &VsphereEvent) -> ConnectorResult<NormalizedEvent> {
        let classification = raw.classify();

        let payload = match self.encoding {
            PayloadEncoding::Json => Bytes::from(serde_json::to_vec(&raw.to_json())?),
            PayloadEncoding::Xml => Bytes::from(raw.raw.to_xml_named(&classification_root(raw))),
        };

        let mut event = NormalizedEvent::new(
            raw.key.to_string(),
            self.source.as_str(),
            format!("com.vmware.vsphere.{}", classification.event_type),
            raw.created_time,
        )
        .with_extension("eventclass", classification.class)
        .with_payload(self.encoding, payload);
        if !self.api_version.is_empty() {
            event = event.with_extension("vsphereapiversion", self.api_version.as_str());
        }

        event.validate()?;
        Ok(event)
    }
}

/// XML root for the payload: the wire type, which is always a valid element name
fn classification_root(raw: &VsphereEvent) -> String {
    raw.raw.xsi_type().unwrap_or("Event").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(xml: &str) -> Element {
        Element::parse(xml).unwrap()
    }

    fn powered_on() -> VsphereEvent {
        VsphereEvent::from_element(element(
            r#"<returnval xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:type="VmPoweredOnEvent">
                 <key>1042</key><chainId>1040</chainId>
                 <createdTime>2024-03-01T10:00:00.5Z</createdTime>
                 <userName>VSPHERE.LOCAL\alice</userName>
                 <fullFormattedMessage>web-01 is powered on</fullFormattedMessage>
               </returnval>"#,
        ))
        .unwrap()
    }

    #[test]
    fn test_classify_each_kind() {
        let ev = powered_on();
        assert_eq!(ev.key, 1042);
        assert_eq!(ev.chain_id, 1040);
        assert_eq!(
            ev.classify(),
            EventClassification {
                class: "event",
                event_type: "VmPoweredOnEvent".to_string()
            }
        );

        let ex = VsphereEvent::from_element(element(
            r#"<returnval xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:type="EventEx">
                 <key>7</key><createdTime>2024-03-01T10:00:00Z</createdTime>
                 <eventTypeId>com.vmware.vc.vm.VmStateRevertedToSnapshot</eventTypeId>
               </returnval>"#,
        ))
        .unwrap();
        assert_eq!(ex.classify().class, "eventex");
        assert_eq!(ex.classify().event_type, "com.vmware.vc.vm.VmStateRevertedToSnapshot");
        assert_eq!(ex.chain_id, 7);

        let extended = VsphereEvent::from_element(element(
            r#"<returnval xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:type="ExtendedEvent">
                 <key>8</key><createdTime>2024-03-01T10:00:00Z</createdTime>
                 <eventTypeId>com.vmware.vcIntegrity.ScanStart</eventTypeId>
               </returnval>"#,
        ))
        .unwrap();
        assert_eq!(extended.classify().class, "extendedevent");
    }

    #[test]
    fn test_missing_fields() {
        let no_type = element("<returnval><key>1</key><createdTime>2024-03-01T10:00:00Z</createdTime></returnval>");
        assert!(VsphereEvent::from_element(no_type).is_err());

        let bad_key = element(
            r#"<returnval xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:type="VmEvent">
                 <key>x</key><createdTime>2024-03-01T10:00:00Z</createdTime></returnval>"#,
        );
        assert!(matches!(
            VsphereEvent::from_element(bad_key),
            Err(ConnectorError::Protocol(_))
        ));
    }

    #[test]
    fn test_convert_json() {
        let mut converter = VsphereConverter::new("https://vc.local/sdk", PayloadEncoding::Json);
        converter.set_api_version("8.0.2.0");

        let event = converter.convert(&powered_on()).unwrap();
        assert_eq!(event.id, "1042");
        assert_eq!(event.event_type, "com.vmware.vsphere.VmPoweredOnEvent");
        assert_eq!(event.extensions["eventclass"], "event");
        assert_eq!(event.extensions["vsphereapiversion"], "8.0.2.0");

        let payload: Value = serde_json::from_slice(&event.payload).unwrap();
        assert_eq!(payload["@type"], "VmPoweredOnEvent");
        assert_eq!(payload["key"], "1042");
    }

    #[test]
    fn test_convert_xml() {
        let converter = VsphereConverter::new("https://vc.local/sdk", PayloadEncoding::Xml);
        let event = converter.convert(&powered_on()).unwrap();

        let xml = String::from_utf8(event.payload.to_vec()).unwrap();
        assert!(xml.starts_with(
            "<VmPoweredOnEvent xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" xsi:type=\"VmPoweredOnEvent\"><key>1042</key>"
        ));
        assert!(!event.extensions.contains_key("vsphereapiversion"));
    }
}
