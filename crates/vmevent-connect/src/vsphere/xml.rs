//! Minimal XML element tree for vim25 SOAP responses
//!
//! Element names are stored without namespace prefixes. Attributes keep their qualified
//! name, so `xsi:type` and a plain `type` stay apart. The tree keeps text and attributes
//! only; comments, processing instructions and namespace declarations are dropped.

use crate::error::{ConnectorError, ConnectorResult};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

const XSI_TYPE: &str = "xsi:type";
const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Element>,
    pub text: String,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a document and return its root element
    pub fn parse(xml: &str) -> ConnectorResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        loop {
            match reader.read_event()? {
                Event::Start(start) => stack.push(open(&start)?),
                Event::Empty(start) => {
                    let element = open(&start)?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&text.unescape()?);
                    }
                }
                Event::CData(data) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::End(_) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| ConnectorError::Xml("unbalanced end tag".to_string()))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => return Ok(element),
                    }
                }
                Event::Eof => {
                    return Err(ConnectorError::Xml("document ended before the root element closed".to_string()))
                }
                _ => {}
            }
        }
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Follow a path of child names
    pub fn find(&self, path: &[&str]) -> Option<&Element> {
        path.iter().try_fold(self, |element, name| element.child(name))
    }

    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// `xsi:type` of the element, if any
    pub fn xsi_type(&self) -> Option<&str> {
        self.attr(XSI_TYPE)
    }

    fn uses_xsi(&self) -> bool {
        self.attributes.iter().any(|(key, _)| key.starts_with("xsi:"))
            || self.children.iter().any(Element::uses_xsi)
    }

    /// JSON rendering: leaves become strings, repeated children become arrays
    pub fn to_json(&self) -> Value {
        if self.children.is_empty() {
            return Value::String(self.text.clone());
        }

        let mut map = Map::new();
        for child in &self.children {
            let value = child.to_json();
            match map.get_mut(&child.name) {
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    map.insert(child.name.clone(), value);
                }
            }
        }
        Value::Object(map)
    }

    /// Serialize back to XML under a different root name. The root declares the `xsi`
    /// namespace when any element carries an `xsi:` attribute.
    pub fn to_xml_named(&self, root: &str) -> String {
        let mut out = String::new();
        self.write_xml(root, self.uses_xsi(), &mut out);
        out
    }

    fn write_xml(&self, name: &str, declare_xsi: bool, out: &mut String) {
        out.push('<');
        out.push_str(name);
        if declare_xsi {
            out.push_str(" xmlns:xsi=\"");
            out.push_str(XSI_NAMESPACE);
            out.push('"');
        }
        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value));
            out.push('"');
        }
        out.push('>');
        out.push_str(&escape(&self.text));
        for child in &self.children {
            child.write_xml(&child.name, false, out);
        }
        out.push_str("</");
        out.push_str(name);
        out.push('>');
    }
}

fn open(start: &BytesStart<'_>) -> ConnectorResult<Element> {
    let mut element = Element::new(String::from_utf8_lossy(start.local_name().as_ref()));
    for attribute in start.attributes() {
        let attribute = attribute.map_err(|e| ConnectorError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        if key == "xmlns" || key.starts_with("xmlns:") {
            continue;
        }
        let value = attribute.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

/// Escape text for element content or attribute values
pub fn escape(raw: &str) -> String {
    quick_xml::escape::escape(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"
                  xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
  <soapenv:Body>
    <ReadNextEventsResponse xmlns="urn:vim25">
      <returnval xsi:type="VmPoweredOnEvent">
        <key>1042</key>
        <chainId>1041</chainId>
        <createdTime>2024-03-01T10:00:00.123Z</createdTime>
        <userName>VSPHERE.LOCAL\alice</userName>
        <vm><name>web-01</name><vm type="VirtualMachine">vm-42</vm></vm>
        <fullFormattedMessage>web-01 on host &amp; cluster is powered on</fullFormattedMessage>
        <changeTag/>
        <changeTag>b</changeTag>
      </returnval>
    </ReadNextEventsResponse>
  </soapenv:Body>
</soapenv:Envelope>"#;

    #[test]
    fn test_parse_strips_prefixes() {
        let root = Element::parse(RESPONSE).unwrap();
        assert_eq!(root.name, "Envelope");

        let event = root
            .find(&["Body", "ReadNextEventsResponse", "returnval"])
            .unwrap();
        assert_eq!(event.xsi_type(), Some("VmPoweredOnEvent"));
        assert_eq!(event.child_text("key"), Some("1042"));
        assert_eq!(
            event.child_text("fullFormattedMessage"),
            Some("web-01 on host & cluster is powered on")
        );
        assert_eq!(event.attr("xsi:type"), Some("VmPoweredOnEvent"));
        assert_eq!(event.attr("type"), None);

        let vm = event.find(&["vm", "vm"]).unwrap();
        assert_eq!(vm.attr("type"), Some("VirtualMachine"));
        assert_eq!(vm.xsi_type(), None);
    }

    #[test]
    fn test_to_json() {
        let root = Element::parse(RESPONSE).unwrap();
        let event = root.find(&["Body", "ReadNextEventsResponse", "returnval"]).unwrap();
        let json = event.to_json();

        assert_eq!(json["key"], "1042");
        assert_eq!(json["vm"]["name"], "web-01");
        assert_eq!(json["changeTag"], serde_json::json!(["", "b"]));
    }

    #[test]
    fn test_to_xml_named_escapes() {
        let mut element = Element::new("returnval");
        let mut message = Element::new("fullFormattedMessage");
        message.text = "a < b".to_string();
        element.children.push(message);

        assert_eq!(
            element.to_xml_named("Event"),
            "<Event><fullFormattedMessage>a &lt; b</fullFormattedMessage></Event>"
        );
    }

    #[test]
    fn test_to_xml_named_keeps_xsi_prefix() {
        let root = Element::parse(RESPONSE).unwrap();
        let event = root.find(&["Body", "ReadNextEventsResponse", "returnval"]).unwrap();
        let xml = event.to_xml_named("VmPoweredOnEvent");

        assert!(xml.starts_with(
            "<VmPoweredOnEvent xmlns:xsi=\"http://www.w3.org/2001/XMLSchema-instance\" xsi:type=\"VmPoweredOnEvent\">"
        ));
        assert!(xml.contains("<vm type=\"VirtualMachine\">vm-42</vm>"));

        let reparsed = Element::parse(&xml).unwrap();
        assert_eq!(reparsed.xsi_type(), Some("VmPoweredOnEvent"));
    }

    #[test]
    fn test_unterminated_document() {
        assert!(matches!(Element::parse("<a><b>"), Err(ConnectorError::Xml(_))));
    }
}
