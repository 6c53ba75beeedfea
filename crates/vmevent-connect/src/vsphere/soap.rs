//! vim25 SOAP session and event history collector
//!
//! Only the calls the event adapter needs. The session lives in the
//! `vmware_soap_session` cookie, kept by the reqwest cookie store.
//!
//! There is no separate keep-alive call. `ReadNextEvents` runs at least once per
//! `backoff.max`, which resets the server's idle timer, and a `NotAuthenticated` fault
//! leads to a fresh login.

use super::event::VsphereEvent;
use super::xml::{escape, Element};
use super::VsphereConfig;
use crate::error::{ConnectorError, ConnectorResult};
use crate::types::SensitiveString;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, warn};
use url::Url;

const SOAP_ENVELOPE_OPEN: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
    r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns="urn:vim25">"#,
    "<soapenv:Body>"
);
const SOAP_ENVELOPE_CLOSE: &str = "</soapenv:Body></soapenv:Envelope>";

/// Session and event collector operations of a vCenter
#[async_trait]
pub trait VsphereApi: Send {
    async fn login(&mut self) -> ConnectorResult<()>;

    /// Server clock, used as the reference for the replay window
    async fn current_time(&mut self) -> ConnectorResult<DateTime<Utc>>;

    /// Open a collector over every managed entity, starting at `begin`.
    /// Replaces the collector held so far without destroying it.
    async fn create_collector(&mut self, begin: DateTime<Utc>) -> ConnectorResult<()>;

    /// Up to `max_count` events after the collector's cursor, oldest first
    async fn read_next_events(&mut self, max_count: u32) -> ConnectorResult<Vec<VsphereEvent>>;

    async fn destroy_collector(&mut self) -> ConnectorResult<()>;

    async fn logout(&mut self) -> ConnectorResult<()>;

    /// Stable identity of the vCenter, stored in checkpoints
    fn source_identity(&self) -> &str;

    /// Empty until logged in
    fn api_version(&self) -> &str;
}

#[derive(Debug, Clone)]
struct ServiceContent {
    session_manager: String,
    event_manager: String,
    root_folder: String,
    api_version: String,
}

pub struct SoapClient {
    client: reqwest::Client,
    sdk_url: Url,
    username: String,
    password: SensitiveString,
    content: Option<ServiceContent>,
    collector: Option<String>,
}

impl SoapClient {
    pub fn new(config: &VsphereConfig) -> ConnectorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .cookie_store(true)
            .build()
            .map_err(|e| ConnectorError::config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            sdk_url: sdk_url(&config.address)?,
            username: config.username.clone(),
            password: config.password.clone(),
            content: None,
            collector: None,
        })
    }

    fn content(&self) -> ConnectorResult<&ServiceContent> {
        self.content
            .as_ref()
            .ok_or_else(|| ConnectorError::SessionExpired("not logged in".to_string()))
    }

    /// Post one request body and return the `<...Response>` element
    async fn call(&self, body: String) -> ConnectorResult<Element> {
        let action = match &self.content {
            Some(content) => format!("urn:vim25/{}", content.api_version),
            None => "urn:vim25".to_string(),
        };

        let response = self
            .client
            .post(self.sdk_url.clone())
            .header("content-type", "text/xml; charset=utf-8")
            .header("soapaction", action)
            .body(format!("{}{}{}", SOAP_ENVELOPE_OPEN, body, SOAP_ENVELOPE_CLOSE))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        let envelope = match Element::parse(&text) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(ConnectorError::UnexpectedStatus {
                    status: status.as_u16(),
                    message: text,
                })
            }
            Err(e) => return Err(e),
        };

        let body = envelope
            .child("Body")
            .ok_or_else(|| ConnectorError::protocol("SOAP response without Body"))?;
        if let Some(fault) = body.child("Fault") {
            return Err(fault_error(fault));
        }
        if !status.is_success() {
            return Err(ConnectorError::UnexpectedStatus {
                status: status.as_u16(),
                message: text,
            });
        }

        body.children
            .first()
            .cloned()
            .ok_or_else(|| ConnectorError::protocol("empty SOAP Body"))
    }

    async fn retrieve_service_content(&self) -> ConnectorResult<ServiceContent> {
        let response = self
            .call(r#"<RetrieveServiceContent><_this type="ServiceInstance">ServiceInstance</_this></RetrieveServiceContent>"#.to_string())
            .await?;
        let content = response
            .child("returnval")
            .ok_or_else(|| ConnectorError::protocol("RetrieveServiceContent without returnval"))?;

        let field = |name: &str| {
            content
                .child_text(name)
                .map(str::to_string)
                .ok_or_else(|| ConnectorError::protocol(format!("service content without {}", name)))
        };

        Ok(ServiceContent {
            session_manager: field("sessionManager")?,
            event_manager: field("eventManager")?,
            root_folder: field("rootFolder")?,
            api_version: content
                .find(&["about", "apiVersion"])
                .map(|e| e.text.clone())
                .unwrap_or_default(),
        })
    }
}

fn sdk_url(address: &str) -> ConnectorResult<Url> {
    let mut url = Url::parse(address)
        .map_err(|e| ConnectorError::config(format!("invalid vCenter address '{}': {}", address, e)))?;
    if url.path() == "/" || url.path().is_empty() {
        url.set_path("/sdk");
    }
    Ok(url)
}

/// `NotAuthenticated` means the session is gone; every other fault is a protocol error
fn fault_error(fault: &Element) -> ConnectorError {
    let message = fault.child_text("faultstring").unwrap_or("SOAP fault").to_string();
    let not_authenticated = fault
        .child("detail")
        .into_iter()
        .flat_map(|detail| detail.children.iter())
        .any(|d| d.name.starts_with("NotAuthenticated") || d.xsi_type() == Some("NotAuthenticated"));

    if not_authenticated {
        ConnectorError::SessionExpired(message)
    } else {
        ConnectorError::protocol(message)
    }
}

#[async_trait]
impl VsphereApi for SoapClient {
    async fn login(&mut self) -> ConnectorResult<()> {
        let content = self.retrieve_service_content().await?;
        let body = format!(
            r#"<Login><_this type="SessionManager">{}</_this><userName>{}</userName><password>{}</password></Login>"#,
            escape(&content.session_manager),
            escape(&self.username),
            escape(self.password.expose_secret()),
        );
        self.content = Some(content);

        match self.call(body).await {
            Ok(_) => {}
            Err(ConnectorError::Protocol(message)) => {
                self.content = None;
                warn!(user = %self.username, fault = %message, "vCenter login refused");
                return Err(ConnectorError::Auth { status: 401 });
            }
            Err(e) => {
                self.content = None;
                return Err(e);
            }
        }
        self.collector = None;

        info!(
            user = %self.username,
            address = %self.sdk_url,
            api_version = %self.api_version(),
            "logged in to vCenter"
        );
        Ok(())
    }

    async fn current_time(&mut self) -> ConnectorResult<DateTime<Utc>> {
        let response = self
            .call(r#"<CurrentTime><_this type="ServiceInstance">ServiceInstance</_this></CurrentTime>"#.to_string())
            .await?;
        let raw = response
            .child_text("returnval")
            .ok_or_else(|| ConnectorError::protocol("CurrentTime without returnval"))?;

        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| ConnectorError::protocol(format!("invalid server time '{}': {}", raw, e)))
    }

    async fn create_collector(&mut self, begin: DateTime<Utc>) -> ConnectorResult<()> {
        let content = self.content()?;
        let body = format!(
            concat!(
                r#"<CreateCollectorForEvents><_this type="EventManager">{}</_this><filter>"#,
                r#"<entity><entity type="Folder">{}</entity><recursion>all</recursion></entity>"#,
                "<time><beginTime>{}</beginTime></time>",
                "</filter></CreateCollectorForEvents>"
            ),
            escape(&content.event_manager),
            escape(&content.root_folder),
            begin.to_rfc3339_opts(SecondsFormat::Millis, true),
        );

        let response = self.call(body).await?;
        let collector = response
            .child_text("returnval")
            .ok_or_else(|| ConnectorError::protocol("CreateCollectorForEvents without returnval"))?
            .to_string();

        debug!(collector = %collector, begin = %begin, "created event history collector");
        self.collector = Some(collector);
        Ok(())
    }

    async fn read_next_events(&mut self, max_count: u32) -> ConnectorResult<Vec<VsphereEvent>> {
        let collector = self
            .collector
            .as_ref()
            .ok_or_else(|| ConnectorError::state("no event history collector"))?;
        let body = format!(
            r#"<ReadNextEvents><_this type="EventHistoryCollector">{}</_this><maxCount>{}</maxCount></ReadNextEvents>"#,
            escape(collector),
            max_count
        );

        let response = self.call(body).await?;
        let mut events = Vec::new();
        for element in response.children_named("returnval") {
            match VsphereEvent::from_element(element.clone()) {
                Ok(event) => events.push(event),
                Err(e) => warn!(error = %e, "skipping unreadable vCenter event"),
            }
        }
        Ok(events)
    }

    async fn destroy_collector(&mut self) -> ConnectorResult<()> {
        let Some(collector) = self.collector.take() else {
            return Ok(());
        };
        let body = format!(
            r#"<DestroyCollector><_this type="EventHistoryCollector">{}</_this></DestroyCollector>"#,
            escape(&collector)
        );
        self.call(body).await?;
        debug!(collector = %collector, "destroyed event history collector");
        Ok(())
    }

    async fn logout(&mut self) -> ConnectorResult<()> {
        let Some(content) = self.content.take() else {
            return Ok(());
        };
        let body = format!(
            r#"<Logout><_this type="SessionManager">{}</_this></Logout>"#,
            escape(&content.session_manager)
        );
        self.call(body).await?;
        info!(address = %self.sdk_url, "logged out of vCenter");
        Ok(())
    }

    fn source_identity(&self) -> &str {
        self.sdk_url.as_str()
    }

    fn api_version(&self) -> &str {
        self.content
            .as_ref()
            .map(|c| c.api_version.as_str())
            .unwrap_or_default()
    }
}
