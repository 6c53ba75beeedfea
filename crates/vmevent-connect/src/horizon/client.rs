//! Horizon audit-event REST client

use super::auth::{AuthSession, Credentials};
use super::event::AuditEventSummary;
use super::HorizonConfig;
use crate::error::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use serde_json::json;
use tracing::{debug, info};
use url::Url;

const AUDIT_EVENTS_PATH: &str = "rest/external/v1/audit-events";

/// Absorbs clock skew between this process and the Horizon server
const FILTER_LOOKAHEAD_HOURS: i64 = 24;

/// Source of Horizon audit events, newest first
#[async_trait]
pub trait AuditEventApi: Send {
    async fn login(&mut self) -> ConnectorResult<()>;

    /// `position == 0` fetches the most recent page, otherwise every event with
    /// `time >= position` (milliseconds, inclusive)
    async fn fetch_since(&mut self, position: i64) -> ConnectorResult<Vec<AuditEventSummary>>;

    async fn logout(&mut self) -> ConnectorResult<()>;
}

pub struct HorizonClient {
    client: reqwest::Client,
    events_url: Url,
    session: AuthSession,
    page_size: u32,
}

impl HorizonClient {
    pub fn new(config: &HorizonConfig) -> ConnectorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure_skip_verify)
            .build()
            .map_err(|e| ConnectorError::config(format!("failed to build HTTP client: {}", e)))?;

        let base_url = base_url(&config.server_url)?;
        let events_url = base_url
            .join(AUDIT_EVENTS_PATH)
            .map_err(|e| ConnectorError::config(format!("invalid Horizon URL: {}", e)))?;

        let session = AuthSession::new(
            client.clone(),
            base_url,
            Credentials {
                domain: config.domain.clone(),
                username: config.username.clone(),
                password: config.password.clone(),
            },
        );

        Ok(Self {
            client,
            events_url,
            session,
            page_size: config.page_size,
        })
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    async fn request(&self, position: i64) -> ConnectorResult<reqwest::Response> {
        let request = self
            .client
            .get(self.events_url.clone())
            .bearer_auth(self.session.access_token()?);

        let request = if position == 0 {
            request.query(&[("size", self.page_size.to_string()), ("page", "1".to_string())])
        } else {
            request.query(&[("filter", time_filter(position).to_string())])
        };

        Ok(request.send().await?)
    }
}

/// Inclusive `[position, now + 24h]` filter on the event time
pub fn time_filter(position: i64) -> serde_json::Value {
    let upper = Utc::now() + ChronoDuration::hours(FILTER_LOOKAHEAD_HOURS);
    json!({
        "type": "Between",
        "name": "time",
        "fromValue": position,
        "toValue": upper.timestamp_millis(),
    })
}

fn base_url(server_url: &str) -> ConnectorResult<Url> {
    let mut url = Url::parse(server_url)
        .map_err(|e| ConnectorError::config(format!("invalid Horizon URL '{}': {}", server_url, e)))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

#[async_trait]
impl AuditEventApi for HorizonClient {
    async fn login(&mut self) -> ConnectorResult<()> {
        self.session.login().await
    }

    async fn fetch_since(&mut self, position: i64) -> ConnectorResult<Vec<AuditEventSummary>> {
        if self.session.access_token().is_err() {
            self.session.ensure_authenticated().await?;
        }

        let mut response = self.request(position).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            info!("Horizon refused the access token, re-authenticating");
            self.session.invalidate();
            self.session.ensure_authenticated().await?;

            response = self.request(position).await?;
            if response.status() == StatusCode::UNAUTHORIZED {
                self.session.invalidate();
                return Err(ConnectorError::Unauthorized(
                    "audit events still unauthorized after re-authentication".to_string(),
                ));
            }
        }

        let status = response.status();
        if status == StatusCode::CONFLICT {
            return Err(ConnectorError::BackingStoreUninitialized);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ConnectorError::UnexpectedStatus {
                status: status.as_u16(),
                message,
            });
        }

        let events: Vec<AuditEventSummary> = response.json().await?;
        debug!(position, count = events.len(), "fetched audit events");
        Ok(events)
    }

    async fn logout(&mut self) -> ConnectorResult<()> {
        self.session.logout().await
    }
}
