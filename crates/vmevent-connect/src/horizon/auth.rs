//! Horizon REST authentication
//!
//! ```text
//! Unauthenticated --login--> Authenticated --401--> Expired
//!        ^                        ^                   |
//!        |                        +-----refresh-------+
//!        +-------------logout / refresh token expired-+
//! ```

use crate::error::{ConnectorError, ConnectorResult};
use crate::types::SensitiveString;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

/// Login credentials
#[derive(Debug, Clone)]
pub struct Credentials {
    pub domain: String,
    pub username: String,
    pub password: SensitiveString,
}

#[derive(Debug, Clone)]
pub struct AuthTokens {
    pub access_token: SensitiveString,
    pub refresh_token: SensitiveString,
}

#[derive(Debug, Clone)]
pub enum SessionState {
    Unauthenticated,
    Authenticated(AuthTokens),
    /// The access token was refused; the refresh token may still be good
    Expired { refresh_token: SensitiveString },
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: String,
    refresh_token: String,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
}

pub struct AuthSession {
    client: reqwest::Client,
    base_url: Url,
    credentials: Credentials,
    state: SessionState,
}

impl AuthSession {
    pub fn new(client: reqwest::Client, base_url: Url, credentials: Credentials) -> Self {
        Self {
            client,
            base_url,
            credentials,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Bearer token for the next request
    pub fn access_token(&self) -> ConnectorResult<&str> {
        match &self.state {
            SessionState::Authenticated(tokens) => Ok(tokens.access_token.expose_secret()),
            _ => Err(ConnectorError::Unauthorized("no active session".to_string())),
        }
    }

    fn endpoint(&self, path: &str) -> ConnectorResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| ConnectorError::config(format!("invalid Horizon URL: {}", e)))
    }

    pub async fn login(&mut self) -> ConnectorResult<()> {
        let body = json!({
            "domain": self.credentials.domain,
            "username": self.credentials.username,
            "password": self.credentials.password.expose_secret(),
        });

        let response = self
            .client
            .post(self.endpoint("rest/login")?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            self.state = SessionState::Unauthenticated;
            return Err(ConnectorError::Auth {
                status: status.as_u16(),
            });
        }

        let tokens: LoginResponse = response.json().await?;
        self.state = SessionState::Authenticated(AuthTokens {
            access_token: SensitiveString::new(tokens.access_token),
            refresh_token: SensitiveString::new(tokens.refresh_token),
        });
        info!(user = %self.credentials.username, domain = %self.credentials.domain, "logged in to Horizon");
        Ok(())
    }

    /// Exchange the refresh token for a new access token
    pub async fn refresh(&mut self) -> ConnectorResult<()> {
        let refresh_token = match &self.state {
            SessionState::Authenticated(tokens) => tokens.refresh_token.clone(),
            SessionState::Expired { refresh_token } => refresh_token.clone(),
            SessionState::Unauthenticated => return Err(ConnectorError::RefreshExpired),
        };

        let response = self
            .client
            .post(self.endpoint("rest/refresh")?)
            .json(&json!({ "refresh_token": refresh_token.expose_secret() }))
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            self.state = SessionState::Unauthenticated;
            return Err(ConnectorError::RefreshExpired);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ConnectorError::UnexpectedStatus {
                status: status.as_u16(),
                message,
            });
        }

        let refreshed: RefreshResponse = response.json().await?;
        self.state = SessionState::Authenticated(AuthTokens {
            access_token: SensitiveString::new(refreshed.access_token),
            refresh_token,
        });
        debug!("refreshed Horizon access token");
        Ok(())
    }

    /// Mark the current access token as refused by the server
    pub fn invalidate(&mut self) {
        if let SessionState::Authenticated(tokens) = &self.state {
            self.state = SessionState::Expired {
                refresh_token: tokens.refresh_token.clone(),
            };
        }
    }

    /// Refresh when a refresh token is held, fall back to a full login when it expired
    pub async fn ensure_authenticated(&mut self) -> ConnectorResult<()> {
        if matches!(self.state, SessionState::Unauthenticated) {
            return self.login().await;
        }

        match self.refresh().await {
            Err(ConnectorError::RefreshExpired) => {
                info!("refresh token expired, logging in again");
                self.login().await
            }
            other => other,
        }
    }

    /// Best effort; the session is dropped locally whatever the server says
    pub async fn logout(&mut self) -> ConnectorResult<()> {
        let refresh_token = match std::mem::replace(&mut self.state, SessionState::Unauthenticated) {
            SessionState::Authenticated(tokens) => tokens.refresh_token,
            SessionState::Expired { refresh_token } => refresh_token,
            SessionState::Unauthenticated => return Ok(()),
        };

        let response = self
            .client
            .post(self.endpoint("rest/logout")?)
            .json(&json!({ "refresh_token": refresh_token.expose_secret() }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Horizon logout was not accepted");
            return Err(ConnectorError::UnexpectedStatus {
                status: status.as_u16(),
                message: "logout".to_string(),
            });
        }
        info!("logged out of Horizon");
        Ok(())
    }
}
