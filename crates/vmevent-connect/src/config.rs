//! Configuration for vmevent-connect
//!
//! One file describes one connector instance: the vendor adapter and the sink it
//! delivers to.
//!
//! ```yaml
//! name: vcenter-prod
//! connector:
//!   kind: vsphere
//!   address: https://vcenter.example.com/sdk
//!   username: ${VCENTER_USER}
//!   password: ${VCENTER_PASSWORD}
//! sink:
//!   url: http://broker.example.com/events
//! ```

use crate::backoff::BackoffConfig;
use crate::error::{ConnectError, Result};
use crate::horizon::HorizonConfig;
use crate::sink::HttpSinkConfig;
use crate::vsphere::VsphereConfig;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct ConnectConfig {
    /// Connector instance name, also the checkpoint key
    #[serde(default = "default_name")]
    pub name: String,

    pub connector: ConnectorConfig,

    pub sink: HttpSinkConfig,
}

fn default_name() -> String {
    "vmevent".to_string()
}

/// Vendor adapter, selected by `kind`
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConnectorConfig {
    Horizon(HorizonConfig),
    Vsphere(VsphereConfig),
}

impl ConnectorConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Horizon(_) => "horizon",
            Self::Vsphere(_) => "vsphere",
        }
    }

    pub fn poll_interval(&self) -> Duration {
        match self {
            Self::Horizon(c) => c.poll_interval,
            Self::Vsphere(c) => c.poll_interval,
        }
    }

    pub fn backoff(&self) -> BackoffConfig {
        match self {
            Self::Horizon(c) => c.backoff,
            Self::Vsphere(c) => c.backoff,
        }
    }

    /// Endpoint the adapter talks to, for logging
    pub fn endpoint(&self) -> &str {
        match self {
            Self::Horizon(c) => &c.server_url,
            Self::Vsphere(c) => &c.address,
        }
    }
}

impl ConnectConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConnectError::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML document after environment expansion
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);

        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| ConnectError::config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ConnectError::config("'name' must not be empty"));
        }

        let settings = match &self.connector {
            ConnectorConfig::Horizon(horizon) => {
                horizon.validate().map_err(|e| {
                    ConnectError::config(format!("connector '{}': {}", self.name, e))
                })?;
                horizon.validate_settings()
            }
            ConnectorConfig::Vsphere(vsphere) => {
                vsphere.validate().map_err(|e| {
                    ConnectError::config(format!("connector '{}': {}", self.name, e))
                })?;
                vsphere.validate_settings()
            }
        };
        settings.map_err(|e| ConnectError::config(format!("connector '{}': {}", self.name, e)))?;

        self.sink
            .validate()
            .map_err(|e| ConnectError::config(format!("sink: {}", e)))?;

        Ok(())
    }

    /// JSON schema of the configuration file
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(ConnectConfig)).unwrap_or_default()
    }
}
