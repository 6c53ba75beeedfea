//! Idle backoff for polling loops
//!
//! Doubles from a floor up to a ceiling, no jitter. A productive poll resets it.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default floor for the idle backoff
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Default ceiling for the idle backoff
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5);

const BACKOFF_FACTOR: u32 = 2;

/// Backoff bounds as they appear in connector configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BackoffConfig {
    /// First delay after an idle poll (default: 1s)
    #[serde(default = "default_initial", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub initial: Duration,

    /// Upper bound for the delay (default: 5s)
    #[serde(default = "default_max", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub max: Duration,
}

fn default_initial() -> Duration {
    DEFAULT_BACKOFF_INITIAL
}

fn default_max() -> Duration {
    DEFAULT_BACKOFF_MAX
}

impl BackoffConfig {
    /// A zero floor never grows, so idle polls would spin
    pub fn check(&self) -> std::result::Result<(), String> {
        if self.initial.is_zero() {
            return Err("backoff.initial must be greater than zero".to_string());
        }
        if self.initial > self.max {
            return Err(format!(
                "backoff.initial ({:?}) must not exceed backoff.max ({:?})",
                self.initial, self.max
            ));
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: DEFAULT_BACKOFF_INITIAL,
            max: DEFAULT_BACKOFF_MAX,
        }
    }
}

/// Stateful backoff tracker
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Option<Duration>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            initial: config.initial,
            max: config.max.max(config.initial),
            current: None,
        }
    }

    /// Delay to sleep before the next attempt; grows on every call
    pub fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial,
            Some(current) => current.saturating_mul(BACKOFF_FACTOR).min(self.max),
        };
        self.current = Some(delay);
        delay
    }

    /// Jump straight to the ceiling; the next delay is `max`
    pub fn saturate(&mut self) {
        self.current = Some(self.max);
    }

    /// Back to the floor after a productive poll
    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn is_engaged(&self) -> bool {
        self.current.is_some()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
