//! Monitor configuration
//!
//! All tunables for detection, countdown, location and dispatch live here.
//! Values load from an optional JSON file and can be overridden from the
//! environment, the same way the service binaries read their settings.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default countdown before an alert is dispatched
pub const DEFAULT_COUNTDOWN_SECS: u32 = 30;

/// Default delay between consecutive recipients
pub const DEFAULT_DISPATCH_STAGGER_MS: u64 = 1000;

/// Location budget once the countdown has elapsed
pub const DEFAULT_ALERT_LOCATION_TIMEOUT_MS: u64 = 5000;

/// Location budget for a user-initiated lookup
pub const DEFAULT_LOOKUP_LOCATION_TIMEOUT_MS: u64 = 10_000;

/// Delay before the speech source is restarted after it ends
pub const DEFAULT_RESTART_DELAY_MS: u64 = 1000;

/// Phrases that trigger an alert, in match priority order
pub const DEFAULT_PHRASES: [&str; 6] = ["help", "help me", "save", "save me", "emergency", "danger"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the distress monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Distress phrases (lower-case, first match wins)
    pub phrases: Vec<String>,

    /// Countdown length in seconds
    pub countdown_secs: u32,

    /// Delay between recipients (milliseconds)
    pub dispatch_stagger_ms: u64,

    /// Location timeout after the countdown (milliseconds)
    pub alert_location_timeout_ms: u64,

    /// Location timeout for user-initiated lookups (milliseconds)
    pub lookup_location_timeout_ms: u64,

    /// Delay before restarting an ended speech source (milliseconds)
    pub restart_delay_ms: u64,

    /// Name used in the alert text
    pub user_name: Option<String>,

    /// Buffered notices per subscriber
    pub notice_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            phrases: DEFAULT_PHRASES.iter().map(|p| p.to_string()).collect(),
            countdown_secs: DEFAULT_COUNTDOWN_SECS,
            dispatch_stagger_ms: DEFAULT_DISPATCH_STAGGER_MS,
            alert_location_timeout_ms: DEFAULT_ALERT_LOCATION_TIMEOUT_MS,
            lookup_location_timeout_ms: DEFAULT_LOOKUP_LOCATION_TIMEOUT_MS,
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
            user_name: None,
            notice_capacity: 64,
        }
    }
}

impl MonitorConfig {
    /// Load configuration from a JSON file; missing fields take defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!("Loading monitor config from {}", path.display());

        let raw = std::fs::read_to_string(path)?;
        let mut config: MonitorConfig = serde_json::from_str(&raw)?;
        config.normalize();
        config.validate()?;

        Ok(config)
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(name) = std::env::var("DISTRESS_USER_NAME") {
            self.user_name = Some(name);
        }

        if let Ok(secs) = std::env::var("DISTRESS_COUNTDOWN_SECS") {
            self.countdown_secs = secs.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("DISTRESS_COUNTDOWN_SECS is not a number: {}", secs))
            })?;
        }

        if let Ok(delay) = std::env::var("DISTRESS_RESTART_DELAY_MS") {
            self.restart_delay_ms = delay.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("DISTRESS_RESTART_DELAY_MS is not a number: {}", delay))
            })?;
        }

        if let Ok(phrases) = std::env::var("DISTRESS_PHRASES") {
            self.phrases = phrases.split(',').map(|p| p.to_string()).collect();
        }

        self.normalize();
        self.validate()
    }

    /// Lower-case and trim phrases, dropping blanks
    pub fn normalize(&mut self) {
        let before = self.phrases.len();
        self.phrases = self
            .phrases
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();

        if self.phrases.len() != before {
            warn!("Dropped {} blank distress phrase(s)", before - self.phrases.len());
        }

        if let Some(name) = &self.user_name {
            if name.trim().is_empty() {
                self.user_name = None;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.phrases.is_empty() {
            return Err(ConfigError::Invalid(
                "At least one distress phrase is required".to_string(),
            ));
        }

        if self.phrases.iter().any(|p| p.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "Distress phrases must not be blank".to_string(),
            ));
        }

        if self.countdown_secs == 0 {
            return Err(ConfigError::Invalid(
                "countdown_secs must be greater than 0".to_string(),
            ));
        }

        if self.alert_location_timeout_ms == 0 || self.lookup_location_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "Location timeouts must be greater than 0".to_string(),
            ));
        }

        if self.alert_location_timeout_ms > self.lookup_location_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "Alert location timeout ({}ms) must not exceed lookup timeout ({}ms)",
                self.alert_location_timeout_ms, self.lookup_location_timeout_ms
            )));
        }

        if self.notice_capacity == 0 {
            return Err(ConfigError::Invalid(
                "notice_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.dispatch_stagger_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn alert_location_timeout(&self) -> Duration {
        Duration::from_millis(self.alert_location_timeout_ms)
    }

    pub fn lookup_location_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_location_timeout_ms)
    }
}
