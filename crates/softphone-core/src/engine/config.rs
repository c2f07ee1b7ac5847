use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::recovery::RetryConfig;
use crate::error::{SoftphoneError, SoftphoneResult};

/// Configuration for the call engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftphoneConfig {
    /// Master switch for the PBX integration
    pub enabled: bool,
    /// Extension of the signed-in user, used to filter PBX webhook members
    pub extension: Option<String>,
    /// Identity recovery attempts while a call is ringing
    pub poller_max_attempts: u32,
    pub poller_interval_ms: u64,
    /// How long an ended call stays visible before the engine returns to idle
    pub ended_grace_ms: u64,
    /// How often to check that an active call still exists in the SDK; `None` disables it
    pub liveness_interval_ms: Option<u64>,
    /// Per-candidate SDK invocation timeout
    pub invoke_timeout_ms: u64,
    /// Overall deadline for a hangup, all candidates included
    pub hangup_timeout_ms: u64,
    /// Identity resolution retries before answering
    pub answer_retry: RetryConfig,
}

impl SoftphoneConfig {
    pub fn new() -> Self {
        Self {
            enabled: true,
            extension: None,
            poller_max_attempts: 10,
            poller_interval_ms: 500,
            ended_grace_ms: 3_000,
            liveness_interval_ms: Some(5_000),
            invoke_timeout_ms: 2_000,
            hangup_timeout_ms: 5_000,
            answer_retry: RetryConfig::default(),
        }
    }

    /// Parse a JSON document, filling unspecified fields with defaults
    pub fn from_json_str(json: &str) -> SoftphoneResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| SoftphoneError::invalid_config("json", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    pub fn with_poller(mut self, max_attempts: u32, interval: Duration) -> Self {
        self.poller_max_attempts = max_attempts;
        self.poller_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_ended_grace(mut self, grace: Duration) -> Self {
        self.ended_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_liveness_interval(mut self, interval: Option<Duration>) -> Self {
        self.liveness_interval_ms = interval.map(|i| i.as_millis() as u64);
        self
    }

    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_hangup_timeout(mut self, timeout: Duration) -> Self {
        self.hangup_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_answer_retry(mut self, retry: RetryConfig) -> Self {
        self.answer_retry = retry;
        self
    }

    pub fn poller_interval(&self) -> Duration {
        Duration::from_millis(self.poller_interval_ms)
    }

    pub fn ended_grace(&self) -> Duration {
        Duration::from_millis(self.ended_grace_ms)
    }

    pub fn liveness_interval(&self) -> Option<Duration> {
        self.liveness_interval_ms.map(Duration::from_millis)
    }

    pub fn invoke_timeout(&self) -> Duration {
        Duration::from_millis(self.invoke_timeout_ms)
    }

    pub fn hangup_timeout(&self) -> Duration {
        Duration::from_millis(self.hangup_timeout_ms)
    }

    /// Reject values that would stall the engine
    pub fn validate(&self) -> SoftphoneResult<()> {
        if self.poller_interval_ms == 0 {
            return Err(SoftphoneError::invalid_config("poller_interval_ms", "must be positive"));
        }
        if self.invoke_timeout_ms == 0 {
            return Err(SoftphoneError::invalid_config("invoke_timeout_ms", "must be positive"));
        }
        if self.hangup_timeout_ms < self.invoke_timeout_ms {
            return Err(SoftphoneError::invalid_config(
                "hangup_timeout_ms",
                "must not be shorter than invoke_timeout_ms",
            ));
        }
        if self.liveness_interval_ms == Some(0) {
            return Err(SoftphoneError::invalid_config("liveness_interval_ms", "must be positive"));
        }
        if self.answer_retry.max_attempts == 0 {
            return Err(SoftphoneError::invalid_config("answer_retry.max_attempts", "must be at least 1"));
        }
        if matches!(self.extension.as_deref(), Some(ext) if ext.trim().is_empty()) {
            return Err(SoftphoneError::MissingConfiguration {
                field: "extension".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for SoftphoneConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_fills_defaults() {
        let config = SoftphoneConfig::from_json_str(r#"{"ended_grace_ms": 1500, "liveness_interval_ms": null}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.ended_grace(), Duration::from_millis(1500));
        assert_eq!(config.liveness_interval(), None);
        assert_eq!(config.poller_max_attempts, SoftphoneConfig::default().poller_max_attempts);
    }

    #[test]
    fn test_validation() {
        assert!(SoftphoneConfig::default().validate().is_ok());

        let bad = SoftphoneConfig::default().with_hangup_timeout(Duration::from_millis(10));
        assert!(matches!(bad.validate(), Err(SoftphoneError::InvalidConfiguration { .. })));

        assert!(SoftphoneConfig::from_json_str(r#"{"poller_interval_ms": 0}"#).is_err());
        assert!(SoftphoneConfig::from_json_str("not json").is_err());
    }
}
