//! Tracker configuration
//!
//! Defaults are tuned for interactive chat agents. Every value can be
//! overridden from the environment via [`TrackerConfig::from_env`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

/// Per-execution timeout and circuit breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Wall-clock deadline for the whole agent run
    pub agent_execution_timeout: Duration,
    /// Bound for a single external call run through the breaker
    pub llm_api_timeout: Duration,
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// How long an open breaker fast-fails before allowing a trial
    pub recovery_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            agent_execution_timeout: Duration::from_secs(25),
            llm_api_timeout: Duration::from_secs(15),
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl TimeoutConfig {
    pub fn validate(&self) -> Result<()> {
        if self.agent_execution_timeout.is_zero() {
            return Err(TrackerError::configuration("agent_execution_timeout must be positive"));
        }
        if self.llm_api_timeout.is_zero() {
            return Err(TrackerError::configuration("llm_api_timeout must be positive"));
        }
        if self.failure_threshold == 0 {
            return Err(TrackerError::configuration("failure_threshold must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration for the execution tracker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Silence after which a started execution is declared dead
    pub heartbeat_timeout: Duration,
    /// Default wall-clock deadline for executions
    pub execution_timeout: Duration,
    /// How often the death monitor sweeps
    pub heartbeat_check_interval: Duration,
    /// How often the timeout monitor sweeps
    pub timeout_check_interval: Duration,
    /// How often terminal records are garbage collected
    pub cleanup_interval: Duration,
    /// How long terminal records stay queryable before cleanup
    pub retention: Duration,
    /// Upper bound for a single notifier or callback invocation
    pub notification_timeout: Duration,
    /// Breaker and external-call settings for executions created without overrides
    pub default_timeout_config: TimeoutConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(10),
            execution_timeout: Duration::from_secs(30),
            heartbeat_check_interval: Duration::from_secs(1),
            timeout_check_interval: Duration::from_secs(1),
            cleanup_interval: Duration::from_secs(60),
            retention: Duration::from_secs(300),
            notification_timeout: Duration::from_secs(5),
            default_timeout_config: TimeoutConfig::default(),
        }
    }
}

impl TrackerConfig {
    /// Load config from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let secs = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(|v| Duration::try_from_secs_f64(v).ok())
        };
        let millis = |key: &str| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
        };

        if let Some(d) = secs("AGENT_TRACKER_HEARTBEAT_TIMEOUT_SECS") {
            config.heartbeat_timeout = d;
        }
        if let Some(d) = secs("AGENT_TRACKER_EXECUTION_TIMEOUT_SECS") {
            config.execution_timeout = d;
        }
        if let Some(d) = millis("AGENT_TRACKER_HEARTBEAT_CHECK_MS") {
            config.heartbeat_check_interval = d;
        }
        if let Some(d) = millis("AGENT_TRACKER_TIMEOUT_CHECK_MS") {
            config.timeout_check_interval = d;
        }
        if let Some(d) = secs("AGENT_TRACKER_CLEANUP_INTERVAL_SECS") {
            config.cleanup_interval = d;
        }
        if let Some(d) = secs("AGENT_TRACKER_RETENTION_SECS") {
            config.retention = d;
        }
        if let Some(d) = millis("AGENT_TRACKER_NOTIFICATION_TIMEOUT_MS") {
            config.notification_timeout = d;
        }
        if let Some(d) = secs("AGENT_TRACKER_AGENT_EXECUTION_TIMEOUT_SECS") {
            config.default_timeout_config.agent_execution_timeout = d;
        }
        if let Some(d) = secs("AGENT_TRACKER_LLM_API_TIMEOUT_SECS") {
            config.default_timeout_config.llm_api_timeout = d;
        }
        if let Some(n) = lookup("AGENT_TRACKER_FAILURE_THRESHOLD").and_then(|v| v.trim().parse().ok()) {
            config.default_timeout_config.failure_threshold = n;
        }
        if let Some(d) = secs("AGENT_TRACKER_RECOVERY_TIMEOUT_SECS") {
            config.default_timeout_config.recovery_timeout = d;
        }

        config
    }

    /// Reject configurations that would make the monitors spin or never fire.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("execution_timeout", self.execution_timeout),
            ("heartbeat_check_interval", self.heartbeat_check_interval),
            ("timeout_check_interval", self.timeout_check_interval),
            ("cleanup_interval", self.cleanup_interval),
            ("notification_timeout", self.notification_timeout),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(TrackerError::configuration(format!("{} must be positive", name)));
            }
        }
        self.default_timeout_config.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = TrackerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_timeout_config.failure_threshold, 3);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let env: HashMap<&str, &str> = [
            ("AGENT_TRACKER_HEARTBEAT_TIMEOUT_SECS", "2.5"),
            ("AGENT_TRACKER_HEARTBEAT_CHECK_MS", "250"),
            ("AGENT_TRACKER_FAILURE_THRESHOLD", "7"),
            ("AGENT_TRACKER_EXECUTION_TIMEOUT_SECS", "not-a-number"),
            ("AGENT_TRACKER_RETENTION_SECS", "1e30"),
            ("AGENT_TRACKER_CLEANUP_INTERVAL_SECS", "-5"),
        ]
        .into_iter()
        .collect();

        let config = TrackerConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(2500));
        assert_eq!(config.heartbeat_check_interval, Duration::from_millis(250));
        assert_eq!(config.default_timeout_config.failure_threshold, 7);
        // Unparsable, negative and out of range values fall back to the default
        assert_eq!(config.execution_timeout, Duration::from_secs(30));
        assert_eq!(config.retention, Duration::from_secs(300));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = TrackerConfig::default();
        config.heartbeat_check_interval = Duration::ZERO;
        assert!(matches!(config.validate(), Err(TrackerError::Configuration(_))));

        let mut config = TrackerConfig::default();
        config.default_timeout_config.failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
