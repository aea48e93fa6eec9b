//! Reconciler timing configuration

use crate::error::Phase;
use crate::poller::{PollConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeouts and poll intervals used by the [`Reconciler`](crate::Reconciler)
///
/// Loaded from `converge.yaml` (see `converge-config`), every field optional:
///
/// ```yaml
/// create_timeout_ms: 600000
/// poll_interval_ms: 10000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Ceiling for waiting on creation to complete
    #[serde(default = "default_operation_timeout")]
    pub create_timeout_ms: u64,
    /// Ceiling for waiting on an update to complete
    #[serde(default = "default_operation_timeout")]
    pub update_timeout_ms: u64,
    /// Ceiling for waiting on deletion to complete
    #[serde(default = "default_operation_timeout")]
    pub delete_timeout_ms: u64,
    /// How long a freshly created resource may read as not found
    #[serde(default = "default_consistency_timeout")]
    pub consistency_timeout_ms: u64,
    /// How long any call keeps retrying transient errors
    #[serde(default = "default_propagation_timeout")]
    pub propagation_timeout_ms: u64,
    /// Longest delay between checks
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Shortest delay between checks
    #[serde(default = "default_min_poll_interval")]
    pub min_poll_interval_ms: u64,
    /// Delay before the first status check of an asynchronous operation
    #[serde(default)]
    pub initial_delay_ms: u64,
    /// Consecutive target observations required before a poll succeeds
    #[serde(default = "default_continuous_target_occurrence")]
    pub continuous_target_occurrence: u32,
}

fn default_operation_timeout() -> u64 {
    20 * 60 * 1000 // 20 minutes
}
fn default_consistency_timeout() -> u64 {
    60 * 1000 // 1 minute
}
fn default_propagation_timeout() -> u64 {
    2 * 60 * 1000 // 2 minutes
}
fn default_poll_interval() -> u64 {
    5000
}
fn default_min_poll_interval() -> u64 {
    1000
}
fn default_continuous_target_occurrence() -> u32 {
    1
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            create_timeout_ms: default_operation_timeout(),
            update_timeout_ms: default_operation_timeout(),
            delete_timeout_ms: default_operation_timeout(),
            consistency_timeout_ms: default_consistency_timeout(),
            propagation_timeout_ms: default_propagation_timeout(),
            poll_interval_ms: default_poll_interval(),
            min_poll_interval_ms: default_min_poll_interval(),
            initial_delay_ms: 0,
            continuous_target_occurrence: default_continuous_target_occurrence(),
        }
    }
}

impl ReconcilerConfig {
    /// Load from the discovered config file, or defaults when there is none
    pub fn load() -> converge_config::Result<Self> {
        Ok(converge_config::load()?.unwrap_or_default())
    }

    /// Parse from YAML text
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    pub fn timeout(&self, phase: Phase) -> Duration {
        let ms = match phase {
            Phase::Create => self.create_timeout_ms,
            Phase::Update => self.update_timeout_ms,
            Phase::Delete => self.delete_timeout_ms,
            Phase::Read | Phase::Poll => self.create_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn consistency_timeout(&self) -> Duration {
        Duration::from_millis(self.consistency_timeout_ms)
    }

    pub fn propagation_timeout(&self) -> Duration {
        Duration::from_millis(self.propagation_timeout_ms)
    }

    /// Poll parameters for waiting on an operation of `phase`
    pub fn poll_config(&self, phase: Phase) -> PollConfig {
        PollConfig {
            timeout: self.timeout(phase),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            min_poll_interval: Duration::from_millis(self.min_poll_interval_ms),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            not_found_checks: 0,
            continuous_target_occurrence: self.continuous_target_occurrence.max(1),
        }
    }

    /// Transient-error retry bounds with the given budget
    pub fn retry_policy(&self, timeout: Duration) -> RetryPolicy {
        RetryPolicy::new(
            timeout,
            Duration::from_millis(self.min_poll_interval_ms),
            Duration::from_millis(self.poll_interval_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = ReconcilerConfig::from_yaml("create_timeout_ms: 600000\npoll_interval_ms: 250\n")
            .unwrap();

        assert_eq!(config.timeout(Phase::Create), Duration::from_secs(600));
        assert_eq!(config.timeout(Phase::Delete), Duration::from_secs(20 * 60));
        assert_eq!(config.consistency_timeout(), Duration::from_secs(60));

        let poll = config.poll_config(Phase::Create);
        assert_eq!(poll.poll_interval, Duration::from_millis(250));
        assert_eq!(poll.min_poll_interval, Duration::from_secs(1));
        assert_eq!(poll.continuous_target_occurrence, 1);
    }

    #[test]
    #[serial]
    fn test_load_reads_file_named_by_env() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("reconciler.yaml");
        std::fs::write(&path, "delete_timeout_ms: 90000\ninitial_delay_ms: 500\n").unwrap();

        unsafe {
            std::env::set_var(converge_config::CONFIG_PATH_ENV, &path);
        }
        let result = ReconcilerConfig::load();
        unsafe {
            std::env::remove_var(converge_config::CONFIG_PATH_ENV);
        }

        let config = result.unwrap();
        assert_eq!(config.timeout(Phase::Delete), Duration::from_secs(90));
        assert_eq!(
            config.poll_config(Phase::Delete).initial_delay,
            Duration::from_millis(500)
        );
        assert_eq!(config.timeout(Phase::Create), Duration::from_secs(20 * 60));
        assert_eq!(config.poll_interval_ms, 5000);
    }

    #[test]
    #[serial]
    fn test_load_rejects_malformed_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("reconciler.yaml");
        std::fs::write(&path, "poll_interval_ms: soon\n").unwrap();

        unsafe {
            std::env::set_var(converge_config::CONFIG_PATH_ENV, &path);
        }
        let result = ReconcilerConfig::load();
        unsafe {
            std::env::remove_var(converge_config::CONFIG_PATH_ENV);
        }

        assert!(matches!(
            result,
            Err(converge_config::ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_retry_policy_uses_poll_bounds() {
        let config = ReconcilerConfig::default();
        let policy = config.retry_policy(config.propagation_timeout());

        assert_eq!(policy.timeout, Duration::from_secs(120));
        assert_eq!(policy.min_interval, Duration::from_secs(1));
        assert_eq!(policy.max_interval, Duration::from_secs(5));
    }
}
