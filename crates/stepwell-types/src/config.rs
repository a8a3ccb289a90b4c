//! Engine configuration types.
//!
//! Deserialized from `{data_dir}/config.toml` by the infrastructure layer.
//! Every field has a default, so a missing or partial file still yields a
//! working engine. The retry constants are deployment tuning, not part of
//! the engine contract.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Hop guard: maximum nodes one run may execute.
    #[serde(default)]
    pub limits: LimitSettings,
    /// Retry schedule for retryable capability failures.
    #[serde(default)]
    pub retry: RetrySettings,
    /// Scheduler polling.
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

/// Run execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Maximum node hops per run before quarantine.
    #[serde(default = "default_max_hops")]
    pub max_hops: u32,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_hops: default_max_hops(),
        }
    }
}

/// Exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Delay before the first retry, in seconds.
    #[serde(default = "default_base_secs")]
    pub base_secs: u64,
    /// Multiplier applied per subsequent retry.
    #[serde(default = "default_factor")]
    pub factor: u32,
    /// Upper bound on any single delay, in seconds.
    #[serde(default = "default_cap_secs")]
    pub cap_secs: u64,
    /// Retries allowed before quarantine.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_secs: default_base_secs(),
            factor: default_factor(),
            cap_secs: default_cap_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// Scheduler polling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Seconds between due-run scans.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Due runs processed per tick.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_limit: default_batch_limit(),
        }
    }
}

fn default_max_hops() -> u32 {
    256
}

fn default_base_secs() -> u64 {
    30
}

fn default_factor() -> u32 {
    2
}

fn default_cap_secs() -> u64 {
    3_600
}

fn default_max_retries() -> u32 {
    3
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_batch_limit() -> u32 {
    50
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.limits.max_hops, 256);
        assert_eq!(config.retry.base_secs, 30);
        assert_eq!(config.retry.factor, 2);
        assert_eq!(config.retry.cap_secs, 3_600);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.scheduler.poll_interval_secs, 30);
        assert_eq!(config.scheduler.batch_limit, 50);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let toml_str = r#"
[retry]
max_retries = 5
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_secs, 30, "unspecified fields default");
        assert_eq!(config.limits.max_hops, 256);
    }

    #[test]
    fn test_roundtrip() {
        let config = EngineConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.scheduler.batch_limit, config.scheduler.batch_limit);
    }
}
