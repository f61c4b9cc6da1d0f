//! Layered configuration for every cap constant used across the
//! workspace (quota boundaries, nonce cache size, heartbeat interval,
//! stale threshold, pre-check retry cap, freshness windows, …).
//!
//! Callers may override any subset via a `concord.toml` file or
//! `CONCORD_*` environment variables, following the same layered-config
//! convention the rest of the workspace uses for its CLIs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Aggregate configuration for every Concord component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcordConfig {
    /// Message freshness window in seconds.
    pub message_max_age_secs: u64,
    /// Nonce replay cache capacity.
    pub nonce_cache_capacity: usize,
    /// In-memory compensation log cap.
    pub compensation_log_memory_cap: usize,
    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Stale-tab threshold in milliseconds.
    pub stale_threshold_ms: u64,
    /// Pre-check retry cap per queued operation.
    pub precheck_retry_cap: u32,
    /// Default lock acquisition timeout in milliseconds.
    pub lock_timeout_ms: u64,
    /// Default leader-claim ACK timeout in milliseconds.
    pub claim_timeout_ms: u64,
    /// Reconnection attempt cap for the coordinator transport.
    pub reconnect_attempts: u32,
    /// Fixed back-off between reconnection attempts in milliseconds.
    pub reconnect_backoff_ms: u64,
    /// Emergency-backup freshness window in seconds.
    pub emergency_backup_max_age_secs: u64,
    /// Debounced save delay in milliseconds.
    pub save_debounce_ms: u64,
    /// Warning tier boundary, expressed as a fraction of quota.
    pub quota_warning_ratio: f64,
    /// Critical tier boundary.
    pub quota_critical_ratio: f64,
    /// Exceeded tier boundary.
    pub quota_exceeded_ratio: f64,
    /// Fraction of current usage that a cleanup pass should free before
    /// stopping.
    pub cleanup_stop_ratio: f64,
}

impl Default for ConcordConfig {
    fn default() -> Self {
        Self {
            message_max_age_secs: 5,
            nonce_cache_capacity: 1000,
            compensation_log_memory_cap: 100,
            heartbeat_interval_ms: 5_000,
            stale_threshold_ms: 15_000,
            precheck_retry_cap: 10,
            lock_timeout_ms: 10_000,
            claim_timeout_ms: 3_000,
            reconnect_attempts: 5,
            reconnect_backoff_ms: 1_000,
            emergency_backup_max_age_secs: 3_600,
            save_debounce_ms: 1_000,
            quota_warning_ratio: 0.75,
            quota_critical_ratio: 0.90,
            quota_exceeded_ratio: 0.95,
            cleanup_stop_ratio: 0.10,
        }
    }
}

impl ConcordConfig {
    /// Load configuration from built-in defaults, an optional `concord.toml`
    /// in the current directory, and `CONCORD_*` environment variables, in
    /// that order of increasing precedence.
    pub fn load() -> Result<Self, config::ConfigError> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults)?)
            .add_source(config::File::with_name("concord").required(false))
            .add_source(config::Environment::with_prefix("CONCORD"));
        builder.build()?.try_deserialize()
    }

    /// `message_max_age_secs` as a [`Duration`].
    pub fn message_max_age(&self) -> Duration {
        Duration::from_secs(self.message_max_age_secs)
    }

    /// `heartbeat_interval_ms` as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// `stale_threshold_ms` as a [`Duration`].
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    /// `lock_timeout_ms` as a [`Duration`].
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// `claim_timeout_ms` as a [`Duration`].
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_millis(self.claim_timeout_ms)
    }

    /// `reconnect_backoff_ms` as a [`Duration`].
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    /// `emergency_backup_max_age_secs` as a [`Duration`].
    pub fn emergency_backup_max_age(&self) -> Duration {
        Duration::from_secs(self.emergency_backup_max_age_secs)
    }

    /// `save_debounce_ms` as a [`Duration`].
    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_cap_constants() {
        let cfg = ConcordConfig::default();
        assert_eq!(cfg.nonce_cache_capacity, 1000);
        assert_eq!(cfg.compensation_log_memory_cap, 100);
        assert_eq!(cfg.heartbeat_interval_ms, 5_000);
        assert_eq!(cfg.stale_threshold_ms, 15_000);
        assert_eq!(cfg.precheck_retry_cap, 10);
        assert_eq!(cfg.message_max_age_secs, 5);
    }

    #[test]
    fn load_without_overrides_yields_defaults() {
        let cfg = ConcordConfig::load().expect("config should load with pure defaults");
        assert_eq!(cfg, ConcordConfig::default());
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var("CONCORD_NONCE_CACHE_CAPACITY", "42");
        let cfg = ConcordConfig::load().expect("config should load with env override");
        assert_eq!(cfg.nonce_cache_capacity, 42);
        std::env::remove_var("CONCORD_NONCE_CACHE_CAPACITY");
    }
}
