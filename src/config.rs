//! Configuration surface, reloadable at runtime.
//!
//! `CoreConfig` is what an external YAML/JSON loader deserializes and
//! hands to [`crate::core::MasterCore::apply_config`] at init time or
//! between polling ticks — never concurrently with a running tick.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_scan_start() -> u8 {
    0x02
}
fn default_scan_end() -> u8 {
    0x08
}
fn default_health_interval_ms() -> u64 {
    10_000
}
fn default_health_jitter_percent() -> u8 {
    10
}
fn default_offline_threshold_ms() -> u64 {
    30_000
}
fn default_retry_count() -> u32 {
    2
}
fn default_response_timeout_ms() -> u64 {
    500
}
fn default_cb_fail_threshold() -> u32 {
    3
}
fn default_cb_base_cooldown_ms() -> u64 {
    1_000
}
fn default_cb_max_cooldown_ms() -> u64 {
    30_000
}

/// Per-module override of a subset of the criticality matrix fields.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModuleConfigOverride {
    pub offline_timeout_ms: Option<u64>,
    pub failure_timeout_ms: Option<u64>,
    pub health_check_interval_ms: Option<u64>,
    pub consecutive_failure_threshold: Option<u32>,
    pub max_response_time_ms: Option<u64>,
    pub min_success_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub scan_start: u8,
    pub scan_end: u8,
    pub health_interval_ms: u64,
    pub health_jitter_percent: u8,
    pub offline_threshold_ms: u64,
    pub retry_count: u32,
    pub response_timeout_ms: u64,
    pub cb_fail_threshold: u32,
    pub cb_base_cooldown_ms: u64,
    pub cb_max_cooldown_ms: u64,
    pub module_overrides: HashMap<u8, ModuleConfigOverride>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            scan_start: default_scan_start(),
            scan_end: default_scan_end(),
            health_interval_ms: default_health_interval_ms(),
            health_jitter_percent: default_health_jitter_percent(),
            offline_threshold_ms: default_offline_threshold_ms(),
            retry_count: default_retry_count(),
            response_timeout_ms: default_response_timeout_ms(),
            cb_fail_threshold: default_cb_fail_threshold(),
            cb_base_cooldown_ms: default_cb_base_cooldown_ms(),
            cb_max_cooldown_ms: default_cb_max_cooldown_ms(),
            module_overrides: HashMap::new(),
        }
    }
}

impl CoreConfig {
    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Jitter bound clamp: random jitter of ±health_jitter_percent, capped
    /// at 50%.
    pub fn clamped_jitter_percent(&self) -> u8 {
        self.health_jitter_percent.min(50)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = CoreConfig::default();
        assert_eq!(config.scan_start, 0x02);
        assert_eq!(config.scan_end, 0x08);
        assert_eq!(config.retry_count, 2);
        assert_eq!(config.response_timeout_ms, 500);
        assert_eq!(config.cb_fail_threshold, 3);
    }

    #[test]
    fn jitter_percent_is_capped_at_50() {
        let mut config = CoreConfig::default();
        config.health_jitter_percent = 90;
        assert_eq!(config.clamped_jitter_percent(), 50);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config = CoreConfig::from_json(r#"{"retry_count": 5}"#).unwrap();
        assert_eq!(config.retry_count, 5);
        assert_eq!(config.scan_start, 0x02);
    }
}
