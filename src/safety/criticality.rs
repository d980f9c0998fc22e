//! Criticality matrix.
//!
//! Static per-address configuration the safety monitor uses to decide
//! offline/failure timeouts, the failure action to execute, and the
//! ceiling response level a module may drive the system to.

use std::collections::HashMap;

use crate::health::{Criticality, FailureAction, ResponseLevel};
use crate::registry::ModuleType;

#[derive(Debug, Clone, Copy)]
pub struct ModuleSafetyConfig {
    pub criticality: Criticality,
    pub offline_timeout_ms: u64,
    pub failure_timeout_ms: u64,
    pub recovery_timeout_ms: u64,
    pub failure_action: FailureAction,
    pub max_response_level: ResponseLevel,
    pub health_check_interval_ms: u64,
    pub consecutive_failure_threshold: u32,
    pub max_response_time_ms: u64,
    pub min_success_rate: f64,
}

/// Default, authoritative matrix for the four shipped module types.
/// Addresses follow the documented defaults; an embedder may override
/// any field via `apply_config`.
pub fn default_matrix() -> HashMap<u8, ModuleSafetyConfig> {
    let mut map = HashMap::new();
    map.insert(
        0x02,
        ModuleSafetyConfig {
            criticality: Criticality::Essential,
            offline_timeout_ms: 1_000,
            failure_timeout_ms: 1_000,
            recovery_timeout_ms: 1_000,
            failure_action: FailureAction::DelayedEStop { delay_ms: 5_000 },
            max_response_level: ResponseLevel::Critical,
            health_check_interval_ms: 500,
            consecutive_failure_threshold: 3,
            max_response_time_ms: 200,
            min_success_rate: 0.9,
        },
    );
    map.insert(
        0x03,
        ModuleSafetyConfig {
            criticality: Criticality::SafetyCritical,
            offline_timeout_ms: 100,
            failure_timeout_ms: 100,
            recovery_timeout_ms: 100,
            failure_action: FailureAction::ImmediateEStop,
            max_response_level: ResponseLevel::Emergency,
            health_check_interval_ms: 50,
            consecutive_failure_threshold: 1,
            max_response_time_ms: 50,
            min_success_rate: 0.95,
        },
    );
    map.insert(
        0x04,
        ModuleSafetyConfig {
            criticality: Criticality::Important,
            offline_timeout_ms: 500,
            failure_timeout_ms: 500,
            recovery_timeout_ms: 500,
            failure_action: FailureAction::Warning,
            max_response_level: ResponseLevel::Warning,
            health_check_interval_ms: 1_000,
            consecutive_failure_threshold: 3,
            max_response_time_ms: 100,
            min_success_rate: 0.9,
        },
    );
    map.insert(
        0x06,
        ModuleSafetyConfig {
            criticality: Criticality::Optional,
            offline_timeout_ms: 5_000,
            failure_timeout_ms: 5_000,
            recovery_timeout_ms: 5_000,
            failure_action: FailureAction::LogOnly,
            max_response_level: ResponseLevel::Monitoring,
            health_check_interval_ms: 5_000,
            consecutive_failure_threshold: 5,
            max_response_time_ms: 500,
            min_success_rate: 0.8,
        },
    );
    map
}

pub fn default_config_for(module_type: ModuleType) -> ModuleSafetyConfig {
    let address = match module_type {
        ModuleType::Power => 0x02,
        ModuleType::Safety => 0x03,
        ModuleType::TravelMotor => 0x04,
        ModuleType::Dock => 0x06,
        ModuleType::Unknown => 0x06,
    };
    default_matrix()[&address]
}
