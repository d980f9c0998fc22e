//! Per-type poll recipes.
//!
//! Each recipe is a fixed list of register groups to read in program order;
//! a group's own interval governs how often it is due, independent of the
//! others (Power splits into high/medium/low priority bands with distinct
//! cadences). Register ranges here are the authoritative wire contract.

use crate::registry::ModuleType;

#[derive(Debug, Clone, Copy)]
pub struct RegisterGroup {
    pub start: u16,
    pub count: u16,
    pub interval_ms: u64,
    pub label: &'static str,
}

/// Fixed recipe for one module type. `base_interval_ms` is the criticality
/// matrix's base interval, used for adaptive-interval scaling; `groups`
/// are read independently at their own cadence.
pub struct Recipe {
    pub base_interval_ms: u64,
    pub groups: &'static [RegisterGroup],
    pub success_threshold: f64,
}

const POWER_GROUPS: &[RegisterGroup] = &[
    RegisterGroup { start: 0x0000, count: 11, interval_ms: 1_000, label: "battery_main" },
    RegisterGroup { start: 0x0014, count: 6, interval_ms: 1_000, label: "cell_voltages" },
    RegisterGroup { start: 0x0040, count: 1, interval_ms: 1_000, label: "rail_12v" },
    RegisterGroup { start: 0x0043, count: 1, interval_ms: 1_000, label: "rail_5v" },
    RegisterGroup { start: 0x0046, count: 1, interval_ms: 1_000, label: "rail_3v3" },
    RegisterGroup { start: 0x0049, count: 4, interval_ms: 1_000, label: "relay_states" },
    RegisterGroup { start: 0x0030, count: 8, interval_ms: 5_000, label: "charger" },
    RegisterGroup { start: 0x0041, count: 2, interval_ms: 5_000, label: "rail_12v_io" },
    RegisterGroup { start: 0x0044, count: 2, interval_ms: 5_000, label: "rail_5v_io" },
    RegisterGroup { start: 0x0047, count: 2, interval_ms: 5_000, label: "rail_3v3_io" },
    RegisterGroup { start: 0x001C, count: 6, interval_ms: 5_000, label: "cell_balancing" },
    RegisterGroup { start: 0x0100, count: 8, interval_ms: 30_000, label: "system_identity" },
    RegisterGroup { start: 0x004D, count: 1, interval_ms: 30_000, label: "config_a" },
    RegisterGroup { start: 0x003E, count: 1, interval_ms: 30_000, label: "config_b" },
];

const TRAVEL_MOTOR_GROUPS: &[RegisterGroup] = &[
    RegisterGroup { start: 0x0100, count: 8, interval_ms: 1_000, label: "system_block" },
    RegisterGroup { start: 0x0000, count: 16, interval_ms: 1_000, label: "motor_control" },
    RegisterGroup { start: 0x0010, count: 16, interval_ms: 1_000, label: "motor_status" },
];

const SAFETY_GROUPS: &[RegisterGroup] = &[
    RegisterGroup { start: 0x0100, count: 8, interval_ms: 500, label: "system_block" },
    RegisterGroup { start: 0x0000, count: 8, interval_ms: 500, label: "safety_block" },
];

// Dock's overall recipe base is 5000 ms, but the real-time sensor blocks
// (RFID, accelerometer, proximity) poll at 50 ms; dock-state and system
// identity follow the 5000 ms base.
const DOCK_GROUPS: &[RegisterGroup] = &[
    RegisterGroup { start: 0x0100, count: 8, interval_ms: 5_000, label: "system_block" },
    RegisterGroup { start: 0x0108, count: 5, interval_ms: 50, label: "rfid" },
    RegisterGroup { start: 0x010D, count: 5, interval_ms: 50, label: "accelerometer" },
    RegisterGroup { start: 0x0112, count: 5, interval_ms: 50, label: "proximity" },
    RegisterGroup { start: 0x0104, count: 4, interval_ms: 5_000, label: "dock_state" },
];

const UNKNOWN_GROUPS: &[RegisterGroup] = &[
    RegisterGroup { start: 0x0100, count: 2, interval_ms: 5_000, label: "minimal" },
];

pub fn recipe_for(module_type: ModuleType) -> Recipe {
    match module_type {
        ModuleType::Power => Recipe {
            base_interval_ms: 1_000,
            groups: POWER_GROUPS,
            success_threshold: 0.70,
        },
        ModuleType::TravelMotor => Recipe {
            base_interval_ms: 1_000,
            groups: TRAVEL_MOTOR_GROUPS,
            success_threshold: 1.0,
        },
        ModuleType::Safety => Recipe {
            base_interval_ms: 500,
            groups: SAFETY_GROUPS,
            success_threshold: 1.0,
        },
        ModuleType::Dock => Recipe {
            base_interval_ms: 5_000,
            groups: DOCK_GROUPS,
            success_threshold: 1.0,
        },
        ModuleType::Unknown => Recipe {
            base_interval_ms: 5_000,
            groups: UNKNOWN_GROUPS,
            success_threshold: 1.0,
        },
    }
}

/// Response-time threshold past which additional interval scaling applies
/// (only Safety and TravelMotor have a distinct threshold; everything else
/// uses a generic default).
pub fn response_time_threshold_ms(module_type: ModuleType) -> u64 {
    match module_type {
        ModuleType::Safety => 2,
        ModuleType::TravelMotor => 5,
        _ => 10,
    }
}
