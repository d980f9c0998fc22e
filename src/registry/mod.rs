//! Module registry.
//!
//! The Registry is the sole mutator of Module Records; every other
//! component holds only an address and reads snapshots through
//! [`ModuleRegistry::get`]/[`ModuleRegistry::snapshot`].

pub mod discovery;
pub mod persistence;

use std::collections::HashMap;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleType {
    Power,
    Safety,
    TravelMotor,
    Dock,
    Unknown,
}

impl ModuleType {
    /// Fallback mapping used when the Module Type register reads `0x0000`
    /// or is unreadable.
    pub fn from_address(address: u8) -> Self {
        match address {
            0x02 => ModuleType::Power,
            0x03 => ModuleType::Safety,
            0x04 => ModuleType::TravelMotor,
            0x05 => ModuleType::Dock,
            _ => ModuleType::Unknown,
        }
    }

    /// Module Type register value mapping (`0x0002..0x0005`).
    pub fn from_register(value: u16) -> Option<Self> {
        match value {
            0x0002 => Some(ModuleType::Power),
            0x0003 => Some(ModuleType::Safety),
            0x0004 => Some(ModuleType::TravelMotor),
            0x0005 => Some(ModuleType::Dock),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleType::Power => "Power",
            ModuleType::Safety => "Safety",
            ModuleType::TravelMotor => "TravelMotor",
            ModuleType::Dock => "Dock",
            ModuleType::Unknown => "Unknown",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "Power" => ModuleType::Power,
            "Safety" => ModuleType::Safety,
            "TravelMotor" => ModuleType::TravelMotor,
            "Dock" => ModuleType::Dock,
            _ => ModuleType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Unknown,
    Offline,
    Online,
    Warning,
    Error,
    Maintenance,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleStatus::Unknown => "Unknown",
            ModuleStatus::Offline => "Offline",
            ModuleStatus::Online => "Online",
            ModuleStatus::Warning => "Warning",
            ModuleStatus::Error => "Error",
            ModuleStatus::Maintenance => "Maintenance",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "Offline" => ModuleStatus::Offline,
            "Online" => ModuleStatus::Online,
            "Warning" => ModuleStatus::Warning,
            "Error" => ModuleStatus::Error,
            "Maintenance" => ModuleStatus::Maintenance,
            _ => ModuleStatus::Unknown,
        }
    }
}

/// Display health bucket derived from a module's health percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
    Failed,
}

impl HealthLevel {
    pub fn from_pct(pct: u8) -> Self {
        match pct {
            90..=100 => HealthLevel::Excellent,
            80..=89 => HealthLevel::Good,
            60..=79 => HealthLevel::Fair,
            40..=59 => HealthLevel::Poor,
            20..=39 => HealthLevel::Critical,
            _ => HealthLevel::Failed,
        }
    }
}

/// The authoritative entity held by the Registry.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub address: u8,
    pub module_type: ModuleType,
    pub version: String,
    pub status: ModuleStatus,
    pub health_pct: u8,
    pub last_seen_ms: u64,
    pub error_count: u64,
    pub timeout_count: u64,
    pub consecutive_failures: u32,
    pub response_time_ms: f64,
}

impl ModuleRecord {
    pub fn new(address: u8, module_type: ModuleType, version: String, now_ms: u64) -> Self {
        Self {
            address,
            module_type,
            version,
            status: ModuleStatus::Online,
            health_pct: 100,
            last_seen_ms: now_ms,
            error_count: 0,
            timeout_count: 0,
            consecutive_failures: 0,
            response_time_ms: 0.0,
        }
    }

    pub fn health_level(&self) -> HealthLevel {
        HealthLevel::from_pct(self.health_pct)
    }
}

/// Tagged lifecycle events the Registry delivers to its single observer
/// slot.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEventKind {
    Discovered,
    Registered,
    Online,
    Offline,
    Error,
    Warning,
    HealthChange,
    ConfigChange,
    Updated,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub kind: RegistryEventKind,
    pub address: u8,
    pub payload: Option<String>,
}

/// Observer callback. All mutations are serialized and callbacks are
/// invoked without the lock held; a panic inside a callback is caught
/// and logged by the emitter without aborting the emitter.
pub trait RegistryObserver: Send + Sync {
    fn on_event(&self, event: RegistryEvent);
}

struct NullObserver;
impl RegistryObserver for NullObserver {
    fn on_event(&self, _event: RegistryEvent) {}
}

pub struct ModuleRegistry {
    records: Mutex<HashMap<u8, ModuleRecord>>,
    observer: Mutex<Box<dyn RegistryObserver>>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            observer: Mutex::new(Box::new(NullObserver)),
        }
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_observer(&self, observer: Box<dyn RegistryObserver>) {
        *self.observer.lock() = observer;
    }

    fn emit(&self, kind: RegistryEventKind, address: u8, payload: Option<String>) {
        let observer = self.observer.lock();
        let event = RegistryEvent { kind, address, payload };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            observer.on_event(event);
        }));
        if result.is_err() {
            log::error!("registry observer callback panicked; continuing");
        }
    }

    pub fn get(&self, address: u8) -> Option<ModuleRecord> {
        self.records.lock().get(&address).cloned()
    }

    pub fn snapshot(&self) -> Vec<ModuleRecord> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        records.sort_by_key(|r| r.address);
        records
    }

    pub fn contains(&self, address: u8) -> bool {
        self.records.lock().contains_key(&address)
    }

    /// Insert or update in place: registering an already-known address
    /// updates the record rather than replacing it, preserving counters.
    pub fn upsert_discovered(
        &self,
        address: u8,
        module_type: ModuleType,
        version: String,
        now_ms: u64,
    ) {
        let is_new = {
            let mut records = self.records.lock();
            match records.get_mut(&address) {
                Some(existing) => {
                    existing.module_type = module_type;
                    if !version.is_empty() {
                        existing.version = version;
                    }
                    existing.status = ModuleStatus::Online;
                    existing.last_seen_ms = now_ms;
                    existing.consecutive_failures = 0;
                    false
                }
                None => {
                    records.insert(address, ModuleRecord::new(address, module_type, version, now_ms));
                    true
                }
            }
        };
        if is_new {
            self.emit(RegistryEventKind::Discovered, address, None);
        } else {
            self.emit(RegistryEventKind::Updated, address, None);
        }
    }

    pub fn unregister(&self, address: u8) {
        self.records.lock().remove(&address);
        self.emit(RegistryEventKind::Updated, address, Some("unregistered".into()));
    }

    /// Record a failed health check / poll attempt for a known module.
    pub fn record_failure(&self, address: u8) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&address) {
            record.error_count += 1;
            record.consecutive_failures += 1;
            record.status = ModuleStatus::Error;
        }
        drop(records);
        self.emit(RegistryEventKind::Error, address, None);
    }

    pub fn record_timeout(&self, address: u8) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&address) {
            record.timeout_count += 1;
            record.consecutive_failures += 1;
        }
        drop(records);
        self.emit(RegistryEventKind::Timeout, address, None);
    }

    /// Update health after a probe and apply the derivation formula
    /// `max(0, 100 − response_time_ms/1000 − error_count·10)`. The integer
    /// division here is preserved verbatim (see DESIGN.md).
    pub fn update_health(&self, address: u8, response_time_ms: u64, now_ms: u64) {
        let mut changed = false;
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&address) {
            let penalty = (response_time_ms / 1000) as i64 + (record.error_count as i64) * 10;
            let new_pct = (100 - penalty).clamp(0, 100) as u8;
            changed = new_pct != record.health_pct;
            record.health_pct = new_pct;
            record.response_time_ms = response_time_ms as f64;
            record.last_seen_ms = now_ms;
            record.consecutive_failures = 0;
            record.status = ModuleStatus::Online;
        }
        drop(records);
        if changed {
            self.emit(RegistryEventKind::HealthChange, address, None);
        }
    }

    /// Background offline-detection pass. Transitions `Online → Offline`
    /// once `now − last_seen_ms` exceeds `offline_threshold_ms`.
    pub fn check_offline(&self, now_ms: u64, offline_threshold_ms: u64) {
        let mut newly_offline = Vec::new();
        {
            let mut records = self.records.lock();
            for record in records.values_mut() {
                if record.status == ModuleStatus::Online
                    && now_ms.saturating_sub(record.last_seen_ms) >= offline_threshold_ms
                {
                    record.status = ModuleStatus::Offline;
                    record.health_pct = 0;
                    newly_offline.push(record.address);
                }
            }
        }
        for address in newly_offline {
            self.emit(RegistryEventKind::Offline, address, None);
        }
    }

    /// Mark `address` offline directly — used by scan-driven debounce
    /// once ≥ N_miss consecutive misses have accumulated.
    pub fn mark_offline(&self, address: u8) {
        let mut records = self.records.lock();
        if let Some(record) = records.get_mut(&address) {
            if record.status != ModuleStatus::Offline {
                record.status = ModuleStatus::Offline;
                record.health_pct = 0;
                drop(records);
                self.emit(RegistryEventKind::Offline, address, None);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    struct CollectingObserver {
        events: Arc<StdMutex<Vec<RegistryEvent>>>,
    }
    impl RegistryObserver for CollectingObserver {
        fn on_event(&self, event: RegistryEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn discovery_emits_discovered_then_updated() {
        let registry = ModuleRegistry::new();
        let events = Arc::new(StdMutex::new(Vec::new()));
        registry.set_observer(Box::new(CollectingObserver { events: events.clone() }));

        registry.upsert_discovered(0x02, ModuleType::Power, "v1.0.0".into(), 0);
        registry.upsert_discovered(0x02, ModuleType::Power, String::new(), 10);

        let kinds: Vec<_> = events.lock().unwrap().iter().map(|e| e.kind.clone()).collect();
        assert_eq!(kinds, vec![RegistryEventKind::Discovered, RegistryEventKind::Updated]);
        let record = registry.get(0x02).unwrap();
        assert_eq!(record.version, "v1.0.0");
        assert_eq!(record.status, ModuleStatus::Online);
    }

    #[test]
    fn health_formula_matches_spec() {
        let registry = ModuleRegistry::new();
        registry.upsert_discovered(0x02, ModuleType::Power, "v1.0.0".into(), 0);
        registry.update_health(0x02, 2500, 100);
        // penalty = 2500/1000 (integer) = 2, error_count=0 => 98
        assert_eq!(registry.get(0x02).unwrap().health_pct, 98);
    }

    #[test]
    fn offline_transition_after_threshold() {
        let registry = ModuleRegistry::new();
        registry.upsert_discovered(0x02, ModuleType::Power, "v1.0.0".into(), 0);
        registry.check_offline(29_000, 30_000);
        assert_eq!(registry.get(0x02).unwrap().status, ModuleStatus::Online);
        registry.check_offline(30_000, 30_000);
        assert_eq!(registry.get(0x02).unwrap().status, ModuleStatus::Offline);
    }
}
