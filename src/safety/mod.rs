//! Safety monitor: critical-module detector and graduated response.
//!
//! [`SafetyMonitor`] is the sole mutator of per-module health assessments.
//! It performs its own independent bus read per module on that module's
//! `health_check_interval_ms`, separate from the scheduler's recipe
//! polling, and exposes assessments back to the scheduler through
//! [`crate::scheduler::HealthStatusSource`].

pub mod criticality;
pub mod estop;
pub mod led;

use std::collections::HashMap;
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::Mutex;
use rand::Rng;

use crate::clock::Clock;
use crate::health::{FailureAction, HealthStatus, ResponseLevel};
use crate::modbus::frame::{Request, Response};
use crate::registry::{ModuleRegistry, ModuleType};
use crate::scheduler::HealthStatusSource;
use crate::transport::ModbusTransport;
use criticality::{default_config_for, ModuleSafetyConfig};
use estop::{EstopLatch, EstopOutput};
use led::{pattern_for, LedEffects};

/// De-escalation hysteresis: a lower level must hold for this long before
/// the monitor commits to it.
const DEESCALATION_HYSTERESIS_MS: u64 = 5_000;

/// Safety register map for the Safety module type.
mod safety_registers {
    pub const STATUS: u16 = 0x0000;
    pub const ESTOP_FLAG: u16 = 0x0001;
    pub const DISTANCE_START: u16 = 0x0010;
    pub const DIGITAL_INPUTS: u16 = 0x0020;
    pub const ERROR_CODES: u16 = 0x0005;
}

#[derive(Debug, Clone)]
pub struct ModuleAssessment {
    pub health_status: HealthStatus,
    pub response_level: ResponseLevel,
    pub offline_since_ms: u64,
    pub safety_action_triggered: bool,
    pub consecutive_failures: u32,
    pub last_seen_ms: u64,
    pub last_poll_ms: u64,
    pub total_recoveries: u64,
    pub response_time_ms: u64,
    pub success_count: u64,
    pub attempt_count: u64,
    pub level_since_ms: u64,
    pub pending_level: Option<(ResponseLevel, u64)>,
    pub estop_deadline_ms: Option<u64>,
}

impl ModuleAssessment {
    fn new(now_ms: u64) -> Self {
        Self {
            health_status: HealthStatus::Unknown,
            response_level: ResponseLevel::Normal,
            offline_since_ms: 0,
            safety_action_triggered: false,
            consecutive_failures: 0,
            last_seen_ms: now_ms,
            last_poll_ms: 0,
            total_recoveries: 0,
            response_time_ms: 0,
            success_count: 0,
            attempt_count: 0,
            level_since_ms: now_ms,
            pending_level: None,
            estop_deadline_ms: None,
        }
    }

    fn success_rate(&self) -> f64 {
        if self.attempt_count == 0 {
            1.0
        } else {
            self.success_count as f64 / self.attempt_count as f64
        }
    }
}

pub struct SafetyMonitor {
    transport: Arc<ModbusTransport>,
    registry: Arc<ModuleRegistry>,
    clock: Arc<dyn Clock>,
    estop: Arc<EstopLatch<Box<dyn EstopOutput>>>,
    led_effects: Arc<dyn LedEffects>,
    configs: Mutex<HashMap<u8, ModuleSafetyConfig>>,
    assessments: Mutex<HashMap<u8, ModuleAssessment>>,
    last_led_level: Mutex<Option<ResponseLevel>>,
    system_level: Mutex<ResponseLevel>,
    jitter_percent: Mutex<u8>,
}

impl SafetyMonitor {
    pub fn new(
        transport: Arc<ModbusTransport>,
        registry: Arc<ModuleRegistry>,
        clock: Arc<dyn Clock>,
        estop_output: Box<dyn EstopOutput>,
        led_effects: Arc<dyn LedEffects>,
    ) -> Self {
        Self {
            transport,
            registry,
            clock,
            estop: Arc::new(EstopLatch::new(estop_output)),
            led_effects,
            configs: Mutex::new(criticality::default_matrix()),
            assessments: Mutex::new(HashMap::new()),
            last_led_level: Mutex::new(None),
            system_level: Mutex::new(ResponseLevel::Normal),
            jitter_percent: Mutex::new(10),
        }
    }

    pub fn apply_config(&self, address: u8, config: ModuleSafetyConfig) {
        self.configs.lock().insert(address, config);
    }

    /// Set the `±jitter_percent` applied to every module's health-check
    /// cadence, capped at 50%.
    pub fn set_jitter_percent(&self, jitter_percent: u8) {
        *self.jitter_percent.lock() = jitter_percent.min(50);
    }

    pub fn system_response_level(&self) -> ResponseLevel {
        *self.system_level.lock()
    }

    pub fn is_emergency(&self) -> bool {
        self.estop.is_latched()
    }

    pub fn assessment(&self, address: u8) -> Option<ModuleAssessment> {
        self.assessments.lock().get(&address).cloned()
    }

    fn config_for(&self, address: u8, module_type: ModuleType) -> ModuleSafetyConfig {
        self.configs
            .lock()
            .get(&address)
            .copied()
            .unwrap_or_else(|| default_config_for(module_type))
    }

    /// Per-module assessment, driven on each module's own
    /// `health_check_interval_ms`. Call at ≥10 Hz; modules not yet due
    /// are skipped.
    pub fn tick(&self) {
        let now_ms = self.clock.now_ms();
        self.check_delayed_estops(now_ms);
        for module in self.registry.snapshot() {
            let config = self.config_for(module.address, module.module_type);
            let effective_interval = self.jittered_interval(config.health_check_interval_ms);
            let due = {
                let mut assessments = self.assessments.lock();
                let entry = assessments
                    .entry(module.address)
                    .or_insert_with(|| ModuleAssessment::new(now_ms));
                entry.attempt_count == 0 || now_ms.saturating_sub(entry.last_poll_ms) >= effective_interval
            };
            if due {
                self.assess_module(module.address, module.module_type, &config, now_ms);
            }
        }
        self.recompute_system_level();
        self.drive_led_effects();
    }

    /// Apply `±jitter_percent` to a base interval so every module's health
    /// check doesn't land on the bus in lockstep with the others.
    fn jittered_interval(&self, base_ms: u64) -> u64 {
        let pct = *self.jitter_percent.lock() as i64;
        let spread = base_ms as i64 * pct / 100;
        if spread <= 0 {
            return base_ms;
        }
        let jitter = rand::rng().random_range(-spread..=spread);
        (base_ms as i64 + jitter).max(0) as u64
    }

    fn assess_module(&self, address: u8, module_type: ModuleType, config: &ModuleSafetyConfig, now_ms: u64) {
        let outcome = if module_type == ModuleType::Safety {
            self.read_safety_registers(address)
        } else {
            self.read_liveness(address)
        };

        // Mutate the assessment inside its own scope so the lock is
        // released before `execute_failure_action` runs (it may itself
        // need other locks, e.g. the E-Stop latch).
        let pending_action = {
            let mut assessments = self.assessments.lock();
            let assessment = assessments
                .entry(address)
                .or_insert_with(|| ModuleAssessment::new(now_ms));
            assessment.last_poll_ms = now_ms;
            assessment.attempt_count += 1;

            match outcome {
                Ok((health_status, response_level, response_time_ms)) => {
                    assessment.success_count += 1;
                    assessment.response_time_ms = response_time_ms;
                    assessment.last_seen_ms = now_ms;

                    if assessment.offline_since_ms != 0 {
                        assessment.offline_since_ms = 0;
                        assessment.total_recoveries += 1;
                        assessment.safety_action_triggered = false;
                        assessment.estop_deadline_ms = None;
                        info!("module 0x{address:02x} recovered");
                    }
                    assessment.consecutive_failures = 0;

                    let mut level = response_level;
                    if response_time_ms > config.max_response_time_ms {
                        level = level.max(ResponseLevel::Monitoring);
                    }
                    if assessment.success_rate() < config.min_success_rate {
                        level = level.max(ResponseLevel::Monitoring);
                    }
                    assessment.health_status = health_status;
                    self.set_level(assessment, level.min(config.max_response_level), now_ms);
                    None
                }
                Err(_) => {
                    assessment.consecutive_failures += 1;

                    if assessment.offline_since_ms == 0
                        && now_ms.saturating_sub(assessment.last_seen_ms) >= config.offline_timeout_ms
                    {
                        assessment.offline_since_ms = now_ms;
                        assessment.health_status = HealthStatus::Offline;
                        self.set_level(assessment, ResponseLevel::Warning, now_ms);
                        warn!("module 0x{address:02x} went offline");
                    }

                    let crosses_failure_timeout = assessment.consecutive_failures
                        >= config.consecutive_failure_threshold
                        && now_ms.saturating_sub(assessment.last_seen_ms) >= config.failure_timeout_ms;

                    if crosses_failure_timeout && !assessment.safety_action_triggered {
                        assessment.safety_action_triggered = true;
                        Some(config.failure_action)
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(action) = pending_action {
            self.execute_failure_action(address, action, now_ms);
        }
    }

    /// Fire any armed `DelayedEStop` countdowns that have elapsed. Checked
    /// every tick, independent of each module's own health-check cadence,
    /// so the 100 ms E-Stop deadline is honored even if a module's
    /// `health_check_interval_ms` is coarser.
    fn check_delayed_estops(&self, now_ms: u64) {
        let due: Vec<u8> = self
            .assessments
            .lock()
            .iter()
            .filter(|(_, a)| a.estop_deadline_ms.is_some_and(|deadline| now_ms >= deadline))
            .map(|(&address, _)| address)
            .collect();
        for address in due {
            if let Some(assessment) = self.assessments.lock().get_mut(&address) {
                assessment.estop_deadline_ms = None;
            }
            self.trigger_emergency(address);
        }
    }

    fn read_safety_registers(&self, address: u8) -> Result<(HealthStatus, ResponseLevel, u64), ()> {
        let started = self.clock.now_ms();
        let request = Request::ReadHoldingRegisters {
            slave_id: address,
            start: safety_registers::STATUS,
            qty: 1,
        };
        let status = match self.transport.execute(&request) {
            Ok(Response::Registers(values)) => values.first().copied().unwrap_or(0),
            _ => return Err(()),
        };
        let distances = match self.read_register_pair(address, safety_registers::DISTANCE_START) {
            Some(pair) => pair,
            None => return Err(()),
        };
        let _digital_inputs = self.read_register(address, safety_registers::DIGITAL_INPUTS);
        let _error_codes = self.read_register(address, safety_registers::ERROR_CODES);
        let _estop_flag = self.read_register(address, safety_registers::ESTOP_FLAG);

        if status > 4 {
            return Err(());
        }

        const MAX_SAFETY_DISTANCE_MM: u16 = 10_000;
        if distances.0 > MAX_SAFETY_DISTANCE_MM || distances.1 > MAX_SAFETY_DISTANCE_MM {
            return Err(());
        }

        let elapsed = self.clock.now_ms().saturating_sub(started);
        let (health, level) = match status {
            3 | 4 => (HealthStatus::Failed, ResponseLevel::Emergency),
            2 => (HealthStatus::Failing, ResponseLevel::Critical),
            1 => (HealthStatus::Degraded, ResponseLevel::Warning),
            _ => (HealthStatus::Healthy, ResponseLevel::Normal),
        };
        Ok((health, level, elapsed))
    }

    fn read_liveness(&self, address: u8) -> Result<(HealthStatus, ResponseLevel, u64), ()> {
        let started = self.clock.now_ms();
        let request = Request::ReadHoldingRegisters {
            slave_id: address,
            start: 0x0100,
            qty: 1,
        };
        match self.transport.execute(&request) {
            Ok(_) => {
                let elapsed = self.clock.now_ms().saturating_sub(started);
                Ok((HealthStatus::Healthy, ResponseLevel::Normal, elapsed))
            }
            Err(_) => Err(()),
        }
    }

    fn read_register(&self, address: u8, register: u16) -> Option<u16> {
        let request = Request::ReadHoldingRegisters { slave_id: address, start: register, qty: 1 };
        match self.transport.execute(&request) {
            Ok(Response::Registers(values)) => values.first().copied(),
            _ => None,
        }
    }

    fn read_register_pair(&self, address: u8, register: u16) -> Option<(u16, u16)> {
        let request = Request::ReadHoldingRegisters { slave_id: address, start: register, qty: 2 };
        match self.transport.execute(&request) {
            Ok(Response::Registers(values)) if values.len() == 2 => Some((values[0], values[1])),
            _ => None,
        }
    }

    /// Escalation commits immediately; de-escalation requires holding the
    /// lower level for `DEESCALATION_HYSTERESIS_MS`.
    fn set_level(&self, assessment: &mut ModuleAssessment, new_level: ResponseLevel, now_ms: u64) {
        if new_level >= assessment.response_level {
            if new_level != assessment.response_level {
                assessment.response_level = new_level;
                assessment.level_since_ms = now_ms;
            }
            assessment.pending_level = None;
            return;
        }
        match assessment.pending_level {
            Some((pending, since)) if pending == new_level => {
                if now_ms.saturating_sub(since) >= DEESCALATION_HYSTERESIS_MS {
                    assessment.response_level = new_level;
                    assessment.level_since_ms = now_ms;
                    assessment.pending_level = None;
                }
            }
            _ => {
                assessment.pending_level = Some((new_level, now_ms));
            }
        }
    }

    fn execute_failure_action(&self, address: u8, action: FailureAction, now_ms: u64) {
        match action {
            FailureAction::LogOnly => {
                info!("module 0x{address:02x} failure action: log only");
            }
            FailureAction::Warning | FailureAction::Degraded => {
                warn!("module 0x{address:02x} failure action: system warning");
            }
            FailureAction::DelayedEStop { delay_ms } => {
                warn!("module 0x{address:02x} arming delayed e-stop, firing in {delay_ms}ms unless it recovers first");
                let mut assessments = self.assessments.lock();
                let assessment = assessments
                    .entry(address)
                    .or_insert_with(|| ModuleAssessment::new(now_ms));
                assessment.estop_deadline_ms = Some(now_ms + delay_ms);
            }
            FailureAction::ImmediateEStop => {
                self.trigger_emergency(address);
            }
        }
    }

    fn trigger_emergency(&self, address: u8) {
        match self.estop.assert_estop() {
            Ok(true) => error!("E-Stop asserted due to module 0x{address:02x}"),
            Ok(false) => {}
            Err(fault) => error!("failed to assert E-Stop: {fault}"),
        }
    }

    /// System response level: max of every module's level, plus the
    /// documented overrides.
    fn recompute_system_level(&self) {
        let assessments = self.assessments.lock();
        let mut level = ResponseLevel::Normal;
        let mut critical_offline = 0u32;
        let mut failed = 0u32;
        let mut degraded = 0u32;

        for (address, assessment) in assessments.iter() {
            level = level.max(assessment.response_level);
            if assessment.health_status == HealthStatus::Offline {
                if let Some(config) = self.configs.lock().get(address) {
                    if matches!(config.criticality, crate::health::Criticality::SafetyCritical) {
                        critical_offline += 1;
                    }
                }
            }
            if assessment.health_status == HealthStatus::Failed {
                failed += 1;
            }
            if assessment.health_status == HealthStatus::Degraded {
                degraded += 1;
            }
        }
        drop(assessments);

        if critical_offline > 0 {
            level = level.max(ResponseLevel::Emergency);
        }
        if failed > 0 {
            level = level.max(ResponseLevel::Critical);
        }
        if degraded > 0 {
            level = level.max(ResponseLevel::Warning);
        }

        *self.system_level.lock() = level;
    }

    fn drive_led_effects(&self) {
        let level = *self.system_level.lock();
        let mut last = self.last_led_level.lock();
        if *last == Some(level) {
            return;
        }
        for (indicator, pattern) in pattern_for(level) {
            self.led_effects.set_led_pattern(indicator, pattern);
        }
        *last = Some(level);
    }
}

impl HealthStatusSource for SafetyMonitor {
    fn health_status(&self, address: u8) -> HealthStatus {
        self.assessments
            .lock()
            .get(&address)
            .map(|a| a.health_status)
            .unwrap_or(HealthStatus::Unknown)
    }

    fn success_rate(&self, address: u8) -> f64 {
        self.assessments
            .lock()
            .get(&address)
            .map(|a| a.success_rate())
            .unwrap_or(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::registry::ModuleType;
    use crate::transport::serial::{LoopbackAdapter, SerialConfig};
    use led::NullLedEffects;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingEstop {
        count: AtomicU32,
    }
    impl EstopOutput for CountingEstop {
        fn assert(&self) -> Result<(), crate::error::SafetyFault> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn deassert(&self) -> Result<(), crate::error::SafetyFault> {
            Ok(())
        }
    }

    fn silent_transport(clock: Arc<TestClock>) -> Arc<ModbusTransport> {
        let adapter = LoopbackAdapter::new(|_req| None); // never responds -> Timeout
        let transport = ModbusTransport::new(Box::new(adapter), clock);
        transport.open(SerialConfig::default()).unwrap();
        transport.apply_config(crate::transport::TransportConfig {
            timeout_ms: 10,
            retry_count: 0,
            retry_delay_ms: 1,
            crc_enabled: true,
            inter_frame_settle_ms: 0,
        });
        Arc::new(transport)
    }

    #[test]
    fn estop_latency_scenario() {
        let clock = TestClock::new();
        let transport = silent_transport(clock.clone());
        let registry = Arc::new(ModuleRegistry::new());
        registry.upsert_discovered(0x03, ModuleType::Safety, "v1".into(), 0);

        let monitor = SafetyMonitor::new(
            transport,
            registry,
            clock.clone(),
            Box::new(CountingEstop { count: AtomicU32::new(0) }),
            Arc::new(NullLedEffects),
        );
        monitor.apply_config(0x03, criticality::ModuleSafetyConfig {
            failure_timeout_ms: 0,
            consecutive_failure_threshold: 1,
            ..default_config_for(ModuleType::Safety)
        });

        monitor.tick();
        assert!(monitor.is_emergency());
    }

    #[test]
    fn delayed_estop_fires_after_deadline_elapses() {
        let clock = TestClock::new();
        let transport = silent_transport(clock.clone());
        let registry = Arc::new(ModuleRegistry::new());
        registry.upsert_discovered(0x02, ModuleType::Power, "v1".into(), 0);

        let monitor = SafetyMonitor::new(
            transport,
            registry,
            clock.clone(),
            Box::new(CountingEstop { count: AtomicU32::new(0) }),
            Arc::new(NullLedEffects),
        );
        monitor.apply_config(0x02, criticality::ModuleSafetyConfig {
            offline_timeout_ms: 0,
            failure_timeout_ms: 0,
            health_check_interval_ms: 0,
            consecutive_failure_threshold: 1,
            failure_action: FailureAction::DelayedEStop { delay_ms: 300 },
            ..default_config_for(ModuleType::Power)
        });

        clock.advance(1);
        monitor.tick();
        assert!(!monitor.is_emergency(), "countdown just armed, must not fire immediately");

        clock.advance(299);
        monitor.tick();
        assert!(!monitor.is_emergency(), "deadline not yet reached");

        clock.advance(1);
        monitor.tick();
        assert!(monitor.is_emergency(), "deadline elapsed, E-Stop must fire");
    }

    #[test]
    fn delayed_estop_cancelled_by_recovery_before_deadline() {
        let clock = TestClock::new();
        let responding = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = responding.clone();
        let adapter = LoopbackAdapter::new(move |req| {
            if !flag.load(Ordering::SeqCst) {
                return None;
            }
            let slave = req[0];
            let mut resp = vec![slave, 0x03, 0x02, 0x00, 0x00];
            let crc = crate::modbus::crc::crc16(&resp);
            let [lo, hi] = crate::modbus::crc::to_bytes(crc);
            resp.push(lo);
            resp.push(hi);
            Some(resp)
        });
        let transport = ModbusTransport::new(Box::new(adapter), clock.clone());
        transport.open(SerialConfig::default()).unwrap();
        transport.apply_config(crate::transport::TransportConfig {
            timeout_ms: 10,
            retry_count: 0,
            retry_delay_ms: 1,
            crc_enabled: true,
            inter_frame_settle_ms: 0,
        });
        let transport = Arc::new(transport);
        let registry = Arc::new(ModuleRegistry::new());
        registry.upsert_discovered(0x02, ModuleType::Power, "v1".into(), 0);

        let monitor = SafetyMonitor::new(
            transport,
            registry,
            clock.clone(),
            Box::new(CountingEstop { count: AtomicU32::new(0) }),
            Arc::new(NullLedEffects),
        );
        monitor.apply_config(0x02, criticality::ModuleSafetyConfig {
            offline_timeout_ms: 0,
            failure_timeout_ms: 0,
            health_check_interval_ms: 0,
            consecutive_failure_threshold: 1,
            failure_action: FailureAction::DelayedEStop { delay_ms: 300 },
            ..default_config_for(ModuleType::Power)
        });

        clock.advance(1);
        monitor.tick();
        assert!(!monitor.is_emergency());
        assert!(monitor.assessment(0x02).unwrap().estop_deadline_ms.is_some());

        // Recover on a tick that lands before the deadline.
        responding.store(true, Ordering::SeqCst);
        clock.advance(100);
        monitor.tick();
        assert!(monitor.assessment(0x02).unwrap().estop_deadline_ms.is_none());

        // Deadline would have elapsed by now had it not been cancelled.
        clock.advance(250);
        monitor.tick();
        assert!(!monitor.is_emergency(), "recovery before deadline must cancel the countdown");
    }
}
