//! Adaptive polling scheduler.
//!
//! Drives one [`recipes::Recipe`] per online module, scaling each register
//! group's interval by the module's current [`HealthStatus`] and clamping
//! to a per-address range, then coalesces successful reads into telemetry
//! batches flushed at most every 500 ms.

pub mod recipes;

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::clock::Clock;
use crate::health::HealthStatus;
use crate::modbus::frame::{Request, Response};
use crate::registry::{ModuleRecord, ModuleRegistry, ModuleType};
use crate::transport::ModbusTransport;
use recipes::{recipe_for, response_time_threshold_ms, RegisterGroup};

/// Supplies the scheduler with the safety monitor's current per-module
/// health assessment. Implemented by `safety::SafetyMonitor`; the
/// dependency runs scheduler → safety only.
pub trait HealthStatusSource: Send + Sync {
    fn health_status(&self, address: u8) -> HealthStatus;
    fn success_rate(&self, address: u8) -> f64;
}

/// Default source used when no safety monitor is wired in: every module is
/// treated as `Healthy` and fully reliable.
pub struct AlwaysHealthy;
impl HealthStatusSource for AlwaysHealthy {
    fn health_status(&self, _address: u8) -> HealthStatus {
        HealthStatus::Healthy
    }
    fn success_rate(&self, _address: u8) -> f64 {
        1.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryEvent {
    pub event: String,
    pub data: serde_json::Value,
}

/// Write-only batch sink. Implementations are expected to serialize the
/// `{"type":"batch","events":[...]}` envelope themselves; this trait only
/// hands over the events collected since the last flush.
pub trait TelemetrySink: Send + Sync {
    fn emit_batch(&self, events: Vec<TelemetryEvent>);
}

pub struct NullTelemetrySink;
impl TelemetrySink for NullTelemetrySink {
    fn emit_batch(&self, _events: Vec<TelemetryEvent>) {}
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    pub offline_probe_interval_ms: u64,
    pub telemetry_debounce_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 20,
            max_interval_ms: 60_000,
            offline_probe_interval_ms: 10_000,
            telemetry_debounce_ms: 500,
        }
    }
}

#[derive(Default)]
struct ModuleScheduleState {
    last_poll_ms: HashMap<&'static str, u64>,
    attempts: u64,
    successes: u64,
}

pub struct PollingScheduler {
    transport: Arc<ModbusTransport>,
    registry: Arc<ModuleRegistry>,
    health_source: Arc<dyn HealthStatusSource>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn TelemetrySink>,
    config: Mutex<SchedulerConfig>,
    state: Mutex<HashMap<u8, ModuleScheduleState>>,
    telemetry_buffer: Mutex<Vec<TelemetryEvent>>,
    last_flush_ms: Mutex<u64>,
}

impl PollingScheduler {
    pub fn new(
        transport: Arc<ModbusTransport>,
        registry: Arc<ModuleRegistry>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            transport,
            registry,
            health_source: Arc::new(AlwaysHealthy),
            clock,
            sink,
            config: Mutex::new(SchedulerConfig::default()),
            state: Mutex::new(HashMap::new()),
            telemetry_buffer: Mutex::new(Vec::new()),
            last_flush_ms: Mutex::new(0),
        }
    }

    pub fn set_health_source(&mut self, source: Arc<dyn HealthStatusSource>) {
        self.health_source = source;
    }

    pub fn apply_config(&self, config: SchedulerConfig) {
        *self.config.lock() = config;
    }

    /// Run one scheduling pass. Returns immediately without issuing bus
    /// traffic unless `system_idle` is true.
    pub fn tick(&self, system_idle: bool) {
        if !system_idle {
            return;
        }
        let now_ms = self.clock.now_ms();
        for module in self.registry.snapshot() {
            if module.status != crate::registry::ModuleStatus::Online {
                continue;
            }
            self.poll_module(&module, now_ms);
        }
        self.maybe_flush_telemetry(now_ms);
    }

    fn poll_module(&self, module: &ModuleRecord, now_ms: u64) {
        let recipe = recipe_for(module.module_type);
        let health = self.health_source.health_status(module.address);
        let success_rate = self.health_source.success_rate(module.address);
        let config = *self.config.lock();

        let mut attempted = 0u32;
        let mut succeeded = 0u32;

        for group in recipe.groups {
            let interval = self.adaptive_interval(
                group.interval_ms,
                health,
                success_rate,
                module.response_time_ms as u64,
                module.module_type,
                &config,
            );
            let due = {
                let mut state = self.state.lock();
                let entry = state.entry(module.address).or_default();
                let last = entry.last_poll_ms.get(group.label).copied().unwrap_or(0);
                now_ms.saturating_sub(last) >= interval
            };
            if !due {
                continue;
            }

            attempted += 1;
            let started = self.clock.now_ms();
            match self.smart_read(module.address, group) {
                Ok(values) => {
                    succeeded += 1;
                    let elapsed = self.clock.now_ms().saturating_sub(started);
                    self.registry.update_health(module.address, elapsed, now_ms);
                    self.buffer_telemetry(module, group, &values);
                }
                Err(err) => {
                    debug!(
                        "poll group {} for 0x{:02x} failed: {err}",
                        group.label, module.address
                    );
                    if matches!(err, crate::error::TransportError::Timeout) {
                        self.registry.record_timeout(module.address);
                    } else {
                        self.registry.record_failure(module.address);
                    }
                }
            }

            let mut state = self.state.lock();
            let entry = state.entry(module.address).or_default();
            entry.last_poll_ms.insert(group.label, now_ms);
            entry.attempts += 1;
            if attempted > 0 && succeeded == attempted {
                entry.successes += 1;
            }
        }

        if attempted > 0 {
            let rate = succeeded as f64 / attempted as f64;
            if rate < recipe.success_threshold {
                warn!(
                    "module 0x{:02x} recipe success rate {rate:.2} below threshold {:.2}",
                    module.address, recipe.success_threshold
                );
            }
        }
    }

    /// Retry-wrapped register-group read: up to 3 attempts at 100 ms
    /// spacing, with an all-zero sanity filter that triggers a retry but
    /// is accepted on the final attempt.
    fn smart_read(&self, address: u8, group: &RegisterGroup) -> Result<Vec<u16>, crate::error::TransportError> {
        let request = Request::ReadHoldingRegisters {
            slave_id: address,
            start: group.start,
            qty: group.count,
        };
        let mut last_err = None;
        for attempt in 0..3 {
            match self.transport.execute(&request) {
                Ok(Response::Registers(values)) => {
                    let all_zero = values.iter().all(|&v| v == 0);
                    if !all_zero || attempt == 2 {
                        return Ok(values);
                    }
                }
                Ok(_) => return Err(crate::error::TransportError::FrameError(
                    "unexpected response shape".into(),
                )),
                Err(err) => {
                    last_err = Some(err);
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        Err(last_err.unwrap_or(crate::error::TransportError::Timeout))
    }

    fn adaptive_interval(
        &self,
        base_ms: u64,
        health: HealthStatus,
        success_rate: f64,
        response_time_ms: u64,
        module_type: ModuleType,
        config: &SchedulerConfig,
    ) -> u64 {
        if health == HealthStatus::Offline {
            return config.offline_probe_interval_ms;
        }
        let mut interval = base_ms as f64 * health.interval_multiplier();

        let threshold = response_time_threshold_ms(module_type);
        if response_time_ms > threshold {
            interval *= 0.75;
        }
        if success_rate < 0.95 {
            interval *= 0.75;
        }

        (interval as u64).clamp(config.min_interval_ms, config.max_interval_ms)
    }

    fn buffer_telemetry(&self, module: &ModuleRecord, group: &RegisterGroup, values: &[u16]) {
        let data = serde_json::json!({
            "address": module.address,
            "module_type": module.module_type.as_str(),
            "group": group.label,
            "values": values,
        });
        self.telemetry_buffer.lock().push(TelemetryEvent {
            event: "poll_group".to_string(),
            data,
        });
    }

    fn maybe_flush_telemetry(&self, now_ms: u64) {
        let config = *self.config.lock();
        let mut last_flush = self.last_flush_ms.lock();
        if now_ms.saturating_sub(*last_flush) < config.telemetry_debounce_ms {
            return;
        }
        let mut buffer = self.telemetry_buffer.lock();
        if buffer.is_empty() {
            return;
        }
        let events = std::mem::take(&mut *buffer);
        drop(buffer);
        *last_flush = now_ms;
        drop(last_flush);
        self.sink.emit_batch(events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::registry::ModuleType;
    use crate::transport::serial::LoopbackAdapter;
    use std::sync::Mutex as StdMutex;

    struct CollectingSink {
        batches: Arc<StdMutex<Vec<Vec<TelemetryEvent>>>>,
    }
    impl TelemetrySink for CollectingSink {
        fn emit_batch(&self, events: Vec<TelemetryEvent>) {
            self.batches.lock().unwrap().push(events);
        }
    }

    fn scripted_transport(clock: Arc<TestClock>) -> Arc<ModbusTransport> {
        let adapter = LoopbackAdapter::new(|req| {
            let slave = req[0];
            let mut resp = vec![slave, 0x03, 0x02, 0x00, 0x07];
            let crc = crate::modbus::crc::crc16(&resp);
            let [lo, hi] = crate::modbus::crc::to_bytes(crc);
            resp.push(lo);
            resp.push(hi);
            Some(resp)
        });
        let transport = ModbusTransport::new(Box::new(adapter), clock);
        transport.open(crate::transport::serial::SerialConfig::default()).unwrap();
        Arc::new(transport)
    }

    #[test]
    fn gate_blocks_when_not_idle() {
        let clock = TestClock::new();
        let transport = scripted_transport(clock.clone());
        let registry = Arc::new(ModuleRegistry::new());
        registry.upsert_discovered(0x04, ModuleType::Unknown, "v1".into(), 0);
        let batches = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(CollectingSink { batches: batches.clone() });
        let scheduler = PollingScheduler::new(transport, registry, clock.clone(), sink);

        scheduler.tick(false);
        clock.advance(1_000);
        scheduler.tick(false);
        assert!(batches.lock().unwrap().is_empty());
    }

    #[test]
    fn tick_polls_due_groups_and_buffers_telemetry() {
        let clock = TestClock::new();
        let transport = scripted_transport(clock.clone());
        let registry = Arc::new(ModuleRegistry::new());
        registry.upsert_discovered(0x04, ModuleType::Unknown, "v1".into(), 0);
        let batches = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::new(CollectingSink { batches: batches.clone() });
        let scheduler = PollingScheduler::new(transport, registry, clock.clone(), sink);

        scheduler.tick(true);
        clock.advance(600);
        scheduler.tick(true);
        assert!(!batches.lock().unwrap().is_empty());
    }
}
