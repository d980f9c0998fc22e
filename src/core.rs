//! Facade wiring the four subsystems together. [`MasterCore`] owns one
//! [`ModbusTransport`], one [`ModuleRegistry`], one [`PollingScheduler`],
//! and one [`SafetyMonitor`], and exposes the external-interface surface
//! (scan control, status snapshots, persistence, configuration).

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::info;
use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::error::TransportError;
use crate::registry::{ModuleRegistry, ModuleRecord};
use crate::safety::estop::EstopOutput;
use crate::safety::led::LedEffects;
use crate::safety::{ModuleAssessment, SafetyMonitor};
use crate::scheduler::{PollingScheduler, TelemetrySink};
use crate::transport::serial::{SerialAdapter, SerialConfig};
use crate::transport::stats::TransportStats;
use crate::transport::{circuit_breaker::CircuitBreakerConfig, ModbusTransport, TransportConfig};

/// External system-state gate. The core does not implement the state
/// machine itself — that lives with an external collaborator — but needs
/// somewhere to hold the current value the embedder reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Idle,
    Busy,
    Fault,
}

const DEFAULT_N_MISS: u32 = 2;

struct ScanMissTracker {
    misses: HashMap<u8, u32>,
    n_miss: u32,
}

pub struct MasterCore {
    transport: Arc<ModbusTransport>,
    registry: Arc<ModuleRegistry>,
    scheduler: Arc<PollingScheduler>,
    safety: Arc<SafetyMonitor>,
    clock: Arc<dyn Clock>,
    scan_token: Arc<CancelToken>,
    scan_miss: Mutex<ScanMissTracker>,
    system_state: Mutex<SystemState>,
    config: Mutex<CoreConfig>,
    background: Mutex<Option<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl MasterCore {
    pub fn new(
        adapter: Box<dyn SerialAdapter>,
        telemetry_sink: Arc<dyn TelemetrySink>,
        estop_output: Box<dyn EstopOutput>,
        led_effects: Arc<dyn LedEffects>,
    ) -> Self {
        Self::with_clock(adapter, telemetry_sink, estop_output, led_effects, SystemClock::new())
    }

    /// As [`Self::new`], but with an injected [`Clock`] — used by tests that
    /// need deterministic control over debounce/offline timing.
    pub fn with_clock(
        adapter: Box<dyn SerialAdapter>,
        telemetry_sink: Arc<dyn TelemetrySink>,
        estop_output: Box<dyn EstopOutput>,
        led_effects: Arc<dyn LedEffects>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let transport = Arc::new(ModbusTransport::new(adapter, clock.clone()));
        let registry = Arc::new(ModuleRegistry::new());

        let safety = Arc::new(SafetyMonitor::new(
            transport.clone(),
            registry.clone(),
            clock.clone(),
            estop_output,
            led_effects,
        ));

        let mut scheduler = PollingScheduler::new(
            transport.clone(),
            registry.clone(),
            clock.clone(),
            telemetry_sink,
        );
        scheduler.set_health_source(safety.clone());
        let scheduler = Arc::new(scheduler);

        Self {
            transport,
            registry,
            scheduler,
            safety,
            clock,
            scan_token: CancelToken::new(),
            scan_miss: Mutex::new(ScanMissTracker {
                misses: HashMap::new(),
                n_miss: DEFAULT_N_MISS,
            }),
            system_state: Mutex::new(SystemState::Idle),
            config: Mutex::new(CoreConfig::default()),
            background: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn open(&self, serial_config: SerialConfig) -> Result<(), TransportError> {
        self.transport.open(serial_config)
    }

    pub fn set_system_state(&self, state: SystemState) {
        *self.system_state.lock() = state;
    }

    pub fn system_state(&self) -> SystemState {
        *self.system_state.lock()
    }

    /// Apply configuration atomically. Never call this concurrently with a
    /// running `tick()` — applying between ticks is the caller's
    /// scheduling responsibility (e.g. apply only from the same thread
    /// driving `tick`, or pause `spawn_background` first).
    pub fn apply_config(&self, config: CoreConfig) {
        self.transport.apply_config(TransportConfig {
            timeout_ms: config.response_timeout_ms,
            retry_count: config.retry_count,
            ..TransportConfig::default()
        });
        self.transport.set_breaker_config(CircuitBreakerConfig {
            fail_threshold: config.cb_fail_threshold,
            base_cooldown_ms: config.cb_base_cooldown_ms,
            max_cooldown_ms: config.cb_max_cooldown_ms,
        });
        for (&address, over) in &config.module_overrides {
            let module_type = self
                .registry
                .get(address)
                .map(|r| r.module_type)
                .unwrap_or(crate::registry::ModuleType::Unknown);
            let mut base = crate::safety::criticality::default_config_for(module_type);
            if let Some(v) = over.offline_timeout_ms {
                base.offline_timeout_ms = v;
            }
            if let Some(v) = over.failure_timeout_ms {
                base.failure_timeout_ms = v;
            }
            if let Some(v) = over.health_check_interval_ms {
                base.health_check_interval_ms = v;
            }
            if let Some(v) = over.consecutive_failure_threshold {
                base.consecutive_failure_threshold = v;
            }
            if let Some(v) = over.max_response_time_ms {
                base.max_response_time_ms = v;
            }
            if let Some(v) = over.min_success_rate {
                base.min_success_rate = v;
            }
            self.safety.apply_config(address, base);
        }
        self.safety.set_jitter_percent(config.clamped_jitter_percent());
        *self.config.lock() = config;
    }

    // -- Scan control --------------------------------------------------------

    pub fn is_scanning(&self) -> bool {
        self.scan_token.is_active()
    }

    pub fn pause_scan(&self) {
        self.scan_token.pause();
    }

    pub fn resume_scan(&self) {
        self.scan_token.resume();
    }

    pub fn stop_scan(&self) {
        self.scan_token.request_interrupt();
    }

    /// Spawn a scan over `start..=end` on a dedicated thread and return
    /// immediately; `pause_scan`/`resume_scan`/`stop_scan` act on it from
    /// any other thread. Rejected (returns `false`, nothing spawned) if a
    /// scan is already active.
    pub fn start_scan(self: &Arc<Self>, start: u8, end: u8) -> bool {
        if self.scan_token.is_active() {
            return false;
        }
        let core = self.clone();
        std::thread::spawn(move || {
            let n_miss = core.scan_miss.lock().n_miss;
            let token = core.scan_token.clone();
            core.transport.scan_range(start, end, &token, |address, result| {
                let now_ms = core.clock.now_ms();
                match result {
                    Ok(_) => {
                        let mut tracker = core.scan_miss.lock();
                        tracker.misses.insert(address, 0);
                        drop(tracker);
                        crate::registry::discovery::identify_and_register(
                            &core.transport, &core.registry, address, now_ms,
                        );
                    }
                    Err(_) => {
                        let should_mark_offline = {
                            let mut tracker = core.scan_miss.lock();
                            let count = tracker.misses.entry(address).or_insert(0);
                            *count += 1;
                            *count >= n_miss
                        };
                        if should_mark_offline && core.registry.contains(address) {
                            core.registry.mark_offline(address);
                        }
                    }
                }
            });
        });
        true
    }

    // -- Ticking ------------------------------------------------------------

    /// Run one pass of the scheduler and safety monitor, plus the
    /// registry's offline-detection sweep. Intended to be driven at ≥10 Hz.
    pub fn tick(&self) {
        let system_idle = self.system_state() == SystemState::Idle;
        self.scheduler.tick(system_idle);
        self.safety.tick();
        let offline_threshold_ms = self.config.lock().offline_threshold_ms;
        self.registry.check_offline(self.clock.now_ms(), offline_threshold_ms);
    }

    /// Spawn a background thread calling `tick()` at ~10 Hz until `stop()`
    /// is called.
    pub fn spawn_background(self: &Arc<Self>) {
        let core = self.clone();
        let shutdown = self.shutdown.clone();
        let handle = std::thread::spawn(move || {
            info!("core background loop starting");
            while !shutdown.load(Ordering::Acquire) {
                core.tick();
                std::thread::sleep(Duration::from_millis(100));
            }
            info!("core background loop stopped");
        });
        *self.background.lock() = Some(handle);
    }

    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.background.lock().take() {
            let _ = handle.join();
        }
    }

    // -- Status queries -------------------------------------------------------

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    pub fn registry_snapshot(&self) -> Vec<ModuleRecord> {
        self.registry.snapshot()
    }

    pub fn safety_summary(&self) -> Vec<(u8, ModuleAssessment)> {
        self.registry
            .snapshot()
            .into_iter()
            .filter_map(|record| {
                self.safety
                    .assessment(record.address)
                    .map(|a| (record.address, a))
            })
            .collect()
    }

    pub fn system_response_level(&self) -> crate::health::ResponseLevel {
        self.safety.system_response_level()
    }

    // -- Persistence ------------------------------------------------------------

    pub fn save_registry(&self, writer: &mut impl Write) -> std::io::Result<()> {
        crate::registry::persistence::save(&self.registry, writer)
    }

    pub fn load_registry(&self, reader: impl Read) -> std::io::Result<()> {
        crate::registry::persistence::load(reader, &self.registry, self.clock.now_ms())
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<ModbusTransport> {
        &self.transport
    }

    pub fn safety_monitor(&self) -> &Arc<SafetyMonitor> {
        &self.safety
    }
}
