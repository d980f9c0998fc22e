//! Modbus-RTU transport and scan engine.
//!
//! [`ModbusTransport`] owns the serial adapter, the statistics counters,
//! and the per-address circuit breaker, and serializes every bus exchange
//! behind its own lock — Modbus requests to a single bus are strictly
//! serialized.

pub mod circuit_breaker;
pub mod serial;
pub mod stats;

use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::error::{TransportError, TransportResult};
use crate::modbus::frame::{self, Request, Response};
use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use serial::{SerialAdapter, SerialConfig};
use stats::TransportStats;
use std::sync::Arc;

/// Transport-level tunables exposed as configuration.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub timeout_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub crc_enabled: bool,
    pub inter_frame_settle_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 500,
            retry_count: 2,
            retry_delay_ms: 50,
            crc_enabled: true,
            inter_frame_settle_ms: 2,
        }
    }
}

struct Inner {
    adapter: Box<dyn SerialAdapter>,
    stats: TransportStats,
    breaker: CircuitBreaker,
    initialized: bool,
}

/// The Modbus-RTU master. One instance owns the serial handle and is the
/// sole reader/writer of the bus.
pub struct ModbusTransport {
    inner: Mutex<Inner>,
    config: Mutex<TransportConfig>,
    clock: Arc<dyn Clock>,
}

impl ModbusTransport {
    pub fn new(adapter: Box<dyn SerialAdapter>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                adapter,
                stats: TransportStats::default(),
                breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
                initialized: false,
            }),
            config: Mutex::new(TransportConfig::default()),
            clock,
        }
    }

    pub fn apply_config(&self, config: TransportConfig) {
        *self.config.lock() = config;
    }

    pub fn set_breaker_config(&self, config: CircuitBreakerConfig) {
        self.inner.lock().breaker.set_config(config);
    }

    pub fn open(&self, serial_config: SerialConfig) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        inner.adapter.open(serial_config)?;
        inner.initialized = true;
        Ok(())
    }

    pub fn close(&self) -> TransportResult<()> {
        let mut inner = self.inner.lock();
        inner.initialized = false;
        inner.adapter.close()
    }

    pub fn stats(&self) -> TransportStats {
        self.inner.lock().stats
    }

    pub fn is_breaker_open(&self, address: u8) -> bool {
        self.inner.lock().breaker.is_open(address, self.clock.now_ms())
    }

    /// Run one logical request to completion, retrying on transient
    /// failures. Exceptions and invalid-parameter failures are never
    /// retried.
    pub fn execute(&self, request: &Request) -> TransportResult<Response> {
        let config = *self.config.lock();
        request.validate()?;

        let mut attempt = 0u32;
        loop {
            let started = self.clock.now_ms();
            let outcome = self.transact(request, &config);
            match outcome {
                Ok(response) => {
                    let elapsed = self.clock.now_ms().saturating_sub(started);
                    self.inner.lock().stats.record_success(elapsed);
                    return Ok(response);
                }
                Err(err) => {
                    self.inner.lock().stats.record_failure(&err);
                    if !err.is_retryable() || attempt >= config.retry_count {
                        return Err(err);
                    }
                    attempt += 1;
                    self.inner.lock().stats.record_retry();
                    warn!("modbus request failed ({err}), retry {attempt}/{}", config.retry_count);
                    std::thread::sleep(Duration::from_millis(config.retry_delay_ms));
                }
            }
        }
    }

    /// A single transmit/receive exchange, no retry.
    fn transact(&self, request: &Request, config: &TransportConfig) -> TransportResult<Response> {
        let bytes = request.build()?;
        let mut inner = self.inner.lock();
        if !inner.initialized {
            return Err(TransportError::NotInitialized);
        }
        inner.stats.record_attempt();
        inner.adapter.transmit(&bytes)?;

        std::thread::sleep(Duration::from_millis(config.inter_frame_settle_ms));

        let mut buf = [0u8; 256];
        let timeout = Duration::from_millis(config.timeout_ms);
        let n = inner.adapter.receive(&mut buf, timeout)?;
        if n == 0 {
            return Err(TransportError::Timeout);
        }
        if n < 4 {
            return Err(TransportError::FrameError(format!("short frame ({n} bytes)")));
        }
        debug!("received {n} bytes");
        frame::parse_response(request, &buf[..n], config.crc_enabled)
    }

    /// Probe a single address's Device-ID register, consulting and
    /// updating the circuit breaker.
    pub fn probe_device_id(&self, address: u8, register: u16) -> TransportResult<u16> {
        let now = self.clock.now_ms();
        if self.inner.lock().breaker.is_open(address, now) {
            return Err(TransportError::CommunicationLost);
        }
        let request = Request::ReadHoldingRegisters {
            slave_id: address,
            start: register,
            qty: 1,
        };
        match self.execute(&request) {
            Ok(Response::Registers(values)) => {
                self.inner.lock().breaker.record_success(address);
                Ok(values.first().copied().unwrap_or(0))
            }
            Ok(_) => {
                self.inner.lock().breaker.record_success(address);
                Ok(0)
            }
            Err(err) => {
                self.inner.lock().breaker.record_failure(address, self.clock.now_ms());
                Err(err)
            }
        }
    }

    /// Scan `start..=end`, invoking `on_result` for each address probed.
    /// Honors `token`'s pause/interrupt signals at every yield point.
    ///
    /// Probes the Device-ID register (`0x0100`, falling back to `0x0000`
    /// on failure) up to 3 times with 50/100/200 ms backoff, then moves on
    /// after a 20 ms inter-address gap.
    pub fn scan_range(
        &self,
        start: u8,
        end: u8,
        token: &CancelToken,
        mut on_result: impl FnMut(u8, TransportResult<u16>),
    ) {
        token.begin();
        if start > end {
            token.finish();
            return;
        }
        const BACKOFFS_MS: [u64; 3] = [50, 100, 200];
        for address in start..=end {
            if token.is_interrupted() {
                break;
            }
            token.wait_while_paused();
            if token.is_interrupted() {
                break;
            }

            if self.is_breaker_open(address) {
                on_result(address, Err(TransportError::CommunicationLost));
            } else {
                let mut result = self.probe_device_id(address, 0x0100);
                let registers = [0x0100u16, 0x0000u16];
                let mut reg_idx = 0usize;
                let mut attempt = 0usize;
                while attempt < BACKOFFS_MS.len() {
                    match &result {
                        Ok(_) => break,
                        Err(err) if !err.is_retryable() => break,
                        Err(_) => {}
                    }
                    if token.is_interrupted() {
                        break;
                    }
                    if reg_idx + 1 < registers.len() {
                        reg_idx += 1;
                    }
                    if !token.sleep_for(Duration::from_millis(BACKOFFS_MS[attempt])) {
                        break;
                    }
                    result = self.probe_device_id(address, registers[reg_idx]);
                    attempt += 1;
                }
                on_result(address, result);
            }

            if token.is_interrupted() {
                break;
            }
            if !token.sleep_for(Duration::from_millis(20)) {
                break;
            }
        }
        token.finish();
    }
}
