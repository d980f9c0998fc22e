//! Per-address circuit breaker.
//!
//! One entry per address the scan engine has ever touched. Cooldown grows
//! exponentially with consecutive failures past the threshold, clamped to
//! `cb_max_cooldown_ms`.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default)]
pub struct CircuitBreakerEntry {
    pub consecutive_failures: u32,
    pub open_until_ms: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub fail_threshold: u32,
    pub base_cooldown_ms: u64,
    pub max_cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 3,
            base_cooldown_ms: 1_000,
            max_cooldown_ms: 30_000,
        }
    }
}

#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    entries: HashMap<u8, CircuitBreakerEntry>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
        }
    }

    pub fn set_config(&mut self, config: CircuitBreakerConfig) {
        self.config = config;
    }

    /// `true` if the breaker is open for `address` at time `now_ms` — the
    /// caller must skip probing it.
    pub fn is_open(&self, address: u8, now_ms: u64) -> bool {
        self.entries
            .get(&address)
            .is_some_and(|e| now_ms < e.open_until_ms)
    }

    pub fn entry(&self, address: u8) -> CircuitBreakerEntry {
        self.entries.get(&address).copied().unwrap_or_default()
    }

    /// Record a successful probe: clears the failure count and any open
    /// cooldown.
    pub fn record_success(&mut self, address: u8) {
        self.entries.insert(address, CircuitBreakerEntry::default());
    }

    /// Record a failed probe attempt. Once `consecutive_failures` reaches
    /// `fail_threshold`, opens the breaker with an exponentially growing
    /// cooldown: `base · 2^(failures − threshold)`, clamped to `max`.
    pub fn record_failure(&mut self, address: u8, now_ms: u64) {
        let entry = self.entries.entry(address).or_default();
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.config.fail_threshold {
            let exponent = entry.consecutive_failures - self.config.fail_threshold;
            let cooldown = self
                .config
                .base_cooldown_ms
                .saturating_mul(1u64 << exponent.min(20))
                .min(self.config.max_cooldown_ms);
            entry.open_until_ms = now_ms + cooldown;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_and_clamps_cooldown() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig {
            fail_threshold: 2,
            base_cooldown_ms: 1_000,
            max_cooldown_ms: 5_000,
        });
        assert!(!cb.is_open(0x02, 0));
        cb.record_failure(0x02, 0);
        assert!(!cb.is_open(0x02, 0));
        cb.record_failure(0x02, 0);
        assert!(cb.is_open(0x02, 0));
        assert_eq!(cb.entry(0x02).open_until_ms, 1_000);

        cb.record_failure(0x02, 1_000);
        cb.record_failure(0x02, 1_000);
        // exponent 2 => 1000*4 = 4000, still under max
        assert_eq!(cb.entry(0x02).open_until_ms, 1_000 + 4_000);

        cb.record_failure(0x02, 5_000);
        cb.record_failure(0x02, 5_000);
        // would be 1000*16=16000, clamped to 5000
        assert_eq!(cb.entry(0x02).open_until_ms, 5_000 + 5_000);
    }

    #[test]
    fn success_resets_breaker() {
        let mut cb = CircuitBreaker::new(CircuitBreakerConfig::default());
        for _ in 0..3 {
            cb.record_failure(0x03, 0);
        }
        assert!(cb.is_open(0x03, 0));
        cb.record_success(0x03);
        assert!(!cb.is_open(0x03, 0));
        assert_eq!(cb.entry(0x03).consecutive_failures, 0);
    }
}
