//! Monotonic time source. Every age/deadline decision in this crate is
//! taken against the monotonic clock, never wall-clock time.
//!
//! All age/deadline arithmetic in the registry, scheduler, and safety
//! monitor goes through a [`Clock`] handle rather than calling
//! `Instant::now()` directly, so tests can script exact timings for
//! debounce, circuit-breaker, and E-Stop-latency scenarios without
//! sleeping in real time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary epoch fixed at clock creation.
    /// Monotonic and non-decreasing.
    fn now_ms(&self) -> u64;
}

/// Wall-clock `Clock` backed by `std::time::Instant`.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start: Instant::now(),
        })
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Manually advanced `Clock` for deterministic tests that reference exact
/// millisecond deadlines.
pub struct TestClock {
    millis: AtomicU64,
}

impl TestClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            millis: AtomicU64::new(0),
        })
    }

    pub fn advance(&self, ms: u64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.millis.store(ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances_monotonically() {
        let clock = TestClock::new();
        assert_eq!(clock.now_ms(), 0);
        clock.advance(50);
        assert_eq!(clock.now_ms(), 50);
        clock.set(1000);
        assert_eq!(clock.now_ms(), 1000);
    }
}
