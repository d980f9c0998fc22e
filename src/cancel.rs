//! Cooperative cancellation for the scan engine.
//!
//! Every sleep inside the scan loop must be interruptible within at most
//! 10 ms so `stop_scan`/`pause_scan` take effect promptly. Rather than
//! spreading raw `thread::sleep` calls through the retry/backoff logic,
//! all of it goes through [`sleep_until`], which chops the wait into
//! small slices and checks the token between each one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maximum single sleep slice while waiting on a cancel token. Bounds the
/// latency of `stop_scan`/`pause_scan` to this value.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Shared interrupt/pause flags for a single scan run.
///
/// `interrupt_requested` and `paused` are the two atomic control flags;
/// `active` lives alongside them here so a caller can query whether a
/// scan is currently running without a lock.
#[derive(Debug, Default)]
pub struct CancelToken {
    interrupt_requested: AtomicBool,
    paused: AtomicBool,
    active: AtomicBool,
}

impl CancelToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt_requested.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn request_interrupt(&self) {
        self.interrupt_requested.store(true, Ordering::Release);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    /// Mark the token active for a fresh scan run and clear any stale
    /// interrupt/pause state from a previous run.
    pub(crate) fn begin(&self) {
        self.interrupt_requested.store(false, Ordering::Release);
        self.paused.store(false, Ordering::Release);
        self.active.store(true, Ordering::Release);
    }

    pub(crate) fn finish(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Block at a pause point until resumed or interrupted. Spins at a
    /// 50-100 ms cadence. Does not abort an in-flight frame — callers
    /// only call this between requests.
    pub fn wait_while_paused(&self) {
        let mut cadence = Duration::from_millis(50);
        while self.is_paused() && !self.is_interrupted() {
            std::thread::sleep(cadence);
            // Alternate 50/100ms so many paused scans don't all wake in lockstep.
            cadence = if cadence == Duration::from_millis(50) {
                Duration::from_millis(100)
            } else {
                Duration::from_millis(50)
            };
        }
    }

    /// Sleep until `deadline`, waking early (and returning early) if the
    /// token is interrupted. Returns `true` if the full sleep elapsed,
    /// `false` if cancelled early.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        loop {
            if self.is_interrupted() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let remaining = deadline - now;
            std::thread::sleep(remaining.min(SLEEP_SLICE));
        }
    }

    /// Convenience wrapper around [`sleep_until`] for a relative duration.
    pub fn sleep_for(&self, duration: Duration) -> bool {
        self.sleep_until(Instant::now() + duration)
    }
}
