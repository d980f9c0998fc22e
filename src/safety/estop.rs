//! E-Stop output. `assert_estop()`/`deassert_estop()` must be idempotent,
//! and `assert_estop()` latches.
//!
//! [`EstopLatch`] wraps a concrete [`EstopOutput`] and guarantees that
//! calling `assert` N times within a single emergency produces exactly
//! one assertion edge. The underlying output is only ever told to assert
//! once per latch cycle; `deassert` clears the latch so a later emergency
//! can assert again.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::SafetyFault;

/// The physical/logical E-Stop effect. Implementations must make `assert`
/// and `deassert` idempotent at their own layer too — the latch only
/// prevents redundant *calls*, not redundant hardware pulses if the
/// adapter is reused directly.
pub trait EstopOutput: Send + Sync {
    fn assert(&self) -> Result<(), SafetyFault>;
    fn deassert(&self) -> Result<(), SafetyFault>;
}

pub struct NullEstopOutput;
impl EstopOutput for NullEstopOutput {
    fn assert(&self) -> Result<(), SafetyFault> {
        Ok(())
    }
    fn deassert(&self) -> Result<(), SafetyFault> {
        Ok(())
    }
}

impl EstopOutput for Box<dyn EstopOutput> {
    fn assert(&self) -> Result<(), SafetyFault> {
        (**self).assert()
    }
    fn deassert(&self) -> Result<(), SafetyFault> {
        (**self).deassert()
    }
}

/// Latches a single assertion edge per emergency. A failed `assert` is
/// logged and retried on the next tick, but a succeeded one is never
/// repeated until `deassert`.
pub struct EstopLatch<O: EstopOutput> {
    output: O,
    latched: AtomicBool,
}

impl<O: EstopOutput> EstopLatch<O> {
    pub fn new(output: O) -> Self {
        Self {
            output,
            latched: AtomicBool::new(false),
        }
    }

    pub fn is_latched(&self) -> bool {
        self.latched.load(Ordering::Acquire)
    }

    /// Assert the output if not already latched. Returns `Ok(true)` if this
    /// call produced the assertion edge, `Ok(false)` if already latched.
    pub fn assert_estop(&self) -> Result<bool, SafetyFault> {
        if self.latched.load(Ordering::Acquire) {
            return Ok(false);
        }
        self.output.assert()?;
        self.latched.store(true, Ordering::Release);
        Ok(true)
    }

    pub fn deassert_estop(&self) -> Result<(), SafetyFault> {
        self.output.deassert()?;
        self.latched.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingOutput {
        asserts: AtomicU32,
    }
    impl EstopOutput for CountingOutput {
        fn assert(&self) -> Result<(), SafetyFault> {
            self.asserts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn deassert(&self) -> Result<(), SafetyFault> {
            Ok(())
        }
    }

    #[test]
    fn repeated_assert_produces_one_edge() {
        let latch = EstopLatch::new(CountingOutput { asserts: AtomicU32::new(0) });
        assert_eq!(latch.assert_estop().unwrap(), true);
        assert_eq!(latch.assert_estop().unwrap(), false);
        assert_eq!(latch.assert_estop().unwrap(), false);
        assert_eq!(latch.output.asserts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deassert_allows_a_fresh_edge() {
        let latch = EstopLatch::new(CountingOutput { asserts: AtomicU32::new(0) });
        latch.assert_estop().unwrap();
        latch.deassert_estop().unwrap();
        assert_eq!(latch.assert_estop().unwrap(), true);
        assert_eq!(latch.output.asserts.load(Ordering::SeqCst), 2);
    }
}
