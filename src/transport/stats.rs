//! Transport statistics: monotonic counters tracked across the transport's
//! lifetime.
//!
//! All fields are updated under the transport's own lock, which protects
//! both its in-flight state and its statistics; external readers receive
//! a plain copy via [`TransportStats::snapshot`].

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub total_transmissions: u64,
    pub successful: u64,
    pub failed: u64,
    pub timeout_count: u64,
    pub crc_error_count: u64,
    pub frame_error_count: u64,
    pub retry_count: u64,
    pub total_response_time_ms: u64,
    pub response_count: u64,
}

impl TransportStats {
    pub fn avg_response_time_ms(&self) -> f64 {
        if self.response_count == 0 {
            0.0
        } else {
            self.total_response_time_ms as f64 / self.response_count as f64
        }
    }

    pub(crate) fn record_attempt(&mut self) {
        self.total_transmissions += 1;
    }

    pub(crate) fn record_retry(&mut self) {
        self.retry_count += 1;
    }

    pub(crate) fn record_success(&mut self, response_time_ms: u64) {
        self.successful += 1;
        self.total_response_time_ms += response_time_ms;
        self.response_count += 1;
    }

    pub(crate) fn record_failure(&mut self, error: &crate::error::TransportError) {
        use crate::error::TransportError::*;
        self.failed += 1;
        match error {
            Timeout => self.timeout_count += 1,
            CrcFailed { .. } => self.crc_error_count += 1,
            FrameError(_) => self.frame_error_count += 1,
            _ => {}
        }
    }
}
