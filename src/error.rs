//! Error taxonomy for the transport/wire boundary.
//!
//! `TransportError` covers everything that can go wrong building, sending,
//! or parsing a Modbus-RTU exchange. Higher layers (registry, scheduler,
//! safety monitor) consume these as health-demotion inputs and never
//! propagate raw I/O failures past their own boundary.

use thiserror::Error;

/// Wire/transport-level failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    /// Operation issued before the transport finished opening its serial
    /// adapter.
    #[error("transport not initialized")]
    NotInitialized,

    /// A request failed parameter validation bounds. Never retried.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// No response arrived within `timeout_ms`. Retryable.
    #[error("timed out waiting for response")]
    Timeout,

    /// CRC-16 mismatch on a received frame. Retryable.
    #[error("CRC check failed: expected 0x{expected:04x}, got 0x{actual:04x}")]
    CrcFailed { expected: u16, actual: u16 },

    /// Frame length or shape was invalid. Retryable.
    #[error("malformed frame: {0}")]
    FrameError(String),

    /// The slave returned a well-formed Modbus exception response. Not
    /// retried automatically — the caller decides.
    #[error("slave exception 0x{0:02x}")]
    Exception(u8),

    /// The local fixed-size buffer was exhausted. Surfaces as a
    /// configuration bug, never retried.
    #[error("buffer overflow")]
    BufferOverflow,

    /// The underlying serial adapter reported an I/O failure. Retried
    /// once, then bubbles.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Persistent bus-level fault; the bus is considered unusable until
    /// the embedder intervenes.
    #[error("communication lost")]
    CommunicationLost,
}

impl TransportError {
    /// Whether the transport's own retry loop should attempt this request
    /// again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout
                | TransportError::CrcFailed { .. }
                | TransportError::FrameError(_)
                | TransportError::IoError(_)
        )
    }
}

/// Fault surfaced by the safety monitor when it cannot honor its one hard
/// contract: asserting the E-Stop output. This is the only condition the
/// monitor treats as fatal, and it must be logged and retried every tick
/// rather than propagated as an ordinary error.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SafetyFault {
    #[error("failed to assert E-Stop output: {0}")]
    EstopAssertFailed(String),
}

pub type TransportResult<T> = Result<T, TransportError>;
