//! Serial adapter abstraction.
//!
//! The transport never touches a concrete serial port type directly — it
//! talks to this trait, so tests can swap in an in-memory loopback and the
//! embedder can swap in whatever OS/board support they have.

use std::io::{Read, Write};
use std::time::Duration;

use crate::error::{TransportError, TransportResult};

/// Line parameters for the bus: 8 data bits, 1 stop bit, no parity,
/// 115200 baud default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialConfig {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: 1,
        }
    }
}

/// Abstract half-duplex byte channel the transport drives.
pub trait SerialAdapter: Send {
    fn open(&mut self, config: SerialConfig) -> TransportResult<()>;
    fn close(&mut self) -> TransportResult<()>;
    fn transmit(&mut self, bytes: &[u8]) -> TransportResult<()>;

    /// Read up to `buf.len()` bytes, blocking up to `timeout` for the first
    /// byte. Returns the number of bytes read (0 on timeout with no data).
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> TransportResult<usize>;

    fn health_check(&mut self) -> TransportResult<()>;
}

/// Production adapter backed by the `serialport` crate.
pub struct SerialPortAdapter {
    path: String,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialPortAdapter {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            port: None,
        }
    }
}

impl SerialAdapter for SerialPortAdapter {
    fn open(&mut self, config: SerialConfig) -> TransportResult<()> {
        let data_bits = match config.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        };
        let stop_bits = match config.stop_bits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        };
        let port = serialport::new(&self.path, config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(serialport::Parity::None)
            .timeout(Duration::from_millis(500))
            .open()
            .map_err(|e| TransportError::IoError(e.to_string()))?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        self.port = None;
        Ok(())
    }

    fn transmit(&mut self, bytes: &[u8]) -> TransportResult<()> {
        let port = self.port.as_mut().ok_or(TransportError::NotInitialized)?;
        port.write_all(bytes)
            .map_err(|e| TransportError::IoError(e.to_string()))?;
        port.flush().map_err(|e| TransportError::IoError(e.to_string()))
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> TransportResult<usize> {
        let port = self.port.as_mut().ok_or(TransportError::NotInitialized)?;
        port.set_timeout(timeout)
            .map_err(|e| TransportError::IoError(e.to_string()))?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(TransportError::IoError(e.to_string())),
        }
    }

    fn health_check(&mut self) -> TransportResult<()> {
        if self.port.is_some() {
            Ok(())
        } else {
            Err(TransportError::NotInitialized)
        }
    }
}

/// In-memory adapter pairing a byte queue with a scripted responder,
/// used to drive end-to-end scenarios without a real bus.
pub struct LoopbackAdapter {
    responder: Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>,
    pending: Vec<u8>,
    opened: bool,
}

impl LoopbackAdapter {
    pub fn new(responder: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            pending: Vec::new(),
            opened: false,
        }
    }
}

impl SerialAdapter for LoopbackAdapter {
    fn open(&mut self, _config: SerialConfig) -> TransportResult<()> {
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> TransportResult<()> {
        self.opened = false;
        Ok(())
    }

    fn transmit(&mut self, bytes: &[u8]) -> TransportResult<()> {
        if !self.opened {
            return Err(TransportError::NotInitialized);
        }
        self.pending = (self.responder)(bytes).unwrap_or_default();
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> TransportResult<usize> {
        if !self.opened {
            return Err(TransportError::NotInitialized);
        }
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }

    fn health_check(&mut self) -> TransportResult<()> {
        if self.opened {
            Ok(())
        } else {
            Err(TransportError::NotInitialized)
        }
    }
}
