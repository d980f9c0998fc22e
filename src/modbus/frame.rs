//! Modbus-RTU ADU construction and parsing.
//!
//! `Request::build` and `parse_request` are each other's inverse for every
//! supported function code, and `parse_response` is the single place that
//! turns a received byte slice into either a typed [`Response`] or a
//! [`TransportError`] — CRC failure, frame-shape failure, and slave
//! exceptions are all distinguished here rather than inside the
//! transport's retry loop. Uses `rmodbus::guess_response_frame_len` only
//! to determine how many bytes to keep reading.

use crate::error::{TransportError, TransportResult};
use crate::modbus::crc;
use crate::modbus::function::FunctionCode;

/// A single Modbus-RTU request this transport knows how to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadCoils {
        slave_id: u8,
        start: u16,
        qty: u16,
    },
    ReadHoldingRegisters {
        slave_id: u8,
        start: u16,
        qty: u16,
    },
    ReadInputRegisters {
        slave_id: u8,
        start: u16,
        qty: u16,
    },
    WriteSingleCoil {
        slave_id: u8,
        address: u16,
        value: bool,
    },
    WriteSingleRegister {
        slave_id: u8,
        address: u16,
        value: u16,
    },
    WriteMultipleRegisters {
        slave_id: u8,
        start: u16,
        values: Vec<u16>,
    },
}

impl Request {
    pub fn slave_id(&self) -> u8 {
        match self {
            Request::ReadCoils { slave_id, .. }
            | Request::ReadHoldingRegisters { slave_id, .. }
            | Request::ReadInputRegisters { slave_id, .. }
            | Request::WriteSingleCoil { slave_id, .. }
            | Request::WriteSingleRegister { slave_id, .. }
            | Request::WriteMultipleRegisters { slave_id, .. } => *slave_id,
        }
    }

    pub fn function_code(&self) -> FunctionCode {
        match self {
            Request::ReadCoils { .. } => FunctionCode::ReadCoils,
            Request::ReadHoldingRegisters { .. } => FunctionCode::ReadHoldingRegisters,
            Request::ReadInputRegisters { .. } => FunctionCode::ReadInputRegisters,
            Request::WriteSingleCoil { .. } => FunctionCode::WriteSingleCoil,
            Request::WriteSingleRegister { .. } => FunctionCode::WriteSingleRegister,
            Request::WriteMultipleRegisters { .. } => FunctionCode::WriteMultipleRegisters,
        }
    }

    /// Parameter validation: rejected before transmission, never retried.
    pub fn validate(&self) -> TransportResult<()> {
        let slave_id = self.slave_id();
        if !(1..=247).contains(&slave_id) {
            return Err(TransportError::InvalidParameter(format!(
                "slave_id {slave_id} out of range [1, 247]"
            )));
        }
        match self {
            Request::ReadCoils { start, qty, .. } => {
                if !FunctionCode::ReadCoils.validate_read_qty(*qty) {
                    return Err(TransportError::InvalidParameter(format!(
                        "read coils qty {qty} out of range [1, 2000]"
                    )));
                }
                check_address_range(*start, *qty)?;
            }
            Request::ReadHoldingRegisters { start, qty, .. }
            | Request::ReadInputRegisters { start, qty, .. } => {
                if !FunctionCode::ReadHoldingRegisters.validate_read_qty(*qty) {
                    return Err(TransportError::InvalidParameter(format!(
                        "read registers qty {qty} out of range [1, 125]"
                    )));
                }
                check_address_range(*start, *qty)?;
            }
            Request::WriteSingleCoil { .. } | Request::WriteSingleRegister { .. } => {}
            Request::WriteMultipleRegisters { start, values, .. } => {
                let qty = values.len() as u16;
                if !FunctionCode::WriteMultipleRegisters.validate_write_multiple_qty(qty) {
                    return Err(TransportError::InvalidParameter(format!(
                        "write multiple qty {qty} out of range [1, 123]"
                    )));
                }
                check_address_range(*start, qty)?;
            }
        }
        Ok(())
    }

    /// Build the wire frame (header + payload + little-endian CRC).
    pub fn build(&self) -> TransportResult<Vec<u8>> {
        self.validate()?;
        let mut buf = Vec::with_capacity(8);
        buf.push(self.slave_id());
        buf.push(self.function_code().code());
        match self {
            Request::ReadCoils { start, qty, .. }
            | Request::ReadHoldingRegisters { start, qty, .. }
            | Request::ReadInputRegisters { start, qty, .. } => {
                buf.extend_from_slice(&start.to_be_bytes());
                buf.extend_from_slice(&qty.to_be_bytes());
            }
            Request::WriteSingleCoil { address, value, .. } => {
                buf.extend_from_slice(&address.to_be_bytes());
                buf.extend_from_slice(if *value { &[0xFF, 0x00] } else { &[0x00, 0x00] });
            }
            Request::WriteSingleRegister { address, value, .. } => {
                buf.extend_from_slice(&address.to_be_bytes());
                buf.extend_from_slice(&value.to_be_bytes());
            }
            Request::WriteMultipleRegisters { start, values, .. } => {
                buf.extend_from_slice(&start.to_be_bytes());
                buf.extend_from_slice(&(values.len() as u16).to_be_bytes());
                buf.push((values.len() * 2) as u8);
                for v in values {
                    buf.extend_from_slice(&v.to_be_bytes());
                }
            }
        }
        let [lo, hi] = crc::to_bytes(crc::crc16(&buf));
        buf.push(lo);
        buf.push(hi);
        Ok(buf)
    }

    /// Expected length of the full response ADU for this request, used by
    /// the transport to know how many bytes to read.
    pub fn expected_response_len(&self) -> usize {
        match self {
            Request::ReadCoils { qty, .. } => 3 + coil_byte_count(*qty) as usize + 2,
            Request::ReadHoldingRegisters { qty, .. } | Request::ReadInputRegisters { qty, .. } => {
                3 + (*qty as usize) * 2 + 2
            }
            Request::WriteSingleCoil { .. }
            | Request::WriteSingleRegister { .. }
            | Request::WriteMultipleRegisters { .. } => 8,
        }
    }
}

fn coil_byte_count(qty: u16) -> u16 {
    qty.div_ceil(8)
}

fn check_address_range(start: u16, qty: u16) -> TransportResult<()> {
    let end = (start as u32) + (qty as u32) - 1;
    if end > 0xFFFF {
        return Err(TransportError::InvalidParameter(format!(
            "address range {start}..+{qty} exceeds 0xFFFF"
        )));
    }
    Ok(())
}

/// Parse a previously built request frame back into a [`Request`]. Used to
/// prove `build`/`parse_request` round-trip and by the in-memory loopback
/// slave used in tests.
pub fn parse_request(bytes: &[u8]) -> TransportResult<Request> {
    if bytes.len() < 8 {
        return Err(TransportError::FrameError("request too short".into()));
    }
    verify_crc(bytes)?;
    let slave_id = bytes[0];
    let func =
        FunctionCode::from_code(bytes[1]).ok_or_else(|| TransportError::FrameError(format!(
            "unsupported function code 0x{:02x}",
            bytes[1]
        )))?;
    let a = u16::from_be_bytes([bytes[2], bytes[3]]);
    let b = u16::from_be_bytes([bytes[4], bytes[5]]);
    let request = match func {
        FunctionCode::ReadCoils => Request::ReadCoils {
            slave_id,
            start: a,
            qty: b,
        },
        FunctionCode::ReadHoldingRegisters => Request::ReadHoldingRegisters {
            slave_id,
            start: a,
            qty: b,
        },
        FunctionCode::ReadInputRegisters => Request::ReadInputRegisters {
            slave_id,
            start: a,
            qty: b,
        },
        FunctionCode::WriteSingleCoil => Request::WriteSingleCoil {
            slave_id,
            address: a,
            value: b == 0xFF00,
        },
        FunctionCode::WriteSingleRegister => Request::WriteSingleRegister {
            slave_id,
            address: a,
            value: b,
        },
        FunctionCode::WriteMultipleRegisters => {
            if bytes.len() < 9 {
                return Err(TransportError::FrameError("write-multiple too short".into()));
            }
            let byte_count = bytes[6] as usize;
            if bytes.len() < 7 + byte_count + 2 {
                return Err(TransportError::FrameError(
                    "write-multiple byte count mismatch".into(),
                ));
            }
            let values = bytes[7..7 + byte_count]
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            Request::WriteMultipleRegisters {
                slave_id,
                start: a,
                values,
            }
        }
    };
    request.validate()?;
    Ok(request)
}

/// A successfully parsed Modbus response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Coils(Vec<bool>),
    Registers(Vec<u16>),
    WriteSingleAck { address: u16, value: u16 },
    WriteMultipleAck { start: u16, qty: u16 },
}

/// Verify length and CRC, then parse a response for `request`. Exception
/// responses (high bit of the function code set) are surfaced as
/// `TransportError::Exception`; the caller does not retry this error
/// variant — an exception response terminates retries.
pub fn parse_response(request: &Request, bytes: &[u8], crc_enabled: bool) -> TransportResult<Response> {
    if bytes.len() < 4 {
        return Err(TransportError::FrameError(format!(
            "response too short ({} bytes)",
            bytes.len()
        )));
    }
    if crc_enabled {
        verify_crc(bytes)?;
    }

    let func_byte = bytes[1];
    if func_byte & 0x80 != 0 {
        let exception_code = *bytes.get(2).unwrap_or(&0);
        return Err(TransportError::Exception(exception_code));
    }

    let expected_func = request.function_code().code();
    if func_byte != expected_func {
        return Err(TransportError::FrameError(format!(
            "unexpected function code 0x{func_byte:02x}, expected 0x{expected_func:02x}"
        )));
    }

    match request {
        Request::ReadCoils { qty, .. } => {
            let byte_count = *bytes.get(2).ok_or_else(|| {
                TransportError::FrameError("missing byte count".into())
            })? as usize;
            let data = bytes
                .get(3..3 + byte_count)
                .ok_or_else(|| TransportError::FrameError("coil data truncated".into()))?;
            let mut values = Vec::with_capacity(*qty as usize);
            for i in 0..*qty as usize {
                let byte = data[i / 8];
                values.push(byte & (1 << (i % 8)) != 0);
            }
            Ok(Response::Coils(values))
        }
        Request::ReadHoldingRegisters { .. } | Request::ReadInputRegisters { .. } => {
            let byte_count = *bytes.get(2).ok_or_else(|| {
                TransportError::FrameError("missing byte count".into())
            })? as usize;
            let data = bytes
                .get(3..3 + byte_count)
                .ok_or_else(|| TransportError::FrameError("register data truncated".into()))?;
            let values = data
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect();
            Ok(Response::Registers(values))
        }
        Request::WriteSingleCoil { .. } | Request::WriteSingleRegister { .. } => {
            let address = u16::from_be_bytes([bytes[2], bytes[3]]);
            let value = u16::from_be_bytes([
                *bytes.get(4).unwrap_or(&0),
                *bytes.get(5).unwrap_or(&0),
            ]);
            Ok(Response::WriteSingleAck { address, value })
        }
        Request::WriteMultipleRegisters { .. } => {
            let start = u16::from_be_bytes([bytes[2], bytes[3]]);
            let qty = u16::from_be_bytes([
                *bytes.get(4).unwrap_or(&0),
                *bytes.get(5).unwrap_or(&0),
            ]);
            Ok(Response::WriteMultipleAck { start, qty })
        }
    }
}

fn verify_crc(bytes: &[u8]) -> TransportResult<()> {
    let n = bytes.len();
    if n < 4 {
        return Err(TransportError::FrameError("frame too short for CRC".into()));
    }
    let body = &bytes[..n - 2];
    let expected = crc::crc16(body);
    let actual = crc::from_bytes(bytes[n - 2], bytes[n - 1]);
    if expected != actual {
        return Err(TransportError::CrcFailed { expected, actual });
    }
    Ok(())
}

/// Use `rmodbus`'s frame-length guesser to determine how many bytes of a
/// streaming response to keep reading, given at least the first 6 bytes.
/// `rmodbus` only estimates length here; it never touches CRC or exception
/// decoding, both of which stay in this module.
pub fn guess_response_len(header: [u8; 6]) -> Option<usize> {
    rmodbus::guess_response_frame_len(&header, rmodbus::ModbusProto::Rtu)
        .ok()
        .map(|v| v as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_holding_registers_round_trip() {
        let req = Request::ReadHoldingRegisters {
            slave_id: 0x02,
            start: 0x0100,
            qty: 4,
        };
        let bytes = req.build().unwrap();
        let parsed = parse_request(&bytes).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn write_multiple_round_trip() {
        let req = Request::WriteMultipleRegisters {
            slave_id: 0x03,
            start: 10,
            values: vec![1, 2, 3],
        };
        let bytes = req.build().unwrap();
        let parsed = parse_request(&bytes).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn write_single_coil_round_trip() {
        let req = Request::WriteSingleCoil {
            slave_id: 0x04,
            address: 5,
            value: true,
        };
        let bytes = req.build().unwrap();
        let parsed = parse_request(&bytes).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn rejects_out_of_range_read_qty() {
        let req = Request::ReadHoldingRegisters {
            slave_id: 1,
            start: 0,
            qty: 126,
        };
        assert_eq!(
            req.build(),
            Err(TransportError::InvalidParameter(
                "read registers qty 126 out of range [1, 125]".into()
            ))
        );
    }

    #[test]
    fn qty_125_read_succeeds_126_fails() {
        let ok = Request::ReadHoldingRegisters {
            slave_id: 1,
            start: 0,
            qty: 125,
        };
        assert!(ok.build().is_ok());
        let bad = Request::ReadHoldingRegisters {
            slave_id: 1,
            start: 0,
            qty: 126,
        };
        assert!(bad.build().is_err());
    }

    #[test]
    fn qty_123_write_succeeds_124_fails() {
        let ok = Request::WriteMultipleRegisters {
            slave_id: 1,
            start: 0,
            values: vec![0u16; 123],
        };
        assert!(ok.build().is_ok());
        let bad = Request::WriteMultipleRegisters {
            slave_id: 1,
            start: 0,
            values: vec![0u16; 124],
        };
        assert!(bad.build().is_err());
    }

    #[test]
    fn crc_is_computed_over_body_and_checked_little_endian() {
        let req = Request::ReadHoldingRegisters {
            slave_id: 1,
            start: 0,
            qty: 2,
        };
        let bytes = req.build().unwrap();
        let n = bytes.len();
        let body = &bytes[..n - 2];
        let computed = crc::crc16(body);
        assert_eq!(crc::from_bytes(bytes[n - 2], bytes[n - 1]), computed);
    }

    #[test]
    fn corrupted_response_crc_is_rejected() {
        let req = Request::ReadHoldingRegisters {
            slave_id: 1,
            start: 0,
            qty: 1,
        };
        let mut response = vec![0x01, 0x03, 0x02, 0x00, 0x05];
        let crc = crc::crc16(&response);
        let [lo, hi] = crc::to_bytes(crc);
        response.push(lo);
        response.push(hi ^ 0xFF); // corrupt last byte
        let err = parse_response(&req, &response, true).unwrap_err();
        assert!(matches!(err, TransportError::CrcFailed { .. }));
    }

    #[test]
    fn exception_response_is_not_retryable() {
        let req = Request::ReadHoldingRegisters {
            slave_id: 2,
            start: 0,
            qty: 1,
        };
        let mut response = vec![0x02, 0x83, 0x02];
        let crc = crc::crc16(&response);
        let [lo, hi] = crc::to_bytes(crc);
        response.push(lo);
        response.push(hi);
        let err = parse_response(&req, &response, true).unwrap_err();
        assert_eq!(err, TransportError::Exception(0x02));
        assert!(!err.is_retryable());
    }
}
