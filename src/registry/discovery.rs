//! Identification protocol.
//!
//! `identify` runs the fixed four-step probe sequence against a candidate
//! address — Device ID, Type, Version, Capabilities — and, on success,
//! upserts the result into the [`ModuleRegistry`].

use crate::modbus::frame::{Request, Response};
use crate::registry::{ModuleRegistry, ModuleType};
use crate::transport::ModbusTransport;

pub const DEVICE_ID_REGISTER: u16 = 0x0100;
pub const MODULE_TYPE_REGISTER: u16 = 0x0104;
pub const VERSION_REGISTER_START: u16 = 0x00F8;
pub const VERSION_REGISTER_COUNT: u16 = 8;
pub const CAPABILITIES_REGISTER: u16 = 0x0105;

pub const DEFAULT_VERSION: &str = "v1.0.0";

/// Outcome of one identification attempt against `address`.
#[derive(Debug, Clone)]
pub struct IdentifyOutcome {
    pub address: u8,
    pub module_type: ModuleType,
    pub version: String,
    pub capabilities: Option<u16>,
}

fn read_one(transport: &ModbusTransport, address: u8, register: u16) -> Option<u16> {
    let request = Request::ReadHoldingRegisters {
        slave_id: address,
        start: register,
        qty: 1,
    };
    match transport.execute(&request) {
        Ok(Response::Registers(values)) => values.first().copied(),
        _ => None,
    }
}

/// Decode the 8-register ASCII version block into a string, truncating at
/// the first NUL. Each register holds two ASCII bytes, high byte first.
fn decode_version(registers: &[u16]) -> String {
    let mut bytes = Vec::with_capacity(registers.len() * 2);
    for reg in registers {
        bytes.push((reg >> 8) as u8);
        bytes.push((reg & 0xFF) as u8);
    }
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Run the full identification sequence. Returns `None` if step 1 (Device
/// ID) fails — presence of that register is required for "online".
pub fn identify(transport: &ModbusTransport, address: u8) -> Option<IdentifyOutcome> {
    read_one(transport, address, DEVICE_ID_REGISTER)?;

    let module_type = read_one(transport, address, MODULE_TYPE_REGISTER)
        .and_then(ModuleType::from_register)
        .unwrap_or_else(|| ModuleType::from_address(address));

    let version = {
        let request = Request::ReadHoldingRegisters {
            slave_id: address,
            start: VERSION_REGISTER_START,
            qty: VERSION_REGISTER_COUNT,
        };
        match transport.execute(&request) {
            Ok(Response::Registers(values)) if !values.is_empty() => decode_version(&values),
            _ => DEFAULT_VERSION.to_string(),
        }
    };

    let capabilities = read_one(transport, address, CAPABILITIES_REGISTER);

    Some(IdentifyOutcome {
        address,
        module_type,
        version,
        capabilities,
    })
}

/// Run [`identify`] and upsert the result into `registry` on success.
pub fn identify_and_register(
    transport: &ModbusTransport,
    registry: &ModuleRegistry,
    address: u8,
    now_ms: u64,
) -> bool {
    match identify(transport, address) {
        Some(outcome) => {
            registry.upsert_discovered(outcome.address, outcome.module_type, outcome.version, now_ms);
            true
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_decode_stops_at_nul() {
        // "v1.0\0\0\0\0" packed two ASCII chars per register, high byte first.
        let registers = [
            u16::from_be_bytes([b'v', b'1']),
            u16::from_be_bytes([b'.', b'0']),
            0x0000,
            0x0000,
        ];
        assert_eq!(decode_version(&registers), "v1.0");
    }

    #[test]
    fn module_type_register_mapping() {
        assert_eq!(ModuleType::from_register(0x0002), Some(ModuleType::Power));
        assert_eq!(ModuleType::from_register(0x0005), Some(ModuleType::Dock));
        assert_eq!(ModuleType::from_register(0x0000), None);
    }
}
