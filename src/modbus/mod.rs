//! Modbus-RTU wire layer: CRC, function/exception codes, and ADU framing.
//! Everything above the `transport` module talks in terms of
//! [`frame::Request`]/[`frame::Response`]; nothing outside this module
//! touches a raw byte slice.

pub mod crc;
pub mod frame;
pub mod function;

pub use frame::{parse_request, parse_response, Request, Response};
pub use function::{ExceptionCode, FunctionCode};
