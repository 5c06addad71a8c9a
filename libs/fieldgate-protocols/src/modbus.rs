//! Modbus TCP / RTU
//!
//! One codec serves both framings. MBAP frames carry the transaction id, so
//! TCP and UDP links may pipeline requests. RTU frames carry nothing but the
//! unit id and must run one request at a time.

pub mod address;
pub mod codec;
pub mod constants;
pub mod frame;
pub mod pdu;

pub use address::{ModbusAddress, ModbusArea};
pub use codec::ModbusCodec;
pub use frame::{crc16, ModbusFraming, ModbusRtuFormat, ModbusTcpFormat};
