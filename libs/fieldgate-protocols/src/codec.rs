//! Protocol codec interface and registry
//!
//! Every supported protocol family implements [`Codec`]. The set is closed:
//! [`Protocol`] names each variant and [`build_codec`] is the only place a
//! codec gets instantiated.

use crate::config::DeviceConfig;
use crate::dlt645::{Dlt645Address, Dlt645Codec};
use crate::modbus::{ModbusAddress, ModbusCodec, ModbusFraming};
use crate::s7::{S7Address, S7Codec};
use fieldgate_link::{Frame, FrameFormat, FrameMatcher, Handshake, LinkError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Supported protocol variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    ModbusTcp,
    ModbusRtu,
    /// RTU framing tunnelled over a TCP socket
    ModbusRtuOverTcp,
    /// MBAP framing over UDP datagrams
    ModbusUdp,
    S7,
    Dlt645,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::ModbusTcp => "modbus_tcp",
            Protocol::ModbusRtu => "modbus_rtu",
            Protocol::ModbusRtuOverTcp => "modbus_rtu_over_tcp",
            Protocol::ModbusUdp => "modbus_udp",
            Protocol::S7 => "s7",
            Protocol::Dlt645 => "dlt645",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parsed device address, one variant per protocol family
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceAddress {
    Modbus(ModbusAddress),
    S7(S7Address),
    Dlt645(Dlt645Address),
}

impl DeviceAddress {
    /// First element addressed
    pub fn start(&self) -> u32 {
        match self {
            DeviceAddress::Modbus(a) => u32::from(a.start),
            DeviceAddress::S7(a) => a.start,
            DeviceAddress::Dlt645(_) => 0,
        }
    }

    pub fn bit(&self) -> Option<u8> {
        match self {
            DeviceAddress::Modbus(a) => a.bit,
            DeviceAddress::S7(a) => a.bit,
            DeviceAddress::Dlt645(_) => None,
        }
    }

    /// Same resource, `elements` further on, without a bit index
    pub fn offset_by(&self, elements: u32) -> Result<Self> {
        match self {
            DeviceAddress::Modbus(a) => a.offset_by(elements).map(DeviceAddress::Modbus),
            DeviceAddress::S7(a) => a.offset_by(elements).map(DeviceAddress::S7),
            DeviceAddress::Dlt645(a) if elements == 0 => Ok(DeviceAddress::Dlt645(a.clone())),
            DeviceAddress::Dlt645(a) => Err(LinkError::argument(format!(
                "DLT645 address {} cannot be offset",
                a
            ))),
        }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAddress::Modbus(a) => a.fmt(f),
            DeviceAddress::S7(a) => a.fmt(f),
            DeviceAddress::Dlt645(a) => a.fmt(f),
        }
    }
}

/// What a single wire request does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Read `count` elements
    Read { count: u16 },
    /// Write whole elements, raw device bytes
    Write { data: Vec<u8> },
    /// Write individual bits
    WriteBits { values: Vec<bool> },
}

impl Operation {
    pub fn is_read(&self) -> bool {
        matches!(self, Operation::Read { .. })
    }
}

/// How one addressable element maps onto bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementLayout {
    /// One bit per element, packed LSB first (coils, discrete inputs)
    Bits,
    /// Fixed number of bytes per element
    Bytes(usize),
}

/// Protocol strategy: address grammar, request encoding, response decoding
pub trait Codec: Send + Sync + fmt::Debug {
    fn protocol(&self) -> Protocol;

    /// Framing rules for the channel's frame adapter
    fn frame_format(&self) -> Arc<dyn FrameFormat>;

    /// Exchange to run on every fresh link
    fn handshake(&self) -> Option<Arc<dyn Handshake>> {
        None
    }

    fn parse_address(&self, text: &str, station: Option<&str>) -> Result<DeviceAddress>;

    /// Serialize one request; `sign` is the correlator's tag for this exchange
    fn build_request(&self, address: &DeviceAddress, op: &Operation, sign: u32)
        -> Result<Vec<u8>>;

    /// Acceptance test for responses that carry no in-band sign
    fn response_matcher(&self, _address: &DeviceAddress, _op: &Operation) -> Option<FrameMatcher> {
        None
    }

    /// Extract the value bytes from a validated response frame
    fn decode_response(
        &self,
        frame: &Frame,
        address: &DeviceAddress,
        op: &Operation,
    ) -> Result<Vec<u8>>;

    /// True when bit 0 of an element lives in its last byte
    fn bit_reverse(&self, address: &DeviceAddress) -> bool;

    fn layout(&self, address: &DeviceAddress) -> ElementLayout;

    /// Most elements one request may carry
    fn max_elements(&self, address: &DeviceAddress, write: bool) -> u16;

    /// Fails for read-only resources
    fn check_writable(&self, address: &DeviceAddress) -> Result<()>;

    /// Whether `count` bits can be written without a read-modify-write
    fn writes_bits_natively(&self, address: &DeviceAddress, count: usize) -> bool;

    /// Fails when the resource cannot be addressed bit by bit at all
    fn check_bit_access(&self, _address: &DeviceAddress) -> Result<()> {
        Ok(())
    }

    /// Variables sharing a key may be fetched by one request; `None` never packs
    fn pack_key(&self, address: &DeviceAddress) -> Option<String>;
}

/// Instantiate the codec a device configuration asks for
pub fn build_codec(config: &DeviceConfig) -> Arc<dyn Codec> {
    match config.protocol {
        Protocol::ModbusTcp | Protocol::ModbusUdp => Arc::new(ModbusCodec::new(
            config.protocol,
            ModbusFraming::Tcp,
            config.modbus.clone(),
        )),
        Protocol::ModbusRtu | Protocol::ModbusRtuOverTcp => Arc::new(ModbusCodec::new(
            config.protocol,
            ModbusFraming::Rtu,
            config.modbus.clone(),
        )),
        Protocol::S7 => Arc::new(S7Codec::new(config.s7.clone())),
        Protocol::Dlt645 => Arc::new(Dlt645Codec::new(config.dlt645.clone())),
    }
}

pub(crate) fn wrong_address(protocol: Protocol, address: &DeviceAddress) -> LinkError {
    LinkError::argument(format!("{} codec cannot use address {}", protocol, address))
}
