//! Modbus codec: ADU assembly and response validation

use fieldgate_link::{Frame, FrameFormat, FrameMatcher, LinkError, Result};
use std::sync::Arc;
use tracing::debug;

use super::address::{ModbusAddress, ModbusArea};
use super::constants::{FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER};
use super::frame::{encode_rtu, encode_tcp, split_adu, ModbusFraming, ModbusRtuFormat, ModbusTcpFormat};
use super::pdu::{self, ModbusPdu};
use crate::codec::{wrong_address, Codec, DeviceAddress, ElementLayout, Operation, Protocol};
use crate::config::ModbusOptions;

#[derive(Debug, Clone)]
pub struct ModbusCodec {
    protocol: Protocol,
    framing: ModbusFraming,
    options: ModbusOptions,
}

impl ModbusCodec {
    pub fn new(protocol: Protocol, framing: ModbusFraming, options: ModbusOptions) -> Self {
        Self {
            protocol,
            framing,
            options,
        }
    }

    pub fn framing(&self) -> ModbusFraming {
        self.framing
    }

    fn address<'a>(&self, address: &'a DeviceAddress) -> Result<&'a ModbusAddress> {
        match address {
            DeviceAddress::Modbus(a) => Ok(a),
            other => Err(wrong_address(self.protocol, other)),
        }
    }

    fn limit(&self, area: ModbusArea, write: bool) -> u16 {
        match (area.is_bit_area(), write) {
            (true, false) => self.options.max_read_bits,
            (false, false) => self.options.max_read_registers,
            (true, true) => self.options.max_write_bits,
            (false, true) => self.options.max_write_registers,
        }
    }

    fn check_count(&self, address: &ModbusAddress, count: usize, write: bool) -> Result<()> {
        let limit = usize::from(self.limit(address.area, write));
        if count == 0 || count > limit {
            return Err(LinkError::argument(format!(
                "{} elements at {} (allowed 1..={})",
                count, address, limit
            )));
        }
        Ok(())
    }

    fn build_pdu(&self, address: &ModbusAddress, op: &Operation) -> Result<ModbusPdu> {
        match op {
            Operation::Read { count } => {
                self.check_count(address, usize::from(*count), false)?;
                pdu::read_request(address.read_function(), address.start, *count)
            },
            Operation::Write { data } if address.area == ModbusArea::Coil => {
                let values: Vec<bool> = data.iter().map(|b| *b != 0).collect();
                self.build_pdu(address, &Operation::WriteBits { values })
            },
            Operation::Write { data } => {
                if data.len() % 2 != 0 {
                    return Err(LinkError::argument(format!(
                        "Register write at {} needs whole registers, got {} bytes",
                        address,
                        data.len()
                    )));
                }
                self.check_count(address, data.len() / 2, true)?;
                match address.write_function(data.len() / 2)? {
                    FC_WRITE_SINGLE_REGISTER => {
                        pdu::write_single_register(address.start, [data[0], data[1]])
                    },
                    _ => pdu::write_multiple_registers(address.start, data),
                }
            },
            Operation::WriteBits { values } => {
                if address.area != ModbusArea::Coil {
                    return Err(LinkError::argument(format!(
                        "{} has no native bit write",
                        address
                    )));
                }
                self.check_count(address, values.len(), true)?;
                match address.write_function(values.len())? {
                    FC_WRITE_SINGLE_COIL => pdu::write_single_coil(address.start, values[0]),
                    _ => pdu::write_multiple_coils(address.start, values),
                }
            },
        }
    }

    fn write_count(address: &ModbusAddress, op: &Operation) -> usize {
        match op {
            Operation::Read { count } => usize::from(*count),
            Operation::Write { data } if address.area == ModbusArea::Coil => data.len(),
            Operation::Write { data } => data.len() / 2,
            Operation::WriteBits { values } => values.len(),
        }
    }
}

impl Codec for ModbusCodec {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn frame_format(&self) -> Arc<dyn FrameFormat> {
        match self.framing {
            ModbusFraming::Tcp => Arc::new(ModbusTcpFormat),
            ModbusFraming::Rtu => Arc::new(ModbusRtuFormat),
        }
    }

    fn parse_address(&self, text: &str, station: Option<&str>) -> Result<DeviceAddress> {
        ModbusAddress::parse(text, station).map(DeviceAddress::Modbus)
    }

    fn build_request(
        &self,
        address: &DeviceAddress,
        op: &Operation,
        sign: u32,
    ) -> Result<Vec<u8>> {
        let address = self.address(address)?;
        let pdu = self.build_pdu(address, op)?;
        Ok(match self.framing {
            ModbusFraming::Tcp => encode_tcp(sign as u16, address.station, pdu.as_slice()),
            ModbusFraming::Rtu => encode_rtu(address.station, pdu.as_slice()),
        })
    }

    fn response_matcher(&self, address: &DeviceAddress, _op: &Operation) -> Option<FrameMatcher> {
        let station = self.address(address).ok()?.station;
        match self.framing {
            ModbusFraming::Tcp => None,
            ModbusFraming::Rtu => Some(Arc::new(move |frame: &Frame| {
                frame.as_bytes().first() == Some(&station)
            })),
        }
    }

    fn decode_response(
        &self,
        frame: &Frame,
        address: &DeviceAddress,
        op: &Operation,
    ) -> Result<Vec<u8>> {
        let address = self.address(address)?;
        let (unit, pdu) = split_adu(self.framing, frame.as_bytes())?;
        if unit != address.station {
            return Err(LinkError::protocol(format!(
                "Unit id mismatch: expected {}, got {}",
                address.station, unit
            )));
        }

        let count = Self::write_count(address, op);
        if let Operation::Read { .. } = op {
            let data = pdu::check_response(pdu, address.read_function())?;
            let expected = if address.area.is_bit_area() {
                count.div_ceil(8)
            } else {
                count * 2
            };
            return match data.split_first() {
                Some((&byte_count, values))
                    if usize::from(byte_count) == expected && values.len() == expected =>
                {
                    Ok(values.to_vec())
                },
                _ => Err(LinkError::protocol(format!(
                    "Byte count mismatch at {}: expected {} data bytes, frame carries {}",
                    address,
                    expected,
                    data.len().saturating_sub(1)
                ))),
            };
        }

        let fc = address.write_function(count)?;
        let echo = pdu::check_response(pdu, fc)?;
        if echo.len() < 4 || u16::from_be_bytes([echo[0], echo[1]]) != address.start {
            return Err(LinkError::protocol(format!(
                "Write echo for {} does not match the request",
                address
            )));
        }
        debug!("Modbus write acknowledged: {} x{}", address, count);
        Ok(Vec::new())
    }

    fn bit_reverse(&self, address: &DeviceAddress) -> bool {
        matches!(address, DeviceAddress::Modbus(a) if !a.area.is_bit_area())
    }

    fn layout(&self, address: &DeviceAddress) -> ElementLayout {
        match address {
            DeviceAddress::Modbus(a) if a.area.is_bit_area() => ElementLayout::Bits,
            _ => ElementLayout::Bytes(2),
        }
    }

    fn max_elements(&self, address: &DeviceAddress, write: bool) -> u16 {
        match address {
            DeviceAddress::Modbus(a) => self.limit(a.area, write),
            _ => 0,
        }
    }

    fn check_writable(&self, address: &DeviceAddress) -> Result<()> {
        let a = self.address(address)?;
        if a.area.is_writable() {
            Ok(())
        } else {
            Err(LinkError::argument(format!("{} is read-only", a)))
        }
    }

    fn writes_bits_natively(&self, address: &DeviceAddress, _count: usize) -> bool {
        matches!(address, DeviceAddress::Modbus(a) if a.area == ModbusArea::Coil)
    }

    fn pack_key(&self, address: &DeviceAddress) -> Option<String> {
        let a = self.address(address).ok()?;
        Some(format!("s{}:fc{}", a.station, a.read_function()))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn tcp() -> ModbusCodec {
        ModbusCodec::new(Protocol::ModbusTcp, ModbusFraming::Tcp, ModbusOptions::default())
    }

    fn rtu() -> ModbusCodec {
        ModbusCodec::new(Protocol::ModbusRtu, ModbusFraming::Rtu, ModbusOptions::default())
    }

    fn frame(codec: &ModbusCodec, bytes: Vec<u8>) -> Frame {
        let format = codec.frame_format();
        let sign = format.sign(&bytes);
        Frame::new(bytes, format.header_len(), sign)
    }

    #[test]
    fn test_read_holding_register_request() {
        let codec = tcp();
        let addr = codec.parse_address("400045", None).unwrap();
        let bytes = codec
            .build_request(&addr, &Operation::Read { count: 1 }, 0x0102)
            .unwrap();
        assert_eq!(
            bytes,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x2C, 0x00, 0x01]
        );
    }

    #[test]
    fn test_decode_register_read() {
        let codec = tcp();
        let addr = codec.parse_address("400045", None).unwrap();
        let reply = frame(&codec, encode_tcp(5, 1, &[0x03, 0x02, 0x00, 0x01]));
        let data = codec
            .decode_response(&reply, &addr, &Operation::Read { count: 1 })
            .unwrap();
        assert_eq!(data, vec![0x00, 0x01]);
    }

    #[test]
    fn test_decode_rejects_short_byte_count() {
        let codec = tcp();
        let addr = codec.parse_address("400001", None).unwrap();
        let reply = frame(&codec, encode_tcp(5, 1, &[0x03, 0x02, 0x00, 0x01]));
        let err = codec
            .decode_response(&reply, &addr, &Operation::Read { count: 2 })
            .unwrap_err();
        assert!(matches!(err, LinkError::Protocol(_)));
    }

    #[test]
    fn test_decode_exception() {
        let codec = rtu();
        let addr = codec.parse_address("300001", None).unwrap();
        let reply = frame(&codec, encode_rtu(1, &[0x84, 0x02]));
        let err = codec
            .decode_response(&reply, &addr, &Operation::Read { count: 1 })
            .unwrap_err();
        assert!(err.to_string().contains("Illegal Data Address"), "{}", err);
    }

    #[test]
    fn test_decode_unit_mismatch() {
        let codec = rtu();
        let addr = codec.parse_address("s=2;400001", None).unwrap();
        let reply = frame(&codec, encode_rtu(3, &[0x03, 0x02, 0x00, 0x01]));
        let err = codec
            .decode_response(&reply, &addr, &Operation::Read { count: 1 })
            .unwrap_err();
        assert!(err.to_string().contains("Unit id mismatch"));
    }

    #[test]
    fn test_coil_writes_pick_function() {
        let codec = rtu();
        let addr = codec.parse_address("000020", None).unwrap();

        let single = codec
            .build_request(&addr, &Operation::WriteBits { values: vec![true] }, 0)
            .unwrap();
        assert_eq!(&single[1..6], &[0x05, 0x00, 0x13, 0xFF, 0x00]);

        let multi = codec
            .build_request(
                &addr,
                &Operation::WriteBits {
                    values: vec![true, true, false],
                },
                0,
            )
            .unwrap();
        assert_eq!(&multi[1..8], &[0x0F, 0x00, 0x13, 0x00, 0x03, 0x01, 0x03]);
    }

    #[test]
    fn test_register_writes_pick_function() {
        let codec = tcp();
        let addr = codec.parse_address("400002", None).unwrap();
        let single = codec
            .build_request(&addr, &Operation::Write { data: vec![0x12, 0x34] }, 1)
            .unwrap();
        assert_eq!(&single[7..], &[0x06, 0x00, 0x01, 0x12, 0x34]);

        let forced = codec.parse_address("w=16;400002", None).unwrap();
        let multi = codec
            .build_request(&forced, &Operation::Write { data: vec![0x12, 0x34] }, 1)
            .unwrap();
        assert_eq!(&multi[7..], &[0x10, 0x00, 0x01, 0x00, 0x01, 0x02, 0x12, 0x34]);

        assert!(codec
            .build_request(&addr, &Operation::Write { data: vec![0x12] }, 1)
            .is_err());
    }

    #[test]
    fn test_write_echo_checked() {
        let codec = rtu();
        let addr = codec.parse_address("400002", None).unwrap();
        let op = Operation::Write {
            data: vec![0x00, 0x07],
        };
        let ack = frame(&codec, encode_rtu(1, &[0x06, 0x00, 0x01, 0x00, 0x07]));
        assert!(codec.decode_response(&ack, &addr, &op).unwrap().is_empty());

        let wrong = frame(&codec, encode_rtu(1, &[0x06, 0x00, 0x09, 0x00, 0x07]));
        assert!(codec.decode_response(&wrong, &addr, &op).is_err());
    }

    #[test]
    fn test_read_only_and_limits() {
        let codec = tcp();
        let input = codec.parse_address("300001", None).unwrap();
        assert!(codec.check_writable(&input).is_err());
        assert!(codec
            .build_request(&input, &Operation::Read { count: 126 }, 1)
            .is_err());
        assert!(codec
            .build_request(&input, &Operation::Read { count: 0 }, 1)
            .is_err());

        let register_bit = codec.parse_address("400001:3", None).unwrap();
        assert!(codec
            .build_request(&register_bit, &Operation::WriteBits { values: vec![true] }, 1)
            .is_err());
        assert!(codec.bit_reverse(&register_bit));
        assert!(!codec.bit_reverse(&codec.parse_address("000001", None).unwrap()));
    }

    #[test]
    fn test_rtu_matcher_checks_station() {
        let codec = rtu();
        let addr = codec.parse_address("s=4;400001", None).unwrap();
        let matcher = codec
            .response_matcher(&addr, &Operation::Read { count: 1 })
            .unwrap();
        assert!(matcher(&frame(&codec, encode_rtu(4, &[0x03, 0x02, 0, 0]))));
        assert!(!matcher(&frame(&codec, encode_rtu(5, &[0x03, 0x02, 0, 0]))));
        assert!(tcp()
            .response_matcher(&addr, &Operation::Read { count: 1 })
            .is_none());
    }
}
