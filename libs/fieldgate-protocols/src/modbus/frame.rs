//! Modbus ADU framing: MBAP for TCP/UDP, CRC-16 for RTU

use fieldgate_link::{FrameFormat, HeaderDecision, LinkError, Result};
use serde::{Deserialize, Serialize};

use super::constants::{
    FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL,
    FC_WRITE_SINGLE_REGISTER, MAX_MBAP_LENGTH, MBAP_HEADER_LEN,
};

/// Which ADU wraps the PDU, independent of the transport carrying it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusFraming {
    Tcp,
    Rtu,
}

/// CRC-16/MODBUS: init 0xFFFF, reflected polynomial 0xA001
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// MBAP header + unit id + PDU
pub fn encode_tcp(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

/// Unit id + PDU + CRC, low byte first
pub fn encode_rtu(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 3);
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

/// Unit id and PDU of a complete, validated ADU
pub fn split_adu(framing: ModbusFraming, frame: &[u8]) -> Result<(u8, &[u8])> {
    match framing {
        ModbusFraming::Tcp if frame.len() > MBAP_HEADER_LEN + 1 => {
            Ok((frame[MBAP_HEADER_LEN], &frame[MBAP_HEADER_LEN + 1..]))
        },
        ModbusFraming::Rtu if frame.len() >= 4 => Ok((frame[0], &frame[1..frame.len() - 2])),
        _ => Err(LinkError::protocol(format!(
            "Modbus frame too short: {} bytes",
            frame.len()
        ))),
    }
}

/// MBAP reassembly; the transaction id is the correlation sign
#[derive(Debug, Default)]
pub struct ModbusTcpFormat;

impl FrameFormat for ModbusTcpFormat {
    fn name(&self) -> &'static str {
        "modbus-tcp"
    }

    fn header_len(&self) -> usize {
        MBAP_HEADER_LEN
    }

    fn parse_header(&self, header: &[u8]) -> HeaderDecision {
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
        // Unit id plus at least a function code and one data byte
        if protocol_id != 0 || !(2..=MAX_MBAP_LENGTH).contains(&length) {
            return HeaderDecision::Skip(1);
        }
        HeaderDecision::Body(length)
    }

    fn sign(&self, frame: &[u8]) -> Option<u32> {
        Some(u32::from(u16::from_be_bytes([frame[0], frame[1]])))
    }
}

/// RTU reassembly from the response shape of each function code
#[derive(Debug, Default)]
pub struct ModbusRtuFormat;

impl FrameFormat for ModbusRtuFormat {
    fn name(&self) -> &'static str {
        "modbus-rtu"
    }

    /// Unit id, function code, and the byte count or first data byte
    fn header_len(&self) -> usize {
        3
    }

    fn parse_header(&self, header: &[u8]) -> HeaderDecision {
        let fc = header[1];
        if fc & 0x80 != 0 {
            // unit, fc, exception code, crc
            return HeaderDecision::Body(2);
        }
        match fc {
            0x01..=0x04 => HeaderDecision::Body(usize::from(header[2]) + 2),
            FC_WRITE_SINGLE_COIL
            | FC_WRITE_SINGLE_REGISTER
            | FC_WRITE_MULTIPLE_COILS
            | FC_WRITE_MULTIPLE_REGISTERS => HeaderDecision::Body(5),
            _ => HeaderDecision::Skip(1),
        }
    }

    fn validate(&self, frame: &[u8]) -> bool {
        let Some(split) = frame.len().checked_sub(2) else {
            return false;
        };
        let (data, crc) = frame.split_at(split);
        crc16(data) == u16::from_le_bytes([crc[0], crc[1]])
    }
}
