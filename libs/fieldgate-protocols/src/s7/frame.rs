//! ISO-on-TCP framing and S7 message layout
//!
//! Every message is a TPKT (RFC 1006) carrying one COTP TPDU. Data TPDUs
//! (`02 F0 80`) carry an S7 PDU whose 10 or 12 byte header holds the PDU
//! reference used as correlation sign.

use fieldgate_link::{FrameFormat, HeaderDecision, LinkError, Result};

use super::address::S7Address;

pub const TPKT_VERSION: u8 = 3;
pub const TPKT_HEADER_LEN: usize = 4;
/// TPKT + COTP data header
const DATA_PREFIX_LEN: usize = 7;
const S7_PROTOCOL_ID: u8 = 0x32;

const COTP_CONNECT_REQUEST: u8 = 0xE0;
pub const COTP_CONNECT_CONFIRM: u8 = 0xD0;
const COTP_DATA: u8 = 0xF0;

pub const ROSCTR_JOB: u8 = 0x01;
pub const ROSCTR_ACK_DATA: u8 = 0x03;

pub const FUNC_SETUP_COMMUNICATION: u8 = 0xF0;
pub const FUNC_READ_VAR: u8 = 0x04;
pub const FUNC_WRITE_VAR: u8 = 0x05;

/// Item transport sizes
pub const TS_BIT: u8 = 0x01;
pub const TS_BYTE: u8 = 0x02;
/// Data transport sizes
pub const DATA_TS_BIT: u8 = 0x03;
pub const DATA_TS_BYTE: u8 = 0x04;
pub const DATA_TS_OCTET: u8 = 0x09;

/// Return code of a successful item
pub const ITEM_OK: u8 = 0xFF;

/// Offset of the first parameter byte in an ack-data message
pub const ACK_PARAM_OFFSET: usize = DATA_PREFIX_LEN + 12;

pub fn return_code_description(code: u8) -> &'static str {
    match code {
        0x01 => "Hardware fault",
        0x03 => "Accessing the object not allowed",
        0x05 => "Address out of range",
        0x06 => "Data type not supported",
        0x07 => "Data type inconsistent",
        0x0A => "Object does not exist",
        _ => "Unknown return code",
    }
}

/// TPKT reassembly; sign is the PDU reference of S7 data messages
#[derive(Debug, Default)]
pub struct TpktFormat;

impl FrameFormat for TpktFormat {
    fn name(&self) -> &'static str {
        "s7-tpkt"
    }

    fn header_len(&self) -> usize {
        TPKT_HEADER_LEN
    }

    fn parse_header(&self, header: &[u8]) -> HeaderDecision {
        let length = usize::from(u16::from_be_bytes([header[2], header[3]]));
        if header[0] != TPKT_VERSION || !(DATA_PREFIX_LEN..=4096).contains(&length) {
            return HeaderDecision::Skip(1);
        }
        HeaderDecision::Body(length - TPKT_HEADER_LEN)
    }

    fn sign(&self, frame: &[u8]) -> Option<u32> {
        if frame.len() >= 13 && frame[5] == COTP_DATA && frame[7] == S7_PROTOCOL_ID {
            Some(u32::from(u16::from_be_bytes([frame[11], frame[12]])))
        } else {
            None
        }
    }
}

fn tpkt(payload_len: usize) -> Vec<u8> {
    let total = (TPKT_HEADER_LEN + payload_len) as u16;
    let mut frame = Vec::with_capacity(usize::from(total));
    frame.extend_from_slice(&[TPKT_VERSION, 0x00]);
    frame.extend_from_slice(&total.to_be_bytes());
    frame
}

/// TPKT + COTP data + S7 job header
fn job(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
    let mut frame = tpkt(3 + 10 + params.len() + data.len());
    frame.extend_from_slice(&[0x02, COTP_DATA, 0x80]);
    frame.extend_from_slice(&[S7_PROTOCOL_ID, ROSCTR_JOB, 0x00, 0x00]);
    frame.extend_from_slice(&pdu_ref.to_be_bytes());
    frame.extend_from_slice(&(params.len() as u16).to_be_bytes());
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    frame.extend_from_slice(params);
    frame.extend_from_slice(data);
    frame
}

/// COTP connection request, class 0, TPDU size 1024
pub fn connection_request(local_tsap: u16, remote_tsap: u16) -> Vec<u8> {
    let mut frame = tpkt(18);
    frame.extend_from_slice(&[0x11, COTP_CONNECT_REQUEST, 0x00, 0x00, 0x00, 0x01, 0x00]);
    frame.extend_from_slice(&[0xC0, 0x01, 0x0A]);
    frame.extend_from_slice(&[0xC1, 0x02]);
    frame.extend_from_slice(&local_tsap.to_be_bytes());
    frame.extend_from_slice(&[0xC2, 0x02]);
    frame.extend_from_slice(&remote_tsap.to_be_bytes());
    frame
}

pub fn setup_communication(pdu_ref: u16, pdu_length: u16) -> Vec<u8> {
    let mut params = vec![FUNC_SETUP_COMMUNICATION, 0x00, 0x00, 0x01, 0x00, 0x01];
    params.extend_from_slice(&pdu_length.to_be_bytes());
    job(pdu_ref, &params, &[])
}

/// One variable specification: `12 0A 10 ts len db area addr`
fn var_spec(address: &S7Address, transport_size: u8, length: u16) -> [u8; 12] {
    let location = if address.area.is_numbered() {
        address.start
    } else {
        address.start * 8 + u32::from(address.bit.unwrap_or(0))
    };
    let [_, a0, a1, a2] = location.to_be_bytes();
    let [l0, l1] = length.to_be_bytes();
    let [d0, d1] = address.db.to_be_bytes();
    [
        0x12,
        0x0A,
        0x10,
        transport_size,
        l0,
        l1,
        d0,
        d1,
        address.area.code(),
        a0,
        a1,
        a2,
    ]
}

fn item_transport_size(address: &S7Address, single_bit: bool) -> u8 {
    if address.area.is_numbered() {
        address.area.code()
    } else if single_bit {
        TS_BIT
    } else {
        TS_BYTE
    }
}

/// Read `count` elements; a bit address with count 1 reads that single bit
pub fn read_request(pdu_ref: u16, address: &S7Address, count: u16) -> Vec<u8> {
    let single_bit = address.bit.is_some() && count == 1;
    let mut params = vec![FUNC_READ_VAR, 0x01];
    params.extend_from_slice(&var_spec(
        address,
        item_transport_size(address, single_bit),
        count,
    ));
    job(pdu_ref, &params, &[])
}

/// Write raw element bytes, or one bit when `address` names a bit
pub fn write_request(pdu_ref: u16, address: &S7Address, data: &[u8]) -> Vec<u8> {
    let single_bit = address.bit.is_some();
    let count = if single_bit {
        1
    } else {
        (data.len() / address.element_size()) as u16
    };

    let mut params = vec![FUNC_WRITE_VAR, 0x01];
    params.extend_from_slice(&var_spec(
        address,
        item_transport_size(address, single_bit),
        count,
    ));

    let (data_ts, length) = if single_bit {
        (DATA_TS_BIT, 1)
    } else if address.area.is_numbered() {
        (DATA_TS_OCTET, data.len() as u16)
    } else {
        (DATA_TS_BYTE, (data.len() * 8) as u16)
    };
    let mut payload = vec![0x00, data_ts];
    payload.extend_from_slice(&length.to_be_bytes());
    payload.extend_from_slice(data);

    job(pdu_ref, &params, &payload)
}

/// Parameter and data blocks of an ack-data message, header errors surfaced
pub fn ack_data(frame: &[u8]) -> Result<(&[u8], &[u8])> {
    if frame.len() < ACK_PARAM_OFFSET || frame[7] != S7_PROTOCOL_ID {
        return Err(LinkError::protocol(format!(
            "Not an S7 message: {} bytes",
            frame.len()
        )));
    }
    if frame[8] != ROSCTR_ACK_DATA {
        return Err(LinkError::protocol(format!(
            "Unexpected S7 message type 0x{:02X}",
            frame[8]
        )));
    }
    let (class, code) = (frame[17], frame[18]);
    if class != 0 || code != 0 {
        return Err(LinkError::protocol(format!(
            "S7 error class 0x{:02X} code 0x{:02X}",
            class, code
        )));
    }

    let param_len = usize::from(u16::from_be_bytes([frame[13], frame[14]]));
    let data_len = usize::from(u16::from_be_bytes([frame[15], frame[16]]));
    let data_start = ACK_PARAM_OFFSET + param_len;
    if frame.len() < data_start + data_len {
        return Err(LinkError::protocol("Truncated S7 ack-data message"));
    }
    Ok((
        &frame[ACK_PARAM_OFFSET..data_start],
        &frame[data_start..data_start + data_len],
    ))
}

/// Value bytes of a single-item read response
pub fn read_response(frame: &[u8]) -> Result<Vec<u8>> {
    let (params, data) = ack_data(frame)?;
    if params.first() != Some(&FUNC_READ_VAR) {
        return Err(LinkError::protocol("S7 response is not a read-var ack"));
    }
    if data.len() < 4 {
        return Err(LinkError::protocol("S7 read response carries no item"));
    }
    if data[0] != ITEM_OK {
        return Err(LinkError::protocol(format!(
            "S7 read failed: {} (0x{:02X})",
            return_code_description(data[0]),
            data[0]
        )));
    }

    let length = usize::from(u16::from_be_bytes([data[2], data[3]]));
    let bytes = match data[1] {
        DATA_TS_BIT | DATA_TS_BYTE => length.div_ceil(8),
        _ => length,
    };
    data.get(4..4 + bytes)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| LinkError::protocol("S7 read item shorter than its declared length"))
}

pub fn write_response(frame: &[u8]) -> Result<()> {
    let (params, data) = ack_data(frame)?;
    if params.first() != Some(&FUNC_WRITE_VAR) {
        return Err(LinkError::protocol("S7 response is not a write-var ack"));
    }
    match data.first() {
        Some(&ITEM_OK) => Ok(()),
        Some(&code) => Err(LinkError::protocol(format!(
            "S7 write failed: {} (0x{:02X})",
            return_code_description(code),
            code
        ))),
        None => Err(LinkError::protocol("S7 write response carries no item")),
    }
}
