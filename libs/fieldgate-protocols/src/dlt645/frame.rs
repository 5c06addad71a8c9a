//! DLT645-2007 frame layout
//!
//! `68 A0..A5 68 C L DATA CS 16`, optionally preceded by `FE` wake-up bytes.
//! Data bytes travel with 0x33 added; CS is the byte sum from the first 0x68
//! through the last data byte.

use fieldgate_link::{FrameFormat, HeaderDecision, LinkError, Result};

pub const START: u8 = 0x68;
pub const END: u8 = 0x16;
pub const WAKEUP: [u8; 4] = [0xFE; 4];
/// Offset applied to every data byte on the wire
pub const DATA_OFFSET: u8 = 0x33;
/// `68 A0..A5 68 C L`
pub const HEADER_LEN: usize = 10;

pub const CTRL_READ: u8 = 0x11;
pub const CTRL_WRITE: u8 = 0x14;
/// Slave reply bit
pub const CTRL_REPLY: u8 = 0x80;
/// More frames follow
pub const CTRL_FOLLOW: u8 = 0x20;
/// Abnormal reply bit
pub const CTRL_ERROR: u8 = 0x40;

pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Assemble a master frame; `data` is given without the 0x33 offset
pub fn encode(station_wire: [u8; 6], control: u8, data: &[u8], wakeup: bool) -> Result<Vec<u8>> {
    let len = u8::try_from(data.len())
        .map_err(|_| LinkError::argument(format!("DLT645 data too long: {} bytes", data.len())))?;

    let mut frame = Vec::with_capacity(WAKEUP.len() + HEADER_LEN + data.len() + 2);
    if wakeup {
        frame.extend_from_slice(&WAKEUP);
    }
    let start = frame.len();
    frame.push(START);
    frame.extend_from_slice(&station_wire);
    frame.extend_from_slice(&[START, control, len]);
    frame.extend(data.iter().map(|b| b.wrapping_add(DATA_OFFSET)));
    let cs = checksum(&frame[start..]);
    frame.extend_from_slice(&[cs, END]);
    Ok(frame)
}

/// Control code, and data bytes with the 0x33 offset removed
pub fn decode(frame: &[u8]) -> Result<(u8, Vec<u8>)> {
    if frame.len() < HEADER_LEN + 2 || frame[0] != START || frame[7] != START {
        return Err(LinkError::protocol(format!(
            "Malformed DLT645 frame: {} bytes",
            frame.len()
        )));
    }
    let len = usize::from(frame[9]);
    let data = frame
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or_else(|| LinkError::protocol("DLT645 frame shorter than its length byte"))?;
    Ok((
        frame[8],
        data.iter().map(|b| b.wrapping_sub(DATA_OFFSET)).collect(),
    ))
}

pub fn error_description(err: u8) -> String {
    const BITS: [&str; 7] = [
        "Other error",
        "No data requested",
        "Password error or unauthorized",
        "Baud rate cannot be changed",
        "Annual time zones exceeded",
        "Daily time slots exceeded",
        "Tariff count exceeded",
    ];
    let names: Vec<&str> = BITS
        .iter()
        .enumerate()
        .filter(|(i, _)| err & (1 << i) != 0)
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        format!("Unknown error 0x{:02X}", err)
    } else {
        names.join(", ")
    }
}

/// Packed BCD, least significant byte first, to a scaled number
pub fn bcd_to_f64(bytes: &[u8], decimals: u32) -> Result<f64> {
    let mut value: u64 = 0;
    for &b in bytes.iter().rev() {
        let (hi, lo) = (b >> 4, b & 0x0F);
        if hi > 9 || lo > 9 {
            return Err(LinkError::protocol(format!("Invalid BCD byte 0x{:02X}", b)));
        }
        value = value * 100 + u64::from(hi * 10 + lo);
    }
    Ok(value as f64 / 10f64.powi(decimals as i32))
}

#[derive(Debug, Default)]
pub struct Dlt645Format;

impl FrameFormat for Dlt645Format {
    fn name(&self) -> &'static str {
        "dlt645"
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn parse_header(&self, header: &[u8]) -> HeaderDecision {
        if header[0] != START {
            // Jump straight to the next start candidate
            let skip = header[1..]
                .iter()
                .position(|b| *b == START)
                .map_or(header.len(), |i| i + 1);
            return HeaderDecision::Skip(skip);
        }
        if header[7] != START {
            return HeaderDecision::Skip(1);
        }
        HeaderDecision::Body(usize::from(header[9]) + 2)
    }

    fn validate(&self, frame: &[u8]) -> bool {
        match frame {
            [body @ .., cs, END] => checksum(body) == *cs,
            _ => false,
        }
    }
}
