//! DLT645-2007 address: meter station plus data identifier
//!
//! `[s=<station>;]<DI>`. The station is up to 12 BCD digits (left padded
//! with zeros, `A` for wildcard digits); the DI is 8 hex digits.

use fieldgate_link::{LinkError, Result};
use std::fmt;

/// Station used when neither the text nor the device names one
pub const BROADCAST_STATION: &str = "AAAAAAAAAAAA";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dlt645Address {
    /// Station digits as written, most significant byte first
    pub station: [u8; 6],
    /// Data identifier DI3..DI0
    pub di: u32,
}

impl Dlt645Address {
    pub fn parse(text: &str, station: Option<&str>) -> Result<Self> {
        let mut text_station = None;
        let mut di = None;

        for token in text.split(';').map(str::trim).filter(|t| !t.is_empty()) {
            let lower = token.to_ascii_lowercase();
            if let Some(value) = lower.strip_prefix("s=") {
                text_station = Some(parse_station(value)?);
            } else if di.replace(parse_di(token)?).is_some() {
                return Err(LinkError::argument(format!(
                    "Address '{}' names more than one data identifier",
                    text
                )));
            }
        }

        let di = di.ok_or_else(|| {
            LinkError::argument(format!("Address '{}' has no data identifier", text))
        })?;
        let station = match (text_station, station.map(str::trim).filter(|s| !s.is_empty())) {
            (Some(s), _) => s,
            (None, Some(s)) => parse_station(s)?,
            (None, None) => parse_station(BROADCAST_STATION)?,
        };

        Ok(Self { station, di })
    }

    /// Station bytes in wire order, least significant first
    pub fn station_wire(&self) -> [u8; 6] {
        let mut wire = self.station;
        wire.reverse();
        wire
    }

    /// DI bytes in wire order (DI0 first), before the +0x33 offset
    pub fn di_wire(&self) -> [u8; 4] {
        self.di.to_le_bytes()
    }

    /// Any wildcard digit; such requests are answered by whichever meter listens
    pub fn is_wildcard(&self) -> bool {
        self.station
            .iter()
            .any(|b| b & 0xF0 == 0xA0 || b & 0x0F == 0x0A)
    }
}

fn parse_station(text: &str) -> Result<[u8; 6]> {
    let digits = text.trim();
    let valid = !digits.is_empty()
        && digits.len() <= 12
        && digits
            .chars()
            .all(|c| c.is_ascii_digit() || c.eq_ignore_ascii_case(&'a'));
    if !valid {
        return Err(LinkError::argument(format!(
            "Invalid DLT645 station '{}'",
            text
        )));
    }

    let padded = format!("{:0>12}", digits);
    let mut station = [0u8; 6];
    for (i, pair) in padded.as_bytes().chunks_exact(2).enumerate() {
        station[i] = (nibble(pair[0]) << 4) | nibble(pair[1]);
    }
    Ok(station)
}

fn nibble(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        _ => 0x0A,
    }
}

fn parse_di(text: &str) -> Result<u32> {
    if text.len() != 8 || !text.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(LinkError::argument(format!(
            "DLT645 data identifier '{}' must be 8 hex digits",
            text
        )));
    }
    u32::from_str_radix(text, 16)
        .map_err(|_| LinkError::argument(format!("Invalid DLT645 data identifier '{}'", text)))
}

impl fmt::Display for Dlt645Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("s=")?;
        for b in self.station {
            write!(f, "{:02X}", b)?;
        }
        write!(f, ";{:08X}", self.di)
    }
}
