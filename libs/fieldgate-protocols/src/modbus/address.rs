//! Modbus address grammar
//!
//! `[s=<station>;][w=<fc>;]<area><offset>[:<bit>]`, tokens in any order.
//! The area digit picks the table, the offset is 1-based in text and 0-based
//! on the wire, so `400045` is holding register 44.

use fieldgate_link::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::constants::{
    FC_READ_COILS, FC_READ_DISCRETE_INPUTS, FC_READ_HOLDING_REGISTERS, FC_READ_INPUT_REGISTERS,
    FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_COIL,
    FC_WRITE_SINGLE_REGISTER,
};

/// The four Modbus data tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusArea {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl ModbusArea {
    fn from_prefix(c: char) -> Option<Self> {
        match c {
            '0' => Some(ModbusArea::Coil),
            '1' => Some(ModbusArea::DiscreteInput),
            '3' => Some(ModbusArea::InputRegister),
            '4' => Some(ModbusArea::HoldingRegister),
            _ => None,
        }
    }

    pub fn prefix(&self) -> char {
        match self {
            ModbusArea::Coil => '0',
            ModbusArea::DiscreteInput => '1',
            ModbusArea::InputRegister => '3',
            ModbusArea::HoldingRegister => '4',
        }
    }

    pub fn read_function(&self) -> u8 {
        match self {
            ModbusArea::Coil => FC_READ_COILS,
            ModbusArea::DiscreteInput => FC_READ_DISCRETE_INPUTS,
            ModbusArea::InputRegister => FC_READ_INPUT_REGISTERS,
            ModbusArea::HoldingRegister => FC_READ_HOLDING_REGISTERS,
        }
    }

    /// Coils and discrete inputs hold one bit per element
    pub fn is_bit_area(&self) -> bool {
        matches!(self, ModbusArea::Coil | ModbusArea::DiscreteInput)
    }

    pub fn is_writable(&self) -> bool {
        matches!(self, ModbusArea::Coil | ModbusArea::HoldingRegister)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModbusAddress {
    pub station: u8,
    pub area: ModbusArea,
    /// 0-based wire offset
    pub start: u16,
    /// Bit inside a register, 0 = least significant
    pub bit: Option<u8>,
    /// Forced write function (`w=`)
    pub write_function: Option<u8>,
}

impl ModbusAddress {
    /// Parse address text; `station` is used when the text has no `s=` token
    pub fn parse(text: &str, station: Option<&str>) -> Result<Self> {
        let mut text_station = None;
        let mut write_function = None;
        let mut location = None;

        for token in text.split(';').map(str::trim).filter(|t| !t.is_empty()) {
            let lower = token.to_ascii_lowercase();
            if let Some(value) = lower.strip_prefix("s=") {
                text_station = Some(parse_station(value)?);
            } else if let Some(value) = lower.strip_prefix("w=") {
                let fc = value.trim().parse::<u8>().map_err(|_| {
                    LinkError::argument(format!("Invalid write function '{}' in '{}'", value, text))
                })?;
                write_function = Some(fc);
            } else if location.replace(token).is_some() {
                return Err(LinkError::argument(format!(
                    "Address '{}' names more than one location",
                    text
                )));
            }
        }

        let location = location
            .ok_or_else(|| LinkError::argument(format!("Address '{}' has no location", text)))?;
        let (area, start, bit) = parse_location(location)?;

        let station = match (text_station, station.map(str::trim).filter(|s| !s.is_empty())) {
            (Some(s), _) => s,
            (None, Some(s)) => parse_station(s)?,
            (None, None) => 1,
        };

        if let Some(fc) = write_function {
            let allowed = match area {
                ModbusArea::Coil => [FC_WRITE_SINGLE_COIL, FC_WRITE_MULTIPLE_COILS],
                ModbusArea::HoldingRegister => {
                    [FC_WRITE_SINGLE_REGISTER, FC_WRITE_MULTIPLE_REGISTERS]
                },
                _ => {
                    return Err(LinkError::argument(format!(
                        "Address '{}' is read-only, w={} not allowed",
                        text, fc
                    )))
                },
            };
            if !allowed.contains(&fc) {
                return Err(LinkError::argument(format!(
                    "Write function {} does not apply to '{}'",
                    fc, text
                )));
            }
        }

        Ok(Self {
            station,
            area,
            start,
            bit,
            write_function,
        })
    }

    pub fn read_function(&self) -> u8 {
        self.area.read_function()
    }

    /// Function code that writes `count` elements starting here
    pub fn write_function(&self, count: usize) -> Result<u8> {
        let (single, multiple) = match self.area {
            ModbusArea::Coil => (FC_WRITE_SINGLE_COIL, FC_WRITE_MULTIPLE_COILS),
            ModbusArea::HoldingRegister => (FC_WRITE_SINGLE_REGISTER, FC_WRITE_MULTIPLE_REGISTERS),
            _ => {
                return Err(LinkError::argument(format!("{} is read-only", self)));
            },
        };

        match self.write_function {
            Some(fc) if fc == single && count != 1 => Err(LinkError::argument(format!(
                "FC{:02} writes one element, {} requested at {}",
                fc, count, self
            ))),
            Some(fc) => Ok(fc),
            None if count == 1 => Ok(single),
            None => Ok(multiple),
        }
    }

    /// Address `elements` further on, bit index dropped
    pub fn offset_by(&self, elements: u32) -> Result<Self> {
        let start = u32::from(self.start) + elements;
        let start = u16::try_from(start)
            .map_err(|_| LinkError::argument(format!("{} + {} is out of range", self, elements)))?;
        Ok(Self {
            start,
            bit: None,
            ..self.clone()
        })
    }
}

impl fmt::Display for ModbusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s={};", self.station)?;
        if let Some(fc) = self.write_function {
            write!(f, "w={};", fc)?;
        }
        write!(f, "{}{:05}", self.area.prefix(), u32::from(self.start) + 1)?;
        if let Some(bit) = self.bit {
            write!(f, ":{}", bit)?;
        }
        Ok(())
    }
}

fn parse_station(text: &str) -> Result<u8> {
    text.trim()
        .parse::<u8>()
        .map_err(|_| LinkError::argument(format!("Invalid station '{}'", text)))
}

fn parse_location(token: &str) -> Result<(ModbusArea, u16, Option<u8>)> {
    let mut chars = token.chars();
    let area = chars
        .next()
        .and_then(ModbusArea::from_prefix)
        .ok_or_else(|| LinkError::argument(format!("Unknown Modbus area in '{}'", token)))?;
    let rest = chars.as_str();

    let (offset_text, bit_text) = match rest.find([':', '.']) {
        Some(i) => (&rest[..i], Some(&rest[i + 1..])),
        None => (rest, None),
    };

    let offset = offset_text
        .parse::<u32>()
        .ok()
        .filter(|o| (1..=65536).contains(o))
        .ok_or_else(|| LinkError::argument(format!("Invalid offset in '{}'", token)))?;

    let bit = match bit_text {
        None => None,
        Some(_) if area.is_bit_area() => {
            return Err(LinkError::argument(format!(
                "Bit index not allowed on bit area '{}'",
                token
            )))
        },
        Some(b) => Some(
            b.parse::<u8>()
                .ok()
                .filter(|b| *b <= 15)
                .ok_or_else(|| LinkError::argument(format!("Bit index out of range in '{}'", token)))?,
        ),
    };

    Ok((area, (offset - 1) as u16, bit))
}
