//! Siemens S7 address grammar
//!
//! - `DB<n>.DBX<byte>.<bit>`, `DB<n>.DBB<byte>`, `DB<n>.DBW<byte>`, `DB<n>.DBD<byte>`
//! - `M`, `I`/`E`, `Q`/`A` followed by `B|W|D<byte>` or `<byte>.<bit>`
//! - `V<byte>` (S7-200 Smart variable memory, mapped to DB1)
//! - `T<n>`, `C<n>`

use fieldgate_link::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum S7Area {
    Inputs,
    Outputs,
    Flags,
    DataBlock,
    Counters,
    Timers,
}

impl S7Area {
    /// Area byte of a variable specification
    pub fn code(&self) -> u8 {
        match self {
            S7Area::Inputs => 0x81,
            S7Area::Outputs => 0x82,
            S7Area::Flags => 0x83,
            S7Area::DataBlock => 0x84,
            S7Area::Counters => 0x1C,
            S7Area::Timers => 0x1D,
        }
    }

    /// Timers and counters are addressed by number, two bytes each
    pub fn is_numbered(&self) -> bool {
        matches!(self, S7Area::Counters | S7Area::Timers)
    }

    fn letter(&self) -> &'static str {
        match self {
            S7Area::Inputs => "I",
            S7Area::Outputs => "Q",
            S7Area::Flags => "M",
            S7Area::DataBlock => "DB",
            S7Area::Counters => "C",
            S7Area::Timers => "T",
        }
    }
}

/// Width named in the address text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum S7Width {
    Bit,
    Byte,
    Word,
    DWord,
}

impl S7Width {
    fn from_letter(c: char) -> Option<Self> {
        match c {
            'X' => Some(S7Width::Bit),
            'B' => Some(S7Width::Byte),
            'W' => Some(S7Width::Word),
            'D' => Some(S7Width::DWord),
            _ => None,
        }
    }

    fn letter(&self) -> char {
        match self {
            S7Width::Bit => 'X',
            S7Width::Byte => 'B',
            S7Width::Word => 'W',
            S7Width::DWord => 'D',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct S7Address {
    pub area: S7Area,
    /// Data block number, 0 outside `DataBlock`
    pub db: u16,
    /// Byte offset, or timer/counter number
    pub start: u32,
    pub bit: Option<u8>,
    pub width: S7Width,
}

impl S7Address {
    pub fn parse(text: &str) -> Result<Self> {
        let upper = text.trim().to_ascii_uppercase();
        let invalid = || LinkError::argument(format!("Invalid S7 address '{}'", text));

        if let Some(rest) = upper.strip_prefix("DB") {
            let (db, item) = rest.split_once('.').ok_or_else(invalid)?;
            let db = db.parse::<u16>().ok().filter(|n| *n > 0).ok_or_else(invalid)?;
            let item = item.strip_prefix("DB").ok_or_else(invalid)?;
            if !item.starts_with(['X', 'B', 'W', 'D']) {
                return Err(invalid());
            }
            return parse_item(S7Area::DataBlock, db, item).ok_or_else(invalid);
        }

        let mut chars = upper.chars();
        let head = chars.next().ok_or_else(invalid)?;
        let item = chars.as_str();
        let parsed = match head {
            'V' => parse_item(S7Area::DataBlock, 1, item),
            'M' => parse_item(S7Area::Flags, 0, item),
            'I' | 'E' => parse_item(S7Area::Inputs, 0, item),
            'Q' | 'A' => parse_item(S7Area::Outputs, 0, item),
            'T' => parse_numbered(S7Area::Timers, item),
            'C' | 'Z' => parse_numbered(S7Area::Counters, item),
            _ => None,
        };
        parsed.ok_or_else(invalid)
    }

    /// Bytes one element occupies
    pub fn element_size(&self) -> usize {
        if self.area.is_numbered() {
            2
        } else {
            1
        }
    }

    /// Address `elements` further on, bit index dropped
    pub fn offset_by(&self, elements: u32) -> Result<Self> {
        let start = self
            .start
            .checked_add(elements)
            .filter(|s| *s <= MAX_BYTE_OFFSET)
            .ok_or_else(|| LinkError::argument(format!("{} + {} is out of range", self, elements)))?;
        Ok(Self {
            start,
            bit: None,
            width: if self.area.is_numbered() {
                self.width
            } else {
                S7Width::Byte
            },
            ..self.clone()
        })
    }
}

/// Byte offsets travel as a 21-bit byte number in the 3-byte bit address
const MAX_BYTE_OFFSET: u32 = 0x1F_FFFF;

fn parse_item(area: S7Area, db: u16, item: &str) -> Option<S7Address> {
    let mut chars = item.chars();
    let width = chars.clone().next().and_then(S7Width::from_letter);
    if width.is_some() {
        chars.next();
    }
    let numbers = chars.as_str();

    let (byte, bit) = match numbers.split_once('.') {
        Some((byte, bit)) => (byte, Some(bit.parse::<u8>().ok().filter(|b| *b <= 7)?)),
        None => (numbers, None),
    };
    let start = byte.parse::<u32>().ok().filter(|s| *s <= MAX_BYTE_OFFSET)?;

    let width = match (width, bit) {
        (Some(S7Width::Bit), Some(_)) | (None, Some(_)) => S7Width::Bit,
        (Some(S7Width::Bit), None) => return None,
        (Some(_), Some(_)) => return None,
        (Some(w), None) => w,
        (None, None) => S7Width::Byte,
    };

    Some(S7Address {
        area,
        db,
        start,
        bit,
        width,
    })
}

fn parse_numbered(area: S7Area, item: &str) -> Option<S7Address> {
    let start = item.parse::<u16>().ok()?;
    Some(S7Address {
        area,
        db: 0,
        start: u32::from(start),
        bit: None,
        width: S7Width::Word,
    })
}

impl fmt::Display for S7Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.area {
            S7Area::DataBlock => write!(f, "DB{}.DB{}{}", self.db, self.width.letter(), self.start)?,
            S7Area::Timers | S7Area::Counters => return write!(f, "{}{}", self.area.letter(), self.start),
            _ if self.width == S7Width::Bit => write!(f, "{}{}", self.area.letter(), self.start)?,
            _ => write!(f, "{}{}{}", self.area.letter(), self.width.letter(), self.start)?,
        }
        if let Some(bit) = self.bit {
            write!(f, ".{}", bit)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_data_block_forms() {
        let bit = S7Address::parse("DB10.DBX4.3").unwrap();
        assert_eq!((bit.area, bit.db, bit.start, bit.bit), (S7Area::DataBlock, 10, 4, Some(3)));

        let word = S7Address::parse("db1.dbw20").unwrap();
        assert_eq!((word.db, word.start, word.width), (1, 20, S7Width::Word));

        assert_eq!(S7Address::parse("DB2.DBD8").unwrap().width, S7Width::DWord);
        assert_eq!(S7Address::parse("DB2.DBB8").unwrap().width, S7Width::Byte);
    }

    #[test]
    fn test_memory_areas() {
        let m = S7Address::parse("M10.7").unwrap();
        assert_eq!((m.area, m.start, m.bit), (S7Area::Flags, 10, Some(7)));

        assert_eq!(S7Address::parse("MW4").unwrap().width, S7Width::Word);
        assert_eq!(S7Address::parse("E0.1").unwrap().area, S7Area::Inputs);
        assert_eq!(S7Address::parse("AB3").unwrap().area, S7Area::Outputs);
        assert_eq!(S7Address::parse("Q0.0").unwrap().area, S7Area::Outputs);

        let v = S7Address::parse("V100").unwrap();
        assert_eq!((v.area, v.db, v.start), (S7Area::DataBlock, 1, 100));
    }

    #[test]
    fn test_timers_and_counters() {
        let t = S7Address::parse("T5").unwrap();
        assert_eq!((t.area, t.start, t.element_size()), (S7Area::Timers, 5, 2));
        assert_eq!(S7Address::parse("C12").unwrap().area, S7Area::Counters);
        assert!(S7Address::parse("T5.1").is_err());
    }

    #[test]
    fn test_rejects_malformed() {
        for text in [
            "", "DB0.DBW0", "DB1", "DB1.DBX4", "DB1.DBW4.1", "DB1.10", "M10.8", "X10", "MWx",
        ] {
            assert!(S7Address::parse(text).is_err(), "{}", text);
        }
    }

    #[test]
    fn test_display_round_trip() {
        for text in ["DB1.DBX4.3", "DB7.DBW2", "M10.7", "MW4", "IB0", "Q1.1", "T3", "C9"] {
            let addr = S7Address::parse(text).unwrap();
            assert_eq!(addr.to_string(), text);
            assert_eq!(S7Address::parse(&addr.to_string()).unwrap(), addr);
        }
    }

    #[test]
    fn test_offset_by_drops_bit() {
        let addr = S7Address::parse("DB1.DBX4.3").unwrap();
        let next = addr.offset_by(2).unwrap();
        assert_eq!((next.start, next.bit, next.width), (6, None, S7Width::Byte));
    }
}
