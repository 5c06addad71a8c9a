//! Typed values on top of raw device bytes
//!
//! Device memory is read as big-endian element bytes. Multi-byte values are
//! brought into canonical big-endian order with a [`ByteOrder`] before being
//! decoded, and put back into device order after being encoded.

use fieldgate_link::bytes::ByteOrder;
use fieldgate_link::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Byte,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    /// Fixed-width text, NUL padded
    String(usize),
}

impl DataType {
    /// Bytes one value occupies in device memory (booleans count as one)
    pub fn byte_len(&self) -> usize {
        match self {
            DataType::Boolean | DataType::Byte => 1,
            DataType::Int16 | DataType::UInt16 => 2,
            DataType::Int32 | DataType::UInt32 | DataType::Float => 4,
            DataType::Int64 | DataType::UInt64 | DataType::Double => 8,
            DataType::String(len) => *len,
        }
    }

    /// Parse the usual spellings (`uint16`, `u16`, `float32`, `string:10`, ...)
    pub fn parse(text: &str) -> Result<Self> {
        let lower = text.trim().to_ascii_lowercase();
        if let Some(len) = lower
            .strip_prefix("string:")
            .or_else(|| lower.strip_prefix("string"))
            .filter(|rest| !rest.is_empty())
        {
            let len = len
                .trim_start_matches(':')
                .parse::<usize>()
                .map_err(|_| LinkError::argument(format!("Invalid string length: {}", text)))?;
            return Ok(DataType::String(len));
        }
        match lower.as_str() {
            "bool" | "boolean" | "coil" => Ok(DataType::Boolean),
            "byte" | "u8" | "uint8" => Ok(DataType::Byte),
            "int16" | "i16" => Ok(DataType::Int16),
            "uint16" | "u16" => Ok(DataType::UInt16),
            "int32" | "i32" => Ok(DataType::Int32),
            "uint32" | "u32" => Ok(DataType::UInt32),
            "int64" | "i64" => Ok(DataType::Int64),
            "uint64" | "u64" => Ok(DataType::UInt64),
            "float" | "float32" | "f32" => Ok(DataType::Float),
            "double" | "float64" | "f64" => Ok(DataType::Double),
            _ => Err(LinkError::argument(format!("Unknown data type: {}", text))),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => f.write_str("boolean"),
            DataType::Byte => f.write_str("byte"),
            DataType::Int16 => f.write_str("int16"),
            DataType::UInt16 => f.write_str("uint16"),
            DataType::Int32 => f.write_str("int32"),
            DataType::UInt32 => f.write_str("uint32"),
            DataType::Int64 => f.write_str("int64"),
            DataType::UInt64 => f.write_str("uint64"),
            DataType::Float => f.write_str("float"),
            DataType::Double => f.write_str("double"),
            DataType::String(len) => write!(f, "string:{}", len),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::U8(v) => Some(f64::from(*v)),
            Value::I16(v) => Some(f64::from(*v)),
            Value::U16(v) => Some(f64::from(*v)),
            Value::I32(v) => Some(f64::from(*v)),
            Value::U32(v) => Some(f64::from(*v)),
            Value::I64(v) => Some(*v as f64),
            Value::U64(v) => Some(*v as f64),
            Value::F32(v) => Some(f64::from(*v)),
            Value::F64(v) => Some(*v),
            Value::String(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "1" => Some(true),
                "false" | "off" | "0" => Some(false),
                _ => None,
            },
            other => other.as_f64().map(|v| v != 0.0),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other.as_f64().unwrap_or_default()),
        }
    }
}

/// Decode `count` values laid out back to back in `bytes`
pub fn decode_values(
    bytes: &[u8],
    data_type: DataType,
    count: usize,
    order: ByteOrder,
) -> Result<Vec<Value>> {
    let width = data_type.byte_len();
    if width == 0 {
        return Err(LinkError::argument("Zero-width data type"));
    }
    let needed = width * count;
    if bytes.len() < needed {
        return Err(LinkError::protocol(format!(
            "Need {} bytes for {} x {}, got {}",
            needed,
            count,
            data_type,
            bytes.len()
        )));
    }

    bytes[..needed]
        .chunks_exact(width)
        .map(|raw| decode_one(raw, data_type, order))
        .collect()
}

fn decode_one(raw: &[u8], data_type: DataType, order: ByteOrder) -> Result<Value> {
    let be = order.reordered(raw);
    let value = match data_type {
        DataType::Boolean => Value::Bool(be[0] != 0),
        DataType::Byte => Value::U8(be[0]),
        DataType::Int16 => Value::I16(i16::from_be_bytes([be[0], be[1]])),
        DataType::UInt16 => Value::U16(u16::from_be_bytes([be[0], be[1]])),
        DataType::Int32 => Value::I32(i32::from_be_bytes(array(&be)?)),
        DataType::UInt32 => Value::U32(u32::from_be_bytes(array(&be)?)),
        DataType::Float => Value::F32(f32::from_be_bytes(array(&be)?)),
        DataType::Int64 => Value::I64(i64::from_be_bytes(array(&be)?)),
        DataType::UInt64 => Value::U64(u64::from_be_bytes(array(&be)?)),
        DataType::Double => Value::F64(f64::from_be_bytes(array(&be)?)),
        DataType::String(_) => {
            let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
            Value::String(String::from_utf8_lossy(&raw[..end]).into_owned())
        },
    };
    Ok(value)
}

fn array<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| LinkError::protocol(format!("Expected {} bytes, got {}", N, bytes.len())))
}

/// Encode one value into device byte order
pub fn encode_value(value: &Value, data_type: DataType, order: ByteOrder) -> Result<Vec<u8>> {
    let number = || {
        value.as_f64().ok_or_else(|| {
            LinkError::argument(format!("Value {} is not numeric for {}", value, data_type))
        })
    };

    let be: Vec<u8> = match data_type {
        DataType::Boolean => {
            let on = value
                .as_bool()
                .ok_or_else(|| LinkError::argument(format!("Value {} is not boolean", value)))?;
            vec![u8::from(on)]
        },
        DataType::Byte => vec![integer(value, number()?, 0.0, f64::from(u8::MAX))? as u8],
        DataType::Int16 => {
            let v = integer(value, number()?, f64::from(i16::MIN), f64::from(i16::MAX))?;
            (v as i16).to_be_bytes().to_vec()
        },
        DataType::UInt16 => {
            let v = integer(value, number()?, 0.0, f64::from(u16::MAX))?;
            (v as u16).to_be_bytes().to_vec()
        },
        DataType::Int32 => {
            let v = integer(value, number()?, f64::from(i32::MIN), f64::from(i32::MAX))?;
            (v as i32).to_be_bytes().to_vec()
        },
        DataType::UInt32 => {
            let v = integer(value, number()?, 0.0, f64::from(u32::MAX))?;
            (v as u32).to_be_bytes().to_vec()
        },
        DataType::Int64 => match value {
            Value::I64(v) => v.to_be_bytes().to_vec(),
            _ => (integer(value, number()?, i64::MIN as f64, i64::MAX as f64)? as i64)
                .to_be_bytes()
                .to_vec(),
        },
        DataType::UInt64 => match value {
            Value::U64(v) => v.to_be_bytes().to_vec(),
            _ => (integer(value, number()?, 0.0, u64::MAX as f64)? as u64)
                .to_be_bytes()
                .to_vec(),
        },
        DataType::Float => (number()? as f32).to_be_bytes().to_vec(),
        DataType::Double => number()?.to_be_bytes().to_vec(),
        DataType::String(len) => {
            let text = value.to_string();
            if text.len() > len {
                return Err(LinkError::argument(format!(
                    "String of {} bytes does not fit {}",
                    text.len(),
                    data_type
                )));
            }
            let mut out = text.into_bytes();
            out.resize(len, 0);
            return Ok(out);
        },
    };

    Ok(order.reordered(&be))
}

fn integer(value: &Value, number: f64, min: f64, max: f64) -> Result<f64> {
    if number.fract() != 0.0 || number < min || number > max {
        return Err(LinkError::argument(format!(
            "Value {} out of range [{}, {}]",
            value, min, max
        )));
    }
    Ok(number)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_data_type_parse() {
        assert_eq!(DataType::parse("UInt16").unwrap(), DataType::UInt16);
        assert_eq!(DataType::parse("f32").unwrap(), DataType::Float);
        assert_eq!(DataType::parse("string:10").unwrap(), DataType::String(10));
        assert!(DataType::parse("quaternion").is_err());
    }

    #[test]
    fn test_decode_with_byte_orders() {
        // 0x12345678 as it arrives from a word-swapped device
        let cdab = [0x56, 0x78, 0x12, 0x34];
        let values = decode_values(&cdab, DataType::UInt32, 1, ByteOrder::BigEndianSwap).unwrap();
        assert_eq!(values, vec![Value::U32(0x1234_5678)]);

        let dcba = [0x78, 0x56, 0x34, 0x12];
        let values = decode_values(&dcba, DataType::UInt32, 1, ByteOrder::LittleEndian).unwrap();
        assert_eq!(values, vec![Value::U32(0x1234_5678)]);
    }

    #[test]
    fn test_decode_several_registers() {
        let raw = [0x00, 0x01, 0xFF, 0xFF];
        let values = decode_values(&raw, DataType::Int16, 2, ByteOrder::BigEndian).unwrap();
        assert_eq!(values, vec![Value::I16(1), Value::I16(-1)]);
        assert!(decode_values(&raw, DataType::Int16, 3, ByteOrder::BigEndian).is_err());
    }

    #[test]
    fn test_encode_float_and_range_checks() {
        let bytes = encode_value(&Value::F64(1.5), DataType::Float, ByteOrder::BigEndian).unwrap();
        assert_eq!(bytes, 1.5f32.to_be_bytes().to_vec());

        let err = encode_value(&Value::I32(70000), DataType::UInt16, ByteOrder::BigEndian)
            .unwrap_err();
        assert!(matches!(err, LinkError::Argument(_)));
        assert!(encode_value(&Value::F64(1.5), DataType::Int16, ByteOrder::BigEndian).is_err());
    }

    #[test]
    fn test_string_round_trip() {
        let bytes = encode_value(
            &Value::String("AB".to_string()),
            DataType::String(4),
            ByteOrder::BigEndian,
        )
        .unwrap();
        assert_eq!(bytes, vec![b'A', b'B', 0, 0]);
        let values = decode_values(&bytes, DataType::String(4), 1, ByteOrder::BigEndian).unwrap();
        assert_eq!(values[0], Value::String("AB".to_string()));
    }
}
