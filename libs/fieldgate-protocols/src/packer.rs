//! Address packing
//!
//! Turns many logical variables into few physical reads. Variables whose
//! addresses share a codec pack key (same station and table, same data block)
//! are sorted by start element and cut greedily into spans of at most
//! `max_pack` elements. Each span becomes one [`VariableSource`] that records
//! where every member's bytes, and bit for booleans, sit in the fetched buffer.

use fieldgate_link::bytes::ByteOrder;
use fieldgate_link::{LinkError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::codec::{Codec, DeviceAddress, ElementLayout};
use crate::value::{decode_values, DataType, Value};

/// One logical variable as configured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub address: String,
    pub data_type: DataType,
    /// Poll interval override
    #[serde(default)]
    pub interval_ms: Option<u64>,
    /// `false` keeps the variable in a read of its own
    #[serde(default = "default_pack")]
    pub pack: bool,
}

fn default_pack() -> bool {
    true
}

impl Variable {
    pub fn new(name: impl Into<String>, address: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            data_type,
            interval_ms: None,
            pack: true,
        }
    }

    pub fn with_interval(mut self, interval_ms: u64) -> Self {
        self.interval_ms = Some(interval_ms);
        self
    }

    pub fn unpacked(mut self) -> Self {
        self.pack = false;
        self
    }
}

/// Where a member's value lives inside its source's buffer
#[derive(Debug, Clone, PartialEq)]
pub struct PackedVariable {
    pub name: String,
    pub data_type: DataType,
    pub byte_offset: usize,
    /// Bytes the value spans
    pub byte_len: usize,
    /// Bit inside the byte at `byte_offset`, booleans only
    pub bit_index: Option<u8>,
    /// Multi-bit value on a bit area that starts this many bits into the
    /// byte at `byte_offset`
    pub bit_shift: u8,
}

impl PackedVariable {
    /// Decode this member out of the buffer its source returned
    pub fn decode(&self, buffer: &[u8], order: ByteOrder) -> Result<Value> {
        let span = (usize::from(self.bit_shift) + self.byte_len * 8).div_ceil(8);
        let raw = buffer
            .get(self.byte_offset..self.byte_offset + span)
            .ok_or_else(|| {
                LinkError::protocol(format!(
                    "{}: buffer of {} bytes has no room for offset {}",
                    self.name,
                    buffer.len(),
                    self.byte_offset
                ))
            })?;
        let bytes = realign(raw, self.bit_shift, self.byte_len);

        match (self.data_type, self.bit_index) {
            (_, Some(bit)) => Ok(Value::Bool(bytes[0] & (1 << bit) != 0)),
            (DataType::Boolean, None) => Ok(Value::Bool(bytes.iter().any(|b| *b != 0))),
            (data_type, None) => decode_values(&bytes, data_type, 1, order)?
                .pop()
                .ok_or_else(|| LinkError::protocol(format!("{}: nothing decoded", self.name))),
        }
    }
}

/// Drop the first `shift` bits of an LSB-first bit buffer
fn realign(raw: &[u8], shift: u8, len: usize) -> Vec<u8> {
    if shift == 0 {
        return raw[..len].to_vec();
    }
    (0..len)
        .map(|i| {
            let high = raw.get(i + 1).map_or(0, |b| b << (8 - shift));
            (raw[i] >> shift) | high
        })
        .collect()
}

/// One physical read
#[derive(Debug, Clone, PartialEq)]
pub struct VariableSource {
    /// First element, bit index stripped
    pub address: DeviceAddress,
    /// Elements to read
    pub length: u16,
    pub interval_ms: u64,
    pub members: Vec<PackedVariable>,
}

#[derive(Debug, Default)]
pub struct PackResult {
    pub sources: Vec<VariableSource>,
    /// Variables that could not be planned, by name
    pub errors: Vec<(String, LinkError)>,
}

struct Resolved<'a> {
    variable: &'a Variable,
    address: DeviceAddress,
    start: u32,
    elements: u32,
}

/// Plan the reads for `variables`
///
/// `max_pack` caps the elements of one read; 0 leaves only the codec's own
/// per-request limit.
pub fn pack(
    codec: &dyn Codec,
    variables: &[Variable],
    station: Option<&str>,
    max_pack: u16,
    default_interval_ms: u64,
) -> PackResult {
    let mut result = PackResult::default();
    let mut groups: BTreeMap<String, Vec<Resolved<'_>>> = BTreeMap::new();
    let mut singles = Vec::new();

    for variable in variables {
        let resolved = match resolve(codec, variable, station) {
            Ok(r) => r,
            Err(e) => {
                debug!("Variable {} not packed: {}", variable.name, e);
                result.errors.push((variable.name.clone(), e));
                continue;
            },
        };
        match codec.pack_key(&resolved.address).filter(|_| variable.pack) {
            Some(key) => groups.entry(key).or_default().push(resolved),
            None => singles.push(resolved),
        }
    }

    for (key, mut members) in groups {
        members.sort_by_key(|m| (m.start, m.elements));
        let cap = match codec.max_elements(&members[0].address, false) {
            limit if max_pack > 0 => u32::from(limit.min(max_pack)),
            limit => u32::from(limit),
        };

        let mut span: Vec<Resolved<'_>> = Vec::new();
        for member in members {
            let fits = span.first().is_some_and(|first| {
                let end = span
                    .iter()
                    .map(|m| m.start + m.elements)
                    .max()
                    .unwrap_or(first.start)
                    .max(member.start + member.elements);
                end - first.start <= cap
            });
            if !fits && !span.is_empty() {
                push_source(codec, &mut result, std::mem::take(&mut span), default_interval_ms);
            }
            span.push(member);
        }
        if !span.is_empty() {
            push_source(codec, &mut result, span, default_interval_ms);
        }
        debug!("Pack key {} planned", key);
    }

    for single in singles {
        push_source(codec, &mut result, vec![single], default_interval_ms);
    }

    result
}

fn resolve<'a>(
    codec: &dyn Codec,
    variable: &'a Variable,
    station: Option<&str>,
) -> Result<Resolved<'a>> {
    let address = codec.parse_address(&variable.address, station)?;
    if address.bit().is_some() {
        codec.check_bit_access(&address)?;
    }

    let width = variable.data_type.byte_len().max(1);
    let elements = match codec.layout(&address) {
        ElementLayout::Bits if variable.data_type == DataType::Boolean => 1,
        ElementLayout::Bits => width * 8,
        ElementLayout::Bytes(_) if address.bit().is_some() => 1,
        ElementLayout::Bytes(size) => width.div_ceil(size.max(1)),
    };

    Ok(Resolved {
        variable,
        start: address.start(),
        address,
        elements: elements as u32,
    })
}

fn push_source(
    codec: &dyn Codec,
    result: &mut PackResult,
    span: Vec<Resolved<'_>>,
    default_interval_ms: u64,
) {
    let Some(first) = span.first() else {
        return;
    };
    let base = first.start;
    let address = match first.address.offset_by(0) {
        Ok(a) => a,
        Err(e) => {
            for m in &span {
                result.errors.push((m.variable.name.clone(), e.clone()));
            }
            return;
        },
    };
    let end = span.iter().map(|m| m.start + m.elements).max().unwrap_or(base);
    let layout = codec.layout(&address);
    let reverse = codec.bit_reverse(&first.address);

    let members = span
        .iter()
        .map(|m| place(m, base, layout, reverse))
        .collect();
    let interval_ms = span
        .iter()
        .map(|m| m.variable.interval_ms.unwrap_or(default_interval_ms))
        .min()
        .unwrap_or(default_interval_ms);

    result.sources.push(VariableSource {
        address,
        length: (end - base).min(u32::from(u16::MAX)) as u16,
        interval_ms,
        members,
    });
}

/// Byte and bit position of a member relative to the span's first element
fn place(member: &Resolved<'_>, base: u32, layout: ElementLayout, reverse: bool) -> PackedVariable {
    let offset = (member.start - base) as usize;
    let data_type = member.variable.data_type;
    let mut bit_shift = 0;
    let (byte_offset, byte_len, bit_index) = match (layout, member.address.bit()) {
        (ElementLayout::Bits, _) if data_type == DataType::Boolean => {
            (offset / 8, 1, Some((offset % 8) as u8))
        },
        (ElementLayout::Bits, _) => {
            bit_shift = (offset % 8) as u8;
            (offset / 8, data_type.byte_len(), None)
        },
        (ElementLayout::Bytes(size), Some(bit)) => {
            let within = if reverse {
                size - 1 - usize::from(bit / 8)
            } else {
                usize::from(bit / 8)
            };
            (offset * size + within, 1, Some(bit % 8))
        },
        (ElementLayout::Bytes(size), None) => (offset * size, data_type.byte_len().max(1), None),
    };

    PackedVariable {
        name: member.variable.name.clone(),
        data_type,
        byte_offset,
        byte_len,
        bit_index,
        bit_shift,
    }
}
