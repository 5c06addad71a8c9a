//! Bit-level operations for register and coil data
//!
//! Byte-array helpers use LSB-first bit ordering within each byte, which is
//! how Modbus packs coils and how S7 numbers the bits of a byte.

/// Extract single bit from u16 value
#[inline]
pub fn extract_bit_u16(value: u16, bit_index: u8) -> bool {
    debug_assert!(bit_index < 16, "Bit index out of range: {}", bit_index);
    (value & (1 << bit_index)) != 0
}

/// Extract single bit from u8 value
#[inline]
pub fn extract_bit_u8(value: u8, bit_index: u8) -> bool {
    debug_assert!(bit_index < 8, "Bit index out of range: {}", bit_index);
    (value & (1 << bit_index)) != 0
}

/// Return `value` with one bit forced on or off
#[inline]
pub fn with_bit_u16(value: u16, bit_index: u8, on: bool) -> u16 {
    debug_assert!(bit_index < 16, "Bit index out of range: {}", bit_index);
    if on {
        value | (1 << bit_index)
    } else {
        value & !(1 << bit_index)
    }
}

/// Return `value` with one bit forced on or off
#[inline]
pub fn with_bit_u8(value: u8, bit_index: u8, on: bool) -> u8 {
    debug_assert!(bit_index < 8, "Bit index out of range: {}", bit_index);
    if on {
        value | (1 << bit_index)
    } else {
        value & !(1 << bit_index)
    }
}

/// Read a single bit from a byte array
#[inline]
pub fn get_bit(bytes: &[u8], bit_position: usize) -> bool {
    bytes
        .get(bit_position / 8)
        .map(|b| (b >> (bit_position % 8)) & 0x01 == 1)
        .unwrap_or(false)
}

/// Set a single bit in a byte array
#[inline]
pub fn set_bit(bytes: &mut [u8], bit_position: usize) {
    if let Some(b) = bytes.get_mut(bit_position / 8) {
        *b |= 1 << (bit_position % 8);
    }
}

/// Clear a single bit in a byte array
#[inline]
pub fn clear_bit(bytes: &mut [u8], bit_position: usize) {
    if let Some(b) = bytes.get_mut(bit_position / 8) {
        *b &= !(1 << (bit_position % 8));
    }
}

/// Pack booleans LSB-first into `ceil(n / 8)` bytes
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len().div_ceil(8)];
    for (i, &on) in values.iter().enumerate() {
        if on {
            set_bit(&mut bytes, i);
        }
    }
    bytes
}

/// Unpack the first `count` LSB-first bits
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count).map(|i| get_bit(bytes, i)).collect()
}
