//! Byte/word order handling for multi-register values
//!
//! Uses ABCD notation where A is the most significant byte. For `0x12345678`:
//! - `BigEndian (ABCD)`: [0x12, 0x34, 0x56, 0x78]
//! - `LittleEndian (DCBA)`: [0x78, 0x56, 0x34, 0x12]
//! - `BigEndianSwap (CDAB)`: [0x56, 0x78, 0x12, 0x34]
//! - `LittleEndianSwap (BADC)`: [0x34, 0x12, 0x78, 0x56]

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ByteOrder {
    /// ABCD, network byte order
    #[default]
    #[serde(rename = "ABCD")]
    BigEndian,

    /// DCBA
    #[serde(rename = "DCBA")]
    LittleEndian,

    /// CDAB, big-endian words in reversed word order (common on Modbus devices)
    #[serde(rename = "CDAB")]
    BigEndianSwap,

    /// BADC, bytes swapped inside each word
    #[serde(rename = "BADC")]
    LittleEndianSwap,
}

impl ByteOrder {
    /// Convert from string forms such as "ABCD", "CD-AB", "BE", "LE"
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        let normalized = s.to_uppercase().replace('-', "");
        match normalized.as_str() {
            "ABCD" | "AB" | "BE" | "BIG_ENDIAN" | "BIGENDIAN" | "ABCDEFGH" => {
                Some(Self::BigEndian)
            },
            "DCBA" | "BA" | "LE" | "LITTLE_ENDIAN" | "LITTLEENDIAN" | "HGFEDCBA" => {
                Some(Self::LittleEndian)
            },
            "CDAB" | "BIG_ENDIAN_SWAP" | "BIGENDIANSWAP" => Some(Self::BigEndianSwap),
            "BADC" | "LITTLE_ENDIAN_SWAP" | "LITTLEENDIANSWAP" => Some(Self::LittleEndianSwap),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BigEndian => "ABCD",
            Self::LittleEndian => "DCBA",
            Self::BigEndianSwap => "CDAB",
            Self::LittleEndianSwap => "BADC",
        }
    }

    /// Reorder `bytes` between device order and big-endian.
    ///
    /// Every order is its own inverse, so the same call converts both ways.
    /// Values of one byte are left untouched; 16-bit values only honour the
    /// byte swap (DCBA and BADC swap, ABCD and CDAB keep).
    pub fn reorder(&self, bytes: &mut [u8]) {
        match self {
            Self::BigEndian => {},
            Self::LittleEndian => bytes.reverse(),
            Self::BigEndianSwap => {
                if bytes.len() > 2 && bytes.len() % 2 == 0 {
                    let words = bytes.len() / 2;
                    for i in 0..words / 2 {
                        let j = words - 1 - i;
                        bytes.swap(2 * i, 2 * j);
                        bytes.swap(2 * i + 1, 2 * j + 1);
                    }
                }
            },
            Self::LittleEndianSwap => {
                for pair in bytes.chunks_exact_mut(2) {
                    pair.swap(0, 1);
                }
            },
        }
    }

    /// Copying form of [`ByteOrder::reorder`]
    pub fn reordered(&self, bytes: &[u8]) -> Vec<u8> {
        let mut out = bytes.to_vec();
        self.reorder(&mut out);
        out
    }
}

impl std::fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_valid() {
        assert_eq!(ByteOrder::from_str("ABCD"), Some(ByteOrder::BigEndian));
        assert_eq!(ByteOrder::from_str("AB-CD"), Some(ByteOrder::BigEndian));
        assert_eq!(ByteOrder::from_str("be"), Some(ByteOrder::BigEndian));
        assert_eq!(ByteOrder::from_str("DCBA"), Some(ByteOrder::LittleEndian));
        assert_eq!(ByteOrder::from_str("CDAB"), Some(ByteOrder::BigEndianSwap));
        assert_eq!(
            ByteOrder::from_str("BADC"),
            Some(ByteOrder::LittleEndianSwap)
        );
        assert_eq!(ByteOrder::from_str("invalid"), None);
    }

    #[test]
    fn test_reorder_32bit() {
        let abcd = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(ByteOrder::BigEndian.reordered(&abcd), abcd.to_vec());
        assert_eq!(
            ByteOrder::LittleEndian.reordered(&abcd),
            vec![0x78, 0x56, 0x34, 0x12]
        );
        assert_eq!(
            ByteOrder::BigEndianSwap.reordered(&abcd),
            vec![0x56, 0x78, 0x12, 0x34]
        );
        assert_eq!(
            ByteOrder::LittleEndianSwap.reordered(&abcd),
            vec![0x34, 0x12, 0x78, 0x56]
        );
    }

    #[test]
    fn test_reorder_64bit_word_swap() {
        let bytes = [1, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(
            ByteOrder::BigEndianSwap.reordered(&bytes),
            vec![7, 8, 5, 6, 3, 4, 1, 2]
        );
    }

    #[test]
    fn test_reorder_is_involution() {
        let bytes = [0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04];
        for order in [
            ByteOrder::BigEndian,
            ByteOrder::LittleEndian,
            ByteOrder::BigEndianSwap,
            ByteOrder::LittleEndianSwap,
        ] {
            let once = order.reordered(&bytes);
            assert_eq!(order.reordered(&once), bytes.to_vec(), "{}", order);
        }
    }

    #[test]
    fn test_reorder_16bit() {
        let ab = [0x12, 0x34];
        assert_eq!(ByteOrder::BigEndianSwap.reordered(&ab), ab.to_vec());
        assert_eq!(ByteOrder::LittleEndian.reordered(&ab), vec![0x34, 0x12]);
        assert_eq!(ByteOrder::LittleEndianSwap.reordered(&ab), vec![0x34, 0x12]);
    }
}
