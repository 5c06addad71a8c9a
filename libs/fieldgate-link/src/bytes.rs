//! Binary data utilities
//!
//! Protocol-agnostic byte order handling and bit manipulation shared by the
//! codecs and the device read-modify-write paths.

pub mod bit_ops;
pub mod byte_order;

pub use bit_ops::*;
pub use byte_order::ByteOrder;
