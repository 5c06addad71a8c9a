//! Siemens S7 over ISO-on-TCP
//!
//! A fresh link must run the COTP connect and setup-communication exchange
//! before any read or write; [`S7Codec::handshake`] hands that sequence to the
//! channel, which replays it on every reconnect.

pub mod address;
pub mod codec;
pub mod frame;

pub use address::{S7Address, S7Area, S7Width};
pub use codec::{S7Codec, S7Handshake};
pub use frame::TpktFormat;
