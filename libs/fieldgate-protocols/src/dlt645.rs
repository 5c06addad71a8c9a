//! DLT645-2007 multi-function meters
//!
//! Half-duplex RS485 protocol with no sequence number: replies are matched on
//! control code and meter address, so a channel carrying DLT645 should run
//! with `max_concurrent_count = 1`.

pub mod address;
pub mod codec;
pub mod frame;

pub use address::{Dlt645Address, BROADCAST_STATION};
pub use codec::Dlt645Codec;
pub use frame::{bcd_to_f64, Dlt645Format};
