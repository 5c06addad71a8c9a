//! Fieldgate protocols
//!
//! Protocol codecs and the device façade on top of `fieldgate-link` channels.
//!
//! - [`codec`]: the codec contract and the protocol registry
//! - [`modbus`], [`s7`], [`dlt645`]: one codec per protocol family
//! - [`packer`]: plans packed reads for many variables
//! - [`device`]: binds a codec to a channel and exposes reads and writes
//!
//! ```no_run
//! use fieldgate_link::bytes::ByteOrder;
//! use fieldgate_protocols::{DataType, Device, DeviceConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> fieldgate_link::Result<()> {
//! let device = Device::open(DeviceConfig::load("config/pump.yaml")?)?;
//! let cancel = CancellationToken::new();
//! let level = device
//!     .read_values("400045", DataType::UInt16, 1, ByteOrder::BigEndian, &cancel)
//!     .await?;
//! assert_eq!(level.len(), 1);
//! device.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod device;
pub mod dlt645;
pub mod modbus;
pub mod packer;
pub mod s7;
pub mod value;

pub use codec::{build_codec, Codec, DeviceAddress, ElementLayout, Operation, Protocol};
pub use config::{DeviceConfig, Dlt645Options, ModbusOptions, S7Options};
pub use device::Device;
pub use packer::{pack, PackResult, PackedVariable, Variable, VariableSource};
pub use value::{decode_values, encode_value, DataType, Value};
