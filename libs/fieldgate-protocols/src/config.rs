//! Device configuration
//!
//! One [`DeviceConfig`] describes a device end to end: protocol, channel and
//! protocol-specific knobs. Loaded from YAML, TOML or JSON through figment,
//! with `PREFIX_` environment overrides layered on top.

use fieldgate_link::config::{load_config_from_file, load_config_with_env};
use fieldgate_link::{ChannelOptions, LinkError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::codec::Protocol;
use crate::modbus::constants::{
    MAX_READ_COILS, MAX_READ_REGISTERS, MAX_WRITE_COILS, MAX_WRITE_REGISTERS,
};

/// Per-request element limits; lower them for devices that reject full-size requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusOptions {
    pub max_read_bits: u16,
    pub max_read_registers: u16,
    pub max_write_bits: u16,
    pub max_write_registers: u16,
}

impl Default for ModbusOptions {
    fn default() -> Self {
        Self {
            max_read_bits: MAX_READ_COILS,
            max_read_registers: MAX_READ_REGISTERS,
            max_write_bits: MAX_WRITE_COILS,
            max_write_registers: MAX_WRITE_REGISTERS,
        }
    }
}

impl ModbusOptions {
    fn validate(&self) -> Result<()> {
        let limits = [
            ("max_read_bits", self.max_read_bits, MAX_READ_COILS),
            ("max_read_registers", self.max_read_registers, MAX_READ_REGISTERS),
            ("max_write_bits", self.max_write_bits, MAX_WRITE_COILS),
            ("max_write_registers", self.max_write_registers, MAX_WRITE_REGISTERS),
        ];
        for (name, value, max) in limits {
            if value == 0 || value > max {
                return Err(LinkError::config(format!(
                    "modbus.{} must be 1..={}, got {}",
                    name, max, value
                )));
            }
        }
        // Bit reads are split on byte boundaries
        if self.max_read_bits % 8 != 0 || self.max_write_bits % 8 != 0 {
            return Err(LinkError::config(
                "modbus bit limits must be multiples of 8",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct S7Options {
    pub rack: u16,
    pub slot: u16,
    /// 1 = PG, 2 = OP, 3 = S7 basic
    pub connection_type: u8,
    /// Requested PDU length; the PLC may grant less
    pub pdu_length: u16,
    pub local_tsap: Option<u16>,
    pub remote_tsap: Option<u16>,
}

impl Default for S7Options {
    fn default() -> Self {
        Self {
            rack: 0,
            slot: 1,
            connection_type: 1,
            pdu_length: 480,
            local_tsap: None,
            remote_tsap: None,
        }
    }
}

impl S7Options {
    pub fn local_tsap(&self) -> u16 {
        self.local_tsap.unwrap_or(0x0100)
    }

    /// Connection type in the high byte, rack and slot in the low byte
    pub fn remote_tsap(&self) -> u16 {
        self.remote_tsap.unwrap_or_else(|| {
            (u16::from(self.connection_type) << 8) | ((self.rack * 0x20 + self.slot) & 0xFF)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dlt645Options {
    /// Permission level and password, 8 hex digits
    pub password: String,
    pub operator_code: String,
    /// Prefix requests with four 0xFE bytes
    pub wakeup: bool,
}

impl Default for Dlt645Options {
    fn default() -> Self {
        Self {
            password: "00000000".to_string(),
            operator_code: "00000000".to_string(),
            wakeup: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeviceConfig {
    pub name: String,
    pub protocol: Protocol,
    /// Station used by addresses that do not name one
    pub station: Option<String>,
    pub channel: ChannelOptions,
    pub modbus: ModbusOptions,
    pub s7: S7Options,
    pub dlt645: Dlt645Options,
}

impl DeviceConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = load_config_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// [`DeviceConfig::load`] with `{prefix}_SECTION__KEY` environment overrides
    pub fn load_with_env<P: AsRef<Path>>(path: P, prefix: &str) -> Result<Self> {
        let config: Self = load_config_with_env(path, prefix)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.channel.validate()?;
        match self.protocol {
            Protocol::ModbusTcp
            | Protocol::ModbusUdp
            | Protocol::ModbusRtu
            | Protocol::ModbusRtuOverTcp => self.modbus.validate()?,
            Protocol::S7 => {
                if self.s7.pdu_length < 240 {
                    return Err(LinkError::config(format!(
                        "s7.pdu_length must be at least 240, got {}",
                        self.s7.pdu_length
                    )));
                }
            },
            Protocol::Dlt645 => {},
        }

        let untagged = matches!(
            self.protocol,
            Protocol::ModbusRtu | Protocol::ModbusRtuOverTcp | Protocol::Dlt645
        );
        if untagged && self.channel.max_concurrent_count > 1 {
            warn!(
                "Device {}: {} frames carry no sequence id, max_concurrent_count {} relies on reply order",
                self.name, self.protocol, self.channel.max_concurrent_count
            );
        }
        Ok(())
    }

    /// Display name, falling back to the channel name
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.channel.name
        } else {
            &self.name
        }
    }
}
