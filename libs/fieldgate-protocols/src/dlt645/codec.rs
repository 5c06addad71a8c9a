//! DLT645-2007 codec

use fieldgate_link::{Frame, FrameFormat, FrameMatcher, LinkError, Result};
use std::sync::Arc;

use super::address::Dlt645Address;
use super::frame::{
    decode, encode, error_description, Dlt645Format, CTRL_ERROR, CTRL_FOLLOW, CTRL_READ,
    CTRL_REPLY, CTRL_WRITE,
};
use crate::codec::{wrong_address, Codec, DeviceAddress, ElementLayout, Operation, Protocol};
use crate::config::Dlt645Options;

/// Length byte ceiling for master frames, less DI, password and operator code
const MAX_WRITE_DATA: u16 = 200 - 12;

#[derive(Debug, Clone)]
pub struct Dlt645Codec {
    options: Dlt645Options,
}

impl Dlt645Codec {
    pub fn new(options: Dlt645Options) -> Self {
        Self { options }
    }

    fn address<'a>(&self, address: &'a DeviceAddress) -> Result<&'a Dlt645Address> {
        match address {
            DeviceAddress::Dlt645(a) => Ok(a),
            other => Err(wrong_address(Protocol::Dlt645, other)),
        }
    }

    fn request_control(op: &Operation) -> u8 {
        if op.is_read() {
            CTRL_READ
        } else {
            CTRL_WRITE
        }
    }
}

/// 8 hex digits, least significant byte first on the wire
fn credential(text: &str, what: &str) -> Result<[u8; 4]> {
    let text = text.trim();
    if text.len() != 8 || !text.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(LinkError::config(format!(
            "DLT645 {} must be 8 hex digits",
            what
        )));
    }
    u32::from_str_radix(text, 16)
        .map(u32::to_le_bytes)
        .map_err(|_| LinkError::config(format!("Invalid DLT645 {}", what)))
}

impl Codec for Dlt645Codec {
    fn protocol(&self) -> Protocol {
        Protocol::Dlt645
    }

    fn frame_format(&self) -> Arc<dyn FrameFormat> {
        Arc::new(Dlt645Format)
    }

    fn parse_address(&self, text: &str, station: Option<&str>) -> Result<DeviceAddress> {
        Dlt645Address::parse(text, station).map(DeviceAddress::Dlt645)
    }

    fn build_request(
        &self,
        address: &DeviceAddress,
        op: &Operation,
        _sign: u32,
    ) -> Result<Vec<u8>> {
        let address = self.address(address)?;
        let data = match op {
            Operation::Read { .. } => address.di_wire().to_vec(),
            Operation::Write { data } => {
                if data.is_empty() || data.len() > usize::from(MAX_WRITE_DATA) {
                    return Err(LinkError::argument(format!(
                        "Cannot write {} bytes to {}",
                        data.len(),
                        address
                    )));
                }
                let mut payload = address.di_wire().to_vec();
                payload.extend_from_slice(&credential(&self.options.password, "password")?);
                payload.extend_from_slice(&credential(
                    &self.options.operator_code,
                    "operator code",
                )?);
                payload.extend_from_slice(data);
                payload
            },
            Operation::WriteBits { .. } => {
                return Err(LinkError::argument(format!(
                    "{} cannot be written bit by bit",
                    address
                )))
            },
        };
        encode(
            address.station_wire(),
            Self::request_control(op),
            &data,
            self.options.wakeup,
        )
    }

    /// Replies carry no sequence number: accept the reply to this control code,
    /// from this meter unless the request went to a wildcard station
    fn response_matcher(&self, address: &DeviceAddress, op: &Operation) -> Option<FrameMatcher> {
        let address = self.address(address).ok()?;
        let station = (!address.is_wildcard()).then(|| address.station_wire());
        let control = Self::request_control(op);
        Some(Arc::new(move |frame: &Frame| {
            let bytes = frame.as_bytes();
            let Some(&reply) = bytes.get(8) else {
                return false;
            };
            let same_request = reply & 0x1F == control && reply & CTRL_REPLY != 0;
            let same_meter = station.map_or(true, |s| bytes.get(1..7) == Some(&s[..]));
            same_request && same_meter
        }))
    }

    fn decode_response(
        &self,
        frame: &Frame,
        address: &DeviceAddress,
        op: &Operation,
    ) -> Result<Vec<u8>> {
        let address = self.address(address)?;
        let (control, data) = decode(frame.as_bytes())?;
        let request = Self::request_control(op);

        if control & 0x1F != request || control & CTRL_REPLY == 0 {
            return Err(LinkError::protocol(format!(
                "Unexpected DLT645 control code 0x{:02X} for {}",
                control, address
            )));
        }
        if control & CTRL_ERROR != 0 {
            let err = data.first().copied().unwrap_or(0);
            return Err(LinkError::protocol(format!(
                "DLT645 meter rejected {}: {}",
                address,
                error_description(err)
            )));
        }
        if request == CTRL_WRITE {
            return Ok(Vec::new());
        }

        if control & CTRL_FOLLOW != 0 {
            tracing::debug!("DLT645 {} has follow-up frames, first frame used", address);
        }
        if data.len() < 4 || data[..4] != address.di_wire() {
            return Err(LinkError::protocol(format!(
                "DLT645 reply does not carry DI {:08X}",
                address.di
            )));
        }
        Ok(data[4..].to_vec())
    }

    fn bit_reverse(&self, _address: &DeviceAddress) -> bool {
        false
    }

    fn layout(&self, _address: &DeviceAddress) -> ElementLayout {
        ElementLayout::Bytes(1)
    }

    /// A read always returns the whole data item
    fn max_elements(&self, _address: &DeviceAddress, write: bool) -> u16 {
        if write {
            MAX_WRITE_DATA
        } else {
            u16::MAX
        }
    }

    fn check_writable(&self, address: &DeviceAddress) -> Result<()> {
        self.address(address).map(|_| ())
    }

    fn writes_bits_natively(&self, _address: &DeviceAddress, _count: usize) -> bool {
        false
    }

    fn check_bit_access(&self, address: &DeviceAddress) -> Result<()> {
        Err(LinkError::argument(format!(
            "{} has no bit addressing",
            address
        )))
    }

    fn pack_key(&self, _address: &DeviceAddress) -> Option<String> {
        None
    }
}
