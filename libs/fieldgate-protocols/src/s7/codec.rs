//! S7 codec and connect handshake

use fieldgate_link::{Frame, FrameFormat, Handshake, LinkError, Result};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::info;

use super::address::{S7Address, S7Area};
use super::frame::{
    ack_data, connection_request, read_response, setup_communication, write_request,
    write_response, TpktFormat, COTP_CONNECT_CONFIRM,
};
use crate::codec::{wrong_address, Codec, DeviceAddress, ElementLayout, Operation, Protocol};
use crate::config::S7Options;

/// Header and item overhead inside one PDU
const READ_OVERHEAD: u16 = 18;
const WRITE_OVERHEAD: u16 = 28;

/// COTP connect, then setup-communication
///
/// The PDU length the PLC grants is written to the shared cell so request
/// sizing follows the negotiated value on every reconnect.
#[derive(Debug)]
pub struct S7Handshake {
    local_tsap: u16,
    remote_tsap: u16,
    pdu_length: u16,
    negotiated: Arc<AtomicU16>,
}

impl Handshake for S7Handshake {
    fn steps(&self) -> usize {
        2
    }

    fn build(&self, step: usize, sign: u32) -> Result<Vec<u8>> {
        match step {
            0 => Ok(connection_request(self.local_tsap, self.remote_tsap)),
            1 => Ok(setup_communication(sign as u16, self.pdu_length)),
            _ => Err(LinkError::argument(format!("S7 handshake has no step {}", step))),
        }
    }

    fn check(&self, step: usize, frame: &Frame) -> Result<()> {
        let bytes = frame.as_bytes();
        match step {
            0 if bytes.get(5) == Some(&COTP_CONNECT_CONFIRM) => Ok(()),
            0 => Err(LinkError::protocol("COTP connection refused")),
            _ => {
                let (params, _) = ack_data(bytes)?;
                if params.len() < 8 {
                    return Err(LinkError::protocol("Short setup-communication ack"));
                }
                let granted = u16::from_be_bytes([params[6], params[7]]);
                if granted <= WRITE_OVERHEAD {
                    return Err(LinkError::protocol(format!(
                        "PLC granted unusable PDU length {}",
                        granted
                    )));
                }
                self.negotiated.store(granted, Ordering::Relaxed);
                info!("S7 session established, PDU length {}", granted);
                Ok(())
            },
        }
    }
}

#[derive(Debug)]
pub struct S7Codec {
    options: S7Options,
    negotiated: Arc<AtomicU16>,
}

impl S7Codec {
    pub fn new(options: S7Options) -> Self {
        let negotiated = Arc::new(AtomicU16::new(options.pdu_length));
        Self {
            options,
            negotiated,
        }
    }

    /// PDU length in effect, negotiated or requested
    pub fn pdu_length(&self) -> u16 {
        self.negotiated.load(Ordering::Relaxed)
    }

    fn address<'a>(&self, address: &'a DeviceAddress) -> Result<&'a S7Address> {
        match address {
            DeviceAddress::S7(a) => Ok(a),
            other => Err(wrong_address(Protocol::S7, other)),
        }
    }

    fn payload_limit(&self, write: bool) -> usize {
        let overhead = if write { WRITE_OVERHEAD } else { READ_OVERHEAD };
        usize::from(self.pdu_length().saturating_sub(overhead))
    }

    fn expected_len(address: &S7Address, op: &Operation) -> usize {
        match op {
            Operation::Read { count: 1 } if address.bit.is_some() => 1,
            Operation::Read { count } => usize::from(*count) * address.element_size(),
            _ => 0,
        }
    }
}

impl Codec for S7Codec {
    fn protocol(&self) -> Protocol {
        Protocol::S7
    }

    fn frame_format(&self) -> Arc<dyn FrameFormat> {
        Arc::new(TpktFormat)
    }

    fn handshake(&self) -> Option<Arc<dyn Handshake>> {
        Some(Arc::new(S7Handshake {
            local_tsap: self.options.local_tsap(),
            remote_tsap: self.options.remote_tsap(),
            pdu_length: self.options.pdu_length,
            negotiated: self.negotiated.clone(),
        }))
    }

    fn parse_address(&self, text: &str, _station: Option<&str>) -> Result<DeviceAddress> {
        S7Address::parse(text).map(DeviceAddress::S7)
    }

    fn build_request(
        &self,
        address: &DeviceAddress,
        op: &Operation,
        sign: u32,
    ) -> Result<Vec<u8>> {
        let address = self.address(address)?;
        let pdu_ref = sign as u16;
        match op {
            Operation::Read { count } => {
                let bytes = usize::from(*count) * address.element_size();
                if *count == 0 || bytes > self.payload_limit(false) {
                    return Err(LinkError::argument(format!(
                        "{} elements at {} exceed the PDU",
                        count, address
                    )));
                }
                Ok(super::frame::read_request(pdu_ref, address, *count))
            },
            Operation::Write { data } => {
                if address.bit.is_some() {
                    return Err(LinkError::argument(format!(
                        "{} names a bit, write booleans instead",
                        address
                    )));
                }
                if data.is_empty()
                    || data.len() % address.element_size() != 0
                    || data.len() > self.payload_limit(true)
                {
                    return Err(LinkError::argument(format!(
                        "Cannot write {} bytes at {}",
                        data.len(),
                        address
                    )));
                }
                Ok(write_request(pdu_ref, address, data))
            },
            Operation::WriteBits { values } => match (address.bit, values.as_slice()) {
                (Some(_), [value]) => Ok(write_request(pdu_ref, address, &[u8::from(*value)])),
                _ => Err(LinkError::argument(format!(
                    "S7 writes one bit at a time, {} requested at {}",
                    values.len(),
                    address
                ))),
            },
        }
    }

    fn decode_response(
        &self,
        frame: &Frame,
        address: &DeviceAddress,
        op: &Operation,
    ) -> Result<Vec<u8>> {
        let address = self.address(address)?;
        if !op.is_read() {
            write_response(frame.as_bytes())?;
            return Ok(Vec::new());
        }

        let data = read_response(frame.as_bytes())?;
        let expected = Self::expected_len(address, op);
        if data.len() != expected {
            return Err(LinkError::protocol(format!(
                "S7 read of {} returned {} bytes, expected {}",
                address,
                data.len(),
                expected
            )));
        }
        Ok(data)
    }

    fn bit_reverse(&self, _address: &DeviceAddress) -> bool {
        false
    }

    fn layout(&self, address: &DeviceAddress) -> ElementLayout {
        match address {
            DeviceAddress::S7(a) => ElementLayout::Bytes(a.element_size()),
            _ => ElementLayout::Bytes(1),
        }
    }

    fn max_elements(&self, address: &DeviceAddress, write: bool) -> u16 {
        let size = match address {
            DeviceAddress::S7(a) => a.element_size(),
            _ => 1,
        };
        u16::try_from(self.payload_limit(write) / size).unwrap_or(u16::MAX)
    }

    fn check_writable(&self, address: &DeviceAddress) -> Result<()> {
        self.address(address).map(|_| ())
    }

    fn writes_bits_natively(&self, address: &DeviceAddress, count: usize) -> bool {
        matches!(address, DeviceAddress::S7(a) if a.bit.is_some()) && count == 1
    }

    fn check_bit_access(&self, address: &DeviceAddress) -> Result<()> {
        let a = self.address(address)?;
        if a.area.is_numbered() {
            return Err(LinkError::argument(format!("{} has no bits", a)));
        }
        Ok(())
    }

    fn pack_key(&self, address: &DeviceAddress) -> Option<String> {
        let a = self.address(address).ok()?;
        Some(match a.area {
            S7Area::DataBlock => format!("db{}", a.db),
            area => format!("area{:02X}", area.code()),
        })
    }
}
