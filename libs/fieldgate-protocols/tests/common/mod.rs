//! Simulated field devices for the integration tests
//!
//! Each simulator sits on the far end of a `MemoryTransport` pipe, collects
//! whole requests out of the byte stream and answers from an in-memory image.

#![allow(dead_code)]
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use fieldgate_link::bytes::{pack_bits, unpack_bits};
use fieldgate_link::transport::{MemoryPeers, MemoryTransport};
use fieldgate_link::{ChannelOptions, ClientChannel, TransportKind};
use fieldgate_protocols::dlt645::frame as dlt;
use fieldgate_protocols::modbus::frame::{encode_rtu, encode_tcp};
use fieldgate_protocols::modbus::ModbusFraming;
use fieldgate_protocols::{Device, DeviceConfig};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub fn options(name: &str, timeout_ms: u64) -> ChannelOptions {
    ChannelOptions {
        name: name.to_string(),
        kind: TransportKind::Other,
        timeout_ms,
        ..Default::default()
    }
}

/// Device wired to a fresh in-memory channel
pub fn memory_device(config: DeviceConfig) -> (Device, MemoryPeers) {
    let (transport, peers) = MemoryTransport::new(config.channel.name.clone());
    let device = Device::new(config);
    let channel = ClientChannel::new(
        device.config().channel.clone(),
        Arc::new(transport),
        device.get_data_adapter(),
    )
    .unwrap();
    device.init_channel(Arc::new(channel));
    (device, peers)
}

/// Accumulate bytes until `frame_len` reports a whole request
async fn next_request(
    peer: &mut DuplexStream,
    pending: &mut Vec<u8>,
    frame_len: impl Fn(&[u8]) -> Option<usize>,
) -> Option<Vec<u8>> {
    let mut buf = [0u8; 1024];
    loop {
        if let Some(len) = frame_len(pending.as_slice()) {
            if pending.len() >= len {
                return Some(pending.drain(..len).collect());
            }
        }
        match peer.read(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(n) => pending.extend_from_slice(&buf[..n]),
        }
    }
}

// ============================================================================
// Modbus slave
// ============================================================================

#[derive(Debug, Clone)]
pub struct ModbusSlave {
    pub unit: u8,
    pub registers: Arc<Mutex<Vec<u16>>>,
    pub coils: Arc<Mutex<Vec<bool>>>,
    /// Every request PDU received, in order
    pub requests: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl ModbusSlave {
    pub fn new(unit: u8, registers: usize, coils: usize) -> Self {
        Self {
            unit,
            registers: Arc::new(Mutex::new(vec![0; registers])),
            coils: Arc::new(Mutex::new(vec![false; coils])),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn function_codes(&self) -> Vec<u8> {
        self.requests.lock().unwrap().iter().map(|p| p[0]).collect()
    }

    pub async fn serve(self, mut peer: DuplexStream, framing: ModbusFraming) {
        let mut pending = Vec::new();
        let frame_len = move |buf: &[u8]| request_len(framing, buf);
        while let Some(request) = next_request(&mut peer, &mut pending, &frame_len).await {
            let (tid, unit, pdu) = match framing {
                ModbusFraming::Tcp => (
                    u16::from_be_bytes([request[0], request[1]]),
                    request[6],
                    request[7..].to_vec(),
                ),
                ModbusFraming::Rtu => (0, request[0], request[1..request.len() - 2].to_vec()),
            };
            self.requests.lock().unwrap().push(pdu.clone());
            if unit != self.unit {
                continue;
            }

            let reply = self.handle(&pdu);
            let adu = match framing {
                ModbusFraming::Tcp => encode_tcp(tid, unit, &reply),
                ModbusFraming::Rtu => encode_rtu(unit, &reply),
            };
            if peer.write_all(&adu).await.is_err() {
                return;
            }
        }
    }

    fn handle(&self, pdu: &[u8]) -> Vec<u8> {
        let fc = pdu[0];
        let word = |i: usize| usize::from(u16::from_be_bytes([pdu[i], pdu[i + 1]]));
        let start = word(1);
        let exception = vec![fc | 0x80, 0x02];

        match fc {
            0x01 | 0x02 => {
                let qty = word(3);
                let coils = self.coils.lock().unwrap();
                let Some(values) = coils.get(start..start + qty) else {
                    return exception;
                };
                let packed = pack_bits(values);
                let mut reply = vec![fc, packed.len() as u8];
                reply.extend_from_slice(&packed);
                reply
            },
            0x03 | 0x04 => {
                let qty = word(3);
                let registers = self.registers.lock().unwrap();
                let Some(values) = registers.get(start..start + qty) else {
                    return exception;
                };
                let mut reply = vec![fc, (qty * 2) as u8];
                for v in values {
                    reply.extend_from_slice(&v.to_be_bytes());
                }
                reply
            },
            0x05 => {
                let mut coils = self.coils.lock().unwrap();
                let Some(coil) = coils.get_mut(start) else {
                    return exception;
                };
                *coil = pdu[3] == 0xFF;
                pdu.to_vec()
            },
            0x06 => {
                let mut registers = self.registers.lock().unwrap();
                let Some(register) = registers.get_mut(start) else {
                    return exception;
                };
                *register = word(3) as u16;
                pdu.to_vec()
            },
            0x0F => {
                let qty = word(3);
                let values = unpack_bits(&pdu[6..], qty);
                let mut coils = self.coils.lock().unwrap();
                let Some(slot) = coils.get_mut(start..start + qty) else {
                    return exception;
                };
                slot.copy_from_slice(&values);
                pdu[..5].to_vec()
            },
            0x10 => {
                let qty = word(3);
                let mut registers = self.registers.lock().unwrap();
                let Some(slot) = registers.get_mut(start..start + qty) else {
                    return exception;
                };
                for (i, r) in slot.iter_mut().enumerate() {
                    *r = word(6 + i * 2) as u16;
                }
                pdu[..5].to_vec()
            },
            _ => vec![fc | 0x80, 0x01],
        }
    }
}

fn request_len(framing: ModbusFraming, buf: &[u8]) -> Option<usize> {
    match framing {
        ModbusFraming::Tcp => {
            let header = buf.get(..6)?;
            Some(6 + usize::from(u16::from_be_bytes([header[4], header[5]])))
        },
        ModbusFraming::Rtu => match *buf.get(1)? {
            0x0F | 0x10 => Some(7 + usize::from(*buf.get(6)?) + 2),
            _ => Some(8),
        },
    }
}

// ============================================================================
// DLT645 meter
// ============================================================================

/// Meter answering every read with `data` and every write with an ack
pub async fn dlt645_meter(mut peer: DuplexStream, station_wire: [u8; 6], data: Vec<u8>) {
    let mut pending = Vec::new();
    let frame_len = |buf: &[u8]| {
        let start = buf.iter().position(|b| *b == dlt::START)?;
        Some(start + dlt::HEADER_LEN + usize::from(*buf.get(start + 9)?) + 2)
    };
    while let Some(request) = next_request(&mut peer, &mut pending, &frame_len).await {
        let start = request.iter().position(|b| *b == dlt::START).unwrap();
        let (control, body) = dlt::decode(&request[start..]).unwrap();

        let reply = match control {
            dlt::CTRL_READ => {
                let mut payload = body[..4].to_vec();
                payload.extend_from_slice(&data);
                dlt::encode(station_wire, control | dlt::CTRL_REPLY, &payload, true)
            },
            _ => dlt::encode(station_wire, control | dlt::CTRL_REPLY, &[], true),
        }
        .unwrap();
        if peer.write_all(&reply).await.is_err() {
            return;
        }
    }
}

// ============================================================================
// S7 PLC
// ============================================================================

#[derive(Debug, Clone)]
pub struct S7Plc {
    pub pdu_length: u16,
    /// DB1 contents
    pub db1: Arc<Mutex<Vec<u8>>>,
    /// Read and write jobs received, by function
    pub jobs: Arc<Mutex<Vec<u8>>>,
}

impl S7Plc {
    pub fn new(pdu_length: u16, size: usize) -> Self {
        Self {
            pdu_length,
            db1: Arc::new(Mutex::new(vec![0; size])),
            jobs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn serve(self, mut peer: DuplexStream) {
        let mut pending = Vec::new();
        let frame_len = |buf: &[u8]| {
            let header = buf.get(..4)?;
            Some(usize::from(u16::from_be_bytes([header[2], header[3]])))
        };
        while let Some(request) = next_request(&mut peer, &mut pending, &frame_len).await {
            let reply = if request[5] == 0xE0 {
                connect_confirm()
            } else {
                self.job(&request)
            };
            if peer.write_all(&reply).await.is_err() {
                return;
            }
        }
    }

    fn job(&self, request: &[u8]) -> Vec<u8> {
        let pdu_ref = u16::from_be_bytes([request[11], request[12]]);
        let function = request[17];
        match function {
            0xF0 => {
                let mut params = vec![0xF0, 0x00, 0x00, 0x01, 0x00, 0x01];
                params.extend_from_slice(&self.pdu_length.to_be_bytes());
                s7_ack(pdu_ref, &params, &[])
            },
            0x04 => {
                self.jobs.lock().unwrap().push(function);
                let transport_size = request[22];
                let length = usize::from(u16::from_be_bytes([request[23], request[24]]));
                let location = u32::from_be_bytes([0, request[28], request[29], request[30]]);
                let (byte, bit) = ((location >> 3) as usize, (location & 7) as u8);
                let db = self.db1.lock().unwrap();

                let data = if transport_size == 0x01 {
                    vec![0xFF, 0x03, 0x00, 0x01, (db[byte] >> bit) & 1]
                } else {
                    let mut data = vec![0xFF, 0x04];
                    data.extend_from_slice(&((length * 8) as u16).to_be_bytes());
                    data.extend_from_slice(&db[byte..byte + length]);
                    data
                };
                s7_ack(pdu_ref, &[0x04, 0x01], &data)
            },
            0x05 => {
                self.jobs.lock().unwrap().push(function);
                let location = u32::from_be_bytes([0, request[28], request[29], request[30]]);
                let (byte, bit) = ((location >> 3) as usize, (location & 7) as u8);
                let item = &request[31..];
                let mut db = self.db1.lock().unwrap();
                if item[1] == 0x03 {
                    if item[4] != 0 {
                        db[byte] |= 1 << bit;
                    } else {
                        db[byte] &= !(1 << bit);
                    }
                } else {
                    let length = usize::from(u16::from_be_bytes([item[2], item[3]])) / 8;
                    db[byte..byte + length].copy_from_slice(&item[4..4 + length]);
                }
                s7_ack(pdu_ref, &[0x05, 0x01], &[0xFF])
            },
            _ => s7_ack(pdu_ref, &[function, 0x00], &[0x05]),
        }
    }
}

fn connect_confirm() -> Vec<u8> {
    let mut frame = vec![0x03, 0x00, 0x00, 0x16];
    frame.extend_from_slice(&[0x11, 0xD0, 0x00, 0x01, 0x00, 0x01, 0x00]);
    frame.extend_from_slice(&[0xC0, 0x01, 0x0A, 0xC1, 0x02, 0x01, 0x00, 0xC2, 0x02, 0x01, 0x02]);
    frame
}

fn s7_ack(pdu_ref: u16, params: &[u8], data: &[u8]) -> Vec<u8> {
    let total = (4 + 3 + 12 + params.len() + data.len()) as u16;
    let mut frame = vec![0x03, 0x00];
    frame.extend_from_slice(&total.to_be_bytes());
    frame.extend_from_slice(&[0x02, 0xF0, 0x80, 0x32, 0x03, 0x00, 0x00]);
    frame.extend_from_slice(&pdu_ref.to_be_bytes());
    frame.extend_from_slice(&(params.len() as u16).to_be_bytes());
    frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(params);
    frame.extend_from_slice(data);
    frame
}
