//! Device façade
//!
//! Binds one [`Codec`] to one [`RequestChannel`] and exposes element-level
//! reads and writes. Requests longer than the codec's per-request limit are
//! split; sub-element writes (single bits in a register, half a register) go
//! through a read-modify-write serialized on the device.

use fieldgate_link::bytes::{unpack_bits, ByteOrder};
use fieldgate_link::{open_channel, FrameFormat, LinkError, Request, RequestChannel, Result};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::codec::{build_codec, Codec, DeviceAddress, ElementLayout, Operation};
use crate::config::DeviceConfig;
use crate::packer::{pack, PackResult, Variable, VariableSource};
use crate::value::{decode_values, encode_value, DataType, Value};

#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    codec: Arc<dyn Codec>,
    channel: RwLock<Option<Arc<dyn RequestChannel>>>,
    /// Held for the whole of a read-modify-write
    rmw: Mutex<()>,
    disposed: AtomicBool,
}

impl Device {
    /// Device without a channel; call [`Device::init_channel`] before any I/O
    pub fn new(config: DeviceConfig) -> Self {
        let codec = build_codec(&config);
        Self {
            config,
            codec,
            channel: RwLock::new(None),
            rmw: Mutex::new(()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Validate the configuration and open the channel it describes
    pub fn open(config: DeviceConfig) -> Result<Self> {
        config.validate()?;
        let device = Self::new(config);
        let channel = open_channel(device.config.channel.clone(), device.codec.frame_format())?;
        device.init_channel(channel);
        Ok(device)
    }

    /// Attach a channel and bind this device's framing and handshake to it
    pub fn init_channel(&self, channel: Arc<dyn RequestChannel>) {
        channel.bind_protocol(self.codec.frame_format(), self.codec.handshake());
        info!(
            "Device {} ({}) bound to channel {}",
            self.config.display_name(),
            self.codec.protocol(),
            channel.options().name
        );
        *self.channel.write() = Some(channel);
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn channel(&self) -> Option<Arc<dyn RequestChannel>> {
        self.channel.read().clone()
    }

    /// Framing rules this device needs on its channel
    pub fn get_data_adapter(&self) -> Arc<dyn FrameFormat> {
        self.codec.frame_format()
    }

    pub fn parse_address(&self, text: &str) -> Result<DeviceAddress> {
        self.codec.parse_address(text, self.config.station.as_deref())
    }

    /// Whether bit 0 of an element at `address` lives in its last byte
    pub fn bit_reverse(&self, address: &str) -> Result<bool> {
        let address = self.parse_address(address)?;
        Ok(self.codec.bit_reverse(&address))
    }

    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        self.active_channel()?.connect(cancel).await
    }

    /// Close the channel; every later call fails with `Disposed`
    pub async fn close(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let channel = self.channel.write().take();
        match channel {
            Some(channel) => channel.close().await,
            None => Ok(()),
        }
    }

    /// Channel connected and handshaken; per-request limits may depend on
    /// what the handshake negotiated
    async fn ready_channel(&self, cancel: &CancellationToken) -> Result<Arc<dyn RequestChannel>> {
        let channel = self.active_channel()?;
        if !channel.state().is_connected() {
            channel.connect(cancel).await?;
        }
        Ok(channel)
    }

    fn active_channel(&self) -> Result<Arc<dyn RequestChannel>> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(LinkError::Disposed);
        }
        self.channel.read().clone().ok_or_else(|| {
            LinkError::config(format!(
                "Device {} has no channel",
                self.config.display_name()
            ))
        })
    }

    /// One wire exchange
    async fn exchange(
        &self,
        channel: &dyn RequestChannel,
        address: &DeviceAddress,
        op: Operation,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let codec = &self.codec;
        let mut request = Request::new(|sign| codec.build_request(address, &op, sign));
        if let Some(matcher) = codec.response_matcher(address, &op) {
            request = request.with_matcher(matcher);
        }
        let frame = channel.send_then_return(request, cancel).await?;
        codec.decode_response(&frame, address, &op)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read `count` whole elements starting at `address`
    ///
    /// Bit indexes are ignored here: the containing elements come back raw.
    /// Coils and discrete inputs are returned packed LSB first.
    pub async fn read(
        &self,
        address: &str,
        count: u16,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let address = self.parse_address(address)?;
        self.read_elements(&address.offset_by(0)?, count, cancel).await
    }

    async fn read_elements(
        &self,
        address: &DeviceAddress,
        count: u16,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        if count == 0 {
            return Err(LinkError::argument(format!("Zero-length read of {}", address)));
        }
        let channel = self.ready_channel(cancel).await?;

        let max = self.codec.max_elements(address, false).max(1);
        let step = match self.codec.layout(address) {
            // Keep every chunk but the last byte aligned
            ElementLayout::Bits if max >= 8 => max - max % 8,
            _ => max,
        };
        if count <= step {
            return self
                .exchange(channel.as_ref(), address, Operation::Read { count }, cancel)
                .await;
        }

        let mut out = Vec::new();
        let mut done: u16 = 0;
        while done < count {
            let chunk = step.min(count - done);
            let at = address.offset_by(u32::from(done))?;
            debug!("Split read {} x{}", at, chunk);
            let bytes = self
                .exchange(channel.as_ref(), &at, Operation::Read { count: chunk }, cancel)
                .await?;
            out.extend_from_slice(&bytes);
            done += chunk;
        }
        Ok(out)
    }

    /// Read `count` booleans starting at `address`
    ///
    /// Coils map one element per value. A register bit address yields
    /// consecutive bits, carrying over into the following elements; a register
    /// address without a bit yields one value per element (non-zero = true).
    pub async fn read_bools(
        &self,
        address: &str,
        count: u16,
        cancel: &CancellationToken,
    ) -> Result<Vec<bool>> {
        let address = self.parse_address(address)?;
        self.read_bools_at(&address, count, cancel).await
    }

    async fn read_bools_at(
        &self,
        address: &DeviceAddress,
        count: u16,
        cancel: &CancellationToken,
    ) -> Result<Vec<bool>> {
        let base = address.offset_by(0)?;
        match (self.codec.layout(address), address.bit()) {
            (ElementLayout::Bits, _) => {
                let bytes = self.read_elements(&base, count, cancel).await?;
                Ok(unpack_bits(&bytes, usize::from(count)))
            },
            (ElementLayout::Bytes(size), Some(bit)) => {
                self.codec.check_bit_access(address)?;
                let bits_per_element = size * 8;
                let last = usize::from(bit) + usize::from(count);
                let elements = last.div_ceil(bits_per_element);
                let bytes = self.read_elements(&base, elements as u16, cancel).await?;
                let reverse = self.codec.bit_reverse(address);
                (usize::from(bit)..last)
                    .map(|g| {
                        let (byte, mask) = bit_position(g, size, reverse);
                        bytes
                            .get(byte)
                            .map(|b| b & mask != 0)
                            .ok_or_else(|| LinkError::protocol("Short read for bit access"))
                    })
                    .collect()
            },
            (ElementLayout::Bytes(size), None) => {
                let bytes = self.read_elements(&base, count, cancel).await?;
                Ok(bytes
                    .chunks(size.max(1))
                    .take(usize::from(count))
                    .map(|e| e.iter().any(|b| *b != 0))
                    .collect())
            },
        }
    }

    /// Read and decode `count` values of `data_type`
    pub async fn read_values(
        &self,
        address: &str,
        data_type: DataType,
        count: u16,
        order: ByteOrder,
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>> {
        let address = self.parse_address(address)?;
        if data_type == DataType::Boolean {
            let values = self.read_bools_at(&address, count, cancel).await?;
            return Ok(values.into_iter().map(Value::Bool).collect());
        }

        let bytes_needed = data_type.byte_len() * usize::from(count);
        let elements = match self.codec.layout(&address) {
            ElementLayout::Bits => bytes_needed * 8,
            ElementLayout::Bytes(size) => bytes_needed.div_ceil(size.max(1)),
        };
        let elements = u16::try_from(elements).map_err(|_| {
            LinkError::argument(format!("{} x {} is too long to read", count, data_type))
        })?;
        let bytes = self
            .read_elements(&address.offset_by(0)?, elements, cancel)
            .await?;
        decode_values(&bytes, data_type, usize::from(count), order)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Write raw device bytes starting at `address`
    ///
    /// On coils and bit addresses each byte is one boolean (non-zero = on).
    /// A byte count that does not fill whole elements is merged into the
    /// current contents first.
    pub async fn write(&self, address: &str, data: &[u8], cancel: &CancellationToken) -> Result<()> {
        let address = self.parse_address(address)?;
        self.codec.check_writable(&address)?;
        if data.is_empty() {
            return Err(LinkError::argument(format!("Empty write to {}", address)));
        }

        match (self.codec.layout(&address), address.bit()) {
            (ElementLayout::Bits, _) | (_, Some(_)) => {
                let values: Vec<bool> = data.iter().map(|b| *b != 0).collect();
                self.write_bools_at(&address, &values, cancel).await
            },
            (ElementLayout::Bytes(size), None) if size > 1 && data.len() % size != 0 => {
                self.merge_bytes(&address, size, data, cancel).await
            },
            (ElementLayout::Bytes(size), None) => {
                self.write_elements(&address, size.max(1), data, cancel).await
            },
        }
    }

    /// Write booleans starting at `address`
    pub async fn write_bools(
        &self,
        address: &str,
        values: &[bool],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let address = self.parse_address(address)?;
        self.codec.check_writable(&address)?;
        self.write_bools_at(&address, values, cancel).await
    }

    /// Encode one value into device order and write it
    pub async fn write_value(
        &self,
        address: &str,
        value: &Value,
        data_type: DataType,
        order: ByteOrder,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if data_type == DataType::Boolean {
            let on = value
                .as_bool()
                .ok_or_else(|| LinkError::argument(format!("Value {} is not boolean", value)))?;
            return self.write_bools(address, &[on], cancel).await;
        }
        let bytes = encode_value(value, data_type, order)?;
        self.write(address, &bytes, cancel).await
    }

    async fn write_elements(
        &self,
        address: &DeviceAddress,
        size: usize,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let channel = self.ready_channel(cancel).await?;
        let max = usize::from(self.codec.max_elements(address, true).max(1)) * size;

        for (i, chunk) in data.chunks(max).enumerate() {
            let at = address.offset_by((i * max / size) as u32)?;
            let op = Operation::Write {
                data: chunk.to_vec(),
            };
            self.exchange(channel.as_ref(), &at, op, cancel).await?;
        }
        Ok(())
    }

    async fn write_bools_at(
        &self,
        address: &DeviceAddress,
        values: &[bool],
        cancel: &CancellationToken,
    ) -> Result<()> {
        if values.is_empty() {
            return Err(LinkError::argument(format!("Empty write to {}", address)));
        }
        let channel = self.ready_channel(cancel).await?;

        if let ElementLayout::Bits = self.codec.layout(address) {
            let max = usize::from(self.codec.max_elements(address, true).max(1));
            for (i, chunk) in values.chunks(max).enumerate() {
                let at = address.offset_by((i * max) as u32)?;
                let op = Operation::WriteBits {
                    values: chunk.to_vec(),
                };
                self.exchange(channel.as_ref(), &at, op, cancel).await?;
            }
            return Ok(());
        }

        if self.codec.writes_bits_natively(address, values.len()) {
            let op = Operation::WriteBits {
                values: values.to_vec(),
            };
            return self.exchange(channel.as_ref(), address, op, cancel).await.map(|_| ());
        }

        let Some(bit) = address.bit() else {
            return Err(LinkError::argument(format!(
                "{} has no bit index to write booleans to",
                address
            )));
        };
        self.codec.check_bit_access(address)?;
        let ElementLayout::Bytes(size) = self.codec.layout(address) else {
            return Err(LinkError::argument(format!("{} is not bit addressable", address)));
        };

        let base = address.offset_by(0)?;
        let last = usize::from(bit) + values.len();
        let elements = u16::try_from(last.div_ceil(size * 8))
            .map_err(|_| LinkError::argument("Too many bits for one write"))?;
        let reverse = self.codec.bit_reverse(address);

        let _guard = self.rmw.lock().await;
        let mut bytes = self.read_elements(&base, elements, cancel).await?;
        for (g, on) in (usize::from(bit)..last).zip(values) {
            let (byte, mask) = bit_position(g, size, reverse);
            let target = bytes
                .get_mut(byte)
                .ok_or_else(|| LinkError::protocol("Short read for bit write"))?;
            if *on {
                *target |= mask;
            } else {
                *target &= !mask;
            }
        }
        debug!("Bit write {} via read-modify-write of {} elements", address, elements);
        self.write_elements(&base, size, &bytes, cancel).await
    }

    /// Overwrite the leading bytes of whole elements, keeping the rest
    async fn merge_bytes(
        &self,
        address: &DeviceAddress,
        size: usize,
        data: &[u8],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let elements = u16::try_from(data.len().div_ceil(size))
            .map_err(|_| LinkError::argument("Too many bytes for one write"))?;

        let _guard = self.rmw.lock().await;
        let mut bytes = self.read_elements(address, elements, cancel).await?;
        if bytes.len() < data.len() {
            return Err(LinkError::protocol(format!(
                "Read {} bytes from {}, need {}",
                bytes.len(),
                address,
                data.len()
            )));
        }
        bytes[..data.len()].copy_from_slice(data);
        debug!("Byte write {} via read-modify-write of {} elements", address, elements);
        self.write_elements(address, size, &bytes, cancel).await
    }

    // ========================================================================
    // Packed reads
    // ========================================================================

    /// Plan packed reads for `variables`
    pub fn load_source_read(
        &self,
        variables: &[Variable],
        max_pack: u16,
        default_interval_ms: u64,
    ) -> PackResult {
        let result = pack(
            self.codec.as_ref(),
            variables,
            self.config.station.as_deref(),
            max_pack,
            default_interval_ms,
        );
        info!(
            "Device {}: {} variables packed into {} reads, {} rejected",
            self.config.display_name(),
            variables.len() - result.errors.len(),
            result.sources.len(),
            result.errors.len()
        );
        result
    }

    /// Fetch one planned source and decode every member
    ///
    /// A failed fetch fails every member with the same error; a member that
    /// cannot be decoded fails alone.
    pub async fn read_source(
        &self,
        source: &VariableSource,
        order: ByteOrder,
        cancel: &CancellationToken,
    ) -> Vec<(String, Result<Value>)> {
        let buffer = self.read_elements(&source.address, source.length, cancel).await;
        source
            .members
            .iter()
            .map(|member| {
                let value = match &buffer {
                    Ok(bytes) => member.decode(bytes, order),
                    Err(e) => Err(e.clone()),
                };
                (member.name.clone(), value)
            })
            .collect()
    }
}

/// Byte index and mask of bit `g`, counting from bit 0 of the first element
fn bit_position(g: usize, size: usize, reverse: bool) -> (usize, u8) {
    let bits_per_element = size * 8;
    let (element, within) = (g / bits_per_element, g % bits_per_element);
    let byte = if reverse {
        size - 1 - within / 8
    } else {
        within / 8
    };
    (element * size + byte, 1 << (within % 8))
}
