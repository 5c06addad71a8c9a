//! Streaming frame adapter
//!
//! Turns an append-only byte stream into validated frames. Recognition is two
//! phase: once `header_len` bytes are buffered the [`FrameFormat`] announces
//! the body length (or asks to skip noise), then once the body is buffered the
//! whole span is validated. A failed validation never aborts the stream; the
//! reader drops `resync_skip` bytes and keeps scanning.
//!
//! One reader belongs to one channel (or one server session) and is fed in
//! strict arrival order.

use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

/// What the header says about the rest of the frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderDecision {
    /// Header is plausible; this many more bytes complete the frame
    Body(usize),
    /// Header is impossible; drop this many bytes and re-test
    Skip(usize),
}

/// Per-protocol framing rules
pub trait FrameFormat: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Bytes needed before `parse_header` can decide
    fn header_len(&self) -> usize;

    /// Inspect exactly `header_len` buffered bytes
    fn parse_header(&self, header: &[u8]) -> HeaderDecision;

    /// Verify a complete candidate frame (checksum, trailer)
    fn validate(&self, _frame: &[u8]) -> bool {
        true
    }

    /// In-band correlation tag, if the protocol carries one
    fn sign(&self, _frame: &[u8]) -> Option<u32> {
        None
    }

    /// Bytes dropped after a failed validation
    fn resync_skip(&self) -> usize {
        1
    }
}

/// One complete, validated protocol message
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
    header_len: usize,
    sign: Option<u32>,
}

impl Frame {
    pub fn new(bytes: impl Into<Bytes>, header_len: usize, sign: Option<u32>) -> Self {
        Self {
            bytes: bytes.into(),
            header_len,
            sign,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn header(&self) -> &[u8] {
        &self.bytes[..self.header_len.min(self.bytes.len())]
    }

    /// Everything after the header, checksum and trailer included
    pub fn body(&self) -> &[u8] {
        &self.bytes[self.header_len.min(self.bytes.len())..]
    }

    pub fn sign(&self) -> Option<u32> {
        self.sign
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("bytes", &crate::logging::to_hex(&self.bytes))
            .field("header_len", &self.header_len)
            .field("sign", &self.sign)
            .finish()
    }
}

/// Reassembly counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdapterStats {
    pub frames: u64,
    /// Bytes dropped while hunting for a header
    pub skipped_bytes: u64,
    pub checksum_failures: u64,
    /// Partial frames discarded for exceeding the cache timeout
    pub expired: u64,
}

/// Stateful reassembly buffer bound to one byte stream
pub struct FrameReader {
    format: Arc<dyn FrameFormat>,
    buffer: BytesMut,
    cache_timeout: Duration,
    residue_since: Option<Instant>,
    stats: AdapterStats,
}

impl FrameReader {
    pub fn new(format: Arc<dyn FrameFormat>, cache_timeout: Duration) -> Self {
        Self {
            format,
            buffer: BytesMut::with_capacity(512),
            cache_timeout,
            residue_since: None,
            stats: AdapterStats::default(),
        }
    }

    pub fn format(&self) -> &Arc<dyn FrameFormat> {
        &self.format
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats
    }

    /// Bytes of an incomplete frame still waiting for more input
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any residue, e.g. after the link was re-established
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.residue_since = None;
    }

    /// Append a chunk and return every frame it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.feed_at(chunk, Instant::now())
    }

    /// [`FrameReader::feed`] with an explicit arrival time
    pub fn feed_at(&mut self, chunk: &[u8], now: Instant) -> Vec<Frame> {
        if let Some(since) = self.residue_since {
            if !self.buffer.is_empty() && now.saturating_duration_since(since) > self.cache_timeout
            {
                debug!(
                    "{} partial frame expired: {} bytes dropped",
                    self.format.name(),
                    self.buffer.len()
                );
                self.stats.expired += 1;
                self.buffer.clear();
                self.residue_since = None;
            }
        }

        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }

        if self.buffer.is_empty() {
            self.residue_since = None;
        } else if self.residue_since.is_none() || !frames.is_empty() {
            self.residue_since = Some(now);
        }

        frames
    }

    fn next_frame(&mut self) -> Option<Frame> {
        let header_len = self.format.header_len();
        loop {
            if self.buffer.len() < header_len {
                return None;
            }

            match self.format.parse_header(&self.buffer[..header_len]) {
                HeaderDecision::Skip(n) => {
                    let n = n.clamp(1, self.buffer.len());
                    trace!("{} skip {} bytes", self.format.name(), n);
                    self.buffer.advance(n);
                    self.stats.skipped_bytes += n as u64;
                },
                HeaderDecision::Body(body_len) => {
                    let total = header_len + body_len;
                    if self.buffer.len() < total {
                        return None;
                    }

                    if !self.format.validate(&self.buffer[..total]) {
                        let n = self.format.resync_skip().clamp(1, total);
                        debug!(
                            "{} checksum mismatch, resync by {} bytes",
                            self.format.name(),
                            n
                        );
                        self.stats.checksum_failures += 1;
                        self.buffer.advance(n);
                        continue;
                    }

                    let bytes = self.buffer.split_to(total).freeze();
                    let sign = self.format.sign(&bytes);
                    self.stats.frames += 1;
                    return Some(Frame {
                        bytes,
                        header_len,
                        sign,
                    });
                },
            }
        }
    }
}

impl fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReader")
            .field("format", &self.format.name())
            .field("buffered", &self.buffer.len())
            .field("stats", &self.stats)
            .finish()
    }
}
