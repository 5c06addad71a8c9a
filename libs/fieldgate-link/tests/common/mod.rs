//! Simulated field device helpers shared by the integration tests

#![allow(dead_code)]

use fieldgate_link::{FrameFormat, FrameReader, HeaderDecision};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

/// `0x7E sign_hi sign_lo len payload..`
#[derive(Debug)]
pub struct TaggedFormat;

impl FrameFormat for TaggedFormat {
    fn name(&self) -> &'static str {
        "tagged"
    }

    fn header_len(&self) -> usize {
        4
    }

    fn parse_header(&self, header: &[u8]) -> HeaderDecision {
        if header[0] != 0x7E {
            return HeaderDecision::Skip(1);
        }
        HeaderDecision::Body(header[3] as usize)
    }

    fn sign(&self, frame: &[u8]) -> Option<u32> {
        Some(u32::from(u16::from_be_bytes([frame[1], frame[2]])))
    }
}

pub fn tagged(sign: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x7E];
    out.extend_from_slice(&(sign as u16).to_be_bytes());
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    out
}

/// Echo every request back, one frame at a time
pub async fn echo_device(mut peer: DuplexStream) {
    let mut reader = FrameReader::new(Arc::new(TaggedFormat), Duration::from_secs(1));
    let mut buf = [0u8; 512];
    loop {
        let n = match peer.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        for frame in reader.feed(&buf[..n]) {
            if peer.write_all(frame.as_bytes()).await.is_err() {
                return;
            }
        }
    }
}

/// Device that answers in batches: it collects requests until the line goes
/// quiet for `quiet`, then echoes the whole batch. Returns the largest batch.
pub async fn batching_device(mut peer: DuplexStream, quiet: Duration, total: usize) -> usize {
    let mut reader = FrameReader::new(Arc::new(TaggedFormat), Duration::from_secs(5));
    let mut buf = [0u8; 512];
    let mut batch = Vec::new();
    let mut answered = 0;
    let mut largest = 0;

    while answered < total {
        match tokio::time::timeout(quiet, peer.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Ok(Ok(n)) => batch.extend(reader.feed(&buf[..n])),
            Err(_) => {
                largest = largest.max(batch.len());
                for frame in batch.drain(..) {
                    if peer.write_all(frame.as_bytes()).await.is_err() {
                        return largest;
                    }
                    answered += 1;
                }
            },
        }
    }
    largest
}
