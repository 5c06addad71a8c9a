//! Shared fixtures for unit tests

use crate::adapter::{FrameFormat, HeaderDecision};

/// `0x7E sign_hi sign_lo len payload..`
#[derive(Debug)]
pub(crate) struct TaggedFormat;

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

pub(crate) fn tagged(sign: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = vec![0x7E];
    out.extend_from_slice(&(sign as u16).to_be_bytes());
    out.push(payload.len() as u8);
    out.extend_from_slice(payload);
    out
}
