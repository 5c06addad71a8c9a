//! Request/response correlation
//!
//! Pairs each outbound request with the inbound frame that answers it. Frames
//! carrying an in-band sign (Modbus TCP transaction id, S7 PDU reference) are
//! matched by tag, in any order. Frames without one go to the oldest waiting
//! request whose matcher accepts them, which is plain FIFO once the channel
//! caps concurrency at one.
//!
//! Every pending entry is removed when its [`PendingRequest`] is dropped, so a
//! request that timed out or was cancelled never receives a late frame.

use crate::adapter::Frame;
use crate::error::{LinkError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Extra acceptance test for frames without an in-band sign
pub type FrameMatcher = Arc<dyn Fn(&Frame) -> bool + Send + Sync>;

/// Signs wrap at 16 bits, the widest tag the supported protocols carry
const SIGN_MASK: u32 = 0xFFFF;

struct Pending {
    sign: u32,
    matcher: Option<FrameMatcher>,
    tx: oneshot::Sender<Frame>,
}

pub struct Correlator {
    next_sign: AtomicU32,
    pending: Mutex<VecDeque<Pending>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_sign: AtomicU32::new(1),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Next sequence tag, never 0
    pub fn next_sign(&self) -> u32 {
        loop {
            let sign = self.next_sign.fetch_add(1, Ordering::Relaxed) & SIGN_MASK;
            if sign != 0 {
                return sign;
            }
        }
    }

    /// Register a waiter for `sign`
    pub fn register(&self, sign: u32, matcher: Option<FrameMatcher>) -> PendingRequest<'_> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().push_back(Pending { sign, matcher, tx });
        PendingRequest {
            correlator: self,
            sign,
            rx,
        }
    }

    /// Hand a frame to its waiter. Returns false when nobody claimed it.
    pub fn dispatch(&self, frame: Frame) -> bool {
        let mut pending = self.pending.lock();
        let index = match frame.sign() {
            Some(sign) => pending.iter().position(|p| p.sign == sign),
            None => pending
                .iter()
                .position(|p| p.matcher.as_ref().map_or(true, |accept| accept(&frame))),
        };

        match index.and_then(|i| pending.remove(i)) {
            Some(waiter) => {
                trace!("Frame matched sign {}", waiter.sign);
                waiter.tx.send(frame).is_ok()
            },
            None => {
                debug!("Unclaimed frame dropped: sign={:?}", frame.sign());
                false
            },
        }
    }

    /// Wake every waiter with a link failure
    pub fn fail_all(&self) {
        let dropped = {
            let mut pending = self.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped > 0 {
            debug!("Failed {} pending requests", dropped);
        }
    }

    /// Requests currently waiting for a frame
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }

    fn remove(&self, sign: u32) {
        let mut pending = self.pending.lock();
        if let Some(i) = pending.iter().position(|p| p.sign == sign) {
            pending.remove(i);
        }
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Completion slot of one in-flight request
pub struct PendingRequest<'a> {
    correlator: &'a Correlator,
    sign: u32,
    rx: oneshot::Receiver<Frame>,
}

impl PendingRequest<'_> {
    pub fn sign(&self) -> u32 {
        self.sign
    }

    /// Wait for the matching frame. Fails when the link drops the waiter.
    pub async fn response(&mut self) -> Result<Frame> {
        (&mut self.rx)
            .await
            .map_err(|_| LinkError::transport("Link closed while waiting for response"))
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.correlator.remove(self.sign);
    }
}
