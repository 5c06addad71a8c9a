//! In-memory transport for tests and embedding
//!
//! Every `connect` creates a fresh `tokio::io::duplex` pipe. The channel keeps
//! one end, the other end is queued on [`MemoryPeers`] where a test (or a
//! simulated field device) picks it up.

use super::{Link, Transport};
use crate::config::TransportKind;
use crate::error::{LinkError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const PIPE_CAPACITY: usize = 8 * 1024;

#[derive(Debug)]
pub struct MemoryTransport {
    name: String,
    peers: mpsc::UnboundedSender<DuplexStream>,
    refuse: AtomicBool,
    connects: AtomicU32,
}

/// Device side of a [`MemoryTransport`]
#[derive(Debug)]
pub struct MemoryPeers {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MemoryPeers {
    /// Wait for the next link the channel opens
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }
}

impl MemoryTransport {
    pub fn new(name: impl Into<String>) -> (Self, MemoryPeers) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                name: name.into(),
                peers: tx,
                refuse: AtomicBool::new(false),
                connects: AtomicU32::new(0),
            },
            MemoryPeers { rx },
        )
    }

    /// Make subsequent connects fail like a refused TCP dial
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of connect attempts so far, failed ones included
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Other
    }

    fn endpoint(&self) -> String {
        format!("memory://{}", self.name)
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<Link> {
        if cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst) + 1;
        if self.refuse.load(Ordering::SeqCst) {
            debug!("Memory refused: {} (attempt {})", self.name, attempt);
            return Err(LinkError::transport(format!(
                "Connection refused: {}",
                self.endpoint()
            )));
        }

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        self.peers
            .send(remote)
            .map_err(|_| LinkError::transport("Memory peer side dropped"))?;
        debug!("Memory connected: {}", self.name);
        Ok(Link::from_stream(local, self.endpoint()))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_memory_link_pairs_with_peer() {
        let (transport, mut peers) = MemoryTransport::new("unit");
        let mut link = transport.connect(&CancellationToken::new()).await.unwrap();
        let mut peer = peers.accept().await.unwrap();

        link.writer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        link.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_refuse_counts_attempts() {
        let (transport, _peers) = MemoryTransport::new("unit");
        transport.set_refuse(true);
        assert!(transport.connect(&CancellationToken::new()).await.is_err());
        assert!(transport.connect(&CancellationToken::new()).await.is_err());
        assert_eq!(transport.connect_count(), 2);
    }
}
