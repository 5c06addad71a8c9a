//! Transport layer abstraction
//!
//! A transport only knows how to dial a byte pipe. It never frames messages:
//! the channel reads whatever chunks arrive and hands them to the frame
//! adapter in arrival order.

pub mod memory;
#[cfg(feature = "serial")]
pub mod serial;
pub mod tcp;
pub mod udp;

use crate::config::{ChannelOptions, TransportKind};
use crate::error::{LinkError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

pub use memory::{MemoryPeers, MemoryTransport};
#[cfg(feature = "serial")]
pub use serial::SerialTransport;
pub use tcp::TcpClientTransport;
pub use udp::UdpTransport;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One established byte pipe, split into its read and write halves
pub struct Link {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    /// Remote end description for logs
    pub peer: String,
}

impl Link {
    pub fn new(reader: BoxedReader, writer: BoxedWriter, peer: impl Into<String>) -> Self {
        Self {
            reader,
            writer,
            peer: peer.into(),
        }
    }

    /// Split any duplex stream into a link
    pub fn from_stream<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(Box::new(reader), Box::new(writer), peer)
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("peer", &self.peer).finish()
    }
}

/// Dials byte pipes for a client channel
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Remote endpoint description
    fn endpoint(&self) -> String;

    /// Open a fresh link. Called on first connect and on every reconnect.
    async fn connect(&self, cancel: &CancellationToken) -> Result<Link>;
}

/// Build the transport a client channel's options describe
pub fn build_transport(options: &ChannelOptions) -> Result<Arc<dyn Transport>> {
    options.validate()?;
    match options.kind {
        TransportKind::TcpClient => Ok(Arc::new(TcpClientTransport::new(
            options.endpoint.clone(),
            options.connect_timeout(),
        ))),
        TransportKind::Udp => Ok(Arc::new(UdpTransport::new(options.endpoint.clone()))),
        #[cfg(feature = "serial")]
        TransportKind::Serial => {
            let serial = options
                .serial
                .clone()
                .ok_or_else(|| LinkError::config("Serial channel needs serial options"))?;
            Ok(Arc::new(SerialTransport::new(serial, options.timeout())))
        },
        #[cfg(not(feature = "serial"))]
        TransportKind::Serial => Err(LinkError::config(
            "Serial support not compiled in (enable the `serial` feature)",
        )),
        TransportKind::TcpServer => Err(LinkError::config(
            "TCP server channels accept connections, use ServiceChannel",
        )),
        TransportKind::Other => Err(LinkError::config(
            "Transport kind 'other' needs an explicit transport instance",
        )),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_build_transport_kinds() {
        let options = ChannelOptions {
            endpoint: "127.0.0.1:502".to_string(),
            ..Default::default()
        };
        let transport = build_transport(&options).unwrap();
        assert_eq!(transport.kind(), TransportKind::TcpClient);
        assert_eq!(transport.endpoint(), "127.0.0.1:502");

        let options = ChannelOptions {
            kind: TransportKind::Udp,
            endpoint: "127.0.0.1:502".to_string(),
            ..Default::default()
        };
        assert_eq!(build_transport(&options).unwrap().kind(), TransportKind::Udp);

        let options = ChannelOptions {
            kind: TransportKind::TcpServer,
            endpoint: "0.0.0.0:9000".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            build_transport(&options),
            Err(LinkError::Config(_))
        ));
    }
}
