//! TCP client transport

use super::{Link, Transport};
use crate::config::TransportKind;
use crate::error::{LinkError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct TcpClientTransport {
    endpoint: String,
    connect_timeout: Duration,
}

impl TcpClientTransport {
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Transport for TcpClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::TcpClient
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<Link> {
        debug!("TCP connecting: {}", self.endpoint);

        let attempt = timeout(self.connect_timeout, TcpStream::connect(&self.endpoint));
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            outcome = attempt => outcome,
        };

        match outcome {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                let peer = stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| self.endpoint.clone());
                info!("TCP connected: {}", peer);

                let (reader, writer) = stream.into_split();
                Ok(Link::new(Box::new(reader), Box::new(writer), peer))
            },
            Ok(Err(e)) => {
                error!("TCP err: {} - {}", self.endpoint, e);
                Err(LinkError::transport(format!(
                    "Failed to connect to {}: {}",
                    self.endpoint, e
                )))
            },
            Err(_) => {
                warn!("TCP timeout: {}", self.endpoint);
                Err(LinkError::transport(format!(
                    "Connection to {} timed out",
                    self.endpoint
                )))
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let transport = TcpClientTransport::new(addr, Duration::from_secs(1));
        let mut link = transport.connect(&CancellationToken::new()).await.unwrap();
        link.writer.write_all(&[1, 2, 3, 4]).await.unwrap();
        let mut echo = [0u8; 4];
        link.reader.read_exact(&mut echo).await.unwrap();
        assert_eq!(echo, [1, 2, 3, 4]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused_is_transport_error() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = TcpClientTransport::new(addr, Duration::from_secs(1));
        let err = transport
            .connect(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.needs_reconnect());
    }

    #[tokio::test]
    async fn test_connect_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let transport = TcpClientTransport::new("10.255.255.1:502", Duration::from_secs(5));
        let err = transport.connect(&cancel).await.unwrap_err();
        assert_eq!(err, LinkError::Cancelled);
    }
}
