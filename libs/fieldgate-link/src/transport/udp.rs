//! UDP transport
//!
//! A connected socket exposed as a byte pipe: each read yields one datagram,
//! each write sends one datagram. The frame adapter does not care that
//! boundaries happen to line up.

use super::{Link, Transport};
use crate::config::TransportKind;
use crate::error::{LinkError, Result};
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct UdpTransport {
    endpoint: String,
}

impl UdpTransport {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    async fn open(&self) -> Result<UdpSocket> {
        let remote = tokio::net::lookup_host(&self.endpoint)
            .await
            .map_err(|e| LinkError::transport(format!("Resolve {}: {}", self.endpoint, e)))?
            .next()
            .ok_or_else(|| LinkError::transport(format!("No address for {}", self.endpoint)))?;

        let local = if remote.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;
        Ok(socket)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn endpoint(&self) -> String {
        self.endpoint.clone()
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<Link> {
        debug!("UDP connecting: {}", self.endpoint);
        let socket = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            socket = self.open() => socket?,
        };
        info!("UDP ready: {}", self.endpoint);

        let socket = Arc::new(socket);
        Ok(Link::new(
            Box::new(UdpPipe {
                socket: socket.clone(),
            }),
            Box::new(UdpPipe { socket }),
            self.endpoint.clone(),
        ))
    }
}

/// Datagram socket adapted to the stream traits
struct UdpPipe {
    socket: Arc<UdpSocket>,
}

impl AsyncRead for UdpPipe {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpPipe {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
