//! Serial transport (RS-232/RS-485)

use super::{Link, Transport};
use crate::config::{Parity, SerialOptions, TransportKind};
use crate::error::{LinkError, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct SerialTransport {
    options: SerialOptions,
    timeout: Duration,
}

impl SerialTransport {
    pub fn new(options: SerialOptions, timeout: Duration) -> Self {
        Self { options, timeout }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.options.parity {
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::None => tokio_serial::Parity::None,
        }
    }

    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.options.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.options.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn endpoint(&self) -> String {
        format!("{}@{}", self.options.port, self.options.baud_rate)
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<Link> {
        if cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }
        debug!("Serial: {} @{}baud", self.options.port, self.options.baud_rate);

        match tokio_serial::new(&self.options.port, self.options.baud_rate)
            .data_bits(self.data_bits())
            .parity(self.parity())
            .stop_bits(self.stop_bits())
            .timeout(self.timeout)
            .open_native_async()
        {
            Ok(port) => {
                info!("Serial opened: {}", self.options.port);
                Ok(Link::from_stream(port, self.endpoint()))
            },
            Err(e) => {
                error!("Serial err: {} - {}", self.options.port, e);
                Err(LinkError::transport(format!(
                    "Failed to open serial port {}: {}",
                    self.options.port, e
                )))
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_port_fails_with_transport_error() {
        let transport = SerialTransport::new(
            SerialOptions {
                port: "/dev/fieldgate-no-such-port".to_string(),
                ..Default::default()
            },
            Duration::from_millis(100),
        );
        assert_eq!(transport.endpoint(), "/dev/fieldgate-no-such-port@9600");
        let err = transport
            .connect(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)));
    }
}
