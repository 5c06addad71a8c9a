//! Fieldgate link layer
//!
//! Channels that keep one logical connection to a field device alive,
//! reassemble frames out of an arbitrary byte stream and pair each outbound
//! request with the frame that answers it.
//!
//! - [`transport`]: byte pipes (TCP, UDP, serial, in-memory)
//! - [`adapter`]: streaming frame reassembly
//! - [`correlator`]: request/response matching
//! - [`channel`] / [`server`]: client and DTU-server channels
//! - [`reconnect`]: backoff schedules and the reconnection supervisor

pub mod adapter;
pub mod bytes;
pub mod channel;
pub mod config;
pub mod correlator;
pub mod error;
pub mod logging;
pub mod reconnect;
pub mod server;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use adapter::{AdapterStats, Frame, FrameFormat, FrameReader, HeaderDecision};
pub use channel::{ChannelState, ClientChannel, Handshake, Request, RequestChannel};
pub use config::{ChannelOptions, ReconnectOptions, ReconnectStrategy, TransportKind};
pub use correlator::{Correlator, FrameMatcher};
pub use error::{ErrorKind, LinkError, Result};
pub use reconnect::{ReconnectStats, ReconnectSupervisor};
pub use server::ServiceChannel;
pub use transport::{build_transport, Link, Transport};

use std::sync::Arc;

/// Build a channel for the options' transport kind
///
/// Server kinds get a [`ServiceChannel`]; every other kind dials out through
/// [`build_transport`].
pub fn open_channel(
    options: ChannelOptions,
    format: Arc<dyn FrameFormat>,
) -> Result<Arc<dyn RequestChannel>> {
    match options.kind {
        TransportKind::TcpServer => Ok(Arc::new(ServiceChannel::new(options, format)?)),
        _ => {
            let transport = build_transport(&options)?;
            Ok(Arc::new(ClientChannel::new(options, transport, format)?))
        },
    }
}
