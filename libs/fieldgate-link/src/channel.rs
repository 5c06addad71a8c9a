//! Client channel
//!
//! A channel owns one transport and keeps one logical connection alive over
//! it. Outbound requests pass a counting semaphore sized by
//! `max_concurrent_count`; inbound chunks are reassembled by the channel's
//! [`FrameReader`] and handed to the [`Correlator`].
//!
//! State machine: `Disconnected -> Connecting -> Connected -> Disconnected`,
//! with `Closing` while an explicit close tears the link down. One connect
//! attempt runs at a time: callers arriving while it is in flight share its
//! outcome, success or failure, instead of dialing again.
//!
//! A request's timeout covers both the write and the wait for the answer. A
//! write that is cut short by the deadline or by cancellation drops the link,
//! since the peer may have seen half a frame.

use crate::adapter::{AdapterStats, Frame, FrameFormat, FrameReader};
use crate::config::ChannelOptions;
use crate::correlator::{Correlator, FrameMatcher};
use crate::error::{LinkError, Result};
use crate::logging::ChannelLogger;
use crate::reconnect::{Reconnect, ReconnectSupervisor};
use crate::transport::{BoxedReader, BoxedWriter, Link, Transport};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, watch, Semaphore, SemaphorePermit};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub(crate) const READ_BUFFER_SIZE: usize = 8 * 1024;
const FRAME_BROADCAST_CAPACITY: usize = 64;

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ChannelState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ChannelState::Connected)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Disconnected => "DISCONNECTED",
            ChannelState::Connecting => "CONNECTING",
            ChannelState::Connected => "CONNECTED",
            ChannelState::Closing => "CLOSING",
        };
        f.write_str(name)
    }
}

type BuildFn<'a> = Box<dyn Fn(u32) -> Result<Vec<u8>> + Send + Sync + 'a>;

/// One outbound request
///
/// The wire bytes are produced lazily from the sign the correlator assigns,
/// so protocols with an in-band id (transaction id, PDU reference) can embed
/// it.
pub struct Request<'a> {
    build: BuildFn<'a>,
    matcher: Option<FrameMatcher>,
    dtu: Option<String>,
}

impl<'a> Request<'a> {
    pub fn new(build: impl Fn(u32) -> Result<Vec<u8>> + Send + Sync + 'a) -> Self {
        Self {
            build: Box::new(build),
            matcher: None,
            dtu: None,
        }
    }

    /// Request whose bytes do not depend on the sign
    pub fn fixed(bytes: Vec<u8>) -> Request<'static> {
        Request::new(move |_| Ok(bytes.clone()))
    }

    /// Only accept untagged frames this matcher approves
    pub fn with_matcher(mut self, matcher: FrameMatcher) -> Self {
        self.matcher = Some(matcher);
        self
    }

    /// Target DTU on a server channel
    pub fn to_dtu(mut self, dtu: impl Into<String>) -> Self {
        self.dtu = Some(dtu.into());
        self
    }

    pub fn dtu(&self) -> Option<&str> {
        self.dtu.as_deref()
    }

    pub fn encode(&self, sign: u32) -> Result<Vec<u8>> {
        (self.build)(sign)
    }

    pub fn matcher(&self) -> Option<FrameMatcher> {
        self.matcher.clone()
    }
}

impl fmt::Debug for Request<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("dtu", &self.dtu)
            .field("matcher", &self.matcher.is_some())
            .finish()
    }
}

/// Exchange run on every fresh link before the channel reports `Connected`
pub trait Handshake: Send + Sync + fmt::Debug {
    fn steps(&self) -> usize;

    fn build(&self, step: usize, sign: u32) -> Result<Vec<u8>>;

    fn check(&self, step: usize, frame: &Frame) -> Result<()>;
}

/// Request/response surface shared by client and server channels
#[async_trait]
pub trait RequestChannel: Send + Sync + fmt::Debug {
    fn options(&self) -> &ChannelOptions;

    fn state(&self) -> ChannelState;

    /// Framing rules currently applied to inbound bytes
    fn frame_format(&self) -> Arc<dyn FrameFormat>;

    /// Swap in a protocol's framing rules and connect handshake
    fn bind_protocol(&self, format: Arc<dyn FrameFormat>, handshake: Option<Arc<dyn Handshake>>);

    async fn connect(&self, cancel: &CancellationToken) -> Result<()>;

    /// Send one request and wait for the frame that answers it
    async fn send_then_return(
        &self,
        request: Request<'_>,
        cancel: &CancellationToken,
    ) -> Result<Frame>;

    async fn close(&self) -> Result<()>;

    /// Every validated inbound frame, claimed or not
    fn subscribe_frames(&self) -> broadcast::Receiver<Frame>;

    fn subscribe_state(&self) -> watch::Receiver<ChannelState>;

    /// Requests currently past slot acquisition
    fn in_flight(&self) -> usize;
}

/// Outcome of the connect attempt in flight, `None` until it finishes
type AttemptOutcome = watch::Receiver<Option<Result<()>>>;

struct ActiveLink {
    generation: u64,
    writer: BoxedWriter,
    cancel: CancellationToken,
}

struct ClientInner {
    me: Weak<ClientInner>,
    options: ChannelOptions,
    transport: Arc<dyn Transport>,
    logger: ChannelLogger,
    reader: Mutex<FrameReader>,
    handshake: RwLock<Option<Arc<dyn Handshake>>>,
    link: tokio::sync::Mutex<Option<ActiveLink>>,
    generation: AtomicU64,
    state_tx: watch::Sender<ChannelState>,
    slots: Semaphore,
    correlator: Correlator,
    frames_tx: broadcast::Sender<Frame>,
    attempt: Mutex<Option<AttemptOutcome>>,
    supervisor: Arc<ReconnectSupervisor>,
    supervisor_started: AtomicBool,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl ClientInner {
    fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, new_state: ChannelState, reason: &str) {
        let old_state = *self.state_tx.borrow();
        if old_state != new_state {
            self.state_tx.send_replace(new_state);
            self.logger.log_status(old_state, new_state, reason);
        }
    }

    fn ensure_supervisor(&self) {
        if self.options.reconnect.enabled && !self.supervisor_started.swap(true, Ordering::SeqCst)
        {
            self.supervisor.spawn(self.me.clone());
        }
    }

    fn on_bytes_received(&self, chunk: &[u8]) {
        self.logger.log_raw(chunk);
        let frames = self.reader.lock().feed(chunk);
        for frame in frames {
            self.logger.log_rx(frame.as_bytes());
            let _ = self.frames_tx.send(frame.clone());
            self.correlator.dispatch(frame);
        }
    }

    async fn establish(&self, cancel: &CancellationToken) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(LinkError::Disposed);
        }
        if self.state().is_connected() {
            return Ok(());
        }

        let mut outcome = self.join_attempt();
        let shared = async {
            outcome
                .wait_for(Option::is_some)
                .await
                .map(|done| done.clone())
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LinkError::Cancelled),
            done = shared => match done {
                Ok(Some(result)) => result,
                _ => Err(LinkError::Disposed),
            },
        }
    }

    /// Subscribe to the attempt in flight, starting one if there is none
    ///
    /// The attempt runs on its own task under the channel's shutdown token, so
    /// a caller giving up does not abort it for the others.
    fn join_attempt(&self) -> AttemptOutcome {
        let mut slot = self.attempt.lock();
        if let Some(outcome) = slot.as_ref() {
            return outcome.clone();
        }

        let (tx, rx) = watch::channel(None);
        *slot = Some(rx.clone());
        drop(slot);

        let me = self.me.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            let Some(inner) = me.upgrade() else {
                return;
            };
            let result = inner.dial(&cancel).await;
            *inner.attempt.lock() = None;
            tx.send_replace(Some(result));
        });
        rx
    }

    async fn dial(&self, cancel: &CancellationToken) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(LinkError::Disposed);
        }
        if self.state().is_connected() {
            return Ok(());
        }

        self.set_state(ChannelState::Connecting, "connect");
        self.logger
            .log_connect(self.transport.kind(), &self.transport.endpoint());

        let link = match self.transport.connect(cancel).await {
            Ok(link) => link,
            Err(e) => {
                self.set_state(ChannelState::Disconnected, &e.to_string());
                return Err(e);
            },
        };
        let peer = link.peer.clone();
        let generation = self.install_link(link).await;

        if let Err(e) = self.run_handshake(cancel).await {
            self.drop_link(generation).await;
            self.set_state(ChannelState::Disconnected, "handshake failed");
            return Err(e);
        }

        let link = self.link.lock().await;
        match link.as_ref() {
            Some(active) if active.generation == generation => {
                self.set_state(ChannelState::Connected, &peer);
                Ok(())
            },
            _ => Err(LinkError::transport("Link lost during connect")),
        }
    }

    async fn install_link(&self, link: Link) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.reader.lock().reset();

        let Link { reader, writer, .. } = link;
        let cancel = self.shutdown.child_token();
        let previous = self.link.lock().await.replace(ActiveLink {
            generation,
            writer,
            cancel: cancel.clone(),
        });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        tokio::spawn(read_loop(self.me.clone(), reader, cancel, generation));
        generation
    }

    /// Drop the link if it is still the given generation
    async fn drop_link(&self, generation: u64) -> bool {
        let mut link = self.link.lock().await;
        match link.as_ref() {
            Some(active) if active.generation == generation => {},
            _ => return false,
        }
        if let Some(mut active) = link.take() {
            active.cancel.cancel();
            let _ = active.writer.shutdown().await;
        }
        drop(link);
        self.correlator.fail_all();
        true
    }

    async fn link_lost(&self, generation: u64, reason: &str) {
        if !self.drop_link(generation).await {
            return;
        }
        if self.disposed.load(Ordering::SeqCst) || self.state() == ChannelState::Closing {
            return;
        }
        self.set_state(ChannelState::Disconnected, reason);
        if self.options.reconnect.enabled {
            self.supervisor.wake();
        }
    }

    async fn run_handshake(&self, cancel: &CancellationToken) -> Result<()> {
        let handshake = self.handshake.read().clone();
        let Some(handshake) = handshake else {
            return Ok(());
        };

        for step in 0..handshake.steps() {
            let builder = handshake.clone();
            let request = Request::new(move |sign| builder.build(step, sign));
            let frame = self.exchange(&request, cancel).await?;
            handshake.check(step, &frame)?;
            debug!("Handshake step {} ok: {}", step, self.logger.name());
        }
        Ok(())
    }

    async fn acquire_slot(&self, cancel: &CancellationToken) -> Result<SemaphorePermit<'_>> {
        let timeout = self.options.timeout();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LinkError::Cancelled),
            permit = self.slots.acquire() => permit.map_err(|_| LinkError::Disposed),
            _ = tokio::time::sleep(timeout) => Err(LinkError::timeout(format!(
                "No free request slot within {}ms",
                timeout.as_millis()
            ))),
        }
    }

    async fn write_frame(
        &self,
        bytes: &[u8],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeout_ms = self.options.timeout_ms;
        let mut link = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            _ = self.shutdown.cancelled() => return Err(LinkError::Disposed),
            link = tokio::time::timeout_at(deadline, self.link.lock()) => link.map_err(|_| {
                LinkError::timeout(format!("Link busy for {}ms", timeout_ms))
            })?,
        };
        let Some(active) = link.as_mut() else {
            return Err(LinkError::transport("Not connected"));
        };
        self.logger.log_tx(bytes);

        let generation = active.generation;
        let writer = &mut active.writer;
        let written = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LinkError::Cancelled),
            _ = self.shutdown.cancelled() => Err(LinkError::Disposed),
            written = tokio::time::timeout_at(deadline, written) => match written {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(LinkError::transport(format!("Send failed: {}", e))),
                Err(_) => Err(LinkError::timeout(format!(
                    "Send not drained within {}ms",
                    timeout_ms
                ))),
            },
        };
        drop(link);

        if let Err(e) = &result {
            self.logger.log_error("send", e);
            self.link_lost(generation, &e.to_string()).await;
        }
        result
    }

    async fn exchange(&self, request: &Request<'_>, cancel: &CancellationToken) -> Result<Frame> {
        let timeout = self.options.timeout();
        let deadline = Instant::now() + timeout;
        let sign = self.correlator.next_sign();
        let bytes = request.encode(sign)?;
        let mut pending = self.correlator.register(sign, request.matcher());
        self.write_frame(&bytes, deadline, cancel).await?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LinkError::Cancelled),
            result = tokio::time::timeout_at(deadline, pending.response()) => match result {
                Ok(frame) => frame,
                Err(_) => Err(LinkError::timeout(format!(
                    "No response within {}ms (sign {})",
                    timeout.as_millis(),
                    sign
                ))),
            },
        }
    }
}

#[async_trait]
impl Reconnect for ClientInner {
    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Result<()> {
        self.establish(cancel).await
    }
}

async fn read_loop(
    inner: Weak<ClientInner>,
    mut reader: BoxedReader,
    cancel: CancellationToken,
    generation: u64,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match read {
            Ok(0) => {
                inner.link_lost(generation, "closed by peer").await;
                return;
            },
            Ok(n) => inner.on_bytes_received(&buf[..n]),
            Err(e) => {
                inner.link_lost(generation, &e.to_string()).await;
                return;
            },
        }
    }
}

/// Channel that dials out through a [`Transport`] and supervises the link
pub struct ClientChannel {
    inner: Arc<ClientInner>,
}

impl ClientChannel {
    pub fn new(
        options: ChannelOptions,
        transport: Arc<dyn Transport>,
        format: Arc<dyn FrameFormat>,
    ) -> Result<Self> {
        if options.max_concurrent_count == 0 {
            return Err(LinkError::config("max_concurrent_count must be at least 1"));
        }
        if options.timeout_ms == 0 {
            return Err(LinkError::config("timeout_ms must be greater than 0"));
        }

        let logger = ChannelLogger::new(options.name.clone());
        let shutdown = CancellationToken::new();
        let supervisor = ReconnectSupervisor::new(
            options.reconnect.clone(),
            logger.clone(),
            shutdown.child_token(),
        );
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (frames_tx, _) = broadcast::channel(FRAME_BROADCAST_CAPACITY);
        let reader = FrameReader::new(format, options.cache_timeout());

        info!(
            "Channel created: {} ({} {})",
            options.name,
            transport.kind(),
            transport.endpoint()
        );

        let inner = Arc::new_cyclic(|me| ClientInner {
            me: me.clone(),
            slots: Semaphore::new(options.max_concurrent_count),
            options,
            transport,
            logger,
            reader: Mutex::new(reader),
            handshake: RwLock::new(None),
            link: tokio::sync::Mutex::new(None),
            generation: AtomicU64::new(0),
            state_tx,
            correlator: Correlator::new(),
            frames_tx,
            attempt: Mutex::new(None),
            supervisor,
            supervisor_started: AtomicBool::new(false),
            shutdown,
            disposed: AtomicBool::new(false),
        });

        Ok(Self { inner })
    }

    /// Push-style inbound notification; the read loop calls this per chunk
    pub fn on_bytes_received(&self, chunk: &[u8]) {
        self.inner.on_bytes_received(chunk);
    }

    pub fn supervisor(&self) -> &Arc<ReconnectSupervisor> {
        &self.inner.supervisor
    }

    pub fn adapter_stats(&self) -> AdapterStats {
        self.inner.reader.lock().stats()
    }

    pub fn logger(&self) -> &ChannelLogger {
        &self.inner.logger
    }
}

#[async_trait]
impl RequestChannel for ClientChannel {
    fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    fn state(&self) -> ChannelState {
        self.inner.state()
    }

    fn frame_format(&self) -> Arc<dyn FrameFormat> {
        self.inner.reader.lock().format().clone()
    }

    fn bind_protocol(&self, format: Arc<dyn FrameFormat>, handshake: Option<Arc<dyn Handshake>>) {
        debug!(
            "Channel {} bound to {} framing",
            self.inner.logger.name(),
            format.name()
        );
        *self.inner.reader.lock() = FrameReader::new(format, self.inner.options.cache_timeout());
        *self.inner.handshake.write() = handshake;
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        self.inner.ensure_supervisor();
        match self.inner.establish(cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.inner.options.reconnect.enabled
                    && !matches!(e, LinkError::Cancelled | LinkError::Disposed)
                {
                    self.inner.supervisor.wake();
                }
                Err(e)
            },
        }
    }

    async fn send_then_return(
        &self,
        request: Request<'_>,
        cancel: &CancellationToken,
    ) -> Result<Frame> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(LinkError::Disposed);
        }
        if !self.inner.state().is_connected() {
            self.connect(cancel).await?;
        }

        let _permit = self.inner.acquire_slot(cancel).await?;
        self.inner.exchange(&request, cancel).await
    }

    async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.set_state(ChannelState::Closing, "close requested");
        inner.shutdown.cancel();

        let active = inner.link.lock().await.take();
        if let Some(mut active) = active {
            active.cancel.cancel();
            let _ = active.writer.shutdown().await;
        }
        inner.correlator.fail_all();
        inner.slots.close();
        inner.set_state(ChannelState::Disconnected, "closed");
        Ok(())
    }

    fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
        self.inner.frames_tx.subscribe()
    }

    fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    fn in_flight(&self) -> usize {
        self.inner
            .options
            .max_concurrent_count
            .saturating_sub(self.inner.slots.available_permits())
    }
}

impl Drop for ClientChannel {
    fn drop(&mut self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
    }
}

impl fmt::Debug for ClientChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientChannel")
            .field("name", &self.inner.options.name)
            .field("endpoint", &self.inner.transport.endpoint())
            .field("state", &self.inner.state())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::test_support::{tagged, TaggedFormat};
    use crate::transport::MemoryTransport;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn options() -> ChannelOptions {
        ChannelOptions {
            name: "unit".to_string(),
            kind: crate::config::TransportKind::Other,
            timeout_ms: 500,
            max_concurrent_count: 2,
            ..Default::default()
        }
    }

    async fn echo_peer(mut peer: DuplexStream) {
        let mut buf = [0u8; 256];
        loop {
            let n = match peer.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            if peer.write_all(&buf[..n]).await.is_err() {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_connect_and_echo() {
        let (transport, mut peers) = MemoryTransport::new("echo");
        let channel = ClientChannel::new(options(), Arc::new(transport), Arc::new(TaggedFormat))
            .unwrap();
        let cancel = CancellationToken::new();

        channel.connect(&cancel).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Connected);
        tokio::spawn(echo_peer(peers.accept().await.unwrap()));

        let request = Request::new(|sign| Ok(tagged(sign, b"hi")));
        let frame = channel.send_then_return(request, &cancel).await.unwrap();
        assert_eq!(&frame.body()[..], b"hi");
        assert_eq!(channel.in_flight(), 0);

        channel.close().await.unwrap();
        let err = channel
            .send_then_return(Request::fixed(tagged(1, b"x")), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::Disposed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_response() {
        let (transport, mut peers) = MemoryTransport::new("silent");
        let channel = ClientChannel::new(options(), Arc::new(transport), Arc::new(TaggedFormat))
            .unwrap();
        let cancel = CancellationToken::new();
        channel.connect(&cancel).await.unwrap();
        let _peer = peers.accept().await.unwrap();

        let err = channel
            .send_then_return(Request::fixed(tagged(1, b"x")), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout(_)));
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let (transport, mut peers) = MemoryTransport::new("silent");
        let channel = ClientChannel::new(options(), Arc::new(transport), Arc::new(TaggedFormat))
            .unwrap();
        let cancel = CancellationToken::new();
        channel.connect(&cancel).await.unwrap();
        let _peer = peers.accept().await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = channel
            .send_then_return(Request::fixed(tagged(1, b"x")), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::Cancelled);
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_connect_dials_once() {
        let (transport, mut peers) = MemoryTransport::new("once");
        let transport = Arc::new(transport);
        let channel = Arc::new(
            ClientChannel::new(options(), transport.clone(), Arc::new(TaggedFormat)).unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..5 {
            let channel = channel.clone();
            handles.push(tokio::spawn(async move {
                channel.connect(&CancellationToken::new()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(transport.connect_count(), 1);
        assert!(peers.accept().await.is_some());
    }

    fn without_reconnect() -> ChannelOptions {
        ChannelOptions {
            reconnect: crate::config::ReconnectOptions {
                enabled: false,
                ..Default::default()
            },
            ..options()
        }
    }

    #[tokio::test]
    async fn test_failed_connect_shared_by_waiters() {
        let (transport, _peers) = MemoryTransport::new("refused");
        transport.set_refuse(true);
        let transport = Arc::new(transport);
        let channel = Arc::new(
            ClientChannel::new(without_reconnect(), transport.clone(), Arc::new(TaggedFormat))
                .unwrap(),
        );

        let mut handles = Vec::new();
        for _ in 0..5 {
            let channel = channel.clone();
            handles.push(tokio::spawn(async move {
                channel.connect(&CancellationToken::new()).await
            }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, LinkError::Transport(_)), "{:?}", err);
        }
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(channel.state(), ChannelState::Disconnected);

        // A later call starts a fresh attempt
        transport.set_refuse(false);
        channel.connect(&CancellationToken::new()).await.unwrap();
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_times_out() {
        let (transport, mut peers) = MemoryTransport::new("stalled");
        let channel =
            ClientChannel::new(without_reconnect(), Arc::new(transport), Arc::new(TaggedFormat))
                .unwrap();
        channel.connect(&CancellationToken::new()).await.unwrap();
        // Keep the peer open but never read from it
        let _peer = peers.accept().await.unwrap();

        let request = Request::fixed(vec![0x7E; 64 * 1024]);
        let err = channel
            .send_then_return(request, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout(_)), "{:?}", err);
        assert_eq!(channel.in_flight(), 0);
        assert_eq!(channel.state(), ChannelState::Disconnected);

        tokio::time::timeout(Duration::from_secs(1), channel.close())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_write_cancelled() {
        let (transport, mut peers) = MemoryTransport::new("stalled");
        let channel =
            ClientChannel::new(without_reconnect(), Arc::new(transport), Arc::new(TaggedFormat))
                .unwrap();
        let cancel = CancellationToken::new();
        channel.connect(&cancel).await.unwrap();
        let _peer = peers.accept().await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = channel
            .send_then_return(Request::fixed(vec![0x7E; 64 * 1024]), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(channel.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_frame_notification() {
        let (transport, mut peers) = MemoryTransport::new("push");
        let channel = ClientChannel::new(options(), Arc::new(transport), Arc::new(TaggedFormat))
            .unwrap();
        let mut frames = channel.subscribe_frames();
        channel.connect(&CancellationToken::new()).await.unwrap();
        let mut peer = peers.accept().await.unwrap();

        // Unsolicited frame: nobody waits for it, subscribers still see it
        peer.write_all(&tagged(42, b"evt")).await.unwrap();
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.sign(), Some(42));
    }
}
