//! TCP service channel
//!
//! Field devices (DTUs) dial in to a listening socket. A session opens with
//! its DTU id, either `dtu_id_length` bytes or text up to CR/LF/NUL. Bytes
//! behind the id go to the frame reader; after that the session behaves like
//! a client link with its own reassembly buffer, correlator and request
//! slots. Configured heartbeat chunks only refresh the idle clock.

use crate::adapter::{Frame, FrameFormat, FrameReader};
use crate::channel::{ChannelState, Handshake, Request, RequestChannel, READ_BUFFER_SIZE};
use crate::config::ChannelOptions;
use crate::correlator::Correlator;
use crate::error::{LinkError, Result};
use crate::logging::ChannelLogger;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// One registered DTU connection
struct Session {
    id: u64,
    dtu: String,
    peer: SocketAddr,
    reader: Mutex<FrameReader>,
    correlator: Correlator,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    slots: Semaphore,
    last_active: Mutex<Instant>,
    cancel: CancellationToken,
}

impl Session {
    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_active.lock())
    }

    fn close(&self) {
        self.cancel.cancel();
        self.correlator.fail_all();
        self.slots.close();
    }
}

struct ServiceInner {
    options: ChannelOptions,
    logger: ChannelLogger,
    format: RwLock<Arc<dyn FrameFormat>>,
    sessions: DashMap<String, Arc<Session>>,
    next_session: AtomicU64,
    state_tx: watch::Sender<ChannelState>,
    frames_tx: broadcast::Sender<Frame>,
    start_lock: tokio::sync::Mutex<()>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
}

impl ServiceInner {
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

    fn on_session_bytes(&self, session: &Session, chunk: &[u8]) {
        session.touch();
        if let Some(heartbeat) = &self.options.heartbeat {
            if chunk == heartbeat.as_bytes() {
                trace!("Heartbeat from DTU {}", session.dtu);
                return;
            }
        }

        self.logger.log_raw(chunk);
        let frames = session.reader.lock().feed(chunk);
        for frame in frames {
            self.logger.log_rx(frame.as_bytes());
            let _ = self.frames_tx.send(frame.clone());
            session.correlator.dispatch(frame);
        }
    }

    fn register(&self, dtu: String, peer: SocketAddr, writer: OwnedWriteHalf) -> Arc<Session> {
        let format = self.format.read().clone();
        let session = Arc::new(Session {
            id: self.next_session.fetch_add(1, Ordering::SeqCst),
            dtu: dtu.clone(),
            peer,
            reader: Mutex::new(FrameReader::new(format, self.options.cache_timeout())),
            correlator: Correlator::new(),
            writer: tokio::sync::Mutex::new(writer),
            slots: Semaphore::new(self.options.max_concurrent_count),
            last_active: Mutex::new(Instant::now()),
            cancel: self.shutdown.child_token(),
        });

        if let Some(old) = self.sessions.insert(dtu.clone(), session.clone()) {
            info!("DTU {} re-registered from {}, replacing {}", dtu, peer, old.peer);
            old.close();
        } else {
            info!("DTU registered: {} from {}", dtu, peer);
        }
        session
    }

    fn unregister(&self, session: &Session) {
        self.sessions.remove_if(&session.dtu, |_, s| s.id == session.id);
        session.close();
    }

    /// Write one request; a write cut short by the deadline or by
    /// cancellation closes the session, the DTU may have seen half a frame
    async fn send_to_session(
        &self,
        session: &Session,
        bytes: &[u8],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timeout_ms = self.options.timeout_ms;
        let mut writer = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            _ = session.cancel.cancelled() => return Err(LinkError::transport(format!(
                "DTU {} session closed",
                session.dtu
            ))),
            writer = tokio::time::timeout_at(deadline, session.writer.lock()) => writer
                .map_err(|_| LinkError::timeout(format!("DTU {} busy for {}ms", session.dtu, timeout_ms)))?,
        };
        self.logger.log_tx(bytes);

        let written = async {
            writer.write_all(bytes).await?;
            writer.flush().await
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LinkError::Cancelled),
            _ = session.cancel.cancelled() => Err(LinkError::transport(format!(
                "DTU {} session closed",
                session.dtu
            ))),
            written = tokio::time::timeout_at(deadline, written) => match written {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(LinkError::transport(format!(
                    "Send to DTU {} failed: {}",
                    session.dtu, e
                ))),
                Err(_) => Err(LinkError::timeout(format!(
                    "DTU {} not draining within {}ms",
                    session.dtu, timeout_ms
                ))),
            },
        };
        drop(writer);

        if let Err(e) = &result {
            warn!("DTU {} send aborted: {}", session.dtu, e);
            self.unregister(session);
        }
        result
    }

    /// Close sessions idle longer than `max_idle`, returns how many
    fn reap_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for(now) > max_idle)
            .map(|entry| entry.value().clone())
            .collect();

        for session in &stale {
            info!(
                "DTU {} idle for {}ms, closing",
                session.dtu,
                session.idle_for(now).as_millis()
            );
            self.unregister(session);
        }
        stale.len()
    }
}

async fn accept_loop(inner: Arc<ServiceInner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!("Session accepted: {}", peer);
                tokio::spawn(run_session(inner.clone(), stream, peer));
            },
            Err(e) => {
                inner.logger.log_error("accept", &e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            },
        }
    }
    debug!("Accept loop stopped: {}", inner.logger.name());
}

/// Split a registration packet into the DTU id and any frame bytes behind it
fn split_registration(packet: &[u8], id_length: Option<usize>) -> Option<(String, &[u8])> {
    let (id, rest) = match id_length {
        Some(len) => packet.split_at(len.min(packet.len())),
        None => {
            let end = packet
                .iter()
                .position(|&b| matches!(b, b'\r' | b'\n' | 0))
                .unwrap_or(packet.len());
            let (id, rest) = packet.split_at(end);
            let skip = rest
                .iter()
                .take_while(|&&b| matches!(b, b'\r' | b'\n' | 0))
                .count();
            (id, &rest[skip..])
        },
    };
    let dtu = String::from_utf8_lossy(id).trim().to_string();
    (!dtu.is_empty()).then_some((dtu, rest))
}

/// Read until the registration packet is complete; returns its length
async fn read_registration(
    inner: &ServiceInner,
    reader: &mut OwnedReadHalf,
    buf: &mut [u8],
) -> Option<usize> {
    let deadline = Instant::now() + inner.options.check_clear_time();
    let wanted = inner.options.dtu_id_length.unwrap_or(1).min(buf.len());
    let mut filled = 0;
    while filled < wanted {
        let read = tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => return None,
            read = tokio::time::timeout_at(deadline, reader.read(&mut buf[filled..])) => read,
        };
        match read {
            Ok(Ok(n)) if n > 0 => filled += n,
            _ => return None,
        }
    }
    Some(filled)
}

async fn run_session(inner: Arc<ServiceInner>, stream: TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("set_nodelay failed for {}: {}", peer, e);
    }
    let (mut reader, writer) = stream.into_split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let registration = read_registration(&inner, &mut reader, &mut buf)
        .await
        .and_then(|n| split_registration(&buf[..n], inner.options.dtu_id_length));
    let Some((dtu, rest)) = registration else {
        debug!("Session {} closed before registration", peer);
        return;
    };
    let session = inner.register(dtu, peer, writer);
    if !rest.is_empty() {
        inner.on_session_bytes(&session, rest);
    }

    loop {
        let read = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                info!("DTU {} disconnected", session.dtu);
                break;
            },
            Ok(n) => inner.on_session_bytes(&session, &buf[..n]),
            Err(e) => {
                warn!("DTU {} read failed: {}", session.dtu, e);
                break;
            },
        }
    }
    inner.unregister(&session);
}

async fn reap_loop(inner: Arc<ServiceInner>) {
    let period = inner.options.check_clear_time();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                inner.reap_idle(period);
            },
        }
    }
}

/// Listening channel serving many DTU sessions
pub struct ServiceChannel {
    inner: Arc<ServiceInner>,
}

impl ServiceChannel {
    pub fn new(options: ChannelOptions, format: Arc<dyn FrameFormat>) -> Result<Self> {
        options.validate()?;
        let logger = ChannelLogger::new(options.name.clone());
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (frames_tx, _) = broadcast::channel(64);

        Ok(Self {
            inner: Arc::new(ServiceInner {
                options,
                logger,
                format: RwLock::new(format),
                sessions: DashMap::new(),
                next_session: AtomicU64::new(1),
                state_tx,
                frames_tx,
                start_lock: tokio::sync::Mutex::new(()),
                local_addr: Mutex::new(None),
                shutdown: CancellationToken::new(),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Bound address once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Ids of currently registered DTUs
    pub fn sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn is_online(&self, dtu: &str) -> bool {
        self.inner.sessions.contains_key(dtu)
    }
}

#[async_trait]
impl RequestChannel for ServiceChannel {
    fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    fn state(&self) -> ChannelState {
        self.inner.state()
    }

    fn frame_format(&self) -> Arc<dyn FrameFormat> {
        self.inner.format.read().clone()
    }

    fn bind_protocol(&self, format: Arc<dyn FrameFormat>, handshake: Option<Arc<dyn Handshake>>) {
        if handshake.is_some() {
            warn!(
                "Channel {}: connect handshakes are not run on server sessions",
                self.inner.logger.name()
            );
        }
        *self.inner.format.write() = format;
    }

    /// Start listening; sessions attach as DTUs dial in
    async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(LinkError::Disposed);
        }
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            guard = inner.start_lock.lock() => guard,
        };
        if inner.state().is_connected() {
            return Ok(());
        }

        inner.set_state(ChannelState::Connecting, "bind");
        let listener = match TcpListener::bind(&inner.options.endpoint).await {
            Ok(listener) => listener,
            Err(e) => {
                inner.set_state(ChannelState::Disconnected, &e.to_string());
                return Err(LinkError::transport(format!(
                    "Bind {} failed: {}",
                    inner.options.endpoint, e
                )));
            },
        };
        let local = listener.local_addr()?;
        *inner.local_addr.lock() = Some(local);
        info!("TCP server listening: {}", local);

        tokio::spawn(accept_loop(inner.clone(), listener));
        tokio::spawn(reap_loop(inner.clone()));
        inner.set_state(ChannelState::Connected, &local.to_string());
        Ok(())
    }

    async fn send_then_return(
        &self,
        request: Request<'_>,
        cancel: &CancellationToken,
    ) -> Result<Frame> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(LinkError::Disposed);
        }
        if !inner.state().is_connected() {
            self.connect(cancel).await?;
        }

        let dtu = request
            .dtu()
            .map(str::to_string)
            .or_else(|| inner.options.dtu_id.clone())
            .ok_or_else(|| LinkError::argument("Request on a server channel needs a DTU id"))?;
        let session = inner
            .sessions
            .get(&dtu)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LinkError::transport(format!("DTU {} is not online", dtu)))?;

        let timeout = inner.options.timeout();
        let deadline = Instant::now() + timeout;
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            permit = session.slots.acquire() => permit
                .map_err(|_| LinkError::transport(format!("DTU {} session closed", dtu)))?,
            _ = tokio::time::sleep_until(deadline) => return Err(LinkError::timeout(format!(
                "No free request slot within {}ms",
                timeout.as_millis()
            ))),
        };

        let sign = session.correlator.next_sign();
        let bytes = request.encode(sign)?;
        let mut pending = session.correlator.register(sign, request.matcher());
        inner.send_to_session(&session, &bytes, deadline, cancel).await?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LinkError::Cancelled),
            result = tokio::time::timeout_at(deadline, pending.response()) => match result {
                Ok(frame) => frame,
                Err(_) => Err(LinkError::timeout(format!(
                    "No response from DTU {} within {}ms",
                    dtu,
                    timeout.as_millis()
                ))),
            },
        }
    }

    async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        inner.set_state(ChannelState::Closing, "close requested");
        inner.shutdown.cancel();
        for entry in inner.sessions.iter() {
            entry.value().close();
        }
        inner.sessions.clear();
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
        let max = self.inner.options.max_concurrent_count;
        self.inner
            .sessions
            .iter()
            .map(|e| max.saturating_sub(e.value().slots.available_permits()))
            .sum()
    }
}

impl Drop for ServiceChannel {
    fn drop(&mut self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.shutdown.cancel();
    }
}

impl fmt::Debug for ServiceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceChannel")
            .field("name", &self.inner.options.name)
            .field("endpoint", &self.inner.options.endpoint)
            .field("state", &self.inner.state())
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}
