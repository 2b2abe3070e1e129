//! Peer connections
//!
//! Each connection runs two threads: a reader that frames and decodes
//! inbound messages, and a loop that selects over outbound messages,
//! decoded inbound messages, the handshake/ping/tick timers and the
//! cancellation signals. Teardown runs exactly once, from the loop thread.

use crate::config::NetworkParams;
use crate::constants::*;
use crate::encode::CodecError;
use crate::error::lock;
use crate::message::{read_message, write_message};
use crate::network::{NetworkAddress, NetworkMessage, VersionMessage};
use crate::types::HashId;
use crossbeam_channel::{after, bounded, never, select, tick, Receiver, RecvTimeoutError, Sender, TrySendError};
use siphasher::sip::SipHasher24;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hasher;
use std::io::{BufReader, ErrorKind};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Known-inventory entries kept per peer before the filter is reset
const MAX_KNOWN_INVENTORY: usize = 50_000;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("could not connect to {addr} after {attempts} attempts")]
    DialExhausted { addr: SocketAddr, attempts: u32 },

    #[error("connection cancelled")]
    Cancelled,

    #[error("panic in connection thread: {0}")]
    Panic(String),

    #[error("socket write blocked for more than {0:?}")]
    WriteTimeout(Duration),

    #[error("send queue full ({0} messages)")]
    QueueFull(usize),

    #[error("reader thread exited")]
    ReaderExited,

    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    Disconnected,
    Connecting,
    /// Socket open, handshake pending
    Connected,
    /// Handshake acknowledged
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Inbound,
    Outbound,
}

// ============================================================================
// Cancellation
// ============================================================================

struct CancelInner {
    cancelled: AtomicBool,
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

/// Owner side of a cancellation signal
#[derive(Clone)]
pub struct CancelSource {
    inner: Arc<CancelInner>,
}

/// Observer side of a cancellation signal
///
/// `channel()` becomes ready (disconnected) once the source cancels,
/// so it can sit in a `select!` next to other channels.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl CancelSource {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(0);
        CancelSource {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                sender: Mutex::new(Some(sender)),
                receiver,
            }),
        }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken { inner: self.inner.clone() }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        lock(&self.inner.sender).take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> &Receiver<()> {
        &self.inner.receiver
    }

    /// Sleep up to `timeout`; true if cancelled meanwhile
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.inner.receiver.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => self.is_cancelled(),
            _ => true,
        }
    }
}

// ============================================================================
// Configuration and listener
// ============================================================================

/// Per-connection protocol settings
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub magic: [u8; 4],
    pub protocol_version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
    /// Identifies our own version messages, detecting self-connections
    pub nonce: u64,
    pub local_addr: Option<SocketAddr>,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    pub tick_interval: Duration,
    /// Longest a single socket write may block
    pub write_timeout: Duration,
    /// Bound of the outbound and inbound message queues
    pub queue_capacity: usize,
}

impl PeerConfig {
    pub fn new(params: &NetworkParams) -> Self {
        PeerConfig {
            magic: params.magic,
            protocol_version: PROTOCOL_VERSION,
            services: NODE_NETWORK | NODE_WITNESS,
            user_agent: format!("/consensus-node:{}/", env!("CARGO_PKG_VERSION")),
            start_height: 0,
            relay: true,
            nonce: rand::random(),
            local_addr: None,
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
            ping_interval: Duration::from_secs(PING_INTERVAL_SECS),
            tick_interval: Duration::from_millis(LOOP_TICK_MILLIS),
            write_timeout: Duration::from_secs(WRITE_TIMEOUT_SECS),
            queue_capacity: PEER_QUEUE_CAPACITY,
        }
    }
}

/// Connection event callbacks
///
/// Called from the connection's loop thread; implementations must not block
/// on that same connection.
pub trait PeerListener: Send + Sync {
    fn on_ready(&self, _peer: &PeerHandle) {}

    /// Application message received after the handshake
    fn on_message(&self, peer: &PeerHandle, message: NetworkMessage);

    /// Connection torn down; `reason` is None for a requested stop
    fn on_closed(&self, _peer: &PeerHandle, _reason: Option<&NetworkError>) {}

    fn on_tick(&self, _peer: &PeerHandle) {}
}

// ============================================================================
// Handle
// ============================================================================

/// Snapshot of what we learned about the remote side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
    pub ping_rtt: Option<Duration>,
    /// Minimum fee rate announced via feefilter
    pub fee_filter: i64,
    pub prefers_headers: bool,
    /// (announce, version) from sendcmpct
    pub compact_blocks: Option<(bool, u64)>,
}

struct PeerShared {
    id: u64,
    addr: SocketAddr,
    direction: Direction,
    outbound: Sender<NetworkMessage>,
    stop: CancelSource,
    state: Mutex<ConnState>,
    info: Mutex<PeerInfo>,
    sip_keys: (u64, u64),
    known: Mutex<HashSet<u64>>,
    closed: AtomicBool,
    /// Set when `send` found the outbound queue full
    overflowed: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Clonable reference to a live (or finished) connection
#[derive(Clone)]
pub struct PeerHandle {
    shared: Arc<PeerShared>,
}

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

impl PeerHandle {
    fn new(addr: SocketAddr, direction: Direction, outbound: Sender<NetworkMessage>) -> Self {
        PeerHandle {
            shared: Arc::new(PeerShared {
                id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
                addr,
                direction,
                outbound,
                stop: CancelSource::new(),
                state: Mutex::new(ConnState::Disconnected),
                info: Mutex::new(PeerInfo::default()),
                sip_keys: (rand::random(), rand::random()),
                known: Mutex::new(HashSet::new()),
                closed: AtomicBool::new(false),
                overflowed: AtomicBool::new(false),
                threads: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Ready handle backed by a channel instead of a socket
    ///
    /// Everything sent to the handle arrives on the returned receiver.
    pub fn detached(addr: SocketAddr) -> (Self, Receiver<NetworkMessage>) {
        let (tx, rx) = bounded(PEER_QUEUE_CAPACITY);
        let handle = PeerHandle::new(addr, Direction::Outbound, tx);
        handle.set_state(ConnState::Ready);
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn direction(&self) -> Direction {
        self.shared.direction
    }

    pub fn state(&self) -> ConnState {
        *lock(&self.shared.state)
    }

    fn set_state(&self, state: ConnState) {
        *lock(&self.shared.state) = state;
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnState::Ready
    }

    pub fn info(&self) -> PeerInfo {
        lock(&self.shared.info).clone()
    }

    /// Queue a message for the connection's writer
    ///
    /// Never blocks. A full queue means the peer is not keeping up: the
    /// connection is stopped and reports `QueueFull` when it closes.
    pub fn send(&self, message: NetworkMessage) -> Result<(), NetworkError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Cancelled);
        }
        match self.shared.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(message)) => {
                let capacity = self.queue_capacity();
                if !self.shared.overflowed.swap(true, Ordering::SeqCst) {
                    warn!(peer = %self.addr(), capacity, command = message.command(), "send queue full, disconnecting");
                }
                self.stop();
                Err(NetworkError::QueueFull(capacity))
            }
            Err(TrySendError::Disconnected(_)) => Err(NetworkError::Cancelled),
        }
    }

    fn queue_capacity(&self) -> usize {
        self.shared.outbound.capacity().unwrap_or_default()
    }

    /// Request teardown; returns immediately
    pub fn stop(&self) {
        self.shared.stop.cancel();
    }

    /// True once `stop` was requested
    pub fn is_stopping(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    /// Wait for the connection threads to finish
    ///
    /// Must not be called from a listener callback of this connection.
    pub fn join(&self) {
        let threads: Vec<_> = lock(&self.shared.threads).drain(..).collect();
        for handle in threads {
            if let Err(payload) = handle.join() {
                error!(peer = %self.addr(), panic = %panic_message(payload.as_ref()), "connection thread panicked");
            }
        }
    }

    fn inventory_key(&self, hash: &HashId) -> u64 {
        let (k0, k1) = self.shared.sip_keys;
        let mut hasher = SipHasher24::new_with_keys(k0, k1);
        hasher.write(hash.as_bytes());
        hasher.finish()
    }

    /// Record that the peer has (or was sent) this object
    pub fn mark_known(&self, hash: &HashId) {
        let key = self.inventory_key(hash);
        let mut known = lock(&self.shared.known);
        if known.len() >= MAX_KNOWN_INVENTORY {
            known.clear();
        }
        known.insert(key);
    }

    pub fn is_known(&self, hash: &HashId) -> bool {
        let key = self.inventory_key(hash);
        lock(&self.shared.known).contains(&key)
    }
}

impl fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.shared.id)
            .field("addr", &self.shared.addr)
            .field("direction", &self.shared.direction)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Connection
// ============================================================================

pub struct PeerConnection;

impl PeerConnection {
    /// Start the threads for an accepted socket
    pub fn accept(
        stream: TcpStream,
        config: PeerConfig,
        listener: Arc<dyn PeerListener>,
        cancel: CancelToken,
    ) -> Result<PeerHandle, NetworkError> {
        Self::spawn(stream, Direction::Inbound, config, listener, cancel)
    }

    /// Connect to `addr` with up to `retries` attempts and linear backoff
    pub fn dial(
        addr: SocketAddr,
        retries: u32,
        config: PeerConfig,
        listener: Arc<dyn PeerListener>,
        cancel: CancelToken,
    ) -> Result<PeerHandle, NetworkError> {
        let attempts = retries.max(1);
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(NetworkError::Cancelled);
            }
            match TcpStream::connect_timeout(&addr, config.handshake_timeout) {
                Ok(stream) => return Self::spawn(stream, Direction::Outbound, config, listener, cancel),
                Err(e) => {
                    debug!(peer = %addr, attempt, error = %e, "dial failed");
                    if attempt < attempts && cancel.wait_timeout(Duration::from_millis(500 * attempt as u64)) {
                        return Err(NetworkError::Cancelled);
                    }
                }
            }
        }
        Err(NetworkError::DialExhausted { addr, attempts })
    }

    fn spawn(
        stream: TcpStream,
        direction: Direction,
        config: PeerConfig,
        listener: Arc<dyn PeerListener>,
        cancel: CancelToken,
    ) -> Result<PeerHandle, NetworkError> {
        let addr = stream.peer_addr()?;
        let capacity = config.queue_capacity.max(1);
        let (outbound_tx, outbound_rx) = bounded(capacity);
        let (inbound_tx, inbound_rx) = bounded(capacity);
        let handle = PeerHandle::new(addr, direction, outbound_tx);
        handle.set_state(ConnState::Connecting);

        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(config.write_timeout))?;
        let read_half = stream.try_clone()?;
        let magic = config.magic;

        let reader = spawn_reader(format!("peer-read-{}", handle.id()), inbound_tx, move |inbound| {
            read_loop(read_half, magic, inbound)
        })?;

        handle.set_state(ConnState::Connected);
        info!(peer = %addr, ?direction, "connection established");

        let mut ctx = LoopContext {
            handle: handle.clone(),
            config,
            listener,
            cancel,
            stream,
            outbound: outbound_rx,
            inbound: inbound_rx,
            got_version: false,
            got_verack: false,
            pending_ping: None,
        };
        let main = thread::Builder::new()
            .name(format!("peer-loop-{}", handle.id()))
            .spawn(move || {
                let result = match catch_unwind(AssertUnwindSafe(|| ctx.run())) {
                    Ok(result) => result,
                    Err(payload) => Err(NetworkError::Panic(panic_message(payload.as_ref()))),
                };
                ctx.teardown(result.err());
            })?;

        lock(&handle.shared.threads).extend([reader, main]);
        Ok(handle)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

type InboundEvent = Result<NetworkMessage, NetworkError>;

/// Run a reader body on its own thread
///
/// A panic in `body` is forwarded to the connection loop as a fatal
/// `Panic` event, so the listener sees it as a failure.
fn spawn_reader<F>(name: String, inbound: Sender<InboundEvent>, body: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce(Sender<InboundEvent>) + Send + 'static,
{
    thread::Builder::new().name(name).spawn(move || {
        let report = inbound.clone();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| body(inbound))) {
            let message = panic_message(payload.as_ref());
            error!(%message, "reader thread panicked");
            let _ = report.send(Err(NetworkError::Panic(message)));
        }
    })
}

/// Reader thread: frame, decode, forward; stops at the first fatal error
fn read_loop(stream: TcpStream, magic: [u8; 4], inbound: Sender<InboundEvent>) {
    let mut reader = BufReader::new(stream);
    loop {
        let event = match read_message(&mut reader, magic) {
            Ok(raw) => match NetworkMessage::from_raw(&raw) {
                Ok(message) => Ok(message),
                Err(CodecError::UnknownCommand(command)) => {
                    trace!(%command, "ignoring unknown command");
                    continue;
                }
                Err(e) => Err(NetworkError::Codec(e)),
            },
            Err(e) => Err(NetworkError::Codec(e)),
        };
        let fatal = event.is_err();
        if inbound.send(event).is_err() || fatal {
            return;
        }
    }
}

struct LoopContext {
    handle: PeerHandle,
    config: PeerConfig,
    listener: Arc<dyn PeerListener>,
    cancel: CancelToken,
    stream: TcpStream,
    outbound: Receiver<NetworkMessage>,
    inbound: Receiver<InboundEvent>,
    got_version: bool,
    got_verack: bool,
    pending_ping: Option<(u64, Instant)>,
}

impl LoopContext {
    /// Connection loop
    ///
    /// 1. Outbound connections open with our version
    /// 2. Select over writes, reads, timers and both cancel signals
    /// 3. The handshake timer is dropped once the peer is ready
    fn run(&mut self) -> Result<(), NetworkError> {
        // 1. Open
        if self.handle.direction() == Direction::Outbound {
            self.send_version()?;
        }

        let mut handshake = Some(after(self.config.handshake_timeout));
        let ping = tick(self.config.ping_interval);
        let housekeeping = tick(self.config.tick_interval);
        let stop = self.handle.shared.stop.token();
        let cancel = self.cancel.clone();
        let outbound = self.outbound.clone();
        let inbound = self.inbound.clone();

        // 2. Loop
        loop {
            let handshake_rx = handshake.clone().unwrap_or_else(never);
            select! {
                recv(outbound) -> message => match message {
                    Ok(message) => self.write(&message)?,
                    Err(_) => return Err(NetworkError::Cancelled),
                },
                recv(inbound) -> event => match event {
                    Ok(Ok(message)) => self.handle_message(message)?,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(NetworkError::ReaderExited),
                },
                recv(handshake_rx) -> _ => {
                    return Err(NetworkError::HandshakeTimeout(self.config.handshake_timeout));
                }
                recv(ping) -> _ => {
                    if self.handle.is_ready() {
                        self.send_ping()?;
                    }
                }
                recv(housekeeping) -> _ => {
                    if self.handle.is_ready() {
                        self.listener.on_tick(&self.handle);
                    }
                }
                recv(stop.channel()) -> _ => return self.stop_reason(),
                recv(cancel.channel()) -> _ => return Ok(()),
            }

            // 3. Handshake done
            if handshake.is_some() && self.handle.is_ready() {
                handshake = None;
            }
        }
    }

    /// A stop requested by an overflowing `send` is a failure, not a clean close
    fn stop_reason(&self) -> Result<(), NetworkError> {
        if self.handle.shared.overflowed.load(Ordering::SeqCst) {
            Err(NetworkError::QueueFull(self.handle.queue_capacity()))
        } else {
            Ok(())
        }
    }

    fn write(&mut self, message: &NetworkMessage) -> Result<(), NetworkError> {
        trace!(peer = %self.handle.addr(), command = message.command(), "send");
        if let NetworkMessage::Inv(inv) = message {
            for item in inv {
                self.handle.mark_known(&item.hash);
            }
        }
        write_message(&mut self.stream, self.config.magic, &message.to_raw()).map_err(|e| match e {
            CodecError::Io(io) if matches!(io.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                NetworkError::WriteTimeout(self.config.write_timeout)
            }
            other => NetworkError::Codec(other),
        })
    }

    fn send_version(&mut self) -> Result<(), NetworkError> {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0);
        let addr_from = match self.config.local_addr {
            Some(addr) => NetworkAddress::new(&addr, self.config.services),
            None => NetworkAddress::unroutable(),
        };
        let version = VersionMessage {
            version: self.config.protocol_version,
            services: self.config.services,
            timestamp,
            addr_recv: NetworkAddress::new(&self.handle.addr(), 0),
            addr_from,
            nonce: self.config.nonce,
            user_agent: self.config.user_agent.clone(),
            start_height: self.config.start_height,
            relay: self.config.relay,
        };
        self.write(&NetworkMessage::Version(version))
    }

    fn send_ping(&mut self) -> Result<(), NetworkError> {
        let nonce: u64 = rand::random();
        self.pending_ping = Some((nonce, Instant::now()));
        self.write(&NetworkMessage::Ping(nonce))
    }

    /// Handshake completes once both version and verack arrived
    fn maybe_ready(&mut self) -> Result<(), NetworkError> {
        if self.got_version && self.got_verack && !self.handle.is_ready() {
            self.handle.set_state(ConnState::Ready);
            let info = self.handle.info();
            info!(
                peer = %self.handle.addr(),
                version = info.version,
                user_agent = %info.user_agent,
                height = info.start_height,
                "handshake complete"
            );
            self.send_ping()?;
            self.listener.on_ready(&self.handle);
        }
        Ok(())
    }

    fn handle_message(&mut self, message: NetworkMessage) -> Result<(), NetworkError> {
        trace!(peer = %self.handle.addr(), command = message.command(), "recv");
        match message {
            NetworkMessage::Version(version) => {
                if self.got_version {
                    return Err(NetworkError::Protocol("duplicate version".to_string()));
                }
                if version.nonce == self.config.nonce {
                    return Err(NetworkError::Protocol("connected to self".to_string()));
                }
                if version.version < MIN_PEER_PROTO_VERSION {
                    return Err(NetworkError::Protocol(format!("obsolete version {}", version.version)));
                }
                {
                    let mut info = lock(&self.handle.shared.info);
                    info.version = version.version;
                    info.services = version.services;
                    info.user_agent = version.user_agent;
                    info.start_height = version.start_height;
                    info.relay = version.relay;
                }
                self.got_version = true;
                if self.handle.direction() == Direction::Inbound {
                    self.send_version()?;
                }
                self.write(&NetworkMessage::VerAck)?;
                self.maybe_ready()
            }
            NetworkMessage::VerAck => {
                self.got_verack = true;
                self.maybe_ready()
            }
            NetworkMessage::Ping(nonce) => self.write(&NetworkMessage::Pong(nonce)),
            NetworkMessage::Pong(nonce) => {
                match self.pending_ping {
                    Some((expected, sent)) if expected == nonce => {
                        lock(&self.handle.shared.info).ping_rtt = Some(sent.elapsed());
                        self.pending_ping = None;
                    }
                    _ => debug!(peer = %self.handle.addr(), nonce, "unexpected pong"),
                }
                Ok(())
            }
            NetworkMessage::FeeFilter(rate) => {
                lock(&self.handle.shared.info).fee_filter = rate;
                Ok(())
            }
            NetworkMessage::SendHeaders => {
                lock(&self.handle.shared.info).prefers_headers = true;
                Ok(())
            }
            NetworkMessage::SendCmpct(m) => {
                lock(&self.handle.shared.info).compact_blocks = Some((m.announce, m.version));
                Ok(())
            }
            NetworkMessage::GetAddr => {
                if self.handle.is_ready() {
                    self.write(&NetworkMessage::Addr(Vec::new()))?;
                }
                Ok(())
            }
            NetworkMessage::Reject(reject) => {
                warn!(
                    peer = %self.handle.addr(),
                    message = %reject.message,
                    code = reject.code,
                    reason = %reject.reason,
                    "peer rejected message"
                );
                Ok(())
            }
            other => {
                if self.handle.is_ready() {
                    self.listener.on_message(&self.handle, other);
                } else {
                    debug!(peer = %self.handle.addr(), command = other.command(), "dropping message before handshake");
                }
                Ok(())
            }
        }
    }

    /// Close the socket and notify the listener, once
    fn teardown(&mut self, reason: Option<NetworkError>) {
        if self.handle.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handle.set_state(ConnState::Closed);
        let _ = self.stream.shutdown(Shutdown::Both);
        match &reason {
            None | Some(NetworkError::Cancelled) => info!(peer = %self.handle.addr(), "connection closed"),
            Some(e) => warn!(peer = %self.handle.addr(), error = %e, "connection failed"),
        }
        let reported = match &reason {
            Some(NetworkError::Cancelled) => None,
            other => other.as_ref(),
        };
        self.listener.on_closed(&self.handle, reported);
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Inbound and outbound connection sets
#[derive(Default)]
pub struct PeerRegistry {
    inbound: Mutex<HashMap<u64, PeerHandle>>,
    outbound: Mutex<HashMap<u64, PeerHandle>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, direction: Direction) -> &Mutex<HashMap<u64, PeerHandle>> {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    pub fn add(&self, peer: PeerHandle) {
        lock(self.set(peer.direction())).insert(peer.id(), peer);
    }

    pub fn remove(&self, peer: &PeerHandle) -> bool {
        lock(self.set(peer.direction())).remove(&peer.id()).is_some()
    }

    pub fn inbound_count(&self) -> usize {
        lock(&self.inbound).len()
    }

    pub fn outbound_count(&self) -> usize {
        lock(&self.outbound).len()
    }

    pub fn all(&self) -> Vec<PeerHandle> {
        let mut peers: Vec<PeerHandle> = lock(&self.inbound).values().cloned().collect();
        peers.extend(lock(&self.outbound).values().cloned());
        peers
    }

    pub fn ready(&self) -> Vec<PeerHandle> {
        self.all().into_iter().filter(PeerHandle::is_ready).collect()
    }

    pub fn contains_addr(&self, addr: &SocketAddr) -> bool {
        self.all().iter().any(|p| p.addr() == *addr)
    }

    /// Up to `n` peers ordered by measured ping; unmeasured peers last
    pub fn fastest(&self, n: usize) -> Vec<PeerHandle> {
        let mut peers: Vec<(Option<Duration>, PeerHandle)> =
            self.all().into_iter().map(|p| (p.info().ping_rtt, p)).collect();
        peers.sort_by_key(|(rtt, p)| (rtt.is_none(), rtt.unwrap_or_default(), p.id()));
        peers.into_iter().take(n).map(|(_, p)| p).collect()
    }

    /// Stop every connection and wait for their threads
    pub fn stop_all(&self) {
        let peers = self.all();
        for peer in &peers {
            peer.stop();
        }
        for peer in &peers {
            peer.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RawMessage;
    use crate::network::InventoryVector;
    use crossbeam_channel::unbounded;
    use std::io::Write;
    use std::net::TcpListener;

    enum Event {
        Ready(u64),
        Message(u64, NetworkMessage),
        Closed(u64, Option<String>),
    }

    struct Recorder(Sender<Event>);

    impl PeerListener for Recorder {
        fn on_ready(&self, peer: &PeerHandle) {
            let _ = self.0.send(Event::Ready(peer.id()));
        }

        fn on_message(&self, peer: &PeerHandle, message: NetworkMessage) {
            let _ = self.0.send(Event::Message(peer.id(), message));
        }

        fn on_closed(&self, peer: &PeerHandle, reason: Option<&NetworkError>) {
            let _ = self.0.send(Event::Closed(peer.id(), reason.map(|e| e.to_string())));
        }
    }

    fn test_config() -> PeerConfig {
        let mut config = PeerConfig::new(&NetworkParams::regtest());
        config.handshake_timeout = Duration::from_millis(500);
        config
    }

    fn recorder() -> (Arc<dyn PeerListener>, Receiver<Event>) {
        let (tx, rx) = unbounded();
        (Arc::new(Recorder(tx)), rx)
    }

    fn next(rx: &Receiver<Event>) -> Event {
        rx.recv_timeout(Duration::from_secs(5)).expect("event")
    }

    #[test]
    fn test_handshake_and_message_delivery() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancelSource::new();

        let (inbound_listener, inbound_events) = recorder();
        let token = cancel.token();
        let acceptor = thread::spawn(move || {
            let (stream, _) = server.accept().unwrap();
            PeerConnection::accept(stream, test_config(), inbound_listener, token).unwrap()
        });

        let (outbound_listener, outbound_events) = recorder();
        let dialer = PeerConnection::dial(addr, 1, test_config(), outbound_listener, cancel.token()).unwrap();
        let accepted = acceptor.join().unwrap();

        assert!(matches!(next(&outbound_events), Event::Ready(id) if id == dialer.id()));
        assert!(matches!(next(&inbound_events), Event::Ready(id) if id == accepted.id()));
        assert!(dialer.is_ready());
        assert_eq!(accepted.info().version, PROTOCOL_VERSION);

        let inv = vec![InventoryVector::block(HashId([3; 32]))];
        dialer.send(NetworkMessage::Inv(inv.clone())).unwrap();
        match next(&inbound_events) {
            Event::Message(id, NetworkMessage::Inv(got)) => {
                assert_eq!(id, accepted.id());
                assert_eq!(got, inv);
            }
            _ => panic!("expected inv"),
        }
        // Announced inventory is remembered for the peer
        assert!(dialer.is_known(&HashId([3; 32])));

        dialer.stop();
        dialer.join();
        assert_eq!(dialer.state(), ConnState::Closed);
        assert!(matches!(next(&outbound_events), Event::Closed(_, None)));
        // Remote side sees the socket close
        assert!(matches!(next(&inbound_events), Event::Closed(_, Some(_))));
        accepted.join();
        assert!(dialer.send(NetworkMessage::VerAck).is_err());
    }

    #[test]
    fn test_handshake_timeout() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let _silent = TcpStream::connect(addr).unwrap();
        let (stream, _) = server.accept().unwrap();

        let (listener, events) = recorder();
        let cancel = CancelSource::new();
        let peer = PeerConnection::accept(stream, test_config(), listener, cancel.token()).unwrap();
        match next(&events) {
            Event::Closed(_, Some(reason)) => assert!(reason.contains("handshake")),
            _ => panic!("expected timeout"),
        }
        peer.join();
        assert_eq!(peer.state(), ConnState::Closed);
    }

    #[test]
    fn test_bad_magic_closes_connection() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let mut raw = TcpStream::connect(addr).unwrap();
        let (stream, _) = server.accept().unwrap();

        let (listener, events) = recorder();
        let cancel = CancelSource::new();
        let peer = PeerConnection::accept(stream, test_config(), listener, cancel.token()).unwrap();

        let frame = RawMessage::new("verack", Vec::new()).to_frame([1, 2, 3, 4]).unwrap();
        raw.write_all(&frame).unwrap();
        match next(&events) {
            Event::Closed(_, Some(reason)) => assert!(reason.contains("magic")),
            _ => panic!("expected framing failure"),
        }
        peer.join();
    }

    #[test]
    fn test_node_cancel_stops_connection() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let _raw = TcpStream::connect(addr).unwrap();
        let (stream, _) = server.accept().unwrap();

        let (listener, events) = recorder();
        let cancel = CancelSource::new();
        let mut config = test_config();
        config.handshake_timeout = Duration::from_secs(30);
        let peer = PeerConnection::accept(stream, config, listener, cancel.token()).unwrap();
        cancel.cancel();
        assert!(matches!(next(&events), Event::Closed(_, None)));
        peer.join();
    }

    #[test]
    fn test_write_timeout_when_peer_never_reads() {
        let server = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        // Connected, but never reads
        let _stalled = TcpStream::connect(addr).unwrap();
        let (stream, _) = server.accept().unwrap();

        let (listener, events) = recorder();
        let cancel = CancelSource::new();
        let mut config = test_config();
        config.handshake_timeout = Duration::from_secs(30);
        config.write_timeout = Duration::from_millis(200);
        config.queue_capacity = 32;
        let peer = PeerConnection::accept(stream, config, listener, cancel.token()).unwrap();

        // Each frame is about 1.8 MB, far past what the socket buffers hold
        let inv = NetworkMessage::Inv(vec![InventoryVector::block(HashId([5; 32])); MAX_INV_SIZE]);
        for _ in 0..16 {
            if peer.send(inv.clone()).is_err() {
                break;
            }
        }
        match next(&events) {
            Event::Closed(_, Some(reason)) => assert!(reason.contains("write"), "{}", reason),
            _ => panic!("expected write timeout"),
        }
        peer.join();
        assert_eq!(peer.state(), ConnState::Closed);
    }

    #[test]
    fn test_full_send_queue_stops_connection() {
        let (tx, _rx) = bounded(2);
        let peer = PeerHandle::new("127.0.0.1:1".parse().unwrap(), Direction::Outbound, tx);
        peer.send(NetworkMessage::VerAck).unwrap();
        peer.send(NetworkMessage::Ping(1)).unwrap();
        assert!(!peer.is_stopping());

        let err = peer.send(NetworkMessage::Ping(2)).unwrap_err();
        assert!(matches!(err, NetworkError::QueueFull(2)));
        assert!(peer.is_stopping());
        assert!(peer.shared.overflowed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_reader_panic_is_reported() {
        let (tx, rx) = bounded(1);
        let reader = spawn_reader("peer-read-test".to_string(), tx, |_inbound| panic!("reader state corrupted")).unwrap();
        reader.join().unwrap();
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Err(NetworkError::Panic(message)) => assert_eq!(message, "reader state corrupted"),
            other => panic!("unexpected {:?}", other.map(|m| m.command())),
        }
    }

    #[test]
    fn test_join_survives_panicked_thread() {
        let (tx, _rx) = unbounded();
        let peer = PeerHandle::new("127.0.0.1:1".parse().unwrap(), Direction::Inbound, tx);
        let crashed = thread::spawn(|| panic!("loop crashed"));
        lock(&peer.shared.threads).push(crashed);
        peer.join();
        assert!(lock(&peer.shared.threads).is_empty());
    }

    #[test]
    fn test_dial_exhausted() {
        // Bind then drop to get a port nobody listens on
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let (listener, _events) = recorder();
        let cancel = CancelSource::new();
        let err = PeerConnection::dial(addr, 2, test_config(), listener, cancel.token()).unwrap_err();
        assert!(matches!(err, NetworkError::DialExhausted { attempts: 2, .. }));
    }

    #[test]
    fn test_cancel_token() {
        let source = CancelSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());
        assert!(!token.wait_timeout(Duration::from_millis(10)));
        source.cancel();
        assert!(token.is_cancelled());
        assert!(token.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn test_registry_fastest() {
        let registry = PeerRegistry::new();
        let (tx, _rx) = unbounded();
        let slow = PeerHandle::new("127.0.0.1:1".parse().unwrap(), Direction::Outbound, tx.clone());
        let fast = PeerHandle::new("127.0.0.1:2".parse().unwrap(), Direction::Inbound, tx.clone());
        let unknown = PeerHandle::new("127.0.0.1:3".parse().unwrap(), Direction::Outbound, tx);
        lock(&slow.shared.info).ping_rtt = Some(Duration::from_millis(90));
        lock(&fast.shared.info).ping_rtt = Some(Duration::from_millis(10));
        registry.add(slow.clone());
        registry.add(fast.clone());
        registry.add(unknown.clone());

        assert_eq!(registry.inbound_count(), 1);
        assert_eq!(registry.outbound_count(), 2);
        let order: Vec<u64> = registry.fastest(3).iter().map(PeerHandle::id).collect();
        assert_eq!(order, vec![fast.id(), slow.id(), unknown.id()]);
        assert_eq!(registry.fastest(1).len(), 1);
        assert!(registry.contains_addr(&"127.0.0.1:2".parse().unwrap()));

        assert!(registry.remove(&fast));
        assert!(!registry.remove(&fast));
        assert_eq!(registry.inbound_count(), 0);
    }

    #[test]
    fn test_known_inventory() {
        let (tx, _rx) = unbounded();
        let peer = PeerHandle::new("127.0.0.1:1".parse().unwrap(), Direction::Inbound, tx);
        let hash = HashId([9; 32]);
        assert!(!peer.is_known(&hash));
        peer.mark_known(&hash);
        assert!(peer.is_known(&hash));
    }
}
