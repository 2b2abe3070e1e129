//! Node process surface
//!
//! Wires the chain, store, peer registry, listener, connector and worker
//! pool together, and tears them down on shutdown.

use crate::chain::ChainState;
use crate::config::{ConfigError, NetworkParams, NodeConfig};
use crate::dispatch::{announce_block, Dispatcher, MessageHandler, WorkerPool};
use crate::error::{lock, ConsensusError};
use crate::network::{GetHeadersMessage, NetworkMessage};
use crate::peer::{CancelSource, CancelToken, ConnState, NetworkError, PeerConfig, PeerConnection, PeerHandle, PeerListener, PeerRegistry};
use crate::store::{CachedStore, MemoryStore};
use crate::types::Block;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(100);
const CONNECT_INTERVAL: Duration = Duration::from_secs(5);
const WORKER_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum NodeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Connection callbacks shared by every peer of the node
struct NodeListener {
    chain: Arc<ChainState>,
    registry: Arc<PeerRegistry>,
    dispatcher: Dispatcher,
}

impl PeerListener for NodeListener {
    fn on_ready(&self, peer: &PeerHandle) {
        self.registry.add(peer.clone());
        let getheaders = NetworkMessage::GetHeaders(GetHeadersMessage {
            version: peer.info().version as u32,
            block_locator_hashes: self.chain.locator(),
            hash_stop: Default::default(),
        });
        for message in [NetworkMessage::SendHeaders, getheaders] {
            if let Err(e) = peer.send(message) {
                debug!(peer = %peer.addr(), error = %e, "initial sync request failed");
            }
        }
    }

    fn on_message(&self, peer: &PeerHandle, message: NetworkMessage) {
        self.dispatcher.dispatch(peer, message);
    }

    fn on_closed(&self, peer: &PeerHandle, _reason: Option<&NetworkError>) {
        self.registry.remove(peer);
        self.dispatcher.forget(peer);
    }
}

/// Shared pieces the background threads need
#[derive(Clone)]
struct NodeContext {
    config: NodeConfig,
    params: NetworkParams,
    chain: Arc<ChainState>,
    registry: Arc<PeerRegistry>,
    listener: Arc<dyn PeerListener>,
    connections: Arc<Mutex<Vec<PeerHandle>>>,
    cancel: CancelToken,
    nonce: u64,
    local_addr: Option<SocketAddr>,
}

impl NodeContext {
    fn peer_config(&self) -> PeerConfig {
        let mut config = PeerConfig::new(&self.params);
        config.user_agent = self.config.user_agent.clone();
        config.start_height = self.chain.height() as i32;
        config.nonce = self.nonce;
        config.local_addr = self.local_addr;
        config.write_timeout = Duration::from_secs(self.config.write_timeout_secs.max(1));
        config.queue_capacity = self.config.peer_queue_capacity;
        config
    }

    /// Remember a connection so shutdown can join it
    fn track(&self, peer: PeerHandle) {
        let mut connections = lock(&self.connections);
        connections.retain(|p| p.state() != ConnState::Closed);
        connections.push(peer);
    }

    /// True while a tracked connection to `addr` is still open
    fn is_connected(&self, addr: &SocketAddr) -> bool {
        lock(&self.connections).iter().any(|p| p.addr() == *addr && p.state() != ConnState::Closed)
    }

    fn dial(&self, addr: SocketAddr) -> Result<PeerHandle, NetworkError> {
        let peer = PeerConnection::dial(
            addr,
            self.config.dial_retries,
            self.peer_config(),
            self.listener.clone(),
            self.cancel.clone(),
        )?;
        self.track(peer.clone());
        Ok(peer)
    }
}

/// A running node
pub struct Node {
    ctx: NodeContext,
    cancel: CancelSource,
    threads: Vec<JoinHandle<()>>,
    workers: Option<WorkerPool>,
    listen_addr: Option<SocketAddr>,
}

impl Node {
    /// Start: bind the listener, then spawn acceptor, connector and workers
    pub fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let params = config.params()?;
        let store = Arc::new(CachedStore::new(
            MemoryStore::new(),
            config.cache_capacity,
            Duration::from_secs(config.cache_ttl_secs),
        ));
        let chain = Arc::new(ChainState::new(params.clone(), store));
        let registry = Arc::new(PeerRegistry::new());
        let cancel = CancelSource::new();

        let (dispatcher, queue) = Dispatcher::new(config.queue_capacity);
        let handler = Arc::new(MessageHandler::new(chain.clone(), registry.clone()));
        let workers = WorkerPool::start(config.workers, queue, handler, cancel.token(), WORKER_BACKOFF)?;

        let listener: Arc<dyn PeerListener> =
            Arc::new(NodeListener { chain: chain.clone(), registry: registry.clone(), dispatcher });
        let ctx = NodeContext {
            local_addr: config.external_addr()?,
            config,
            params,
            chain,
            registry,
            listener,
            connections: Arc::new(Mutex::new(Vec::new())),
            cancel: cancel.token(),
            nonce: rand::random(),
        };

        let mut threads = Vec::new();
        let mut listen_addr = None;
        if ctx.config.max_inbound > 0 {
            let socket = TcpListener::bind(ctx.config.listen_addr(&ctx.params)?)?;
            socket.set_nonblocking(true)?;
            let bound = socket.local_addr()?;
            listen_addr = Some(bound);
            info!(addr = %bound, network = %ctx.params.name, "listening");
            let accept_ctx = ctx.clone();
            threads.push(thread::Builder::new().name("accept".into()).spawn(move || accept_loop(accept_ctx, socket))?);
        }

        let connect_ctx = ctx.clone();
        threads.push(thread::Builder::new().name("connect".into()).spawn(move || connect_loop(connect_ctx))?);

        info!(workers = workers.len(), height = ctx.chain.height(), "node started");
        Ok(Node { ctx, cancel, threads, workers: Some(workers), listen_addr })
    }

    pub fn chain(&self) -> &Arc<ChainState> {
        &self.ctx.chain
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.ctx.registry
    }

    /// Bound listen address, when listening
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// Dial a specific peer now
    pub fn connect(&self, addr: SocketAddr) -> Result<PeerHandle, NodeError> {
        Ok(self.ctx.dial(addr)?)
    }

    /// Connect a locally produced block and announce it
    pub fn submit_block(&self, block: &Block) -> Result<u32, ConsensusError> {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0);
        let height = self.ctx.chain.try_extend(block, now)?;
        announce_block(&self.ctx.registry, None, block);
        Ok(height)
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Cancel everything and wait for every thread to exit
    pub fn shutdown(mut self) {
        info!("shutting down");
        self.cancel.cancel();
        for thread in self.threads.drain(..) {
            let name = thread.thread().name().unwrap_or("unnamed").to_string();
            if thread.join().is_err() {
                error!(thread = %name, "background thread panicked");
            }
        }
        self.ctx.registry.stop_all();
        let connections: Vec<PeerHandle> = lock(&self.ctx.connections).drain(..).collect();
        for peer in connections {
            peer.stop();
            peer.join();
        }
        if let Some(workers) = self.workers.take() {
            workers.join();
        }
        info!("shutdown complete");
    }
}

fn accept_loop(ctx: NodeContext, socket: TcpListener) {
    loop {
        match socket.accept() {
            Ok((stream, addr)) => {
                if ctx.registry.inbound_count() >= ctx.config.max_inbound {
                    debug!(peer = %addr, "inbound limit reached, refusing");
                    continue;
                }
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(peer = %addr, error = %e, "cannot configure socket");
                    continue;
                }
                match PeerConnection::accept(stream, ctx.peer_config(), ctx.listener.clone(), ctx.cancel.clone()) {
                    Ok(peer) => ctx.track(peer),
                    Err(e) => warn!(peer = %addr, error = %e, "cannot start inbound connection"),
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if ctx.cancel.wait_timeout(ACCEPT_POLL) {
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                if ctx.cancel.wait_timeout(ACCEPT_POLL) {
                    break;
                }
            }
        }
    }
    debug!("accept loop stopped");
}

/// Static peers first, then DNS seed results
fn candidate_addresses(ctx: &NodeContext) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for text in &ctx.config.connect {
        match text.to_socket_addrs() {
            Ok(addrs) => out.extend(addrs),
            Err(e) => warn!(peer = %text, error = %e, "cannot resolve peer"),
        }
    }
    if ctx.config.use_dns_seeds {
        for seed in &ctx.params.dns_seeds {
            match (seed.as_str(), ctx.params.default_port).to_socket_addrs() {
                Ok(addrs) => out.extend(addrs),
                Err(e) => debug!(%seed, error = %e, "seed lookup failed"),
            }
        }
    }
    out
}

fn connect_loop(ctx: NodeContext) {
    let mut attempted: HashSet<SocketAddr> = HashSet::new();
    while !ctx.cancel.is_cancelled() {
        let outbound = ctx.registry.outbound_count();
        if outbound < ctx.config.max_outbound {
            let candidates = candidate_addresses(&ctx);
            for addr in candidates {
                if ctx.cancel.is_cancelled() || ctx.registry.outbound_count() >= ctx.config.max_outbound {
                    break;
                }
                if ctx.is_connected(&addr) || !attempted.insert(addr) {
                    continue;
                }
                match ctx.dial(addr) {
                    Ok(peer) => debug!(peer = %peer.addr(), "dialed"),
                    Err(e) => debug!(peer = %addr, error = %e, "dial failed"),
                }
            }
            // Retry everyone not currently connected on the next round
            attempted.retain(|addr| ctx.is_connected(addr));
        }
        if ctx.cancel.wait_timeout(CONNECT_INTERVAL) {
            break;
        }
    }
    debug!("connect loop stopped");
}
