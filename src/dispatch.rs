//! Inbound message dispatch
//!
//! Connections push application messages into one bounded queue; a fixed
//! pool of workers pulls from it and applies them to the shared chain state.

use crate::chain::ChainState;
use crate::constants::*;
use crate::error::{lock, ConsensusError};
use crate::network::{GetHeadersMessage, InventoryVector, NetworkMessage, MSG_WITNESS_BLOCK, MSG_WITNESS_TX};
use crate::peer::{CancelToken, NetworkError, PeerHandle, PeerRegistry};
use crate::store::StoreError;
use crate::types::*;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Blocks requested from one peer per getdata
const MAX_BLOCKS_IN_FLIGHT: usize = 16;

/// Block hashes answered per getblocks
const MAX_BLOCKS_INV: usize = 500;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// An inbound message tagged with the connection it came from
#[derive(Debug, Clone)]
pub struct Envelope {
    pub peer: PeerHandle,
    pub message: NetworkMessage,
}

/// Producer side of the work queue
#[derive(Clone)]
pub struct Dispatcher {
    queue: Sender<Envelope>,
    /// Consecutive drops per peer id
    drops: Arc<Mutex<HashMap<u64, u32>>>,
    max_drops: u32,
}

impl Dispatcher {
    /// New dispatcher and the receiver its workers consume
    pub fn new(capacity: usize) -> (Self, Receiver<Envelope>) {
        let (queue, receiver) = bounded(capacity.max(1));
        let dispatcher = Dispatcher { queue, drops: Arc::new(Mutex::new(HashMap::new())), max_drops: MAX_DISPATCH_DROPS };
        (dispatcher, receiver)
    }

    /// Disconnect a peer after `max_drops` consecutive dropped messages
    pub fn with_drop_limit(mut self, max_drops: u32) -> Self {
        self.max_drops = max_drops.max(1);
        self
    }

    /// Enqueue without blocking the connection; false if dropped
    ///
    /// A peer whose messages keep landing on a full queue is stopped.
    pub fn dispatch(&self, peer: &PeerHandle, message: NetworkMessage) -> bool {
        let command = message.command();
        match self.queue.try_send(Envelope { peer: peer.clone(), message }) {
            Ok(()) => {
                lock(&self.drops).remove(&peer.id());
                true
            }
            Err(TrySendError::Full(_)) => {
                let dropped = {
                    let mut drops = lock(&self.drops);
                    let count = drops.entry(peer.id()).or_insert(0);
                    *count += 1;
                    *count
                };
                warn!(peer = %peer.addr(), command, dropped, "work queue full, dropping message");
                if dropped >= self.max_drops {
                    warn!(peer = %peer.addr(), dropped, "peer keeps saturating the work queue, disconnecting");
                    self.forget(peer);
                    peer.stop();
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Consecutive drops recorded for `peer`
    pub fn drops(&self, peer: &PeerHandle) -> u32 {
        lock(&self.drops).get(&peer.id()).copied().unwrap_or(0)
    }

    /// Discard the drop count of a closed connection
    pub fn forget(&self, peer: &PeerHandle) {
        lock(&self.drops).remove(&peer.id());
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// Per-message processing applied by workers
pub trait EnvelopeHandler: Send + Sync {
    fn handle(&self, envelope: &Envelope) -> Result<(), DispatchError>;
}

/// Fixed-size worker pool
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` workers
    ///
    /// A failed message is logged and dropped. A panicking handler is
    /// caught and the worker resumes after `backoff`. On cancellation,
    /// queued work is drained without being processed.
    pub fn start(
        count: usize,
        queue: Receiver<Envelope>,
        handler: Arc<dyn EnvelopeHandler>,
        cancel: CancelToken,
        backoff: Duration,
    ) -> std::io::Result<Self> {
        let mut workers = Vec::with_capacity(count);
        for id in 0..count.max(1) {
            let queue = queue.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();
            workers.push(
                thread::Builder::new()
                    .name(format!("worker-{}", id))
                    .spawn(move || worker_loop(id, queue, handler, cancel, backoff))?,
            );
        }
        Ok(WorkerPool { workers })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to exit; cancel the token first
    pub fn join(self) {
        for (id, worker) in self.workers.into_iter().enumerate() {
            if worker.join().is_err() {
                error!(worker = id, "worker thread panicked");
            }
        }
    }
}

fn worker_loop(
    id: usize,
    queue: Receiver<Envelope>,
    handler: Arc<dyn EnvelopeHandler>,
    cancel: CancelToken,
    backoff: Duration,
) {
    debug!(worker = id, "worker started");
    loop {
        select! {
            recv(queue) -> envelope => {
                let envelope = match envelope {
                    Ok(envelope) => envelope,
                    Err(_) => break,
                };
                if cancel.is_cancelled() {
                    break;
                }
                let command = envelope.message.command();
                match catch_unwind(AssertUnwindSafe(|| handler.handle(&envelope))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(worker = id, peer = %envelope.peer.addr(), command, error = %e, "message rejected");
                    }
                    Err(_) => {
                        error!(worker = id, command, "worker panicked, restarting after backoff");
                        if cancel.wait_timeout(backoff) {
                            break;
                        }
                    }
                }
            }
            recv(cancel.channel()) -> _ => break,
        }
    }
    let drained = queue.try_iter().count();
    debug!(worker = id, drained, "worker stopped");
}

/// Relay a newly connected block to every ready peer except `source`
///
/// Peers that asked for sendheaders get the header, others an inv.
pub fn announce_block(registry: &PeerRegistry, source: Option<&PeerHandle>, block: &Block) {
    let hash = block.block_hash();
    for peer in registry.ready() {
        if source.map(PeerHandle::id) == Some(peer.id()) || peer.is_known(&hash) {
            continue;
        }
        let message = if peer.info().prefers_headers {
            NetworkMessage::Headers(vec![block.header])
        } else {
            NetworkMessage::Inv(vec![InventoryVector::block(hash)])
        };
        peer.mark_known(&hash);
        if let Err(e) = peer.send(message) {
            trace!(peer = %peer.addr(), error = %e, "announce skipped");
        }
    }
}

fn unix_now() -> u32 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as u32).unwrap_or(0)
}

/// Applies inbound messages to the chain and answers data requests
pub struct MessageHandler {
    chain: Arc<ChainState>,
    registry: Arc<PeerRegistry>,
}

impl MessageHandler {
    pub fn new(chain: Arc<ChainState>, registry: Arc<PeerRegistry>) -> Self {
        MessageHandler { chain, registry }
    }

    fn get_headers(&self) -> NetworkMessage {
        NetworkMessage::GetHeaders(GetHeadersMessage {
            version: PROTOCOL_VERSION as u32,
            block_locator_hashes: self.chain.locator(),
            hash_stop: HashId::ZERO,
        })
    }

    /// Ask `peer` for the next blocks the header chain is missing
    fn request_missing_blocks(&self, peer: &PeerHandle) -> Result<(), DispatchError> {
        let missing = self.chain.missing_blocks(MAX_BLOCKS_IN_FLIGHT);
        if missing.is_empty() {
            return Ok(());
        }
        let request = missing
            .into_iter()
            .map(|hash| InventoryVector { inv_type: MSG_WITNESS_BLOCK, hash })
            .collect();
        peer.send(NetworkMessage::GetData(request))?;
        Ok(())
    }

    fn on_inv(&self, peer: &PeerHandle, items: &[InventoryVector]) -> Result<(), DispatchError> {
        let store = self.chain.store();
        let mut request = Vec::new();
        for item in items {
            peer.mark_known(&item.hash);
            let wanted = if item.is_block() {
                !self.chain.contains(&item.hash) && !store.has_block(&item.hash)
            } else if item.is_tx() {
                !store.has_tx(&item.hash)
            } else {
                false
            };
            if wanted {
                let inv_type = if item.is_block() { MSG_WITNESS_BLOCK } else { MSG_WITNESS_TX };
                request.push(InventoryVector { inv_type, hash: item.hash });
            }
        }
        if !request.is_empty() {
            debug!(peer = %peer.addr(), count = request.len(), "requesting announced objects");
            peer.send(NetworkMessage::GetData(request))?;
        }
        Ok(())
    }

    fn on_block(&self, peer: &PeerHandle, block: &Block) -> Result<(), DispatchError> {
        let hash = block.block_hash();
        peer.mark_known(&hash);
        match self.chain.try_extend(block, unix_now()) {
            Ok(_) => {
                announce_block(&self.registry, Some(peer), block);
                self.request_missing_blocks(peer)
            }
            Err(ConsensusError::DoesNotLink { .. }) if !self.chain.contains(&block.header.prev_block_hash) => {
                // Parent unknown: we are behind this peer
                debug!(peer = %peer.addr(), %hash, "orphan block, requesting headers");
                peer.send(self.get_headers())?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn on_headers(&self, peer: &PeerHandle, headers: &[BlockHeader]) -> Result<(), DispatchError> {
        if headers.is_empty() {
            return Ok(());
        }
        let appended = self.chain.append_headers(headers, unix_now())?;
        for hash in &appended {
            peer.mark_known(hash);
        }
        if !appended.is_empty() {
            info!(peer = %peer.addr(), count = appended.len(), height = self.chain.best_header_height(), "new headers");
        }
        if headers.len() == MAX_HEADERS_RESULTS {
            peer.send(self.get_headers())?;
        }
        self.request_missing_blocks(peer)
    }

    fn on_getdata(&self, peer: &PeerHandle, items: &[InventoryVector]) -> Result<(), DispatchError> {
        let store = self.chain.store();
        let mut not_found = Vec::new();
        for item in items {
            if item.is_block() {
                match store.get_block(&item.hash) {
                    Ok(block) => peer.send(NetworkMessage::Block(block))?,
                    Err(StoreError::NotFound(_)) => not_found.push(*item),
                    Err(e) => return Err(e.into()),
                }
            } else if item.is_tx() {
                match store.get_tx(&item.hash) {
                    Ok(tx) => peer.send(NetworkMessage::Tx(tx))?,
                    Err(StoreError::NotFound(_)) => not_found.push(*item),
                    Err(e) => return Err(e.into()),
                }
            } else {
                not_found.push(*item);
            }
        }
        if !not_found.is_empty() {
            peer.send(NetworkMessage::NotFound(not_found))?;
        }
        Ok(())
    }

    fn on_getheaders(&self, peer: &PeerHandle, request: &GetHeadersMessage) -> Result<(), DispatchError> {
        let headers = self.chain.headers_after(&request.block_locator_hashes, &request.hash_stop, MAX_HEADERS_RESULTS);
        trace!(peer = %peer.addr(), count = headers.len(), "serving headers");
        peer.send(NetworkMessage::Headers(headers))?;
        Ok(())
    }

    fn on_getblocks(&self, peer: &PeerHandle, request: &GetHeadersMessage) -> Result<(), DispatchError> {
        let headers = self.chain.headers_after(&request.block_locator_hashes, &request.hash_stop, MAX_BLOCKS_INV);
        if headers.is_empty() {
            return Ok(());
        }
        let inv = headers.iter().map(|h| InventoryVector::block(h.block_hash())).collect();
        peer.send(NetworkMessage::Inv(inv))?;
        Ok(())
    }
}

impl EnvelopeHandler for MessageHandler {
    fn handle(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        let peer = &envelope.peer;
        match &envelope.message {
            NetworkMessage::Inv(items) => self.on_inv(peer, items),
            NetworkMessage::Block(block) => self.on_block(peer, block),
            NetworkMessage::Headers(headers) => self.on_headers(peer, headers),
            NetworkMessage::Tx(tx) => {
                trace!(peer = %peer.addr(), txid = %tx.txid(), "transaction ignored");
                Ok(())
            }
            NetworkMessage::GetData(items) => self.on_getdata(peer, items),
            NetworkMessage::GetHeaders(request) => self.on_getheaders(peer, request),
            NetworkMessage::GetBlocks(request) => self.on_getblocks(peer, request),
            NetworkMessage::NotFound(items) => {
                debug!(peer = %peer.addr(), count = items.len(), "peer lacks requested objects");
                Ok(())
            }
            other => {
                trace!(peer = %peer.addr(), command = other.command(), "no handler");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::CancelSource;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Counting {
        handled: AtomicUsize,
        seen: Mutex<Vec<&'static str>>,
    }

    impl EnvelopeHandler for Counting {
        fn handle(&self, envelope: &Envelope) -> Result<(), DispatchError> {
            self.seen.lock().unwrap().push(envelope.message.command());
            self.handled.fetch_add(1, Ordering::SeqCst);
            match envelope.message {
                NetworkMessage::Ping(0) => panic!("boom"),
                NetworkMessage::Ping(1) => Err(ConsensusError::BlockValidation("bad".to_string()).into()),
                _ => Ok(()),
            }
        }
    }

    fn wait_for(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_workers_survive_errors_and_panics() {
        let (peer, _sent) = PeerHandle::detached("127.0.0.1:1".parse().unwrap());
        let (dispatcher, queue) = Dispatcher::new(16);
        let handler = Arc::new(Counting { handled: AtomicUsize::new(0), seen: Mutex::new(Vec::new()) });
        let cancel = CancelSource::new();
        let pool = WorkerPool::start(1, queue, handler.clone(), cancel.token(), Duration::from_millis(10)).unwrap();

        assert!(dispatcher.dispatch(&peer, NetworkMessage::Ping(0)));
        assert!(dispatcher.dispatch(&peer, NetworkMessage::Ping(1)));
        assert!(dispatcher.dispatch(&peer, NetworkMessage::Ping(2)));
        wait_for(|| handler.handled.load(Ordering::SeqCst) == 3);

        cancel.cancel();
        pool.join();
    }

    #[test]
    fn test_full_queue_drops() {
        let (peer, _sent) = PeerHandle::detached("127.0.0.1:1".parse().unwrap());
        let (dispatcher, _queue) = Dispatcher::new(1);
        assert!(dispatcher.dispatch(&peer, NetworkMessage::VerAck));
        assert!(!dispatcher.dispatch(&peer, NetworkMessage::VerAck));
        assert_eq!(dispatcher.queued(), 1);
        assert_eq!(dispatcher.drops(&peer), 1);
    }

    #[test]
    fn test_saturating_peer_is_disconnected() {
        let (flooder, _sent) = PeerHandle::detached("127.0.0.1:1".parse().unwrap());
        let (other, _other_sent) = PeerHandle::detached("127.0.0.1:2".parse().unwrap());
        let (dispatcher, queue) = Dispatcher::new(1);
        let dispatcher = dispatcher.with_drop_limit(3);

        assert!(dispatcher.dispatch(&flooder, NetworkMessage::Ping(0)));
        assert!(!dispatcher.dispatch(&flooder, NetworkMessage::Ping(1)));
        assert!(!dispatcher.dispatch(&flooder, NetworkMessage::Ping(2)));
        assert_eq!(dispatcher.drops(&flooder), 2);
        assert!(!flooder.is_stopping());

        // A drop for another peer does not count against the flooder
        assert!(!dispatcher.dispatch(&other, NetworkMessage::Ping(3)));
        assert_eq!(dispatcher.drops(&other), 1);

        // An accepted message resets the count
        queue.try_recv().unwrap();
        assert!(dispatcher.dispatch(&other, NetworkMessage::Ping(4)));
        assert_eq!(dispatcher.drops(&other), 0);

        assert!(!dispatcher.dispatch(&flooder, NetworkMessage::Ping(5)));
        assert!(flooder.is_stopping());
        assert_eq!(dispatcher.drops(&flooder), 0);
        assert!(!other.is_stopping());
    }

    #[test]
    fn test_cancel_drains_without_processing() {
        let (peer, _sent) = PeerHandle::detached("127.0.0.1:1".parse().unwrap());
        let (dispatcher, queue) = Dispatcher::new(16);
        for _ in 0..5 {
            dispatcher.dispatch(&peer, NetworkMessage::Ping(7));
        }
        let handler = Arc::new(Counting { handled: AtomicUsize::new(0), seen: Mutex::new(Vec::new()) });
        let cancel = CancelSource::new();
        cancel.cancel();
        let pool = WorkerPool::start(2, queue, handler.clone(), cancel.token(), Duration::from_millis(10)).unwrap();
        pool.join();
        assert_eq!(handler.handled.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.queued(), 0);
    }
}
