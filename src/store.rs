//! Block and transaction storage
//!
//! Records are kept as raw bytes keyed by hash. A stored block is
//! `header (80) ‖ VarInt(height) ‖ VarInt(tx count) ‖ txids`, with the
//! transactions themselves stored as separate records.

use crate::cache::{Cache, CacheError, OnFull, TtlCache};
use crate::encode::{deserialize, serialize, CodecError, Decodable, Encodable, Reader, Writer};
use crate::error::lock;
use crate::types::*;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(HashId),

    #[error("corrupt record: {0}")]
    Codec(#[from] CodecError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Keyed storage for raw transaction and block records
pub trait BlockStore: Send + Sync {
    fn put_tx(&self, tx: &Transaction) -> StoreResult<()>;
    fn get_tx(&self, txid: &HashId) -> StoreResult<Transaction>;
    fn del_tx(&self, txid: &HashId) -> StoreResult<()>;
    fn has_tx(&self, txid: &HashId) -> bool;

    /// Store the block record and each of its transactions
    fn put_block(&self, block: &Block, height: u32) -> StoreResult<()>;
    fn get_block(&self, hash: &HashId) -> StoreResult<Block>;
    fn block_height(&self, hash: &HashId) -> StoreResult<u32>;
    fn del_block(&self, hash: &HashId) -> StoreResult<()>;
    fn has_block(&self, hash: &HashId) -> bool;

    /// All transactions of a block, in block order
    fn block_transactions(&self, hash: &HashId) -> StoreResult<Vec<Transaction>>;
}

/// Stored form of a block: header, height and transaction ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub header: BlockHeader,
    pub height: u32,
    pub txids: Vec<HashId>,
}

impl Encodable for BlockRecord {
    fn encode(&self, w: &mut Writer) {
        self.header.encode(w);
        w.write_varint(self.height as u64);
        w.write_varint(self.txids.len() as u64);
        for txid in &self.txids {
            w.write_hash(txid);
        }
    }
}

impl Decodable for BlockRecord {
    fn decode(r: &mut Reader<'_>) -> Result<Self, CodecError> {
        let header = BlockHeader::decode(r)?;
        let height = u32::try_from(r.read_varint()?).map_err(|_| CodecError::VarIntOverflow)?;
        let count = r.read_varint()?;
        if count > (r.remaining() / 32) as u64 {
            return Err(CodecError::OversizedLength(count));
        }
        let txids = r.read_vec(count as usize)?;
        Ok(BlockRecord { header, height, txids })
    }
}

/// In-memory reference store
#[derive(Default)]
pub struct MemoryStore {
    txs: Mutex<HashMap<HashId, Vec<u8>>>,
    blocks: Mutex<HashMap<HashId, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, hash: &HashId) -> StoreResult<BlockRecord> {
        let blocks = lock(&self.blocks);
        let raw = blocks.get(hash).ok_or(StoreError::NotFound(*hash))?;
        Ok(deserialize(raw)?)
    }

    pub fn block_count(&self) -> usize {
        lock(&self.blocks).len()
    }

    pub fn tx_count(&self) -> usize {
        lock(&self.txs).len()
    }
}

impl BlockStore for MemoryStore {
    fn put_tx(&self, tx: &Transaction) -> StoreResult<()> {
        lock(&self.txs).insert(tx.txid(), tx.to_bytes());
        Ok(())
    }

    fn get_tx(&self, txid: &HashId) -> StoreResult<Transaction> {
        let txs = lock(&self.txs);
        let raw = txs.get(txid).ok_or(StoreError::NotFound(*txid))?;
        Ok(deserialize(raw)?)
    }

    fn del_tx(&self, txid: &HashId) -> StoreResult<()> {
        lock(&self.txs).remove(txid).map(|_| ()).ok_or(StoreError::NotFound(*txid))
    }

    fn has_tx(&self, txid: &HashId) -> bool {
        lock(&self.txs).contains_key(txid)
    }

    fn put_block(&self, block: &Block, height: u32) -> StoreResult<()> {
        for tx in &block.transactions {
            self.put_tx(tx)?;
        }
        let record = BlockRecord { header: block.header, height, txids: block.txids() };
        lock(&self.blocks).insert(block.block_hash(), serialize(&record));
        Ok(())
    }

    fn get_block(&self, hash: &HashId) -> StoreResult<Block> {
        let record = self.record(hash)?;
        let transactions = self.block_transactions(hash)?;
        Ok(Block { header: record.header, transactions })
    }

    fn block_height(&self, hash: &HashId) -> StoreResult<u32> {
        Ok(self.record(hash)?.height)
    }

    fn del_block(&self, hash: &HashId) -> StoreResult<()> {
        lock(&self.blocks).remove(hash).map(|_| ()).ok_or(StoreError::NotFound(*hash))
    }

    fn has_block(&self, hash: &HashId) -> bool {
        lock(&self.blocks).contains_key(hash)
    }

    fn block_transactions(&self, hash: &HashId) -> StoreResult<Vec<Transaction>> {
        let record = self.record(hash)?;
        record.txids.iter().map(|txid| self.get_tx(txid)).collect()
    }
}

/// Write-through store wrapper with expiring transaction and block caches
pub struct CachedStore<S> {
    inner: S,
    txs: TtlCache<HashId, Transaction>,
    blocks: TtlCache<HashId, Block>,
}

impl<S: BlockStore> CachedStore<S> {
    pub fn new(inner: S, capacity: usize, ttl: Duration) -> Self {
        CachedStore {
            inner,
            txs: TtlCache::new(capacity, ttl, OnFull::EvictOldest),
            blocks: TtlCache::new(capacity, ttl, OnFull::EvictOldest),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn remember<V>(cache: &TtlCache<HashId, V>, key: HashId, value: V)
    where
        V: Clone + Send,
    {
        if let Err(e) = cache.set(key, value) {
            debug!(%key, error = %e, "cache insert skipped");
        }
    }
}

impl<S: BlockStore> BlockStore for CachedStore<S> {
    fn put_tx(&self, tx: &Transaction) -> StoreResult<()> {
        self.inner.put_tx(tx)?;
        Self::remember(&self.txs, tx.txid(), tx.clone());
        Ok(())
    }

    fn get_tx(&self, txid: &HashId) -> StoreResult<Transaction> {
        match self.txs.get(txid) {
            Ok(tx) => Ok(tx),
            Err(CacheError::NotFound) | Err(CacheError::Full) => {
                let tx = self.inner.get_tx(txid)?;
                Self::remember(&self.txs, *txid, tx.clone());
                Ok(tx)
            }
        }
    }

    fn del_tx(&self, txid: &HashId) -> StoreResult<()> {
        self.txs.del(txid);
        self.inner.del_tx(txid)
    }

    fn has_tx(&self, txid: &HashId) -> bool {
        self.txs.get(txid).is_ok() || self.inner.has_tx(txid)
    }

    fn put_block(&self, block: &Block, height: u32) -> StoreResult<()> {
        self.inner.put_block(block, height)?;
        Self::remember(&self.blocks, block.block_hash(), block.clone());
        Ok(())
    }

    fn get_block(&self, hash: &HashId) -> StoreResult<Block> {
        match self.blocks.get(hash) {
            Ok(block) => Ok(block),
            Err(_) => {
                let block = self.inner.get_block(hash)?;
                Self::remember(&self.blocks, *hash, block.clone());
                Ok(block)
            }
        }
    }

    fn block_height(&self, hash: &HashId) -> StoreResult<u32> {
        self.inner.block_height(hash)
    }

    fn del_block(&self, hash: &HashId) -> StoreResult<()> {
        self.blocks.del(hash);
        self.inner.del_block(hash)
    }

    fn has_block(&self, hash: &HashId) -> bool {
        self.blocks.get(hash).is_ok() || self.inner.has_block(hash)
    }

    fn block_transactions(&self, hash: &HashId) -> StoreResult<Vec<Transaction>> {
        match self.blocks.get(hash) {
            Ok(block) => Ok(block.transactions),
            Err(_) => self.inner.block_transactions(hash),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::SEQUENCE_FINAL;

    fn coinbase(tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::NULL,
                script_sig: vec![0x01, tag],
                sequence: SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            outputs: vec![TransactionOutput { value: 50, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn sample_block() -> Block {
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: HashId([1; 32]),
                merkle_root: HashId::ZERO,
                timestamp: 1000,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions: vec![coinbase(1), coinbase(2)],
        };
        block.header.merkle_root = block.compute_merkle_root();
        block
    }

    #[test]
    fn test_block_record_layout() {
        let block = sample_block();
        let record = BlockRecord { header: block.header, height: 300, txids: block.txids() };
        let bytes = serialize(&record);
        // 300 = 0b10_0101100 → 0x81 0x2c in the 7-bit scheme
        assert_eq!(&bytes[80..82], &[0x81, 0x2c]);
        assert_eq!(bytes[82], 2);
        assert_eq!(bytes.len(), 80 + 2 + 1 + 64);
        assert_eq!(deserialize::<BlockRecord>(&bytes).unwrap(), record);
    }

    #[test]
    fn test_memory_store_block_round_trip() {
        let store = MemoryStore::new();
        let block = sample_block();
        let hash = block.block_hash();
        assert!(!store.has_block(&hash));

        store.put_block(&block, 7).unwrap();
        assert!(store.has_block(&hash));
        assert_eq!(store.get_block(&hash).unwrap(), block);
        assert_eq!(store.block_height(&hash).unwrap(), 7);
        assert_eq!(store.block_transactions(&hash).unwrap(), block.transactions);
        assert!(store.has_tx(&block.transactions[1].txid()));

        store.del_block(&hash).unwrap();
        assert!(matches!(store.get_block(&hash), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_missing_tx_breaks_block_read() {
        let store = MemoryStore::new();
        let block = sample_block();
        store.put_block(&block, 1).unwrap();
        store.del_tx(&block.transactions[0].txid()).unwrap();
        assert!(store.block_transactions(&block.block_hash()).is_err());
    }

    #[test]
    fn test_cached_store_falls_through() {
        let store = CachedStore::new(MemoryStore::new(), 16, Duration::from_secs(60));
        let tx = coinbase(9);
        store.inner().put_tx(&tx).unwrap();
        // Not cached yet: comes from the store, then from the cache
        assert_eq!(store.get_tx(&tx.txid()).unwrap(), tx);
        store.inner().del_tx(&tx.txid()).unwrap();
        assert_eq!(store.get_tx(&tx.txid()).unwrap(), tx);

        store.del_tx(&tx.txid()).unwrap_err();
        assert!(!store.has_tx(&tx.txid()));
    }

    #[test]
    fn test_cached_store_write_through() {
        let store = CachedStore::new(MemoryStore::new(), 16, Duration::from_secs(60));
        let block = sample_block();
        store.put_block(&block, 3).unwrap();
        assert!(store.inner().has_block(&block.block_hash()));
        assert_eq!(store.get_block(&block.block_hash()).unwrap(), block);
        assert_eq!(store.block_height(&block.block_hash()).unwrap(), 3);
    }
}
