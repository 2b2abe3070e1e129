//! Best-chain state
//!
//! The tip, the header index and the pending header chain live behind one
//! mutex. Every mutating sequence (link check, validation, persist,
//! advance) runs while holding it, so two workers extending the same parent
//! cannot both win.

use crate::block::{check_block, check_block_header};
use crate::config::NetworkParams;
use crate::constants::*;
use crate::economic::{calculate_fee, check_coinbase_reward};
use crate::error::{lock, ConsensusError, Result};
use crate::pow::{block_work, get_next_work_required};
use crate::store::BlockStore;
use crate::types::*;
use crate::uint256::Uint256;
use crate::verify::verify_tx;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, trace};

/// Best block summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainTip {
    pub hash: HashId,
    pub height: u32,
    pub header: BlockHeader,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    header: BlockHeader,
    height: u32,
    chain_work: Uint256,
}

struct ChainInner {
    index: HashMap<HashId, IndexEntry>,
    /// Connected blocks by height
    blocks: Vec<HashId>,
    /// Best header chain by height; `blocks` is a prefix of it
    headers: Vec<HashId>,
}

impl ChainInner {
    fn entry_at(chain: &[HashId], index: &HashMap<HashId, IndexEntry>, height: u32) -> Option<IndexEntry> {
        chain.get(height as usize).and_then(|hash| index.get(hash)).copied()
    }

    fn tip(&self) -> ChainTip {
        let height = self.blocks.len() as u32 - 1;
        let hash = self.blocks[height as usize];
        ChainTip { hash, height, header: self.index[&hash].header }
    }

    /// Median of the last 11 timestamps ending at `height` on `chain`
    fn median_time_past(&self, chain: &[HashId], height: u32) -> u32 {
        let start = (height + 1).saturating_sub(MEDIAN_TIME_SPAN as u32);
        let mut times: Vec<u32> = (start..=height)
            .filter_map(|h| Self::entry_at(chain, &self.index, h))
            .map(|e| e.header.timestamp)
            .collect();
        times.sort_unstable();
        times.get(times.len() / 2).copied().unwrap_or(0)
    }

    /// Contextual header checks against the parent at `parent_height` on `chain`
    ///
    /// 1. bits equal the required next work
    /// 2. timestamp after median time past
    /// 3. timestamp at most two hours past `now`
    fn check_contextual(
        &self,
        chain: &[HashId],
        params: &NetworkParams,
        header: &BlockHeader,
        parent: &IndexEntry,
        now: u32,
    ) -> Result<()> {
        // 1. Difficulty
        let ancestor = |h: u32| Self::entry_at(chain, &self.index, h).map(|e| e.header);
        let required = get_next_work_required(&parent.header, parent.height, header.timestamp, params, ancestor)
            .ok_or_else(|| ConsensusError::InvalidProofOfWork("retarget window unavailable".to_string()))?;
        if header.bits != required {
            return Err(ConsensusError::InvalidProofOfWork(format!(
                "bits {:#010x} but {:#010x} required",
                header.bits, required
            )));
        }

        // 2. Median time past
        let mtp = self.median_time_past(chain, parent.height);
        if header.timestamp <= mtp {
            return Err(ConsensusError::BlockValidation(format!(
                "timestamp {} not after median time past {}",
                header.timestamp, mtp
            )));
        }

        // 3. Future limit
        if header.timestamp as u64 > now as u64 + MAX_FUTURE_BLOCK_TIME as u64 {
            return Err(ConsensusError::BlockValidation(format!(
                "timestamp {} too far in the future",
                header.timestamp
            )));
        }
        Ok(())
    }
}

/// Shared chain state handed to every worker
pub struct ChainState {
    params: NetworkParams,
    store: Arc<dyn BlockStore>,
    inner: Mutex<ChainInner>,
}

impl ChainState {
    /// New chain seeded with the network's genesis block header
    pub fn new(params: NetworkParams, store: Arc<dyn BlockStore>) -> Self {
        let genesis = params.genesis;
        let hash = genesis.block_hash();
        let mut index = HashMap::new();
        index.insert(hash, IndexEntry { header: genesis, height: 0, chain_work: block_work(genesis.bits) });
        ChainState {
            params,
            store,
            inner: Mutex::new(ChainInner { index, blocks: vec![hash], headers: vec![hash] }),
        }
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn tip(&self) -> ChainTip {
        lock(&self.inner).tip()
    }

    pub fn height(&self) -> u32 {
        lock(&self.inner).blocks.len() as u32 - 1
    }

    pub fn best_hash(&self) -> HashId {
        self.tip().hash
    }

    pub fn best_header_height(&self) -> u32 {
        lock(&self.inner).headers.len() as u32 - 1
    }

    /// Cumulative work of the connected chain
    pub fn chain_work(&self) -> Uint256 {
        let inner = lock(&self.inner);
        let tip = inner.tip();
        inner.index[&tip.hash].chain_work
    }

    pub fn header(&self, hash: &HashId) -> Option<BlockHeader> {
        lock(&self.inner).index.get(hash).map(|e| e.header)
    }

    pub fn contains(&self, hash: &HashId) -> bool {
        lock(&self.inner).index.contains_key(hash)
    }

    /// TryExtend: ℬ × ℕ → ℕ
    ///
    /// Atomically connect `block` on top of the current tip:
    /// 1. The block must build on the tip, else `DoesNotLink`
    /// 2. Contextual header checks (bits, median time past, future limit)
    /// 3. Context-free block checks
    /// 4. Scripts and fees, for every transaction whose prevouts resolve
    /// 5. Persist, then advance the tip and the header chain
    ///
    /// Returns the new height.
    pub fn try_extend(&self, block: &Block, now: u32) -> Result<u32> {
        let hash = block.block_hash();
        let mut inner = lock(&self.inner);
        let tip = inner.tip();

        // 1. Link
        if block.header.prev_block_hash != tip.hash {
            return Err(ConsensusError::DoesNotLink { hash, tip: tip.hash });
        }
        let parent = inner.index[&tip.hash];
        let height = tip.height + 1;

        // 2. Context
        inner.check_contextual(&inner.blocks, &self.params, &block.header, &parent, now)?;

        // 3. Structure
        check_block(block, &self.params.pow_limit)?;

        // 4. Scripts
        let fees = self.connect_transactions(block)?;
        if let (Some(coinbase), Some(fees)) = (block.coinbase(), fees) {
            check_coinbase_reward(coinbase, height as u64, fees, self.params.subsidy_halving_interval)?;
        }

        // 5. Persist and advance
        self.store
            .put_block(block, height)
            .map_err(|e| ConsensusError::Storage(e.to_string()))?;
        let chain_work = parent.chain_work + block_work(block.header.bits);
        inner.index.insert(hash, IndexEntry { header: block.header, height, chain_work });
        inner.blocks.push(hash);
        if inner.headers.get(height as usize) != Some(&hash) {
            inner.headers.truncate(height as usize);
            inner.headers.push(hash);
        }
        info!(%hash, height, txs = block.transactions.len(), "connected block");
        Ok(height)
    }

    /// Verify every transaction whose spent outputs can be resolved
    ///
    /// Prevouts come from earlier transactions in the same block or from the
    /// store. Returns the total fee when every input resolved.
    fn connect_transactions(&self, block: &Block) -> Result<Option<Amount>> {
        let mut created: HashMap<OutPoint, TransactionOutput> = HashMap::new();
        let mut fees: Option<Amount> = Some(0);

        for (i, tx) in block.transactions.iter().enumerate() {
            if i > 0 {
                let prevouts: Option<Vec<TransactionOutput>> = tx
                    .inputs
                    .iter()
                    .map(|input| {
                        created.get(&input.prevout).cloned().or_else(|| {
                            self.store
                                .get_tx(&input.prevout.hash)
                                .ok()
                                .and_then(|prev| prev.outputs.get(input.prevout.index as usize).cloned())
                        })
                    })
                    .collect();
                match prevouts {
                    Some(prevouts) => {
                        verify_tx(tx, &prevouts)?;
                        let input_total: Amount = prevouts.iter().map(|o| o.value).sum();
                        let output_total = tx.total_output_value().ok_or_else(|| {
                            ConsensusError::TransactionValidation("output total out of range".to_string())
                        })?;
                        let fee = calculate_fee(input_total, output_total)?;
                        fees = fees.map(|f| f + fee);
                    }
                    None => {
                        trace!(txid = %tx.txid(), "prevouts unavailable, skipping script checks");
                        fees = None;
                    }
                }
            }
            let txid = tx.txid();
            for (index, output) in tx.outputs.iter().enumerate() {
                created.insert(OutPoint::new(txid, index as u32), output.clone());
            }
        }
        Ok(fees)
    }

    /// AppendHeaders: [ℋ] × ℕ → [ℍ]
    ///
    /// Each header must extend the best header chain and pass proof of work
    /// and contextual checks. Headers already on the chain are skipped.
    /// Returns the hashes appended.
    pub fn append_headers(&self, headers: &[BlockHeader], now: u32) -> Result<Vec<HashId>> {
        let mut inner = lock(&self.inner);
        let mut appended = Vec::new();
        for header in headers {
            let hash = header.block_hash();
            if let Some(entry) = inner.index.get(&hash) {
                if inner.headers.get(entry.height as usize) == Some(&hash) {
                    continue;
                }
            }

            let best = *inner.headers.last().ok_or_else(|| ConsensusError::Storage("empty header chain".to_string()))?;
            if header.prev_block_hash != best {
                return Err(ConsensusError::DoesNotLink { hash, tip: best });
            }
            check_block_header(header, &self.params.pow_limit)?;
            let parent = inner.index[&best];
            inner.check_contextual(&inner.headers, &self.params, header, &parent, now)?;

            let height = parent.height + 1;
            let chain_work = parent.chain_work + block_work(header.bits);
            inner.index.insert(hash, IndexEntry { header: *header, height, chain_work });
            inner.headers.push(hash);
            appended.push(hash);
        }
        if !appended.is_empty() {
            debug!(count = appended.len(), height = inner.headers.len() - 1, "appended headers");
        }
        Ok(appended)
    }

    /// Header-chain hashes that have no connected block yet, lowest first
    pub fn missing_blocks(&self, max: usize) -> Vec<HashId> {
        let inner = lock(&self.inner);
        inner.headers.iter().skip(inner.blocks.len()).take(max).copied().collect()
    }

    /// Block locator from the best header: ten steps back one at a time,
    /// then doubling, always ending at genesis
    pub fn locator(&self) -> Vec<HashId> {
        let inner = lock(&self.inner);
        let mut locator = Vec::new();
        let mut height = inner.headers.len() as i64 - 1;
        let mut step = 1i64;
        while height > 0 {
            locator.push(inner.headers[height as usize]);
            if locator.len() >= 10 {
                step *= 2;
            }
            height -= step;
        }
        locator.push(inner.headers[0]);
        locator
    }

    /// Headers of connected blocks after the first locator hash we know,
    /// up to `max` or through `stop`
    pub fn headers_after(&self, locator: &[HashId], stop: &HashId, max: usize) -> Vec<BlockHeader> {
        let inner = lock(&self.inner);
        let fork = locator
            .iter()
            .filter_map(|hash| inner.index.get(hash))
            .find(|entry| inner.blocks.get(entry.height as usize) == Some(&entry.header.block_hash()))
            .map(|entry| entry.height)
            .unwrap_or(0);

        let mut out = Vec::new();
        for hash in inner.blocks.iter().skip(fork as usize + 1).take(max) {
            out.push(inner.index[hash].header);
            if hash == stop {
                break;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow::check_proof_of_work;
    use crate::store::MemoryStore;
    use std::thread;

    fn coinbase(height: u32, tag: u8) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::NULL,
                script_sig: vec![0x02, height as u8, tag],
                sequence: SEQUENCE_FINAL,
                witness: Vec::new(),
            }],
            outputs: vec![TransactionOutput { value: 50 * COIN, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn mine(params: &NetworkParams, parent: &BlockHeader, height: u32, tag: u8) -> Block {
        let mut block = Block {
            header: BlockHeader {
                version: 4,
                prev_block_hash: parent.block_hash(),
                merkle_root: HashId::ZERO,
                timestamp: parent.timestamp + 600,
                bits: parent.bits,
                nonce: 0,
            },
            transactions: vec![coinbase(height, tag)],
        };
        block.header.merkle_root = block.compute_merkle_root();
        while !check_proof_of_work(&block.header.block_hash(), block.header.bits, &params.pow_limit) {
            block.header.nonce += 1;
        }
        block
    }

    fn regtest_chain() -> ChainState {
        ChainState::new(NetworkParams::regtest(), Arc::new(MemoryStore::new()))
    }

    const NOW: u32 = 2_000_000_000;

    #[test]
    fn test_genesis_tip() {
        let chain = regtest_chain();
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.best_hash(), NetworkParams::regtest().genesis_hash());
        assert_eq!(chain.locator(), vec![chain.best_hash()]);
    }

    #[test]
    fn test_extend_and_reject_stale_parent() {
        let chain = regtest_chain();
        let params = chain.params().clone();
        let b1 = mine(&params, &params.genesis, 1, 0);
        assert_eq!(chain.try_extend(&b1, NOW).unwrap(), 1);
        assert_eq!(chain.best_hash(), b1.block_hash());
        assert!(chain.store().has_block(&b1.block_hash()));

        let sibling = mine(&params, &params.genesis, 1, 1);
        let err = chain.try_extend(&sibling, NOW).unwrap_err();
        assert!(matches!(err, ConsensusError::DoesNotLink { .. }));
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn test_concurrent_children_of_same_parent() {
        let chain = Arc::new(regtest_chain());
        let params = chain.params().clone();
        let a = mine(&params, &params.genesis, 1, 1);
        let b = mine(&params, &params.genesis, 1, 2);

        let handles: Vec<_> = [a.clone(), b.clone()]
            .into_iter()
            .map(|block| {
                let chain = chain.clone();
                thread::spawn(move || chain.try_extend(&block, NOW))
            })
            .collect();
        let results: Vec<Result<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let accepted = results.iter().filter(|r| r.is_ok()).count();
        let rejected = results
            .iter()
            .filter(|r| matches!(r, Err(ConsensusError::DoesNotLink { .. })))
            .count();
        assert_eq!((accepted, rejected), (1, 1));
        assert_eq!(chain.height(), 1);
        let tip = chain.best_hash();
        assert!(tip == a.block_hash() || tip == b.block_hash());
    }

    #[test]
    fn test_rejects_old_timestamp_and_wrong_bits() {
        let chain = regtest_chain();
        let params = chain.params().clone();
        let mut early = mine(&params, &params.genesis, 1, 0);
        early.header.timestamp = params.genesis.timestamp;
        assert!(matches!(chain.try_extend(&early, NOW), Err(ConsensusError::BlockValidation(_))));

        let mut future = mine(&params, &params.genesis, 1, 0);
        future.header.timestamp = NOW + MAX_FUTURE_BLOCK_TIME + 1;
        assert!(chain.try_extend(&future, NOW).is_err());

        let mut hard = mine(&params, &params.genesis, 1, 0);
        hard.header.bits = 0x1d00ffff;
        assert!(matches!(chain.try_extend(&hard, NOW), Err(ConsensusError::InvalidProofOfWork(_))));
        assert_eq!(chain.height(), 0);
    }

    #[test]
    fn test_rejects_excess_coinbase() {
        let chain = regtest_chain();
        let params = chain.params().clone();
        let mut block = mine(&params, &params.genesis, 1, 0);
        block.transactions[0].outputs[0].value = 50 * COIN + 1;
        block.header.merkle_root = block.compute_merkle_root();
        while !check_proof_of_work(&block.header.block_hash(), block.header.bits, &params.pow_limit) {
            block.header.nonce += 1;
        }
        assert!(matches!(chain.try_extend(&block, NOW), Err(ConsensusError::EconomicValidation(_))));
    }

    #[test]
    fn test_headers_then_blocks() {
        let chain = regtest_chain();
        let params = chain.params().clone();
        let b1 = mine(&params, &params.genesis, 1, 0);
        let b2 = mine(&params, &b1.header, 2, 0);
        let b3 = mine(&params, &b2.header, 3, 0);

        let appended = chain.append_headers(&[b1.header, b2.header, b3.header], NOW).unwrap();
        assert_eq!(appended, vec![b1.block_hash(), b2.block_hash(), b3.block_hash()]);
        assert_eq!(chain.best_header_height(), 3);
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.missing_blocks(10), appended);

        // Re-sending known headers is harmless
        assert!(chain.append_headers(&[b1.header], NOW).unwrap().is_empty());

        chain.try_extend(&b1, NOW).unwrap();
        chain.try_extend(&b2, NOW).unwrap();
        assert_eq!(chain.missing_blocks(10), vec![b3.block_hash()]);
        assert_eq!(chain.best_header_height(), 3);

        let unlinked = mine(&params, &params.genesis, 1, 9);
        assert!(matches!(
            chain.append_headers(&[unlinked.header], NOW),
            Err(ConsensusError::DoesNotLink { .. })
        ));
    }

    #[test]
    fn test_locator_and_headers_after() {
        let chain = regtest_chain();
        let params = chain.params().clone();
        let mut parent = params.genesis;
        let mut hashes = vec![params.genesis_hash()];
        for height in 1..=15 {
            let block = mine(&params, &parent, height, 0);
            chain.try_extend(&block, NOW).unwrap();
            hashes.push(block.block_hash());
            parent = block.header;
        }

        let locator = chain.locator();
        assert_eq!(locator[0], hashes[15]);
        assert_eq!(&locator[..10], &hashes[6..=15].iter().rev().copied().collect::<Vec<_>>()[..]);
        assert_eq!(*locator.last().unwrap(), hashes[0]);

        let after = chain.headers_after(&[hashes[10], hashes[3]], &HashId::ZERO, 2000);
        assert_eq!(after.len(), 5);
        assert_eq!(after[0].block_hash(), hashes[11]);

        let bounded = chain.headers_after(&[HashId([0xee; 32])], &hashes[4], 2000);
        assert_eq!(bounded.len(), 4);
        assert_eq!(bounded.last().unwrap().block_hash(), hashes[4]);
    }
}
