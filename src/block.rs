//! Block header and block serialization, hashing and context-free checks

use crate::constants::*;
use crate::encode::{CodecError, Decodable, Encodable, Reader, Writer};
use crate::error::{ConsensusError, Result};
use crate::hashes::double_sha256;
use crate::merkle::merkle_root_with_mutation;
use crate::pow::check_proof_of_work;
use crate::transaction::check_transaction;
use crate::types::*;
use crate::uint256::Uint256;
use std::collections::HashSet;

/// Serialized header size
pub const HEADER_SIZE: usize = 80;

impl Encodable for BlockHeader {
    fn encode(&self, w: &mut Writer) {
        w.write_i32(self.version);
        w.write_hash(&self.prev_block_hash);
        w.write_hash(&self.merkle_root);
        w.write_u32(self.timestamp);
        w.write_u32(self.bits);
        w.write_u32(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn decode(r: &mut Reader<'_>) -> std::result::Result<Self, CodecError> {
        Ok(BlockHeader {
            version: r.read_i32()?,
            prev_block_hash: r.read_hash()?,
            merkle_root: r.read_hash()?,
            timestamp: r.read_u32()?,
            bits: r.read_u32()?,
            nonce: r.read_u32()?,
        })
    }
}

impl BlockHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut w = Writer::with_capacity(HEADER_SIZE);
        self.encode(&mut w);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(w.as_slice());
        out
    }

    /// Block hash: SHA256d of the 80-byte header
    pub fn block_hash(&self) -> HashId {
        double_sha256(&self.to_bytes())
    }

    /// Target encoded by `bits`, ignoring the sign and overflow flags
    pub fn target(&self) -> Uint256 {
        Uint256::from_compact(self.bits).0
    }
}

impl Encodable for Block {
    fn encode(&self, w: &mut Writer) {
        self.header.encode(w);
        w.write_list(&self.transactions);
    }
}

impl Decodable for Block {
    fn decode(r: &mut Reader<'_>) -> std::result::Result<Self, CodecError> {
        Ok(Block { header: BlockHeader::decode(r)?, transactions: Vec::decode(r)? })
    }
}

impl Block {
    pub fn block_hash(&self) -> HashId {
        self.header.block_hash()
    }

    pub fn txids(&self) -> Vec<HashId> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    /// Merkle root over the transaction ids
    pub fn compute_merkle_root(&self) -> HashId {
        merkle_root_with_mutation(&self.txids()).0
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    pub fn weight(&self) -> usize {
        let mut base = HEADER_SIZE + crate::encode::compact_size_len(self.transactions.len() as u64);
        let mut total = base;
        for tx in &self.transactions {
            base += tx.base_size();
            total += tx.total_size();
        }
        base * (WITNESS_SCALE_FACTOR - 1) + total
    }
}

/// CheckBlockHeader: ℋ × ℕ → {valid, invalid}
///
/// The header hash must satisfy the target its bits encode, within `pow_limit`.
pub fn check_block_header(header: &BlockHeader, pow_limit: &Uint256) -> Result<()> {
    if !check_proof_of_work(&header.block_hash(), header.bits, pow_limit) {
        return Err(ConsensusError::InvalidProofOfWork(format!(
            "header {} does not meet target {:#010x}",
            header.block_hash(),
            header.bits
        )));
    }
    Ok(())
}

/// CheckBlock: ℬ × ℕ → {valid, invalid}
///
/// For block b = (h, txs):
/// 1. h satisfies proof of work
/// 2. |txs| > 0 and weight(b) ≤ W_max
/// 3. txs[0] is the only coinbase
/// 4. ∀tx ∈ txs: CheckTransaction(tx), with no duplicate txids
/// 5. h.merkle_root = MerkleRoot(txids), with no duplicated siblings
pub fn check_block(block: &Block, pow_limit: &Uint256) -> Result<()> {
    // 1. Proof of work
    check_block_header(&block.header, pow_limit)?;

    // 2. Size limits
    if block.transactions.is_empty() {
        return Err(ConsensusError::BlockValidation("block has no transactions".to_string()));
    }
    if block.weight() > MAX_BLOCK_WEIGHT {
        return Err(ConsensusError::BlockValidation("block weight exceeds limit".to_string()));
    }

    // 3. Coinbase placement
    if !block.transactions[0].is_coinbase() {
        return Err(ConsensusError::BlockValidation("first transaction is not coinbase".to_string()));
    }
    if let Some(pos) = block.transactions.iter().skip(1).position(Transaction::is_coinbase) {
        return Err(ConsensusError::BlockValidation(format!(
            "more than one coinbase (index {})",
            pos + 1
        )));
    }

    // 4. Transactions
    let txids = block.txids();
    let mut seen = HashSet::with_capacity(txids.len());
    for (i, tx) in block.transactions.iter().enumerate() {
        check_transaction(tx).map_err(|e| {
            ConsensusError::BlockValidation(format!("transaction {} invalid: {}", i, e))
        })?;
        if !seen.insert(txids[i]) {
            return Err(ConsensusError::BlockValidation(format!("duplicate transaction {}", txids[i])));
        }
    }

    // 5. Merkle root
    let (root, mutated) = merkle_root_with_mutation(&txids);
    if mutated {
        return Err(ConsensusError::BlockValidation("merkle tree has duplicated siblings".to_string()));
    }
    if root != block.header.merkle_root {
        return Err(ConsensusError::BlockValidation(format!(
            "merkle root mismatch: header {} computed {}",
            block.header.merkle_root, root
        )));
    }

    Ok(())
}
