//! Merkle trees: block merkle root and the partial tree carried by merkleblock

use crate::constants::MAX_BLOCK_WEIGHT;
use crate::encode::{CodecError, Decodable, Encodable, Reader, Writer};
use crate::error::{ConsensusError, Result};
use crate::hashes::double_sha256_parts;
use crate::types::HashId;

/// Smallest possible transaction weight, bounding leaves per block
const MIN_TRANSACTION_WEIGHT: usize = 60 * 4;

fn hash_pair(left: &HashId, right: &HashId) -> HashId {
    double_sha256_parts(&[left.as_bytes(), right.as_bytes()])
}

/// MerkleRoot: ℍ* → ℍ
///
/// Pairwise SHA256d up the tree, duplicating the last hash of odd levels.
/// Also reports whether two identical siblings were hashed together, which
/// lets an attacker produce a different transaction list with the same root.
pub fn merkle_root_with_mutation(leaves: &[HashId]) -> (HashId, bool) {
    if leaves.is_empty() {
        return (HashId::ZERO, false);
    }
    let mut mutated = false;
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        for pair in level.chunks(2) {
            if pair.len() == 2 && pair[0] == pair[1] {
                mutated = true;
            }
        }
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level.chunks(2).map(|pair| hash_pair(&pair[0], &pair[1])).collect();
    }
    (level[0], mutated)
}

pub fn merkle_root(leaves: &[HashId]) -> HashId {
    merkle_root_with_mutation(leaves).0
}

/// Partial merkle tree: a depth-first pruned tree proving a subset of leaves.
///
/// `bits` marks, per visited node, whether the subtree contains a match;
/// `hashes` holds the hashes of pruned subtrees and matched leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialMerkleTree {
    total: u32,
    bits: Vec<bool>,
    hashes: Vec<HashId>,
}

impl PartialMerkleTree {
    /// Build a tree over `txids`, proving the leaves whose `matches` flag is set
    pub fn from_txids(txids: &[HashId], matches: &[bool]) -> Self {
        let mut tree = PartialMerkleTree { total: txids.len() as u32, bits: Vec::new(), hashes: Vec::new() };
        let height = tree.height();
        tree.traverse_and_build(height, 0, txids, matches);
        tree
    }

    pub fn total_transactions(&self) -> u32 {
        self.total
    }

    pub fn hashes(&self) -> &[HashId] {
        &self.hashes
    }

    pub fn bits(&self) -> &[bool] {
        &self.bits
    }

    fn height(&self) -> u32 {
        let mut height = 0;
        while self.tree_width(height) > 1 {
            height += 1;
        }
        height
    }

    fn tree_width(&self, height: u32) -> u32 {
        ((self.total as u64 + (1u64 << height) - 1) >> height) as u32
    }

    fn calc_hash(&self, height: u32, pos: u32, txids: &[HashId]) -> HashId {
        if height == 0 {
            return txids[pos as usize];
        }
        let left = self.calc_hash(height - 1, pos * 2, txids);
        let right = if pos * 2 + 1 < self.tree_width(height - 1) {
            self.calc_hash(height - 1, pos * 2 + 1, txids)
        } else {
            left
        };
        hash_pair(&left, &right)
    }

    fn traverse_and_build(&mut self, height: u32, pos: u32, txids: &[HashId], matches: &[bool]) {
        let start = (pos as u64) << height;
        let end = (((pos as u64) + 1) << height).min(self.total as u64);
        let parent_of_match = (start..end).any(|p| matches.get(p as usize).copied().unwrap_or(false));
        self.bits.push(parent_of_match);

        if height == 0 || !parent_of_match {
            let hash = self.calc_hash(height, pos, txids);
            self.hashes.push(hash);
        } else {
            self.traverse_and_build(height - 1, pos * 2, txids, matches);
            if pos * 2 + 1 < self.tree_width(height - 1) {
                self.traverse_and_build(height - 1, pos * 2 + 1, txids, matches);
            }
        }
    }

    fn traverse_and_extract(
        &self,
        height: u32,
        pos: u32,
        cursor: &mut ExtractCursor,
        matched: &mut Vec<(u32, HashId)>,
    ) -> Result<HashId> {
        let parent_of_match = *self
            .bits
            .get(cursor.bits_used)
            .ok_or_else(|| malformed("ran out of flag bits"))?;
        cursor.bits_used += 1;

        if height == 0 || !parent_of_match {
            let hash = *self
                .hashes
                .get(cursor.hashes_used)
                .ok_or_else(|| malformed("ran out of hashes"))?;
            cursor.hashes_used += 1;
            if height == 0 && parent_of_match {
                matched.push((pos, hash));
            }
            return Ok(hash);
        }

        let left = self.traverse_and_extract(height - 1, pos * 2, cursor, matched)?;
        let right = if pos * 2 + 1 < self.tree_width(height - 1) {
            let right = self.traverse_and_extract(height - 1, pos * 2 + 1, cursor, matched)?;
            if right == left {
                return Err(malformed("identical sibling hashes"));
            }
            right
        } else {
            left
        };
        Ok(hash_pair(&left, &right))
    }

    /// Recompute the root and return the matched leaves with their positions
    pub fn extract_matches(&self) -> Result<(HashId, Vec<(u32, HashId)>)> {
        if self.total == 0 {
            return Err(malformed("no transactions"));
        }
        if self.total as usize > MAX_BLOCK_WEIGHT / MIN_TRANSACTION_WEIGHT {
            return Err(malformed("too many transactions"));
        }
        if self.hashes.len() > self.total as usize {
            return Err(malformed("more hashes than transactions"));
        }
        if self.bits.len() < self.hashes.len() {
            return Err(malformed("fewer flag bits than hashes"));
        }

        let mut cursor = ExtractCursor::default();
        let mut matched = Vec::new();
        let root = self.traverse_and_extract(self.height(), 0, &mut cursor, &mut matched)?;

        if (cursor.bits_used + 7) / 8 != (self.bits.len() + 7) / 8 {
            return Err(malformed("unused flag bytes"));
        }
        if cursor.hashes_used != self.hashes.len() {
            return Err(malformed("unused hashes"));
        }
        Ok((root, matched))
    }
}

#[derive(Default)]
struct ExtractCursor {
    bits_used: usize,
    hashes_used: usize,
}

fn malformed(reason: &str) -> ConsensusError {
    ConsensusError::BlockValidation(format!("malformed partial merkle tree: {}", reason))
}

impl Encodable for PartialMerkleTree {
    fn encode(&self, w: &mut Writer) {
        w.write_u32(self.total);
        w.write_list(&self.hashes);
        let mut flags = vec![0u8; (self.bits.len() + 7) / 8];
        for (p, bit) in self.bits.iter().enumerate() {
            flags[p / 8] |= (*bit as u8) << (p % 8);
        }
        w.write_var_bytes(&flags);
    }
}

impl Decodable for PartialMerkleTree {
    fn decode(r: &mut Reader<'_>) -> std::result::Result<Self, CodecError> {
        let total = r.read_u32()?;
        let hashes = Vec::<HashId>::decode(r)?;
        let flags = r.read_var_bytes()?;
        let bits = (0..flags.len() * 8).map(|p| flags[p / 8] & (1 << (p % 8)) != 0).collect();
        Ok(PartialMerkleTree { total, bits, hashes })
    }
}
