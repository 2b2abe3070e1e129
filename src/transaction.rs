//! Transaction serialization, hashing and structural checks

use crate::constants::*;
use crate::economic::money_range;
use crate::encode::{serialize, CodecError, Decodable, Encodable, Reader, Writer};
use crate::error::{ConsensusError, Result};
use crate::hashes::double_sha256;
use crate::types::*;
use std::collections::HashSet;

impl Encodable for OutPoint {
    fn encode(&self, w: &mut Writer) {
        w.write_hash(&self.hash);
        w.write_u32(self.index);
    }
}

impl Decodable for OutPoint {
    fn decode(r: &mut Reader<'_>) -> std::result::Result<Self, CodecError> {
        Ok(OutPoint { hash: r.read_hash()?, index: r.read_u32()? })
    }
}

/// Inputs encode without their witness; witnesses follow the outputs.
impl Encodable for TransactionInput {
    fn encode(&self, w: &mut Writer) {
        self.prevout.encode(w);
        w.write_var_bytes(&self.script_sig);
        w.write_u32(self.sequence);
    }
}

impl Decodable for TransactionInput {
    fn decode(r: &mut Reader<'_>) -> std::result::Result<Self, CodecError> {
        Ok(TransactionInput {
            prevout: OutPoint::decode(r)?,
            script_sig: r.read_var_bytes()?,
            sequence: r.read_u32()?,
            witness: Vec::new(),
        })
    }
}

impl Encodable for TransactionOutput {
    fn encode(&self, w: &mut Writer) {
        w.write_i64(self.value);
        w.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TransactionOutput {
    fn decode(r: &mut Reader<'_>) -> std::result::Result<Self, CodecError> {
        Ok(TransactionOutput { value: r.read_i64()?, script_pubkey: r.read_var_bytes()? })
    }
}

impl Encodable for Transaction {
    fn encode(&self, w: &mut Writer) {
        self.encode_with(w, true);
    }
}

impl Decodable for Transaction {
    /// version ‖ [0x00 0x01] ‖ inputs ‖ outputs ‖ [witness stacks] ‖ lock_time
    fn decode(r: &mut Reader<'_>) -> std::result::Result<Self, CodecError> {
        let version = r.read_i32()?;
        let mut flags = 0u8;
        let mut inputs: Vec<TransactionInput> = Vec::decode(r)?;
        let mut outputs: Vec<TransactionOutput> = Vec::new();

        if inputs.is_empty() {
            // An empty input list is the witness marker; the next byte is the flag.
            flags = r.read_u8()?;
            if flags != 0 {
                inputs = Vec::decode(r)?;
                outputs = Vec::decode(r)?;
            }
        } else {
            outputs = Vec::decode(r)?;
        }

        if flags & 1 != 0 {
            flags ^= 1;
            for input in inputs.iter_mut() {
                let items = r.read_length()?;
                let mut stack = Vec::with_capacity(items.min(64));
                for _ in 0..items {
                    stack.push(r.read_var_bytes()?);
                }
                input.witness = stack;
            }
            if inputs.iter().all(|input| input.witness.is_empty()) {
                return Err(CodecError::SuperfluousWitness);
            }
        }
        if flags != 0 {
            return Err(CodecError::UnknownTxFlag(flags));
        }

        let lock_time = r.read_u32()?;
        Ok(Transaction { version, inputs, outputs, lock_time })
    }
}

impl Transaction {
    /// True when any input carries a witness stack
    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// Serialize, optionally including the witness section
    pub fn encode_with(&self, w: &mut Writer, include_witness: bool) {
        let witness = include_witness && self.has_witness();
        w.write_i32(self.version);
        if witness {
            w.write_u8(0x00);
            w.write_u8(0x01);
        }
        w.write_list(&self.inputs);
        w.write_list(&self.outputs);
        if witness {
            for input in &self.inputs {
                w.write_compact_size(input.witness.len() as u64);
                for item in &input.witness {
                    w.write_var_bytes(item);
                }
            }
        }
        w.write_u32(self.lock_time);
    }

    /// Base serialization: version ‖ inputs ‖ outputs ‖ lock_time
    pub fn base_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.encode_with(&mut w, false);
        w.into_inner()
    }

    /// Full serialization including witness data when present
    pub fn to_bytes(&self) -> Vec<u8> {
        serialize(self)
    }

    /// Transaction id: SHA256d of the base serialization
    pub fn txid(&self) -> HashId {
        double_sha256(&self.base_bytes())
    }

    /// Witness transaction id: SHA256d of the full serialization
    pub fn wtxid(&self) -> HashId {
        double_sha256(&self.to_bytes())
    }

    pub fn is_coinbase(&self) -> bool {
        is_coinbase(self)
    }

    pub fn base_size(&self) -> usize {
        self.base_bytes().len()
    }

    pub fn total_size(&self) -> usize {
        self.to_bytes().len()
    }

    /// Weight = base_size × 3 + total_size
    pub fn weight(&self) -> usize {
        self.base_size() * (WITNESS_SCALE_FACTOR - 1) + self.total_size()
    }

    /// Virtual size, rounded up
    pub fn vsize(&self) -> usize {
        (self.weight() + WITNESS_SCALE_FACTOR - 1) / WITNESS_SCALE_FACTOR
    }

    /// Sum of output values, or `None` if it leaves the money range
    pub fn total_output_value(&self) -> Option<Amount> {
        let mut total: Amount = 0;
        for output in &self.outputs {
            total = total.checked_add(output.value)?;
            if !money_range(total) {
                return None;
            }
        }
        Some(total)
    }
}

/// IsCoinBase: the first input spends the zero hash
pub fn is_coinbase(tx: &Transaction) -> bool {
    tx.inputs.first().map_or(false, |input| input.prevout.hash.is_zero())
}

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// A transaction tx = (v, ins, outs, lt) is valid if and only if:
/// 1. |ins| > 0 ∧ |outs| > 0
/// 2. weight(base(tx)) ≤ W_max
/// 3. ∀o ∈ outs: 0 ≤ o.value < M_max, and Σ o.value < M_max
/// 4. no outpoint is spent twice
/// 5. coinbase: |ins| = 1 ∧ 2 ≤ |ins[0].script| ≤ 100
///    otherwise: ∀i ∈ ins: i.prevout.hash ≠ 0
pub fn check_transaction(tx: &Transaction) -> Result<()> {
    // 1. Check inputs and outputs are not empty
    if tx.inputs.is_empty() {
        return Err(ConsensusError::TransactionValidation("no inputs".to_string()));
    }
    if tx.outputs.is_empty() {
        return Err(ConsensusError::TransactionValidation("no outputs".to_string()));
    }

    // 2. Size limit, witness excluded
    if tx.base_size() * WITNESS_SCALE_FACTOR > MAX_BLOCK_WEIGHT {
        return Err(ConsensusError::TransactionValidation("oversize".to_string()));
    }

    // 3. Output values and running total
    let mut total: Amount = 0;
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.value < 0 {
            return Err(ConsensusError::TransactionValidation(format!(
                "negative output value {} at index {}",
                output.value, i
            )));
        }
        if output.value >= MAX_MONEY {
            return Err(ConsensusError::TransactionValidation(format!(
                "output value {} at index {} exceeds money range",
                output.value, i
            )));
        }
        total += output.value;
        if !money_range(total) {
            return Err(ConsensusError::TransactionValidation(
                "total output value out of range".to_string(),
            ));
        }
    }

    // 4. Duplicate inputs
    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !seen.insert(input.prevout) {
            return Err(ConsensusError::TransactionValidation("duplicate inputs".to_string()));
        }
    }

    // 5. Coinbase shape or non-null prevouts
    if is_coinbase(tx) {
        if tx.inputs.len() != 1 {
            return Err(ConsensusError::TransactionValidation(format!(
                "coinbase has {} inputs",
                tx.inputs.len()
            )));
        }
        let len = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&len) {
            return Err(ConsensusError::TransactionValidation(format!(
                "coinbase script length {} out of range",
                len
            )));
        }
    } else {
        for (i, input) in tx.inputs.iter().enumerate() {
            if input.prevout.hash.is_zero() {
                return Err(ConsensusError::TransactionValidation(format!(
                    "input {} references the null hash",
                    i
                )));
            }
        }
    }

    Ok(())
}

/// IsFinal: 𝒯𝒳 × ℕ × ℕ → {true, false}
///
/// A lock time of zero is treated as not final. Otherwise the lock time is
/// compared against the block height (below the threshold) or the block
/// time, and a lock still in force is overridden only when every input has
/// a final sequence number.
pub fn is_final(tx: &Transaction, height: u32, block_time: u32) -> bool {
    if tx.lock_time == 0 {
        return false;
    }
    let limit = if tx.lock_time < LOCKTIME_THRESHOLD { height } else { block_time };
    if tx.lock_time < limit {
        return true;
    }
    tx.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}
