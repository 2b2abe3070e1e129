//! Signature hashes: legacy and BIP143 (segwit v0)

use crate::encode::{Encodable, Writer};
use crate::hashes::double_sha256;
use crate::script::remove_codeseparators;
use crate::types::*;

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Hash returned for the historical SIGHASH_SINGLE out-of-range case
pub fn sighash_one() -> HashId {
    let mut bytes = [0u8; 32];
    bytes[0] = 1;
    HashId(bytes)
}

fn base_type(hash_type: u32) -> u32 {
    hash_type & 0x1f
}

/// LegacySighash: 𝒯𝒳 × ℕ × 𝒮𝒞 × ℕ → ℍ
///
/// 1. If input_index ≥ |inputs|, or base type is SINGLE and input_index ≥ |outputs|, return ONE
/// 2. Serialize a copy of tx where:
///    - the signed input carries script_code without OP_CODESEPARATOR, others an empty script
///    - NONE/SINGLE zero the other inputs' sequence
///    - ANYONECANPAY keeps only the signed input
///    - NONE drops all outputs; SINGLE keeps outputs up to input_index, blanking earlier ones
/// 3. Append hash_type as 4 bytes LE and return sha256d
pub fn legacy_sighash(tx: &Transaction, input_index: usize, script_code: &[u8], hash_type: u32) -> HashId {
    if input_index >= tx.inputs.len() {
        return sighash_one();
    }
    let base = base_type(hash_type);
    if base == SIGHASH_SINGLE && input_index >= tx.outputs.len() {
        return sighash_one();
    }
    double_sha256(&legacy_preimage(tx, input_index, script_code, hash_type))
}

/// Serialized message hashed by [`legacy_sighash`]; `input_index` must be in range
pub fn legacy_preimage(tx: &Transaction, input_index: usize, script_code: &[u8], hash_type: u32) -> Vec<u8> {
    let base = base_type(hash_type);
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;
    let script_code = remove_codeseparators(script_code);

    let mut w = Writer::with_capacity(tx.base_size() + script_code.len() + 4);
    w.write_i32(tx.version);

    // Inputs
    let write_input = |w: &mut Writer, i: usize, input: &TransactionInput| {
        input.prevout.encode(w);
        if i == input_index {
            w.write_var_bytes(&script_code);
        } else {
            w.write_var_bytes(&[]);
        }
        if i != input_index && (base == SIGHASH_NONE || base == SIGHASH_SINGLE) {
            w.write_u32(0);
        } else {
            w.write_u32(input.sequence);
        }
    };
    if anyone_can_pay {
        w.write_compact_size(1);
        write_input(&mut w, input_index, &tx.inputs[input_index]);
    } else {
        w.write_compact_size(tx.inputs.len() as u64);
        for (i, input) in tx.inputs.iter().enumerate() {
            write_input(&mut w, i, input);
        }
    }

    // Outputs
    match base {
        SIGHASH_NONE => w.write_compact_size(0),
        SIGHASH_SINGLE => {
            w.write_compact_size(input_index as u64 + 1);
            for _ in 0..input_index {
                w.write_i64(-1);
                w.write_var_bytes(&[]);
            }
            tx.outputs[input_index].encode(&mut w);
        }
        _ => w.write_list(&tx.outputs),
    }

    w.write_u32(tx.lock_time);
    w.write_u32(hash_type);
    w.into_inner()
}

/// Per-transaction BIP143 midstate, shared by every input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SighashCache {
    pub hash_prevouts: HashId,
    pub hash_sequence: HashId,
    pub hash_outputs: HashId,
}

impl SighashCache {
    pub fn new(tx: &Transaction) -> Self {
        let mut prevouts = Writer::new();
        let mut sequences = Writer::new();
        for input in &tx.inputs {
            input.prevout.encode(&mut prevouts);
            sequences.write_u32(input.sequence);
        }
        let mut outputs = Writer::new();
        for output in &tx.outputs {
            output.encode(&mut outputs);
        }
        SighashCache {
            hash_prevouts: double_sha256(prevouts.as_slice()),
            hash_sequence: double_sha256(sequences.as_slice()),
            hash_outputs: double_sha256(outputs.as_slice()),
        }
    }
}

/// WitnessV0Sighash: 𝒯𝒳 × ℕ × 𝒮𝒞 × ℤ × ℕ → ℍ
///
/// sha256d of version ‖ hashPrevouts ‖ hashSequence ‖ outpoint ‖ scriptCode ‖
/// amount ‖ sequence ‖ hashOutputs ‖ lockTime ‖ hashType, where:
/// - hashPrevouts is zero under ANYONECANPAY
/// - hashSequence is zero under ANYONECANPAY, NONE or SINGLE
/// - hashOutputs covers all outputs, only the matching one for SINGLE, or is zero
pub fn witness_v0_sighash(
    tx: &Transaction,
    cache: &SighashCache,
    input_index: usize,
    script_code: &[u8],
    amount: Amount,
    hash_type: u32,
) -> HashId {
    let base = base_type(hash_type);
    let anyone_can_pay = hash_type & SIGHASH_ANYONECANPAY != 0;

    let hash_prevouts = if anyone_can_pay { HashId::ZERO } else { cache.hash_prevouts };
    let hash_sequence = if anyone_can_pay || base == SIGHASH_SINGLE || base == SIGHASH_NONE {
        HashId::ZERO
    } else {
        cache.hash_sequence
    };
    let hash_outputs = if base != SIGHASH_SINGLE && base != SIGHASH_NONE {
        cache.hash_outputs
    } else if base == SIGHASH_SINGLE && input_index < tx.outputs.len() {
        let mut w = Writer::new();
        tx.outputs[input_index].encode(&mut w);
        double_sha256(w.as_slice())
    } else {
        HashId::ZERO
    };

    let input = &tx.inputs[input_index];
    let mut w = Writer::with_capacity(156 + script_code.len());
    w.write_i32(tx.version);
    w.write_hash(&hash_prevouts);
    w.write_hash(&hash_sequence);
    input.prevout.encode(&mut w);
    w.write_var_bytes(script_code);
    w.write_i64(amount);
    w.write_u32(input.sequence);
    w.write_hash(&hash_outputs);
    w.write_u32(tx.lock_time);
    w.write_u32(hash_type);
    double_sha256(w.as_slice())
}
