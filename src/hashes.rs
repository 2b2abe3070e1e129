//! Hash primitives: SHA-256, double SHA-256, HASH160 and the message checksum

use crate::types::HashId;
use bitcoin_hashes::{sha256d, Hash as BitcoinHash, HashEngine};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// SHA256(data)
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Sha256::digest(data));
    out
}

/// SHA256(SHA256(data))
pub fn double_sha256(data: &[u8]) -> HashId {
    let mut hasher = sha256d::Hash::engine();
    hasher.input(data);
    let result = sha256d::Hash::from_engine(hasher);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    HashId(hash)
}

/// Double SHA256 over several parts without concatenating them first
pub fn double_sha256_parts(parts: &[&[u8]]) -> HashId {
    let mut hasher = sha256d::Hash::engine();
    for part in parts {
        hasher.input(part);
    }
    let result = sha256d::Hash::from_engine(hasher);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    HashId(hash)
}

/// RIPEMD160(data)
pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(data));
    out
}

/// RIPEMD160(SHA256(data))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    ripemd160(&sha256(data))
}

/// First four bytes of SHA256(SHA256(payload)), as carried in message headers
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = double_sha256(payload);
    let mut out = [0u8; 4];
    out.copy_from_slice(&hash.0[..4]);
    out
}
