//! Core data types shared by the codec, validation and networking layers

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Byte string type
pub type ByteString = Vec<u8>;

/// Amount in satoshis. Signed so that range checks can catch negative values.
pub type Amount = i64;

/// 256-bit hash identifier.
///
/// Bytes are kept in wire order. The textual form is the reversed byte
/// sequence in hex, so a block hash prints with its leading zeros first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HashId(pub [u8; 32]);

impl HashId {
    /// All-zero hash: marks "no previous output" on a coinbase input
    pub const ZERO: HashId = HashId([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        HashId(bytes)
    }

    /// Build from a slice that must be exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(HashId(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; 32] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Parse the display form (byte-reversed hex)
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(HashId(bytes))
    }
}

impl fmt::Display for HashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        f.write_str(&hex::encode(reversed))
    }
}

impl fmt::Debug for HashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashId({})", self)
    }
}

impl FromStr for HashId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HashId::from_hex(s)
    }
}

impl From<[u8; 32]> for HashId {
    fn from(bytes: [u8; 32]) -> Self {
        HashId(bytes)
    }
}

impl AsRef<[u8]> for HashId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for HashId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HashId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        HashId::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// OutPoint: (transaction hash, output index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: HashId,
    pub index: u32,
}

impl OutPoint {
    /// Outpoint carried by a coinbase input
    pub const NULL: OutPoint = OutPoint { hash: HashId::ZERO, index: u32::MAX };

    pub fn new(hash: HashId, index: u32) -> Self {
        OutPoint { hash, index }
    }
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: u32,
    /// Witness stack, empty when the input carries no witness
    #[serde(default)]
    pub witness: Vec<ByteString>,
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: Amount,
    pub script_pubkey: ByteString,
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

/// Block header: the 80 bytes hashed for proof of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: HashId,
    pub merkle_root: HashId,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

/// Block: header plus ordered transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}
