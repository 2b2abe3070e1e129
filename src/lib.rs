//! # Consensus-Node
//!
//! Core of a peer-to-peer full node for a Bitcoin-like network.
//!
//! The crate covers the parts where a bug costs funds or consensus:
//! the wire codec and message framing, the transaction model and its
//! canonical serialization, script classification and signature
//! verification (legacy and BIP143 sighash), proof of work on 256-bit
//! targets, and the per-peer connection state machine feeding a worker pool.
//!
//! ## Architecture
//!
//! Bytes flow leaf-first through the layers:
//! - `encode`, `message`, `network`: framing and typed payloads
//! - `transaction`, `block`, `merkle`: data model and structural checks
//! - `script`, `interpreter`, `sighash`, `verify`: script templates and signatures
//! - `uint256`, `pow`, `economic`: targets, retargeting and subsidy
//! - `peer`, `dispatch`, `chain`: connections, workers and the single best-chain lock
//! - `store`, `cache`, `config`, `node`: collaborators and the process surface
//!
//! ## Usage
//!
//! ```rust
//! use consensus_node::ConsensusNode;
//! use consensus_node::types::*;
//!
//! let node = ConsensusNode::regtest();
//! let genesis = node.params().genesis;
//! assert!(node.check_proof_of_work(&genesis));
//! ```

pub mod types;
pub mod constants;
pub mod error;
pub mod encode;
pub mod hashes;
pub mod uint256;
pub mod transaction;
pub mod block;
pub mod merkle;
pub mod economic;
pub mod pow;
pub mod opcodes;
pub mod script;
pub mod interpreter;
pub mod sighash;
pub mod verify;
pub mod message;
pub mod network;
pub mod peer;
pub mod dispatch;
pub mod chain;
pub mod store;
pub mod cache;
pub mod config;
pub mod node;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use error::{ConsensusError, Result};
pub use config::{NetworkParams, NodeConfig};
pub use network::NetworkMessage;
pub use verify::ScriptTemplate;

use encode::CodecError;
use message::RawMessage;

/// Stateless consensus operations bound to one network's parameters
///
/// # Examples
///
/// ```
/// use consensus_node::ConsensusNode;
/// use consensus_node::types::*;
///
/// let node = ConsensusNode::mainnet();
///
/// // A spend of one output paying to OP_1
/// let tx = Transaction {
///     version: 1,
///     inputs: vec![TransactionInput {
///         prevout: OutPoint::new(HashId([1; 32]), 0),
///         script_sig: vec![0x51],
///         sequence: 0xffffffff,
///         witness: vec![],
///     }],
///     outputs: vec![TransactionOutput {
///         value: 5000000000,
///         script_pubkey: vec![0x51],
///     }],
///     lock_time: 0,
/// };
///
/// assert!(node.check_transaction(&tx).is_ok());
/// ```
pub struct ConsensusNode {
    params: NetworkParams,
}

impl ConsensusNode {
    pub fn new(params: NetworkParams) -> Self {
        ConsensusNode { params }
    }

    pub fn mainnet() -> Self {
        Self::new(NetworkParams::mainnet())
    }

    pub fn testnet() -> Self {
        Self::new(NetworkParams::testnet())
    }

    pub fn regtest() -> Self {
        Self::new(NetworkParams::regtest())
    }

    pub fn params(&self) -> &NetworkParams {
        &self.params
    }

    /// Decode a transaction from its wire bytes
    ///
    /// # Examples
    ///
    /// ```
    /// use consensus_node::ConsensusNode;
    ///
    /// let node = ConsensusNode::mainnet();
    /// assert!(node.decode_transaction(&[0x01, 0x00]).is_err());
    /// ```
    pub fn decode_transaction(&self, bytes: &[u8]) -> Result<Transaction> {
        Ok(encode::deserialize(bytes)?)
    }

    /// Structural transaction checks
    pub fn check_transaction(&self, tx: &Transaction) -> Result<()> {
        transaction::check_transaction(tx)
    }

    /// Verify every input's scripts and signatures against the outputs it spends
    pub fn verify_transaction(&self, tx: &Transaction, prevouts: &[TransactionOutput]) -> Result<()> {
        verify::verify_tx(tx, prevouts)
    }

    /// Classify the spend of `input` against `script_pubkey`
    ///
    /// # Examples
    ///
    /// ```
    /// use consensus_node::{ConsensusNode, ScriptTemplate};
    /// use consensus_node::types::*;
    ///
    /// let node = ConsensusNode::mainnet();
    /// let input = TransactionInput {
    ///     prevout: OutPoint::new(HashId([1; 32]), 0),
    ///     script_sig: vec![],
    ///     sequence: 0xffffffff,
    ///     witness: vec![],
    /// };
    /// // OP_RETURN outputs are skipped without signature checks
    /// let template = node.classify(&input, &[0x6a, 0x01, 0x00]);
    /// assert_eq!(template, ScriptTemplate::NullData);
    /// ```
    pub fn classify(&self, input: &TransactionInput, script_pubkey: &[u8]) -> ScriptTemplate {
        verify::classify(input, script_pubkey)
    }

    /// Context-free block checks, including proof of work
    pub fn check_block(&self, block: &Block) -> Result<()> {
        block::check_block(block, &self.params.pow_limit)
    }

    /// Check a header's hash against the target its bits encode
    pub fn check_proof_of_work(&self, header: &BlockHeader) -> bool {
        pow::check_proof_of_work(&header.block_hash(), header.bits, &self.params.pow_limit)
    }

    /// Retarget from the first and last timestamps of a window
    ///
    /// # Examples
    ///
    /// ```
    /// use consensus_node::ConsensusNode;
    ///
    /// let node = ConsensusNode::mainnet();
    /// // Blocks 201600 → 203615
    /// let bits = node.calculate_work_required(1349226660, 1348092851, 0x1a05db8b);
    /// assert_eq!(bits, 0x1a057e08);
    /// ```
    pub fn calculate_work_required(&self, last_time: u32, first_time: u32, prev_bits: u32) -> u32 {
        pow::calculate_work_required(
            last_time,
            first_time,
            prev_bits,
            self.params.pow_target_timespan,
            &self.params.pow_limit,
        )
    }

    /// Block subsidy at `height` under this network's halving interval
    ///
    /// # Examples
    ///
    /// ```
    /// use consensus_node::ConsensusNode;
    ///
    /// let node = ConsensusNode::mainnet();
    /// assert_eq!(node.get_block_subsidy(0), 5000000000);
    /// assert_eq!(node.get_block_subsidy(210000), 2500000000);
    /// ```
    pub fn get_block_subsidy(&self, height: u64) -> Amount {
        economic::get_block_subsidy(height, self.params.subsidy_halving_interval)
    }

    /// Frame a message for this network
    ///
    /// # Examples
    ///
    /// ```
    /// use consensus_node::{ConsensusNode, NetworkMessage};
    ///
    /// let node = ConsensusNode::mainnet();
    /// let frame = node.encode_message(&NetworkMessage::Ping(7)).unwrap();
    /// assert_eq!(frame.len(), 24 + 8);
    /// assert_eq!(node.decode_message(&frame).unwrap(), NetworkMessage::Ping(7));
    /// ```
    pub fn encode_message(&self, message: &NetworkMessage) -> Result<Vec<u8>> {
        Ok(message.to_raw().to_frame(self.params.magic)?)
    }

    /// Decode exactly one framed message
    pub fn decode_message(&self, frame: &[u8]) -> Result<NetworkMessage> {
        let mut reader = frame;
        let raw: RawMessage = message::read_message(&mut reader, self.params.magic)?;
        if !reader.is_empty() {
            return Err(CodecError::TrailingBytes(reader.len()).into());
        }
        Ok(NetworkMessage::from_raw(&raw)?)
    }
}

impl Default for ConsensusNode {
    fn default() -> Self {
        Self::mainnet()
    }
}
