//! Error types for consensus validation

use crate::encode::CodecError;
use crate::types::HashId;
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Transaction validation failed: {0}")]
    TransactionValidation(String),

    #[error("Block validation failed: {0}")]
    BlockValidation(String),

    #[error("Script execution failed: {0}")]
    ScriptExecution(String),

    #[error("Signature verification failed on input {input}: {reason}")]
    SigVerify { input: usize, reason: String },

    #[error("Unsupported script on input {input}: {reason}")]
    UnsupportedScript { input: usize, reason: String },

    #[error("Missing previous output for input {0}")]
    MissingPrevout(usize),

    #[error("Invalid proof of work: {0}")]
    InvalidProofOfWork(String),

    #[error("Economic validation failed: {0}")]
    EconomicValidation(String),

    #[error("Block {hash} does not link to best block {tip}")]
    DoesNotLink { hash: HashId, tip: HashId },

    #[error("Serialization error: {0}")]
    Serialization(#[from] CodecError),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ConsensusError {
    /// True for failures caused by a bad signature rather than a malformed script
    pub fn is_sig_verify(&self) -> bool {
        matches!(self, ConsensusError::SigVerify { .. })
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Lock a mutex, recovering the guard if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
