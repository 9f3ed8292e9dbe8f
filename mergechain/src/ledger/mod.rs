//! The ledger: persistent chain storage behind a single writer.

mod cache;
mod chain;
pub mod keys;
mod store;
mod utxo;
mod worker;

pub use cache::CACHE_DEPTH;
pub use chain::{Ledger, MAX_DEFERRED_BLOCKS, TASK_QUEUE_CAPACITY};
pub use store::{LedgerDb, STORE_VERSION};
pub use utxo::{UtxoEntry, UtxoSet};
pub use worker::LedgerTask;

use thiserror::Error;

use crate::consensus::ValidationError;
use crate::error::ErrorKind;
use crate::hash::{short_hex, Hash256};
use crate::serialization::CodecError;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] lmdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupt record: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid block: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Block {} is not the current tip", short_hex(.0))]
    NotTip(Hash256),

    #[error("The genesis block cannot be rolled back")]
    RollbackGenesis,

    #[error("Unsupported ledger version {0}")]
    VersionMismatch(u32),

    #[error("Issuance counter of asset {} out of range", short_hex(.0))]
    IssuanceOutOfRange(Hash256),

    #[error("Stored genesis block belongs to another network")]
    GenesisMismatch,

    #[error("Ledger writer has stopped")]
    WorkerStopped,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::NotFound(_) => ErrorKind::NotFound,
            LedgerError::Invalid(e) => e.kind(),
            LedgerError::NotTip(_) | LedgerError::RollbackGenesis => ErrorKind::InvalidContext,
            _ => ErrorKind::StorageFailure,
        }
    }

    pub(crate) fn serialization(e: bincode::Error) -> Self {
        LedgerError::Serialization(e.to_string())
    }
}

/// Information about the current chain state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainState {
    /// Current block height
    pub height: u32,

    /// Hash of the tip block
    pub tip_hash: Hash256,

    /// Timestamp of the tip block
    pub tip_timestamp: u32,

    /// Compact target of the tip block
    pub tip_bits: u32,
}

/// What `save_block` did with a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Validated and queued for persistence
    Queued(Hash256),
    /// At or below the current height; ignored
    Stale,
    /// Above the next height; held until its parent persists
    Deferred,
}
