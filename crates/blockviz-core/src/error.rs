//! Error types for the chain integrity engine.
//!
//! A broken chain is not an error: it is represented by `is_valid = false`
//! flags. These types cover why a block fails validation, why a mining run
//! stopped, and which engine calls were rejected.

use thiserror::Error;

use crate::HexDigest;

/// Reason a block fails `validate::check_block`.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("genesis block must point at \"0\", found {found:?}")]
    GenesisLink { found: HexDigest },
    #[error("block {index} has no predecessor to link to")]
    MissingPredecessor { index: u64 },
    #[error("block {index} links to {found}, predecessor hash is {expected}")]
    BrokenLink {
        index: u64,
        expected: HexDigest,
        found: HexDigest,
    },
    #[error("block {index} stores hash {stored}, its fields hash to {computed}")]
    HashMismatch {
        index: u64,
        stored: HexDigest,
        computed: HexDigest,
    },
    #[error("block {index} hash does not have {difficulty} leading zeros")]
    DifficultyNotMet { index: u64, difficulty: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MineError {
    #[error("difficulty {difficulty} is longer than the hash and can never be met")]
    Unsatisfiable { difficulty: u32 },
    #[error("nonce space exhausted before difficulty {difficulty} was met")]
    Exhausted { difficulty: u32 },
    #[error("mining cancelled at nonce {nonce}")]
    Cancelled { nonce: u64 },
}

/// Engine calls that were rejected. State is left untouched in every case.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("no block at index {0}")]
    BlockNotFound(usize),
    #[error("block {0} is already being mined")]
    AlreadyMining(usize),
    #[error("block {0} is already mined")]
    AlreadyMined(usize),
    #[error("block {0} is not mining the submitted block")]
    StaleMining(usize),
    #[error("the genesis block cannot be moved or edited")]
    GenesisImmutable,
    #[error("index {index} is out of range for a chain of {len} blocks")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("mining requires a running tokio runtime")]
    NoRuntime,
    #[error("mining task for block {0} panicked or was aborted")]
    TaskFailed(usize),
    #[error(transparent)]
    Mine(#[from] MineError),
}
