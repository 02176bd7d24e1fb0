use cid::Cid;
use thiserror::Error;

/// Error type for all prolly tree operations.
#[derive(Error, Debug)]
pub enum ProllyError {
    #[error("block not found in store for cid: {0}")]
    NotFound(Cid),

    #[error("malformed block: {0}")]
    MalformedBlock(String),

    #[error("digest mismatch for block {cid}")]
    DigestMismatch { cid: Cid },

    #[error("bucket prefix does not match expectation: {0}")]
    PrefixMismatch(String),

    #[error("bucket level mismatch: expected {expected}, got {actual}")]
    LevelMismatch { expected: u32, actual: u32 },

    #[error("malformed tree: {0}")]
    MalformedTree(String),

    #[error("cursor is locked by a concurrent operation")]
    CursorLocked,

    #[error("invalid cursor move: {0}")]
    CursorInvalidMove(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("mutation terminated without finding a new root")]
    NoNewRoot,

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("invalid cid: {0}")]
    InvalidCid(String),

    #[error("storage operation failed: {0}")]
    Storage(String),
}

/// Result type alias for prolly tree operations.
pub type Result<T> = std::result::Result<T, ProllyError>;
