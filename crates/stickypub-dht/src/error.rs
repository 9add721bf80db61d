//! Error types for stickypub-dht

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DhtError>;

/// Errors surfaced by a [`crate::client::DhtClient`] implementation or the
/// typed adapter built on top of it.
#[derive(Debug, Error)]
pub enum DhtError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("core error: {0}")]
    Core(#[from] stickypub_core::Error),

    #[error("compare-and-swap conflict on key {0}")]
    CasConflict(String),

    #[error("node unreachable: {0}")]
    NodeUnreachable(String),

    #[error("snapshot chain exceeded max depth ({0})")]
    ChainTooDeep(usize),
}
