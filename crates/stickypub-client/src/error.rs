//! Error types for stickypub-client

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// The error taxonomy a caller needs to distinguish:
/// validation and signature failures are the caller's fault and never
/// retried; transport/concurrency failures are retried internally and only
/// surfaced once retries are exhausted; catastrophic failure means the
/// operation gave up after repeated CAS conflicts and the topic's
/// coordinator was marked `FAILED`.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("validation error: {0}")]
    Validation(#[from] stickypub_core::Error),

    #[error("dht error: {0}")]
    Dht(#[from] stickypub_dht::DhtError),

    #[error("catastrophic failure on topic {topic} after {attempts} attempts")]
    Catastrophic { topic: String, attempts: u32 },

    #[error("not subscribed to topic {0}")]
    NotSubscribed(String),

    #[error("already subscribed to topic {0}")]
    AlreadySubscribed(String),
}
