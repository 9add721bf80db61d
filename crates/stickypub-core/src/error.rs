//! Error types for stickypub-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// stickypub-core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// A content-addressed ID did not match its computed hash
    #[error("hash mismatch: computed {computed} != transmitted {transmitted}")]
    HashMismatch { computed: String, transmitted: String },

    /// Signature failed to verify, or was absent where required
    #[error("invalid signature")]
    InvalidSignature,

    /// A signing or verifying key was malformed
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// A structural invariant was violated (see each type's `validate`)
    #[error("validation failed: {0}")]
    Validation(String),

    /// publishedAt was not <= expiresAt, or similar ordering violations
    #[error("invalid timestamp range: {0}")]
    InvalidTimeRange(String),
}
