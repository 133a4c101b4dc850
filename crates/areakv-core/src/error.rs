//! Error types for areakv

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// areakv core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Stored or received hash does not match the entry content
    #[error("hash mismatch: computed {computed} != carried {carried}")]
    HashMismatch { computed: String, carried: String },

    /// TTL is neither positive nor the infinity sentinel
    #[error("invalid ttl: {0}")]
    InvalidTtl(i64),
}
