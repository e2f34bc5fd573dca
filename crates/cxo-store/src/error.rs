use cxo_types::Hash;

/// Errors from content store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested key is not present.
    #[error("object not found: {0}")]
    NotFound(Hash),

    /// The value does not hash to the key it was stored under.
    #[error("hash mismatch: key {key}, computed {computed}")]
    HashMismatch { key: Hash, computed: Hash },

    /// A decrement would take a refcount below zero.
    #[error("refcount underflow for {0}")]
    RefcountUnderflow(Hash),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
