use cxo_crypto::PubKey;
use cxo_registry::RegistryError;
use cxo_store::StoreError;
use cxo_types::Hash;
use thiserror::Error;

/// Errors from the object graph, the Container and Packs.
#[derive(Debug, Error)]
pub enum ObjectError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The Root signature does not verify against its feed key.
    #[error("invalid signature on root {feed:?}/{seq}")]
    InvalidSignature { feed: PubKey, seq: u64 },

    /// A Root older than the latest accepted one.
    #[error("stale root {feed:?}/{seq}: latest is {latest}")]
    StaleRoot { feed: PubKey, seq: u64, latest: u64 },

    /// Same sequence as an accepted Root, different content.
    #[error("fork at {feed:?}/{seq}")]
    Fork { feed: PubKey, seq: u64 },

    #[error("feed {0:?} is not tracked")]
    FeedNotFound(PubKey),

    #[error("root {feed:?}/{seq} not found")]
    RootNotFound { feed: PubKey, seq: u64 },

    /// Mutation of a Pack opened without the feed's secret key.
    #[error("pack is view-only")]
    ViewOnly,

    #[error("secret key does not own feed {0:?}")]
    WrongKey(PubKey),

    /// Bytes arrived that no retained object or Root references.
    #[error("object {0} is not wanted")]
    Unwanted(Hash),

    #[error("object {0} is already stored")]
    AlreadyHave(Hash),

    #[error("bytes do not hash to {0}")]
    HashMismatch(Hash),

    #[error("malformed root object {0}")]
    MalformedRoot(Hash),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ObjectError {
    /// Returns `true` for errors that mean the remote side misbehaved.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            ObjectError::InvalidSignature { .. }
                | ObjectError::StaleRoot { .. }
                | ObjectError::Fork { .. }
                | ObjectError::HashMismatch(_)
        )
    }
}

/// Result alias for object graph operations.
pub type ObjectResult<T> = Result<T, ObjectError>;
