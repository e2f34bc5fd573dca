use cxo_protocol::ProtocolError;
use cxo_skyobject::ObjectError;
use cxo_types::Hash;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("object error: {0}")]
    Object(#[from] ObjectError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Bytes delivered for a hash they do not hash to.
    #[error("data for {0} does not match its hash")]
    HashMismatch(Hash),

    /// The remote side broke the protocol.
    #[error("protocol violation: {0}")]
    Violation(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("rejected by peer: {0}")]
    Rejected(String),

    #[error("peer does not list its feeds")]
    NonPublic,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection closed")]
    Disconnected,

    #[error("no connection {0}")]
    ConnectionNotFound(Uuid),

    #[error("node is closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Returns `true` for errors caused by a misbehaving peer.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            SyncError::HashMismatch(_) | SyncError::Violation(_) => true,
            SyncError::Object(e) => e.is_protocol_violation(),
            _ => false,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
