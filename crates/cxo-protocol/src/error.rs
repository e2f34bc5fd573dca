use thiserror::Error;

/// Errors from framing and decoding peer messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame's tag byte disagrees with the message it carries.
    #[error("frame tag {tag} does not match payload kind {payload}")]
    TagMismatch { tag: u8, payload: u8 },

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge { size: usize, max: usize },

    #[error("bad frame: {0}")]
    Framing(String),

    #[error("peer speaks protocol {remote}, this node speaks {local}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;
