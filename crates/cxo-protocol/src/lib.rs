//! Wire protocol for CXO feed replication.
//!
//! Defines the message kinds exchanged between peers and the framing used
//! on byte streams. The protocol is symmetric: either side may subscribe,
//! announce Roots, request objects and answer requests.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::MsgCodec;
pub use error::{ProtocolError, ProtocolResult};
pub use message::{Msg, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
