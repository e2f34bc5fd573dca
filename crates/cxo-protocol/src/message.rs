use cxo_crypto::PubKey;
use cxo_skyobject::Root;
use cxo_types::Hash;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;
/// Default cap on one frame's payload.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// All message kinds of the replication protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Msg {
    // Handshake and liveness.
    Hello { version: u32 },
    Accept,
    Reject { reason: String },
    Ping,
    Pong,

    // Subscriptions.
    Subscribe { feed: PubKey },
    Unsubscribe { feed: PubKey },
    AcceptSubscription { feed: PubKey },
    RejectSubscription { feed: PubKey },
    RequestListOfFeeds,
    ListOfFeeds { feeds: Vec<PubKey> },
    NonPublicServer,

    // Replication.
    /// Announces a new Root of a subscribed feed.
    Root { root: Root },
    /// The receiver of a Root has filled or dropped it.
    RootDone { feed: PubKey, seq: u64 },
    Request { hash: Hash },
    Data { hash: Hash, bytes: Vec<u8> },
    DontHave { hash: Hash },
}

impl Msg {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Hello { .. } => 1,
            Self::Accept => 2,
            Self::Reject { .. } => 3,
            Self::Ping => 4,
            Self::Pong => 5,
            Self::Subscribe { .. } => 10,
            Self::Unsubscribe { .. } => 11,
            Self::AcceptSubscription { .. } => 12,
            Self::RejectSubscription { .. } => 13,
            Self::RequestListOfFeeds => 14,
            Self::ListOfFeeds { .. } => 15,
            Self::NonPublicServer => 16,
            Self::Root { .. } => 20,
            Self::RootDone { .. } => 21,
            Self::Request { .. } => 22,
            Self::Data { .. } => 23,
            Self::DontHave { .. } => 24,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::Accept => "Accept",
            Self::Reject { .. } => "Reject",
            Self::Ping => "Ping",
            Self::Pong => "Pong",
            Self::Subscribe { .. } => "Subscribe",
            Self::Unsubscribe { .. } => "Unsubscribe",
            Self::AcceptSubscription { .. } => "AcceptSubscription",
            Self::RejectSubscription { .. } => "RejectSubscription",
            Self::RequestListOfFeeds => "RequestListOfFeeds",
            Self::ListOfFeeds { .. } => "ListOfFeeds",
            Self::NonPublicServer => "NonPublicServer",
            Self::Root { .. } => "Root",
            Self::RootDone { .. } => "RootDone",
            Self::Request { .. } => "Request",
            Self::Data { .. } => "Data",
            Self::DontHave { .. } => "DontHave",
        }
    }
}
