use cxo_crypto::PubKey;

use crate::root::Root;

/// Lifecycle notifications published by a [`Container`](crate::Container).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContainerEvent {
    FeedAdded(PubKey),
    FeedRemoved(PubKey),
    /// A Root from elsewhere was accepted.
    RootReceived(Root),
    /// A local Pack saved a new Root.
    RootSaved(Root),
    /// A Root's whole tree is present.
    RootFilled(Root),
    /// A Root was pruned.
    RootDropped { feed: PubKey, seq: u64 },
}
