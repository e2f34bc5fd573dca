//! Feed replication for CXO.
//!
//! A [`Node`] wraps a [`Container`](cxo_skyobject::Container) and keeps it
//! in sync with peers. Every connection runs as its own task that owns the
//! connection's subscriptions, fillers and in-flight requests; the only
//! shared state is the Container and a small table of which connection is
//! filling which Root.
//!
//! Filling a Root is a loop of `Request` and `Data` messages driven by a
//! Merkle walk: the walk lists what is missing, received objects reveal
//! their children, and a final walk confirms the tree is complete.
//! Requests are bounded per connection, retried on timeout, and handed to
//! another connection of the same feed when a peer cannot deliver.

pub mod config;
mod conn;
pub mod error;
mod filler;
pub mod node;
pub mod transport;

pub use config::NodeConfig;
pub use error::{SyncError, SyncResult};
pub use node::{ConnectionInfo, Node};
pub use transport::{local_pair, tcp_wire, Wire};
