//! Typed Merkle object graph for CXO.
//!
//! A feed is identified by a [`PubKey`](cxo_crypto::PubKey). Its owner edits
//! the feed's object tree through a [`Pack`] and publishes each version as a
//! signed [`Root`]. The [`Container`] keeps the Root history of every tracked
//! feed on top of one shared refcounted content store, answers fill-state
//! queries for replication, and reclaims objects when old Roots are pruned.
//!
//! # Reference counting
//!
//! The refcount of a stored object is the number of edges pointing at it
//! from stored objects plus the number of retained Roots whose top it is.
//! Edges are counted once when an object enters the store and released once
//! when it leaves, so shared subtrees stay alive exactly as long as one
//! retained Root reaches them. Edges to objects that have not arrived yet
//! are counted as *pending* and handed over on arrival.

pub mod config;
pub mod container;
pub mod error;
pub mod event;
pub mod gc;
mod graph;
pub mod inspect;
pub mod pack;
mod persist;
pub mod root;
pub mod walk;

pub use config::ContainerConfig;
pub use container::{Container, ContainerStat};
pub use error::{ObjectError, ObjectResult};
pub use event::ContainerEvent;
pub use gc::PruneReport;
pub use pack::Pack;
pub use root::{FillState, Root};
pub use walk::Walk;
