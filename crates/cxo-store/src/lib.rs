//! Refcounted content-addressable data store (CXDS).
//!
//! The store is an abstract `hash -> (value, refcount)` map. It knows nothing
//! about schemas or trees: callers decide when references are created and
//! released, the store only keeps the counters linearizable per key.
//!
//! # Backends
//!
//! - [`MemoryCxds`] keeps everything in a `HashMap` behind a lock.
//! - [`DiskCxds`] keeps the same table in memory and journals every mutation
//!   to a CRC-framed [`Journal`] that is replayed on open.

pub mod disk;
pub mod error;
pub mod journal;
pub mod memory;
pub mod traits;

pub use disk::DiskCxds;
pub use error::{StoreError, StoreResult};
pub use journal::Journal;
pub use memory::MemoryCxds;
pub use traits::{Cxds, Stat};
