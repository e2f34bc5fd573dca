//! Foundation types for CXO.
//!
//! Every other CXO crate depends on `cxo-types` for [`Hash`], the universal
//! identifier of stored objects, Root snapshots and schemas.

pub mod error;
pub mod hash;

pub use error::TypeError;
pub use hash::Hash;
