//! Schema registry and reference types for CXO object graphs.
//!
//! Objects are described by explicit [`Schema`] descriptors registered at
//! startup, not discovered by reflection. An object is encoded as the
//! sequence of its field [`Value`]s in schema order. Every value is tagged,
//! so the graph edges of an encoded object can be read back without knowing
//! its schema (see [`codec::references`]).
//!
//! # Key Types
//!
//! - [`Registry`]: name to descriptor table, encode and decode
//! - [`Schema`], [`Field`], [`Kind`], [`SchemaRef`]: structural descriptors
//! - [`Object`]: a decoded, editable instance of a schema
//! - [`Ref`], [`Refs`], [`Dynamic`]: hash handles into the content store,
//!   resolved lazily through a [`Loader`]

pub mod codec;
pub mod error;
pub mod object;
pub mod refs;
pub mod registry;
pub mod schema;
pub mod value;

pub use error::{RegistryError, RegistryResult};
pub use object::Object;
pub use registry::{Loader, Registry};
pub use schema::{Field, Kind, Schema, SchemaBuilder, SchemaRef};
pub use value::{Batch, Dynamic, Ref, Refs, Sealer, Value};
