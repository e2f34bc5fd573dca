use cxo_types::Hash;
use thiserror::Error;

use crate::schema::SchemaRef;

/// Errors from schema registration, encoding and decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No schema with this reference is known locally. Recoverable: the raw
    /// bytes can be kept until the schema is registered.
    #[error("unknown schema {0}")]
    UnknownSchema(SchemaRef),

    #[error("unknown schema name {0:?}")]
    UnknownSchemaName(String),

    /// An object was built from a schema that was never registered.
    #[error("schema {0:?} is not registered")]
    UnregisteredSchema(String),

    #[error("schema {0:?} is already registered with a different layout")]
    SchemaConflict(String),

    #[error("schema {schema:?} declares field {field:?} twice")]
    DuplicateField { schema: String, field: String },

    #[error("schema {schema:?} has no field {field:?}")]
    NoSuchField { schema: String, field: String },

    #[error("field {field:?} expects {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    /// A reference was encoded before its target was sealed.
    #[error("unsealed reference in {0:?}")]
    Unsealed(String),

    /// A reference without a known target schema cannot be loaded.
    #[error("reference {0} has no target schema")]
    UntypedRef(Hash),

    #[error("index {index} out of range (len {len})")]
    OutOfRange { index: usize, len: usize },

    /// Referenced bytes are not available locally.
    #[error("object {0} is not present")]
    Missing(Hash),

    #[error("lists nested {depth} deep, at most {max} allowed")]
    TooDeep { depth: usize, max: usize },

    #[error("malformed object: {0}")]
    Malformed(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;
