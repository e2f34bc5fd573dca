use std::fmt;

use cxo_types::Hash;
use serde::{Deserialize, Serialize};

use crate::value::{Dynamic, Ref, Refs, Value};

/// Kind tag of a field.
///
/// Reference kinds name the schema of their target, so two peers that build
/// the same descriptor independently produce byte-identical schemas.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    Str,
    Bytes,
    List(Box<Kind>),
    /// Zero or one object of the named schema.
    Ref(String),
    /// Ordered sequence of objects of the named schema.
    Refs(String),
    /// Object of any registered schema, tagged with its [`SchemaRef`].
    Dynamic,
}

impl Kind {
    /// Returns `true` if `value` fits this kind. Lists are checked deeply.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (Kind::Bool, Value::Bool(_))
            | (Kind::U8, Value::U8(_))
            | (Kind::U16, Value::U16(_))
            | (Kind::U32, Value::U32(_))
            | (Kind::U64, Value::U64(_))
            | (Kind::I8, Value::I8(_))
            | (Kind::I16, Value::I16(_))
            | (Kind::I32, Value::I32(_))
            | (Kind::I64, Value::I64(_))
            | (Kind::Str, Value::Str(_))
            | (Kind::Bytes, Value::Bytes(_))
            | (Kind::Ref(_), Value::Ref(_))
            | (Kind::Refs(_), Value::Refs(_))
            | (Kind::Dynamic, Value::Dynamic(_)) => true,
            (Kind::List(elem), Value::List(items)) => items.iter().all(|v| elem.accepts(v)),
            _ => false,
        }
    }

    /// The zero value of this kind.
    pub fn default_value(&self) -> Value {
        match self {
            Kind::Bool => Value::Bool(false),
            Kind::U8 => Value::U8(0),
            Kind::U16 => Value::U16(0),
            Kind::U32 => Value::U32(0),
            Kind::U64 => Value::U64(0),
            Kind::I8 => Value::I8(0),
            Kind::I16 => Value::I16(0),
            Kind::I32 => Value::I32(0),
            Kind::I64 => Value::I64(0),
            Kind::Str => Value::Str(String::new()),
            Kind::Bytes => Value::Bytes(Vec::new()),
            Kind::List(_) => Value::List(Vec::new()),
            Kind::Ref(name) => Value::Ref(Ref::blank().typed(name)),
            Kind::Refs(name) => Value::Refs(Refs::new(name)),
            Kind::Dynamic => Value::Dynamic(Dynamic::blank()),
        }
    }

    /// Stamp the target schema of reference kinds onto a matching value.
    pub(crate) fn annotate(&self, value: &mut Value) {
        match (self, value) {
            (Kind::Ref(name), Value::Ref(r)) => r.set_schema_name(name),
            (Kind::Refs(name), Value::Refs(rs)) => rs.set_schema_name(name),
            (Kind::List(elem), Value::List(items)) => {
                for item in items {
                    elem.annotate(item);
                }
            }
            _ => {}
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Bool => write!(f, "bool"),
            Kind::U8 => write!(f, "u8"),
            Kind::U16 => write!(f, "u16"),
            Kind::U32 => write!(f, "u32"),
            Kind::U64 => write!(f, "u64"),
            Kind::I8 => write!(f, "i8"),
            Kind::I16 => write!(f, "i16"),
            Kind::I32 => write!(f, "i32"),
            Kind::I64 => write!(f, "i64"),
            Kind::Str => write!(f, "str"),
            Kind::Bytes => write!(f, "bytes"),
            Kind::List(elem) => write!(f, "list<{elem}>"),
            Kind::Ref(name) => write!(f, "ref<{name}>"),
            Kind::Refs(name) => write!(f, "refs<{name}>"),
            Kind::Dynamic => write!(f, "dynamic"),
        }
    }
}

/// A named field of a schema.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub kind: Kind,
}

/// Structural descriptor of an object type: a name and ordered fields.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub fields: Vec<Field>,
}

impl Schema {
    /// Start building a schema.
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            schema: Schema {
                name: name.into(),
                fields: Vec::new(),
            },
        }
    }

    /// Content reference of this descriptor: the hash of its encoding.
    pub fn reference(&self) -> SchemaRef {
        // Plain structs of strings and enums always serialize.
        let bytes = bincode::serialize(self).unwrap_or_default();
        SchemaRef(Hash::sum(&bytes))
    }

    /// Position and descriptor of a field.
    pub fn field(&self, name: &str) -> Option<(usize, &Field)> {
        self.fields.iter().enumerate().find(|(_, f)| f.name == name)
    }
}

/// Builder for [`Schema`].
#[derive(Debug)]
pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    pub fn field(mut self, name: impl Into<String>, kind: Kind) -> Self {
        self.schema.fields.push(Field {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn build(self) -> Schema {
        self.schema
    }
}

/// Hash of an encoded [`Schema`]; how a [`Dynamic`] names its type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SchemaRef(Hash);

impl SchemaRef {
    pub const fn blank() -> Self {
        Self(Hash::blank())
    }

    pub fn is_blank(&self) -> bool {
        self.0.is_blank()
    }

    pub fn hash(&self) -> Hash {
        self.0
    }

    pub fn from_hash(hash: Hash) -> Self {
        Self(hash)
    }
}

impl fmt::Debug for SchemaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchemaRef({})", self.0.short_hex())
    }
}

impl fmt::Display for SchemaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> Schema {
        Schema::builder("User")
            .field("name", Kind::Str)
            .field("age", Kind::U32)
            .field("friends", Kind::Refs("User".into()))
            .build()
    }

    #[test]
    fn independent_builds_share_reference() {
        assert_eq!(user().reference(), user().reference());
        assert!(!user().reference().is_blank());
    }

    #[test]
    fn layout_changes_reference() {
        let other = Schema::builder("User")
            .field("age", Kind::U32)
            .field("name", Kind::Str)
            .field("friends", Kind::Refs("User".into()))
            .build();
        assert_ne!(user().reference(), other.reference());
    }

    #[test]
    fn field_lookup() {
        let s = user();
        let (idx, f) = s.field("age").unwrap();
        assert_eq!(idx, 1);
        assert_eq!(f.kind, Kind::U32);
        assert!(s.field("email").is_none());
    }

    #[test]
    fn kinds_accept_matching_values() {
        assert!(Kind::Str.accepts(&Value::from("x")));
        assert!(!Kind::Str.accepts(&Value::U32(1)));
        let list = Kind::List(Box::new(Kind::U8));
        assert!(list.accepts(&Value::List(vec![Value::U8(1), Value::U8(2)])));
        assert!(!list.accepts(&Value::List(vec![Value::U8(1), Value::U16(2)])));
    }

    #[test]
    fn default_values_fit_their_kind() {
        for kind in [
            Kind::Bool,
            Kind::I64,
            Kind::Bytes,
            Kind::List(Box::new(Kind::Str)),
            Kind::Ref("User".into()),
            Kind::Refs("User".into()),
            Kind::Dynamic,
        ] {
            assert!(kind.accepts(&kind.default_value()), "{kind}");
        }
    }

    #[test]
    fn kind_display() {
        assert_eq!(Kind::List(Box::new(Kind::Ref("A".into()))).to_string(), "list<ref<A>>");
    }
}
