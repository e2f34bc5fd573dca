use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use cxo_types::Hash;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{RegistryError, RegistryResult};
use crate::object::Object;
use crate::refs;
use crate::registry::{Loader, Registry};
use crate::schema::{Schema, SchemaRef};

/// Encoded objects produced by a save, keyed by their hash.
pub type Batch = HashMap<Hash, Vec<u8>>;

/// A field value. The variant tag is part of the encoding.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Str(String),
    Bytes(Vec<u8>),
    List(#[serde(deserialize_with = "crate::codec::deserialize_list")] Vec<Value>),
    Ref(Ref),
    Refs(Refs),
    Dynamic(Dynamic),
}

impl Value {
    /// Short name of the variant, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Ref(_) => "ref",
            Value::Refs(_) => "refs",
            Value::Dynamic(_) => "dynamic",
        }
    }

    /// Graph edges held directly by this value (blank references excluded).
    pub fn edges(&self, out: &mut Vec<Hash>) {
        match self {
            Value::Ref(r) if !r.hash.is_blank() => out.push(r.hash),
            Value::Refs(rs) if !rs.hash.is_blank() => out.push(rs.hash),
            Value::Dynamic(d) if !d.object.hash.is_blank() => out.push(d.object.hash),
            Value::List(items) => items.iter().for_each(|v| v.edges(out)),
            _ => {}
        }
    }

    pub fn seal(&mut self, sealer: &mut Sealer<'_>) -> RegistryResult<bool> {
        match self {
            Value::Ref(r) => r.seal(sealer),
            Value::Refs(rs) => rs.seal(sealer),
            Value::Dynamic(d) => d.seal(sealer),
            Value::List(items) => {
                let mut changed = false;
                for item in items {
                    changed |= item.seal(sealer)?;
                }
                Ok(changed)
            }
            _ => Ok(false),
        }
    }

    pub(crate) fn is_sealed(&self) -> bool {
        match self {
            Value::Ref(r) => !r.dirty,
            Value::Refs(rs) => !rs.dirty,
            Value::Dynamic(d) => !d.object.dirty,
            Value::List(items) => items.iter().all(Value::is_sealed),
            _ => true,
        }
    }
}

macro_rules! value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::$variant(v)
            }
        })*
    };
}

value_from!(
    bool => Bool, u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    String => Str, Vec<u8> => Bytes,
    Ref => Ref, Refs => Refs, Dynamic => Dynamic,
);

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

/// State threaded through a save: turns dirty handles into hashes.
pub struct Sealer<'a> {
    registry: &'a Registry,
    degree: u32,
    batch: &'a mut Batch,
}

impl<'a> Sealer<'a> {
    /// `degree` is the fan-out of [`Refs`] index trees.
    pub fn new(registry: &'a Registry, degree: u32, batch: &'a mut Batch) -> Self {
        Self {
            registry,
            degree: degree.max(2),
            batch,
        }
    }

    fn emit(&mut self, bytes: Vec<u8>) -> Hash {
        let hash = Hash::sum(&bytes);
        self.batch.insert(hash, bytes);
        hash
    }
}

// ---------------------------------------------------------------------------
// Ref
// ---------------------------------------------------------------------------

/// Zero-or-one reference to an object of a known schema.
///
/// Encodes as the target hash only. The target is decoded on first access
/// and kept; changing it marks the handle dirty until the next save seals
/// it into a new hash.
#[derive(Clone, Default)]
pub struct Ref {
    hash: Hash,
    schema: Option<String>,
    target: Option<Box<Object>>,
    dirty: bool,
}

impl Ref {
    pub fn blank() -> Self {
        Self::default()
    }

    /// A clean handle to an existing object.
    pub fn from_hash(hash: Hash) -> Self {
        Self {
            hash,
            ..Self::default()
        }
    }

    /// A dirty handle to a new object.
    pub fn to(object: Object) -> Self {
        Self {
            hash: Hash::blank(),
            schema: Some(object.schema().name.clone()),
            target: Some(Box::new(object)),
            dirty: true,
        }
    }

    pub(crate) fn typed(mut self, schema: &str) -> Self {
        self.schema = Some(schema.to_string());
        self
    }

    pub(crate) fn set_schema_name(&mut self, schema: &str) {
        self.schema = Some(schema.to_string());
    }

    /// Hash of the target as of the last seal. Blank for an empty reference.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn is_blank(&self) -> bool {
        self.hash.is_blank() && self.target.is_none()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Name of the schema the target must have, when known.
    pub fn schema_name(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// The target if it has already been loaded or set.
    pub fn target(&self) -> Option<&Object> {
        self.target.as_deref()
    }

    /// Point at `object`, replacing the current target.
    pub fn set(&mut self, object: Object) -> RegistryResult<()> {
        if let Some(expected) = &self.schema {
            if object.schema().name != *expected {
                return Err(RegistryError::TypeMismatch {
                    field: "ref".into(),
                    expected: expected.clone(),
                    actual: object.schema().name.clone(),
                });
            }
        }
        self.target = Some(Box::new(object));
        self.dirty = true;
        Ok(())
    }

    /// Make this an empty reference.
    pub fn clear(&mut self) {
        self.hash = Hash::blank();
        self.target = None;
        self.dirty = false;
    }

    /// Load and return the target. `None` for a blank reference.
    pub fn load(&mut self, loader: &dyn Loader) -> RegistryResult<Option<&Object>> {
        self.ensure_loaded(loader)?;
        Ok(self.target.as_deref())
    }

    /// Load the target for editing. Marks the handle dirty.
    pub fn load_mut(&mut self, loader: &dyn Loader) -> RegistryResult<Option<&mut Object>> {
        self.ensure_loaded(loader)?;
        if self.target.is_some() {
            self.dirty = true;
        }
        Ok(self.target.as_deref_mut())
    }

    fn ensure_loaded(&mut self, loader: &dyn Loader) -> RegistryResult<()> {
        if self.target.is_some() || self.hash.is_blank() {
            return Ok(());
        }
        let name = self
            .schema
            .as_deref()
            .ok_or(RegistryError::UntypedRef(self.hash))?;
        let schema = loader.registry().by_name(name)?;
        self.load_as(schema, loader)
    }

    pub(crate) fn load_as(&mut self, schema: Arc<Schema>, loader: &dyn Loader) -> RegistryResult<()> {
        if self.target.is_some() || self.hash.is_blank() {
            return Ok(());
        }
        let bytes = loader.load_bytes(&self.hash)?;
        let object = loader.registry().decode_as(schema, &bytes)?;
        self.target = Some(Box::new(object));
        Ok(())
    }

    /// Encode the target if it or anything below it changed.
    /// Returns `true` if the hash changed.
    pub fn seal(&mut self, sealer: &mut Sealer<'_>) -> RegistryResult<bool> {
        let Some(target) = self.target.as_deref_mut() else {
            return Ok(false);
        };
        let below = target.seal(sealer)?;
        if !(self.dirty || below) {
            return Ok(false);
        }
        let bytes = sealer.registry.encode(target)?;
        let hash = sealer.emit(bytes);
        self.dirty = false;
        let changed = hash != self.hash;
        self.hash = hash;
        Ok(changed)
    }
}

impl PartialEq for Ref {
    /// References compare by sealed hash.
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.dirty == other.dirty
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ref({}", self.hash.short_hex())?;
        if self.dirty {
            write!(f, ", dirty")?;
        }
        if self.target.is_some() {
            write!(f, ", loaded")?;
        }
        write!(f, ")")
    }
}

impl Serialize for Ref {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.dirty {
            return Err(serde::ser::Error::custom("unsealed reference"));
        }
        self.hash.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Ref {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Hash::deserialize(deserializer).map(Ref::from_hash)
    }
}

// ---------------------------------------------------------------------------
// Refs
// ---------------------------------------------------------------------------

/// Ordered sequence of references to same-schema objects.
///
/// Encodes as the hash of the root of an index tree (see [`refs`]); an
/// empty sequence encodes as the blank hash. Items are read from the tree
/// on first access.
#[derive(Clone, Default)]
pub struct Refs {
    hash: Hash,
    schema: Option<String>,
    items: Option<Vec<Ref>>,
    dirty: bool,
}

impl Refs {
    /// An empty, loaded sequence of `schema` objects.
    pub fn new(schema: &str) -> Self {
        Self {
            hash: Hash::blank(),
            schema: Some(schema.to_string()),
            items: Some(Vec::new()),
            dirty: false,
        }
    }

    pub fn from_hash(hash: Hash) -> Self {
        Self {
            hash,
            ..Self::default()
        }
    }

    pub(crate) fn set_schema_name(&mut self, schema: &str) {
        self.schema = Some(schema.to_string());
        if let Some(items) = &mut self.items {
            for item in items {
                item.set_schema_name(schema);
            }
        }
    }

    /// Hash of the index tree root as of the last seal.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn schema_name(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    /// Items, if already loaded.
    pub fn items(&self) -> Option<&[Ref]> {
        self.items.as_deref()
    }

    fn ensure_loaded(&mut self, loader: &dyn Loader) -> RegistryResult<&mut Vec<Ref>> {
        if self.items.is_none() {
            let hashes = if self.hash.is_blank() {
                Vec::new()
            } else {
                refs::read_tree(self.hash, loader)?
            };
            let schema = self.schema.clone();
            let items = hashes
                .into_iter()
                .map(|h| {
                    let mut r = Ref::from_hash(h);
                    r.schema = schema.clone();
                    r
                })
                .collect();
            self.items = Some(items);
        }
        Ok(self.items.get_or_insert_with(Vec::new))
    }

    /// Number of items. Unloaded items are counted from the index root
    /// without reading the rest of the tree.
    pub fn len(&self, loader: &dyn Loader) -> RegistryResult<usize> {
        match &self.items {
            Some(items) => Ok(items.len()),
            None => refs::tree_len(self.hash, loader),
        }
    }

    pub fn is_empty(&self, loader: &dyn Loader) -> RegistryResult<bool> {
        Ok(self.len(loader)? == 0)
    }

    /// Position of the first item referencing `hash`.
    pub fn index_of_hash(&self, hash: &Hash, loader: &dyn Loader) -> RegistryResult<Option<usize>> {
        match &self.items {
            Some(items) => Ok(items.iter().position(|r| r.hash() == *hash)),
            None => refs::index_of(self.hash, hash, loader),
        }
    }

    /// Element hashes in order.
    pub fn hashes(&mut self, loader: &dyn Loader) -> RegistryResult<Vec<Hash>> {
        Ok(self.ensure_loaded(loader)?.iter().map(Ref::hash).collect())
    }

    /// Reference at `index`.
    pub fn get(&mut self, index: usize, loader: &dyn Loader) -> RegistryResult<&mut Ref> {
        let items = self.ensure_loaded(loader)?;
        let len = items.len();
        items
            .get_mut(index)
            .ok_or(RegistryError::OutOfRange { index, len })
    }

    /// Append an object.
    pub fn push(&mut self, object: Object, loader: &dyn Loader) -> RegistryResult<()> {
        self.check_schema(&object)?;
        self.ensure_loaded(loader)?.push(Ref::to(object));
        self.dirty = true;
        Ok(())
    }

    /// Replace the object at `index`.
    pub fn set(&mut self, index: usize, object: Object, loader: &dyn Loader) -> RegistryResult<()> {
        self.check_schema(&object)?;
        *self.get(index, loader)? = Ref::to(object);
        self.dirty = true;
        Ok(())
    }

    /// Remove and return the reference at `index`.
    pub fn remove(&mut self, index: usize, loader: &dyn Loader) -> RegistryResult<Ref> {
        let items = self.ensure_loaded(loader)?;
        if index >= items.len() {
            return Err(RegistryError::OutOfRange {
                index,
                len: items.len(),
            });
        }
        let removed = items.remove(index);
        self.dirty = true;
        Ok(removed)
    }

    /// Drop every item.
    pub fn clear(&mut self) {
        self.items = Some(Vec::new());
        self.dirty = true;
    }

    fn check_schema(&self, object: &Object) -> RegistryResult<()> {
        match &self.schema {
            Some(expected) if object.schema().name != *expected => {
                Err(RegistryError::TypeMismatch {
                    field: "refs".into(),
                    expected: expected.clone(),
                    actual: object.schema().name.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    pub fn seal(&mut self, sealer: &mut Sealer<'_>) -> RegistryResult<bool> {
        let Some(items) = self.items.as_mut() else {
            return Ok(false);
        };
        let mut below = false;
        for item in items.iter_mut() {
            below |= item.seal(sealer)?;
        }
        if !(self.dirty || below) {
            return Ok(false);
        }
        let leaves: Vec<Hash> = items.iter().map(Ref::hash).collect();
        let degree = sealer.degree;
        let hash = refs::build_tree(&leaves, degree, &mut |bytes| sealer.emit(bytes))?;
        self.dirty = false;
        let changed = hash != self.hash;
        self.hash = hash;
        Ok(changed)
    }
}

impl PartialEq for Refs {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.dirty == other.dirty
    }
}

impl fmt::Debug for Refs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Refs({}", self.hash.short_hex())?;
        if let Some(items) = &self.items {
            write!(f, ", len={}", items.len())?;
        }
        if self.dirty {
            write!(f, ", dirty")?;
        }
        write!(f, ")")
    }
}

impl Serialize for Refs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.dirty {
            return Err(serde::ser::Error::custom("unsealed references"));
        }
        self.hash.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Refs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Hash::deserialize(deserializer).map(Refs::from_hash)
    }
}

// ---------------------------------------------------------------------------
// Dynamic
// ---------------------------------------------------------------------------

/// Reference to an object of any registered schema: `(schema, object)`.
///
/// Resolving it is a two-step lookup, the schema in the registry and then
/// the object in the store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dynamic {
    schema: SchemaRef,
    object: Ref,
}

impl Dynamic {
    pub fn blank() -> Self {
        Self::default()
    }

    /// A dirty handle to a new object.
    pub fn new(object: Object) -> Self {
        Self {
            schema: object.schema().reference(),
            object: Ref::to(object),
        }
    }

    /// A clean handle to an existing object.
    pub fn from_parts(schema: SchemaRef, hash: Hash) -> Self {
        Self {
            schema,
            object: Ref::from_hash(hash),
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.schema
    }

    pub fn hash(&self) -> Hash {
        self.object.hash()
    }

    pub fn is_blank(&self) -> bool {
        self.object.is_blank()
    }

    pub fn is_dirty(&self) -> bool {
        self.object.is_dirty()
    }

    /// The object if already loaded or set.
    pub fn target(&self) -> Option<&Object> {
        self.object.target()
    }

    /// Point at a new object of any schema.
    pub fn set(&mut self, object: Object) {
        *self = Self::new(object);
    }

    pub fn load(&mut self, loader: &dyn Loader) -> RegistryResult<Option<&Object>> {
        self.resolve(loader)?;
        Ok(self.object.target())
    }

    /// Load the object for editing. Marks the handle dirty.
    pub fn load_mut(&mut self, loader: &dyn Loader) -> RegistryResult<Option<&mut Object>> {
        self.resolve(loader)?;
        if self.object.target.is_some() {
            self.object.dirty = true;
        }
        Ok(self.object.target.as_deref_mut())
    }

    fn resolve(&mut self, loader: &dyn Loader) -> RegistryResult<()> {
        if self.object.target.is_some() || self.object.hash.is_blank() {
            return Ok(());
        }
        let schema = loader.registry().get(&self.schema)?;
        self.object.set_schema_name(&schema.name);
        self.object.load_as(schema, loader)
    }

    pub fn seal(&mut self, sealer: &mut Sealer<'_>) -> RegistryResult<bool> {
        self.object.seal(sealer)
    }
}
