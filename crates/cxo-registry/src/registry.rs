use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use cxo_types::Hash;
use tracing::debug;

use crate::codec::{decode_values, encode_values};
use crate::error::{RegistryError, RegistryResult};
use crate::object::Object;
use crate::schema::{Schema, SchemaRef};

/// Read access to encoded objects, for lazy resolution of handles.
pub trait Loader {
    fn registry(&self) -> &Registry;

    /// Bytes stored under `key`. `RegistryError::Missing` when absent.
    fn load_bytes(&self, key: &Hash) -> RegistryResult<Vec<u8>>;
}

#[derive(Default)]
struct Tables {
    by_name: HashMap<String, Arc<Schema>>,
    by_ref: HashMap<SchemaRef, Arc<Schema>>,
}

/// Name to descriptor table used to encode and decode objects.
///
/// Registration is explicit and idempotent: registering the same
/// descriptor twice is fine, registering a different layout under a taken
/// name is an error. Peers register the same application types, so their
/// schema references agree without exchanging schemas.
#[derive(Default)]
pub struct Registry {
    tables: RwLock<Tables>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor and return its reference.
    pub fn register(&self, schema: Schema) -> RegistryResult<SchemaRef> {
        let mut seen = HashSet::new();
        for field in &schema.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(RegistryError::DuplicateField {
                    schema: schema.name.clone(),
                    field: field.name.clone(),
                });
            }
        }

        let mut tables = self.tables.write().expect("lock poisoned");
        if let Some(existing) = tables.by_name.get(&schema.name) {
            if **existing != schema {
                return Err(RegistryError::SchemaConflict(schema.name));
            }
            return Ok(existing.reference());
        }
        let reference = schema.reference();
        debug!(schema = %schema.name, reference = %reference.hash().short_hex(), "schema registered");
        let schema = Arc::new(schema);
        tables.by_name.insert(schema.name.clone(), Arc::clone(&schema));
        tables.by_ref.insert(reference, schema);
        Ok(reference)
    }

    pub fn get(&self, reference: &SchemaRef) -> RegistryResult<Arc<Schema>> {
        self.tables
            .read()
            .expect("lock poisoned")
            .by_ref
            .get(reference)
            .cloned()
            .ok_or(RegistryError::UnknownSchema(*reference))
    }

    pub fn by_name(&self, name: &str) -> RegistryResult<Arc<Schema>> {
        self.tables
            .read()
            .expect("lock poisoned")
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownSchemaName(name.to_string()))
    }

    pub fn contains(&self, reference: &SchemaRef) -> bool {
        self.tables
            .read()
            .expect("lock poisoned")
            .by_ref
            .contains_key(reference)
    }

    /// All registered schemas, sorted by name.
    pub fn schemas(&self) -> Vec<Arc<Schema>> {
        let tables = self.tables.read().expect("lock poisoned");
        let mut all: Vec<_> = tables.by_name.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// A fresh object of the named schema.
    pub fn object(&self, name: &str) -> RegistryResult<Object> {
        Ok(Object::new(self.by_name(name)?))
    }

    /// Encode an object. Its schema must be registered and every handle it
    /// holds must be sealed.
    pub fn encode(&self, object: &Object) -> RegistryResult<Vec<u8>> {
        let schema = object.schema();
        match self.by_name(&schema.name) {
            Ok(registered) if registered == *schema => {}
            Ok(_) => return Err(RegistryError::SchemaConflict(schema.name.clone())),
            Err(_) => return Err(RegistryError::UnregisteredSchema(schema.name.clone())),
        }
        for (field, value) in schema.fields.iter().zip(object.values()) {
            if !field.kind.accepts(value) {
                return Err(RegistryError::TypeMismatch {
                    field: field.name.clone(),
                    expected: field.kind.to_string(),
                    actual: value.kind_name().to_string(),
                });
            }
            if !value.is_sealed() {
                return Err(RegistryError::Unsealed(field.name.clone()));
            }
        }
        encode_values(object.values())
    }

    /// Decode bytes as an object of the referenced schema.
    pub fn decode(&self, reference: &SchemaRef, bytes: &[u8]) -> RegistryResult<Object> {
        let schema = self.get(reference)?;
        self.decode_as(schema, bytes)
    }

    /// Decode bytes as an object of `schema`.
    pub fn decode_as(&self, schema: Arc<Schema>, bytes: &[u8]) -> RegistryResult<Object> {
        let values = decode_values(bytes)?;
        if values.len() != schema.fields.len() {
            return Err(RegistryError::Malformed(format!(
                "{} expects {} fields, got {}",
                schema.name,
                schema.fields.len(),
                values.len()
            )));
        }
        for (field, value) in schema.fields.iter().zip(&values) {
            if !field.kind.accepts(value) {
                return Err(RegistryError::TypeMismatch {
                    field: field.name.clone(),
                    expected: field.kind.to_string(),
                    actual: value.kind_name().to_string(),
                });
            }
        }
        Ok(Object::from_parts(schema, values))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.tables.read().expect("lock poisoned").by_name.len();
        f.debug_struct("Registry").field("schemas", &count).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::schema::Kind;
    use crate::value::{Batch, Dynamic, Ref, Refs, Sealer, Value};

    struct MapLoader<'a> {
        registry: &'a Registry,
        batch: &'a Batch,
    }

    impl Loader for MapLoader<'_> {
        fn registry(&self) -> &Registry {
            self.registry
        }

        fn load_bytes(&self, key: &Hash) -> RegistryResult<Vec<u8>> {
            self.batch.get(key).cloned().ok_or(RegistryError::Missing(*key))
        }
    }

    fn post() -> Schema {
        Schema::builder("Post")
            .field("title", Kind::Str)
            .field("author", Kind::Ref("User".into()))
            .field("replies", Kind::Refs("Post".into()))
            .build()
    }

    fn user() -> Schema {
        Schema::builder("User").field("name", Kind::Str).build()
    }

    fn registry() -> Registry {
        let reg = Registry::new();
        reg.register(user()).unwrap();
        reg.register(post()).unwrap();
        reg
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    #[test]
    fn register_is_idempotent() {
        let reg = Registry::new();
        let a = reg.register(user()).unwrap();
        let b = reg.register(user()).unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.schemas().len(), 1);
    }

    #[test]
    fn conflicting_layout_is_rejected() {
        let reg = Registry::new();
        reg.register(user()).unwrap();
        let other = Schema::builder("User").field("name", Kind::Bytes).build();
        assert_eq!(
            reg.register(other),
            Err(RegistryError::SchemaConflict("User".into()))
        );
    }

    #[test]
    fn duplicate_field_is_rejected() {
        let reg = Registry::new();
        let bad = Schema::builder("X").field("a", Kind::U8).field("a", Kind::U8).build();
        assert!(matches!(
            reg.register(bad),
            Err(RegistryError::DuplicateField { .. })
        ));
    }

    #[test]
    fn unknown_schema_is_recoverable() {
        let reg = Registry::new();
        let bytes = encode_values(&[Value::from("x")]).unwrap();
        let reference = user().reference();
        assert_eq!(
            reg.decode(&reference, &bytes).unwrap_err(),
            RegistryError::UnknownSchema(reference)
        );
        reg.register(user()).unwrap();
        let obj = reg.decode(&reference, &bytes).unwrap();
        assert_eq!(obj.get_str("name"), Some("x"));
    }

    // -----------------------------------------------------------------------
    // Encode / decode
    // -----------------------------------------------------------------------

    #[test]
    fn encode_requires_registration() {
        let reg = Registry::new();
        let obj = Object::new(Arc::new(user()));
        assert_eq!(
            reg.encode(&obj),
            Err(RegistryError::UnregisteredSchema("User".into()))
        );
    }

    #[test]
    fn encode_rejects_unsealed_refs() {
        let reg = registry();
        let author = reg.object("User").unwrap().with("name", "ann").unwrap();
        let post = reg.object("Post").unwrap().with("author", Ref::to(author)).unwrap();
        assert_eq!(
            reg.encode(&post),
            Err(RegistryError::Unsealed("author".into()))
        );
    }

    #[test]
    fn encode_rejects_overly_nested_lists() {
        let depth = crate::codec::MAX_LIST_DEPTH + 1;
        let mut kind = Kind::U8;
        let mut value = Value::U8(0);
        for _ in 0..depth {
            kind = Kind::List(Box::new(kind));
            value = Value::List(vec![value]);
        }
        let reg = Registry::new();
        reg.register(Schema::builder("Deep").field("v", kind).build())
            .unwrap();
        let obj = reg.object("Deep").unwrap().with("v", value).unwrap();
        assert!(matches!(reg.encode(&obj), Err(RegistryError::TooDeep { .. })));
    }

    #[test]
    fn decode_rejects_wrong_shape() {
        let reg = registry();
        let bytes = encode_values(&[Value::U8(1)]).unwrap();
        assert!(matches!(
            reg.decode(&user().reference(), &bytes),
            Err(RegistryError::TypeMismatch { .. })
        ));
        let bytes = encode_values(&[]).unwrap();
        assert!(matches!(
            reg.decode(&user().reference(), &bytes),
            Err(RegistryError::Malformed(_))
        ));
    }

    #[test]
    fn seal_then_resolve_nested_graph() {
        let reg = registry();
        let ann = reg.object("User").unwrap().with("name", "ann").unwrap();
        let mut root = reg
            .object("Post")
            .unwrap()
            .with("title", "hello")
            .unwrap()
            .with("author", Ref::to(ann))
            .unwrap();
        let mut batch: Batch = HashMap::new();
        for i in 0..5 {
            let reply = reg.object("Post").unwrap().with("title", format!("re {i}")).unwrap();
            let loader = MapLoader { registry: &reg, batch: &batch };
            root.refs_mut("replies").unwrap().push(reply, &loader).unwrap();
        }

        let mut top = Dynamic::new(root);
        let mut sealer = Sealer::new(&reg, 2, &mut batch);
        assert!(top.seal(&mut sealer).unwrap());
        assert!(!top.is_dirty());
        // post, author, five replies, six index nodes at degree 2
        assert_eq!(batch.len(), 1 + 1 + 5 + 6);

        // Reload from bytes only.
        let mut fresh = Dynamic::from_parts(top.schema(), top.hash());
        let loader = MapLoader { registry: &reg, batch: &batch };
        let post = fresh.load_mut(&loader).unwrap().unwrap();
        assert_eq!(post.get_str("title"), Some("hello"));
        let author = post.ref_mut("author").unwrap().load(&loader).unwrap().unwrap();
        assert_eq!(author.get_str("name"), Some("ann"));
        let replies = post.refs_mut("replies").unwrap();
        // Counted from the index root before any item is loaded.
        assert_eq!(replies.len(&loader).unwrap(), 5);
        let unloaded = Refs::from_hash(replies.hash());
        let third = replies.get(2, &loader).unwrap().load(&loader).unwrap().unwrap();
        assert_eq!(third.get_str("title"), Some("re 2"));
        let third = replies.get(2, &loader).unwrap().hash();
        assert_eq!(unloaded.index_of_hash(&third, &loader).unwrap(), Some(2));
        assert_eq!(replies.index_of_hash(&third, &loader).unwrap(), Some(2));
    }

    #[test]
    fn untouched_subtree_is_not_reencoded() {
        let reg = registry();
        let ann = reg.object("User").unwrap().with("name", "ann").unwrap();
        let post = reg.object("Post").unwrap().with("author", Ref::to(ann)).unwrap();
        let mut top = Dynamic::new(post);
        let mut batch = Batch::new();
        top.seal(&mut Sealer::new(&reg, 4, &mut batch)).unwrap();
        let first = top.hash();

        let mut again = Batch::new();
        assert!(!top.seal(&mut Sealer::new(&reg, 4, &mut again)).unwrap());
        assert!(again.is_empty());
        assert_eq!(top.hash(), first);
    }
}
