use std::sync::Arc;

use crate::error::{RegistryError, RegistryResult};
use crate::schema::Schema;
use crate::value::{Ref, Refs, Sealer, Value};

/// A decoded instance of a [`Schema`]: one value per field, in field order.
#[derive(Clone, Debug, PartialEq)]
pub struct Object {
    schema: Arc<Schema>,
    values: Vec<Value>,
}

impl Object {
    /// A new object with every field at its zero value.
    pub fn new(schema: Arc<Schema>) -> Self {
        let values = schema.fields.iter().map(|f| f.kind.default_value()).collect();
        Self { schema, values }
    }

    /// Assemble from decoded values. The caller has checked them against
    /// the schema.
    pub(crate) fn from_parts(schema: Arc<Schema>, mut values: Vec<Value>) -> Self {
        for (field, value) in schema.fields.iter().zip(values.iter_mut()) {
            field.kind.annotate(value);
        }
        Self { schema, values }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Values in field order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        let (idx, _) = self.schema.field(field)?;
        self.values.get(idx)
    }

    /// Mutable access to a field. Reference fields are edited in place, so
    /// this is how nested handles are reached.
    pub fn get_mut(&mut self, field: &str) -> RegistryResult<&mut Value> {
        let (idx, _) = self.schema.field(field).ok_or_else(|| self.no_such(field))?;
        Ok(&mut self.values[idx])
    }

    /// Replace a field, checking its kind.
    pub fn set(&mut self, field: &str, value: impl Into<Value>) -> RegistryResult<()> {
        let (idx, desc) = self.schema.field(field).ok_or_else(|| self.no_such(field))?;
        let mut value = value.into();
        if !desc.kind.accepts(&value) {
            return Err(RegistryError::TypeMismatch {
                field: field.to_string(),
                expected: desc.kind.to_string(),
                actual: value.kind_name().to_string(),
            });
        }
        if let (Value::Ref(r), crate::schema::Kind::Ref(name)) = (&value, &desc.kind) {
            if let Some(target) = r.target() {
                if target.schema().name != *name {
                    return Err(RegistryError::TypeMismatch {
                        field: field.to_string(),
                        expected: desc.kind.to_string(),
                        actual: format!("ref<{}>", target.schema().name),
                    });
                }
            }
        }
        desc.kind.annotate(&mut value);
        self.values[idx] = value;
        Ok(())
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> RegistryResult<Self> {
        self.set(field, value)?;
        Ok(self)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        match self.get(field)? {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Any unsigned integer field, widened.
    pub fn get_u64(&self, field: &str) -> Option<u64> {
        match self.get(field)? {
            Value::U8(v) => Some(u64::from(*v)),
            Value::U16(v) => Some(u64::from(*v)),
            Value::U32(v) => Some(u64::from(*v)),
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn ref_mut(&mut self, field: &str) -> RegistryResult<&mut Ref> {
        let kind = self.kind_of(field)?;
        match self.get_mut(field)? {
            Value::Ref(r) => Ok(r),
            other => Err(mismatch(field, kind, other)),
        }
    }

    pub fn refs_mut(&mut self, field: &str) -> RegistryResult<&mut Refs> {
        let kind = self.kind_of(field)?;
        match self.get_mut(field)? {
            Value::Refs(rs) => Ok(rs),
            other => Err(mismatch(field, kind, other)),
        }
    }

    /// Seal every handle below this object. Returns `true` if any of their
    /// hashes changed, which means this object must be re-encoded too.
    pub(crate) fn seal(&mut self, sealer: &mut Sealer<'_>) -> RegistryResult<bool> {
        let mut changed = false;
        for value in &mut self.values {
            changed |= value.seal(sealer)?;
        }
        Ok(changed)
    }

    fn kind_of(&self, field: &str) -> RegistryResult<String> {
        self.schema
            .field(field)
            .map(|(_, f)| f.kind.to_string())
            .ok_or_else(|| self.no_such(field))
    }

    fn no_such(&self, field: &str) -> RegistryError {
        RegistryError::NoSuchField {
            schema: self.schema.name.clone(),
            field: field.to_string(),
        }
    }
}

fn mismatch(field: &str, expected: String, actual: &Value) -> RegistryError {
    RegistryError::TypeMismatch {
        field: field.to_string(),
        expected,
        actual: actual.kind_name().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Kind;

    fn user() -> Arc<Schema> {
        Arc::new(
            Schema::builder("User")
                .field("name", Kind::Str)
                .field("age", Kind::U16)
                .field("best", Kind::Ref("User".into()))
                .build(),
        )
    }

    #[test]
    fn new_object_has_zero_values() {
        let obj = Object::new(user());
        assert_eq!(obj.get_str("name"), Some(""));
        assert_eq!(obj.get_u64("age"), Some(0));
        assert!(matches!(obj.get("best"), Some(Value::Ref(r)) if r.is_blank()));
    }

    #[test]
    fn set_checks_kind() {
        let mut obj = Object::new(user());
        obj.set("name", "alice").unwrap();
        assert_eq!(obj.get_str("name"), Some("alice"));
        let err = obj.set("age", "old").unwrap_err();
        assert!(matches!(err, RegistryError::TypeMismatch { .. }));
    }

    #[test]
    fn unknown_field() {
        let mut obj = Object::new(user());
        assert!(matches!(
            obj.set("email", "x"),
            Err(RegistryError::NoSuchField { .. })
        ));
    }

    #[test]
    fn ref_field_checks_target_schema() {
        let other = Arc::new(Schema::builder("Other").build());
        let mut obj = Object::new(user());
        let err = obj.set("best", Ref::to(Object::new(other))).unwrap_err();
        assert!(matches!(err, RegistryError::TypeMismatch { .. }));
        obj.set("best", Ref::to(Object::new(user()))).unwrap();
        assert_eq!(obj.ref_mut("best").unwrap().schema_name(), Some("User"));
    }

    #[test]
    fn accessor_of_wrong_kind() {
        let mut obj = Object::new(user());
        assert!(matches!(
            obj.refs_mut("best"),
            Err(RegistryError::TypeMismatch { .. })
        ));
    }
}
