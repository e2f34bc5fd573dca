//! Human-readable rendering of a Root's object tree.

use std::fmt::Write;

use cxo_registry::{Dynamic, Object, Ref, Refs, Value};
use cxo_types::Hash;

use crate::container::Container;
use crate::error::{ObjectError, ObjectResult};
use crate::root::Root;

const INDENT: &str = "  ";

impl Container {
    /// Render the tree of `root`: schema names, field values and nested
    /// references. Nodes that are missing or whose schema is not registered
    /// are shown by hash.
    pub fn inspect(&self, root: &Root) -> ObjectResult<String> {
        let mut out = String::new();
        let state = self
            .fill_state(&root.pub_key, root.seq)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "untracked".into());
        line(&mut out, 0, format_args!("{root} ({state}) {}", root.timestamp()));

        let Some(bytes) = self.get(&root.hash)? else {
            line(&mut out, 1, format_args!("{} (missing)", root.hash.short_hex()));
            return Ok(out);
        };
        let items = cxo_registry::codec::decode_values(&bytes)
            .map_err(|_| ObjectError::MalformedRoot(root.hash))?;
        for (i, item) in items.into_iter().enumerate() {
            match item {
                Value::Dynamic(d) => self.render_dynamic(&mut out, 1, &format!("[{i}]"), d),
                _ => return Err(ObjectError::MalformedRoot(root.hash)),
            }
        }
        Ok(out)
    }

    fn render_dynamic(&self, out: &mut String, depth: usize, label: &str, mut d: Dynamic) {
        if d.is_blank() {
            line(out, depth, format_args!("{label} nil"));
            return;
        }
        let hash = d.hash();
        match d.load(self) {
            Ok(Some(object)) => self.render_object(out, depth, label, hash, object),
            Ok(None) => line(out, depth, format_args!("{label} nil")),
            Err(e) => line(out, depth, format_args!("{label} {} ({e})", hash.short_hex())),
        }
    }

    fn render_ref(&self, out: &mut String, depth: usize, label: &str, mut r: Ref) {
        if r.is_blank() {
            line(out, depth, format_args!("{label} nil"));
            return;
        }
        let hash = r.hash();
        match r.load(self) {
            Ok(Some(object)) => self.render_object(out, depth, label, hash, object),
            Ok(None) => line(out, depth, format_args!("{label} nil")),
            Err(e) => line(out, depth, format_args!("{label} {} ({e})", hash.short_hex())),
        }
    }

    fn render_refs(&self, out: &mut String, depth: usize, label: &str, mut refs: Refs) {
        let hash = refs.hash();
        if hash.is_blank() {
            line(out, depth, format_args!("{label} []"));
            return;
        }
        let len = match refs.len(self) {
            Ok(len) => len,
            Err(e) => {
                line(out, depth, format_args!("{label} {} ({e})", hash.short_hex()));
                return;
            }
        };
        line(out, depth, format_args!("{label} [{len}]"));
        for i in 0..len {
            if let Ok(r) = refs.get(i, self) {
                let r = r.clone();
                self.render_ref(out, depth + 1, &format!("[{i}]"), r);
            }
        }
    }

    fn render_object(&self, out: &mut String, depth: usize, label: &str, hash: Hash, object: &Object) {
        let schema = object.schema().clone();
        line(
            out,
            depth,
            format_args!("{label} {} {}", schema.name, hash.short_hex()),
        );
        for (field, value) in schema.fields.iter().zip(object.values().iter().cloned()) {
            let name = &field.name;
            match value {
                Value::Ref(r) => self.render_ref(out, depth + 1, &format!("{name}:"), r),
                Value::Refs(r) => self.render_refs(out, depth + 1, &format!("{name}:"), r),
                Value::Dynamic(d) => self.render_dynamic(out, depth + 1, &format!("{name}:"), d),
                other => line(out, depth + 1, format_args!("{name}: {}", scalar(&other))),
            }
        }
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Bool(v) => v.to_string(),
        Value::U8(v) => v.to_string(),
        Value::U16(v) => v.to_string(),
        Value::U32(v) => v.to_string(),
        Value::U64(v) => v.to_string(),
        Value::I8(v) => v.to_string(),
        Value::I16(v) => v.to_string(),
        Value::I32(v) => v.to_string(),
        Value::I64(v) => v.to_string(),
        Value::Str(v) => format!("{v:?}"),
        Value::Bytes(v) => format!("0x{}", hex_prefix(v)),
        Value::List(items) => {
            let inner: Vec<String> = items.iter().map(scalar).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Ref(r) => r.hash().short_hex(),
        Value::Refs(r) => r.hash().short_hex(),
        Value::Dynamic(d) => d.hash().short_hex(),
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    let mut s: String = bytes.iter().take(16).map(|b| format!("{b:02x}")).collect();
    if bytes.len() > 16 {
        s.push_str("..");
    }
    s
}

fn line(out: &mut String, depth: usize, args: std::fmt::Arguments<'_>) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
    // Writing to a String cannot fail.
    let _ = out.write_fmt(args);
    out.push('\n');
}
