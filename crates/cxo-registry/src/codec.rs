//! Encoding of value sequences.
//!
//! Every stored object, index tree node and Root top is a bincode-encoded
//! `Vec<Value>`. Because values carry their own tags, [`references`] can
//! list an object's outgoing edges from its bytes alone, which is what lets
//! replication and refcounting proceed before a schema is known.
//!
//! Lists may nest at most [`MAX_LIST_DEPTH`] deep. Encoding refuses deeper
//! values and decoding fails on them, so bytes from a peer can never drive
//! the decoder into unbounded recursion.

use std::cell::Cell;

use cxo_types::Hash;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

use crate::error::{RegistryError, RegistryResult};
use crate::value::Value;

/// Deepest allowed nesting of [`Value::List`].
pub const MAX_LIST_DEPTH: usize = 32;

thread_local! {
    static LIST_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Holds one level of list nesting for the current decode.
struct DepthGuard;

impl DepthGuard {
    fn enter() -> Option<Self> {
        LIST_DEPTH.with(|depth| {
            let next = depth.get() + 1;
            if next > MAX_LIST_DEPTH {
                return None;
            }
            depth.set(next);
            Some(DepthGuard)
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        LIST_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

pub(crate) fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let _level = DepthGuard::enter()
        .ok_or_else(|| D::Error::custom(format!("lists nested deeper than {MAX_LIST_DEPTH}")))?;
    Vec::<Value>::deserialize(deserializer)
}

/// Deepest list nesting in `values`, without recursing.
fn list_depth(values: &[Value]) -> usize {
    let mut deepest = 0;
    let mut stack: Vec<(&Value, usize)> = values.iter().map(|v| (v, 0)).collect();
    while let Some((value, depth)) = stack.pop() {
        if let Value::List(items) = value {
            deepest = deepest.max(depth + 1);
            stack.extend(items.iter().map(|v| (v, depth + 1)));
        }
    }
    deepest
}

/// Encode a value sequence. Fails on unsealed handles and on lists nested
/// deeper than [`MAX_LIST_DEPTH`].
pub fn encode_values(values: &[Value]) -> RegistryResult<Vec<u8>> {
    let depth = list_depth(values);
    if depth > MAX_LIST_DEPTH {
        return Err(RegistryError::TooDeep {
            depth,
            max: MAX_LIST_DEPTH,
        });
    }
    bincode::serialize(values).map_err(|e| RegistryError::Serialization(e.to_string()))
}

/// Decode a value sequence.
pub fn decode_values(bytes: &[u8]) -> RegistryResult<Vec<Value>> {
    bincode::deserialize(bytes).map_err(|e| RegistryError::Malformed(e.to_string()))
}

/// Outgoing edges of encoded bytes, in encounter order, duplicates kept.
///
/// Bytes that are not a value sequence, lists nested too deep included,
/// have no edges.
pub fn references(bytes: &[u8]) -> Vec<Hash> {
    let mut out = Vec::new();
    if let Ok(values) = decode_values(bytes) {
        for value in &values {
            value.edges(&mut out);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRef;
    use crate::value::{Dynamic, Ref, Refs};

    #[test]
    fn references_are_read_without_schema() {
        let a = Hash::sum(b"a");
        let b = Hash::sum(b"b");
        let c = Hash::sum(b"c");
        let bytes = encode_values(&[
            Value::from("title"),
            Value::Ref(Ref::from_hash(a)),
            Value::Refs(Refs::from_hash(b)),
            Value::Dynamic(Dynamic::from_parts(SchemaRef::blank(), c)),
            Value::Ref(Ref::from_hash(a)),
        ])
        .unwrap();
        assert_eq!(references(&bytes), vec![a, b, c, a]);
    }

    #[test]
    fn opaque_bytes_have_no_edges() {
        assert!(references(b"\xff\xff\xff").is_empty());
        assert!(references(b"").is_empty());
    }

    // -----------------------------------------------------------------------
    // Nesting limit
    // -----------------------------------------------------------------------

    fn nested(depth: usize) -> Value {
        let mut value = Value::Ref(Ref::from_hash(Hash::sum(b"leaf")));
        for _ in 0..depth {
            value = Value::List(vec![value]);
        }
        value
    }

    #[test]
    fn deepest_allowed_list_round_trips() {
        let bytes = encode_values(&[nested(MAX_LIST_DEPTH)]).unwrap();
        assert_eq!(decode_values(&bytes).unwrap(), vec![nested(MAX_LIST_DEPTH)]);
        assert_eq!(references(&bytes), vec![Hash::sum(b"leaf")]);
    }

    #[test]
    fn encode_refuses_deeper_lists() {
        let err = encode_values(&[nested(MAX_LIST_DEPTH + 1)]).unwrap_err();
        assert_eq!(
            err,
            RegistryError::TooDeep {
                depth: MAX_LIST_DEPTH + 1,
                max: MAX_LIST_DEPTH
            }
        );
    }

    #[test]
    fn hostile_nesting_is_malformed_not_a_crash() {
        // One value, then 200 000 single-element lists: tag 11 is List.
        let mut bytes = 1u64.to_le_bytes().to_vec();
        for _ in 0..200_000 {
            bytes.extend_from_slice(&11u32.to_le_bytes());
            bytes.extend_from_slice(&1u64.to_le_bytes());
        }
        assert!(matches!(decode_values(&bytes), Err(RegistryError::Malformed(_))));
        assert!(references(&bytes).is_empty());
        // The depth counter unwinds after a failed decode.
        let ok = encode_values(&[nested(MAX_LIST_DEPTH)]).unwrap();
        assert_eq!(references(&ok).len(), 1);
    }

    #[test]
    fn encoding_is_deterministic() {
        let values = vec![Value::U64(7), Value::from("x"), Value::Bytes(vec![1, 2])];
        assert_eq!(encode_values(&values).unwrap(), encode_values(&values).unwrap());
        assert_eq!(decode_values(&encode_values(&values).unwrap()).unwrap(), values);
    }
}
