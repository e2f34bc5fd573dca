//! Index trees behind [`Refs`](crate::Refs).
//!
//! A non-empty sequence is stored as a tree of nodes, each encoded as the
//! values `[U32 degree, U32 depth, U32 length, List(Ref..)]`. Leaves
//! (depth 0) list element hashes; inner nodes list child nodes of depth
//! `depth - 1`. Every node holds at most `degree` entries and the tree has
//! the smallest depth whose capacity fits the sequence, so the same
//! sequence always produces the same root hash.

use cxo_types::Hash;

use crate::codec::{decode_values, encode_values};
use crate::error::{RegistryError, RegistryResult};
use crate::registry::Loader;
use crate::value::{Ref, Value};

/// Build the tree for `leaves`, handing each encoded node to `emit`, which
/// returns its hash. Returns the root hash; blank for no leaves.
pub fn build_tree(
    leaves: &[Hash],
    degree: u32,
    emit: &mut dyn FnMut(Vec<u8>) -> Hash,
) -> RegistryResult<Hash> {
    if leaves.is_empty() {
        return Ok(Hash::blank());
    }
    let degree = degree.max(2);
    let mut depth = 0u32;
    let mut capacity = u64::from(degree);
    while capacity < leaves.len() as u64 {
        depth += 1;
        capacity = capacity.saturating_mul(u64::from(degree));
    }
    build_node(leaves, degree, depth, emit)
}

fn build_node(
    leaves: &[Hash],
    degree: u32,
    depth: u32,
    emit: &mut dyn FnMut(Vec<u8>) -> Hash,
) -> RegistryResult<Hash> {
    let children: Vec<Value> = if depth == 0 {
        leaves.iter().map(|h| Value::Ref(Ref::from_hash(*h))).collect()
    } else {
        let span = (degree as usize).saturating_pow(depth);
        let mut out = Vec::new();
        for chunk in leaves.chunks(span) {
            out.push(Value::Ref(Ref::from_hash(build_node(chunk, degree, depth - 1, emit)?)));
        }
        out
    };
    let node = encode_values(&[
        Value::U32(degree),
        Value::U32(depth),
        Value::U32(leaves.len() as u32),
        Value::List(children),
    ])?;
    Ok(emit(node))
}

/// Parsed header and children of one node.
struct Node {
    depth: u32,
    length: u32,
    children: Vec<Hash>,
}

fn parse_node(hash: Hash, bytes: &[u8]) -> RegistryResult<Node> {
    let malformed = || RegistryError::Malformed(format!("refs node {}", hash.short_hex()));
    match decode_values(bytes)?.as_slice() {
        [Value::U32(_degree), Value::U32(depth), Value::U32(length), Value::List(items)] => {
            let children = items
                .iter()
                .map(|v| match v {
                    Value::Ref(r) => Ok(r.hash()),
                    _ => Err(malformed()),
                })
                .collect::<RegistryResult<Vec<_>>>()?;
            Ok(Node {
                depth: *depth,
                length: *length,
                children,
            })
        }
        _ => Err(malformed()),
    }
}

/// Read back the element hashes of the tree rooted at `root`.
pub fn read_tree(root: Hash, loader: &dyn Loader) -> RegistryResult<Vec<Hash>> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    let mut expected = None;
    while let Some(hash) = stack.pop() {
        let node = parse_node(hash, &loader.load_bytes(&hash)?)?;
        expected.get_or_insert(node.length);
        if node.depth == 0 {
            out.extend(node.children);
        } else {
            // Reverse so the leftmost child is visited first.
            stack.extend(node.children.into_iter().rev());
        }
    }
    if expected != Some(out.len() as u32) {
        return Err(RegistryError::Malformed(format!(
            "refs tree {} declares {:?} items, holds {}",
            root.short_hex(),
            expected,
            out.len()
        )));
    }
    Ok(out)
}

/// Element count of the tree rooted at `root`, from the root header alone.
pub fn tree_len(root: Hash, loader: &dyn Loader) -> RegistryResult<usize> {
    if root.is_blank() {
        return Ok(0);
    }
    Ok(parse_node(root, &loader.load_bytes(&root)?)?.length as usize)
}

/// Position of the first element equal to `target`. Stops reading nodes
/// once it is found.
pub fn index_of(root: Hash, target: &Hash, loader: &dyn Loader) -> RegistryResult<Option<usize>> {
    if root.is_blank() {
        return Ok(None);
    }
    let mut seen = 0;
    let mut stack = vec![root];
    while let Some(hash) = stack.pop() {
        let node = parse_node(hash, &loader.load_bytes(&hash)?)?;
        if node.depth > 0 {
            stack.extend(node.children.into_iter().rev());
            continue;
        }
        if let Some(pos) = node.children.iter().position(|h| h == target) {
            return Ok(Some(seen + pos));
        }
        seen += node.children.len();
    }
    Ok(None)
}
