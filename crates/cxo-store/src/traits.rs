use cxo_types::Hash;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

/// Aggregate figures about a store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Number of entries.
    pub objects: usize,
    /// Total bytes of all values.
    pub volume: u64,
    /// Sum of all refcounts.
    pub refs: u64,
    /// Entries held at refcount 0 by a pin (or left over from one).
    pub parked: usize,
}

/// Refcounted content-addressable data store.
///
/// All implementations must satisfy these invariants:
/// - The key of an entry is the [`Hash`] of its value, so a value is never
///   overwritten: setting an existing key only bumps its refcount.
/// - Counter mutations on the same key are linearizable.
/// - An entry whose refcount reaches 0 is deleted, unless it is pinned. A
///   pinned entry is *parked* at refcount 0 and deleted on the last unpin.
/// - Refcounts saturate at `u32::MAX` and never wrap below zero.
pub trait Cxds: Send + Sync {
    /// Value and refcount of `key`, or `None` when absent.
    fn get(&self, key: &Hash) -> StoreResult<Option<(Vec<u8>, u32)>>;

    /// Insert `val` under `key` with refcount 1, or increment the existing
    /// entry. Returns the new refcount.
    ///
    /// Fails with `HashMismatch` when inserting a value that does not hash to
    /// `key`.
    fn set(&self, key: Hash, val: &[u8]) -> StoreResult<u32>;

    /// Increment an existing entry. Fails with `NotFound` when absent.
    fn inc(&self, key: &Hash) -> StoreResult<u32>;

    /// Decrement `key` and return the new refcount together with the value
    /// if this call deleted the entry.
    ///
    /// Decrementing an absent key is a no-op returning `(0, None)`.
    fn dec_get(&self, key: &Hash) -> StoreResult<(u32, Option<Vec<u8>>)>;

    /// Pin an entry so that it survives refcount 0. Returns `false` when the
    /// key is absent. Pins nest.
    fn pin(&self, key: &Hash) -> StoreResult<bool>;

    /// Drop one pin. Returns the value if this deleted a parked entry.
    fn unpin(&self, key: &Hash) -> StoreResult<Option<Vec<u8>>>;

    /// Delete `key` if it sits at refcount 0 with no pins. Returns the value
    /// if it was deleted.
    fn remove_orphan(&self, key: &Hash) -> StoreResult<Option<Vec<u8>>>;

    /// Visit every entry until `f` returns `false`.
    ///
    /// The store is locked for reading while iterating; `f` must not call
    /// back into the store.
    fn iterate(&self, f: &mut dyn FnMut(&Hash, &[u8], u32) -> bool) -> StoreResult<()>;

    /// Aggregate figures.
    fn stat(&self) -> StoreResult<Stat>;

    /// Hash `val` and [`set`](Self::set) it.
    fn add(&self, val: &[u8]) -> StoreResult<(Hash, u32)> {
        let key = Hash::sum(val);
        let rc = self.set(key, val)?;
        Ok((key, rc))
    }

    /// Decrement `key`, deleting it at 0. Returns the new refcount.
    fn dec(&self, key: &Hash) -> StoreResult<u32> {
        self.dec_get(key).map(|(rc, _)| rc)
    }

    /// Returns `true` if `key` is present (including parked entries).
    fn contains(&self, key: &Hash) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn multi_get(&self, keys: &[Hash]) -> StoreResult<Vec<Option<(Vec<u8>, u32)>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    fn multi_add(&self, vals: &[Vec<u8>]) -> StoreResult<Vec<(Hash, u32)>> {
        vals.iter().map(|v| self.add(v)).collect()
    }

    fn multi_inc(&self, keys: &[Hash]) -> StoreResult<Vec<u32>> {
        keys.iter().map(|k| self.inc(k)).collect()
    }

    fn multi_dec(&self, keys: &[Hash]) -> StoreResult<Vec<u32>> {
        keys.iter().map(|k| self.dec(k)).collect()
    }

    /// Flush and release backend resources.
    fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}
