use std::collections::HashMap;
use std::sync::RwLock;

use cxo_types::Hash;
use tracing::{trace, warn};

use crate::error::{StoreError, StoreResult};
use crate::traits::{Cxds, Stat};

/// A stored value with its counters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) val: Vec<u8>,
    pub(crate) rc: u32,
    pub(crate) pins: u32,
}

/// What a table operation did, so that a journaling backend can record it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Change {
    Insert,
    Inc,
    Dec,
    Del,
}

/// The refcount table shared by every backend.
#[derive(Default)]
pub(crate) struct Table {
    pub(crate) map: HashMap<Hash, Entry>,
}

impl Table {
    pub(crate) fn get(&self, key: &Hash) -> Option<(Vec<u8>, u32)> {
        self.map.get(key).map(|e| (e.val.clone(), e.rc))
    }

    pub(crate) fn set(&mut self, key: Hash, val: &[u8]) -> StoreResult<(u32, Change)> {
        if let Some(entry) = self.map.get_mut(&key) {
            return Ok((bump(&key, entry), Change::Inc));
        }
        let computed = Hash::sum(val);
        if computed != key {
            return Err(StoreError::HashMismatch { key, computed });
        }
        self.map.insert(
            key,
            Entry {
                val: val.to_vec(),
                rc: 1,
                pins: 0,
            },
        );
        trace!(key = %key.short_hex(), len = val.len(), "cxds insert");
        Ok((1, Change::Insert))
    }

    pub(crate) fn inc(&mut self, key: &Hash) -> StoreResult<u32> {
        let entry = self.map.get_mut(key).ok_or(StoreError::NotFound(*key))?;
        Ok(bump(key, entry))
    }

    pub(crate) fn dec_get(
        &mut self,
        key: &Hash,
    ) -> StoreResult<(u32, Option<Vec<u8>>, Option<Change>)> {
        let Some(entry) = self.map.get_mut(key) else {
            trace!(key = %key.short_hex(), "cxds dec of absent key ignored");
            return Ok((0, None, None));
        };
        if entry.rc == 0 {
            return Err(StoreError::RefcountUnderflow(*key));
        }
        entry.rc -= 1;
        if entry.rc > 0 || entry.pins > 0 {
            return Ok((entry.rc, None, Some(Change::Dec)));
        }
        let removed = self.map.remove(key).map(|e| e.val);
        trace!(key = %key.short_hex(), "cxds delete");
        Ok((0, removed, Some(Change::Del)))
    }

    pub(crate) fn pin(&mut self, key: &Hash) -> bool {
        match self.map.get_mut(key) {
            Some(entry) => {
                entry.pins = entry.pins.saturating_add(1);
                true
            }
            None => false,
        }
    }

    pub(crate) fn unpin(&mut self, key: &Hash) -> Option<Vec<u8>> {
        let entry = self.map.get_mut(key)?;
        if entry.pins == 0 {
            warn!(key = %key.short_hex(), "unpin of an entry that is not pinned");
            return None;
        }
        entry.pins -= 1;
        if entry.pins == 0 && entry.rc == 0 {
            return self.map.remove(key).map(|e| e.val);
        }
        None
    }

    pub(crate) fn remove_orphan(&mut self, key: &Hash) -> Option<Vec<u8>> {
        match self.map.get(key) {
            Some(e) if e.rc == 0 && e.pins == 0 => self.map.remove(key).map(|e| e.val),
            _ => None,
        }
    }

    pub(crate) fn stat(&self) -> Stat {
        let mut stat = Stat::default();
        for entry in self.map.values() {
            stat.objects += 1;
            stat.volume += entry.val.len() as u64;
            stat.refs += u64::from(entry.rc);
            if entry.rc == 0 {
                stat.parked += 1;
            }
        }
        stat
    }
}

fn bump(key: &Hash, entry: &mut Entry) -> u32 {
    if entry.rc == u32::MAX {
        warn!(key = %key.short_hex(), "refcount saturated");
    } else {
        entry.rc += 1;
    }
    entry.rc
}

/// In-memory, HashMap-based content store.
///
/// Intended for tests, short-lived nodes and embedding. Every mutation takes
/// the write lock, which makes counter updates on a key linearizable.
pub struct MemoryCxds {
    table: RwLock<Table>,
}

impl MemoryCxds {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Table::default()),
        }
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.table.read().expect("lock poisoned").map.len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted list of all keys.
    pub fn keys(&self) -> Vec<Hash> {
        let table = self.table.read().expect("lock poisoned");
        let mut keys: Vec<Hash> = table.map.keys().copied().collect();
        keys.sort();
        keys
    }
}

impl Default for MemoryCxds {
    fn default() -> Self {
        Self::new()
    }
}

impl Cxds for MemoryCxds {
    fn get(&self, key: &Hash) -> StoreResult<Option<(Vec<u8>, u32)>> {
        Ok(self.table.read().expect("lock poisoned").get(key))
    }

    fn set(&self, key: Hash, val: &[u8]) -> StoreResult<u32> {
        let mut table = self.table.write().expect("lock poisoned");
        table.set(key, val).map(|(rc, _)| rc)
    }

    fn inc(&self, key: &Hash) -> StoreResult<u32> {
        self.table.write().expect("lock poisoned").inc(key)
    }

    fn dec_get(&self, key: &Hash) -> StoreResult<(u32, Option<Vec<u8>>)> {
        let mut table = self.table.write().expect("lock poisoned");
        let (rc, removed, _) = table.dec_get(key)?;
        Ok((rc, removed))
    }

    fn pin(&self, key: &Hash) -> StoreResult<bool> {
        Ok(self.table.write().expect("lock poisoned").pin(key))
    }

    fn unpin(&self, key: &Hash) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.table.write().expect("lock poisoned").unpin(key))
    }

    fn remove_orphan(&self, key: &Hash) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.table.write().expect("lock poisoned").remove_orphan(key))
    }

    fn contains(&self, key: &Hash) -> StoreResult<bool> {
        Ok(self.table.read().expect("lock poisoned").map.contains_key(key))
    }

    fn iterate(&self, f: &mut dyn FnMut(&Hash, &[u8], u32) -> bool) -> StoreResult<()> {
        let table = self.table.read().expect("lock poisoned");
        for (key, entry) in &table.map {
            if !f(key, &entry.val, entry.rc) {
                break;
            }
        }
        Ok(())
    }

    fn stat(&self) -> StoreResult<Stat> {
        Ok(self.table.read().expect("lock poisoned").stat())
    }
}

impl std::fmt::Debug for MemoryCxds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCxds")
            .field("object_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;

    // -----------------------------------------------------------------------
    // Set / Get / Add
    // -----------------------------------------------------------------------

    #[test]
    fn add_then_get() {
        let db = MemoryCxds::new();
        let (key, rc) = db.add(b"hello").unwrap();
        assert_eq!(rc, 1);
        assert_eq!(key, Hash::sum(b"hello"));
        assert_eq!(db.get(&key).unwrap(), Some((b"hello".to_vec(), 1)));
    }

    #[test]
    fn get_absent_is_none() {
        let db = MemoryCxds::new();
        assert_eq!(db.get(&Hash::sum(b"nope")).unwrap(), None);
        assert!(!db.contains(&Hash::sum(b"nope")).unwrap());
    }

    #[test]
    fn set_existing_increments() {
        let db = MemoryCxds::new();
        let key = Hash::sum(b"dup");
        assert_eq!(db.set(key, b"dup").unwrap(), 1);
        assert_eq!(db.set(key, b"dup").unwrap(), 2);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn set_rejects_wrong_key() {
        let db = MemoryCxds::new();
        let err = db.set(Hash::sum(b"a"), b"b").unwrap_err();
        assert!(matches!(err, StoreError::HashMismatch { .. }));
        assert!(db.is_empty());
    }

    // -----------------------------------------------------------------------
    // Inc / Dec
    // -----------------------------------------------------------------------

    #[test]
    fn inc_absent_is_not_found() {
        let db = MemoryCxds::new();
        assert!(matches!(
            db.inc(&Hash::sum(b"x")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn dec_to_zero_deletes() {
        let db = MemoryCxds::new();
        let (key, _) = db.add(b"v").unwrap();
        db.inc(&key).unwrap();
        assert_eq!(db.dec(&key).unwrap(), 1);
        let (rc, removed) = db.dec_get(&key).unwrap();
        assert_eq!(rc, 0);
        assert_eq!(removed, Some(b"v".to_vec()));
        assert!(db.is_empty());
    }

    #[test]
    fn dec_is_idempotent_on_absent() {
        let db = MemoryCxds::new();
        let (key, _) = db.add(b"v").unwrap();
        assert_eq!(db.dec(&key).unwrap(), 0);
        assert_eq!(db.dec(&key).unwrap(), 0);
        assert_eq!(db.dec(&key).unwrap(), 0);
        assert!(db.is_empty());
    }

    #[test]
    fn inc_saturates() {
        let db = MemoryCxds::new();
        let (key, _) = db.add(b"v").unwrap();
        db.table.write().unwrap().map.get_mut(&key).unwrap().rc = u32::MAX;
        assert_eq!(db.inc(&key).unwrap(), u32::MAX);
    }

    // -----------------------------------------------------------------------
    // Pins
    // -----------------------------------------------------------------------

    #[test]
    fn pinned_entry_parks_at_zero() {
        let db = MemoryCxds::new();
        let (key, _) = db.add(b"held").unwrap();
        assert!(db.pin(&key).unwrap());
        assert_eq!(db.dec_get(&key).unwrap(), (0, None));
        assert_eq!(db.get(&key).unwrap(), Some((b"held".to_vec(), 0)));
        assert_eq!(db.stat().unwrap().parked, 1);

        // A parked entry cannot go below zero.
        assert!(matches!(
            db.dec(&key),
            Err(StoreError::RefcountUnderflow(_))
        ));

        assert_eq!(db.unpin(&key).unwrap(), Some(b"held".to_vec()));
        assert!(db.is_empty());
    }

    #[test]
    fn parked_entry_revives() {
        let db = MemoryCxds::new();
        let (key, _) = db.add(b"held").unwrap();
        db.pin(&key).unwrap();
        db.dec(&key).unwrap();
        assert_eq!(db.inc(&key).unwrap(), 1);
        assert_eq!(db.unpin(&key).unwrap(), None);
        assert_eq!(db.get(&key).unwrap().map(|(_, rc)| rc), Some(1));
    }

    #[test]
    fn pin_absent_is_false() {
        let db = MemoryCxds::new();
        assert!(!db.pin(&Hash::sum(b"x")).unwrap());
    }

    #[test]
    fn remove_orphan_only_touches_unpinned_zero() {
        let db = MemoryCxds::new();
        let (live, _) = db.add(b"live").unwrap();
        let (held, _) = db.add(b"held").unwrap();
        db.pin(&held).unwrap();
        db.dec(&held).unwrap();

        assert_eq!(db.remove_orphan(&live).unwrap(), None);
        assert_eq!(db.remove_orphan(&held).unwrap(), None);

        db.table.write().unwrap().map.get_mut(&held).unwrap().pins = 0;
        assert_eq!(db.remove_orphan(&held).unwrap(), Some(b"held".to_vec()));
        assert_eq!(db.keys(), vec![live]);
    }

    // -----------------------------------------------------------------------
    // Batches, iteration, stat
    // -----------------------------------------------------------------------

    #[test]
    fn multi_ops() {
        let db = MemoryCxds::new();
        let added = db.multi_add(&[b"a".to_vec(), b"b".to_vec(), b"a".to_vec()]).unwrap();
        assert_eq!(added[2], (Hash::sum(b"a"), 2));
        let keys = vec![Hash::sum(b"a"), Hash::sum(b"b")];
        assert_eq!(db.multi_inc(&keys).unwrap(), vec![3, 2]);
        assert_eq!(db.multi_dec(&keys).unwrap(), vec![2, 1]);
        let got = db.multi_get(&keys).unwrap();
        assert_eq!(got[1], Some((b"b".to_vec(), 1)));
    }

    #[test]
    fn iterate_can_stop_early() {
        let db = MemoryCxds::new();
        for v in [b"1", b"2", b"3"] {
            db.add(v).unwrap();
        }
        let mut seen = 0;
        db.iterate(&mut |_, _, _| {
            seen += 1;
            seen < 2
        })
        .unwrap();
        assert_eq!(seen, 2);
    }

    #[test]
    fn stat_sums_entries() {
        let db = MemoryCxds::new();
        db.add(b"abc").unwrap();
        db.add(b"abc").unwrap();
        db.add(b"de").unwrap();
        let stat = db.stat().unwrap();
        assert_eq!(stat.objects, 2);
        assert_eq!(stat.volume, 5);
        assert_eq!(stat.refs, 3);
    }

    #[test]
    fn concurrent_inc_dec_loses_no_updates() {
        let db = Arc::new(MemoryCxds::new());
        let (key, _) = db.add(b"shared").unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        db.inc(&key).unwrap();
                        db.set(key, b"shared").unwrap();
                        db.dec(&key).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(db.get(&key).unwrap().map(|(_, rc)| rc), Some(1 + 8 * 500));
    }

    // -----------------------------------------------------------------------
    // Properties
    // -----------------------------------------------------------------------

    proptest! {
        #[test]
        fn refcount_tracks_adds_and_decs(ops in proptest::collection::vec((0u8..4, any::<bool>()), 0..64)) {
            let db = MemoryCxds::new();
            let mut model = [0u32; 4];
            for (v, add) in ops {
                let key = Hash::sum(&[v]);
                if add {
                    db.add(&[v]).unwrap();
                    model[v as usize] += 1;
                } else {
                    db.dec(&key).unwrap();
                    model[v as usize] = model[v as usize].saturating_sub(1);
                }
            }
            for (v, want) in model.iter().enumerate() {
                let got = db.get(&Hash::sum(&[v as u8])).unwrap().map(|(_, rc)| rc);
                prop_assert_eq!(got, (*want > 0).then_some(*want));
            }
        }
    }
}
