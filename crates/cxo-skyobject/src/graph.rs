use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use cxo_registry::codec::references;
use cxo_registry::Batch;
use cxo_store::{Cxds, StoreError};
use cxo_types::Hash;
use tracing::{trace, warn};

use crate::error::{ObjectError, ObjectResult};

/// Edge bookkeeping on top of the content store.
///
/// Every method must run under the Container's state lock: the
/// contains-then-mutate steps below are only atomic because all refcount
/// changes are serialized there.
#[derive(Debug, Default)]
pub(crate) struct Graph {
    /// Edges to objects that are not stored yet.
    pub(crate) pending: HashMap<Hash, u32>,
}

impl Graph {
    /// Add one reference to each of `targets`. Targets found in `batch` but
    /// not in the store are inserted, and their own edges are linked in
    /// turn. Returns the number of inserted objects.
    pub(crate) fn link(
        &mut self,
        store: &dyn Cxds,
        known_full: &RwLock<HashSet<Hash>>,
        batch: &Batch,
        targets: Vec<Hash>,
    ) -> ObjectResult<usize> {
        let mut stack = targets;
        let mut inserted = 0;
        while let Some(key) = stack.pop() {
            if key.is_blank() {
                continue;
            }
            if store.contains(&key)? {
                store.inc(&key)?;
                continue;
            }
            match batch.get(&key) {
                Some(bytes) => {
                    let waiting = self.pending.remove(&key).unwrap_or(0);
                    self.store_new(store, known_full, key, bytes, waiting + 1)?;
                    stack.extend(references(bytes));
                    inserted += 1;
                }
                None => *self.pending.entry(key).or_insert(0) += 1,
            }
        }
        Ok(inserted)
    }

    /// Drop one reference to each of `targets`, cascading into the edges of
    /// every object that gets deleted. Returns the deleted keys.
    pub(crate) fn release(
        &mut self,
        store: &dyn Cxds,
        known_full: &RwLock<HashSet<Hash>>,
        targets: Vec<Hash>,
    ) -> ObjectResult<Vec<Hash>> {
        let mut stack = targets;
        let mut removed = Vec::new();
        while let Some(key) = stack.pop() {
            if key.is_blank() {
                continue;
            }
            if !store.contains(&key)? {
                match self.pending.get_mut(&key) {
                    Some(n) if *n > 1 => *n -= 1,
                    Some(_) => {
                        self.pending.remove(&key);
                    }
                    None => warn!(key = %key.short_hex(), "release of an unreferenced key"),
                }
                continue;
            }
            match store.dec_get(&key) {
                Ok((_, Some(bytes))) => {
                    trace!(key = %key.short_hex(), "object released");
                    known_full.write().expect("lock poisoned").remove(&key);
                    stack.extend(references(&bytes));
                    removed.push(key);
                }
                Ok(_) => {}
                Err(StoreError::RefcountUnderflow(key)) => {
                    warn!(key = %key.short_hex(), "refcount underflow ignored");
                    debug_assert!(false, "refcount underflow for {key}");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    /// Store bytes that arrived from elsewhere. They must be wanted, that is
    /// referenced by a pending edge. Returns the children that are still
    /// missing after linking.
    pub(crate) fn insert_received(
        &mut self,
        store: &dyn Cxds,
        known_full: &RwLock<HashSet<Hash>>,
        key: Hash,
        bytes: &[u8],
    ) -> ObjectResult<Vec<Hash>> {
        if Hash::sum(bytes) != key {
            return Err(ObjectError::HashMismatch(key));
        }
        if store.contains(&key)? {
            return Err(ObjectError::AlreadyHave(key));
        }
        let waiting = self.pending.remove(&key).ok_or(ObjectError::Unwanted(key))?;
        self.store_new(store, known_full, key, bytes, waiting)?;

        let children = references(bytes);
        self.link(store, known_full, &Batch::new(), children.clone())?;

        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for child in children {
            if seen.insert(child) && !store.contains(&child)? {
                missing.push(child);
            }
        }
        Ok(missing)
    }

    /// Drop a pin and cascade if that deleted a parked object.
    pub(crate) fn unpin(
        &mut self,
        store: &dyn Cxds,
        known_full: &RwLock<HashSet<Hash>>,
        key: &Hash,
    ) -> ObjectResult<Vec<Hash>> {
        match store.unpin(key)? {
            Some(bytes) => {
                known_full.write().expect("lock poisoned").remove(key);
                let mut removed = vec![*key];
                removed.extend(self.release(store, known_full, references(&bytes))?);
                Ok(removed)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Delete an unpinned refcount-0 entry and cascade.
    pub(crate) fn remove_orphan(
        &mut self,
        store: &dyn Cxds,
        known_full: &RwLock<HashSet<Hash>>,
        key: &Hash,
    ) -> ObjectResult<Vec<Hash>> {
        match store.remove_orphan(key)? {
            Some(bytes) => {
                known_full.write().expect("lock poisoned").remove(key);
                let mut removed = vec![*key];
                removed.extend(self.release(store, known_full, references(&bytes))?);
                Ok(removed)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Insert an absent object with refcount `rc`.
    fn store_new(
        &mut self,
        store: &dyn Cxds,
        known_full: &RwLock<HashSet<Hash>>,
        key: Hash,
        bytes: &[u8],
        rc: u32,
    ) -> ObjectResult<()> {
        store.set(key, bytes)?;
        if rc > 1 {
            store.multi_inc(&vec![key; (rc - 1) as usize])?;
        }
        known_full.write().expect("lock poisoned").remove(&key);
        trace!(key = %key.short_hex(), rc, "object stored");
        Ok(())
    }

    /// Recompute pending edges from scratch: every edge of a stored object,
    /// plus every Root top, that points at an absent key.
    pub(crate) fn rebuild(store: &dyn Cxds, tops: &[Hash]) -> ObjectResult<Self> {
        let mut edges = Vec::new();
        store.iterate(&mut |_, bytes, _| {
            edges.extend(references(bytes));
            true
        })?;
        edges.extend(tops.iter().copied());

        let mut graph = Graph::default();
        for key in edges {
            if !key.is_blank() && !store.contains(&key)? {
                *graph.pending.entry(key).or_insert(0) += 1;
            }
        }
        Ok(graph)
    }
}
