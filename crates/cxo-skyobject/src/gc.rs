//! Pruning of Root histories and the orphan sweep.
//!
//! Dropping a Root releases the reference it holds on its top object. The
//! release cascades through edges only where a refcount reaches zero, so
//! any subtree still reachable from a retained Root keeps its count and
//! stays stored.

use cxo_crypto::PubKey;
use cxo_types::Hash;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::container::{Container, State};
use crate::error::{ObjectError, ObjectResult};
use crate::event::ContainerEvent;
use crate::persist::RootRecord;
use crate::root::FillState;

/// What a prune removed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Sequence numbers of the dropped Roots.
    pub roots: Vec<u64>,
    /// Number of objects deleted from the store.
    pub objects: usize,
}

impl Container {
    /// Keep the newest `keep` Roots of a feed (at least one) and drop the
    /// rest. The newest full Root is always kept, even when it is older.
    pub fn prune_feed(&self, feed: &PubKey, keep: usize) -> ObjectResult<PruneReport> {
        let keep = keep.max(1);
        let mut state = self.lock();
        let State { feeds, graph } = &mut *state;
        let f = feeds.get_mut(feed).ok_or(ObjectError::FeedNotFound(*feed))?;

        let newest_full = f
            .roots
            .iter()
            .rev()
            .find(|(_, e)| e.state == FillState::Full)
            .map(|(seq, _)| *seq);
        let mut doomed: Vec<u64> = f
            .roots
            .keys()
            .rev()
            .skip(keep)
            .copied()
            .filter(|seq| Some(*seq) != newest_full)
            .collect();
        doomed.reverse();

        let mut tops: Vec<Hash> = Vec::with_capacity(doomed.len());
        for seq in &doomed {
            self.journal(RootRecord::Drop { feed: *feed, seq: *seq })?;
            if let Some(entry) = f.roots.remove(seq) {
                tops.push(entry.root.hash);
            }
        }
        let removed = graph.release(self.store(), &self.inner.known_full, tops)?;
        drop(state);

        for seq in &doomed {
            self.emit(ContainerEvent::RootDropped { feed: *feed, seq: *seq });
        }
        if !doomed.is_empty() {
            info!(
                feed = %feed.short_hex(),
                roots = doomed.len(),
                objects = removed.len(),
                "feed pruned"
            );
        }
        Ok(PruneReport {
            roots: doomed,
            objects: removed.len(),
        })
    }

    /// Delete every refcount-0 entry that is not pinned, cascading into its
    /// edges. Returns the number of objects deleted.
    pub fn sweep_orphans(&self) -> ObjectResult<usize> {
        let mut state = self.lock();
        let mut orphans = Vec::new();
        self.store().iterate(&mut |key, _, rc| {
            if rc == 0 {
                orphans.push(*key);
            }
            true
        })?;

        let mut removed = 0;
        for key in orphans {
            removed += state
                .graph
                .remove_orphan(self.store(), &self.inner.known_full, &key)?
                .len();
        }
        drop(state);
        debug!(removed, "orphan sweep done");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cxo_crypto::SecretKey;
    use cxo_registry::{Kind, Object, Registry, Schema};
    use cxo_store::{Cxds, DiskCxds};
    use proptest::prelude::*;

    use super::*;
    use crate::config::ContainerConfig;
    use crate::root::Root;

    fn registry() -> Arc<Registry> {
        let reg = Registry::new();
        reg.register(Schema::builder("Item").field("name", Kind::Str).build())
            .unwrap();
        Arc::new(reg)
    }

    fn item(c: &Container, name: &str) -> Object {
        c.registry().object("Item").unwrap().with("name", name).unwrap()
    }

    fn rc(c: &Container, key: &Hash) -> Option<u32> {
        c.store().get(key).unwrap().map(|(_, rc)| rc)
    }

    // -----------------------------------------------------------------------
    // Pruning
    // -----------------------------------------------------------------------

    #[test]
    fn pruning_keeps_subtrees_shared_with_retained_roots() {
        let c = Container::in_memory(registry());
        let sk = SecretKey::generate();
        let mut pack = c.create_pack(&sk).unwrap();
        pack.append(item(&c, "shared")).unwrap();
        pack.append(item(&c, "old")).unwrap();
        let r0 = pack.save().unwrap();
        let shared = pack.items()[0].hash();
        let old = pack.items()[1].hash();

        pack.set_ref_by_index(1, item(&c, "new")).unwrap();
        let r1 = pack.save().unwrap();
        let new = pack.items()[1].hash();
        assert_eq!(rc(&c, &shared), Some(2));

        let report = c.prune_feed(&sk.pub_key(), 1).unwrap();
        assert_eq!(report.roots, vec![0]);
        assert_eq!(report.objects, 2);

        assert_eq!(rc(&c, &shared), Some(1));
        assert_eq!(rc(&c, &new), Some(1));
        assert_eq!(rc(&c, &old), None);
        assert_eq!(rc(&c, &r0.hash), None);
        assert_eq!(rc(&c, &r1.hash), Some(1));
        assert!(matches!(
            c.root_by_seq(&sk.pub_key(), 0),
            Err(ObjectError::RootNotFound { seq: 0, .. })
        ));
    }

    #[test]
    fn newest_full_root_survives_pruning() {
        let c = Container::in_memory(registry());
        let sk = SecretKey::generate();
        let mut pack = c.create_pack(&sk).unwrap();
        pack.append(item(&c, "a")).unwrap();
        let full = pack.save().unwrap();

        // Two newer Roots whose trees never arrive.
        for seq in 1..3 {
            let r = Root::sign(&sk, seq, 0, full.digest(), Hash::sum(&seq.to_le_bytes()));
            c.receive_root(r).unwrap();
        }
        let report = c.prune_feed(&sk.pub_key(), 1).unwrap();
        assert_eq!(report.roots, vec![1]);
        assert_eq!(c.last_full_root(&sk.pub_key()), Some(full));
        assert_eq!(c.stat().unwrap().pending, 1);
    }

    #[test]
    fn keep_zero_still_keeps_the_latest() {
        let c = Container::in_memory(registry());
        let sk = SecretKey::generate();
        let mut pack = c.create_pack(&sk).unwrap();
        for i in 0..3 {
            pack.append(item(&c, &i.to_string())).unwrap();
            pack.save().unwrap();
        }
        c.prune_feed(&sk.pub_key(), 0).unwrap();
        assert_eq!(c.roots(&sk.pub_key()).unwrap().len(), 1);
        assert_eq!(c.stat().unwrap().store.objects, 4);
    }

    #[test]
    fn prune_of_unknown_feed_fails() {
        let c = Container::in_memory(registry());
        let pk = SecretKey::generate().pub_key();
        assert!(matches!(c.prune_feed(&pk, 1), Err(ObjectError::FeedNotFound(_))));
    }

    #[test]
    fn auto_prune_applies_after_fill() {
        let config = ContainerConfig {
            keep_roots: Some(2),
            ..ContainerConfig::default()
        };
        let c = Container::new(registry(), config).unwrap();
        let sk = SecretKey::generate();
        let mut pack = c.create_pack(&sk).unwrap();
        for i in 0..5 {
            pack.append(item(&c, &i.to_string())).unwrap();
            pack.save().unwrap();
        }
        let seqs: Vec<u64> = c
            .roots(&sk.pub_key())
            .unwrap()
            .iter()
            .map(|(r, _)| r.seq)
            .collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    // -----------------------------------------------------------------------
    // Holds
    // -----------------------------------------------------------------------

    #[test]
    fn held_tree_outlives_its_root() {
        let c = Container::in_memory(registry());
        let sk = SecretKey::generate();
        let mut pack = c.create_pack(&sk).unwrap();
        pack.append(item(&c, "a")).unwrap();
        let r0 = pack.save().unwrap();
        let a = pack.items()[0].hash();
        assert!(c.hold(&r0).unwrap());

        pack.replace(Vec::new()).unwrap();
        pack.save().unwrap();
        c.prune_feed(&sk.pub_key(), 1).unwrap();

        // Parked at rc 0, children intact.
        assert_eq!(rc(&c, &r0.hash), Some(0));
        assert_eq!(rc(&c, &a), Some(1));
        assert_eq!(c.sweep_orphans().unwrap(), 0);

        c.unhold(&r0).unwrap();
        assert_eq!(rc(&c, &r0.hash), None);
        assert_eq!(rc(&c, &a), None);
    }

    #[test]
    fn held_root_that_is_retained_is_unaffected() {
        let c = Container::in_memory(registry());
        let sk = SecretKey::generate();
        let mut pack = c.create_pack(&sk).unwrap();
        pack.append(item(&c, "a")).unwrap();
        let r0 = pack.save().unwrap();
        c.hold(&r0).unwrap();
        c.unhold(&r0).unwrap();
        assert_eq!(rc(&c, &r0.hash), Some(1));
        assert!(c.is_full(&r0).unwrap());
    }

    // -----------------------------------------------------------------------
    // Sweep
    // -----------------------------------------------------------------------

    #[test]
    fn sweep_removes_parked_entries_left_by_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = ContainerConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..ContainerConfig::default()
        };
        let sk = SecretKey::generate();
        {
            let c = Container::new(registry(), config.clone()).unwrap();
            let mut pack = c.create_pack(&sk).unwrap();
            pack.append(item(&c, "a")).unwrap();
            let r0 = pack.save().unwrap();
            c.hold(&r0).unwrap();
            pack.replace(Vec::new()).unwrap();
            pack.save().unwrap();
            c.prune_feed(&sk.pub_key(), 1).unwrap();
            c.close().unwrap();
        }

        let c = Container::new(registry(), config).unwrap();
        // Old top, its item, and the new empty top.
        assert_eq!(c.stat().unwrap().store.objects, 3);
        assert_eq!(c.sweep_orphans().unwrap(), 2);
        assert_eq!(c.stat().unwrap().store.objects, 1);
        assert_eq!(c.sweep_orphans().unwrap(), 0);
    }

    #[test]
    fn sweep_leaves_live_objects_alone() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskCxds::open(&dir.path().join("objects")).unwrap());
        let c = Container::with_store(registry(), store, ContainerConfig::default()).unwrap();
        let sk = SecretKey::generate();
        let mut pack = c.create_pack(&sk).unwrap();
        pack.append(item(&c, "a")).unwrap();
        pack.save().unwrap();
        assert_eq!(c.sweep_orphans().unwrap(), 0);
        assert_eq!(c.stat().unwrap().store.objects, 2);
    }

    // -----------------------------------------------------------------------
    // Refcount balance
    // -----------------------------------------------------------------------

    #[derive(Clone, Debug)]
    enum Op {
        Append(u8),
        Remove(usize),
        Replace(Vec<u8>),
        Prune(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6).prop_map(Op::Append),
            (0usize..8).prop_map(Op::Remove),
            proptest::collection::vec(0u8..6, 0..4).prop_map(Op::Replace),
            (1usize..3).prop_map(Op::Prune),
        ]
    }

    proptest! {
        #[test]
        fn refcounts_return_to_zero(ops in proptest::collection::vec(op(), 1..16)) {
            let c = Container::in_memory(registry());
            let sk = SecretKey::generate();
            let mut pack = c.create_pack(&sk).unwrap();
            for op in ops {
                match op {
                    Op::Append(n) => pack.append(item(&c, &n.to_string())).unwrap(),
                    Op::Remove(i) => {
                        if i < pack.len() {
                            pack.remove(i).unwrap();
                        }
                    }
                    Op::Replace(names) => {
                        let items = names
                            .iter()
                            .map(|n| cxo_registry::Dynamic::new(item(&c, &n.to_string())))
                            .collect();
                        pack.replace(items).unwrap();
                    }
                    Op::Prune(keep) => {
                        c.prune_feed(&sk.pub_key(), keep).unwrap();
                        continue;
                    }
                }
                pack.save().unwrap();
            }

            // Every stored refcount equals its in-degree from stored objects
            // plus the retained Roots pointing at it.
            let mut expected: std::collections::HashMap<Hash, u32> = Default::default();
            for (root, _) in c.roots(&sk.pub_key()).unwrap() {
                *expected.entry(root.hash).or_default() += 1;
            }
            let mut actual = std::collections::HashMap::new();
            c.store().iterate(&mut |key, bytes, rc| {
                actual.insert(*key, rc);
                for child in cxo_registry::codec::references(bytes) {
                    *expected.entry(child).or_default() += 1;
                }
                true
            }).unwrap();
            prop_assert_eq!(&actual, &expected);

            prop_assert!(c.del_feed(&sk.pub_key()).unwrap());
            prop_assert_eq!(c.stat().unwrap().store.objects, 0);
            prop_assert_eq!(c.stat().unwrap().pending, 0);
        }
    }
}
