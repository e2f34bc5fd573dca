use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use cxo_crypto::PubKey;
use cxo_store::Journal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ObjectResult;
use crate::root::Root;

/// One journaled change to the Root history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum RootRecord {
    AddFeed(PubKey),
    DelFeed(PubKey),
    Root(Root),
    Drop { feed: PubKey, seq: u64 },
}

/// Root history per feed, as recovered from the journal.
pub(crate) type History = HashMap<PubKey, BTreeMap<u64, Root>>;

/// Append-only Root history keyed by `(feed, seq)`.
pub(crate) struct RootLog {
    journal: Journal<RootRecord>,
}

impl RootLog {
    pub(crate) fn open(path: &Path) -> ObjectResult<(Self, History)> {
        let (journal, records) = Journal::open(path)?;
        let mut history = History::new();
        for record in records {
            match record {
                RootRecord::AddFeed(feed) => {
                    history.entry(feed).or_default();
                }
                RootRecord::DelFeed(feed) => {
                    history.remove(&feed);
                }
                RootRecord::Root(root) => {
                    if let Some(roots) = history.get_mut(&root.pub_key) {
                        roots.insert(root.seq, root);
                    }
                }
                RootRecord::Drop { feed, seq } => {
                    if let Some(roots) = history.get_mut(&feed) {
                        roots.remove(&seq);
                    }
                }
            }
        }
        info!(
            path = %path.display(),
            feeds = history.len(),
            roots = history.values().map(BTreeMap::len).sum::<usize>(),
            "root history opened"
        );
        Ok((Self { journal }, history))
    }

    pub(crate) fn append(&self, record: &RootRecord) -> ObjectResult<()> {
        self.journal.append(record)?;
        Ok(())
    }

    /// Rewrite the journal as the minimal record sequence for `history`.
    pub(crate) fn compact(&self, history: &History) -> ObjectResult<()> {
        let mut records = Vec::new();
        for (feed, roots) in history {
            records.push(RootRecord::AddFeed(*feed));
            records.extend(roots.values().cloned().map(RootRecord::Root));
        }
        self.journal.rewrite(&records)?;
        debug!(records = records.len(), "root history compacted");
        Ok(())
    }

    pub(crate) fn sync(&self) -> ObjectResult<()> {
        self.journal.sync()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cxo_crypto::SecretKey;
    use cxo_types::Hash;

    use super::*;

    fn root(sk: &SecretKey, seq: u64) -> Root {
        Root::sign(sk, seq, seq as i64, Hash::blank(), Hash::sum(&seq.to_le_bytes()))
    }

    #[test]
    fn replay_rebuilds_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roots.journal");
        let a = SecretKey::generate();
        let b = SecretKey::generate();
        {
            let (log, history) = RootLog::open(&path).unwrap();
            assert!(history.is_empty());
            log.append(&RootRecord::AddFeed(a.pub_key())).unwrap();
            log.append(&RootRecord::AddFeed(b.pub_key())).unwrap();
            log.append(&RootRecord::Root(root(&a, 0))).unwrap();
            log.append(&RootRecord::Root(root(&a, 1))).unwrap();
            log.append(&RootRecord::Root(root(&b, 0))).unwrap();
            log.append(&RootRecord::Drop { feed: a.pub_key(), seq: 0 }).unwrap();
            log.append(&RootRecord::DelFeed(b.pub_key())).unwrap();
        }
        let (_, history) = RootLog::open(&path).unwrap();
        assert_eq!(history.len(), 1);
        let roots = &history[&a.pub_key()];
        assert_eq!(roots.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert!(roots[&1].verify().is_ok());
    }

    #[test]
    fn roots_of_untracked_feeds_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roots.journal");
        let sk = SecretKey::generate();
        {
            let (log, _) = RootLog::open(&path).unwrap();
            log.append(&RootRecord::Root(root(&sk, 0))).unwrap();
        }
        let (_, history) = RootLog::open(&path).unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn compact_keeps_the_same_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roots.journal");
        let sk = SecretKey::generate();
        let (log, _) = RootLog::open(&path).unwrap();
        log.append(&RootRecord::AddFeed(sk.pub_key())).unwrap();
        for seq in 0..5 {
            log.append(&RootRecord::Root(root(&sk, seq))).unwrap();
        }
        for seq in 0..4 {
            log.append(&RootRecord::Drop { feed: sk.pub_key(), seq }).unwrap();
        }
        drop(log);

        let (log, history) = RootLog::open(&path).unwrap();
        log.compact(&history).unwrap();
        drop(log);
        let (_, again) = RootLog::open(&path).unwrap();
        assert_eq!(again, history);
    }
}
