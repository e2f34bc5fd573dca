use std::path::Path;
use std::sync::RwLock;

use cxo_types::Hash;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::journal::Journal;
use crate::memory::{Change, Entry, Table};
use crate::traits::{Cxds, Stat};

/// One journaled mutation of the refcount table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
enum Record {
    Put { key: Hash, val: Vec<u8>, rc: u32 },
    Inc { key: Hash },
    Dec { key: Hash },
    Del { key: Hash },
}

/// Persistent content store.
///
/// The table lives in memory exactly like [`MemoryCxds`](crate::MemoryCxds);
/// every mutation is appended to a [`Journal`] while the table lock is held,
/// so the journal order is the apply order. A mutation whose append fails
/// is undone before the error is returned. Reopening replays the journal.
///
/// Pins are runtime state and are not journaled: an entry parked at
/// refcount 0 when the process stopped comes back unpinned and is left for
/// an orphan sweep.
pub struct DiskCxds {
    table: RwLock<Table>,
    journal: Journal<Record>,
}

impl DiskCxds {
    /// Open (or create) the store journaled at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let (journal, records) = Journal::open(path)?;
        let mut table = Table::default();
        let replayed = records.len();
        for record in records {
            apply(&mut table, record);
        }
        info!(
            path = %path.display(),
            records = replayed,
            objects = table.map.len(),
            "disk store opened"
        );
        Ok(Self {
            table: RwLock::new(table),
            journal,
        })
    }

    /// Rewrite the journal as one snapshot record per entry.
    pub fn compact(&self) -> StoreResult<()> {
        let table = self.table.write().expect("lock poisoned");
        let snapshot: Vec<Record> = table
            .map
            .iter()
            .map(|(key, e)| Record::Put {
                key: *key,
                val: e.val.clone(),
                rc: e.rc,
            })
            .collect();
        self.journal.rewrite(&snapshot)?;
        debug!(objects = snapshot.len(), "disk store compacted");
        Ok(())
    }

    /// Size of the journal in bytes.
    pub fn journal_len(&self) -> u64 {
        self.journal.offset()
    }
}

/// Counters of one entry before a mutation.
///
/// The table is changed first and journaled second; when the append fails
/// the entry is put back, so the table never runs ahead of the journal.
struct Undo {
    key: Hash,
    before: Option<(u32, u32)>,
}

impl Undo {
    fn of(table: &Table, key: Hash) -> Self {
        Self {
            key,
            before: table.map.get(&key).map(|e| (e.rc, e.pins)),
        }
    }

    /// `removed` carries the bytes of an entry the mutation deleted.
    fn revert(self, table: &mut Table, removed: Option<Vec<u8>>) {
        match (self.before, table.map.get_mut(&self.key)) {
            (None, Some(_)) => {
                table.map.remove(&self.key);
            }
            (Some((rc, pins)), Some(e)) => {
                e.rc = rc;
                e.pins = pins;
            }
            (Some((rc, pins)), None) => {
                if let Some(val) = removed {
                    table.map.insert(self.key, Entry { val, rc, pins });
                }
            }
            (None, None) => {}
        }
    }
}

impl DiskCxds {
    fn commit(
        &self,
        table: &mut Table,
        undo: Undo,
        record: &Record,
        removed: Option<Vec<u8>>,
    ) -> StoreResult<Option<Vec<u8>>> {
        match self.journal.append(record) {
            Ok(_) => Ok(removed),
            Err(e) => {
                warn!(
                    key = %undo.key.short_hex(),
                    error = %e,
                    "journal append failed; mutation reverted"
                );
                undo.revert(table, removed);
                Err(e)
            }
        }
    }
}

fn apply(table: &mut Table, record: Record) {
    match record {
        Record::Put { key, val, rc } => {
            table.map.insert(key, Entry { val, rc, pins: 0 });
        }
        Record::Inc { key } => {
            if let Some(e) = table.map.get_mut(&key) {
                e.rc = e.rc.saturating_add(1);
            }
        }
        Record::Dec { key } => {
            if let Some(e) = table.map.get_mut(&key) {
                e.rc = e.rc.saturating_sub(1);
            }
        }
        Record::Del { key } => {
            table.map.remove(&key);
        }
    }
}

impl Cxds for DiskCxds {
    fn get(&self, key: &Hash) -> StoreResult<Option<(Vec<u8>, u32)>> {
        Ok(self.table.read().expect("lock poisoned").get(key))
    }

    fn set(&self, key: Hash, val: &[u8]) -> StoreResult<u32> {
        let mut table = self.table.write().expect("lock poisoned");
        let undo = Undo::of(&table, key);
        let (rc, change) = table.set(key, val)?;
        let record = match change {
            Change::Insert => Record::Put {
                key,
                val: val.to_vec(),
                rc: 1,
            },
            _ => Record::Inc { key },
        };
        self.commit(&mut table, undo, &record, None)?;
        Ok(rc)
    }

    fn inc(&self, key: &Hash) -> StoreResult<u32> {
        let mut table = self.table.write().expect("lock poisoned");
        let undo = Undo::of(&table, *key);
        let rc = table.inc(key)?;
        self.commit(&mut table, undo, &Record::Inc { key: *key }, None)?;
        Ok(rc)
    }

    fn dec_get(&self, key: &Hash) -> StoreResult<(u32, Option<Vec<u8>>)> {
        let mut table = self.table.write().expect("lock poisoned");
        let undo = Undo::of(&table, *key);
        let (rc, removed, change) = table.dec_get(key)?;
        let record = match change {
            Some(Change::Del) => Record::Del { key: *key },
            Some(_) => Record::Dec { key: *key },
            None => return Ok((rc, removed)),
        };
        let removed = self.commit(&mut table, undo, &record, removed)?;
        Ok((rc, removed))
    }

    fn pin(&self, key: &Hash) -> StoreResult<bool> {
        Ok(self.table.write().expect("lock poisoned").pin(key))
    }

    fn unpin(&self, key: &Hash) -> StoreResult<Option<Vec<u8>>> {
        let mut table = self.table.write().expect("lock poisoned");
        let undo = Undo::of(&table, *key);
        match table.unpin(key) {
            Some(val) => self.commit(&mut table, undo, &Record::Del { key: *key }, Some(val)),
            None => Ok(None),
        }
    }

    fn remove_orphan(&self, key: &Hash) -> StoreResult<Option<Vec<u8>>> {
        let mut table = self.table.write().expect("lock poisoned");
        let undo = Undo::of(&table, *key);
        match table.remove_orphan(key) {
            Some(val) => self.commit(&mut table, undo, &Record::Del { key: *key }, Some(val)),
            None => Ok(None),
        }
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

    fn close(&self) -> StoreResult<()> {
        self.journal.sync()
    }
}

impl std::fmt::Debug for DiskCxds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCxds")
            .field("path", &self.journal.path())
            .field("journal_len", &self.journal_len())
            .finish()
    }
}
