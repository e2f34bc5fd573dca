//! The Container: Root histories of tracked feeds over one shared store.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use cxo_crypto::PubKey;
use cxo_registry::{Batch, Loader, Registry, RegistryError, RegistryResult};
use cxo_store::{Cxds, DiskCxds, MemoryCxds, Stat};
use cxo_types::Hash;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::ContainerConfig;
use crate::error::{ObjectError, ObjectResult};
use crate::event::ContainerEvent;
use crate::graph::Graph;
use crate::persist::{History, RootLog, RootRecord};
use crate::root::{FillState, Root};
use crate::walk::{walk, Walk};

const OBJECTS_JOURNAL: &str = "objects.journal";
const ROOTS_JOURNAL: &str = "roots.journal";

#[derive(Clone, Debug)]
pub(crate) struct RootEntry {
    pub(crate) root: Root,
    pub(crate) state: FillState,
}

#[derive(Debug, Default)]
pub(crate) struct Feed {
    pub(crate) roots: BTreeMap<u64, RootEntry>,
}

impl Feed {
    fn latest(&self) -> Option<&RootEntry> {
        self.roots.last_key_value().map(|(_, e)| e)
    }

    fn latest_full(&self) -> Option<&RootEntry> {
        self.roots.values().rev().find(|e| e.state == FillState::Full)
    }
}

/// Everything guarded by the graph lock.
#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) feeds: HashMap<PubKey, Feed>,
    pub(crate) graph: Graph,
}

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn Cxds>,
    disk: Option<Arc<DiskCxds>>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) config: ContainerConfig,
    pub(crate) state: Mutex<State>,
    /// Hashes whose whole subtree was found present. Entries are removed
    /// when the object leaves the store.
    pub(crate) known_full: RwLock<HashSet<Hash>>,
    log: Option<RootLog>,
    events: broadcast::Sender<ContainerEvent>,
}

/// Aggregate figures about a Container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStat {
    pub feeds: usize,
    pub roots: usize,
    pub full_roots: usize,
    /// Distinct hashes referenced but not stored yet.
    pub pending: usize,
    pub store: Stat,
}

/// Root histories of the tracked feeds over one shared content store.
///
/// Cheap to clone; clones share the same state. All refcount changes run
/// under one graph lock, so a save, a prune and an incoming object never
/// interleave their increments and decrements.
#[derive(Clone)]
pub struct Container {
    pub(crate) inner: Arc<Inner>,
}

impl Container {
    /// Open a Container. With `config.data_dir` set, objects and Root
    /// history are journaled there and replayed.
    pub fn new(registry: Arc<Registry>, config: ContainerConfig) -> ObjectResult<Self> {
        config.validate()?;
        let Some(dir) = config.data_dir.clone() else {
            return Ok(Self::assemble(
                registry,
                Arc::new(MemoryCxds::new()),
                None,
                None,
                History::new(),
                config,
            ));
        };

        let disk = Arc::new(DiskCxds::open(&dir.join(OBJECTS_JOURNAL))?);
        let (log, history) = RootLog::open(&dir.join(ROOTS_JOURNAL))?;
        let container = Self::assemble(
            registry,
            disk.clone(),
            Some(disk),
            Some(log),
            history,
            config,
        );
        container.recover()?;
        Ok(container)
    }

    /// An empty in-memory Container with default settings.
    pub fn in_memory(registry: Arc<Registry>) -> Self {
        Self::assemble(
            registry,
            Arc::new(MemoryCxds::new()),
            None,
            None,
            History::new(),
            ContainerConfig::default(),
        )
    }

    /// An empty Container over a caller-supplied store. `data_dir` is
    /// ignored; the store must be empty or hold no Root tops.
    pub fn with_store(
        registry: Arc<Registry>,
        store: Arc<dyn Cxds>,
        config: ContainerConfig,
    ) -> ObjectResult<Self> {
        config.validate()?;
        let container = Self::assemble(registry, store, None, None, History::new(), config);
        container.recover()?;
        Ok(container)
    }

    fn assemble(
        registry: Arc<Registry>,
        store: Arc<dyn Cxds>,
        disk: Option<Arc<DiskCxds>>,
        log: Option<RootLog>,
        history: History,
        config: ContainerConfig,
    ) -> Self {
        let feeds = history
            .into_iter()
            .map(|(pk, roots)| {
                let roots = roots
                    .into_iter()
                    .map(|(seq, root)| {
                        let entry = RootEntry {
                            root,
                            state: FillState::Unfilled,
                        };
                        (seq, entry)
                    })
                    .collect();
                (pk, Feed { roots })
            })
            .collect();
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            inner: Arc::new(Inner {
                store,
                disk,
                registry,
                config,
                state: Mutex::new(State {
                    feeds,
                    graph: Graph::default(),
                }),
                known_full: RwLock::default(),
                log,
                events,
            }),
        }
    }

    /// Rebuild pending edges and fill states after a replay.
    fn recover(&self) -> ObjectResult<()> {
        let mut state = self.lock();
        let tops: Vec<Hash> = state
            .feeds
            .values()
            .flat_map(|f| f.roots.values().map(|e| e.root.hash))
            .collect();
        state.graph = Graph::rebuild(self.store(), &tops)?;

        let mut full = 0;
        for feed in state.feeds.values_mut() {
            for entry in feed.roots.values_mut() {
                let w = walk(self.store(), &self.inner.known_full, entry.root.hash)?;
                entry.state = fill_state_of(&w);
                if w.is_full() {
                    self.inner.known_full.write().expect("lock poisoned").extend(w.present);
                    full += 1;
                }
            }
        }
        if !tops.is_empty() {
            info!(
                feeds = state.feeds.len(),
                roots = tops.len(),
                full,
                pending = state.graph.pending.len(),
                "container recovered"
            );
        }
        Ok(())
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().expect("lock poisoned")
    }

    pub(crate) fn journal(&self, record: RootRecord) -> ObjectResult<()> {
        if let Some(log) = &self.inner.log {
            log.append(&record)?;
        }
        Ok(())
    }

    pub(crate) fn emit(&self, event: ContainerEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn store(&self) -> &dyn Cxds {
        self.inner.store.as_ref()
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.inner.config
    }

    /// Receive lifecycle events from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ContainerEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Feeds
    // -----------------------------------------------------------------------

    /// Start tracking a feed. Returns `false` if it was already tracked.
    pub fn add_feed(&self, feed: PubKey) -> ObjectResult<bool> {
        let mut state = self.lock();
        if state.feeds.contains_key(&feed) {
            return Ok(false);
        }
        self.journal(RootRecord::AddFeed(feed))?;
        state.feeds.insert(feed, Feed::default());
        drop(state);

        info!(feed = %feed.short_hex(), "feed added");
        self.emit(ContainerEvent::FeedAdded(feed));
        Ok(true)
    }

    /// Stop tracking a feed and release all of its Roots. Returns `false`
    /// if it was not tracked.
    pub fn del_feed(&self, feed: &PubKey) -> ObjectResult<bool> {
        let mut state = self.lock();
        let State { feeds, graph } = &mut *state;
        let Some(removed) = feeds.remove(feed) else {
            return Ok(false);
        };
        self.journal(RootRecord::DelFeed(*feed))?;
        let tops: Vec<Hash> = removed.roots.values().map(|e| e.root.hash).collect();
        let objects = graph.release(self.store(), &self.inner.known_full, tops)?;
        drop(state);

        info!(
            feed = %feed.short_hex(),
            roots = removed.roots.len(),
            objects = objects.len(),
            "feed removed"
        );
        self.emit(ContainerEvent::FeedRemoved(*feed));
        Ok(true)
    }

    pub fn has_feed(&self, feed: &PubKey) -> bool {
        self.lock().feeds.contains_key(feed)
    }

    /// Tracked feeds, sorted.
    pub fn feeds(&self) -> Vec<PubKey> {
        let mut feeds: Vec<PubKey> = self.lock().feeds.keys().copied().collect();
        feeds.sort();
        feeds
    }

    // -----------------------------------------------------------------------
    // Roots
    // -----------------------------------------------------------------------

    /// Accept a Root that arrived from elsewhere.
    ///
    /// Returns `Ok(false)` for a duplicate of the latest Root. The accepted
    /// Root starts [`FillState::Unfilled`]; call [`missing`](Self::missing)
    /// to find what to fetch.
    pub fn receive_root(&self, root: Root) -> ObjectResult<bool> {
        if root.verify().is_err() {
            warn!(root = %root, "root signature does not verify");
            return Err(ObjectError::InvalidSignature {
                feed: root.pub_key,
                seq: root.seq,
            });
        }
        if !self.accept(&root, &Batch::new())? {
            return Ok(false);
        }
        info!(root = %root, "root received");
        self.emit(ContainerEvent::RootReceived(root));
        Ok(true)
    }

    /// Store a locally built Root together with the objects of its save.
    pub(crate) fn commit(&self, root: &Root, batch: &Batch) -> ObjectResult<()> {
        self.accept(root, batch)?;
        info!(root = %root, objects = batch.len(), "root saved");
        self.emit(ContainerEvent::RootSaved(root.clone()));
        self.missing(root)?;
        Ok(())
    }

    /// Order check, link and journal the top under the graph lock.
    fn accept(&self, root: &Root, batch: &Batch) -> ObjectResult<bool> {
        let mut state = self.lock();
        let State { feeds, graph } = &mut *state;
        let feed = feeds
            .get_mut(&root.pub_key)
            .ok_or(ObjectError::FeedNotFound(root.pub_key))?;

        if let Some(latest) = feed.latest() {
            let latest_seq = latest.root.seq;
            if root.seq < latest_seq {
                warn!(root = %root, latest = latest_seq, "stale root rejected");
                return Err(ObjectError::StaleRoot {
                    feed: root.pub_key,
                    seq: root.seq,
                    latest: latest_seq,
                });
            }
            if root.seq == latest_seq {
                if latest.root.hash == root.hash {
                    debug!(root = %root, "duplicate root");
                    return Ok(false);
                }
                warn!(root = %root, "fork rejected");
                return Err(ObjectError::Fork {
                    feed: root.pub_key,
                    seq: root.seq,
                });
            }
        }

        // Count the top before recording the Root: a crash in between
        // leaks a count instead of losing one.
        graph.link(self.store(), &self.inner.known_full, batch, vec![root.hash])?;
        if let Err(e) = self.journal(RootRecord::Root(root.clone())) {
            if let Err(undo) = graph.release(self.store(), &self.inner.known_full, vec![root.hash]) {
                warn!(root = %root, error = %undo, "unlinking an unrecorded root failed");
            }
            return Err(e);
        }
        feed.roots.insert(
            root.seq,
            RootEntry {
                root: root.clone(),
                state: FillState::Unfilled,
            },
        );
        Ok(true)
    }

    /// Newest Root of a feed, whatever its fill state.
    pub fn last_root(&self, feed: &PubKey) -> Option<Root> {
        self.lock().feeds.get(feed)?.latest().map(|e| e.root.clone())
    }

    /// Newest Root of a feed whose tree is complete.
    pub fn last_full_root(&self, feed: &PubKey) -> Option<Root> {
        self.lock().feeds.get(feed)?.latest_full().map(|e| e.root.clone())
    }

    pub fn root_by_seq(&self, feed: &PubKey, seq: u64) -> ObjectResult<Root> {
        let state = self.lock();
        let f = state.feeds.get(feed).ok_or(ObjectError::FeedNotFound(*feed))?;
        f.roots
            .get(&seq)
            .map(|e| e.root.clone())
            .ok_or(ObjectError::RootNotFound { feed: *feed, seq })
    }

    /// Retained Roots of a feed, oldest first.
    pub fn roots(&self, feed: &PubKey) -> ObjectResult<Vec<(Root, FillState)>> {
        let state = self.lock();
        let f = state.feeds.get(feed).ok_or(ObjectError::FeedNotFound(*feed))?;
        Ok(f.roots.values().map(|e| (e.root.clone(), e.state)).collect())
    }

    pub fn fill_state(&self, feed: &PubKey, seq: u64) -> Option<FillState> {
        self.lock().feeds.get(feed)?.roots.get(&seq).map(|e| e.state)
    }

    /// Note that objects of a Root are being fetched.
    pub fn mark_filling(&self, root: &Root) {
        let mut state = self.lock();
        if let Some(entry) = state
            .feeds
            .get_mut(&root.pub_key)
            .and_then(|f| f.roots.get_mut(&root.seq))
        {
            if entry.state == FillState::Unfilled {
                entry.state = FillState::Filling;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Filling
    // -----------------------------------------------------------------------

    /// Hashes reachable from the Root's top that are not stored, and update
    /// its fill state. A Root that becomes full is announced and, with
    /// `keep_roots` set, its feed is pruned.
    pub fn missing(&self, root: &Root) -> ObjectResult<Vec<Hash>> {
        let w = walk(self.store(), &self.inner.known_full, root.hash)?;
        let new_state = fill_state_of(&w);

        let mut state = self.lock();
        let Some(entry) = state
            .feeds
            .get_mut(&root.pub_key)
            .and_then(|f| f.roots.get_mut(&root.seq))
            .filter(|e| e.root.hash == root.hash)
        else {
            // Pruned or replaced meanwhile; nothing to record.
            return Ok(w.missing);
        };
        let was = entry.state;
        if new_state == FillState::Full || was != FillState::Filling {
            entry.state = new_state;
        }
        if new_state == FillState::Full {
            // The Root is retained, so everything it reaches stays stored.
            self.inner.known_full.write().expect("lock poisoned").extend(w.present);
        }
        drop(state);

        if was != FillState::Full && new_state == FillState::Full {
            info!(root = %root, "root filled");
            self.emit(ContainerEvent::RootFilled(root.clone()));
            if let Some(keep) = self.inner.config.keep_roots {
                self.prune_feed(&root.pub_key, keep)?;
            }
        }
        Ok(w.missing)
    }

    pub fn is_full(&self, root: &Root) -> ObjectResult<bool> {
        Ok(self.missing(root)?.is_empty())
    }

    /// Store bytes fetched for a pending edge. Returns the children that
    /// are still missing.
    pub fn insert_received(&self, key: Hash, bytes: &[u8]) -> ObjectResult<Vec<Hash>> {
        let mut state = self.lock();
        let missing = state
            .graph
            .insert_received(self.store(), &self.inner.known_full, key, bytes)?;
        debug!(key = %key.short_hex(), size = bytes.len(), missing = missing.len(), "object received");
        Ok(missing)
    }

    /// Returns `true` if some retained object or Root is waiting for `key`.
    pub fn wants(&self, key: &Hash) -> bool {
        self.lock().graph.pending.contains_key(key)
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    pub fn get(&self, key: &Hash) -> ObjectResult<Option<Vec<u8>>> {
        Ok(self.store().get(key)?.map(|(val, _)| val))
    }

    pub fn contains(&self, key: &Hash) -> ObjectResult<bool> {
        Ok(self.store().contains(key)?)
    }

    /// Keep a Root's tree stored even if the Root is pruned, until
    /// [`unhold`](Self::unhold). Returns `false` if its top is not stored.
    pub fn hold(&self, root: &Root) -> ObjectResult<bool> {
        let _state = self.lock();
        Ok(self.store().pin(&root.hash)?)
    }

    /// Drop a hold. A tree that was pruned meanwhile is released now.
    pub fn unhold(&self, root: &Root) -> ObjectResult<()> {
        let mut state = self.lock();
        let removed = state
            .graph
            .unpin(self.store(), &self.inner.known_full, &root.hash)?;
        if !removed.is_empty() {
            debug!(root = %root, objects = removed.len(), "held tree released");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    pub fn stat(&self) -> ObjectResult<ContainerStat> {
        let state = self.lock();
        let mut stat = ContainerStat {
            feeds: state.feeds.len(),
            pending: state.graph.pending.len(),
            ..ContainerStat::default()
        };
        for feed in state.feeds.values() {
            stat.roots += feed.roots.len();
            stat.full_roots += feed
                .roots
                .values()
                .filter(|e| e.state == FillState::Full)
                .count();
        }
        stat.store = self.store().stat()?;
        Ok(stat)
    }

    /// Rewrite both journals as snapshots. A no-op in memory.
    pub fn compact(&self) -> ObjectResult<()> {
        let state = self.lock();
        if let Some(disk) = &self.inner.disk {
            disk.compact()?;
        }
        if let Some(log) = &self.inner.log {
            let history: History = state
                .feeds
                .iter()
                .map(|(pk, f)| {
                    let roots = f.roots.iter().map(|(s, e)| (*s, e.root.clone())).collect();
                    (*pk, roots)
                })
                .collect();
            log.compact(&history)?;
        }
        Ok(())
    }

    /// Flush everything to disk.
    pub fn close(&self) -> ObjectResult<()> {
        let _state = self.lock();
        self.store().close()?;
        if let Some(log) = &self.inner.log {
            log.sync()?;
        }
        debug!("container closed");
        Ok(())
    }
}

fn fill_state_of(w: &Walk) -> FillState {
    if w.is_full() {
        FillState::Full
    } else if w.present.is_empty() && w.skipped == 0 {
        FillState::Unfilled
    } else {
        FillState::Filling
    }
}

impl Loader for Container {
    fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    fn load_bytes(&self, key: &Hash) -> RegistryResult<Vec<u8>> {
        match self.store().get(key) {
            Ok(Some((val, _))) => Ok(val),
            Ok(None) => Err(RegistryError::Missing(*key)),
            Err(e) => {
                warn!(key = %key.short_hex(), error = %e, "store read failed");
                Err(RegistryError::Missing(*key))
            }
        }
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Container")
            .field("feeds", &state.feeds.len())
            .field("pending", &state.graph.pending.len())
            .field("persistent", &self.inner.log.is_some())
            .finish()
    }
}
