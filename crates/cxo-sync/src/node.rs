use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use cxo_crypto::PubKey;
use cxo_protocol::MsgCodec;
use cxo_skyobject::{Container, ContainerEvent, Root};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NodeConfig;
use crate::conn::{Conn, Control};
use crate::error::{SyncError, SyncResult};
use crate::transport::{local_pair, tcp_wire, Wire};

/// Summary of a live connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub remote: String,
    /// `true` if this node opened the connection.
    pub initiator: bool,
}

pub(crate) struct ConnHandle {
    pub(crate) info: ConnectionInfo,
    pub(crate) control: mpsc::Sender<Control>,
}

/// Which connection is filling the newest wanted Root of a feed.
#[derive(Clone, Copy, Debug)]
struct Claim {
    conn: Uuid,
    seq: u64,
}

pub(crate) struct Shared {
    pub(crate) container: Container,
    pub(crate) config: NodeConfig,
    pub(crate) codec: MsgCodec,
    conns: Mutex<HashMap<Uuid, ConnHandle>>,
    /// Feeds this node replicates from peers.
    subscriptions: RwLock<HashSet<PubKey>>,
    /// Connections known to carry a feed.
    feed_peers: Mutex<HashMap<PubKey, HashSet<Uuid>>>,
    claims: Mutex<HashMap<PubKey, Claim>>,
    pub(crate) shutdown: watch::Receiver<bool>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl Shared {
    /// Run `fut` as a node task; [`Node::close`] waits for it.
    pub(crate) fn spawn<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().expect("lock poisoned").spawn(fut);
    }

    pub(crate) fn is_subscribed(&self, feed: &PubKey) -> bool {
        self.subscriptions
            .read()
            .expect("lock poisoned")
            .contains(feed)
    }

    pub(crate) fn subscriptions(&self) -> Vec<PubKey> {
        self.subscriptions
            .read()
            .expect("lock poisoned")
            .iter()
            .copied()
            .collect()
    }

    pub(crate) fn register(&self, handle: ConnHandle) {
        self.conns
            .lock()
            .expect("lock poisoned")
            .insert(handle.info.id, handle);
    }

    /// Forget a finished connection.
    pub(crate) fn unregister(&self, id: Uuid) {
        self.conns.lock().expect("lock poisoned").remove(&id);
        let mut peers = self.feed_peers.lock().expect("lock poisoned");
        for set in peers.values_mut() {
            set.remove(&id);
        }
        peers.retain(|_, set| !set.is_empty());
    }

    pub(crate) fn add_feed_peer(&self, feed: PubKey, conn: Uuid) {
        self.feed_peers
            .lock()
            .expect("lock poisoned")
            .entry(feed)
            .or_default()
            .insert(conn);
    }

    pub(crate) fn remove_feed_peer(&self, feed: &PubKey, conn: Uuid) {
        if let Some(set) = self.feed_peers.lock().expect("lock poisoned").get_mut(feed) {
            set.remove(&conn);
        }
    }

    /// Claim the filling of `root` for `conn`. Fails if another connection
    /// already fills this or a newer Root of the feed.
    pub(crate) fn try_claim(&self, root: &Root, conn: Uuid) -> bool {
        let mut claims = self.claims.lock().expect("lock poisoned");
        match claims.get(&root.pub_key) {
            Some(c) if c.conn != conn && c.seq >= root.seq => false,
            _ => {
                claims.insert(root.pub_key, Claim { conn, seq: root.seq });
                true
            }
        }
    }

    pub(crate) fn release_claim(&self, root: &Root, conn: Uuid) {
        let mut claims = self.claims.lock().expect("lock poisoned");
        if let Some(c) = claims.get(&root.pub_key) {
            if c.conn == conn && c.seq == root.seq {
                claims.remove(&root.pub_key);
            }
        }
    }

    /// Hand a Root that `tried` could not fill to another connection of the
    /// same feed.
    pub(crate) async fn failover(&self, root: Root, tried: Vec<Uuid>) {
        let candidate = {
            let peers = self.feed_peers.lock().expect("lock poisoned");
            let found = peers
                .get(&root.pub_key)
                .and_then(|set| set.iter().find(|id| !tried.contains(id)).copied());
            found
        };
        let target = candidate.and_then(|id| {
            let conns = self.conns.lock().expect("lock poisoned");
            let control = conns.get(&id).map(|h| h.control.clone());
            control.map(|c| (id, c))
        });

        match target {
            Some((id, control)) => {
                self.claims
                    .lock()
                    .expect("lock poisoned")
                    .insert(root.pub_key, Claim { conn: id, seq: root.seq });
                info!(root = %root, to = %id, "failing over root");
                if control.send(Control::Fill { root, tried }).await.is_err() {
                    debug!(to = %id, "failover target went away");
                }
            }
            None => {
                let mut claims = self.claims.lock().expect("lock poisoned");
                if claims.get(&root.pub_key).is_some_and(|c| c.seq == root.seq) {
                    claims.remove(&root.pub_key);
                }
                warn!(root = %root, tried = tried.len(), "no peer left to fill root");
            }
        }
    }

    fn controls(&self) -> Vec<mpsc::Sender<Control>> {
        self.conns
            .lock()
            .expect("lock poisoned")
            .values()
            .map(|h| h.control.clone())
            .collect()
    }

    /// Send `make()` to every live connection.
    async fn broadcast(&self, make: impl Fn() -> Control) {
        for control in self.controls() {
            // A closing connection may already be gone.
            let _ = control.send(make()).await;
        }
    }
}

/// A replicating peer: a Container plus its connections.
///
/// Cheap to clone. Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct Node {
    shared: Arc<Shared>,
}

impl Node {
    pub fn new(container: Container, config: NodeConfig) -> SyncResult<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown) = watch::channel(false);
        let node = Self {
            shared: Arc::new(Shared {
                codec: MsgCodec::new(config.max_message_size),
                container,
                config,
                conns: Mutex::default(),
                subscriptions: RwLock::default(),
                feed_peers: Mutex::default(),
                claims: Mutex::default(),
                shutdown,
                shutdown_tx,
                tasks: Mutex::new(JoinSet::new()),
            }),
        };
        node.spawn_event_loop();
        Ok(node)
    }

    /// Listen, connect to the configured peers and subscribe to the
    /// configured feeds. Returns the bound address, if any.
    pub async fn start(&self) -> SyncResult<Option<SocketAddr>> {
        for feed in self.shared.config.feed_keys()? {
            self.subscribe(feed).await?;
        }
        let bound = match self.shared.config.listen {
            Some(addr) => Some(self.listen(addr).await?),
            None => None,
        };
        for addr in self.shared.config.peers.clone() {
            if let Err(e) = self.connect(addr).await {
                warn!(peer = %addr, error = %e, "could not connect to peer");
            }
        }
        Ok(bound)
    }

    pub fn container(&self) -> &Container {
        &self.shared.container
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// Forward newly full Roots to the connections whose peers subscribed.
    fn spawn_event_loop(&self) {
        let shared = self.shared.clone();
        let mut events = shared.container.subscribe_events();
        let mut shutdown = shared.shutdown.clone();
        self.shared.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    event = events.recv() => match event {
                        Ok(ContainerEvent::RootFilled(root)) => {
                            shared.broadcast(|| Control::Publish(root.clone())).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "container events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Accept TCP connections on `addr`. Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> SyncResult<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "listening");

        let node = self.clone();
        let mut shutdown = self.shared.shutdown.clone();
        self.shared.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "accepted connection");
                            let wire = node.wrap(stream);
                            node.spawn_connection(wire, false, None);
                        }
                        Err(e) => warn!(error = %e, "accept failed"),
                    },
                }
            }
        });
        Ok(local)
    }

    /// Connect to a TCP peer and complete the handshake.
    pub async fn connect(&self, addr: SocketAddr) -> SyncResult<Uuid> {
        let stream = TcpStream::connect(addr).await?;
        let wire = self.wrap(stream);
        self.attach(wire, true).await
    }

    /// Connect to another in-process node.
    pub async fn connect_local(&self, other: &Node) -> SyncResult<Uuid> {
        let (ours, theirs) = local_pair(self.shared.config.queue_capacity);
        other.spawn_connection(theirs, false, None);
        self.attach(ours, true).await
    }

    /// Run a connection over `wire`. Returns once the handshake is done.
    pub async fn attach(&self, wire: Wire, initiator: bool) -> SyncResult<Uuid> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let id = self.spawn_connection(wire, initiator, Some(ready_tx));
        match ready_rx.await {
            Ok(Ok(())) => Ok(id),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SyncError::Disconnected),
        }
    }

    fn wrap(&self, stream: TcpStream) -> Wire {
        tcp_wire(stream, self.shared.codec, self.shared.config.queue_capacity)
    }

    fn spawn_connection(
        &self,
        wire: Wire,
        initiator: bool,
        ready: Option<oneshot::Sender<SyncResult<()>>>,
    ) -> Uuid {
        let id = Uuid::now_v7();
        let conn = Conn::new(id, self.shared.clone(), wire, initiator);
        self.shared.spawn(conn.run(ready));
        id
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .shared
            .conns
            .lock()
            .expect("lock poisoned")
            .values()
            .map(|h| h.info.clone())
            .collect();
        list.sort_by_key(|c| c.id);
        list
    }

    fn control(&self, id: Uuid) -> SyncResult<mpsc::Sender<Control>> {
        self.shared
            .conns
            .lock()
            .expect("lock poisoned")
            .get(&id)
            .map(|h| h.control.clone())
            .ok_or(SyncError::ConnectionNotFound(id))
    }

    /// Close one connection.
    pub async fn disconnect(&self, id: Uuid) -> SyncResult<()> {
        self.control(id)?
            .send(Control::Close)
            .await
            .map_err(|_| SyncError::ConnectionNotFound(id))
    }

    /// Ask a peer which feeds it carries.
    pub async fn list_feeds(&self, id: Uuid) -> SyncResult<Vec<PubKey>> {
        let (tx, rx) = oneshot::channel();
        self.control(id)?
            .send(Control::ListFeeds(tx))
            .await
            .map_err(|_| SyncError::ConnectionNotFound(id))?;
        match tokio::time::timeout(self.shared.config.request_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SyncError::Disconnected),
            Err(_) => Err(SyncError::Timeout("feed list".into())),
        }
    }

    /// Connections currently known to carry `feed`.
    pub fn peers_of(&self, feed: &PubKey) -> Vec<Uuid> {
        self.shared
            .feed_peers
            .lock()
            .expect("lock poisoned")
            .get(feed)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Track `feed` and replicate it from every connected peer.
    pub async fn subscribe(&self, feed: PubKey) -> SyncResult<()> {
        self.shared.container.add_feed(feed)?;
        let added = self
            .shared
            .subscriptions
            .write()
            .expect("lock poisoned")
            .insert(feed);
        if added {
            info!(feed = %feed.short_hex(), "subscribed");
            self.shared.broadcast(|| Control::Subscribe(feed)).await;
        }
        Ok(())
    }

    /// Stop replicating `feed`. Its Roots stay in the Container.
    pub async fn unsubscribe(&self, feed: PubKey) -> SyncResult<()> {
        let removed = self
            .shared
            .subscriptions
            .write()
            .expect("lock poisoned")
            .remove(&feed);
        if removed {
            info!(feed = %feed.short_hex(), "unsubscribed");
            self.shared.broadcast(|| Control::Unsubscribe(feed)).await;
        }
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<PubKey> {
        let mut feeds = self.shared.subscriptions();
        feeds.sort();
        feeds
    }

    /// Stop every task and wait for them, then flush the Container.
    pub async fn close(&self) -> SyncResult<()> {
        let _ = self.shared.shutdown_tx.send(true);
        // Tasks may spawn more tasks while winding down.
        loop {
            let mut tasks = std::mem::take(&mut *self.shared.tasks.lock().expect("lock poisoned"));
            if tasks.is_empty() {
                break;
            }
            while tasks.join_next().await.is_some() {}
        }
        self.shared.container.close()?;
        info!("node closed");
        Ok(())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("connections", &self.shared.conns.lock().expect("lock poisoned").len())
            .field("subscriptions", &self.shared.subscriptions().len())
            .finish()
    }
}
