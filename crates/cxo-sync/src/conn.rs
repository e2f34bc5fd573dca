use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use cxo_crypto::PubKey;
use cxo_protocol::{Msg, ProtocolError, PROTOCOL_VERSION};
use cxo_skyobject::{FillState, ObjectError, Root};
use cxo_types::Hash;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::filler::Filler;
use crate::node::{ConnHandle, ConnectionInfo, Shared};
use crate::transport::Wire;

/// Instructions from the [`Node`](crate::Node) to a connection task.
#[derive(Debug)]
pub(crate) enum Control {
    Subscribe(PubKey),
    Unsubscribe(PubKey),
    /// Fill a Root another connection gave up on.
    Fill { root: Root, tried: Vec<Uuid> },
    /// Offer a newly full Root to the peer.
    Publish(Root),
    ListFeeds(oneshot::Sender<SyncResult<Vec<PubKey>>>),
    Close,
}

/// A request waiting for its `Data`.
#[derive(Debug)]
struct Inflight {
    /// Feeds whose fillers need the object.
    feeds: Vec<PubKey>,
    deadline: Instant,
    attempts: u32,
}

/// One peer connection. Owns everything per-connection; runs as one task.
pub(crate) struct Conn {
    id: Uuid,
    shared: Arc<Shared>,
    tx: mpsc::Sender<Msg>,
    rx: mpsc::Receiver<Msg>,
    remote: String,
    initiator: bool,
    /// Feeds the peer subscribed to here.
    remote_subs: HashSet<PubKey>,
    fillers: HashMap<PubKey, Filler>,
    inflight: HashMap<Hash, Inflight>,
    /// Roots sent to the peer and kept stored until it answers `RootDone`.
    held: HashMap<(PubKey, u64), Root>,
    list_waiters: VecDeque<oneshot::Sender<SyncResult<Vec<PubKey>>>>,
}

impl Conn {
    pub(crate) fn new(id: Uuid, shared: Arc<Shared>, wire: Wire, initiator: bool) -> Self {
        Self {
            id,
            shared,
            tx: wire.tx,
            rx: wire.rx,
            remote: wire.remote,
            initiator,
            remote_subs: HashSet::new(),
            fillers: HashMap::new(),
            inflight: HashMap::new(),
            held: HashMap::new(),
            list_waiters: VecDeque::new(),
        }
    }

    pub(crate) async fn run(mut self, ready: Option<oneshot::Sender<SyncResult<()>>>) {
        if let Err(e) = self.handshake().await {
            warn!(conn = %self.id, remote = %self.remote, error = %e, "handshake failed");
            if let Some(ready) = ready {
                let _ = ready.send(Err(e));
            }
            return;
        }

        let (control_tx, control_rx) = mpsc::channel(self.shared.config.queue_capacity);
        self.shared.register(ConnHandle {
            info: ConnectionInfo {
                id: self.id,
                remote: self.remote.clone(),
                initiator: self.initiator,
            },
            control: control_tx,
        });
        if let Some(ready) = ready {
            let _ = ready.send(Ok(()));
        }
        info!(conn = %self.id, remote = %self.remote, initiator = self.initiator, "connected");

        let result = self.serve(control_rx).await;
        self.cleanup().await;
        match result {
            Ok(()) => info!(conn = %self.id, "disconnected"),
            Err(e) => warn!(conn = %self.id, error = %e, "connection dropped"),
        }
    }

    async fn handshake(&mut self) -> SyncResult<()> {
        let timeout = self.shared.config.request_timeout();
        if self.initiator {
            self.send(Msg::Hello {
                version: PROTOCOL_VERSION,
            })
            .await?;
            match tokio::time::timeout(timeout, self.rx.recv()).await {
                Err(_) => Err(SyncError::Timeout("handshake".into())),
                Ok(None) => Err(SyncError::Disconnected),
                Ok(Some(Msg::Accept)) => Ok(()),
                Ok(Some(Msg::Reject { reason })) => Err(SyncError::Rejected(reason)),
                Ok(Some(other)) => Err(SyncError::Handshake(format!(
                    "expected Accept, got {}",
                    other.type_name()
                ))),
            }
        } else {
            match tokio::time::timeout(timeout, self.rx.recv()).await {
                Err(_) => Err(SyncError::Timeout("handshake".into())),
                Ok(None) => Err(SyncError::Disconnected),
                Ok(Some(Msg::Hello { version })) if version == PROTOCOL_VERSION => {
                    self.send(Msg::Accept).await
                }
                Ok(Some(Msg::Hello { version })) => {
                    self.send(Msg::Reject {
                        reason: format!("protocol version {version} not supported"),
                    })
                    .await?;
                    Err(ProtocolError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: version,
                    }
                    .into())
                }
                Ok(Some(other)) => Err(SyncError::Handshake(format!(
                    "expected Hello, got {}",
                    other.type_name()
                ))),
            }
        }
    }

    async fn serve(&mut self, mut control: mpsc::Receiver<Control>) -> SyncResult<()> {
        for feed in self.shared.subscriptions() {
            self.send(Msg::Subscribe { feed }).await?;
        }

        let mut shutdown = self.shared.shutdown.clone();
        let mut tick = tokio::time::interval(self.shared.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let result = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.on_message(msg).await,
                    None => return Ok(()),
                },
                cmd = control.recv() => match cmd {
                    Some(Control::Close) | None => return Ok(()),
                    Some(cmd) => self.on_control(cmd).await,
                },
                _ = tick.tick() => self.on_tick().await,
            };
            self.triage(result)?;
        }
    }

    /// Decide whether an error ends the connection.
    fn triage(&self, result: SyncResult<()>) -> SyncResult<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_protocol_violation() => {
                warn!(conn = %self.id, error = %e, "protocol violation");
                if self.shared.config.disconnect_on_violation {
                    Err(e)
                } else {
                    Ok(())
                }
            }
            Err(e @ (SyncError::Disconnected | SyncError::Timeout(_))) => Err(e),
            Err(e) => {
                warn!(conn = %self.id, error = %e, "connection error");
                Ok(())
            }
        }
    }

    /// Queue a message, waiting at most `enqueue_timeout` for room.
    async fn send(&self, msg: Msg) -> SyncResult<()> {
        trace!(conn = %self.id, kind = msg.type_name(), "send");
        self.tx
            .send_timeout(msg, self.shared.config.enqueue_timeout())
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => SyncError::Timeout("outgoing queue full".into()),
                SendTimeoutError::Closed(_) => SyncError::Disconnected,
            })
    }

    // -----------------------------------------------------------------------
    // Incoming messages
    // -----------------------------------------------------------------------

    async fn on_message(&mut self, msg: Msg) -> SyncResult<()> {
        trace!(conn = %self.id, kind = msg.type_name(), "recv");
        match msg {
            Msg::Ping => self.send(Msg::Pong).await,
            Msg::Pong => Ok(()),

            Msg::Subscribe { feed } => {
                if !self.shared.container.has_feed(&feed) {
                    return self.send(Msg::RejectSubscription { feed }).await;
                }
                self.send(Msg::AcceptSubscription { feed }).await?;
                self.remote_subs.insert(feed);
                debug!(conn = %self.id, feed = %feed.short_hex(), "peer subscribed");
                match self.shared.container.last_full_root(&feed) {
                    Some(root) => self.publish(root).await,
                    None => Ok(()),
                }
            }
            Msg::Unsubscribe { feed } => {
                self.remote_subs.remove(&feed);
                let keys: Vec<_> = self.held.keys().filter(|(f, _)| *f == feed).copied().collect();
                for key in keys {
                    self.release_held(key);
                }
                Ok(())
            }
            Msg::AcceptSubscription { feed } => {
                self.shared.add_feed_peer(feed, self.id);
                Ok(())
            }
            Msg::RejectSubscription { feed } => {
                debug!(conn = %self.id, feed = %feed.short_hex(), "peer does not carry feed");
                self.shared.remove_feed_peer(&feed, self.id);
                Ok(())
            }

            Msg::RequestListOfFeeds => {
                if self.shared.config.public {
                    let feeds = self.shared.container.feeds();
                    self.send(Msg::ListOfFeeds { feeds }).await
                } else {
                    self.send(Msg::NonPublicServer).await
                }
            }
            Msg::ListOfFeeds { feeds } => {
                self.answer_list(Ok(feeds));
                Ok(())
            }
            Msg::NonPublicServer => {
                self.answer_list(Err(SyncError::NonPublic));
                Ok(())
            }

            Msg::Root { root } => self.on_root(root).await,
            Msg::RootDone { feed, seq } => {
                self.release_held((feed, seq));
                Ok(())
            }

            Msg::Request { hash } => match self.shared.container.get(&hash)? {
                Some(bytes) => self.send(Msg::Data { hash, bytes }).await,
                None => self.send(Msg::DontHave { hash }).await,
            },
            Msg::Data { hash, bytes } => self.on_data(hash, bytes).await,
            Msg::DontHave { hash } => {
                if let Some(req) = self.inflight.remove(&hash) {
                    debug!(conn = %self.id, hash = %hash.short_hex(), "peer lacks object");
                    for feed in req.feeds {
                        self.fail(&feed);
                    }
                }
                self.advance().await
            }

            Msg::Hello { .. } | Msg::Accept | Msg::Reject { .. } => Err(SyncError::Violation(
                format!("{} after handshake", msg.type_name()),
            )),
        }
    }

    async fn on_root(&mut self, root: Root) -> SyncResult<()> {
        let feed = root.pub_key;
        let done = Msg::RootDone {
            feed,
            seq: root.seq,
        };
        if !self.shared.is_subscribed(&feed) {
            return self.send(done).await;
        }

        match self.shared.container.receive_root(root.clone()) {
            Ok(fresh) => {
                self.shared.add_feed_peer(feed, self.id);
                if self
                    .fillers
                    .get(&feed)
                    .is_some_and(|f| f.root.seq == root.seq)
                {
                    return Ok(());
                }
                let full = self.shared.container.fill_state(&feed, root.seq) == Some(FillState::Full);
                if (!fresh && full) || !self.shared.try_claim(&root, self.id) {
                    return self.send(done).await;
                }
                self.start_fill(root, Vec::new()).await
            }
            // Overtaken roots race with newer ones; refuse without dropping
            // the peer.
            Err(ObjectError::StaleRoot { .. }) => {
                self.shared.add_feed_peer(feed, self.id);
                self.send(done).await
            }
            Err(e) if e.is_protocol_violation() => Err(e.into()),
            Err(e) => {
                debug!(conn = %self.id, root = %root, error = %e, "root ignored");
                self.send(done).await
            }
        }
    }

    async fn on_data(&mut self, hash: Hash, bytes: Vec<u8>) -> SyncResult<()> {
        let Some(req) = self.inflight.remove(&hash) else {
            debug!(conn = %self.id, hash = %hash.short_hex(), "unsolicited data dropped");
            return Ok(());
        };
        match self.shared.container.insert_received(hash, &bytes) {
            Ok(children) => {
                for feed in &req.feeds {
                    if let Some(filler) = self.fillers.get_mut(feed) {
                        filler.want(children.iter().copied());
                    }
                }
            }
            Err(ObjectError::HashMismatch(h)) => return Err(SyncError::HashMismatch(h)),
            // Another connection stored it first, or its Root went away.
            Err(ObjectError::AlreadyHave(_) | ObjectError::Unwanted(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.advance().await
    }

    // -----------------------------------------------------------------------
    // Commands from the node
    // -----------------------------------------------------------------------

    async fn on_control(&mut self, cmd: Control) -> SyncResult<()> {
        match cmd {
            Control::Subscribe(feed) => self.send(Msg::Subscribe { feed }).await,
            Control::Unsubscribe(feed) => {
                self.shared.remove_feed_peer(&feed, self.id);
                if let Some(filler) = self.fillers.remove(&feed) {
                    self.shared.release_claim(&filler.root, self.id);
                    self.send_done(&filler.root).await?;
                }
                self.send(Msg::Unsubscribe { feed }).await
            }
            Control::Fill { root, tried } => {
                if !self.shared.is_subscribed(&root.pub_key) {
                    self.shared.release_claim(&root, self.id);
                    return Ok(());
                }
                self.start_fill(root, tried).await
            }
            Control::Publish(root) => {
                if self.remote_subs.contains(&root.pub_key) {
                    self.publish(root).await
                } else {
                    Ok(())
                }
            }
            Control::ListFeeds(reply) => {
                self.list_waiters.push_back(reply);
                self.send(Msg::RequestListOfFeeds).await
            }
            Control::Close => Ok(()),
        }
    }

    /// Send a full Root to the peer and hold its tree until `RootDone`.
    async fn publish(&mut self, root: Root) -> SyncResult<()> {
        let key = (root.pub_key, root.seq);
        if self.held.contains_key(&key) {
            return Ok(());
        }
        if !self.shared.container.hold(&root)? {
            debug!(conn = %self.id, root = %root, "root no longer stored");
            return Ok(());
        }
        self.held.insert(key, root.clone());
        self.send(Msg::Root { root }).await
    }

    fn release_held(&mut self, key: (PubKey, u64)) {
        if let Some(root) = self.held.remove(&key) {
            if let Err(e) = self.shared.container.unhold(&root) {
                warn!(conn = %self.id, root = %root, error = %e, "unhold failed");
            }
        }
    }

    fn answer_list(&mut self, result: SyncResult<Vec<PubKey>>) {
        match self.list_waiters.pop_front() {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => debug!(conn = %self.id, "unrequested feed list dropped"),
        }
    }

    // -----------------------------------------------------------------------
    // Filling
    // -----------------------------------------------------------------------

    async fn start_fill(&mut self, root: Root, tried: Vec<Uuid>) -> SyncResult<()> {
        let feed = root.pub_key;
        if let Some(old) = self.fillers.get(&feed) {
            if old.root.seq >= root.seq {
                return Ok(());
            }
        }
        if let Some(old) = self.fillers.remove(&feed) {
            debug!(conn = %self.id, old = %old.root, new = %root, "newer root replaces filler");
            self.shared.release_claim(&old.root, self.id);
            self.send_done(&old.root).await?;
        }

        let missing = self.shared.container.missing(&root)?;
        if missing.is_empty() {
            return self.finish(root).await;
        }
        self.shared.container.mark_filling(&root);
        debug!(conn = %self.id, root = %root, missing = missing.len(), "filling root");
        self.fillers.insert(feed, Filler::new(root, missing, tried));
        self.advance().await
    }

    /// Send requests up to the outstanding cap, then settle fillers that
    /// have nothing queued or in flight.
    async fn advance(&mut self) -> SyncResult<()> {
        loop {
            self.pump().await?;

            let idle: Vec<PubKey> = self
                .fillers
                .iter()
                .filter(|(feed, f)| {
                    !f.has_wants() && !self.inflight.values().any(|r| r.feeds.contains(*feed))
                })
                .map(|(feed, _)| *feed)
                .collect();
            if idle.is_empty() {
                return Ok(());
            }

            let mut requeued = false;
            for feed in idle {
                let Some(root) = self.fillers.get(&feed).map(|f| f.root.clone()) else {
                    continue;
                };
                if self.shared.container.fill_state(&feed, root.seq).is_none() {
                    debug!(conn = %self.id, root = %root, "root pruned while filling");
                    self.fillers.remove(&feed);
                    self.shared.release_claim(&root, self.id);
                    self.send_done(&root).await?;
                    continue;
                }
                let missing = self.shared.container.missing(&root)?;
                if missing.is_empty() {
                    self.fillers.remove(&feed);
                    self.finish(root).await?;
                } else if let Some(filler) = self.fillers.get_mut(&feed) {
                    filler.want(missing);
                    requeued = true;
                }
            }
            if !requeued {
                return Ok(());
            }
        }
    }

    async fn pump(&mut self) -> SyncResult<()> {
        let cap = self.shared.config.max_outstanding_requests;
        let deadline = Instant::now() + self.shared.config.request_timeout();
        let mut requests = Vec::new();

        'fillers: for (feed, filler) in self.fillers.iter_mut() {
            while self.inflight.len() < cap {
                let Some(hash) = filler.next() else {
                    continue 'fillers;
                };
                if let Some(req) = self.inflight.get_mut(&hash) {
                    if !req.feeds.contains(feed) {
                        req.feeds.push(*feed);
                    }
                    continue;
                }
                if self.shared.container.contains(&hash)? {
                    continue;
                }
                self.inflight.insert(
                    hash,
                    Inflight {
                        feeds: vec![*feed],
                        deadline,
                        attempts: 0,
                    },
                );
                requests.push(hash);
            }
            break;
        }

        for hash in requests {
            self.send(Msg::Request { hash }).await?;
        }
        Ok(())
    }

    async fn finish(&mut self, root: Root) -> SyncResult<()> {
        info!(conn = %self.id, root = %root, "root complete");
        self.shared.release_claim(&root, self.id);
        self.send_done(&root).await
    }

    async fn send_done(&self, root: &Root) -> SyncResult<()> {
        self.send(Msg::RootDone {
            feed: root.pub_key,
            seq: root.seq,
        })
        .await
    }

    /// Give up on a feed's filler here and hand its Root to another peer.
    fn fail(&mut self, feed: &PubKey) {
        let Some(filler) = self.fillers.remove(feed) else {
            return;
        };
        self.inflight.retain(|_, req| {
            req.feeds.retain(|f| f != feed);
            !req.feeds.is_empty()
        });
        // The peer may still hold the Root for us.
        let _ = self.tx.try_send(Msg::RootDone {
            feed: *feed,
            seq: filler.root.seq,
        });

        let mut tried = filler.tried;
        tried.push(self.id);
        warn!(conn = %self.id, root = %filler.root, "peer could not deliver root");
        let shared = self.shared.clone();
        let root = filler.root;
        self.shared.spawn(async move { shared.failover(root, tried).await });
    }

    async fn on_tick(&mut self) -> SyncResult<()> {
        let now = Instant::now();
        let expired: Vec<Hash> = self
            .inflight
            .iter()
            .filter(|(_, req)| req.deadline <= now)
            .map(|(hash, _)| *hash)
            .collect();
        if expired.is_empty() {
            return Ok(());
        }

        let retries = self.shared.config.max_retries;
        let deadline = now + self.shared.config.request_timeout();
        for hash in expired {
            let Some(req) = self.inflight.get_mut(&hash) else {
                continue;
            };
            if req.attempts < retries {
                req.attempts += 1;
                req.deadline = deadline;
                debug!(conn = %self.id, hash = %hash.short_hex(), attempt = req.attempts, "request retried");
                self.send(Msg::Request { hash }).await?;
            } else if let Some(req) = self.inflight.remove(&hash) {
                warn!(conn = %self.id, hash = %hash.short_hex(), "request timed out");
                for feed in req.feeds {
                    self.fail(&feed);
                }
            }
        }
        self.advance().await
    }

    async fn cleanup(&mut self) {
        self.shared.unregister(self.id);
        let keys: Vec<_> = self.held.keys().copied().collect();
        for key in keys {
            self.release_held(key);
        }
        while let Some(reply) = self.list_waiters.pop_front() {
            let _ = reply.send(Err(SyncError::Disconnected));
        }

        let closing = *self.shared.shutdown.borrow();
        for (_, filler) in self.fillers.drain() {
            if closing {
                self.shared.release_claim(&filler.root, self.id);
                continue;
            }
            let mut tried = filler.tried;
            tried.push(self.id);
            self.shared.failover(filler.root, tried).await;
        }
        self.inflight.clear();
    }
}
