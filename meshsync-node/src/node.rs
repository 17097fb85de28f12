//! Mesh node: identity, link registry, replication.
//!
//! A [`MeshNode`] is a cheap handle onto a single event-loop task that owns
//! every piece of mutable state: the local identity, the link registry, the
//! shared variable store and the seen-event history. Caller operations are
//! sent to the loop as commands; transport work (bind, dial, per-link
//! receive) runs in helper tasks that post their results back into the same
//! loop. Nothing is ever mutated from two places at once, so no state is
//! behind a lock.
//!
//! Handshake, from the responder's side:
//!
//! ```text
//! Initiator                          Responder
//!    │                                  │
//!    │ ◀──────── sync-request {vars} ── │  on transport open
//!    │ merge                            │
//!    │ ── sync-answer {merged vars} ──▶ │
//!  Open                               merge
//!                                     Open
//! ```

use crate::error::{MeshError, MeshResult};
use crate::lifecycle::{
    Listener, ListenerRegistry, MeshNotification, SubscriptionId, SubscriptionIds,
};
use crate::link::{Link, LinkId, LinkInfo, LinkRole, LinkState};
use crate::protocol::{Envelope, EventMessage, SnapshotMessage, VarPair, VarUpdateMessage};
use crate::store::{SeenEvents, VarStore, DEFAULT_DEDUP_CAPACITY};
use crate::transport::{Binding, Connection, ConnectionEvent, MeshTransport};
use meshsync_types::{Identity, IdentityCodec, LogicalClock, NamespaceCodec};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for a mesh node.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Number of recent events remembered for duplicate suppression.
    pub dedup_capacity: usize,
    /// Relay values changed by a handshake merge to the node's other open
    /// links. The handshaking link itself never receives them.
    pub relay_handshake_merges: bool,
    /// Capacity of the caller command queue.
    pub command_buffer: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            relay_handshake_merges: true,
            command_buffer: 64,
        }
    }
}

type Reply<T> = oneshot::Sender<T>;
type ConnectReply = Reply<MeshResult<LinkInfo>>;
type QueryFn = Box<dyn FnOnce(&NodeCore) + Send>;

enum NodeCommand {
    Open {
        identity: Identity,
        reply: Reply<MeshResult<Identity>>,
    },
    Close {
        reply: Reply<()>,
    },
    Connect {
        remote: Identity,
        reply: ConnectReply,
    },
    Disconnect {
        remote: Identity,
        reply: Reply<()>,
    },
    SetVar {
        key: String,
        value: String,
        reply: Reply<MeshResult<()>>,
    },
    DispatchEvent {
        event_type: String,
        payload: String,
        reply: Reply<MeshResult<EventMessage>>,
    },
    Subscribe {
        listener: Listener<MeshNotification>,
        reply: Reply<SubscriptionId>,
    },
    SubscribeEvents {
        listener: Listener<EventMessage>,
        reply: Reply<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: Reply<bool>,
    },
    Query(QueryFn),
    Shutdown {
        reply: Reply<()>,
    },
}

/// Results of transport work, posted back into the event loop.
enum Internal {
    Bound {
        generation: u64,
        result: MeshResult<Binding>,
    },
    Incoming {
        generation: u64,
        connection: Connection,
    },
    Dialed {
        generation: u64,
        remote: Identity,
        result: MeshResult<Connection>,
    },
    Link {
        id: LinkId,
        event: ConnectionEvent,
    },
}

/// Handle to a mesh node.
///
/// Cloning the handle is cheap; all clones drive the same node. The node
/// stops when [`MeshNode::shutdown`] is called or every handle is dropped.
#[derive(Clone)]
pub struct MeshNode {
    commands: mpsc::Sender<NodeCommand>,
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}

impl MeshNode {
    /// Creates a node using the default [`NamespaceCodec`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn MeshTransport>, config: MeshConfig) -> Self {
        Self::with_codec(transport, Arc::new(NamespaceCodec::default()), config)
    }

    /// Creates a node with a custom identity codec.
    pub fn with_codec(
        transport: Arc<dyn MeshTransport>,
        codec: Arc<dyn IdentityCodec>,
        config: MeshConfig,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let core = NodeCore::new(transport, codec, config, internal_tx);
        tokio::spawn(core.run(command_rx, internal_rx));
        Self { commands }
    }

    async fn request<T: Send>(
        &self,
        build: impl FnOnce(Reply<T>) -> NodeCommand,
    ) -> MeshResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| MeshError::ChannelClosed)?;
        rx.await.map_err(|_| MeshError::ChannelClosed)
    }

    async fn query<T, F>(&self, f: F) -> MeshResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&NodeCore) -> T + Send + 'static,
    {
        self.request(|reply| {
            NodeCommand::Query(Box::new(move |core| {
                let _ = reply.send(f(core));
            }))
        })
        .await
    }

    // ── Identity ─────────────────────────────────────────────────

    /// Binds `identity` and starts accepting links.
    pub async fn open(&self, identity: &str) -> MeshResult<Identity> {
        let identity = Identity::new(identity)?;
        self.request(|reply| NodeCommand::Open { identity, reply }).await?
    }

    /// Binds a generated identity.
    pub async fn open_random(&self) -> MeshResult<Identity> {
        let identity = Identity::generate();
        self.request(|reply| NodeCommand::Open { identity, reply }).await?
    }

    pub async fn is_open(&self) -> bool {
        self.query(|core| core.local().is_some())
            .await
            .unwrap_or(false)
    }

    /// Closes every link and releases the identity. The variable store is
    /// kept.
    pub async fn close(&self) {
        let _ = self.request(|reply| NodeCommand::Close { reply }).await;
    }

    pub async fn my_identity(&self) -> Option<Identity> {
        self.query(|core| core.local().map(|(id, _)| id.clone()))
            .await
            .ok()
            .flatten()
    }

    /// Closes the node and stops its event loop. Later calls on any handle
    /// fail with `ChannelClosed` or return empty results.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| NodeCommand::Shutdown { reply }).await;
    }

    // ── Links ────────────────────────────────────────────────────

    /// Connects to `remote`, resolving once the link is open.
    pub async fn connect(&self, remote: &str) -> MeshResult<LinkInfo> {
        let remote = Identity::new(remote)?;
        self.request(|reply| NodeCommand::Connect { remote, reply }).await?
    }

    /// Closes every link to `remote`. No-op when there is none.
    pub async fn disconnect(&self, remote: &str) -> MeshResult<()> {
        let remote = Identity::new(remote)?;
        self.request(|reply| NodeCommand::Disconnect { remote, reply })
            .await
    }

    pub async fn is_linked(&self, remote: &str) -> bool {
        let remote = remote.to_string();
        self.query(move |core| core.open_link(&remote).is_some())
            .await
            .unwrap_or(false)
    }

    /// Remote identity of the `index`-th open link, in registration order.
    pub async fn link_at(&self, index: usize) -> Option<Identity> {
        self.query(move |core| core.links.get(index).map(|l| l.remote().clone()))
            .await
            .ok()
            .flatten()
    }

    pub async fn link_count(&self) -> usize {
        self.query(|core| core.links.len()).await.unwrap_or(0)
    }

    /// All open links, in registration order.
    pub async fn links(&self) -> Vec<LinkInfo> {
        self.query(|core| core.links.iter().map(Link::info).collect())
            .await
            .unwrap_or_default()
    }

    /// The open link to `remote`.
    pub async fn link(&self, remote: &str) -> MeshResult<LinkInfo> {
        let remote = Identity::new(remote)?;
        self.query(move |core| {
            core.open_link(remote.as_str())
                .map(Link::info)
                .ok_or(MeshError::NotConnected(remote))
        })
        .await?
    }

    /// The last event received over the open link to `remote`.
    pub async fn last_event_from(&self, remote: &str) -> MeshResult<Option<EventMessage>> {
        let remote = Identity::new(remote)?;
        self.query(move |core| {
            core.open_link(remote.as_str())
                .map(|l| l.last_event().cloned())
                .ok_or(MeshError::NotConnected(remote))
        })
        .await?
    }

    // ── Shared variables ─────────────────────────────────────────

    pub async fn get_var(&self, key: &str) -> Option<String> {
        let key = key.to_string();
        self.query(move |core| core.store.get(&key).map(str::to_string))
            .await
            .ok()
            .flatten()
    }

    /// All variables in key order.
    pub async fn vars(&self) -> Vec<VarPair> {
        self.query(|core| core.store.snapshot())
            .await
            .unwrap_or_default()
    }

    /// Sets a variable locally and floods it to every open link.
    pub async fn set_var(&self, key: &str, value: &str) -> MeshResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.request(|reply| NodeCommand::SetVar { key, value, reply }).await?
    }

    // ── Events ───────────────────────────────────────────────────

    /// Delivers an event locally and broadcasts it over the mesh.
    pub async fn dispatch_event(
        &self,
        event_type: &str,
        payload: &str,
    ) -> MeshResult<EventMessage> {
        let event_type = event_type.to_string();
        let payload = payload.to_string();
        self.request(|reply| NodeCommand::DispatchEvent {
            event_type,
            payload,
            reply,
        })
        .await?
    }

    /// The last event delivered on this node, local or remote.
    pub async fn last_event(&self) -> Option<EventMessage> {
        self.query(|core| core.last_event.clone())
            .await
            .ok()
            .flatten()
    }

    pub async fn last_event_type(&self) -> Option<String> {
        self.last_event().await.map(|e| e.event_type)
    }

    pub async fn last_event_payload(&self) -> Option<String> {
        self.last_event().await.map(|e| e.payload)
    }

    // ── Listeners ────────────────────────────────────────────────

    /// Registers a lifecycle listener.
    pub async fn subscribe<F>(&self, listener: F) -> MeshResult<SubscriptionId>
    where
        F: Fn(&MeshNotification) + Send + 'static,
    {
        let listener: Listener<MeshNotification> = Box::new(listener);
        self.request(|reply| NodeCommand::Subscribe { listener, reply })
            .await
    }

    /// Registers a shared-event listener.
    pub async fn subscribe_events<F>(&self, listener: F) -> MeshResult<SubscriptionId>
    where
        F: Fn(&EventMessage) + Send + 'static,
    {
        let listener: Listener<EventMessage> = Box::new(listener);
        self.request(|reply| NodeCommand::SubscribeEvents { listener, reply })
            .await
    }

    /// Removes a listener of either kind.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.request(|reply| NodeCommand::Unsubscribe { id, reply })
            .await
            .unwrap_or(false)
    }
}

enum NodeStatus {
    Closed,
    Opening {
        identity: Identity,
        reply: Reply<MeshResult<Identity>>,
    },
    Open {
        identity: Identity,
        transport_id: String,
        accept: JoinHandle<()>,
    },
}

/// How a link left the node.
enum LinkOutcome {
    ClosedLocally,
    ClosedRemotely,
    Failed(String),
}

struct NodeCore {
    transport: Arc<dyn MeshTransport>,
    codec: Arc<dyn IdentityCodec>,
    config: MeshConfig,
    internal_tx: mpsc::UnboundedSender<Internal>,
    /// Bumped on every open and close; results tagged with an older
    /// generation are stale.
    generation: u64,
    status: NodeStatus,
    /// Open links in registration order.
    links: Vec<Link>,
    /// Links still opening or handshaking.
    pending: BTreeMap<LinkId, Link>,
    forwarders: HashMap<LinkId, JoinHandle<()>>,
    /// Callers waiting for a link to open, by remote identity.
    connects: HashMap<Identity, Vec<ConnectReply>>,
    /// Remotes with a dial in flight.
    dialing: HashSet<Identity>,
    next_link: u64,
    store: VarStore,
    seen: SeenEvents,
    clock: LogicalClock,
    last_event: Option<EventMessage>,
    subscriptions: SubscriptionIds,
    mesh_listeners: ListenerRegistry<MeshNotification>,
    event_listeners: ListenerRegistry<EventMessage>,
}

impl NodeCore {
    fn new(
        transport: Arc<dyn MeshTransport>,
        codec: Arc<dyn IdentityCodec>,
        config: MeshConfig,
        internal_tx: mpsc::UnboundedSender<Internal>,
    ) -> Self {
        let seen = SeenEvents::new(config.dedup_capacity);
        Self {
            transport,
            codec,
            config,
            internal_tx,
            generation: 0,
            status: NodeStatus::Closed,
            links: Vec::new(),
            pending: BTreeMap::new(),
            forwarders: HashMap::new(),
            connects: HashMap::new(),
            dialing: HashSet::new(),
            next_link: 0,
            store: VarStore::new(),
            seen,
            clock: LogicalClock::new(),
            last_event: None,
            subscriptions: SubscriptionIds::default(),
            mesh_listeners: ListenerRegistry::new(),
            event_listeners: ListenerRegistry::new(),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<NodeCommand>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.close();
                        break;
                    };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some(event) = internal.recv() => self.handle_internal(event),
            }
        }
        debug!("mesh node event loop stopped");
    }

    /// Returns `false` when the loop should stop.
    fn handle_command(&mut self, command: NodeCommand) -> bool {
        match command {
            NodeCommand::Open { identity, reply } => self.open(identity, reply),
            NodeCommand::Close { reply } => {
                self.close();
                let _ = reply.send(());
            }
            NodeCommand::Connect { remote, reply } => self.connect(remote, reply),
            NodeCommand::Disconnect { remote, reply } => {
                self.disconnect(&remote);
                let _ = reply.send(());
            }
            NodeCommand::SetVar { key, value, reply } => {
                let _ = reply.send(self.set_var(key, value));
            }
            NodeCommand::DispatchEvent {
                event_type,
                payload,
                reply,
            } => {
                let _ = reply.send(self.dispatch_event(event_type, payload));
            }
            NodeCommand::Subscribe { listener, reply } => {
                let id = self.subscriptions.next_id();
                self.mesh_listeners.subscribe(id, listener);
                let _ = reply.send(id);
            }
            NodeCommand::SubscribeEvents { listener, reply } => {
                let id = self.subscriptions.next_id();
                self.event_listeners.subscribe(id, listener);
                let _ = reply.send(id);
            }
            NodeCommand::Unsubscribe { id, reply } => {
                let removed =
                    self.mesh_listeners.unsubscribe(id) | self.event_listeners.unsubscribe(id);
                let _ = reply.send(removed);
            }
            NodeCommand::Query(f) => f(self),
            NodeCommand::Shutdown { reply } => {
                self.close();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Bound { generation, result } => self.on_bound(generation, result),
            Internal::Incoming {
                generation,
                connection,
            } => self.on_incoming(generation, connection),
            Internal::Dialed {
                generation,
                remote,
                result,
            } => self.on_dialed(generation, remote, result),
            Internal::Link { id, event } => self.on_link_event(id, event),
        }
    }

    // ── Accessors ────────────────────────────────────────────────

    fn local(&self) -> Option<(&Identity, &str)> {
        match &self.status {
            NodeStatus::Open {
                identity,
                transport_id,
                ..
            } => Some((identity, transport_id.as_str())),
            _ => None,
        }
    }

    fn local_identity(&self) -> Option<Identity> {
        self.local().map(|(id, _)| id.clone())
    }

    fn open_link(&self, remote: &str) -> Option<&Link> {
        self.links.iter().find(|l| l.remote().as_str() == remote)
    }

    fn notify(&self, notification: MeshNotification) {
        self.mesh_listeners.notify(&notification);
    }

    fn notify_state(&self, info: LinkInfo) {
        self.notify(MeshNotification::LinkStateChanged {
            state: info.state,
            link: info,
        });
    }

    // ── Open / close ─────────────────────────────────────────────

    fn open(&mut self, identity: Identity, reply: Reply<MeshResult<Identity>>) {
        let reuse = match &self.status {
            NodeStatus::Opening { .. } => {
                let _ = reply.send(Err(MeshError::AlreadyOpening));
                return;
            }
            NodeStatus::Open {
                identity: current,
                transport_id,
                ..
            } => Some(*current == identity && self.transport.is_bound(transport_id)),
            NodeStatus::Closed => None,
        };
        match reuse {
            Some(true) => {
                debug!("already open as {identity}");
                let _ = reply.send(Ok(identity));
                return;
            }
            Some(false) => {
                info!("reopening mesh node as {identity}");
                self.close();
            }
            None => {}
        }

        self.generation += 1;
        let generation = self.generation;
        let transport_id = self.codec.encode(&identity);
        info!("opening mesh node as {identity} ({transport_id})");
        self.status = NodeStatus::Opening { identity, reply };

        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.bind(&transport_id).await;
            let _ = tx.send(Internal::Bound { generation, result });
        });
    }

    fn on_bound(&mut self, generation: u64, result: MeshResult<Binding>) {
        if generation != self.generation {
            if let Ok(binding) = result {
                self.transport.unbind(&binding.local);
            }
            return;
        }
        let (identity, reply) = match std::mem::replace(&mut self.status, NodeStatus::Closed) {
            NodeStatus::Opening { identity, reply } => (identity, reply),
            other => {
                self.status = other;
                return;
            }
        };

        match result {
            Ok(Binding {
                local,
                mut incoming,
            }) => {
                let tx = self.internal_tx.clone();
                let accept = tokio::spawn(async move {
                    while let Some(connection) = incoming.recv().await {
                        if tx
                            .send(Internal::Incoming {
                                generation,
                                connection,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                });
                info!("mesh node open as {identity}");
                self.status = NodeStatus::Open {
                    identity: identity.clone(),
                    transport_id: local,
                    accept,
                };
                self.notify(MeshNotification::Opened {
                    identity: identity.clone(),
                });
                let _ = reply.send(Ok(identity));
            }
            Err(e) => {
                warn!("failed to bind {identity}: {e}");
                let err = match e {
                    MeshError::TransportBindFailed(_) => e,
                    other => MeshError::TransportBindFailed(other.to_string()),
                };
                let _ = reply.send(Err(err));
            }
        }
    }

    fn close(&mut self) {
        self.generation += 1;

        let ids: Vec<LinkId> = self
            .links
            .iter()
            .map(Link::id)
            .chain(self.pending.keys().copied())
            .collect();
        for id in ids {
            self.remove_link(id, LinkOutcome::ClosedLocally);
        }
        self.dialing.clear();
        for (remote, replies) in self.connects.drain() {
            debug!("cancelling connect to {remote}");
            for reply in replies {
                let _ = reply.send(Err(MeshError::ClosedBeforeCompletion));
            }
        }

        match std::mem::replace(&mut self.status, NodeStatus::Closed) {
            NodeStatus::Closed => {}
            NodeStatus::Opening { identity, reply } => {
                info!("open of {identity} cancelled");
                let _ = reply.send(Err(MeshError::ClosedBeforeCompletion));
            }
            NodeStatus::Open {
                identity,
                transport_id,
                accept,
            } => {
                accept.abort();
                self.transport.unbind(&transport_id);
                info!("mesh node {identity} closed");
                self.notify(MeshNotification::Closed { identity });
            }
        }
    }

    // ── Connect / disconnect ─────────────────────────────────────

    fn connect(&mut self, remote: Identity, reply: ConnectReply) {
        let Some((local, local_tid)) = self.local() else {
            let _ = reply.send(Err(MeshError::InvalidArgument(
                "node is not open".into(),
            )));
            return;
        };
        if *local == remote {
            let _ = reply.send(Err(MeshError::InvalidArgument(
                "cannot connect to self".into(),
            )));
            return;
        }
        let local_tid = local_tid.to_string();

        if let Some(link) = self.open_link(remote.as_str()) {
            let _ = reply.send(Ok(link.info()));
            return;
        }
        if let Some(waiting) = self.connects.get_mut(&remote) {
            waiting.push(reply);
            return;
        }

        self.connects.insert(remote.clone(), vec![reply]);
        self.dialing.insert(remote.clone());
        info!("connecting to {remote}");
        self.notify(MeshNotification::LinkRequested {
            remote: remote.clone(),
            role: LinkRole::Initiator,
        });

        let generation = self.generation;
        let remote_tid = self.codec.encode(&remote);
        let transport = self.transport.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.dial(&local_tid, &remote_tid).await;
            let _ = tx.send(Internal::Dialed {
                generation,
                remote,
                result,
            });
        });
    }

    fn on_dialed(&mut self, generation: u64, remote: Identity, result: MeshResult<Connection>) {
        if generation != self.generation {
            if let Ok(connection) = result {
                connection.sink.close();
            }
            return;
        }
        self.dialing.remove(&remote);
        match result {
            Err(e) => {
                warn!("dial to {remote} failed: {e}");
                self.fail_connects(&remote, e);
            }
            Ok(connection) => {
                if !self.connects.contains_key(&remote) {
                    debug!("dial to {remote} no longer wanted");
                    connection.sink.close();
                    return;
                }
                self.adopt(remote, LinkRole::Initiator, connection);
            }
        }
    }

    fn on_incoming(&mut self, generation: u64, connection: Connection) {
        if generation != self.generation {
            connection.sink.close();
            return;
        }
        let remote = match self.codec.decode(&connection.remote) {
            Ok(remote) => remote,
            Err(e) => {
                warn!("rejecting inbound connection from {}: {e}", connection.remote);
                connection.sink.close();
                return;
            }
        };
        info!("inbound link request from {remote}");
        self.notify(MeshNotification::LinkRequested {
            remote: remote.clone(),
            role: LinkRole::Responder,
        });
        self.adopt(remote, LinkRole::Responder, connection);
    }

    /// Wraps a fresh connection into a pending link and starts forwarding
    /// its notifications into the event loop.
    fn adopt(&mut self, remote: Identity, role: LinkRole, connection: Connection) {
        self.next_link += 1;
        let id = LinkId::new(self.next_link);
        let Connection {
            sink, mut events, ..
        } = connection;

        let tx = self.internal_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(Internal::Link { id, event }).is_err() {
                    return;
                }
            }
            // Transport dropped its end without saying goodbye.
            let _ = tx.send(Internal::Link {
                id,
                event: ConnectionEvent::Closed,
            });
        });
        self.forwarders.insert(id, forwarder);

        let link = Link::new(id, remote, role, sink);
        debug!("link {id} to {} created as {role:?}", link.remote());
        self.notify_state(link.info());
        self.pending.insert(id, link);
    }

    fn disconnect(&mut self, remote: &Identity) {
        let ids: Vec<LinkId> = self
            .links
            .iter()
            .chain(self.pending.values())
            .filter(|l| l.remote() == remote)
            .map(Link::id)
            .collect();
        if ids.is_empty() && !self.connects.contains_key(remote) {
            debug!("disconnect: no link to {remote}");
            return;
        }
        self.dialing.remove(remote);
        for id in ids {
            self.remove_link(id, LinkOutcome::ClosedLocally);
        }
        self.fail_connects(remote, MeshError::ClosedBeforeCompletion);
    }

    fn resolve_connects(&mut self, remote: &Identity, info: &LinkInfo) {
        if let Some(replies) = self.connects.remove(remote) {
            for reply in replies {
                let _ = reply.send(Ok(info.clone()));
            }
        }
    }

    fn fail_connects(&mut self, remote: &Identity, err: MeshError) {
        if let Some(replies) = self.connects.remove(remote) {
            for reply in replies {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }

    // ── Link lifecycle ───────────────────────────────────────────

    fn on_link_event(&mut self, id: LinkId, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => self.on_link_opened(id),
            ConnectionEvent::Data(envelope) => self.on_envelope(id, envelope),
            ConnectionEvent::Closed => self.remove_link(id, LinkOutcome::ClosedRemotely),
            ConnectionEvent::Error(reason) => self.remove_link(id, LinkOutcome::Failed(reason)),
        }
    }

    fn on_link_opened(&mut self, id: LinkId) {
        let Some(link) = self.pending.get_mut(&id) else {
            debug!("open notification for unknown link {id}");
            return;
        };
        if link.state() != LinkState::Opening {
            return;
        }
        if let Err(e) = link.transition(LinkState::Handshaking) {
            warn!("link {id}: {e}");
            return;
        }
        let info = link.info();
        self.notify_state(info.clone());

        if info.role == LinkRole::Responder {
            let Some(sender) = self.local_identity() else {
                return;
            };
            let vars = self.store.snapshot();
            let count = vars.len();
            let request = Envelope::SyncRequest(SnapshotMessage {
                sender,
                time: self.clock.tick(),
                vars: vars.clone(),
            });
            let sent = match self.pending.get_mut(&id) {
                Some(link) => {
                    link.record_snapshot(vars);
                    link.send(&request)
                }
                None => return,
            };
            match sent {
                Ok(()) => debug!("sent sync-request with {count} vars on link {id}"),
                Err(e) => self.remove_link(
                    id,
                    LinkOutcome::Failed(format!("sync-request send failed: {e}")),
                ),
            }
        }
    }

    fn on_envelope(&mut self, id: LinkId, envelope: Envelope) {
        let Some(link) = self.pending.get(&id) else {
            if self.links.iter().any(|l| l.id() == id) {
                self.on_open_traffic(id, envelope);
            } else {
                debug!("{} for unknown link {id} dropped", envelope.kind());
            }
            return;
        };

        let role = link.role();
        if link.state() == LinkState::Opening {
            // Data before the open notification: the channel is evidently usable.
            self.on_link_opened(id);
        }

        match envelope {
            Envelope::SyncRequest(request) if role == LinkRole::Initiator => {
                self.on_sync_request(id, request)
            }
            Envelope::SyncAnswer(answer) if role == LinkRole::Responder => {
                self.on_sync_answer(id, answer)
            }
            envelope if envelope.is_handshake() => {
                warn!("unexpected {} on link {id} during handshake", envelope.kind());
            }
            envelope => {
                debug!("{} on handshaking link {id}, completing handshake", envelope.kind());
                self.promote(id);
                if self.links.iter().any(|l| l.id() == id) {
                    self.on_open_traffic(id, envelope);
                }
            }
        }
    }

    fn on_sync_request(&mut self, id: LinkId, request: SnapshotMessage) {
        debug!(
            "sync-request from {} with {} vars on link {id}",
            request.sender,
            request.vars.len()
        );
        self.merge_handshake(id, &request.sender, request.vars);

        let Some(sender) = self.local_identity() else {
            return;
        };
        let vars = self.store.snapshot();
        let answer = Envelope::SyncAnswer(SnapshotMessage {
            sender,
            time: self.clock.tick(),
            vars: vars.clone(),
        });
        let sent = match self.pending.get_mut(&id) {
            Some(link) => {
                link.record_snapshot(vars);
                link.send(&answer)
            }
            None => return,
        };
        match sent {
            Ok(()) => self.promote(id),
            Err(e) => self.remove_link(
                id,
                LinkOutcome::Failed(format!("sync-answer send failed: {e}")),
            ),
        }
    }

    fn on_sync_answer(&mut self, id: LinkId, answer: SnapshotMessage) {
        debug!(
            "sync-answer from {} with {} vars on link {id}",
            answer.sender,
            answer.vars.len()
        );
        self.merge_handshake(id, &answer.sender, answer.vars.clone());
        if let Some(link) = self.pending.get_mut(&id) {
            link.extend_snapshot(answer.vars);
        }
        self.promote(id);
    }

    /// Merges a handshake snapshot. Never floods back over `from`.
    fn merge_handshake(&mut self, from: LinkId, origin: &Identity, vars: Vec<VarPair>) {
        let changed = self.store.merge(vars);
        if changed.is_empty() {
            return;
        }
        debug!("handshake on link {from} changed {} vars", changed.len());
        for (key, value) in &changed {
            self.notify(MeshNotification::VarChanged {
                key: key.clone(),
                value: value.clone(),
                origin: Some(origin.clone()),
            });
        }

        if !self.config.relay_handshake_merges {
            return;
        }
        let Some(sender) = self.local_identity() else {
            return;
        };
        for (key, value) in changed {
            let update = Envelope::VarUpdate(VarUpdateMessage {
                sender: sender.clone(),
                time: self.clock.tick(),
                key,
                value,
            });
            self.broadcast(&update, Some(from));
        }
    }

    /// Moves a handshaking link into the registry.
    ///
    /// If an open link to the same remote already exists, exactly one
    /// survives: with equal roles the newer link wins; with different roles
    /// (both sides connected at once) the link started by the smaller
    /// identity wins, which both ends agree on.
    fn promote(&mut self, id: LinkId) {
        let Some(local) = self.local_identity() else {
            return;
        };
        let Some(link) = self.pending.get(&id) else {
            return;
        };

        if let Some(existing) = self.open_link(link.remote().as_str()) {
            let keep_new = existing.role() == link.role()
                || link.initiator(&local) < existing.initiator(&local);
            let existing_id = existing.id();
            if keep_new {
                info!(
                    "link {id} to {} replaces link {existing_id}",
                    link.remote()
                );
                self.remove_link(existing_id, LinkOutcome::ClosedLocally);
            } else {
                info!(
                    "dropping duplicate link {id} to {}, keeping {existing_id}",
                    link.remote()
                );
                self.remove_link(id, LinkOutcome::ClosedLocally);
                return;
            }
        }

        let Some(mut link) = self.pending.remove(&id) else {
            return;
        };
        if let Err(e) = link.transition(LinkState::Open) {
            let reason = e.to_string();
            self.pending.insert(id, link);
            self.remove_link(id, LinkOutcome::Failed(reason));
            return;
        }
        let info = link.info();
        self.links.push(link);
        info!("link {id} to {} open ({:?})", info.remote, info.role);

        self.notify_state(info.clone());
        self.notify(MeshNotification::LinkConnected { link: info.clone() });
        self.resolve_connects(&info.remote, &info);
        self.catch_up(id);
    }

    /// Sends a newly open link every variable its handshake did not cover.
    /// Writes made while the link was handshaking, and handshake merges from
    /// other links in that window, were not broadcast to it.
    fn catch_up(&mut self, id: LinkId) {
        let Some(sender) = self.local_identity() else {
            return;
        };
        let Some(link) = self.links.iter().find(|l| l.id() == id) else {
            return;
        };
        let missed: Vec<VarPair> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|pair| !link.covers(pair))
            .collect();
        if missed.is_empty() {
            return;
        }
        debug!("catching up link {id} on {} vars", missed.len());

        for (key, value) in missed {
            let update = Envelope::VarUpdate(VarUpdateMessage {
                sender: sender.clone(),
                time: self.clock.tick(),
                key,
                value,
            });
            let sent = match self.links.iter().find(|l| l.id() == id) {
                Some(link) => link.send(&update),
                None => return,
            };
            if let Err(e) = sent {
                self.remove_link(id, LinkOutcome::Failed(format!("catch-up send failed: {e}")));
                return;
            }
        }
    }

    /// Removes a link from wherever it is, closes its connection and
    /// reports the outcome.
    fn remove_link(&mut self, id: LinkId, outcome: LinkOutcome) {
        let (mut link, was_open) = if let Some(pos) = self.links.iter().position(|l| l.id() == id)
        {
            (self.links.remove(pos), true)
        } else if let Some(link) = self.pending.remove(&id) {
            (link, false)
        } else {
            return;
        };
        if let Some(forwarder) = self.forwarders.remove(&id) {
            forwarder.abort();
        }

        let terminal = match outcome {
            LinkOutcome::Failed(_) => LinkState::Error,
            LinkOutcome::ClosedLocally | LinkOutcome::ClosedRemotely => LinkState::Closed,
        };
        link.shut(terminal);
        let info = link.info();
        self.notify_state(info.clone());

        match &outcome {
            LinkOutcome::Failed(reason) => {
                warn!("link {id} to {} failed: {reason}", info.remote);
                self.notify(MeshNotification::LinkError {
                    link: info.clone(),
                    reason: reason.clone(),
                });
            }
            LinkOutcome::ClosedLocally => {
                info!("link {id} to {} closed", info.remote);
                self.notify(MeshNotification::LinkClosed { link: info.clone() });
            }
            LinkOutcome::ClosedRemotely => {
                info!("link {id} to {} closed by remote", info.remote);
                self.notify(MeshNotification::LinkClosed { link: info.clone() });
            }
        }

        if !was_open {
            self.settle_connects(&info.remote, outcome);
        }
    }

    /// Answers callers waiting on `remote` after a pending link to it went
    /// away. They keep waiting while a dial or another pending link could
    /// still open.
    fn settle_connects(&mut self, remote: &Identity, outcome: LinkOutcome) {
        if !self.connects.contains_key(remote) {
            return;
        }
        if let Some(info) = self.open_link(remote.as_str()).map(Link::info) {
            self.resolve_connects(remote, &info);
            return;
        }
        if self.dialing.contains(remote) || self.pending.values().any(|l| l.remote() == remote) {
            return;
        }
        let err = match outcome {
            LinkOutcome::ClosedLocally => MeshError::ClosedBeforeCompletion,
            LinkOutcome::ClosedRemotely => MeshError::HandshakeFailed(
                "closed by remote before handshake completed".into(),
            ),
            LinkOutcome::Failed(reason) => MeshError::HandshakeFailed(reason),
        };
        self.fail_connects(remote, err);
    }

    // ── Replication ──────────────────────────────────────────────

    fn on_open_traffic(&mut self, id: LinkId, envelope: Envelope) {
        match envelope {
            Envelope::VarUpdate(update) => self.on_var_update(id, update),
            Envelope::Event(event) => self.on_event(id, event),
            other => warn!("ignoring {} on open link {id}", other.kind()),
        }
    }

    fn on_var_update(&mut self, from: LinkId, update: VarUpdateMessage) {
        if self.store.get(&update.key) == Some(update.value.as_str()) {
            debug!("var {} unchanged, not relaying", update.key);
            return;
        }
        self.store.set(update.key.clone(), update.value.clone());
        debug!(
            "var {} = {:?} from {} via link {from}",
            update.key, update.value, update.sender
        );
        self.notify(MeshNotification::VarChanged {
            key: update.key.clone(),
            value: update.value.clone(),
            origin: Some(update.sender.clone()),
        });
        self.broadcast(&Envelope::VarUpdate(update), Some(from));
    }

    fn on_event(&mut self, from: LinkId, event: EventMessage) {
        if let Some(link) = self.links.iter_mut().find(|l| l.id() == from) {
            link.record_event(event.clone());
        }
        if !self.seen.record(event.key()) {
            debug!(
                "event ({}, {}) already seen, dropping",
                event.sender, event.time
            );
            return;
        }
        self.deliver(event.clone());
        self.broadcast(&Envelope::Event(event), Some(from));
    }

    fn set_var(&mut self, key: String, value: String) -> MeshResult<()> {
        if key.is_empty() {
            return Err(MeshError::InvalidArgument("key must not be empty".into()));
        }
        let origin = self.local_identity();
        if self.store.set(key.clone(), value.clone()) {
            self.notify(MeshNotification::VarChanged {
                key: key.clone(),
                value: value.clone(),
                origin: origin.clone(),
            });
        }
        if let Some(sender) = origin {
            let update = Envelope::VarUpdate(VarUpdateMessage {
                sender,
                time: self.clock.tick(),
                key,
                value,
            });
            self.broadcast(&update, None);
        }
        Ok(())
    }

    fn dispatch_event(&mut self, event_type: String, payload: String) -> MeshResult<EventMessage> {
        if event_type.is_empty() {
            return Err(MeshError::InvalidArgument(
                "event type must not be empty".into(),
            ));
        }
        let Some(sender) = self.local_identity() else {
            return Err(MeshError::InvalidArgument("node is not open".into()));
        };
        let event = EventMessage {
            sender,
            time: self.clock.tick(),
            event_type,
            payload,
        };
        self.seen.record(event.key());
        self.deliver(event.clone());
        self.broadcast(&Envelope::Event(event.clone()), None);
        Ok(event)
    }

    fn deliver(&mut self, event: EventMessage) {
        self.event_listeners.notify(&event);
        self.last_event = Some(event);
    }

    /// Sends to every open link except `except`. Links whose send fails are
    /// dropped; the failure is never reported to the writer.
    fn broadcast(&mut self, envelope: &Envelope, except: Option<LinkId>) {
        let failed: Vec<(LinkId, String)> = self
            .links
            .iter()
            .filter(|l| Some(l.id()) != except && l.is_open())
            .filter_map(|l| l.send(envelope).err().map(|e| (l.id(), e.to_string())))
            .collect();
        for (id, reason) in failed {
            self.remove_link(
                id,
                LinkOutcome::Failed(format!("relay of {} failed: {reason}", envelope.kind())),
            );
        }
    }
}
