//! # Node Runtime
//!
//! A [`Node`] ties the pieces together:
//!
//! - an [`Identity`] that satisfies the network's puzzle
//! - a listener plus the [`ConnectionAdapter`] for outbound dials
//! - the configured [`HandshakeProcessor`], run on every new connection
//! - the routing actor, fed by verified handshakes and discovery
//! - a service table keyed by [`ServiceId`], with discovery preinstalled
//! - the [`PendingRequests`] registry correlating replies to requests
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind(NodeConfig::default()).await?;
//! node.add_service(100, |env: MessageEnvelope| async move {
//!     Ok(Some(env.payload))
//! })?;
//! node.start()?;
//!
//! let peer = node.connect("203.0.113.7:4000").await?;
//! let reply = node.request(RequestContext::new(), peer, 100, b"hi".to_vec()).await?;
//! ```
//!
//! ## Per-Connection Tasks
//!
//! ```text
//! socket ─► reader ──reply──► PendingRequests (resolved inline)
//!              └────other───► dispatch worker ─┬─► lane(service 5)   ─► Service::handle ─► reply
//!                                              └─► lane(service 100) ─► Service::handle ─► reply
//! writer ◄── send queue ◄── ConnectionHandle (any task)
//! ```
//!
//! The reader never awaits a handler, so a handler that issues its own
//! request over the same connection still sees its reply. The dispatch
//! worker hands envelopes, in arrival order, to one lane per service; each
//! lane runs its handler one envelope at a time. A slow service therefore
//! never holds up discovery pings or other services on the same connection.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::discovery::{self, DiscoveryMessage, DiscoveryService, DISCOVERY_SERVICE_ID};
use crate::error::{DispatchError, HandshakeError, NodeError, TransportError};
use crate::handshake::{HandshakeProcessor, processor_for};
use crate::identity::{Identity, PeerId, PublicIdentity};
use crate::messages::{Frame, MessageEnvelope, OpcodeRegistry, ServiceId};
use crate::protocols::Service;
use crate::routing::{PeerRecord, Routing};
use crate::rpc::{PendingRequests, ReplyMatch, RequestContext};
use crate::transport::{
    ConnectionAdapter, ConnectionHandle, ConnectionId, ConnectionState, Dialer, FrameReader,
    Listener, RawConnection, TcpDialer,
};

/// Envelopes queued per connection for the dispatch worker, and per
/// service lane.
const DISPATCH_QUEUE_DEPTH: usize = 128;

struct NodeInner {
    identity: Arc<Identity>,
    config: NodeConfig,
    local_addr: SocketAddr,
    advertised_addr: String,
    adapter: ConnectionAdapter,
    handshake: Arc<dyn HandshakeProcessor>,
    routing: Routing,
    pending: PendingRequests,
    services: RwLock<HashMap<ServiceId, Arc<dyn Service>>>,
    discovery_codec: Arc<OpcodeRegistry<DiscoveryMessage>>,
    connections: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    listener: Mutex<Option<Listener>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

/// Cheap-to-clone handle to a running node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Generate an identity for `config.puzzle` and bind the listener.
    ///
    /// Identity generation runs on a blocking thread; at the default
    /// difficulties it takes a noticeable fraction of a second.
    pub async fn bind(config: NodeConfig) -> Result<Self, NodeError> {
        config.validate()?;
        let params = config.puzzle;
        let identity = tokio::task::spawn_blocking(move || Identity::generate(params))
            .await
            .map_err(|e| NodeError::Config(format!("identity generation task failed: {e}")))??;
        Self::bind_with_identity(config, identity).await
    }

    /// Bind with an externally supplied identity.
    pub async fn bind_with_identity(config: NodeConfig, identity: Identity) -> Result<Self, NodeError> {
        let dialer = Arc::new(TcpDialer::new(config.dial_timeout()));
        Self::bind_with(config, identity, dialer).await
    }

    /// Bind with an externally supplied identity and dialer.
    pub async fn bind_with(
        config: NodeConfig,
        identity: Identity,
        dialer: Arc<dyn Dialer>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        identity.public().check(&config.puzzle)?;

        let adapter = ConnectionAdapter::new(dialer);
        let listener = adapter.listen(&config.bind_addr).await?;
        let local_addr = listener.local_addr();
        let advertised_addr = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| local_addr.to_string());

        let identity = Arc::new(identity);
        let handshake = processor_for(
            config.handshake,
            identity.clone(),
            config.puzzle,
            Some(advertised_addr.clone()),
        );
        let routing = Routing::spawn(identity.id(), config.bucket_size);
        let discovery_codec = Arc::new(discovery::codec()?);

        let mut services: HashMap<ServiceId, Arc<dyn Service>> = HashMap::new();
        services.insert(
            DISCOVERY_SERVICE_ID,
            Arc::new(DiscoveryService::new(
                routing.clone(),
                discovery_codec.clone(),
                config.bucket_size,
            )),
        );

        info!(
            id = %identity.id().short(),
            addr = %local_addr,
            advertised = %advertised_addr,
            handshake = ?config.handshake,
            "node bound"
        );

        Ok(Self {
            inner: Arc::new(NodeInner {
                identity,
                config,
                local_addr,
                advertised_addr,
                adapter,
                handshake,
                routing,
                pending: PendingRequests::new(),
                services: RwLock::new(services),
                discovery_codec,
                connections: Mutex::new(HashMap::new()),
                listener: Mutex::new(Some(listener)),
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn id(&self) -> PeerId {
        self.inner.identity.id()
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn public_identity(&self) -> PublicIdentity {
        self.inner.identity.public()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The listen address announced to peers.
    pub fn advertised_addr(&self) -> &str {
        &self.inner.advertised_addr
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Snapshot of the routing table.
    pub async fn peers(&self) -> Vec<PeerRecord> {
        self.inner.routing.all_peers().await
    }

    /// State of the connection currently installed for `peer`, if any.
    ///
    /// `None` while a dial to `peer` is still in progress.
    pub fn connection_state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.inner.adapter.current(peer).map(|c| c.state())
    }

    /// Watch the state of the connection currently installed for `peer`.
    ///
    /// `None` while a dial to `peer` is still in progress.
    pub fn watch_connection(&self, peer: &PeerId) -> Option<watch::Receiver<ConnectionState>> {
        self.inner.adapter.current(peer).map(|c| c.subscribe())
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub(crate) fn routing(&self) -> &Routing {
        &self.inner.routing
    }

    pub(crate) fn discovery_codec(&self) -> &OpcodeRegistry<DiscoveryMessage> {
        &self.inner.discovery_codec
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.inner.shutdown
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Register `service` under `id`. Only allowed before [`Node::start`].
    pub fn add_service<S: Service>(&self, id: ServiceId, service: S) -> Result<(), NodeError> {
        if self.inner.started.load(Ordering::Acquire) {
            return Err(NodeError::Config("services must be added before start".into()));
        }
        if discovery::is_reserved(id) {
            return Err(NodeError::Config(format!("service id {id} is reserved")));
        }
        let mut services = self.inner.services.write().unwrap_or_else(|e| e.into_inner());
        if services.contains_key(&id) {
            return Err(NodeError::Config(format!("service id {id} already registered")));
        }
        services.insert(id, Arc::new(service));
        Ok(())
    }

    /// Start accepting connections and, if configured, refreshing stale buckets.
    pub fn start(&self) -> Result<(), NodeError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(NodeError::Shutdown);
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(NodeError::Config("node already started".into()));
        }
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| NodeError::Config("listener already taken".into()))?;

        tokio::spawn(self.clone().accept_loop(listener));
        if let Some(interval) = self.inner.config.refresh_interval() {
            self.spawn_bucket_refresh(interval);
        }
        Ok(())
    }

    /// Close every connection, fail outstanding requests, stop background tasks.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let connections: Vec<ConnectionHandle> = self
            .inner
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, c)| c)
            .collect();
        for conn in &connections {
            conn.close();
        }
        self.inner.pending.fail_all();
        self.inner.routing.quit().await;
        info!(id = %self.id().short(), closed = connections.len(), "node shut down");
    }

    async fn accept_loop(self, listener: Listener) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(raw) => {
                        let node = self.clone();
                        tokio::spawn(async move { node.handle_inbound(raw).await });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
        debug!(addr = %self.inner.local_addr, "accept loop stopped");
    }

    // ------------------------------------------------------------------------
    // Peers and connections
    // ------------------------------------------------------------------------

    /// Remember `addr` for `peer` without connecting.
    pub fn add_peer(&self, peer: PeerId, addr: impl Into<String>) {
        self.inner.adapter.add_peer_id(peer, addr);
    }

    /// Drop `peer` from the routing table and address book and close its connection.
    ///
    /// Waits for an in-flight dial to `peer` to finish so the connection it
    /// produces is closed too.
    pub async fn remove_peer(&self, peer: PeerId) {
        let mut slot = self.inner.adapter.acquire(peer).await;
        if let Some(conn) = slot.take() {
            conn.close();
        }
        drop(slot);
        self.inner.adapter.forget(&peer);
        self.inner.routing.remove(peer).await;
    }

    /// Dial `addr`, run the handshake and return the peer's id.
    ///
    /// Requires a handshake that establishes identities; with the no-op
    /// handshake use [`Node::add_peer`] instead.
    pub async fn connect(&self, addr: &str) -> Result<PeerId, NodeError> {
        self.ensure_running()?;
        let raw = self.inner.adapter.dial(addr).await?;
        let (handle, reader) = self.establish(raw, None).await?;
        let Some(peer) = handle.peer_id() else {
            handle.close();
            self.untrack(&handle);
            return Err(HandshakeError::Malformed("handshake did not establish a peer id").into());
        };
        self.inner.adapter.add_connection(peer, addr);

        let mut slot = self.inner.adapter.acquire(peer).await;
        if slot.as_ref().is_none_or(|c| c.is_closed()) {
            *slot = Some(handle.clone());
        }
        drop(slot);

        tokio::spawn(self.clone().run_connection(handle, reader));
        Ok(peer)
    }

    /// The connection to `peer`, dialing and handshaking if needed.
    ///
    /// Concurrent callers for the same peer share one dial.
    async fn connection_to(&self, peer: PeerId) -> Result<ConnectionHandle, NodeError> {
        self.ensure_running()?;
        if peer == self.id() {
            return Err(NodeError::NoRoute(peer));
        }

        let mut slot = self.inner.adapter.acquire(peer).await;
        if let Some(conn) = slot.as_ref()
            && !conn.is_closed()
        {
            return Ok(conn.clone());
        }

        let addr = match self.inner.adapter.address_of(&peer) {
            Some(addr) => addr,
            None => match self.inner.routing.lookup(peer).await {
                Some(record) => record.address,
                None => return Err(NodeError::NoRoute(peer)),
            },
        };

        trace!(peer = %peer.short(), addr = %addr, "dialing peer");
        let raw = self.inner.adapter.dial(&addr).await?;
        let (handle, reader) = self.establish(raw, Some(peer)).await?;
        *slot = Some(handle.clone());
        drop(slot);

        tokio::spawn(self.clone().run_connection(handle.clone(), reader));
        Ok(handle)
    }

    /// Handshake `raw` under the configured timeout and activate it.
    async fn establish(
        &self,
        mut raw: RawConnection,
        expected: Option<PeerId>,
    ) -> Result<(ConnectionHandle, FrameReader), NodeError> {
        raw.set_state(ConnectionState::Handshaking);
        let timeout = self.inner.config.handshake_timeout();
        let verified = match tokio::time::timeout(
            timeout,
            self.inner.handshake.process(&mut raw, expected),
        )
        .await
        {
            Ok(Ok(verified)) => verified,
            Ok(Err(e)) => {
                raw.set_state(ConnectionState::Closed);
                return Err(e.into());
            }
            Err(_) => {
                raw.set_state(ConnectionState::Closed);
                debug!(addr = %raw.remote_addr(), direction = ?raw.direction(), "handshake timed out");
                return Err(HandshakeError::Timeout.into());
            }
        };

        let (handle, reader) = self.inner.adapter.activate(raw, verified.peer_id);
        self.inner
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.id(), handle.clone());
        if self.inner.shutdown.is_cancelled() {
            handle.close();
            return Err(NodeError::Shutdown);
        }

        if verified.authenticated
            && let Some(peer) = verified.peer_id
        {
            let address = resolve_listen_addr(verified.listen_addr, handle.remote_addr());
            self.inner.adapter.add_connection(peer, address.clone());

            let node = self.clone();
            tokio::spawn(async move {
                let record = PeerRecord::new(peer, address);
                let outcome = node.inner.routing.insert_or_refresh(record, &node).await;
                trace!(peer = %peer.short(), outcome = ?outcome, "routing updated from handshake");
            });
        }

        Ok((handle, reader))
    }

    async fn handle_inbound(self, raw: RawConnection) {
        let addr = raw.remote_addr().to_string();
        let (handle, reader) = match self.establish(raw, None).await {
            Ok(established) => established,
            Err(e) => {
                debug!(addr = %addr, error = %e, "inbound connection rejected");
                return;
            }
        };

        // Install as the route to this peer unless a live one exists; a
        // duplicate stays open for whatever the remote sends over it.
        if let Some(peer) = handle.peer_id() {
            let node = self.clone();
            let conn = handle.clone();
            tokio::spawn(async move {
                let mut slot = node.inner.adapter.acquire(peer).await;
                if slot.as_ref().is_none_or(|c| c.is_closed()) {
                    *slot = Some(conn);
                }
            });
        }

        self.run_connection(handle, reader).await;
    }

    // ------------------------------------------------------------------------
    // Reading and dispatch
    // ------------------------------------------------------------------------

    async fn run_connection(self, handle: ConnectionHandle, mut reader: FrameReader) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);
        tokio::spawn(self.clone().dispatch_worker(handle.clone(), dispatch_rx));

        loop {
            match reader.next_frame().await {
                Ok(Frame::Envelope(envelope)) => {
                    self.on_envelope(&handle, envelope, &dispatch_tx).await;
                }
                Ok(_) => {
                    debug!(conn = %handle.id(), "handshake frame on active connection, closing");
                    break;
                }
                Err(TransportError::Closed) => break,
                Err(e) => {
                    debug!(conn = %handle.id(), error = %e, "read failed");
                    break;
                }
            }
        }

        handle.close();
        drop(dispatch_tx);
        self.untrack(&handle);
        let failed = self.inner.pending.fail_route(handle.id());
        debug!(
            conn = %handle.id(),
            peer = ?handle.peer_id().map(|p| p.short()),
            direction = ?handle.direction(),
            failed_requests = failed,
            "connection closed"
        );
    }

    async fn on_envelope(
        &self,
        handle: &ConnectionHandle,
        envelope: MessageEnvelope,
        dispatch_tx: &mpsc::Sender<MessageEnvelope>,
    ) {
        if let Err(bound) = handle.bind_peer(envelope.sender) {
            debug!(
                conn = %handle.id(),
                bound = %bound.short(),
                claimed = %envelope.sender.short(),
                "dropping envelope from unexpected sender"
            );
            return;
        }
        if envelope.recipient != self.id() {
            debug!(
                conn = %handle.id(),
                recipient = %envelope.recipient.short(),
                "dropping envelope addressed to another peer"
            );
            return;
        }

        if envelope.is_reply() {
            let nonce = envelope.nonce;
            match self.inner.pending.resolve(envelope) {
                ReplyMatch::Resolved => {}
                ReplyMatch::Unknown => {
                    debug!(conn = %handle.id(), nonce = ?nonce, "dropping late or unmatched reply");
                }
                ReplyMatch::WrongSender => {
                    debug!(conn = %handle.id(), nonce = ?nonce, "dropping reply from wrong peer");
                }
            }
            return;
        }

        if dispatch_tx.send(envelope).await.is_err() {
            trace!(conn = %handle.id(), "dispatch worker gone");
        }
    }

    async fn dispatch_worker(self, handle: ConnectionHandle, mut rx: mpsc::Receiver<MessageEnvelope>) {
        let mut lanes: HashMap<ServiceId, mpsc::Sender<MessageEnvelope>> = HashMap::new();
        while let Some(envelope) = rx.recv().await {
            let service_id = envelope.service;
            let lane = match lanes.get(&service_id) {
                Some(lane) => lane.clone(),
                None => {
                    let service = self
                        .inner
                        .services
                        .read()
                        .unwrap_or_else(|e| e.into_inner())
                        .get(&service_id)
                        .cloned();
                    let Some(service) = service else {
                        let e = DispatchError::UnknownService(service_id);
                        debug!(conn = %handle.id(), error = %e, "dropping envelope");
                        continue;
                    };
                    let (tx, lane_rx) = mpsc::channel(DISPATCH_QUEUE_DEPTH);
                    tokio::spawn(service_lane(handle.clone(), service, lane_rx));
                    lanes.insert(service_id, tx.clone());
                    tx
                }
            };
            if lane.send(envelope).await.is_err() {
                trace!(conn = %handle.id(), service = service_id, "service lane gone");
            }
        }
    }

    fn untrack(&self, handle: &ConnectionHandle) {
        self.inner
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle.id());
    }

    // ------------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------------

    /// Fire-and-forget. The sender field is stamped with the local id.
    pub async fn send(&self, mut envelope: MessageEnvelope) -> Result<(), NodeError> {
        envelope.sender = self.id();
        let conn = self.connection_to(envelope.recipient).await?;
        self.inner.adapter.send(&conn, &Frame::Envelope(envelope)).await?;
        Ok(())
    }

    /// Send `payload` to `recipient`'s `service` and wait for the reply.
    ///
    /// Resolves exactly once: with the reply, `RequestTimeout` when the
    /// context deadline (or the configured default) passes, `RequestCancelled`
    /// when the context is cancelled, or `ConnectionLost` when the route closes
    /// or no route to `recipient` can be established.
    pub async fn request(
        &self,
        ctx: RequestContext,
        recipient: PeerId,
        service: ServiceId,
        payload: Vec<u8>,
    ) -> Result<MessageEnvelope, NodeError> {
        let ctx = ctx.or_timeout(self.inner.config.request_timeout());
        let conn = match ctx.run(self.connection_to(recipient)).await {
            Ok(conn) => conn,
            Err(e @ (NodeError::RequestTimeout | NodeError::RequestCancelled | NodeError::Shutdown)) => {
                return Err(e);
            }
            Err(e) => {
                debug!(peer = %recipient.short(), error = %e, "no usable route for request");
                return Err(NodeError::ConnectionLost);
            }
        };

        let (nonce, mut rx) = self.inner.pending.register(conn.id(), recipient)?;
        if conn.is_closed() && self.inner.pending.remove(nonce) {
            return Err(NodeError::ConnectionLost);
        }

        let envelope = MessageEnvelope::request(self.id(), recipient, service, nonce, payload);
        if let Err(e) = conn.send_frame(&Frame::Envelope(envelope)).await
            && self.inner.pending.remove(nonce)
        {
            debug!(peer = %recipient.short(), error = %e, "request not sent");
            return Err(NodeError::ConnectionLost);
        }

        let waited = ctx
            .run(async {
                match (&mut rx).await {
                    Ok(result) => result,
                    Err(_) => Err(NodeError::ConnectionLost),
                }
            })
            .await;

        match waited {
            Err(e @ (NodeError::RequestTimeout | NodeError::RequestCancelled)) => {
                if self.inner.pending.remove(nonce) {
                    trace!(peer = %recipient.short(), nonce, error = %e, "request abandoned");
                    Err(e)
                } else {
                    // Resolved concurrently; that outcome wins.
                    rx.await.unwrap_or(Err(NodeError::ConnectionLost))
                }
            }
            other => other,
        }
    }

    fn ensure_running(&self) -> Result<(), NodeError> {
        if self.inner.shutdown.is_cancelled() {
            Err(NodeError::Shutdown)
        } else {
            Ok(())
        }
    }
}

/// Run `service` for each envelope of one service on one connection, in order.
async fn service_lane(
    handle: ConnectionHandle,
    service: Arc<dyn Service>,
    mut rx: mpsc::Receiver<MessageEnvelope>,
) {
    while let Some(envelope) = rx.recv().await {
        let reply_header = envelope.expects_reply().then(|| envelope.reply(Vec::new()));
        let service_id = envelope.service;
        match service.handle(envelope).await {
            Ok(Some(payload)) => {
                if let Some(mut reply) = reply_header {
                    reply.payload = payload;
                    if let Err(e) = handle.send_frame(&Frame::Envelope(reply)).await {
                        debug!(conn = %handle.id(), error = %e, "failed to send reply");
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(conn = %handle.id(), service = service_id, error = %e, "handler failed");
            }
        }
    }
}

/// The address to record for a peer that announced `announced` and was
/// seen connecting from `observed`.
///
/// A peer listening on an unspecified address announces `0.0.0.0:port`;
/// the observed source ip with the announced port is the best guess at
/// where it can be reached.
fn resolve_listen_addr(announced: Option<String>, observed: &str) -> String {
    let Some(announced) = announced else {
        return observed.to_string();
    };
    match (announced.parse::<SocketAddr>(), observed.parse::<SocketAddr>()) {
        (Ok(listen), Ok(seen)) if listen.ip().is_unspecified() => {
            SocketAddr::new(seen.ip(), listen.port()).to_string()
        }
        _ => announced,
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id())
            .field("local_addr", &self.inner.local_addr)
            .finish_non_exhaustive()
    }
}
