//! # Node
//!
//! The [`Node`] is the top-level runtime entity of a network participant.
//! It owns the transport, the protocol registry, the discovery service and
//! the set of directly connected peers, and it drives the background loops
//! that tie them together:
//!
//! ```text
//! Created -> start() -> Running -> stop() -> Stopped
//! ```
//!
//! ## Background loops
//!
//! All loops run on one `TaskTracker` and observe one `CancellationToken`:
//!
//! - **dispatch**: drains the inbound queue through
//!   [`ProtocolManager::handle_message`]
//! - **transport events**: adds peers that dialed us, when
//!   `accept_inbound_peers` is set, and hands mDNS finds to discovery
//! - **discovery feed**: adds discovered peers. A peer that cannot be
//!   added is dropped from the discovered set so a later lookup can offer
//!   it again.
//!
//! The transport's swarm driver and the discovery loop run on their own
//! trackers but hang off the same token.
//!
//! `stop()` cancels the token before it touches the transport, so every
//! loop fails closed instead of reaching into torn-down state.
//!
//! ## Delivery
//!
//! `broadcast` reaches directly connected peers only. Nothing is relayed.
//! A failed or slow send to one peer is logged and never holds up the
//! others.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use libp2p::{Multiaddr, PeerId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::addr::{AddrError, PeerAddr};
use super::discovery::{DiscoveryConfig, DiscoveryError, DiscoveryService};
use super::message::{Message, ProtocolId};
use super::peer::{Peer, PeerContext, PeerError, PeerInfo};
use super::protocol::{MessageHandler, ProtocolError, ProtocolManager};
use super::transport::{Transport, TransportConfig, TransportError, TransportEvent};
use crate::config::{
    DEFAULT_P2P_PORT, INBOUND_QUEUE_CAPACITY, MAX_PEERS, NODE_PROTOCOL_ID, SEND_TIMEOUT,
    SHUTDOWN_TIMEOUT,
};
use crate::identity::NodeIdentity;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Multiaddrs to listen on. Port 0 picks a free port.
    pub listen_addresses: Vec<String>,
    /// Full peer addresses dialed at start, best-effort.
    pub bootstrap_peers: Vec<String>,
    pub max_peers: usize,
    /// Rendezvous tag of the network.
    pub protocol_id: String,
    pub version: String,
    /// Add peers that dial us and pass identify.
    pub accept_inbound_peers: bool,
    pub inbound_queue_capacity: usize,
    /// Upper bound on one send during broadcast.
    pub send_timeout: Duration,
    /// How long `stop()` waits for background tasks.
    pub shutdown_timeout: Duration,
    pub discovery: DiscoveryConfig,
    pub transport: TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec![format!("/ip4/0.0.0.0/tcp/{DEFAULT_P2P_PORT}")],
            bootstrap_peers: Vec::new(),
            max_peers: MAX_PEERS,
            protocol_id: NODE_PROTOCOL_ID.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            accept_inbound_peers: true,
            inbound_queue_capacity: INBOUND_QUEUE_CAPACITY,
            send_timeout: SEND_TIMEOUT,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
            discovery: DiscoveryConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Status & info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeStatus {
    Created,
    Running,
    Stopped,
}

/// Summary returned by [`Node::get_node_info`].
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub id: String,
    pub addresses: Vec<String>,
    pub peer_count: usize,
    pub protocol_id: String,
    pub version: String,
    pub protocols: Vec<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("peer limit of {max} reached")]
    MaxPeers { max: usize },

    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    #[error("refusing to connect to self")]
    SelfConnection,

    #[error("node already started")]
    AlreadyStarted,

    #[error("node is stopped")]
    Stopped,

    #[error("invalid listen address {0:?}")]
    InvalidListenAddress(String),

    #[error(transparent)]
    Address(#[from] AddrError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

pub struct Node {
    identity: NodeIdentity,
    config: NodeConfig,
    listen: Vec<Multiaddr>,
    status: RwLock<NodeStatus>,
    transport: Arc<Transport>,
    protocols: Arc<ProtocolManager>,
    discovery: Arc<DiscoveryService>,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    /// Ids with a connect in flight. Counted against `max_peers`.
    pending: Mutex<HashSet<PeerId>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Message>>>,
    peer_ctx: PeerContext,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.identity.peer_id())
            .field("status", &self.status())
            .field("peers", &self.peer_count())
            .finish()
    }
}

impl Node {
    /// Build a node. Nothing touches the network until [`start`](Self::start).
    ///
    /// Fails on a malformed listen address or protocol id.
    pub fn new(identity: NodeIdentity, config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        ProtocolId::parse(&config.protocol_id).map_err(ProtocolError::from)?;
        let listen = config
            .listen_addresses
            .iter()
            .map(|a| {
                a.parse::<Multiaddr>()
                    .map_err(|_| NodeError::InvalidListenAddress(a.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let shutdown = CancellationToken::new();
        let tasks = TaskTracker::new();

        let mut transport_config = config.transport.clone();
        transport_config.protocol_version = config.protocol_id.clone();
        transport_config.agent_version = format!("aporia-node/{}", config.version);
        transport_config.routing_enabled = config.discovery.routing_enabled;
        transport_config.local_enabled = config.discovery.local_enabled;
        transport_config.local_query_interval = config.discovery.local_query_interval;

        let transport = Arc::new(Transport::new(
            identity.clone(),
            transport_config,
            shutdown.child_token(),
        ));
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue_capacity.max(1));
        let protocols = ProtocolManager::new(Arc::clone(&transport), inbound_tx);

        let mut discovery_config = config.discovery.clone();
        discovery_config.rendezvous = config.protocol_id.clone();
        for peer in &config.bootstrap_peers {
            if !discovery_config.bootstrap_peers.contains(peer) {
                discovery_config.bootstrap_peers.push(peer.clone());
            }
        }
        let discovery =
            DiscoveryService::new(Arc::clone(&transport), discovery_config, shutdown.clone());

        let peer_ctx = PeerContext {
            transport: Arc::clone(&transport),
            protocols: Arc::clone(&protocols),
        };

        info!(node_id = %identity.peer_id(), protocol_id = %config.protocol_id, "creating node");

        Ok(Arc::new(Self {
            identity,
            config,
            listen,
            status: RwLock::new(NodeStatus::Created),
            transport,
            protocols,
            discovery,
            peers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            peer_ctx,
            shutdown,
            tasks,
        }))
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn local_peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Bound listen addresses. Empty until started.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.transport.listen_addrs()
    }

    /// Our own dialable record.
    pub fn local_addr(&self) -> PeerAddr {
        self.transport.local_addr()
    }

    pub fn protocols(&self) -> &Arc<ProtocolManager> {
        &self.protocols
    }

    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn has_peer(&self, peer: &PeerId) -> bool {
        self.peers.read().contains_key(peer)
    }

    /// Connected peers, sorted by id.
    pub fn get_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.read().values().map(|p| p.info()).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn get_node_info(&self) -> NodeInfo {
        NodeInfo {
            id: self.local_peer_id().to_string(),
            addresses: self.local_addr().full_addrs(),
            peer_count: self.peer_count(),
            protocol_id: self.config.protocol_id.clone(),
            version: self.config.version.clone(),
            protocols: self
                .protocols
                .protocols()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bring the node up:
    ///
    /// 1. start the transport and listen on every configured address
    ///    (failure is fatal)
    /// 2. dial bootstrap peers (failures are logged)
    /// 3. start discovery
    /// 4. spawn the background loops
    pub async fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        {
            let mut status = self.status.write();
            match *status {
                NodeStatus::Created => *status = NodeStatus::Running,
                NodeStatus::Running => return Err(NodeError::AlreadyStarted),
                NodeStatus::Stopped => return Err(NodeError::Stopped),
            }
        }
        info!(node_id = %self.local_peer_id(), "starting node");

        if let Err(e) = self.transport.start() {
            warn!(error = %e, "transport failed to start, aborting start");
            self.stop().await;
            return Err(e.into());
        }
        for addr in &self.listen {
            if let Err(e) = self.transport.listen(addr).await {
                warn!(%addr, error = %e, "listen failed, aborting start");
                self.stop().await;
                return Err(e.into());
            }
        }

        for raw in &self.config.bootstrap_peers {
            match self.connect(raw).await {
                Ok(peer) => info!(%peer, "connected to bootstrap peer"),
                Err(e) => warn!(addr = %raw, error = %e, "failed to connect to bootstrap peer"),
            }
        }

        self.discovery.start().await?;
        self.spawn_dispatch_loop();
        self.spawn_transport_event_loop();
        self.spawn_discovery_feed();

        info!(
            node_id = %self.local_peer_id(),
            addrs = ?self.local_addr().full_addrs(),
            "node started"
        );
        Ok(())
    }

    /// Shut down: cancel every loop, stop discovery, disconnect peers, wait
    /// for tasks to drain, then close the transport.
    pub async fn stop(&self) {
        {
            let mut status = self.status.write();
            if *status == NodeStatus::Stopped {
                return;
            }
            *status = NodeStatus::Stopped;
        }
        info!(node_id = %self.local_peer_id(), "stopping node");

        self.shutdown.cancel();
        self.discovery.stop().await;

        let peers: Vec<Arc<Peer>> = self.peers.write().drain().map(|(_, p)| p).collect();
        for peer in peers {
            peer.disconnect().await;
        }

        self.tasks.close();
        if tokio::time::timeout(self.config.shutdown_timeout, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(
                remaining = self.tasks.len(),
                "background tasks did not finish before shutdown timeout"
            );
        }

        self.transport.close().await;
        info!(node_id = %self.local_peer_id(), "node stopped");
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    /// Parse a full peer address and add the peer.
    pub async fn connect(&self, addr: &str) -> Result<PeerId, NodeError> {
        let peer: PeerAddr = addr.parse()?;
        let id = peer.peer_id;
        self.add_peer(peer).await?;
        Ok(id)
    }

    /// Connect to `addr` and add it to the peer set.
    ///
    /// Adding a peer that is already known, or already being connected, is
    /// a no-op. Connected plus in-flight peers never exceed `max_peers`.
    pub async fn add_peer(&self, addr: PeerAddr) -> Result<(), NodeError> {
        if self.status() == NodeStatus::Stopped {
            return Err(NodeError::Stopped);
        }
        let id = addr.peer_id;
        if id == self.local_peer_id() {
            return Err(NodeError::SelfConnection);
        }

        {
            let mut pending = self.pending.lock();
            let peers = self.peers.read();
            if peers.contains_key(&id) || pending.contains(&id) {
                return Ok(());
            }
            if peers.len() + pending.len() >= self.config.max_peers {
                debug!(peer = %id, max = self.config.max_peers, "peer limit reached, rejecting peer");
                return Err(NodeError::MaxPeers {
                    max: self.config.max_peers,
                });
            }
            pending.insert(id);
        }

        let peer = Peer::new(addr, self.peer_ctx.clone());
        let connected = peer.connect().await;

        let total = {
            let mut pending = self.pending.lock();
            pending.remove(&id);
            if connected.is_ok() {
                let mut peers = self.peers.write();
                peers.insert(id, Arc::clone(&peer));
            }
            self.peers.read().len()
        };

        match connected {
            Ok(()) => {
                info!(peer = %id, total_peers = total, "peer added");
                Ok(())
            }
            Err(e) => {
                warn!(peer = %id, error = %e, "failed to connect to peer");
                Err(e.into())
            }
        }
    }

    /// Disconnect and forget `peer`. Returns `false` if it was unknown.
    pub async fn remove_peer(&self, peer: &PeerId) -> bool {
        let removed = self.peers.write().remove(peer);
        let Some(removed) = removed else {
            return false;
        };
        removed.disconnect().await;
        self.discovery.remove_peer(peer);
        info!(peer = %peer, total_peers = self.peer_count(), "peer removed");
        true
    }

    // -----------------------------------------------------------------------
    // Messaging
    // -----------------------------------------------------------------------

    pub fn register_handler(
        &self,
        protocol: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ProtocolId, NodeError> {
        Ok(self.protocols.register_protocol(protocol, handler)?)
    }

    /// Send `message` to one connected peer.
    pub async fn send_message(&self, peer: &PeerId, message: Message) -> Result<(), NodeError> {
        let target = self
            .peers
            .read()
            .get(peer)
            .cloned()
            .ok_or(NodeError::UnknownPeer(*peer))?;
        let message = self.stamp(message);
        target.send_message(&message).await?;
        Ok(())
    }

    /// Send `message` to every connected peer concurrently. Returns how many
    /// peers accepted it.
    pub async fn broadcast(&self, message: Message) -> usize {
        let message = self.stamp(message);
        let targets: Vec<Arc<Peer>> = self
            .peers
            .read()
            .values()
            .filter(|p| p.is_connected())
            .cloned()
            .collect();
        if targets.is_empty() {
            return 0;
        }

        let timeout = self.config.send_timeout;
        let sends = targets.iter().map(|peer| {
            let message = &message;
            async move {
                match tokio::time::timeout(timeout, peer.send_message(message)).await {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        warn!(peer = %peer.id(), protocol = %message.protocol, error = %e, "broadcast send failed");
                        false
                    }
                    Err(_) => {
                        warn!(peer = %peer.id(), protocol = %message.protocol, "broadcast send timed out");
                        false
                    }
                }
            }
        });
        let reached = join_all(sends).await.into_iter().filter(|ok| *ok).count();
        debug!(protocol = %message.protocol, reached, total = targets.len(), "broadcast complete");
        reached
    }

    fn stamp(&self, mut message: Message) -> Message {
        message.from = self.local_peer_id().to_string();
        message.timestamp = Utc::now();
        message
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    fn spawn_dispatch_loop(&self) {
        let Some(mut inbound) = self.inbound_rx.lock().take() else {
            return;
        };
        let protocols = Arc::clone(&self.protocols);
        let cancel = self.shutdown.clone();

        self.tasks.spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = inbound.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                match protocols.handle_message(&message) {
                    Ok(()) => {}
                    Err(ProtocolError::NoHandler(protocol)) => {
                        debug!(%protocol, from = %message.from, "no handler for inbound message");
                    }
                    Err(e) => warn!(from = %message.from, error = %e, "handler failed"),
                }
            }
            debug!("dispatch loop stopped");
        });
    }

    fn spawn_transport_event_loop(self: &Arc<Self>) {
        let Some(mut events) = self.transport.take_events() else {
            return;
        };
        let weak: Weak<Node> = Arc::downgrade(self);
        let cancel = self.shutdown.clone();
        let tasks = self.tasks.clone();

        self.tasks.spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(node) = weak.upgrade() else {
                    break;
                };
                let peer = match event {
                    TransportEvent::InboundPeer(peer) => peer,
                    TransportEvent::LocalPeer(peer) => {
                        node.discovery.handle_local_peer(peer);
                        continue;
                    }
                };
                if !node.config.accept_inbound_peers || !peer.is_dialable() {
                    continue;
                }
                if node.has_peer(&peer.peer_id) {
                    continue;
                }
                tasks.spawn(async move {
                    let id = peer.peer_id;
                    if let Err(e) = node.add_peer(peer).await {
                        debug!(peer = %id, error = %e, "inbound peer not added");
                    }
                });
            }
            debug!("transport event loop stopped");
        });
    }

    fn spawn_discovery_feed(self: &Arc<Self>) {
        let Some(mut found) = self.discovery.take_notifications() else {
            return;
        };
        let weak: Weak<Node> = Arc::downgrade(self);
        let cancel = self.shutdown.clone();
        let tasks = self.tasks.clone();

        self.tasks.spawn(async move {
            loop {
                let peer = tokio::select! {
                    _ = cancel.cancelled() => break,
                    peer = found.recv() => peer,
                };
                let (Some(peer), Some(node)) = (peer, weak.upgrade()) else {
                    break;
                };
                if node.has_peer(&peer.peer_id) {
                    continue;
                }
                tasks.spawn(async move {
                    let id = peer.peer_id;
                    if let Err(e) = node.add_peer(peer).await {
                        // Forgotten so the next lookup can offer it again.
                        node.discovery.remove_peer(&id);
                        if matches!(e, NodeError::MaxPeers { .. }) {
                            debug!(peer = %id, error = %e, "discovered peer not added");
                        } else {
                            warn!(peer = %id, error = %e, "discovered peer not added");
                        }
                    }
                });
            }
            debug!("discovery feed stopped");
        });
    }
}
