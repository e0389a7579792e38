//! # Transport
//!
//! A libp2p swarm over TCP, secured with noise and multiplexed with yamux.
//! Noise binds every connection to the remote's peer id, so a dial that
//! reaches the wrong node fails before any message moves.
//!
//! ## Behaviours
//!
//! | Behaviour   | Protocol                         | Role                                   |
//! |-------------|----------------------------------|----------------------------------------|
//! | identify    | `/ipfs/id/1.0.0`                 | listen addresses, network check        |
//! | kademlia    | [`PROTOCOL_ROUTING`]             | rendezvous routing table (optional)    |
//! | mdns        | multicast DNS                    | local subnet discovery (optional)      |
//! | messaging   | [`PROTOCOL_MESSAGING`]           | one [`Message`] out, one [`Ack`] back  |
//!
//! ## Design
//!
//! A single driver task owns the [`Swarm`]. [`Transport`] is a cheap handle
//! that talks to the driver over a command queue and reads shared snapshots
//! (listen addresses, connected peers, routing table size) without a round
//! trip.
//!
//! Dials try every known address of a peer concurrently and resolve on the
//! first connection that completes the noise handshake. Messages for a peer
//! that is not yet connected wait for that connection instead of racing
//! it.
//!
//! Inbound messages are stamped with the authenticated sender and handed to
//! the acceptor registered for their protocol. The remote's ack is sent only
//! once the acceptor took the message, so a sender that waits for each ack
//! gets its messages delivered in order.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{AsyncRead, AsyncWrite, StreamExt};
use libp2p::core::transport::ListenerId;
use libp2p::identity::Keypair;
use libp2p::kad::store::MemoryStore;
use libp2p::request_response::{self, OutboundRequestId, ProtocolSupport, ResponseChannel};
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{DialError, NetworkBehaviour, SwarmEvent};
use libp2p::{identify, kad, mdns, noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use super::addr::{socket_addr, PeerAddr};
use super::message::{read_frame, write_frame, Message, ProtocolId, WireError};
use crate::config::{
    DIAL_TIMEOUT, IDLE_CONNECTION_TIMEOUT, LOCAL_QUERY_INTERVAL, NODE_PROTOCOL_ID,
    PROTOCOL_MESSAGING, PROTOCOL_ROUTING, REQUEST_TIMEOUT, ROUTING_QUERY_TIMEOUT,
    TRANSPORT_COMMAND_CAPACITY, TRANSPORT_EVENT_CAPACITY,
};
use crate::identity::NodeIdentity;

/// Queue receiving every accepted inbound message of one protocol.
pub type StreamAcceptor = mpsc::Sender<Message>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound on [`Transport::connect`].
    pub dial_timeout: Duration,
    /// Upper bound on one message exchange once connected.
    pub request_timeout: Duration,
    /// Connections without traffic in flight close after this long.
    pub idle_timeout: Duration,
    pub event_capacity: usize,
    pub command_capacity: usize,
    /// Identify protocol version. Peers announcing another one are dropped.
    pub protocol_version: String,
    pub agent_version: String,
    /// Run the Kademlia behaviour.
    pub routing_enabled: bool,
    pub routing_query_timeout: Duration,
    /// Run mDNS on the local subnet.
    pub local_enabled: bool,
    pub local_query_interval: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DIAL_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            idle_timeout: IDLE_CONNECTION_TIMEOUT,
            event_capacity: TRANSPORT_EVENT_CAPACITY,
            command_capacity: TRANSPORT_COMMAND_CAPACITY,
            protocol_version: NODE_PROTOCOL_ID.to_string(),
            agent_version: format!("aporia-node/{}", env!("CARGO_PKG_VERSION")),
            routing_enabled: false,
            routing_query_timeout: ROUTING_QUERY_TIMEOUT,
            local_enabled: false,
            local_query_interval: LOCAL_QUERY_INTERVAL,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unsupported listen address {0}")]
    UnsupportedAddress(Multiaddr),

    #[error("peer {0} has no dialable address")]
    NoDialableAddress(PeerId),

    #[error("dial to {0} timed out")]
    DialTimeout(PeerId),

    #[error("expected peer {expected}, reached {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },

    #[error("dial to {peer} failed: {reason}")]
    Dial { peer: PeerId, reason: String },

    #[error("request to {peer} failed: {reason}")]
    Request { peer: PeerId, reason: String },

    #[error("peer refused protocol {protocol}: {reason}")]
    Rejected { protocol: ProtocolId, reason: String },

    #[error("rendezvous routing is disabled")]
    RoutingDisabled,

    #[error("routing: {0}")]
    Routing(String),

    #[error("failed to build swarm: {0}")]
    Build(String),

    #[error("transport not started")]
    NotStarted,

    #[error("transport is shut down")]
    Shutdown,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("I/O: {0}")]
    Io(#[from] io::Error),
}

fn dial_error(peer: PeerId, err: &DialError) -> TransportError {
    match err {
        DialError::NoAddresses => TransportError::NoDialableAddress(peer),
        DialError::WrongPeerId { obtained, .. } => TransportError::PeerIdMismatch {
            expected: peer,
            actual: *obtained,
        },
        other => TransportError::Dial {
            peer,
            reason: other.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Wire
// ---------------------------------------------------------------------------

/// The receiver's answer to one [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Ack {
    fn accepted() -> Self {
        Self {
            accepted: true,
            reason: None,
        }
    }

    fn refused(reason: impl Into<String>) -> Self {
        Self {
            accepted: false,
            reason: Some(reason.into()),
        }
    }
}

/// Request-response codec: one length-prefixed JSON frame each way.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageCodec;

#[async_trait]
impl request_response::Codec for MessageCodec {
    type Protocol = StreamProtocol;
    type Request = Message;
    type Response = Ack;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Message>
    where
        T: AsyncRead + Unpin + Send,
    {
        let frame = read_frame(io).await?;
        Ok(Message::decode(&frame)?)
    }

    async fn read_response<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Ack>
    where
        T: AsyncRead + Unpin + Send,
    {
        let frame = read_frame(io).await?;
        Ok(serde_json::from_slice(&frame)?)
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        message: Message,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let body = message.encode()?;
        Ok(write_frame(io, &body).await?)
    }

    async fn write_response<T>(&mut self, _: &StreamProtocol, io: &mut T, ack: Ack) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        let body = serde_json::to_vec(&ack)?;
        Ok(write_frame(io, &body).await?)
    }
}

// ---------------------------------------------------------------------------
// Behaviour
// ---------------------------------------------------------------------------

#[derive(NetworkBehaviour)]
struct Behaviour {
    identify: identify::Behaviour,
    kademlia: Toggle<kad::Behaviour<MemoryStore>>,
    mdns: Toggle<mdns::tokio::Behaviour>,
    messaging: request_response::Behaviour<MessageCodec>,
}

impl Behaviour {
    fn new(key: &Keypair, config: &TransportConfig) -> Self {
        let local_id = key.public().to_peer_id();

        let identify = identify::Behaviour::new(
            identify::Config::new(config.protocol_version.clone(), key.public())
                .with_agent_version(config.agent_version.clone()),
        );

        let kademlia = config.routing_enabled.then(|| {
            let mut cfg = kad::Config::default();
            cfg.set_protocol_names(vec![StreamProtocol::new(PROTOCOL_ROUTING)]);
            cfg.set_query_timeout(config.routing_query_timeout);
            let mut kad = kad::Behaviour::with_config(local_id, MemoryStore::new(local_id), cfg);
            kad.set_mode(Some(kad::Mode::Server));
            kad
        });

        // A host without multicast still runs; it just finds no local peers.
        let mdns = if config.local_enabled {
            let cfg = mdns::Config {
                query_interval: config.local_query_interval,
                ..Default::default()
            };
            match mdns::tokio::Behaviour::new(cfg, local_id) {
                Ok(mdns) => Some(mdns),
                Err(e) => {
                    warn!(error = %e, "local discovery unavailable");
                    None
                }
            }
        } else {
            None
        };

        let messaging = request_response::Behaviour::with_codec(
            MessageCodec,
            [(StreamProtocol::new(PROTOCOL_MESSAGING), ProtocolSupport::Full)],
            request_response::Config::default().with_request_timeout(config.request_timeout),
        );

        Self {
            identify,
            kademlia: kademlia.into(),
            mdns: mdns.into(),
            messaging,
        }
    }
}

// ---------------------------------------------------------------------------
// Events & commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A remote node dialed us and identified itself.
    InboundPeer(PeerAddr),
    /// mDNS found a node on the local subnet.
    LocalPeer(PeerAddr),
}

type Reply<T> = oneshot::Sender<Result<T, TransportError>>;

enum Command {
    Listen {
        addr: Multiaddr,
        reply: Reply<Multiaddr>,
    },
    Connect {
        peer: PeerAddr,
        reply: Reply<()>,
    },
    Send {
        peer: PeerAddr,
        message: Message,
        reply: Reply<Ack>,
    },
    Respond {
        channel: ResponseChannel<Ack>,
        ack: Ack,
    },
    Disconnect {
        peer: PeerId,
    },
    AddRoutingPeers {
        peers: Vec<PeerAddr>,
        reply: Reply<()>,
    },
    Provide {
        key: kad::RecordKey,
        reply: Reply<()>,
    },
    StopProviding {
        key: kad::RecordKey,
    },
    FindProviders {
        key: kad::RecordKey,
        reply: Reply<Vec<PeerAddr>>,
    },
    RefreshRouting {
        reply: Reply<()>,
    },
}

/// Work parked until a connection to the peer exists.
enum Waiter {
    Connect(Reply<()>),
    Send(Message, Reply<Ack>),
}

impl Waiter {
    fn fail(self, err: TransportError) {
        match self {
            Self::Connect(reply) => {
                let _ = reply.send(Err(err));
            }
            Self::Send(_, reply) => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

struct ProviderQuery {
    found: HashSet<PeerId>,
    reply: Reply<Vec<PeerAddr>>,
}

/// State the handle reads without a round trip to the driver.
#[derive(Default)]
struct Shared {
    acceptors: DashMap<ProtocolId, StreamAcceptor>,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    connected: RwLock<HashSet<PeerId>>,
    routing_size: AtomicUsize,
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct Transport {
    identity: NodeIdentity,
    config: TransportConfig,
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    /// Receiver end of `commands`, until [`start`](Self::start) hands it to
    /// the driver.
    pending_driver: Mutex<Option<mpsc::Receiver<Command>>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("peer_id", &self.identity.peer_id())
            .field("listen_addrs", &*self.shared.listen_addrs.read())
            .field("connected", &self.shared.connected.read().len())
            .finish()
    }
}

impl Transport {
    /// Create a transport. Nothing touches the network until
    /// [`start`](Self::start). Background work stops when `shutdown` is
    /// cancelled or [`close`](Self::close) is called.
    pub fn new(identity: NodeIdentity, config: TransportConfig, shutdown: CancellationToken) -> Self {
        let (commands, commands_rx) = mpsc::channel(config.command_capacity.max(1));
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            identity,
            config,
            shared: Arc::new(Shared::default()),
            commands,
            pending_driver: Mutex::new(Some(commands_rx)),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
            tasks: TaskTracker::new(),
        }
    }

    /// Build the swarm and spawn its driver. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Shutdown);
        }
        let mut slot = self.pending_driver.lock();
        let Some(commands) = slot.take() else {
            return Ok(());
        };
        let swarm = match self.build_swarm() {
            Ok(swarm) => swarm,
            Err(e) => {
                *slot = Some(commands);
                return Err(e);
            }
        };

        let driver = Driver {
            swarm,
            commands,
            loopback: self.commands.clone(),
            local_id: self.identity.peer_id(),
            protocol_version: self.config.protocol_version.clone(),
            shared: Arc::clone(&self.shared),
            events: self.events_tx.clone(),
            shutdown: self.shutdown.clone(),
            tasks: self.tasks.clone(),
            pending_listens: HashMap::new(),
            pending_dials: HashMap::new(),
            pending_requests: HashMap::new(),
            provider_queries: HashMap::new(),
            address_book: HashMap::new(),
            dialed_in: HashSet::new(),
        };
        self.tasks.spawn(driver.run());
        info!(peer_id = %self.identity.peer_id(), "transport started");
        Ok(())
    }

    fn build_swarm(&self) -> Result<Swarm<Behaviour>, TransportError> {
        let config = &self.config;
        let swarm = libp2p::SwarmBuilder::with_existing_identity(self.identity.keypair().clone())
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| TransportError::Build(e.to_string()))?
            .with_behaviour(|key| Behaviour::new(key, config))
            .map_err(|never| -> TransportError { match never {} })?
            .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_timeout))
            .build();
        Ok(swarm)
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    /// Addresses actually bound, with OS-assigned ports resolved.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.shared.listen_addrs.read().clone()
    }

    /// Our own dialable record.
    pub fn local_addr(&self) -> PeerAddr {
        PeerAddr::new(self.local_peer_id(), self.listen_addrs())
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.shared.connected.read().contains(peer)
    }

    pub fn routing_table_size(&self) -> usize {
        self.shared.routing_size.load(Ordering::Relaxed)
    }

    /// Bind a TCP address. Returns the bound address.
    pub async fn listen(&self, addr: &Multiaddr) -> Result<Multiaddr, TransportError> {
        if socket_addr(addr).is_none() {
            return Err(TransportError::UnsupportedAddress(addr.clone()));
        }
        let addr = addr.clone();
        self.request(|reply| Command::Listen { addr, reply }).await
    }

    pub fn set_stream_handler(&self, protocol: ProtocolId, acceptor: StreamAcceptor) {
        self.shared.acceptors.insert(protocol, acceptor);
    }

    /// Detach the acceptor of `protocol`. Returns `false` if none was set.
    pub fn remove_stream_handler(&self, protocol: &ProtocolId) -> bool {
        self.shared.acceptors.remove(protocol).is_some()
    }

    pub fn supports(&self, protocol: &ProtocolId) -> bool {
        self.shared.acceptors.contains_key(protocol)
    }

    /// Hand out the event receiver. Only the first caller gets it.
    pub fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().take()
    }

    /// Establish an authenticated connection to `peer`. Succeeds at once if
    /// one already exists.
    pub async fn connect(&self, peer: &PeerAddr) -> Result<(), TransportError> {
        let peer_id = peer.peer_id;
        let peer = peer.clone();
        let dial = self.request(|reply| Command::Connect { peer, reply });
        match tokio::time::timeout(self.config.dial_timeout, dial).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::DialTimeout(peer_id)),
        }
    }

    /// Deliver `message` to `peer`, connecting first if needed. Returns once
    /// the remote handed the message to its acceptor.
    pub async fn send(&self, peer: &PeerAddr, message: Message) -> Result<(), TransportError> {
        let protocol = message.protocol.clone();
        let peer = peer.clone();
        let ack = self
            .request(|reply| Command::Send {
                peer,
                message,
                reply,
            })
            .await?;
        if ack.accepted {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                protocol,
                reason: ack.reason.unwrap_or_else(|| "refused".to_string()),
            })
        }
    }

    /// Close every connection to `peer`.
    pub async fn disconnect(&self, peer: &PeerId) {
        let _ = self.commands.send(Command::Disconnect { peer: *peer }).await;
    }

    /// Seed the routing table.
    pub async fn add_routing_peers(&self, peers: Vec<PeerAddr>) -> Result<(), TransportError> {
        self.require_routing()?;
        self.request(|reply| Command::AddRoutingPeers { peers, reply })
            .await
    }

    /// Publish ourselves as a provider of `key`.
    pub async fn provide(&self, key: &str) -> Result<(), TransportError> {
        self.require_routing()?;
        let key = kad::RecordKey::new(&key);
        self.request(|reply| Command::Provide { key, reply }).await
    }

    pub async fn stop_providing(&self, key: &str) {
        if self.config.routing_enabled {
            let key = kad::RecordKey::new(&key);
            let _ = self.commands.send(Command::StopProviding { key }).await;
        }
    }

    /// Other nodes providing `key`, with every address known for them.
    pub async fn find_providers(&self, key: &str) -> Result<Vec<PeerAddr>, TransportError> {
        self.require_routing()?;
        let key = kad::RecordKey::new(&key);
        self.request(|reply| Command::FindProviders { key, reply })
            .await
    }

    /// Walk the routing table towards our own id to fill its buckets.
    pub async fn refresh_routing(&self) -> Result<(), TransportError> {
        self.require_routing()?;
        self.request(|reply| Command::RefreshRouting { reply }).await
    }

    /// Stop the driver, drop every connection, forget listen addresses.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.pending_driver.lock().take();
        self.tasks.close();
        self.tasks.wait().await;
        self.shared.listen_addrs.write().clear();
        self.shared.connected.write().clear();
        self.shared.acceptors.clear();
        info!("transport closed");
    }

    fn require_routing(&self) -> Result<(), TransportError> {
        if self.config.routing_enabled {
            Ok(())
        } else {
            Err(TransportError::RoutingDisabled)
        }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Shutdown);
        }
        if self.pending_driver.lock().is_some() {
            return Err(TransportError::NotStarted);
        }
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| TransportError::Shutdown)?;
        rx.await.map_err(|_| TransportError::Shutdown)?
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

struct Driver {
    swarm: Swarm<Behaviour>,
    commands: mpsc::Receiver<Command>,
    /// Lets acceptor tasks queue their responses.
    loopback: mpsc::Sender<Command>,
    local_id: PeerId,
    protocol_version: String,
    shared: Arc<Shared>,
    events: mpsc::Sender<TransportEvent>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    pending_listens: HashMap<ListenerId, Reply<Multiaddr>>,
    pending_dials: HashMap<PeerId, Vec<Waiter>>,
    pending_requests: HashMap<OutboundRequestId, (PeerId, Reply<Ack>)>,
    provider_queries: HashMap<kad::QueryId, ProviderQuery>,
    /// Every TCP address learned for a peer, from any source.
    address_book: HashMap<PeerId, PeerAddr>,
    /// Peers connected to us whose identify has not arrived yet.
    dialed_in: HashSet<PeerId>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(command) = self.commands.recv() => self.on_command(command),
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
            }
        }
        debug!("swarm driver stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Listen { addr, reply } => match self.swarm.listen_on(addr.clone()) {
                Ok(id) => {
                    self.pending_listens.insert(id, reply);
                }
                Err(libp2p::TransportError::MultiaddrNotSupported(addr)) => {
                    let _ = reply.send(Err(TransportError::UnsupportedAddress(addr)));
                }
                Err(libp2p::TransportError::Other(e)) => {
                    warn!(%addr, error = %e, "listen failed");
                    let _ = reply.send(Err(TransportError::Io(e)));
                }
            },
            Command::Connect { peer, reply } => self.dial(peer, Waiter::Connect(reply)),
            Command::Send {
                peer,
                message,
                reply,
            } => self.dial(peer, Waiter::Send(message, reply)),
            Command::Respond { channel, ack } => {
                if self
                    .swarm
                    .behaviour_mut()
                    .messaging
                    .send_response(channel, ack)
                    .is_err()
                {
                    debug!("ack dropped, connection gone");
                }
            }
            Command::Disconnect { peer } => {
                let _ = self.swarm.disconnect_peer_id(peer);
            }
            Command::AddRoutingPeers { peers, reply } => {
                for peer in peers {
                    self.remember(peer.peer_id, peer.addrs);
                }
                self.update_routing_size();
                let _ = reply.send(Ok(()));
            }
            Command::Provide { key, reply } => {
                let result = match self.swarm.behaviour_mut().kademlia.as_mut() {
                    Some(kad) => kad
                        .start_providing(key)
                        .map(|_| ())
                        .map_err(|e| TransportError::Routing(e.to_string())),
                    None => Err(TransportError::RoutingDisabled),
                };
                let _ = reply.send(result);
            }
            Command::StopProviding { key } => {
                if let Some(kad) = self.swarm.behaviour_mut().kademlia.as_mut() {
                    kad.stop_providing(&key);
                }
            }
            Command::FindProviders { key, reply } => {
                match self.swarm.behaviour_mut().kademlia.as_mut() {
                    Some(kad) => {
                        let id = kad.get_providers(key);
                        self.provider_queries.insert(
                            id,
                            ProviderQuery {
                                found: HashSet::new(),
                                reply,
                            },
                        );
                    }
                    None => {
                        let _ = reply.send(Err(TransportError::RoutingDisabled));
                    }
                }
            }
            Command::RefreshRouting { reply } => {
                if let Some(kad) = self.swarm.behaviour_mut().kademlia.as_mut() {
                    if kad.bootstrap().is_err() {
                        trace!("routing refresh skipped, table empty");
                    }
                }
                let _ = reply.send(Ok(()));
            }
        }
    }

    // -- Dialing --------------------------------------------------------------

    fn dial(&mut self, peer: PeerAddr, waiter: Waiter) {
        let peer_id = peer.peer_id;
        if peer_id == self.local_id {
            waiter.fail(TransportError::Dial {
                peer: peer_id,
                reason: "cannot dial the local node".to_string(),
            });
            return;
        }
        self.remember(peer_id, peer.addrs);

        if self.swarm.is_connected(&peer_id) {
            self.resume(peer_id, waiter);
            return;
        }

        let waiters = self.pending_dials.entry(peer_id).or_default();
        waiters.push(waiter);
        if waiters.len() > 1 {
            return;
        }

        let addrs = self
            .address_book
            .get(&peer_id)
            .map(|p| p.addrs.clone())
            .unwrap_or_default();
        let opts = DialOpts::peer_id(peer_id)
            .addresses(addrs)
            .extend_addresses_through_behaviour()
            .build();
        match self.swarm.dial(opts) {
            Ok(()) => trace!(peer = %peer_id, "dialing"),
            // Another dial is in flight; its outcome settles the waiters.
            Err(DialError::DialPeerConditionFalse(_)) => {}
            Err(e) => self.fail_dial(peer_id, &e),
        }
    }

    fn resume(&mut self, peer: PeerId, waiter: Waiter) {
        match waiter {
            Waiter::Connect(reply) => {
                let _ = reply.send(Ok(()));
            }
            Waiter::Send(message, reply) => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .messaging
                    .send_request(&peer, message);
                self.pending_requests.insert(id, (peer, reply));
            }
        }
    }

    fn fail_dial(&mut self, peer: PeerId, err: &DialError) {
        let waiters = self.pending_dials.remove(&peer).unwrap_or_default();
        if !waiters.is_empty() {
            debug!(%peer, error = %err, "dial failed");
        }
        for waiter in waiters {
            waiter.fail(dial_error(peer, err));
        }
    }

    /// Record TCP addresses for `peer` and feed them to the routing table.
    fn remember(&mut self, peer: PeerId, addrs: Vec<Multiaddr>) {
        if peer == self.local_id {
            return;
        }
        let learned = PeerAddr::new(
            peer,
            addrs.into_iter().filter(|a| socket_addr(a).is_some()).collect(),
        );
        if learned.addrs.is_empty() {
            return;
        }
        if let Some(kad) = self.swarm.behaviour_mut().kademlia.as_mut() {
            for addr in &learned.addrs {
                kad.add_address(&peer, addr.clone());
            }
        }
        self.address_book
            .entry(peer)
            .and_modify(|known| known.merge(&learned))
            .or_insert(learned);
    }

    fn update_routing_size(&mut self) {
        if let Some(kad) = self.swarm.behaviour_mut().kademlia.as_mut() {
            let size = kad.kbuckets().map(|bucket| bucket.num_entries()).sum();
            self.shared.routing_size.store(size, Ordering::Relaxed);
        }
    }

    fn emit(&self, event: TransportEvent) {
        if let Err(e) = self.events.try_send(event) {
            debug!(reason = %e, "transport event dropped");
        }
    }

    // -- Swarm events ---------------------------------------------------------

    fn on_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr {
                listener_id,
                address,
            } => {
                info!(addr = %address, peer_id = %self.local_id, "listening");
                {
                    let mut addrs = self.shared.listen_addrs.write();
                    if !addrs.contains(&address) {
                        addrs.push(address.clone());
                    }
                }
                self.swarm.add_external_address(address.clone());
                if let Some(reply) = self.pending_listens.remove(&listener_id) {
                    let _ = reply.send(Ok(address));
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.shared.listen_addrs.write().retain(|a| a != &address);
                self.swarm.remove_external_address(&address);
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                addresses,
                reason,
            } => {
                debug!(?reason, "listener closed");
                self.shared
                    .listen_addrs
                    .write()
                    .retain(|a| !addresses.contains(a));
                if let Some(reply) = self.pending_listens.remove(&listener_id) {
                    let err = match reason {
                        Err(e) => TransportError::Io(e),
                        Ok(()) => TransportError::Shutdown,
                    };
                    let _ = reply.send(Err(err));
                }
            }
            SwarmEvent::ListenerError { error, .. } => {
                warn!(error = %error, "listener error");
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                trace!(peer = %peer_id, remote = %endpoint.get_remote_address(), "connection established");
                self.shared.connected.write().insert(peer_id);
                if endpoint.is_listener() {
                    self.dialed_in.insert(peer_id);
                } else {
                    self.remember(peer_id, vec![endpoint.get_remote_address().clone()]);
                }
                for waiter in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    self.resume(peer_id, waiter);
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    trace!(peer = %peer_id, "disconnected");
                    self.shared.connected.write().remove(&peer_id);
                    self.dialed_in.remove(&peer_id);
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer),
                error,
                ..
            } => {
                if !self.swarm.is_connected(&peer) {
                    self.fail_dial(peer, &error);
                }
            }
            SwarmEvent::Behaviour(event) => self.on_behaviour_event(event),
            _ => {}
        }
    }

    fn on_behaviour_event(&mut self, event: BehaviourEvent) {
        match event {
            BehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                if info.protocol_version != self.protocol_version {
                    debug!(peer = %peer_id, version = %info.protocol_version, "foreign network, dropping peer");
                    let _ = self.swarm.disconnect_peer_id(peer_id);
                    return;
                }
                self.remember(peer_id, info.listen_addrs.clone());
                if self.dialed_in.remove(&peer_id) {
                    let addrs = info
                        .listen_addrs
                        .into_iter()
                        .filter(|a| socket_addr(a).is_some())
                        .collect();
                    self.emit(TransportEvent::InboundPeer(PeerAddr::new(peer_id, addrs)));
                }
            }
            BehaviourEvent::Identify(_) => {}

            BehaviourEvent::Kademlia(event) => {
                self.on_routing_event(event);
                self.update_routing_size();
            }

            BehaviourEvent::Mdns(mdns::Event::Discovered(found)) => {
                let mut peers: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer, addr) in found {
                    if peer != self.local_id {
                        peers.entry(peer).or_default().push(addr);
                    }
                }
                for (peer, addrs) in peers {
                    debug!(%peer, "local peer discovered");
                    self.remember(peer, addrs.clone());
                    self.emit(TransportEvent::LocalPeer(PeerAddr::new(peer, addrs)));
                }
            }
            BehaviourEvent::Mdns(mdns::Event::Expired(expired)) => {
                for (peer, _) in expired {
                    trace!(%peer, "local peer expired");
                }
            }

            BehaviourEvent::Messaging(event) => self.on_messaging_event(event),
        }
    }

    fn on_routing_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated {
                peer, addresses, ..
            } => {
                trace!(%peer, "routing table updated");
                let learned = PeerAddr::new(
                    peer,
                    addresses
                        .iter()
                        .filter(|a| socket_addr(a).is_some())
                        .cloned()
                        .collect(),
                );
                if !learned.addrs.is_empty() {
                    self.address_book
                        .entry(peer)
                        .and_modify(|known| known.merge(&learned))
                        .or_insert(learned);
                }
            }
            kad::Event::OutboundQueryProgressed {
                id,
                result: kad::QueryResult::GetProviders(result),
                step,
                ..
            } => {
                if let Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) = result {
                    if let Some(query) = self.provider_queries.get_mut(&id) {
                        query.found.extend(providers);
                    }
                }
                if step.last {
                    if let Some(query) = self.provider_queries.remove(&id) {
                        let providers = query
                            .found
                            .into_iter()
                            .filter(|peer| *peer != self.local_id)
                            .map(|peer| {
                                self.address_book
                                    .get(&peer)
                                    .cloned()
                                    .unwrap_or_else(|| PeerAddr::new(peer, Vec::new()))
                            })
                            .collect();
                        let _ = query.reply.send(Ok(providers));
                    }
                }
            }
            _ => {}
        }
    }

    fn on_messaging_event(&mut self, event: request_response::Event<Message, Ack>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => self.on_request(peer, request, channel),
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some((_, reply)) = self.pending_requests.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                debug!(%peer, error = %error, "message delivery failed");
                if let Some((_, reply)) = self.pending_requests.remove(&request_id) {
                    let _ = reply.send(Err(TransportError::Request {
                        peer,
                        reason: error.to_string(),
                    }));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(%peer, error = %error, "inbound message failed");
            }
            _ => {}
        }
    }

    fn on_request(&mut self, peer: PeerId, mut message: Message, channel: ResponseChannel<Ack>) {
        message.from = peer.to_string();
        let protocol = message.protocol.clone();
        let Some(acceptor) = self
            .shared
            .acceptors
            .get(&protocol)
            .map(|entry| entry.value().clone())
        else {
            debug!(%peer, %protocol, "inbound message refused");
            let ack = Ack::refused(format!("protocol {protocol} not supported"));
            let _ = self.swarm.behaviour_mut().messaging.send_response(channel, ack);
            return;
        };

        trace!(%peer, %protocol, "inbound message accepted");
        let loopback = self.loopback.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let ack = tokio::select! {
                _ = shutdown.cancelled() => return,
                sent = acceptor.send(message) => match sent {
                    Ok(()) => Ack::accepted(),
                    Err(_) => Ack::refused("receiver is shutting down"),
                },
            };
            let _ = loopback.send(Command::Respond { channel, ack }).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::addr::multiaddr_from_socket;
    use tokio::time::timeout;

    fn loopback() -> Multiaddr {
        "/ip4/127.0.0.1/tcp/0".parse().unwrap()
    }

    async fn listening_with(config: TransportConfig) -> Transport {
        let transport = Transport::new(NodeIdentity::generate(), config, CancellationToken::new());
        transport.start().unwrap();
        transport.listen(&loopback()).await.unwrap();
        transport
    }

    async fn listening_transport() -> Transport {
        listening_with(TransportConfig::default()).await
    }

    fn routing_config() -> TransportConfig {
        TransportConfig {
            routing_enabled: true,
            ..TransportConfig::default()
        }
    }

    fn test_protocol() -> ProtocolId {
        ProtocolId::parse("/test/1.0.0").unwrap()
    }

    #[tokio::test]
    async fn listen_reports_bound_port() {
        let t = listening_transport().await;
        let addrs = t.listen_addrs();
        assert_eq!(addrs.len(), 1);
        let sock = socket_addr(&addrs[0]).unwrap();
        assert_ne!(sock.port(), 0);
        t.close().await;
        assert!(t.listen_addrs().is_empty());
    }

    #[tokio::test]
    async fn rejects_non_tcp_listen_address() {
        let t = listening_transport().await;
        let udp: Multiaddr = "/ip4/127.0.0.1/udp/0".parse().unwrap();
        assert!(matches!(
            t.listen(&udp).await,
            Err(TransportError::UnsupportedAddress(_))
        ));
    }

    #[tokio::test]
    async fn requires_start_before_use() {
        let t = Transport::new(
            NodeIdentity::generate(),
            TransportConfig::default(),
            CancellationToken::new(),
        );
        assert!(matches!(
            t.listen(&loopback()).await,
            Err(TransportError::NotStarted)
        ));
        t.start().unwrap();
        t.start().unwrap();
        assert!(t.listen(&loopback()).await.is_ok());
    }

    #[tokio::test]
    async fn message_reaches_acceptor_with_authenticated_sender() {
        let a = listening_transport().await;
        let b = listening_transport().await;

        let (tx, mut rx) = mpsc::channel(4);
        b.set_stream_handler(test_protocol(), tx);

        let mut msg = Message::with_protocol(test_protocol(), b"ping".to_vec());
        msg.from = "someone else".to_string();
        a.send(&b.local_addr(), msg).await.unwrap();

        let inbound = rx.recv().await.unwrap();
        assert_eq!(inbound.from, a.local_peer_id().to_string());
        assert_eq!(inbound.protocol, test_protocol());
        assert_eq!(inbound.payload, b"ping");
        assert!(a.is_connected(&b.local_peer_id()));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn unsupported_protocol_is_refused() {
        let a = listening_transport().await;
        let b = listening_transport().await;

        let msg = Message::with_protocol(test_protocol(), Vec::new());
        let err = a.send(&b.local_addr(), msg).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected { .. }), "{err}");
        assert!(!b.supports(&test_protocol()));
    }

    #[tokio::test]
    async fn wrong_peer_id_is_detected() {
        let a = listening_transport().await;
        let b = listening_transport().await;

        let impostor = PeerAddr::new(PeerId::random(), b.listen_addrs());
        let err = a.connect(&impostor).await.unwrap_err();
        assert!(matches!(err, TransportError::PeerIdMismatch { .. }), "{err}");
        assert!(!a.is_connected(&impostor.peer_id));
    }

    #[tokio::test]
    async fn identify_emits_inbound_peer_event() {
        let a = listening_transport().await;
        let b = listening_transport().await;
        let mut events = b.take_events().unwrap();
        assert!(b.take_events().is_none());

        a.connect(&b.local_addr()).await.unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        let TransportEvent::InboundPeer(peer) = event else {
            panic!("unexpected event {event:?}");
        };
        assert_eq!(peer.peer_id, a.local_peer_id());
        assert!(peer.addrs.contains(&a.listen_addrs()[0]));
    }

    #[tokio::test]
    async fn dead_first_address_falls_through_to_live_one() {
        let a = listening_transport().await;
        let b = listening_transport().await;

        // Accepts TCP and hangs up before noise can complete.
        let dropper = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = multiaddr_from_socket(dropper.local_addr().unwrap());
        tokio::spawn(async move {
            while let Ok((socket, _)) = dropper.accept().await {
                drop(socket);
            }
        });

        let mut addrs = vec![dead];
        addrs.extend(b.listen_addrs());
        a.connect(&PeerAddr::new(b.local_peer_id(), addrs))
            .await
            .unwrap();
        assert!(a.is_connected(&b.local_peer_id()));
    }

    #[tokio::test]
    async fn unreachable_peer_fails() {
        let a = listening_transport().await;
        let b = listening_transport().await;
        let target = b.local_addr();
        b.close().await;

        assert!(a.connect(&target).await.is_err());
        assert!(matches!(
            a.connect(&PeerAddr::new(PeerId::random(), Vec::new())).await,
            Err(TransportError::NoDialableAddress(_))
        ));
    }

    #[tokio::test]
    async fn closed_transport_refuses_to_dial() {
        let a = listening_transport().await;
        let b = listening_transport().await;
        a.close().await;
        assert!(matches!(
            a.connect(&b.local_addr()).await,
            Err(TransportError::Shutdown)
        ));
        assert!(matches!(a.start(), Err(TransportError::Shutdown)));
    }

    #[tokio::test]
    async fn routing_calls_need_routing_enabled() {
        let a = listening_transport().await;
        assert!(matches!(
            a.provide(NODE_PROTOCOL_ID).await,
            Err(TransportError::RoutingDisabled)
        ));
        assert!(matches!(
            a.find_providers(NODE_PROTOCOL_ID).await,
            Err(TransportError::RoutingDisabled)
        ));
        assert_eq!(a.routing_table_size(), 0);
    }

    #[tokio::test]
    async fn provider_lookup_finds_rendezvous_peer() {
        let a = listening_with(routing_config()).await;
        let b = listening_with(routing_config()).await;

        a.provide("/rendezvous/test").await.unwrap();
        b.add_routing_peers(vec![a.local_addr()]).await.unwrap();
        assert_eq!(b.routing_table_size(), 1);

        let providers = b.find_providers("/rendezvous/test").await.unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].peer_id, a.local_peer_id());
        assert!(providers[0].is_dialable());

        // Our own record never comes back to us.
        let own = a.find_providers("/rendezvous/test").await.unwrap();
        assert!(own.iter().all(|p| p.peer_id != a.local_peer_id()));
    }

    #[tokio::test]
    async fn codec_frames_message_and_ack() {
        use futures::io::Cursor;
        use request_response::Codec;

        let proto = StreamProtocol::new(PROTOCOL_MESSAGING);
        let mut codec = MessageCodec;
        let msg = Message::with_protocol(test_protocol(), vec![1, 2, 3]);

        let mut wire = Cursor::new(Vec::new());
        codec.write_request(&proto, &mut wire, msg.clone()).await.unwrap();
        let mut wire = Cursor::new(wire.into_inner());
        assert_eq!(codec.read_request(&proto, &mut wire).await.unwrap(), msg);

        let ack = Ack::refused("nope");
        let mut wire = Cursor::new(Vec::new());
        codec.write_response(&proto, &mut wire, ack.clone()).await.unwrap();
        let mut wire = Cursor::new(wire.into_inner());
        assert_eq!(codec.read_response(&proto, &mut wire).await.unwrap(), ack);
    }
}
