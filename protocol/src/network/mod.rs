//! # Network Module
//!
//! Peer-to-peer transport core: a libp2p swarm (TCP, noise, yamux) with
//! length-prefixed request/response messaging, protocol dispatch, peer
//! discovery and the node that orchestrates them.
//!
//! ## Architecture
//!
//! ```text
//! message.rs:    Message, ProtocolId, MessageType, frame read/write
//! addr.rs:       PeerAddr (multiaddr + peer id) and socket helpers
//! transport.rs:  swarm driver: identify, Kademlia, mDNS, messaging
//! protocol.rs:   ProtocolManager: handler registry and metrics
//! peer.rs:       Peer: one remote and its ordered per-protocol lanes
//! discovery.rs:  DiscoveryService: rendezvous lookups, local finds, admission
//! node.rs:       Node: peer set, lifecycle, broadcast and unicast
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! Kademlia/mDNS ──▶ Discovery ──notify──▶ Node::add_peer ──▶ Peer::connect
//! swarm inbound request ──▶ acceptor queue ──▶ dispatch loop
//!     ──▶ ProtocolManager::handle_message ──▶ MessageHandler
//! ```
//!
//! ## Design Decisions
//!
//! - Every message is one request on its own yamux substream and is
//!   acknowledged once the remote queued it. Sends on one (peer, protocol)
//!   lane are serialized, so per-lane order holds. Failed sends are never
//!   retried.
//! - The swarm lives on a single driver task. Everything else talks to it
//!   through a bounded command channel.
//! - Every cross-task queue is bounded. Discovery and pool notifications
//!   are lossy; the inbound dispatch queue applies back-pressure instead.
//! - Shared maps use `parking_lot` locks and are never held across an
//!   `.await`.

pub mod addr;
pub mod discovery;
pub mod message;
pub mod node;
pub mod peer;
pub mod protocol;
pub mod transport;

pub use addr::{AddrError, PeerAddr, PeerRecord};
pub use discovery::{DiscoveryConfig, DiscoveryError, DiscoveryService, DiscoveryState};
pub use message::{
    read_frame, write_frame, InvalidProtocolId, Message, MessageType, ProtocolId, WireError,
};
pub use node::{Node, NodeConfig, NodeError, NodeInfo, NodeStatus};
pub use peer::{ConnectionState, Peer, PeerContext, PeerError, PeerInfo};
pub use protocol::{
    HandlerError, MessageHandler, ProtocolError, ProtocolInfo, ProtocolManager, ProtocolMetrics,
};
pub use transport::{
    Ack, MessageCodec, StreamAcceptor, Transport, TransportConfig, TransportError, TransportEvent,
};
