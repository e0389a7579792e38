//! # Peer
//!
//! One remote node as seen from the local node. A `Peer` keeps one ordered
//! lane per protocol it has sent on. Each message travels on its own
//! substream and the lane holds the next send back until the remote
//! acknowledged the previous one, so messages of one protocol arrive in
//! the order they were sent.
//!
//! ## Lane lifecycle
//!
//! - A lane is opened lazily by the first [`Peer::send_message`] for its
//!   protocol.
//! - A failed send closes the lane at once. The next send for that
//!   protocol opens a fresh one; the failed message itself is not retried.
//! - A connection the remote dropped is dialed again by the next send.
//! - [`Peer::disconnect`] closes every lane and the connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::addr::PeerAddr;
use super::message::{Message, ProtocolId, WireError};
use super::protocol::ProtocolManager;
use super::transport::{Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Snapshot of a peer for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub addresses: Vec<String>,
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
    pub streams: Vec<String>,
}

/// Shared plumbing every peer of a node needs.
#[derive(Clone)]
pub struct PeerContext {
    pub transport: Arc<Transport>,
    pub protocols: Arc<ProtocolManager>,
}

struct StreamHandle {
    id: u64,
    protocol: ProtocolId,
    /// Held across one send and its ack.
    lane: tokio::sync::Mutex<()>,
}

pub struct Peer {
    addr: PeerAddr,
    state: RwLock<ConnectionState>,
    last_seen: RwLock<DateTime<Utc>>,
    streams: Mutex<HashMap<ProtocolId, Arc<StreamHandle>>>,
    next_stream_id: AtomicU64,
    ctx: PeerContext,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.addr.peer_id)
            .field("state", &*self.state.read())
            .field("streams", &self.streams.lock().len())
            .finish()
    }
}

impl Peer {
    pub fn new(addr: PeerAddr, ctx: PeerContext) -> Arc<Self> {
        Arc::new(Self {
            addr,
            state: RwLock::new(ConnectionState::Disconnected),
            last_seen: RwLock::new(Utc::now()),
            streams: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU64::new(0),
            ctx,
        })
    }

    pub fn id(&self) -> PeerId {
        self.addr.peer_id
    }

    pub fn addr(&self) -> &PeerAddr {
        &self.addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        *self.last_seen.read()
    }

    /// Protocols with an open lane, sorted.
    pub fn open_protocols(&self) -> Vec<ProtocolId> {
        let mut ids: Vec<ProtocolId> = self.streams.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.id().to_string(),
            addresses: self.addr.full_addrs(),
            connected: self.is_connected(),
            last_seen: self.last_seen(),
            streams: self
                .open_protocols()
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// Establish the connection. A no-op when already connected.
    pub async fn connect(&self) -> Result<(), PeerError> {
        if self.is_connected() {
            return Ok(());
        }
        self.ctx.transport.connect(&self.addr).await?;
        *self.state.write() = ConnectionState::Connected;
        self.touch();
        debug!(peer = %self.id(), "peer connected");
        Ok(())
    }

    /// Close every lane and the connection, and mark the peer
    /// disconnected.
    pub async fn disconnect(&self) {
        *self.state.write() = ConnectionState::Disconnected;
        self.streams.lock().clear();
        self.ctx.transport.disconnect(&self.id()).await;
        debug!(peer = %self.id(), "peer disconnected");
    }

    /// Deliver `message` on the lane of its protocol, opening the lane
    /// first if needed. Returns once the remote accepted it.
    pub async fn send_message(&self, message: &Message) -> Result<(), PeerError> {
        if !self.is_connected() {
            return Err(PeerError::NotConnected(self.id()));
        }
        let size = message.encode()?.len();
        let handle = self.stream_for(&message.protocol);

        let sent = {
            let _turn = handle.lane.lock().await;
            self.ctx.transport.send(&self.addr, message.clone()).await
        };

        match sent {
            Ok(()) => {
                self.touch();
                self.ctx.protocols.record_sent(&message.protocol, size);
                trace!(peer = %self.id(), protocol = %message.protocol, bytes = size, "message sent");
                Ok(())
            }
            Err(e) => {
                warn!(peer = %self.id(), protocol = %message.protocol, error = %e, "send failed, closing lane");
                self.close_stream(&handle);
                Err(e.into())
            }
        }
    }

    fn touch(&self) {
        *self.last_seen.write() = Utc::now();
    }

    fn stream_for(&self, protocol: &ProtocolId) -> Arc<StreamHandle> {
        let mut streams = self.streams.lock();
        let handle = streams.entry(protocol.clone()).or_insert_with(|| {
            trace!(peer = %self.addr.peer_id, %protocol, "lane opened");
            Arc::new(StreamHandle {
                id: self.next_stream_id.fetch_add(1, Ordering::Relaxed),
                protocol: protocol.clone(),
                lane: tokio::sync::Mutex::new(()),
            })
        });
        Arc::clone(handle)
    }

    /// Remove `handle` from the lane map if it is still the live one.
    fn close_stream(&self, handle: &StreamHandle) {
        let mut streams = self.streams.lock();
        if streams.get(&handle.protocol).map(|h| h.id) == Some(handle.id) {
            streams.remove(&handle.protocol);
        }
    }
}
