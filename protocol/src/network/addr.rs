//! Peer addresses.
//!
//! A peer address is a multiaddr naming a TCP endpoint and ending in the
//! peer's id: `/ip4/10.0.0.7/tcp/9740/p2p/12D3KooW...`. The id half lets
//! the dialer check it reached the peer it meant to reach.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrError {
    #[error("invalid multiaddr {0:?}")]
    Multiaddr(String),

    #[error("address {0:?} does not end in /p2p/<peer id>")]
    MissingPeerId(String),

    #[error("invalid peer id {0:?}")]
    PeerId(String),
}

/// A peer id plus the addresses it can be dialed at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PeerRecord", into = "PeerRecord")]
pub struct PeerAddr {
    pub peer_id: PeerId,
    /// Transport addresses, without the trailing `/p2p` component.
    pub addrs: Vec<Multiaddr>,
}

impl PeerAddr {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        let addrs = addrs.into_iter().map(strip_peer_id).collect();
        Self { peer_id, addrs }
    }

    /// Every address rendered with the `/p2p/<id>` suffix.
    pub fn full_addrs(&self) -> Vec<String> {
        self.addrs
            .iter()
            .map(|a| a.clone().with(Protocol::P2p(self.peer_id)).to_string())
            .collect()
    }

    /// Socket addresses this peer can be dialed at, in preference order.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.addrs.iter().filter_map(socket_addr).collect()
    }

    pub fn is_dialable(&self) -> bool {
        !self.socket_addrs().is_empty()
    }

    /// Merge addresses learned from another record for the same peer.
    pub fn merge(&mut self, other: &PeerAddr) {
        for addr in &other.addrs {
            if !self.addrs.contains(addr) {
                self.addrs.push(addr.clone());
            }
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.full_addrs().into_iter().next() {
            Some(full) => f.write_str(&full),
            None => write!(f, "/p2p/{}", self.peer_id),
        }
    }
}

impl FromStr for PeerAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr: Multiaddr = s.parse().map_err(|_| AddrError::Multiaddr(s.to_string()))?;
        match addr.pop() {
            Some(Protocol::P2p(peer_id)) => Ok(Self {
                peer_id,
                addrs: if addr.is_empty() { Vec::new() } else { vec![addr] },
            }),
            _ => Err(AddrError::MissingPeerId(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire record
// ---------------------------------------------------------------------------

/// String form of a [`PeerAddr`], used when one is serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub addrs: Vec<String>,
}

impl From<PeerAddr> for PeerRecord {
    fn from(addr: PeerAddr) -> Self {
        Self {
            id: addr.peer_id.to_string(),
            addrs: addr.addrs.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl TryFrom<PeerRecord> for PeerAddr {
    type Error = AddrError;

    fn try_from(record: PeerRecord) -> Result<Self, Self::Error> {
        let peer_id =
            PeerId::from_str(&record.id).map_err(|_| AddrError::PeerId(record.id.clone()))?;
        let addrs = record
            .addrs
            .iter()
            .map(|a| a.parse::<Multiaddr>().map_err(|_| AddrError::Multiaddr(a.clone())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PeerAddr::new(peer_id, addrs))
    }
}

// ---------------------------------------------------------------------------
// Multiaddr helpers
// ---------------------------------------------------------------------------

/// `/ip4/a.b.c.d/tcp/p` or `/ip6/.../tcp/p` as a socket address.
pub fn socket_addr(addr: &Multiaddr) -> Option<SocketAddr> {
    let mut iter = addr.iter();
    let ip: std::net::IpAddr = match iter.next()? {
        Protocol::Ip4(ip) => ip.into(),
        Protocol::Ip6(ip) => ip.into(),
        _ => return None,
    };
    match iter.next()? {
        Protocol::Tcp(port) => Some(SocketAddr::new(ip, port)),
        _ => None,
    }
}

pub fn multiaddr_from_socket(addr: SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        std::net::IpAddr::V4(ip) => Protocol::Ip4(ip),
        std::net::IpAddr::V6(ip) => Protocol::Ip6(ip),
    };
    Multiaddr::empty().with(ip).with(Protocol::Tcp(addr.port()))
}

fn strip_peer_id(mut addr: Multiaddr) -> Multiaddr {
    if matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
        addr.pop();
    }
    addr
}
