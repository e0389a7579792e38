//! # Protocol Configuration & Constants
//!
//! Every magic number the transport and admission core relies on lives here.
//! Component-level `*Config` structs take their defaults from these values,
//! so changing a default means changing exactly one line.

use std::time::Duration;

// ---------------------------------------------------------------------------
// Protocol Identifiers
// ---------------------------------------------------------------------------

/// Version shared by every built-in protocol id.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Rendezvous tag and default node protocol id.
pub const NODE_PROTOCOL_ID: &str = "/aporia-zero/1.0.0";

/// Transaction gossip between direct peers.
pub const PROTOCOL_TRANSACTION: &str = "/aporia-zero/tx/1.0.0";

/// Block propagation.
pub const PROTOCOL_BLOCK: &str = "/aporia-zero/block/1.0.0";

/// Consensus traffic.
pub const PROTOCOL_CONSENSUS: &str = "/aporia-zero/consensus/1.0.0";

/// State synchronization.
pub const PROTOCOL_STATE_SYNC: &str = "/aporia-zero/sync/1.0.0";

/// Peer discovery traffic between direct peers.
pub const PROTOCOL_DISCOVERY: &str = "/aporia-zero/discovery/1.0.0";

/// Request-response protocol every [`Message`](crate::network::Message)
/// travels on. Reserved by the transport.
pub const PROTOCOL_MESSAGING: &str = "/aporia-zero/msg/1.0.0";

/// Kademlia protocol of the rendezvous routing table. Reserved by the
/// transport.
pub const PROTOCOL_ROUTING: &str = "/aporia-zero/kad/1.0.0";

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Default TCP port for peer-to-peer traffic.
pub const DEFAULT_P2P_PORT: u16 = 9740;

/// Largest frame accepted or produced on any stream (8 MiB).
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Upper bound on establishing a connection, noise and yamux included.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on one message exchange: the write plus the remote's ack.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a connection with no traffic in flight is kept open.
pub const IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Capacity of the queue feeding the swarm driver.
pub const TRANSPORT_COMMAND_CAPACITY: usize = 1024;

/// Upper bound on a single send during broadcast.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Maximum number of directly connected peers.
pub const MAX_PEERS: usize = 50;

/// Capacity of the central inbound dispatch queue.
pub const INBOUND_QUEUE_CAPACITY: usize = 1000;

/// Capacity of the transport event queue (inbound and local-subnet peers).
pub const TRANSPORT_EVENT_CAPACITY: usize = 256;

/// How long `stop()` waits for background tasks to drain.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Interval between rendezvous lookups.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between re-publications of our own rendezvous provider record.
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Upper bound on one Kademlia query.
pub const ROUTING_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between mDNS queries on the local subnet.
pub const LOCAL_QUERY_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the discovered-peer notification queue.
pub const DISCOVERY_QUEUE_CAPACITY: usize = 100;

// ---------------------------------------------------------------------------
// Mempool
// ---------------------------------------------------------------------------

/// Maximum number of transactions held by the pool.
pub const MEMPOOL_MAX_SIZE: usize = 10_000;

/// Maximum encoded transaction size (1 MiB).
pub const MAX_TX_SIZE_BYTES: usize = 1024 * 1024;

/// Age after which a pooled transaction is swept.
pub const TX_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Interval of the expiry sweep.
pub const MEMPOOL_CLEANUP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Capacity of the post-admission notification queue.
pub const TX_NOTIFICATION_CAPACITY: usize = 1000;

/// Lower bound on the computation cost a proof must carry.
pub const MIN_COMPUTATION_COST: u64 = 1000;

/// Upper bound on the computation cost a proof may carry.
pub const MAX_COMPUTATION_COST: u64 = 1_000_000;

/// Shortest signature accepted before an external verifier is wired in
/// (compact secp256k1).
pub const SIGNATURE_MIN_LEN: usize = 64;

/// Longest signature accepted before an external verifier is wired in
/// (recoverable secp256k1).
pub const SIGNATURE_MAX_LEN: usize = 65;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_protocols_share_version() {
        for id in [
            NODE_PROTOCOL_ID,
            PROTOCOL_TRANSACTION,
            PROTOCOL_BLOCK,
            PROTOCOL_CONSENSUS,
            PROTOCOL_STATE_SYNC,
            PROTOCOL_DISCOVERY,
            PROTOCOL_MESSAGING,
            PROTOCOL_ROUTING,
        ] {
            assert!(id.starts_with("/aporia-zero/"), "{id}");
            assert!(id.ends_with(PROTOCOL_VERSION), "{id}");
        }
    }

    #[test]
    fn test_timeouts_sanity() {
        assert!(REQUEST_TIMEOUT < IDLE_CONNECTION_TIMEOUT);
        assert!(SHUTDOWN_TIMEOUT.as_millis() > 0);
        assert!(DISCOVERY_INTERVAL < ANNOUNCE_INTERVAL);
    }

    #[test]
    fn test_mempool_constants_sanity() {
        assert!(MIN_COMPUTATION_COST < MAX_COMPUTATION_COST);
        assert!(MEMPOOL_CLEANUP_INTERVAL < TX_EXPIRATION);
        // A maximal transaction must fit in one frame once wrapped in a message.
        assert!(MAX_TX_SIZE_BYTES * 4 <= MAX_FRAME_LENGTH);
    }
}
