//! End-to-end tests for Aporia Zero nodes.
//!
//! Every test runs real nodes on `127.0.0.1` with OS-assigned ports and
//! talks to them only through the public API: connecting, exchanging
//! messages on registered protocols, admitting transactions into a remote
//! pool, and learning peers through rendezvous lookups on the routing
//! table.
//!
//! mDNS stays disabled so parallel test runs cannot see each other.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use aporia_protocol::config::PROTOCOL_TRANSACTION;
use aporia_protocol::identity::NodeIdentity;
use aporia_protocol::mempool::{
    PoolConfig, ProofVerifier, TransactionHandler, TransactionPool, ValidationConfig, Validator,
};
use aporia_protocol::network::{
    DiscoveryConfig, HandlerError, Message, MessageHandler, MessageType, Node, NodeConfig,
    NodeError, ProtocolError,
};
use aporia_protocol::transaction::{Address, Transaction, TransactionBuilder, TxStatus};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn isolated_config() -> NodeConfig {
    NodeConfig {
        listen_addresses: vec!["/ip4/127.0.0.1/tcp/0".into()],
        discovery: DiscoveryConfig {
            routing_enabled: false,
            local_enabled: false,
            ..DiscoveryConfig::default()
        },
        ..NodeConfig::default()
    }
}

fn routing_config(bootstrap: Vec<String>) -> NodeConfig {
    NodeConfig {
        bootstrap_peers: bootstrap,
        discovery: DiscoveryConfig {
            routing_enabled: true,
            local_enabled: false,
            discovery_interval: Duration::from_millis(100),
            ..DiscoveryConfig::default()
        },
        ..isolated_config()
    }
}

async fn start_node(config: NodeConfig) -> Arc<Node> {
    let node = Node::new(NodeIdentity::generate(), config).expect("node config");
    node.start().await.expect("node start");
    node
}

/// The dialable `/ip4/.../tcp/.../p2p/...` address of a running node.
fn dial_addr(node: &Node) -> String {
    node.local_addr()
        .full_addrs()
        .first()
        .expect("node has a listen address")
        .to_string()
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

/// Records every message a protocol delivers.
#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<Message>>,
}

impl MessageHandler for Recorder {
    fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self.seen.lock().push(message.clone());
        Ok(())
    }
}

/// Proof cost proportional to length, so tests need no real work.
struct LengthProof;

impl ProofVerifier for LengthProof {
    fn computation_cost(&self, proof: &[u8]) -> u64 {
        proof.len() as u64 * 1000
    }

    fn verify(&self, proof: &[u8]) -> bool {
        !proof.is_empty()
    }
}

fn transaction_handler() -> (Arc<TransactionPool>, Arc<TransactionHandler>) {
    let pool = Arc::new(TransactionPool::new(PoolConfig::default()));
    let validator = Validator::new(
        ValidationConfig::default(),
        Arc::new(LengthProof),
        Arc::new(|tx: &Transaction| tx.signature.len() == 64),
    );
    let handler = TransactionHandler::new(Arc::clone(&pool), Arc::new(validator));
    (pool, Arc::new(handler))
}

fn make_tx(nonce: u64) -> Transaction {
    TransactionBuilder::new(Address([0xaa; 20]), Address([0xbb; 20]))
        .value(250)
        .nonce(nonce)
        .proof(vec![1; 4])
        .signature(vec![9; 64])
        .build()
}

// ---------------------------------------------------------------------------
// Connectivity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_nodes_connect_both_ways() {
    let a = start_node(isolated_config()).await;
    let b = start_node(isolated_config()).await;

    let id = b.connect(&dial_addr(&a)).await.unwrap();
    assert_eq!(id, a.local_peer_id());
    assert!(b.has_peer(&a.local_peer_id()));

    // The identify handshake makes `a` add `b` back.
    wait_for("inbound peer", || a.has_peer(&b.local_peer_id())).await;

    let info = a.get_node_info();
    assert_eq!(info.peer_count, 1);
    assert_eq!(info.id, a.local_peer_id().to_string());

    b.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn bootstrap_peers_dialed_at_start() {
    let seed = start_node(isolated_config()).await;
    let joiner = start_node(NodeConfig {
        bootstrap_peers: vec![dial_addr(&seed)],
        ..isolated_config()
    })
    .await;

    assert!(joiner.has_peer(&seed.local_peer_id()));

    joiner.stop().await;
    seed.stop().await;
}

#[tokio::test]
async fn unreachable_bootstrap_does_not_abort_start() {
    let ghost = NodeIdentity::generate().peer_id();
    let node = start_node(NodeConfig {
        bootstrap_peers: vec![format!("/ip4/127.0.0.1/tcp/1/p2p/{ghost}")],
        ..isolated_config()
    })
    .await;

    assert_eq!(node.peer_count(), 0);
    node.stop().await;
}

#[tokio::test]
async fn peer_limit_is_enforced() {
    let hub = start_node(NodeConfig {
        max_peers: 1,
        accept_inbound_peers: false,
        ..isolated_config()
    })
    .await;
    let first = start_node(isolated_config()).await;
    let second = start_node(isolated_config()).await;

    hub.connect(&dial_addr(&first)).await.unwrap();
    let err = hub.connect(&dial_addr(&second)).await.unwrap_err();
    assert!(matches!(err, NodeError::MaxPeers { max: 1 }));
    assert_eq!(hub.peer_count(), 1);

    for node in [hub, first, second] {
        node.stop().await;
    }
}

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_protocol_registration_rejected() {
    let node = start_node(isolated_config()).await;
    let recorder: Arc<dyn MessageHandler> = Arc::new(Recorder::default());

    node.register_handler("/aporia-zero/chat/1.0.0", Arc::clone(&recorder))
        .unwrap();
    let err = node
        .register_handler("/aporia-zero/chat/1.0.0", recorder)
        .unwrap_err();
    assert!(matches!(
        err,
        NodeError::Protocol(ProtocolError::AlreadyRegistered(_))
    ));

    node.stop().await;
}

#[tokio::test]
async fn messages_arrive_in_send_order() {
    let a = start_node(isolated_config()).await;
    let b = start_node(isolated_config()).await;
    let recorder = Arc::new(Recorder::default());
    b.register_handler(PROTOCOL_TRANSACTION, recorder.clone())
        .unwrap();

    let target = a.connect(&dial_addr(&b)).await.unwrap();
    for i in 0u8..10 {
        a.send_message(&target, Message::new(MessageType::Transaction, vec![i]))
            .await
            .unwrap();
    }

    wait_for("ten messages", || recorder.seen.lock().len() == 10).await;
    let seen = recorder.seen.lock();
    let payloads: Vec<u8> = seen.iter().map(|m| m.payload[0]).collect();
    assert_eq!(payloads, (0u8..10).collect::<Vec<_>>());
    assert!(seen.iter().all(|m| m.from == a.local_peer_id().to_string()));
    drop(seen);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn broadcast_reaches_direct_peers_only() {
    // Line topology 0 - 1 - 2 with routing disabled: a broadcast from 0
    // reaches 1 and is never relayed on to 2.
    let n0 = start_node(NodeConfig {
        accept_inbound_peers: false,
        ..isolated_config()
    })
    .await;
    let n1 = start_node(isolated_config()).await;
    let n2 = start_node(isolated_config()).await;

    let hits1 = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::new(AtomicUsize::new(0));
    for (node, hits) in [(&n1, &hits1), (&n2, &hits2)] {
        let hits = Arc::clone(hits);
        node.register_handler(
            "/aporia-zero/block/1.0.0",
            Arc::new(move |_: &Message| -> Result<(), HandlerError> {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
    }

    n0.connect(&dial_addr(&n1)).await.unwrap();
    n1.connect(&dial_addr(&n2)).await.unwrap();

    let reached = n0
        .broadcast(Message::new(MessageType::Block, b"block-1".to_vec()))
        .await;
    assert_eq!(reached, 1);

    wait_for("delivery to node 1", || hits1.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(hits2.load(Ordering::SeqCst), 0);

    for node in [n0, n1, n2] {
        node.stop().await;
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transaction_lands_in_remote_pool() {
    let sender = start_node(isolated_config()).await;
    let receiver = start_node(isolated_config()).await;
    let (pool, handler) = transaction_handler();
    let mut admitted = pool.take_notifications().unwrap();
    receiver
        .register_handler(PROTOCOL_TRANSACTION, handler.clone())
        .unwrap();

    sender.connect(&dial_addr(&receiver)).await.unwrap();
    let tx = make_tx(0);
    let reached = sender
        .broadcast(TransactionHandler::encode(&tx).unwrap())
        .await;
    assert_eq!(reached, 1);

    let notified = tokio::time::timeout(Duration::from_secs(10), admitted.recv())
        .await
        .expect("admission notification")
        .expect("notification channel open");
    assert_eq!(notified.hash, tx.hash);
    assert_eq!(
        pool.get_transaction_status(&tx.hash).unwrap(),
        TxStatus::Pending
    );

    // Confirming advances the sender's nonce; the next transaction follows.
    handler.confirm(&tx.hash).unwrap();
    let next = make_tx(1);
    sender
        .broadcast(TransactionHandler::encode(&next).unwrap())
        .await;
    wait_for("second admission", || pool.has_transaction(&next.hash)).await;

    sender.stop().await;
    receiver.stop().await;
}

#[tokio::test]
async fn invalid_transaction_never_reaches_pool() {
    let sender = start_node(isolated_config()).await;
    let receiver = start_node(isolated_config()).await;
    let (pool, handler) = transaction_handler();
    receiver
        .register_handler(PROTOCOL_TRANSACTION, handler)
        .unwrap();
    sender.connect(&dial_addr(&receiver)).await.unwrap();

    let mut unsigned = make_tx(0);
    unsigned.signature.clear();
    let valid = make_tx(0);

    sender
        .broadcast(TransactionHandler::encode(&unsigned).unwrap())
        .await;
    sender
        .broadcast(TransactionHandler::encode(&valid).unwrap())
        .await;

    // Same stream, so the valid one arriving means the bad one was handled.
    wait_for("valid admission", || pool.has_transaction(&valid.hash)).await;
    assert!(!pool.has_transaction(&unsigned.hash));
    assert_eq!(pool.get_status().current_size, 1);

    sender.stop().await;
    receiver.stop().await;
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rendezvous_lookup_connects_the_mesh() {
    let seed = start_node(routing_config(Vec::new())).await;
    let b = start_node(routing_config(vec![dial_addr(&seed)])).await;
    let c = start_node(routing_config(vec![dial_addr(&seed)])).await;

    // `b` and `c` only know the seed; looking up the rendezvous providers
    // introduces them to each other.
    wait_for("b learns c", || b.has_peer(&c.local_peer_id())).await;
    wait_for("c learns b", || c.has_peer(&b.local_peer_id())).await;
    assert!(b.discovery().routing_table_size() >= 2);

    for node in [seed, b, c] {
        node.stop().await;
    }
}

#[tokio::test]
async fn peers_rejected_at_the_limit_are_retried_later() {
    let hub = start_node(routing_config(Vec::new())).await;
    let b = start_node(routing_config(vec![dial_addr(&hub)])).await;
    let c = start_node(routing_config(vec![dial_addr(&hub)])).await;

    // `a` learns the hub through discovery only and has room for one peer.
    let mut config = routing_config(Vec::new());
    config.max_peers = 1;
    config.accept_inbound_peers = false;
    config.discovery.bootstrap_peers = vec![dial_addr(&hub)];
    let a = start_node(config).await;

    wait_for("a fills its only slot", || a.peer_count() == 1).await;
    wait_for("a routes to every node", || {
        a.discovery().routing_table_size() >= 3
    })
    .await;

    let others = [hub, b, c];
    let connected = a.get_peers()[0].id.clone();
    let first = others
        .iter()
        .position(|n| n.local_peer_id().to_string() == connected)
        .expect("a is connected to one of the others");
    let first_id = others[first].local_peer_id();
    others[first].stop().await;
    assert!(a.remove_peer(&first_id).await);

    // The nodes turned away earlier are offered again and one takes the
    // free slot.
    wait_for("a replaces the lost peer", || {
        a.peer_count() == 1 && !a.has_peer(&first_id)
    })
    .await;

    a.stop().await;
    for node in others {
        node.stop().await;
    }
}
