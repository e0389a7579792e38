//! # Peer Discovery
//!
//! The [`DiscoveryService`] finds candidate peers through two independent
//! strategies and offers each one to a single admission step:
//!
//! - **Rendezvous routing**: the transport's Kademlia table, seeded from the
//!   bootstrap peers. Every `announce_interval` the service publishes a
//!   provider record under its rendezvous tag; every `discovery_interval` it
//!   refreshes the table and looks up the other providers of the tag.
//! - **Local subnet**: mDNS, run by the transport. Every local peer it
//!   reports is handed to [`DiscoveryService::handle_local_peer`].
//!
//! ## Admission
//!
//! A discovered peer joins the discovered set only if the set is below
//! `max_peers` and the id is new. Admitted peers are pushed onto a bounded
//! notification queue with `try_send`; when the queue is full the
//! notification is dropped. Discovery never waits on its consumers.
//!
//! Network errors inside the loop are logged and retried on the next tick.
//! They never stop the service.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use super::addr::PeerAddr;
use super::transport::Transport;
use crate::config::{
    ANNOUNCE_INTERVAL, DISCOVERY_INTERVAL, DISCOVERY_QUEUE_CAPACITY, LOCAL_QUERY_INTERVAL,
    MAX_PEERS, NODE_PROTOCOL_ID,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Enable rendezvous discovery over the routing table.
    pub routing_enabled: bool,
    /// Enable mDNS local-subnet discovery.
    pub local_enabled: bool,
    /// Full peer addresses seeding the routing table.
    pub bootstrap_peers: Vec<String>,
    /// Tag peers advertise under. Defaults to the node protocol id.
    pub rendezvous: String,
    /// Interval between rendezvous lookups.
    pub discovery_interval: Duration,
    /// Interval between re-publications of our provider record.
    pub announce_interval: Duration,
    /// Interval between mDNS queries.
    pub local_query_interval: Duration,
    /// Cap on the discovered set.
    pub max_peers: usize,
    pub notification_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            routing_enabled: true,
            local_enabled: true,
            bootstrap_peers: Vec::new(),
            rendezvous: NODE_PROTOCOL_ID.to_string(),
            discovery_interval: DISCOVERY_INTERVAL,
            announce_interval: ANNOUNCE_INTERVAL,
            local_query_interval: LOCAL_QUERY_INTERVAL,
            max_peers: MAX_PEERS,
            notification_capacity: DISCOVERY_QUEUE_CAPACITY,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors & state
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery service already active")]
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiscoveryState {
    Stopped,
    Active,
}

// ---------------------------------------------------------------------------
// DiscoveryService
// ---------------------------------------------------------------------------

pub struct DiscoveryService {
    config: DiscoveryConfig,
    local_id: PeerId,
    transport: Arc<Transport>,
    state: RwLock<DiscoveryState>,
    discovered: RwLock<HashMap<PeerId, PeerAddr>>,
    notify_tx: mpsc::Sender<PeerAddr>,
    notify_rx: Mutex<Option<mpsc::Receiver<PeerAddr>>>,
    shutdown: CancellationToken,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: TaskTracker,
}

impl fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("state", &self.state())
            .field("discovered", &self.peer_count())
            .field("routing_entries", &self.routing_table_size())
            .finish()
    }
}

impl DiscoveryService {
    /// Create a stopped service on top of `transport`. Its loop also ends
    /// when `shutdown` is cancelled.
    pub fn new(
        transport: Arc<Transport>,
        config: DiscoveryConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::channel(config.notification_capacity.max(1));
        Arc::new(Self {
            local_id: transport.local_peer_id(),
            transport,
            config,
            state: RwLock::new(DiscoveryState::Stopped),
            discovered: RwLock::new(HashMap::new()),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            shutdown,
            cancel: Mutex::new(None),
            tasks: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.read()
    }

    /// Seed the routing table and start the rendezvous loop. The transport
    /// must already be started.
    pub async fn start(self: &Arc<Self>) -> Result<(), DiscoveryError> {
        {
            let mut state = self.state.write();
            if *state == DiscoveryState::Active {
                return Err(DiscoveryError::AlreadyActive);
            }
            *state = DiscoveryState::Active;
        }

        let cancel = self.shutdown.child_token();
        *self.cancel.lock() = Some(cancel.clone());
        self.tasks.reopen();

        if self.config.routing_enabled {
            self.seed_bootstrap().await;
            let this = Arc::clone(self);
            self.tasks.spawn(async move { this.routing_loop(cancel).await });
        }

        info!(
            rendezvous = %self.config.rendezvous,
            routing = self.config.routing_enabled,
            local = self.config.local_enabled,
            "discovery started"
        );
        Ok(())
    }

    /// Cancel the loop, wait for it and withdraw our provider record.
    pub async fn stop(&self) {
        if self.state() == DiscoveryState::Stopped {
            return;
        }
        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        self.tasks.close();
        self.tasks.wait().await;
        if self.config.routing_enabled {
            self.transport.stop_providing(&self.config.rendezvous).await;
        }
        *self.state.write() = DiscoveryState::Stopped;
        info!("discovery stopped");
    }

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    /// Offer a discovered peer. Returns `true` if it was admitted. Duplicates,
    /// the local node and discoveries beyond `max_peers` are dropped.
    pub fn handle_peer_found(&self, peer: PeerAddr) -> bool {
        if peer.peer_id == self.local_id {
            return false;
        }
        let total = {
            let mut discovered = self.discovered.write();
            if discovered.len() >= self.config.max_peers || discovered.contains_key(&peer.peer_id) {
                return false;
            }
            discovered.insert(peer.peer_id, peer.clone());
            discovered.len()
        };

        let id = peer.peer_id;
        if let Err(e) = self.notify_tx.try_send(peer) {
            debug!(peer = %id, reason = %e, "discovery notification dropped");
        }
        info!(peer = %id, total_peers = total, "discovered new peer");
        true
    }

    /// Offer a peer found on the local subnet. Ignored unless local
    /// discovery is enabled and the service is active.
    pub fn handle_local_peer(&self, peer: PeerAddr) -> bool {
        if !self.config.local_enabled || self.state() != DiscoveryState::Active {
            trace!(peer = %peer.peer_id, "local peer ignored");
            return false;
        }
        self.handle_peer_found(peer)
    }

    /// Forget a discovered peer so it can be admitted again later.
    pub fn remove_peer(&self, peer: &PeerId) -> bool {
        let removed = self.discovered.write().remove(peer).is_some();
        if removed {
            info!(peer = %peer, total_peers = self.peer_count(), "removed discovered peer");
        }
        removed
    }

    pub fn discovered_peers(&self) -> Vec<PeerAddr> {
        self.discovered.read().values().cloned().collect()
    }

    pub fn is_discovered(&self, peer: &PeerId) -> bool {
        self.discovered.read().contains_key(peer)
    }

    pub fn peer_count(&self) -> usize {
        self.discovered.read().len()
    }

    pub fn routing_table_size(&self) -> usize {
        self.transport.routing_table_size()
    }

    /// Receiver of admitted peers. Only the first caller gets it.
    pub fn take_notifications(&self) -> Option<mpsc::Receiver<PeerAddr>> {
        self.notify_rx.lock().take()
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// One lookup round: refresh the routing table, then offer every
    /// dialable provider of the rendezvous tag to admission. Returns how
    /// many were admitted.
    pub async fn routing_tick(&self) -> usize {
        if let Err(e) = self.transport.refresh_routing().await {
            debug!(error = %e, "routing refresh failed");
        }
        let providers = match self.transport.find_providers(&self.config.rendezvous).await {
            Ok(providers) => providers,
            Err(e) => {
                debug!(error = %e, "rendezvous lookup failed");
                return 0;
            }
        };
        let found = providers.len();
        let admitted = providers
            .into_iter()
            .filter(PeerAddr::is_dialable)
            .filter(|peer| self.handle_peer_found(peer.clone()))
            .count();
        trace!(found, admitted, "rendezvous lookup finished");
        admitted
    }

    async fn announce(&self) {
        match self.transport.provide(&self.config.rendezvous).await {
            Ok(()) => trace!(rendezvous = %self.config.rendezvous, "provider record published"),
            Err(e) => debug!(error = %e, "provider record not published"),
        }
    }

    async fn seed_bootstrap(&self) {
        let mut peers = Vec::with_capacity(self.config.bootstrap_peers.len());
        for raw in &self.config.bootstrap_peers {
            match raw.parse::<PeerAddr>() {
                Ok(peer) => peers.push(peer),
                Err(e) => warn!(addr = %raw, error = %e, "skipping invalid bootstrap address"),
            }
        }
        if peers.is_empty() {
            return;
        }
        if let Err(e) = self.transport.add_routing_peers(peers).await {
            warn!(error = %e, "failed to seed routing table");
        }
    }

    async fn routing_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut announce = tokio::time::interval(self.config.announce_interval);
        announce.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lookup = tokio::time::interval(self.config.discovery_interval);
        lookup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = announce.tick() => self.announce().await,
                _ = lookup.tick() => {
                    self.routing_tick().await;
                }
            }
        }
        trace!("routing loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use crate::network::transport::TransportConfig;

    fn make_peer(port: u16) -> PeerAddr {
        PeerAddr::new(
            PeerId::random(),
            vec![format!("/ip4/127.0.0.1/tcp/{port}").parse().unwrap()],
        )
    }

    fn quiet_config() -> DiscoveryConfig {
        DiscoveryConfig {
            routing_enabled: false,
            local_enabled: false,
            ..DiscoveryConfig::default()
        }
    }

    fn idle_transport() -> Arc<Transport> {
        Arc::new(Transport::new(
            NodeIdentity::generate(),
            TransportConfig::default(),
            CancellationToken::new(),
        ))
    }

    async fn routing_transport() -> Arc<Transport> {
        let transport = Arc::new(Transport::new(
            NodeIdentity::generate(),
            TransportConfig {
                routing_enabled: true,
                ..TransportConfig::default()
            },
            CancellationToken::new(),
        ));
        transport.start().unwrap();
        transport
            .listen(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        transport
    }

    fn test_service(config: DiscoveryConfig) -> Arc<DiscoveryService> {
        DiscoveryService::new(idle_transport(), config, CancellationToken::new())
    }

    // -- Admission ----------------------------------------------------------

    #[test]
    fn admits_new_peers_once() {
        let svc = test_service(quiet_config());
        let mut rx = svc.take_notifications().unwrap();
        let peer = make_peer(1);

        assert!(svc.handle_peer_found(peer.clone()));
        assert!(!svc.handle_peer_found(peer.clone()));
        assert_eq!(svc.peer_count(), 1);
        assert!(svc.is_discovered(&peer.peer_id));
        assert_eq!(rx.try_recv().unwrap(), peer);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn ignores_local_node() {
        let svc = test_service(quiet_config());
        assert!(!svc.handle_peer_found(PeerAddr::new(svc.local_id, vec![])));
        assert_eq!(svc.peer_count(), 0);
    }

    #[test]
    fn admission_stops_at_max_peers() {
        let svc = test_service(DiscoveryConfig {
            max_peers: 2,
            ..quiet_config()
        });
        assert!(svc.handle_peer_found(make_peer(1)));
        assert!(svc.handle_peer_found(make_peer(2)));
        assert!(!svc.handle_peer_found(make_peer(3)));
        assert_eq!(svc.peer_count(), 2);
    }

    #[test]
    fn full_notification_queue_drops_without_blocking() {
        let svc = test_service(DiscoveryConfig {
            notification_capacity: 1,
            ..quiet_config()
        });
        let mut rx = svc.take_notifications().unwrap();
        assert!(svc.take_notifications().is_none());

        for port in 0..5 {
            assert!(svc.handle_peer_found(make_peer(port)));
        }
        assert_eq!(svc.peer_count(), 5);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn removed_peer_can_be_rediscovered() {
        let svc = test_service(quiet_config());
        let peer = make_peer(1);
        svc.handle_peer_found(peer.clone());
        assert!(svc.remove_peer(&peer.peer_id));
        assert!(!svc.remove_peer(&peer.peer_id));
        assert!(svc.handle_peer_found(peer));
    }

    #[tokio::test]
    async fn local_peers_need_local_discovery_and_active_state() {
        let off = test_service(quiet_config());
        off.start().await.unwrap();
        assert!(!off.handle_local_peer(make_peer(1)));

        let on = test_service(DiscoveryConfig {
            local_enabled: true,
            ..quiet_config()
        });
        assert!(!on.handle_local_peer(make_peer(2)));
        on.start().await.unwrap();
        assert!(on.handle_local_peer(make_peer(3)));
        on.stop().await;
        assert!(!on.handle_local_peer(make_peer(4)));
        assert_eq!(on.peer_count(), 1);
    }

    // -- Routing ------------------------------------------------------------

    #[tokio::test]
    async fn routing_tick_admits_rendezvous_providers() {
        let provider = routing_transport().await;
        provider.provide(NODE_PROTOCOL_ID).await.unwrap();

        let transport = routing_transport().await;
        transport
            .add_routing_peers(vec![provider.local_addr()])
            .await
            .unwrap();
        let svc = DiscoveryService::new(
            Arc::clone(&transport),
            DiscoveryConfig {
                local_enabled: false,
                ..DiscoveryConfig::default()
            },
            CancellationToken::new(),
        );
        let mut found = svc.take_notifications().unwrap();

        assert_eq!(svc.routing_tick().await, 1);
        assert_eq!(found.try_recv().unwrap().peer_id, provider.local_peer_id());
        // Already discovered; nothing new the second time.
        assert_eq!(svc.routing_tick().await, 0);
        assert_eq!(svc.peer_count(), 1);
    }

    #[tokio::test]
    async fn routing_tick_without_routing_admits_nothing() {
        let svc = test_service(quiet_config());
        assert_eq!(svc.routing_tick().await, 0);
        assert_eq!(svc.routing_table_size(), 0);
    }

    // -- Lifecycle ----------------------------------------------------------

    #[tokio::test]
    async fn start_twice_fails_and_bootstrap_seeds_table() {
        let transport = routing_transport().await;
        let svc = DiscoveryService::new(
            transport,
            DiscoveryConfig {
                routing_enabled: true,
                bootstrap_peers: vec![make_peer(1).to_string(), "garbage".into()],
                discovery_interval: Duration::from_secs(3600),
                ..quiet_config()
            },
            CancellationToken::new(),
        );

        svc.start().await.unwrap();
        assert_eq!(svc.state(), DiscoveryState::Active);
        assert_eq!(svc.routing_table_size(), 1);
        assert!(matches!(svc.start().await, Err(DiscoveryError::AlreadyActive)));

        svc.stop().await;
        assert_eq!(svc.state(), DiscoveryState::Stopped);

        // Restart is allowed once stopped.
        svc.start().await.unwrap();
        svc.stop().await;
    }
}
