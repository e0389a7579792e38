//! # Protocol Registry & Dispatch
//!
//! The [`ProtocolManager`] maps protocol ids to [`MessageHandler`]s and
//! keeps per-protocol traffic counters. Registering a protocol also points
//! the transport's acceptor for it at the node's inbound queue, so remote
//! peers can deliver to it. The node's dispatch loop drains that queue
//! through [`ProtocolManager::handle_message`].
//!
//! ## Design
//!
//! - Handlers are invoked outside the registry lock, so a handler may
//!   itself register or remove protocols.
//! - Counters are updated under the registry's write lock, so concurrent
//!   senders of the same protocol never lose increments.
//! - Handler errors are counted and returned to the caller. Nothing is
//!   retried here.
//! - The transport's own protocols (messaging, routing) cannot be
//!   registered.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

use super::message::{InvalidProtocolId, Message, ProtocolId};
use super::transport::Transport;
use crate::config::{PROTOCOL_MESSAGING, PROTOCOL_ROUTING};

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Error type handlers return. Any error works.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Consumer of every inbound message of one protocol.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self(message)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol {0} already registered")]
    AlreadyRegistered(ProtocolId),

    #[error("protocol {0} is reserved by the transport")]
    Reserved(ProtocolId),

    #[error("no handler for protocol {0}")]
    NoHandler(ProtocolId),

    #[error("handler error on {protocol}: {source}")]
    Handler {
        protocol: ProtocolId,
        #[source]
        source: HandlerError,
    },

    #[error(transparent)]
    InvalidId(#[from] InvalidProtocolId),
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Traffic counters of one protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProtocolMetrics {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub errors: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// Public view of a registration.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolInfo {
    pub id: ProtocolId,
    pub registered_at: DateTime<Utc>,
    pub metrics: ProtocolMetrics,
}

struct ProtocolEntry {
    handler: Arc<dyn MessageHandler>,
    registered_at: DateTime<Utc>,
    metrics: ProtocolMetrics,
}

// ---------------------------------------------------------------------------
// ProtocolManager
// ---------------------------------------------------------------------------

pub struct ProtocolManager {
    transport: Arc<Transport>,
    registry: RwLock<HashMap<ProtocolId, ProtocolEntry>>,
    inbound: mpsc::Sender<Message>,
}

impl fmt::Debug for ProtocolManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolManager")
            .field("protocols", &self.protocols())
            .finish()
    }
}

impl ProtocolManager {
    /// `inbound` receives every message remote peers deliver on a
    /// registered protocol.
    pub fn new(transport: Arc<Transport>, inbound: mpsc::Sender<Message>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            registry: RwLock::new(HashMap::new()),
            inbound,
        })
    }

    /// Register `handler` for `protocol` and start accepting it from peers.
    ///
    /// Fails if the id is malformed, reserved or already registered. A
    /// failed registration leaves the existing handler in place.
    pub fn register_protocol(
        &self,
        protocol: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ProtocolId, ProtocolError> {
        let id = ProtocolId::parse(protocol)?;
        if id.as_str() == PROTOCOL_MESSAGING || id.as_str() == PROTOCOL_ROUTING {
            return Err(ProtocolError::Reserved(id));
        }

        {
            let mut registry = self.registry.write();
            if registry.contains_key(&id) {
                return Err(ProtocolError::AlreadyRegistered(id));
            }
            registry.insert(
                id.clone(),
                ProtocolEntry {
                    handler,
                    registered_at: Utc::now(),
                    metrics: ProtocolMetrics::default(),
                },
            );
        }
        self.transport
            .set_stream_handler(id.clone(), self.inbound.clone());

        info!(protocol = %id, "protocol registered");
        Ok(id)
    }

    /// Unregister `protocol` and stop accepting it from peers. Returns
    /// `false` if it was not registered.
    pub fn remove_protocol(&self, protocol: &ProtocolId) -> bool {
        let removed = self.registry.write().remove(protocol).is_some();
        if !removed {
            return false;
        }
        self.transport.remove_stream_handler(protocol);
        info!(%protocol, "protocol removed");
        true
    }

    /// Dispatch `message` to the handler of its protocol and record the
    /// outcome.
    pub fn handle_message(&self, message: &Message) -> Result<(), ProtocolError> {
        let handler = self
            .registry
            .read()
            .get(&message.protocol)
            .map(|entry| Arc::clone(&entry.handler))
            .ok_or_else(|| ProtocolError::NoHandler(message.protocol.clone()))?;

        let result = handler.handle(message);

        if let Some(entry) = self.registry.write().get_mut(&message.protocol) {
            let metrics = &mut entry.metrics;
            metrics.messages_received += 1;
            metrics.bytes_received += message.payload.len() as u64;
            metrics.last_activity = Some(Utc::now());
            if result.is_err() {
                metrics.errors += 1;
            }
        }

        result.map_err(|source| ProtocolError::Handler {
            protocol: message.protocol.clone(),
            source,
        })
    }

    /// Count a message delivered for `protocol`. Unregistered protocols are not
    /// tracked.
    pub fn record_sent(&self, protocol: &ProtocolId, bytes: usize) {
        if let Some(entry) = self.registry.write().get_mut(protocol) {
            entry.metrics.messages_sent += 1;
            entry.metrics.bytes_sent += bytes as u64;
            entry.metrics.last_activity = Some(Utc::now());
        }
    }

    pub fn is_registered(&self, protocol: &ProtocolId) -> bool {
        self.registry.read().contains_key(protocol)
    }

    pub fn get_protocol(&self, protocol: &ProtocolId) -> Option<ProtocolInfo> {
        self.registry.read().get(protocol).map(|entry| ProtocolInfo {
            id: protocol.clone(),
            registered_at: entry.registered_at,
            metrics: entry.metrics.clone(),
        })
    }

    pub fn metrics(&self, protocol: &ProtocolId) -> Option<ProtocolMetrics> {
        self.get_protocol(protocol).map(|info| info.metrics)
    }

    /// Registered protocol ids, sorted.
    pub fn protocols(&self) -> Vec<ProtocolId> {
        let mut ids: Vec<ProtocolId> = self.registry.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;
    use crate::network::message::MessageType;
    use crate::network::transport::TransportConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    fn manager() -> (Arc<ProtocolManager>, mpsc::Receiver<Message>) {
        let transport = Arc::new(Transport::new(
            NodeIdentity::generate(),
            TransportConfig::default(),
            CancellationToken::new(),
        ));
        let (tx, rx) = mpsc::channel(16);
        (ProtocolManager::new(transport, tx), rx)
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> Arc<dyn MessageHandler> {
        Arc::new(move |_: &Message| -> Result<(), HandlerError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn test_message() -> Message {
        Message::with_protocol(ProtocolId::parse("/test/1.0.0").unwrap(), b"abc".to_vec())
    }

    // -- Registration -------------------------------------------------------

    #[test]
    fn register_and_dispatch() {
        let (pm, _rx) = manager();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = pm
            .register_protocol("/test/1.0.0", counting_handler(hits.clone()))
            .unwrap();

        assert!(pm.is_registered(&id));
        assert!(pm.transport.supports(&id));
        pm.handle_message(&test_message()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_registration_keeps_original_handler() {
        let (pm, _rx) = manager();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        pm.register_protocol("/test/1.0.0", counting_handler(first.clone()))
            .unwrap();
        let err = pm
            .register_protocol("/test/1.0.0", counting_handler(second.clone()))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::AlreadyRegistered(_)));

        pm.handle_message(&test_message()).unwrap();
        pm.handle_message(&test_message()).unwrap();
        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalid_and_reserved_ids_rejected() {
        let (pm, _rx) = manager();
        let hits = Arc::new(AtomicUsize::new(0));
        assert!(matches!(
            pm.register_protocol("/test/invalid", counting_handler(hits.clone())),
            Err(ProtocolError::InvalidId(_))
        ));
        assert!(matches!(
            pm.register_protocol(PROTOCOL_MESSAGING, counting_handler(hits.clone())),
            Err(ProtocolError::Reserved(_))
        ));
        assert!(matches!(
            pm.register_protocol(PROTOCOL_ROUTING, counting_handler(hits)),
            Err(ProtocolError::Reserved(_))
        ));
        assert!(pm.protocols().is_empty());
    }

    #[test]
    fn remove_detaches_acceptor() {
        let (pm, _rx) = manager();
        let id = pm
            .register_protocol("/test/1.0.0", counting_handler(Arc::default()))
            .unwrap();

        assert!(pm.remove_protocol(&id));
        assert!(!pm.remove_protocol(&id));
        assert!(!pm.transport.supports(&id));
        assert!(matches!(
            pm.handle_message(&test_message()),
            Err(ProtocolError::NoHandler(_))
        ));
    }

    // -- Dispatch & metrics -------------------------------------------------

    #[test]
    fn unknown_protocol_has_no_handler() {
        let (pm, _rx) = manager();
        let msg = Message::new(MessageType::Block, vec![]);
        let err = pm.handle_message(&msg).unwrap_err();
        assert_eq!(err.to_string(), "no handler for protocol /aporia-zero/block/1.0.0");
    }

    #[test]
    fn handler_errors_surface_and_count() {
        let (pm, _rx) = manager();
        let failing: Arc<dyn MessageHandler> =
            Arc::new(|_: &Message| -> Result<(), HandlerError> { Err("boom".into()) });
        let id = pm.register_protocol("/test/1.0.0", failing).unwrap();

        let err = pm.handle_message(&test_message()).unwrap_err();
        assert!(matches!(err, ProtocolError::Handler { .. }));
        assert!(err.to_string().contains("boom"));

        let metrics = pm.metrics(&id).unwrap();
        assert_eq!(metrics.messages_received, 1);
        assert_eq!(metrics.errors, 1);
    }

    #[test]
    fn metrics_track_both_directions() {
        let (pm, _rx) = manager();
        let id = pm
            .register_protocol("/test/1.0.0", counting_handler(Arc::default()))
            .unwrap();
        assert_eq!(pm.metrics(&id).unwrap(), ProtocolMetrics::default());

        pm.handle_message(&test_message()).unwrap();
        pm.record_sent(&id, 40);
        pm.record_sent(&id, 2);

        let m = pm.metrics(&id).unwrap();
        assert_eq!(m.messages_received, 1);
        assert_eq!(m.bytes_received, 3);
        assert_eq!(m.messages_sent, 2);
        assert_eq!(m.bytes_sent, 42);
        assert!(m.last_activity.is_some());
    }

    #[test]
    fn concurrent_dispatch_loses_no_updates() {
        let (pm, _rx) = manager();
        let id = pm
            .register_protocol("/test/1.0.0", counting_handler(Arc::default()))
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pm = Arc::clone(&pm);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        pm.handle_message(&test_message()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread panicked");
        }
        assert_eq!(pm.metrics(&id).unwrap().messages_received, 800);
    }
}
