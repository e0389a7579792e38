//! # Prometheus Metrics
//!
//! Process-level metrics for the node, scraped at `/metrics`. Values are
//! copied from the live [`Node`] and [`TransactionPool`] by a periodic
//! sampler rather than updated inline, so the library stays free of any
//! global metrics registry.
//!
//! All metrics live in a dedicated [`prometheus::Registry`] with the
//! `aporia` prefix.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use aporia_protocol::mempool::TransactionPool;
use aporia_protocol::network::Node;

/// Metric handles for the node. Cloning shares the underlying values.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Number of currently connected peers.
    pub connected_peers: IntGauge,
    /// Transactions held by the pool in any state.
    pub pool_size: IntGauge,
    pub pool_pending: IntGauge,
    /// Transactions refused by the pool since startup.
    pub pool_rejected: IntGauge,
    pub pool_expired: IntGauge,
    /// Transactions announced by the pool's notification stream.
    pub transactions_admitted_total: IntCounter,
    /// Messages dispatched to handlers, per protocol.
    pub protocol_messages_received: IntGaugeVec,
    /// Messages written to peers, per protocol.
    pub protocol_messages_sent: IntGaugeVec,
}

impl NodeMetrics {
    /// Create and register every metric. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("aporia".into()), None)?;

        let connected_peers =
            IntGauge::new("connected_peers", "Number of currently connected peers")?;
        registry.register(Box::new(connected_peers.clone()))?;

        let pool_size = IntGauge::new("pool_size", "Transactions held by the pool")?;
        registry.register(Box::new(pool_size.clone()))?;

        let pool_pending =
            IntGauge::new("pool_pending", "Pending transactions held by the pool")?;
        registry.register(Box::new(pool_pending.clone()))?;

        let pool_rejected = IntGauge::new(
            "pool_rejected",
            "Transactions refused by the pool since startup",
        )?;
        registry.register(Box::new(pool_rejected.clone()))?;

        let pool_expired = IntGauge::new(
            "pool_expired",
            "Transactions evicted by the expiry sweep since startup",
        )?;
        registry.register(Box::new(pool_expired.clone()))?;

        let transactions_admitted_total = IntCounter::new(
            "transactions_admitted_total",
            "Transactions admitted into the pool",
        )?;
        registry.register(Box::new(transactions_admitted_total.clone()))?;

        let protocol_messages_received = IntGaugeVec::new(
            Opts::new(
                "protocol_messages_received",
                "Inbound messages dispatched to a handler",
            ),
            &["protocol"],
        )?;
        registry.register(Box::new(protocol_messages_received.clone()))?;

        let protocol_messages_sent = IntGaugeVec::new(
            Opts::new("protocol_messages_sent", "Outbound messages written to peers"),
            &["protocol"],
        )?;
        registry.register(Box::new(protocol_messages_sent.clone()))?;

        Ok(Self {
            registry,
            connected_peers,
            pool_size,
            pool_pending,
            pool_rejected,
            pool_expired,
            transactions_admitted_total,
            protocol_messages_received,
            protocol_messages_sent,
        })
    }

    /// Copy current values out of the node and the pool.
    pub fn sample(&self, node: &Node, pool: &TransactionPool) {
        self.connected_peers.set(node.peer_count() as i64);

        let status = pool.get_status();
        self.pool_size.set(status.current_size as i64);
        self.pool_pending.set(status.pending_count as i64);
        self.pool_rejected.set(status.rejected_count as i64);
        self.pool_expired.set(status.expired_count as i64);

        let protocols = node.protocols();
        for id in protocols.protocols() {
            let Some(metrics) = protocols.metrics(&id) else {
                continue;
            };
            self.protocol_messages_received
                .with_label_values(&[id.as_str()])
                .set(metrics.messages_received as i64);
            self.protocol_messages_sent
                .with_label_values(&[id.as_str()])
                .set(metrics.messages_sent as i64);
        }
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Routes for the metrics listener: `/metrics` and `/health`.
pub fn router(metrics: SharedMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics)
}

/// Renders `/metrics`. Returns HTTP 500 if encoding fails.
pub async fn metrics_handler(State(metrics): State<SharedMetrics>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

async fn health_handler() -> &'static str {
    "ok"
}
