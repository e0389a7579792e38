// Copyright (c) 2026 Aporia Zero Developers. MIT License.
// See LICENSE for details.

//! # Aporia Zero Node
//!
//! Entry point for the `aporia-node` binary. Parses CLI arguments, loads the
//! configuration file and node key, wires the transaction pool into the
//! peer-to-peer node, and serves Prometheus metrics until a shutdown signal
//! arrives.
//!
//! Subcommands:
//!
//! - `run`: start the node
//! - `init`: write a default configuration file and a fresh node key
//! - `version`: print build version information

mod cli;
mod logging;
mod metrics;
mod settings;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use aporia_protocol::config::{PROTOCOL_TRANSACTION, PROTOCOL_VERSION};
use aporia_protocol::identity::NodeIdentity;
use aporia_protocol::mempool::{
    TransactionHandler, TransactionPool, Validator, WorkProofVerifier,
};
use aporia_protocol::network::Node;
use aporia_protocol::transaction::Transaction;

use cli::{AporiaNodeCli, Commands};
use logging::LogFormat;
use metrics::NodeMetrics;
use settings::{NodeSettings, KEY_FILE_NAME};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = AporiaNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the node, the pool and the metrics endpoint, then blocks until
/// SIGINT or SIGTERM.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    let mut settings = NodeSettings::load(&args.config)?;
    settings.apply_overrides(&args);

    logging::init_logging(
        &settings.logging.level,
        LogFormat::from_str_lossy(&settings.logging.format),
    )?;

    let identity = load_or_create_identity(&settings.network.key_file)?;
    tracing::info!(
        peer_id = %identity.peer_id(),
        config = %args.config.display(),
        "starting aporia-node"
    );

    // --- Transaction pool ---
    let pool = Arc::new(TransactionPool::new(settings.pool_config()));
    let notifications = pool
        .take_notifications()
        .ok_or_else(|| anyhow!("pool notification stream already taken"))?;
    pool.start();

    // Signatures only get a length check until an external verifier exists.
    let validator = Arc::new(Validator::new(
        settings.validation_config(),
        Arc::new(WorkProofVerifier),
        Arc::new(settings.signature_verifier()),
    ));
    let handler = Arc::new(TransactionHandler::new(Arc::clone(&pool), validator));

    // --- Node ---
    let node = Node::new(identity, settings.node_config()).context("failed to build node")?;
    node.register_handler(PROTOCOL_TRANSACTION, handler)
        .context("failed to register transaction protocol")?;
    node.start().await.context("failed to start node")?;

    let addrs: Vec<String> = node.listen_addrs().iter().map(|a| a.to_string()).collect();
    tracing::info!(addrs = ?addrs, "node listening");

    // --- Background tasks ---
    let shutdown = CancellationToken::new();
    let tasks = TaskTracker::new();
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to create metrics")?);

    tasks.spawn(consume_notifications(
        notifications,
        Arc::clone(&node_metrics),
        shutdown.clone(),
    ));
    tasks.spawn(sample_metrics(
        Arc::clone(&node),
        Arc::clone(&pool),
        Arc::clone(&node_metrics),
        Duration::from_secs(settings.metrics.sample_interval_secs.max(1)),
        shutdown.clone(),
    ));

    if settings.metrics.enabled {
        let listener = tokio::net::TcpListener::bind(&settings.metrics.listen)
            .await
            .with_context(|| {
                format!("failed to bind metrics listener on {}", settings.metrics.listen)
            })?;
        tracing::info!(addr = %settings.metrics.listen, "metrics server listening");

        let router = metrics::router(Arc::clone(&node_metrics));
        let stop = shutdown.clone();
        tasks.spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "metrics server error");
            }
        });
    }

    shutdown_signal().await?;
    tracing::info!("shutdown signal received");

    shutdown.cancel();
    node.stop().await;
    pool.stop().await;
    tasks.close();
    tasks.wait().await;

    tracing::info!("aporia-node stopped");
    Ok(())
}

/// Logs every transaction the pool admits and counts it.
async fn consume_notifications(
    mut notifications: mpsc::Receiver<Transaction>,
    metrics: Arc<NodeMetrics>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            tx = notifications.recv() => {
                let Some(tx) = tx else { break };
                metrics.transactions_admitted_total.inc();
                tracing::info!(hash = %tx.hash, from = %tx.from, nonce = tx.nonce, "transaction admitted");
            }
        }
    }
}

async fn sample_metrics(
    node: Arc<Node>,
    pool: Arc<TransactionPool>,
    metrics: Arc<NodeMetrics>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => metrics.sample(&node, &pool),
        }
    }
}

/// Reads the hex-encoded node key at `path`, generating and storing a new
/// one if the file does not exist.
fn load_or_create_identity(path: &Path) -> Result<NodeIdentity> {
    if path.exists() {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read node key {}", path.display()))?;
        let bytes = hex::decode(raw.trim())
            .with_context(|| format!("node key {} is not valid hex", path.display()))?;
        let identity = NodeIdentity::from_protobuf_bytes(&bytes)
            .with_context(|| format!("failed to decode node key {}", path.display()))?;
        return Ok(identity);
    }

    let identity = NodeIdentity::generate();
    write_key(path, &identity)?;
    tracing::info!(path = %path.display(), peer_id = %identity.peer_id(), "generated node key");
    Ok(identity)
}

fn write_key(path: &Path, identity: &NodeIdentity) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create key directory {}", parent.display()))?;
        }
    }
    let bytes = identity
        .to_protobuf_bytes()
        .context("failed to encode node key")?;
    std::fs::write(path, hex::encode(bytes))
        .with_context(|| format!("failed to write node key to {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Writes `config.toml` and `node.key` into the data directory.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("aporia_node=info", LogFormat::Pretty)?;

    let data_dir = &args.data_dir;
    let config_path = data_dir.join("config.toml");
    let key_path = data_dir.join(KEY_FILE_NAME);

    if !args.force && (config_path.exists() || key_path.exists()) {
        bail!(
            "{} already holds a node configuration; pass --force to overwrite",
            data_dir.display()
        );
    }

    let mut settings = NodeSettings::default();
    settings.network.key_file = key_path.clone();
    settings.save(&config_path)?;

    let identity = NodeIdentity::generate();
    write_key(&key_path, &identity)?;

    tracing::info!(data_dir = %data_dir.display(), peer_id = %identity.peer_id(), "node initialized");

    println!("Node initialized successfully.");
    println!("  Config file : {}", config_path.display());
    println!("  Node key    : {}", key_path.display());
    println!("  Peer id     : {}", identity.peer_id());

    Ok(())
}

fn print_version() {
    println!("aporia-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol    {}", PROTOCOL_VERSION);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            res = signal::ctrl_c() => res.context("failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    Ok(())
}
