//! # Node Configuration File
//!
//! TOML settings for `aporia-node`. Every section is optional and falls back
//! to the library defaults, so an empty file (or no file at all) yields a
//! working node.
//!
//! ```toml
//! [network]
//! listen_addresses = ["/ip4/0.0.0.0/tcp/9740"]
//! bootstrap_peers = []
//! max_peers = 50
//!
//! [discovery]
//! routing_enabled = true
//! local_enabled = true
//!
//! [mempool]
//! max_size = 10000
//!
//! [metrics]
//! enabled = true
//! listen = "0.0.0.0:9742"
//!
//! [logging]
//! level = "aporia_node=info,aporia_protocol=info"
//! format = "pretty"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use aporia_protocol::config;
use aporia_protocol::mempool::{PoolConfig, SignatureShapeVerifier, ValidationConfig};
use aporia_protocol::network::{DiscoveryConfig, NodeConfig};

use crate::cli::RunArgs;
use crate::logging::DEFAULT_LOG_FILTER;

/// Default address of the metrics endpoint.
pub const DEFAULT_METRICS_LISTEN: &str = "0.0.0.0:9742";

/// Name of the key file written by `init`.
pub const KEY_FILE_NAME: &str = "node.key";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub network: NetworkSection,
    pub discovery: DiscoverySection,
    pub mempool: MempoolSection,
    pub validation: ValidationSection,
    pub metrics: MetricsSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    pub listen_addresses: Vec<String>,
    pub bootstrap_peers: Vec<String>,
    pub max_peers: usize,
    pub protocol_id: String,
    pub accept_inbound_peers: bool,
    pub inbound_queue_capacity: usize,
    pub send_timeout_secs: u64,
    /// Path to the hex-encoded node key. Relative paths resolve against the
    /// working directory.
    pub key_file: PathBuf,
}

impl Default for NetworkSection {
    fn default() -> Self {
        let node = NodeConfig::default();
        Self {
            listen_addresses: node.listen_addresses,
            bootstrap_peers: node.bootstrap_peers,
            max_peers: node.max_peers,
            protocol_id: node.protocol_id,
            accept_inbound_peers: node.accept_inbound_peers,
            inbound_queue_capacity: node.inbound_queue_capacity,
            send_timeout_secs: node.send_timeout.as_secs(),
            key_file: PathBuf::from(".aporia").join(KEY_FILE_NAME),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoverySection {
    pub routing_enabled: bool,
    pub local_enabled: bool,
    pub discovery_interval_secs: u64,
    pub announce_interval_secs: u64,
    pub local_query_interval_secs: u64,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        let discovery = DiscoveryConfig::default();
        Self {
            routing_enabled: discovery.routing_enabled,
            local_enabled: discovery.local_enabled,
            discovery_interval_secs: discovery.discovery_interval.as_secs(),
            announce_interval_secs: discovery.announce_interval.as_secs(),
            local_query_interval_secs: discovery.local_query_interval.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolSection {
    pub max_size: usize,
    pub max_transaction_size: usize,
    pub expiration_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for MempoolSection {
    fn default() -> Self {
        Self {
            max_size: config::MEMPOOL_MAX_SIZE,
            max_transaction_size: config::MAX_TX_SIZE_BYTES,
            expiration_secs: config::TX_EXPIRATION.as_secs(),
            cleanup_interval_secs: config::MEMPOOL_CLEANUP_INTERVAL.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    pub min_computation_cost: u64,
    pub max_computation_cost: u64,
    /// Signature length window for the placeholder shape check.
    pub signature_min_len: usize,
    pub signature_max_len: usize,
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            min_computation_cost: config::MIN_COMPUTATION_COST,
            max_computation_cost: config::MAX_COMPUTATION_COST,
            signature_min_len: config::SIGNATURE_MIN_LEN,
            signature_max_len: config::SIGNATURE_MAX_LEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub enabled: bool,
    pub listen: String,
    pub sample_interval_secs: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: DEFAULT_METRICS_LISTEN.to_string(),
            sample_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_FILTER.to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl NodeSettings {
    /// Read settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = toml::to_string_pretty(self).context("failed to serialize settings")?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create config directory {}", parent.display())
                })?;
            }
        }
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write config file {}", path.display()))
    }

    /// Fold command-line flags over the file values.
    pub fn apply_overrides(&mut self, args: &RunArgs) {
        if let Some(port) = args.p2p_port {
            self.network.listen_addresses = vec![format!("/ip4/0.0.0.0/tcp/{port}")];
        }
        if !args.bootstrap.is_empty() {
            self.network.bootstrap_peers = args.bootstrap.clone();
        }
        if let Some(key_file) = &args.key_file {
            self.network.key_file = key_file.clone();
        }
        if let Some(addr) = &args.metrics_addr {
            self.metrics.listen = addr.clone();
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if let Some(format) = &args.log_format {
            self.logging.format = format.clone();
        }
    }

    pub fn node_config(&self) -> NodeConfig {
        let network = &self.network;
        let discovery = DiscoveryConfig {
            routing_enabled: self.discovery.routing_enabled,
            local_enabled: self.discovery.local_enabled,
            discovery_interval: Duration::from_secs(self.discovery.discovery_interval_secs),
            announce_interval: Duration::from_secs(self.discovery.announce_interval_secs),
            local_query_interval: Duration::from_secs(self.discovery.local_query_interval_secs),
            max_peers: network.max_peers,
            ..DiscoveryConfig::default()
        };
        NodeConfig {
            listen_addresses: network.listen_addresses.clone(),
            bootstrap_peers: network.bootstrap_peers.clone(),
            max_peers: network.max_peers,
            protocol_id: network.protocol_id.clone(),
            accept_inbound_peers: network.accept_inbound_peers,
            inbound_queue_capacity: network.inbound_queue_capacity,
            send_timeout: Duration::from_secs(network.send_timeout_secs),
            discovery,
            ..NodeConfig::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.mempool.max_size,
            max_transaction_size: self.mempool.max_transaction_size,
            expiration: Duration::from_secs(self.mempool.expiration_secs),
            cleanup_interval: Duration::from_secs(self.mempool.cleanup_interval_secs),
            ..PoolConfig::default()
        }
    }

    pub fn validation_config(&self) -> ValidationConfig {
        ValidationConfig {
            min_computation_cost: self.validation.min_computation_cost,
            max_computation_cost: self.validation.max_computation_cost,
        }
    }

    /// Signature check used by the binary. It only checks the length window;
    /// no external signature service is wired in yet.
    pub fn signature_verifier(&self) -> SignatureShapeVerifier {
        SignatureShapeVerifier {
            min_len: self.validation.signature_min_len,
            max_len: self.validation.signature_max_len,
        }
    }
}
