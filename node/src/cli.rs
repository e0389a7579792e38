//! # CLI Interface
//!
//! Command-line structure for `aporia-node`, built with `clap` derive.
//! Three subcommands: `run`, `init` and `version`. Flags given to `run`
//! override the matching values of the configuration file.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Aporia Zero peer-to-peer node.
///
/// Connects to the Aporia Zero network, relays transactions between
/// directly connected peers and keeps a local pool of pending
/// transactions. Exposes Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "aporia-node",
    about = "Aporia Zero peer-to-peer node",
    version,
    propagate_version = true
)]
pub struct AporiaNodeCli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Write a default configuration file and a fresh node key.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug, Default)]
pub struct RunArgs {
    /// Path to the node configuration file (TOML).
    ///
    /// A missing file means built-in defaults.
    #[arg(
        long,
        short = 'c',
        env = "APORIA_CONFIG",
        default_value = ".aporia/config.toml"
    )]
    pub config: PathBuf,

    /// Path to the node key file. Generated on first run if absent.
    #[arg(long, env = "APORIA_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// TCP port for peer-to-peer traffic. Replaces the configured listen
    /// addresses with `/ip4/0.0.0.0/tcp/<port>`.
    #[arg(long, env = "APORIA_P2P_PORT")]
    pub p2p_port: Option<u16>,

    /// Full peer address to dial at startup. Repeatable.
    #[arg(long = "bootstrap", value_name = "MULTIADDR")]
    pub bootstrap: Vec<String>,

    /// Address of the Prometheus metrics endpoint.
    #[arg(long, env = "APORIA_METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    /// Default log level or `EnvFilter` directives. `RUST_LOG` wins.
    #[arg(long, env = "APORIA_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log output format: `pretty` or `json`.
    #[arg(long, env = "APORIA_LOG_FORMAT")]
    pub log_format: Option<String>,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Directory receiving `config.toml` and `node.key`.
    #[arg(long, short = 'd', env = "APORIA_DATA_DIR", default_value = ".aporia")]
    pub data_dir: PathBuf,

    /// Overwrite existing files.
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        AporiaNodeCli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = AporiaNodeCli::parse_from([
            "aporia-node",
            "run",
            "--p2p-port",
            "9999",
            "--bootstrap",
            "/ip4/10.0.0.1/tcp/9740/p2p/12D3KooWA",
            "--bootstrap",
            "/ip4/10.0.0.2/tcp/9740/p2p/12D3KooWB",
            "--log-format",
            "json",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.p2p_port, Some(9999));
        assert_eq!(args.bootstrap.len(), 2);
        assert_eq!(args.log_format.as_deref(), Some("json"));
    }
}
