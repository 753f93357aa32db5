//! # CLI Interface
//!
//! Defines the command-line argument structure for `dpos-node` using
//! `clap` derive. Supports three subcommands: `run`, `simulate`, and
//! `version`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use dpos_protocol::config::{NodeConfig, NodeId};

/// DPoS simulation node.
///
/// Runs one participant of a simulated delegated-proof-of-stake network, or
/// the whole network in a single process.
#[derive(Parser, Debug)]
#[command(
    name = "dpos-node",
    about = "DPoS simulation node",
    version,
    propagate_version = true
)]
pub struct DposNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands for the node binary.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single node.
    Run(RunArgs),
    /// Run every node of the network in this process.
    Simulate(SimulateArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// This node's ID, in `[0, peers)`.
    #[arg(long, env = "DPOS_NODE_ID")]
    pub id: NodeId,

    #[command(flatten)]
    pub network: NetworkArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Port for the Prometheus metrics endpoint. Disabled when omitted.
    #[arg(long, env = "DPOS_METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

/// Arguments for the `simulate` subcommand.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    #[command(flatten)]
    pub network: NetworkArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Stop after this many seconds instead of waiting for Ctrl+C.
    #[arg(long)]
    pub duration_secs: Option<u64>,

    /// Pause between starting the listeners and dialing, in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub bootstrap_delay_ms: u64,

    /// Port for the Prometheus metrics endpoint. Disabled when omitted.
    #[arg(long, env = "DPOS_METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

/// Network parameters shared by `run` and `simulate`.
///
/// Values are layered: built-in defaults, then the JSON config file, then
/// individual flags.
#[derive(Args, Debug, Default)]
pub struct NetworkArgs {
    /// Path to a JSON `NodeConfig` document. Missing fields use defaults.
    #[arg(long, short = 'c', env = "DPOS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of participants.
    #[arg(long, env = "DPOS_PEERS")]
    pub peers: Option<u64>,

    /// Number of forging delegates.
    #[arg(long, env = "DPOS_DELEGATES")]
    pub delegates: Option<u64>,

    /// Host to bind and dial.
    #[arg(long, env = "DPOS_HOST")]
    pub host: Option<String>,

    /// Base listen port; each node listens on `base_port + id`.
    #[arg(long, env = "DPOS_BASE_PORT")]
    pub base_port: Option<u16>,

    /// Slot width in milliseconds.
    #[arg(long, env = "DPOS_SLOT_MS")]
    pub slot_ms: Option<u64>,
}

/// Logging flags.
#[derive(Args, Debug)]
pub struct OutputArgs {
    /// Log format: `pretty` or `json`.
    #[arg(long, env = "DPOS_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    /// Default filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "dpos_node=info,dpos_protocol=info")]
    pub log_level: String,
}

impl NetworkArgs {
    /// Builds and validates the effective configuration.
    pub fn resolve(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => NodeConfig::default(),
        };

        if let Some(peers) = self.peers {
            config.number_of_peers = peers;
        }
        if let Some(delegates) = self.delegates {
            config.number_of_delegates = delegates;
        }
        if let Some(host) = &self.host {
            config.listen_host = host.clone();
        }
        if let Some(port) = self.base_port {
            config.base_port = port;
        }
        if let Some(slot_ms) = self.slot_ms {
            config.slot_duration_ms = slot_ms;
        }

        config.validate().context("invalid node configuration")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        DposNodeCli::command().debug_assert();
    }

    #[test]
    fn run_parses_id_and_overrides() {
        let cli = DposNodeCli::try_parse_from([
            "dpos-node", "run", "--id", "3", "--peers", "4", "--delegates", "2",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.id, 3);

        let config = args.network.resolve().unwrap();
        assert_eq!(config.number_of_peers, 4);
        assert_eq!(config.number_of_delegates, 2);
        assert_eq!(config.base_port, NodeConfig::default().base_port);
    }

    #[test]
    fn invalid_overrides_are_rejected() {
        let args = NetworkArgs {
            peers: Some(2),
            delegates: Some(5),
            ..NetworkArgs::default()
        };
        assert!(args.resolve().is_err());
    }

    #[test]
    fn partial_config_file_keeps_defaults_and_flags_win() {
        let path = std::env::temp_dir().join(format!("dpos-cli-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"number_of_peers": 3, "number_of_delegates": 3}"#).unwrap();

        let args = NetworkArgs {
            config: Some(path.clone()),
            delegates: Some(2),
            ..NetworkArgs::default()
        };
        let config = args.resolve().unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.number_of_peers, 3);
        assert_eq!(config.number_of_delegates, 2);
        assert_eq!(config.slot_duration_ms, NodeConfig::default().slot_duration_ms);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = NetworkArgs {
            config: Some(PathBuf::from("/nonexistent/dpos.json")),
            ..NetworkArgs::default()
        };
        let err = args.resolve().unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
