//! # CLI Interface
//!
//! Command-line arguments for `obscura-node`, via `clap` derive. Every
//! option has an environment-variable twin so containers do not need a
//! dozen flags.

use clap::Parser;
use std::path::PathBuf;

use obscura_protocol::config;

/// Obscura network node.
///
/// Runs the P2P overlay, keeps the local chain and staking registries,
/// and validates whatever the network sends its way. With `--seed-mode`
/// the node only spreads peer lists and never touches application data.
#[derive(Parser, Debug, Clone)]
#[command(name = "obscura-node", about = "Obscura network node", version)]
pub struct NodeCli {
    /// Path to the node data directory. Created on first run.
    #[arg(long, short = 'd', env = "OBSCURA_DB_PATH", default_value = config::storage::DEFAULT_DATA_DIR)]
    pub db_path: PathBuf,

    /// P2P listen port.
    #[arg(long, short = 'p', env = "OBSCURA_PORT", default_value_t = config::p2p::DEFAULT_BIND_PORT)]
    pub port: u16,

    /// Delete the peer database before starting.
    #[arg(long)]
    pub reset: bool,

    /// Additional seed node as `ip:port` (may be repeated). Supplied
    /// seeds replace the built-in list.
    #[arg(long = "seed-node", value_name = "IP:PORT")]
    pub seed_nodes: Vec<String>,

    /// Log verbosity: 0 = off through 6 = trace.
    #[arg(long, env = "OBSCURA_LOG_LEVEL", default_value_t = 4)]
    pub log_level: u8,

    /// Run as a seed node: relay peers across all networks, ignore
    /// application data.
    #[arg(long)]
    pub seed_mode: bool,
}

/// Splits an `ip:port` seed argument, defaulting the port when absent.
pub fn parse_seed_node(value: &str) -> (String, u16) {
    match obscura_protocol::network::normalize_host_port(
        value,
        None,
        config::p2p::DEFAULT_BIND_PORT,
    ) {
        Ok((host, port, _)) => (host, port),
        Err(_) => (value.to_string(), config::p2p::DEFAULT_BIND_PORT),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        NodeCli::command().debug_assert();
    }

    #[test]
    fn defaults_line_up_with_the_protocol() {
        let cli = NodeCli::parse_from(["obscura-node"]);

        assert_eq!(cli.port, config::p2p::DEFAULT_BIND_PORT);
        assert_eq!(cli.log_level, 4);
        assert!(!cli.reset);
        assert!(!cli.seed_mode);
        assert!(cli.seed_nodes.is_empty());
    }

    #[test]
    fn seed_nodes_accumulate() {
        let cli = NodeCli::parse_from([
            "obscura-node",
            "--seed-node",
            "10.0.0.1:4000",
            "--seed-node",
            "10.0.0.2",
        ]);

        assert_eq!(cli.seed_nodes.len(), 2);

        assert_eq!(
            parse_seed_node(&cli.seed_nodes[0]),
            ("10.0.0.1".to_string(), 4000)
        );

        assert_eq!(
            parse_seed_node(&cli.seed_nodes[1]),
            ("10.0.0.2".to_string(), config::p2p::DEFAULT_BIND_PORT)
        );
    }

    #[test]
    fn seed_mode_flag_parses() {
        let cli = NodeCli::parse_from(["obscura-node", "--seed-mode", "--reset"]);

        assert!(cli.seed_mode);
        assert!(cli.reset);
    }
}
