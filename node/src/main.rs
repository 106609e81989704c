// Copyright (c) 2026 The Obscura Developers. MIT License.
// See LICENSE for details.

//! # Obscura Node
//!
//! Entry point for the `obscura-node` binary: parses arguments, brings up
//! logging, opens the stores, starts the P2P overlay, and then sits in
//! the steady state — draining application packets into the transaction
//! validator until someone asks it to stop.
//!
//! Exit codes: 0 on a clean shutdown, 1 when startup fails (cannot bind,
//! cannot reach any seed, cannot open the databases).

mod cli;
mod logging;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{debug, error, info, trace, warn};

use obscura_protocol::codec::Serializable;
use obscura_protocol::config;
use obscura_protocol::network::Node;
use obscura_protocol::staking::StakingEngine;
use obscura_protocol::storage::ChainStore;
use obscura_protocol::transaction::validation::TransactionValidator;
use obscura_protocol::transaction::UncommittedTransaction;

use cli::NodeCli;

/// How long the steady-state loop sleeps between queue drains.
const IDLE_INTERVAL: Duration = Duration::from_millis(50);

/// How often the steady-state loop logs a status line.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

fn main() {
    let cli = NodeCli::parse();

    logging::init_logging(cli.log_level);

    match run(cli) {
        Ok(()) => {
            info!("shutdown complete");
        }
        Err(e) => {
            error!(error = %e, "startup failed");

            std::process::exit(1);
        }
    }
}

fn run(cli: NodeCli) -> Result<()> {
    info!(
        version = %format!(
            "{}.{}.{}",
            config::version::MAJOR,
            config::version::MINOR,
            config::version::PATCH
        ),
        data_dir = %cli.db_path.display(),
        port = cli.port,
        seed_mode = cli.seed_mode,
        "starting {}", config::version::PROJECT_NAME
    );

    let peer_db_path = cli.db_path.join("p2p");

    if cli.reset && peer_db_path.exists() {
        std::fs::remove_dir_all(&peer_db_path)
            .with_context(|| format!("failed to reset peer database at {}", peer_db_path.display()))?;

        info!("peer database reset");
    }

    // --- Persistent state ---
    let chain = ChainStore::instance(cli.db_path.join("chain"))
        .context("failed to open the chain store")?;

    let staking = StakingEngine::instance(cli.db_path.join("staking"))
        .context("failed to open the staking registry")?;

    let validator = TransactionValidator::new(Arc::clone(&chain), Arc::clone(&staking));

    info!(
        blocks = chain.get_block_count().unwrap_or_default(),
        outputs = chain.output_count().unwrap_or_default(),
        "chain store open"
    );

    // --- The overlay ---
    let node = Node::new(&peer_db_path, cli.port, cli.seed_mode, *config::NETWORK_ID)
        .context("failed to prepare the p2p node")?;

    let seed_nodes: Vec<(String, u16)> = cli
        .seed_nodes
        .iter()
        .map(|value| cli::parse_seed_node(value))
        .collect();

    node.start(&seed_nodes).context("failed to start the p2p node")?;

    info!(peer_id = %node.peer_id(), "p2p node started");

    // --- Shutdown wiring ---
    let stopping = Arc::new(AtomicBool::new(false));

    {
        let stopping = Arc::clone(&stopping);

        ctrlc::set_handler(move || {
            stopping.store(true, Ordering::Release);
        })
        .context("failed to install the shutdown handler")?;
    }

    // --- Steady state ---
    let messages = node.messages();

    let mut last_status = std::time::Instant::now();

    while !stopping.load(Ordering::Acquire) {
        let mut drained = false;

        while let Some(message) = messages.pop() {
            drained = true;

            handle_data_payload(&validator, &message.packet.payload);
        }

        if last_status.elapsed() >= STATUS_INTERVAL {
            info!(
                incoming = node.incoming_connections(),
                outgoing = node.outgoing_connections(),
                peers = node.peers().count().unwrap_or_default(),
                blocks = chain.get_block_count().unwrap_or_default(),
                "node status"
            );

            last_status = std::time::Instant::now();
        }

        if !drained {
            std::thread::sleep(IDLE_INTERVAL);
        }
    }

    info!("shutting down");

    node.stop();

    Ok(())
}

/// Handles one application payload from the overlay. Today the network
/// carries in-flight transactions; anything undecodable is dropped with a
/// trace, like every other protocol violation.
fn handle_data_payload(validator: &TransactionValidator, payload: &[u8]) {
    let transaction = match UncommittedTransaction::from_bytes(payload) {
        Ok(transaction) => transaction,
        Err(e) => {
            trace!(error = %e, "undecodable application payload dropped");

            return;
        }
    };

    let hash = transaction.hash();

    match validator.validate_uncommitted(&transaction) {
        Ok(()) => {
            debug!(tx = %hash, kind = %transaction.tx_type(), "transaction validated");
        }
        Err(e) => {
            warn!(tx = %hash, error = %e, "transaction rejected");
        }
    }
}
