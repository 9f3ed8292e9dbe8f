// Copyright (c) 2024 Mergechain Foundation

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

use crate::config::{ledger_db_path_from_config, Config};
use crate::hash::short_hex;
use crate::mempool::MAX_TX_AGE;
use crate::node::Node;

/// How often the run loop checks for shutdown
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How often chain status is logged
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Run the node until Ctrl+C
pub fn run(config_path: &Path, mine: bool) -> Result<()> {
    let config = Config::load(config_path).context("No config found. Run 'mergechain init' first.")?;
    let params = Arc::new(config.consensus_params()?);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::SeqCst);
    })?;

    let mut node = Node::open(&ledger_db_path_from_config(config_path), params)
        .context("Failed to open ledger")?;

    if mine || config.mining.enabled {
        let payout = config
            .payout()?
            .context("Mining requires mining.payout_address in the config")?;
        node.set_miner(payout, config.mining.period_ms);
        if node.params().merged_mining {
            info!("Merged mining enabled, waiting for aux work requests");
        }
        node.start_mining()?;
    }

    println!("Mergechain node running. Press Ctrl+C to stop.");

    let mut last_status = Instant::now();
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(POLL_INTERVAL);

        if last_status.elapsed() >= STATUS_INTERVAL {
            last_status = Instant::now();
            let evicted = node.pool().evict_old(MAX_TX_AGE);
            let state = node.chain_state();
            info!(
                height = state.height,
                tip = %short_hex(&state.tip_hash),
                pool = node.pool().len(),
                evicted,
                "Node status"
            );
            if let Some(miner) = node.miner() {
                let stats = miner.stats();
                info!(
                    blocks = stats.blocks_found,
                    hashrate = stats.hashrate(),
                    "Mining status"
                );
            }
        }
    }

    info!("Shutting down");
    node.shutdown();
    Ok(())
}
