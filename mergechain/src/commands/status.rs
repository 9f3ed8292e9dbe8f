use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::config::{ledger_db_path_from_config, Config};
use crate::hash::short_hex;
use crate::node::Node;

/// Show chain status
pub fn run(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)
        .context("No config found. Run 'mergechain init' first.")?;
    let params = Arc::new(config.consensus_params()?);

    let node = Node::open(&ledger_db_path_from_config(config_path), params.clone())
        .context("Failed to open ledger")?;
    let state = node.chain_state();
    let next_bits = node.ledger().next_bits().context("Failed to compute next target")?;

    println!();
    println!("=== Mergechain Status ===");
    println!();
    println!("Chain:");
    println!("  Network: {} (magic {})", params.network, params.magic);
    println!("  Height: {}", state.height);
    println!("  Tip hash: {}", short_hex(&state.tip_hash));
    println!("  Tip bits: 0x{:08x}", state.tip_bits);
    println!("  Next bits: 0x{:08x}", next_bits);
    println!(
        "  Merged mining: {}",
        if params.merged_mining { "enabled" } else { "disabled" }
    );
    println!();
    println!("Pool:");
    println!("  Pending transactions: {}", node.pool().len());
    println!();
    println!("Mining:");
    println!(
        "  Enabled in config: {}",
        if config.mining.enabled { "yes" } else { "no" }
    );
    match &config.mining.payout_address {
        Some(address) => println!("  Payout address: {}", address),
        None => println!("  Payout address: (none)"),
    }
    println!();

    node.shutdown();
    Ok(())
}
