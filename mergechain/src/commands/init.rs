use anyhow::{bail, Result};
use rand::RngCore;
use std::path::Path;
use tracing::info;

use crate::address::ProgramHash;
use crate::config::Config;
use crate::consensus::Network;

/// Write a fresh config for `network`. Without `payout` a random payout
/// address is generated.
pub fn run(config_path: &Path, network: Network, payout: Option<String>, force: bool) -> Result<()> {
    if Config::exists(config_path) && !force {
        bail!(
            "Config already exists at {}\nUse --force to overwrite it or pass a different --config path.",
            config_path.display()
        );
    }

    let payout = match payout {
        Some(address) => ProgramHash::from_address(&address)
            .map_err(|e| anyhow::anyhow!("Invalid payout address {}: {}", address, e))?,
        None => {
            let mut digest = [0u8; 20];
            rand::thread_rng().fill_bytes(&mut digest);
            ProgramHash::standard(digest)
        }
    };

    let mut config = Config::new(network);
    config.mining.payout_address = Some(payout.to_address());
    config.save(config_path)?;

    info!(path = %config_path.display(), %network, "Node initialized");
    println!("\n[{}] Node configuration created.", network);
    println!("Config saved to: {}", config_path.display());
    println!("Payout address: {}", payout);
    println!("\nNext steps:");
    println!("  1. Run 'mergechain run' to open the ledger");
    println!("  2. Run 'mergechain run --mine' to produce blocks");
    Ok(())
}
