use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::address::ProgramHash;
use crate::consensus::{ConsensusParams, Network};

/// Main configuration for a Mergechain node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Network preset (mainnet, testnet or regtest)
    #[serde(default)]
    pub network: Network,

    /// Overrides of the preset's consensus parameters
    #[serde(default)]
    pub consensus: ConsensusOverrides,

    #[serde(default)]
    pub mining: MiningConfig,
}

/// Consensus values that may differ from the network preset. Unset fields
/// keep the preset's value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusOverrides {
    /// Desired seconds between blocks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_time_per_block: Option<u32>,

    /// Seconds a full retarget window should take
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_timespan: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_txs_per_block: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_mining: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aux_chain_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiningConfig {
    /// Whether mining is enabled
    #[serde(default)]
    pub enabled: bool,

    /// Base58 address receiving block rewards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout_address: Option<String>,

    /// Milliseconds between mining cycles
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
}

fn default_period_ms() -> u64 {
    1000
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            payout_address: None,
            period_ms: default_period_ms(),
        }
    }
}

impl Config {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            ..Self::default()
        }
    }

    /// Load config from a file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }

    /// The network preset with this config's overrides applied.
    pub fn consensus_params(&self) -> Result<ConsensusParams> {
        let mut params = ConsensusParams::for_network(self.network);
        let overrides = &self.consensus;

        if let Some(seconds) = overrides.target_time_per_block {
            if seconds == 0 {
                bail!("consensus.target_time_per_block must be positive");
            }
            params.target_time_per_block = seconds;
        }
        if let Some(seconds) = overrides.target_timespan {
            if seconds < params.target_time_per_block {
                bail!("consensus.target_timespan must cover at least one block");
            }
            params.target_timespan = seconds;
        }
        if let Some(max) = overrides.max_txs_per_block {
            if max < 1 {
                bail!("consensus.max_txs_per_block must leave room for the coinbase");
            }
            params.max_txs_per_block = max;
        }
        if let Some(merged) = overrides.merged_mining {
            params.merged_mining = merged;
        }
        if let Some(chain_id) = overrides.aux_chain_id {
            params.aux_chain_id = chain_id;
        }
        Ok(params)
    }

    /// Decoded payout address, if one is configured.
    pub fn payout(&self) -> Result<Option<ProgramHash>> {
        self.mining
            .payout_address
            .as_deref()
            .map(|address| {
                ProgramHash::from_address(address)
                    .map_err(|e| anyhow!("Invalid payout address {}: {}", address, e))
            })
            .transpose()
    }
}

/// Root directory for all node data
pub fn default_data_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".mergechain"))
        .ok_or_else(|| anyhow!("Could not determine home directory"))
}

/// Default config file for `network`: `~/.mergechain/{network}/config.toml`
pub fn config_path(network: Network) -> Result<PathBuf> {
    Ok(default_data_dir()?.join(network.name()).join("config.toml"))
}

/// The ledger lives next to its config file
pub fn ledger_db_path_from_config(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .unwrap_or(config_path)
        .join("ledger")
}
