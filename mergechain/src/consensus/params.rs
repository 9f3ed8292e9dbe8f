// Copyright (c) 2024 Mergechain Foundation

//! Per-network consensus parameters.

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::asset::Fixed64;
use crate::pow::difficulty::{compact_to_target, DifficultyError};

/// Network the node participates in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    #[default]
    Testnet,
    /// Local network with a trivial proof-of-work limit
    Regtest,
}

impl Network {
    /// Magic number separating the networks' message streams.
    pub fn magic(&self) -> u32 {
        match self {
            Network::Mainnet => 2017001,
            Network::Testnet => 2018101,
            Network::Regtest => 2018201,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Network::Mainnet)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Consensus rules shared by the validator, the difficulty calculator and the
/// miner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusParams {
    pub network: Network,
    pub magic: u32,
    /// Easiest allowed target, in compact form
    pub pow_limit_bits: u32,
    /// Seconds a full retarget window should take
    pub target_timespan: u32,
    /// Desired seconds between blocks
    pub target_time_per_block: u32,
    /// Bound on how far one retarget may move the target
    pub adjustment_factor: u32,
    pub max_txs_per_block: usize,
    pub block_reward: Fixed64,
    pub merged_mining: bool,
    pub aux_chain_id: u32,
    pub genesis_timestamp: u32,
    /// How far past wall-clock a block timestamp may be
    pub max_future_block_time: u32,
}

impl ConsensusParams {
    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self {
                network,
                magic: network.magic(),
                pow_limit_bits: 0x1f0008ff,
                target_timespan: 24 * 60 * 60,
                target_time_per_block: 2 * 60,
                adjustment_factor: 4,
                max_txs_per_block: 10_000,
                block_reward: Fixed64::from_units(5),
                merged_mining: true,
                aux_chain_id: 1224,
                genesis_timestamp: 1_513_936_800,
                max_future_block_time: 2 * 60 * 60,
            },
            Network::Testnet => Self {
                network,
                magic: network.magic(),
                genesis_timestamp: 1_513_936_801,
                ..Self::for_network(Network::Mainnet)
            },
            Network::Regtest => Self {
                network,
                magic: network.magic(),
                pow_limit_bits: 0x207fffff,
                target_timespan: 144,
                target_time_per_block: 1,
                merged_mining: false,
                genesis_timestamp: 1_700_000_000,
                ..Self::for_network(Network::Mainnet)
            },
        }
    }

    /// Number of blocks between difficulty adjustments.
    pub fn retarget_interval(&self) -> u32 {
        (self.target_timespan / self.target_time_per_block.max(1)).max(1)
    }

    /// Easiest allowed target as a full integer.
    pub fn pow_limit(&self) -> Result<BigUint, DifficultyError> {
        compact_to_target(self.pow_limit_bits)
    }
}
