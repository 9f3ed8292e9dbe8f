// Copyright (c) 2024 Mergechain Foundation

//! Consensus rules for Mergechain.
//!
//! This module provides:
//! - ConsensusParams: per-network constants (targets, reward, merged mining)
//! - BlockValidator: structural and contextual block/transaction rules
//! - BlockBuilder: assembles candidate blocks from the transaction pool

mod block_builder;
pub mod params;
mod validation;

pub use block_builder::{BlockBuildError, BlockBuilder, BuiltBlock};
pub use params::{ConsensusParams, Network};
pub use validation::{
    AssetState, BlockValidator, ChainView, SpendContext, ValidationError, MAX_TRANSACTION_SIZE,
};

#[cfg(test)]
pub(crate) use validation::tests::MemoryChain;
