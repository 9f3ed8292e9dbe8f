// Copyright (c) 2024 Mergechain Foundation

//! Candidate block assembly for the miner.
//!
//! The builder re-validates pool transactions against the current tip,
//! drops any that no longer apply, and prepends a coinbase paying the block
//! reward plus collected fees.

use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::address::ProgramHash;
use crate::asset::Fixed64;
use crate::block::{native_asset_id, Block, BlockHeader, BLOCK_VERSION};
use crate::consensus::validation::{BlockValidator, ChainView, SpendContext, ValidationError};
use crate::hash::{short_hex, Hash256, ZERO_HASH};
use crate::pow::{next_required_bits, DifficultyError};
use crate::transaction::{Transaction, TxOutput};

/// Result of assembling a candidate block
#[derive(Debug)]
pub struct BuiltBlock {
    pub block: Block,
    pub fees: Fixed64,
    /// Pool transactions left out because they no longer validate
    pub skipped: Vec<Hash256>,
}

/// Builds candidate blocks on top of the current tip
pub struct BlockBuilder {
    validator: BlockValidator,
    payout: ProgramHash,
    coinbase_nonce: AtomicU64,
}

impl BlockBuilder {
    pub fn new(validator: BlockValidator, payout: ProgramHash) -> Self {
        Self {
            validator,
            payout,
            coinbase_nonce: AtomicU64::new(rand::thread_rng().gen()),
        }
    }

    pub fn payout(&self) -> ProgramHash {
        self.payout
    }

    /// Nonce for the next coinbase. Distinct on every call so two candidates
    /// at the same height never share a coinbase hash.
    pub fn next_coinbase_nonce(&self) -> u64 {
        self.coinbase_nonce.fetch_add(1, Ordering::Relaxed)
    }

    /// Assemble a block extending `parent` from `candidates` (highest
    /// priority first). The header nonce is left at zero for the miner.
    pub fn build<V: ChainView + ?Sized>(
        &self,
        view: &V,
        parent: &BlockHeader,
        candidates: &[Arc<Transaction>],
        now: u32,
    ) -> Result<BuiltBlock, BlockBuildError> {
        self.build_for(view, parent, candidates, now, self.payout)
    }

    /// Like [`BlockBuilder::build`], paying the coinbase to `payout`.
    pub fn build_for<V: ChainView + ?Sized>(
        &self,
        view: &V,
        parent: &BlockHeader,
        candidates: &[Arc<Transaction>],
        now: u32,
        payout: ProgramHash,
    ) -> Result<BuiltBlock, BlockBuildError> {
        let params = self.validator.params();
        let height = parent.height + 1;
        let bits = next_required_bits(params, parent, |h| {
            view.header_at_height(h)
                .ok()
                .flatten()
                .map(|ancestor| ancestor.timestamp)
        })?;

        let room = params.max_txs_per_block.saturating_sub(1);
        let mut ctx = SpendContext::new();
        let mut fees = Fixed64::ZERO;
        let mut transactions = Vec::with_capacity(candidates.len().min(room) + 1);
        let mut skipped = Vec::new();

        for tx in candidates {
            if transactions.len() >= room {
                break;
            }
            let checked = self
                .validator
                .check_transaction_sanity(tx)
                .and_then(|()| self.validator.check_transaction_context(tx, view, &mut ctx));
            match checked {
                Ok(fee) => {
                    fees = fees.checked_add(fee).ok_or(BlockBuildError::FeeOverflow)?;
                    transactions.push(Transaction::clone(tx));
                }
                Err(ValidationError::Storage(e)) => return Err(BlockBuildError::Storage(e)),
                Err(e) => {
                    let hash = tx.hash();
                    debug!(tx = %short_hex(&hash), error = %e, "Skipping pool transaction");
                    skipped.push(hash);
                }
            }
        }

        let reward = params
            .block_reward
            .checked_add(fees)
            .ok_or(BlockBuildError::FeeOverflow)?;
        let coinbase = Transaction::new_coinbase(
            height,
            self.next_coinbase_nonce(),
            vec![TxOutput {
                asset_id: native_asset_id(),
                value: reward,
                program_hash: payout,
            }],
        );
        transactions.insert(0, coinbase);

        let mut block = Block {
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_block_hash: parent.hash(),
                merkle_root: ZERO_HASH,
                timestamp: now.max(parent.timestamp + 1),
                bits,
                nonce: 0,
                height,
                aux_pow: None,
            },
            transactions,
        };
        block.header.merkle_root = block.compute_merkle_root();

        debug!(
            height,
            txs = block.transactions.len(),
            skipped = skipped.len(),
            "Built candidate block"
        );
        Ok(BuiltBlock {
            block,
            fees,
            skipped,
        })
    }
}

/// Errors that can occur during block building
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockBuildError {
    /// Difficulty for the next block could not be computed
    Difficulty(DifficultyError),
    /// Collected fees overflow
    FeeOverflow,
    /// Chain state could not be read
    Storage(String),
}

impl From<DifficultyError> for BlockBuildError {
    fn from(e: DifficultyError) -> Self {
        Self::Difficulty(e)
    }
}

impl std::fmt::Display for BlockBuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Difficulty(e) => write!(f, "Cannot compute difficulty: {}", e),
            Self::FeeOverflow => write!(f, "Block fees overflow"),
            Self::Storage(e) => write!(f, "Storage error: {}", e),
        }
    }
}

impl std::error::Error for BlockBuildError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::params::{ConsensusParams, Network};
    use crate::consensus::validation::tests::MemoryChain;
    use crate::pow::solve_header;
    use crate::transaction::OutPoint;

    fn setup() -> (MemoryChain, BlockBuilder) {
        let params = Arc::new(ConsensusParams::for_network(Network::Regtest));
        let chain = MemoryChain::with_genesis(&params);
        let builder = BlockBuilder::new(BlockValidator::new(params), ProgramHash::standard([1; 20]));
        (chain, builder)
    }

    fn transfer(from: OutPoint, value: i64) -> Arc<Transaction> {
        Arc::new(Transaction::new_transfer(
            vec![from],
            vec![TxOutput {
                asset_id: native_asset_id(),
                value: Fixed64(value),
                program_hash: ProgramHash::standard([2; 20]),
            }],
        ))
    }

    #[test]
    fn test_build_empty_block() {
        let (chain, builder) = setup();
        let parent = chain.headers[0].clone();
        let built = builder.build(&chain, &parent, &[], 0).unwrap();

        let block = built.block;
        assert_eq!(block.height(), 1);
        assert_eq!(block.transactions.len(), 1);
        assert!(block.transactions[0].is_coinbase());
        assert_eq!(block.header.prev_block_hash, parent.hash());
        // Wall-clock behind the parent: timestamp is parent + 1
        assert_eq!(block.header.timestamp, parent.timestamp + 1);
        assert_eq!(block.header.merkle_root, block.compute_merkle_root());
    }

    #[test]
    fn test_timestamp_follows_clock() {
        let (chain, builder) = setup();
        let parent = chain.headers[0].clone();
        let now = parent.timestamp + 500;
        let built = builder.build(&chain, &parent, &[], now).unwrap();
        assert_eq!(built.block.header.timestamp, now);
    }

    #[test]
    fn test_coinbase_nonce_unique() {
        let (chain, builder) = setup();
        let parent = chain.headers[0].clone();
        let a = builder.build(&chain, &parent, &[], 0).unwrap();
        let b = builder.build(&chain, &parent, &[], 0).unwrap();
        assert_ne!(a.block.transactions[0].hash(), b.block.transactions[0].hash());
    }

    #[test]
    fn test_conflicting_pool_transactions_skipped() {
        let (mut chain, builder) = setup();
        let funding = chain.fund(ProgramHash::standard([3; 20]), Fixed64(1_000));
        let first = transfer(funding, 900);
        let conflict = transfer(funding, 800);
        let parent = chain.headers[0].clone();

        let built = builder
            .build(&chain, &parent, &[first.clone(), conflict.clone()], 0)
            .unwrap();
        assert_eq!(built.block.transactions.len(), 2);
        assert_eq!(built.fees, Fixed64(100));
        assert_eq!(built.skipped, vec![conflict.hash()]);

        let coinbase = &built.block.transactions[0];
        assert_eq!(
            coinbase.outputs[0].value,
            Fixed64(builder.validator.params().block_reward.value() + 100)
        );

        // The assembled block passes full validation once solved
        let mut block = built.block;
        assert!(solve_header(&mut block.header, 1_000_000).unwrap());
        let now = block.header.timestamp;
        assert!(builder.validator.validate_block(&block, &chain, now).is_ok());
    }

    #[test]
    fn test_respects_block_capacity() {
        let params = Arc::new(ConsensusParams {
            max_txs_per_block: 2,
            ..ConsensusParams::for_network(Network::Regtest)
        });
        let mut chain = MemoryChain::with_genesis(&params);
        let builder = BlockBuilder::new(BlockValidator::new(params), ProgramHash::standard([1; 20]));
        let a = transfer(chain.fund(ProgramHash::standard([3; 20]), Fixed64(10)), 10);
        let b = transfer(chain.fund(ProgramHash::standard([4; 20]), Fixed64(10)), 10);
        let parent = chain.headers[0].clone();

        let built = builder.build(&chain, &parent, &[a, b], 0).unwrap();
        assert_eq!(built.block.transactions.len(), 2);
    }
}
