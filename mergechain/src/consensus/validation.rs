// Copyright (c) 2024 Mergechain Foundation

//! Block and transaction validation.
//!
//! Validation runs in two phases. Structural checks look at a block or
//! transaction in isolation. Contextual checks consult a [`ChainView`] of the
//! persisted chain, plus a [`SpendContext`] carrying the effects of the
//! transactions already accepted earlier in the same block.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::address::ProgramHash;
use crate::asset::{Asset, Fixed64, MAX_PRECISION};
use crate::block::{native_asset_id, Block, BlockHeader};
use crate::consensus::params::ConsensusParams;
use crate::error::ErrorKind;
use crate::hash::{short_hex, Hash256};
use crate::pow::{compact_to_target, hash_meets_target, next_required_bits, AuxPowError, DifficultyError};
use crate::transaction::{OutPoint, Payload, Transaction, TxOutput};

/// Largest serialized transaction accepted.
pub const MAX_TRANSACTION_SIZE: usize = 1024 * 1024;

/// Validation errors for blocks and transactions
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    // Structural errors
    #[error("Block has no transactions")]
    EmptyBlock,

    #[error("Block has {got} transactions, limit is {max}")]
    TooManyTransactions { max: usize, got: usize },

    #[error("First transaction is not a coinbase")]
    FirstNotCoinbase,

    #[error("Coinbase found at position {0}")]
    ExtraCoinbase(usize),

    #[error("Merkle root mismatch")]
    MerkleRootMismatch,

    #[error("Duplicate transaction {}", short_hex(.0))]
    DuplicateTransaction(Hash256),

    #[error("Transaction has a negative output")]
    NegativeOutput,

    #[error("Transaction spends {0} twice")]
    DuplicateInput(OutPoint),

    #[error("Coinbase has inputs")]
    CoinbaseWithInputs,

    #[error("Transaction has neither inputs nor outputs")]
    EmptyTransaction,

    #[error("Transaction is {0} bytes, limit is {}", MAX_TRANSACTION_SIZE)]
    TransactionTooLarge(usize),

    #[error("Asset precision {0} exceeds {}", MAX_PRECISION)]
    InvalidPrecision(u8),

    #[error("Registered asset amount must be positive")]
    InvalidAssetAmount,

    #[error("Amount overflow")]
    AmountOverflow,

    #[error("Block carries an aux proof but merged mining is disabled")]
    UnexpectedAuxPow,

    #[error("Block is missing its aux proof")]
    MissingAuxPow,

    // Contextual errors
    #[error("Unknown parent block {}", short_hex(.0))]
    UnknownParent(Hash256),

    #[error("Block does not extend the current tip")]
    NotExtendingTip,

    #[error("Wrong block height: expected {expected}, got {got}")]
    WrongHeight { expected: u32, got: u32 },

    #[error("Timestamp {timestamp} not after parent timestamp {parent}")]
    TimestampNotIncreasing { timestamp: u32, parent: u32 },

    #[error("Timestamp {timestamp} too far in future (now {now})")]
    TimestampTooFarInFuture { timestamp: u32, now: u32 },

    #[error("Wrong difficulty: expected 0x{expected:08x}, got 0x{got:08x}")]
    WrongDifficulty { expected: u32, got: u32 },

    #[error("Target 0x{0:08x} is easier than the pow limit")]
    TargetAboveLimit(u32),

    #[error("Insufficient proof of work")]
    InsufficientProofOfWork,

    #[error("Invalid aux proof: {0}")]
    InvalidAuxPow(#[from] AuxPowError),

    #[error("Difficulty error: {0}")]
    Difficulty(#[from] DifficultyError),

    #[error("Unknown asset {}", short_hex(.0))]
    UnknownAsset(Hash256),

    #[error("Amount {amount} violates precision {precision}")]
    PrecisionViolation { amount: Fixed64, precision: u8 },

    #[error("Insufficient inputs for asset {}", short_hex(.0))]
    InsufficientInputs(Hash256),

    #[error("Issuance of asset {} exceeds registered amount", short_hex(.0))]
    IssuanceExceeded(Hash256),

    #[error("The native asset is only created by coinbase transactions")]
    NativeIssuance,

    #[error("Issuance of asset {} does not spend an input of its controller", short_hex(.0))]
    UnauthorizedIssuance(Hash256),

    #[error("Coinbase pays {paid}, allowed {allowed}")]
    CoinbaseRewardTooHigh { paid: Fixed64, allowed: Fixed64 },

    #[error("Coinbase pays a non-native asset")]
    CoinbaseAssetMismatch,

    #[error("Transaction {} already persisted", short_hex(.0))]
    AlreadyPersisted(Hash256),

    #[error("Input {0} is spent or does not exist")]
    DoubleSpend(OutPoint),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        use ValidationError::*;
        match self {
            EmptyBlock
            | TooManyTransactions { .. }
            | FirstNotCoinbase
            | ExtraCoinbase(_)
            | MerkleRootMismatch
            | DuplicateTransaction(_)
            | NegativeOutput
            | DuplicateInput(_)
            | CoinbaseWithInputs
            | EmptyTransaction
            | TransactionTooLarge(_)
            | InvalidPrecision(_)
            | InvalidAssetAmount
            | AmountOverflow
            | UnexpectedAuxPow
            | MissingAuxPow => ErrorKind::InvalidStructure,
            DoubleSpend(_) => ErrorKind::DoubleSpend,
            Storage(_) => ErrorKind::StorageFailure,
            _ => ErrorKind::InvalidContext,
        }
    }
}

/// Registered asset together with its issuance bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetState {
    pub asset: Asset,
    /// Maximum issuable amount
    pub amount: Fixed64,
    /// Owner whose inputs authorize issuance
    pub controller: ProgramHash,
    /// Amount issued so far through issue-asset transactions
    pub issued: Fixed64,
}

/// Read access to persisted chain state needed by contextual checks.
pub trait ChainView {
    /// Height and hash of the current tip.
    fn tip(&self) -> Result<(u32, Hash256), ValidationError>;

    fn header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, ValidationError>;

    fn header_at_height(&self, height: u32) -> Result<Option<BlockHeader>, ValidationError>;

    /// The output at `outpoint`, only if it is currently unspent.
    fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<TxOutput>, ValidationError>;

    fn contains_transaction(&self, hash: &Hash256) -> Result<bool, ValidationError>;

    fn asset(&self, id: &Hash256) -> Result<Option<AssetState>, ValidationError>;
}

/// Effects of transactions accepted so far within one block.
#[derive(Debug, Default, Clone)]
pub struct SpendContext {
    created: HashMap<OutPoint, TxOutput>,
    spent: HashSet<OutPoint>,
    registered: HashMap<Hash256, AssetState>,
    issued: HashMap<Hash256, Fixed64>,
}

impl SpendContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent.contains(outpoint)
    }

    fn asset<V: ChainView + ?Sized>(
        &self,
        view: &V,
        id: &Hash256,
    ) -> Result<Option<AssetState>, ValidationError> {
        match self.registered.get(id) {
            Some(state) => Ok(Some(state.clone())),
            None => view.asset(id),
        }
    }

    fn add_outputs(&mut self, tx_hash: Hash256, outputs: &[TxOutput]) {
        for (index, output) in outputs.iter().enumerate() {
            self.created
                .insert(OutPoint::new(tx_hash, index as u16), output.clone());
        }
    }
}

/// Validator for blocks and the transactions they carry
#[derive(Debug, Clone)]
pub struct BlockValidator {
    params: Arc<ConsensusParams>,
}

impl BlockValidator {
    pub fn new(params: Arc<ConsensusParams>) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &ConsensusParams {
        &self.params
    }

    /// Context-free checks on a single transaction.
    pub fn check_transaction_sanity(&self, tx: &Transaction) -> Result<(), ValidationError> {
        let size = tx.size();
        if size > MAX_TRANSACTION_SIZE {
            return Err(ValidationError::TransactionTooLarge(size));
        }

        if tx.outputs.iter().any(|output| output.value.is_negative()) {
            return Err(ValidationError::NegativeOutput);
        }

        let mut seen = HashSet::with_capacity(tx.inputs.len());
        for outpoint in tx.outpoints() {
            if !seen.insert(*outpoint) {
                return Err(ValidationError::DuplicateInput(*outpoint));
            }
        }

        match &tx.payload {
            Payload::CoinBase { .. } => {
                if !tx.inputs.is_empty() {
                    return Err(ValidationError::CoinbaseWithInputs);
                }
            }
            payload => {
                if tx.inputs.is_empty() && tx.outputs.is_empty() {
                    return Err(ValidationError::EmptyTransaction);
                }
                if let Payload::RegisterAsset { asset, amount, .. } = payload {
                    if asset.precision > MAX_PRECISION {
                        return Err(ValidationError::InvalidPrecision(asset.precision));
                    }
                    if amount.value() <= 0 {
                        return Err(ValidationError::InvalidAssetAmount);
                    }
                }
            }
        }
        Ok(())
    }

    /// Context-free checks on a block.
    pub fn check_block_sanity(&self, block: &Block) -> Result<(), ValidationError> {
        let txs = &block.transactions;
        if txs.is_empty() {
            return Err(ValidationError::EmptyBlock);
        }
        if txs.len() > self.params.max_txs_per_block {
            return Err(ValidationError::TooManyTransactions {
                max: self.params.max_txs_per_block,
                got: txs.len(),
            });
        }
        if !txs[0].is_coinbase() {
            return Err(ValidationError::FirstNotCoinbase);
        }
        if let Some(position) = txs.iter().skip(1).position(Transaction::is_coinbase) {
            return Err(ValidationError::ExtraCoinbase(position + 1));
        }

        let hashes = block.tx_hashes();
        let mut seen = HashSet::with_capacity(hashes.len());
        for hash in &hashes {
            if !seen.insert(*hash) {
                return Err(ValidationError::DuplicateTransaction(*hash));
            }
        }
        if crate::merkle::merkle_root(&hashes) != block.header.merkle_root {
            return Err(ValidationError::MerkleRootMismatch);
        }

        match (self.params.merged_mining, &block.header.aux_pow) {
            (true, None) => return Err(ValidationError::MissingAuxPow),
            (false, Some(_)) => return Err(ValidationError::UnexpectedAuxPow),
            _ => {}
        }

        for tx in txs {
            self.check_transaction_sanity(tx)?;
        }
        Ok(())
    }

    /// Header checks against the parent and the proof-of-work rules.
    pub fn check_block_context<V: ChainView + ?Sized>(
        &self,
        block: &Block,
        view: &V,
        now: u32,
    ) -> Result<(), ValidationError> {
        let header = &block.header;
        let parent = view
            .header(&header.prev_block_hash)?
            .ok_or(ValidationError::UnknownParent(header.prev_block_hash))?;

        let (_, tip_hash) = view.tip()?;
        if tip_hash != header.prev_block_hash {
            return Err(ValidationError::NotExtendingTip);
        }

        let expected_height = parent.height + 1;
        if header.height != expected_height {
            return Err(ValidationError::WrongHeight {
                expected: expected_height,
                got: header.height,
            });
        }

        if header.timestamp <= parent.timestamp {
            return Err(ValidationError::TimestampNotIncreasing {
                timestamp: header.timestamp,
                parent: parent.timestamp,
            });
        }
        if header.timestamp > now.saturating_add(self.params.max_future_block_time) {
            return Err(ValidationError::TimestampTooFarInFuture {
                timestamp: header.timestamp,
                now,
            });
        }

        let expected_bits = next_required_bits(&self.params, &parent, |height| {
            view.header_at_height(height)
                .ok()
                .flatten()
                .map(|ancestor| ancestor.timestamp)
        })?;
        if header.bits != expected_bits {
            return Err(ValidationError::WrongDifficulty {
                expected: expected_bits,
                got: header.bits,
            });
        }

        let target = compact_to_target(header.bits)?;
        if target > self.params.pow_limit()? {
            return Err(ValidationError::TargetAboveLimit(header.bits));
        }

        // Cheap checks are done; proof of work last
        let block_hash = header.hash();
        let pow_hash = if self.params.merged_mining {
            let aux_pow = header.aux_pow.as_ref().ok_or(ValidationError::MissingAuxPow)?;
            aux_pow.check(&block_hash, self.params.aux_chain_id)?;
            aux_pow.parent_hash()
        } else {
            block_hash
        };
        if !hash_meets_target(&pow_hash, &target) {
            warn!(hash = %short_hex(&block_hash), "Block failed PoW verification");
            return Err(ValidationError::InsufficientProofOfWork);
        }
        Ok(())
    }

    /// Check a non-coinbase transaction against the chain and the block so
    /// far, returning its fee. `ctx` is only updated when the transaction is
    /// accepted.
    pub fn check_transaction_context<V: ChainView + ?Sized>(
        &self,
        tx: &Transaction,
        view: &V,
        ctx: &mut SpendContext,
    ) -> Result<Fixed64, ValidationError> {
        let tx_hash = tx.hash();
        if view.contains_transaction(&tx_hash)? {
            return Err(ValidationError::AlreadyPersisted(tx_hash));
        }

        let mut spent = Vec::with_capacity(tx.inputs.len());
        for outpoint in tx.outpoints() {
            if ctx.spent.contains(outpoint) {
                return Err(ValidationError::DoubleSpend(*outpoint));
            }
            let output = match ctx.created.get(outpoint) {
                Some(output) => output.clone(),
                None => view
                    .unspent_output(outpoint)?
                    .ok_or(ValidationError::DoubleSpend(*outpoint))?,
            };
            spent.push(output);
        }

        self.check_output_assets(tx, view, ctx)?;

        let flows = tx.asset_flows(&spent).ok_or(ValidationError::AmountOverflow)?;
        let mut issued = Vec::new();
        for (asset_id, flow) in &flows {
            if flow.output <= flow.input {
                continue;
            }
            if !matches!(tx.payload, Payload::IssueAsset) {
                return Err(ValidationError::InsufficientInputs(*asset_id));
            }
            if *asset_id == native_asset_id() {
                return Err(ValidationError::NativeIssuance);
            }
            let state = ctx
                .asset(view, asset_id)?
                .ok_or(ValidationError::UnknownAsset(*asset_id))?;
            if !spent.iter().any(|prev| prev.program_hash == state.controller) {
                return Err(ValidationError::UnauthorizedIssuance(*asset_id));
            }
            let pending = ctx.issued.get(asset_id).copied().unwrap_or(Fixed64::ZERO);
            let pending = flow
                .output
                .checked_sub(flow.input)
                .and_then(|excess| pending.checked_add(excess))
                .ok_or(ValidationError::AmountOverflow)?;
            let total = state
                .issued
                .checked_add(pending)
                .ok_or(ValidationError::AmountOverflow)?;
            if total > state.amount {
                return Err(ValidationError::IssuanceExceeded(*asset_id));
            }
            issued.push((*asset_id, pending));
        }

        let fee = flows
            .get(&native_asset_id())
            .and_then(|flow| flow.input.checked_sub(flow.output))
            .filter(|fee| !fee.is_negative())
            .unwrap_or(Fixed64::ZERO);

        // Accepted: record the effects for later transactions in the block
        ctx.spent.extend(tx.outpoints().copied());
        for outpoint in tx.outpoints() {
            ctx.created.remove(outpoint);
        }
        ctx.add_outputs(tx_hash, &tx.outputs);
        ctx.issued.extend(issued);
        if let Payload::RegisterAsset {
            asset,
            amount,
            controller,
        } = &tx.payload
        {
            ctx.registered.insert(
                tx_hash,
                AssetState {
                    asset: asset.clone(),
                    amount: *amount,
                    controller: *controller,
                    issued: Fixed64::ZERO,
                },
            );
        }
        Ok(fee)
    }

    fn check_output_assets<V: ChainView + ?Sized>(
        &self,
        tx: &Transaction,
        view: &V,
        ctx: &SpendContext,
    ) -> Result<(), ValidationError> {
        let mut precisions: HashMap<Hash256, u8> = HashMap::new();
        for output in &tx.outputs {
            let precision = match precisions.get(&output.asset_id) {
                Some(precision) => *precision,
                None => {
                    let state = ctx
                        .asset(view, &output.asset_id)?
                        .ok_or(ValidationError::UnknownAsset(output.asset_id))?;
                    precisions.insert(output.asset_id, state.asset.precision);
                    state.asset.precision
                }
            };
            if !output.value.respects_precision(precision) {
                return Err(ValidationError::PrecisionViolation {
                    amount: output.value,
                    precision,
                });
            }
        }
        Ok(())
    }

    /// Standalone admission check for a single transaction against
    /// persisted state. Returns the fee.
    pub fn validate_transaction<V: ChainView + ?Sized>(
        &self,
        tx: &Transaction,
        view: &V,
    ) -> Result<Fixed64, ValidationError> {
        self.check_transaction_sanity(tx)?;
        self.check_transaction_context(tx, view, &mut SpendContext::new())
    }

    /// Full validation of a block that extends the tip of `view`. Returns
    /// the total fees paid by its transactions.
    pub fn validate_block<V: ChainView + ?Sized>(
        &self,
        block: &Block,
        view: &V,
        now: u32,
    ) -> Result<Fixed64, ValidationError> {
        self.check_block_sanity(block)?;
        self.check_block_context(block, view, now)?;

        let mut ctx = SpendContext::new();
        let coinbase = &block.transactions[0];
        let coinbase_hash = coinbase.hash();
        if view.contains_transaction(&coinbase_hash)? {
            return Err(ValidationError::AlreadyPersisted(coinbase_hash));
        }
        self.check_output_assets(coinbase, view, &ctx)?;
        ctx.add_outputs(coinbase_hash, &coinbase.outputs);

        let mut fees = Fixed64::ZERO;
        for tx in &block.transactions[1..] {
            let fee = self.check_transaction_context(tx, view, &mut ctx)?;
            fees = fees.checked_add(fee).ok_or(ValidationError::AmountOverflow)?;
        }

        self.check_coinbase_reward(coinbase, fees)?;

        debug!(
            height = block.height(),
            txs = block.transactions.len(),
            "Block validated successfully"
        );
        Ok(fees)
    }

    fn check_coinbase_reward(&self, coinbase: &Transaction, fees: Fixed64) -> Result<(), ValidationError> {
        let native = native_asset_id();
        let mut paid = Fixed64::ZERO;
        for output in &coinbase.outputs {
            if output.asset_id != native {
                return Err(ValidationError::CoinbaseAssetMismatch);
            }
            paid = paid
                .checked_add(output.value)
                .ok_or(ValidationError::AmountOverflow)?;
        }
        let allowed = self
            .params
            .block_reward
            .checked_add(fees)
            .ok_or(ValidationError::AmountOverflow)?;
        if paid > allowed {
            return Err(ValidationError::CoinbaseRewardTooHigh { paid, allowed });
        }
        Ok(())
    }
}
