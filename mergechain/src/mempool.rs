// Copyright (c) 2024 Mergechain Foundation

//! Transaction pool for storing pending transactions.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use crate::asset::Fixed64;
use crate::consensus::ValidationError;
use crate::error::ErrorKind;
use crate::events::{EventBus, NodeEvent};
use crate::hash::{short_hex, Hash256};
use crate::ledger::Ledger;
use crate::transaction::{OutPoint, Transaction};

/// Maximum transactions in the pool
pub const MAX_POOL_SIZE: usize = 10_000;

/// Maximum age of a transaction before `evict_old` removes it
pub const MAX_TX_AGE: Duration = Duration::from_secs(60 * 60);

/// A pending transaction with metadata
#[derive(Debug, Clone)]
pub struct PendingTx {
    pub tx: Arc<Transaction>,
    pub fee: Fixed64,
    pub fee_per_byte: i64,
    pub size: usize,
    pub received_at: Instant,
}

impl PendingTx {
    pub fn new(tx: Arc<Transaction>, fee: Fixed64) -> Self {
        let size = tx.size().max(1);
        Self {
            fee_per_byte: fee.value() / size as i64,
            fee,
            size,
            tx,
            received_at: Instant::now(),
        }
    }
}

#[derive(Default)]
struct PoolInner {
    txs: HashMap<Hash256, PendingTx>,
    /// Outputs reserved by pool transactions, to the hash of the spender
    spent: HashMap<OutPoint, Hash256>,
}

impl PoolInner {
    fn remove(&mut self, hash: &Hash256) -> Option<PendingTx> {
        let pending = self.txs.remove(hash)?;
        for outpoint in pending.tx.outpoints() {
            if self.spent.get(outpoint) == Some(hash) {
                self.spent.remove(outpoint);
            }
        }
        Some(pending)
    }

    fn lowest_fee(&self) -> Option<(Hash256, i64)> {
        self.txs
            .iter()
            .min_by_key(|(_, pending)| pending.fee_per_byte)
            .map(|(hash, pending)| (*hash, pending.fee_per_byte))
    }
}

/// Pool of validated transactions waiting for a block
pub struct TxPool {
    inner: RwLock<PoolInner>,
    ledger: Arc<Ledger>,
    events: EventBus,
    max_size: usize,
}

impl TxPool {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self::with_capacity(ledger, MAX_POOL_SIZE)
    }

    pub fn with_capacity(ledger: Arc<Ledger>, max_size: usize) -> Self {
        let events = ledger.events().clone();
        Self {
            inner: RwLock::new(PoolInner::default()),
            ledger,
            events,
            max_size: max_size.max(1),
        }
    }

    /// Validate `tx` against the persisted chain and the pool, then admit it.
    pub fn append(&self, tx: Transaction) -> Result<Hash256, MempoolError> {
        let tx_hash = tx.hash();
        if tx.is_coinbase() {
            return Err(MempoolError::CoinbaseNotAllowed);
        }
        if self.contains(&tx_hash) {
            return Err(MempoolError::AlreadyExists(tx_hash));
        }

        // Contextual checks read LMDB, so they run before the pool lock
        let fee = self
            .ledger
            .validator()
            .validate_transaction(&tx, self.ledger.as_ref())
            .map_err(MempoolError::from)?;

        let tx = Arc::new(tx);
        let pending = PendingTx::new(tx.clone(), fee);
        {
            let mut inner = self.inner.write();
            if inner.txs.contains_key(&tx_hash) {
                return Err(MempoolError::AlreadyExists(tx_hash));
            }
            if let Some(outpoint) = tx.outpoints().find(|o| inner.spent.contains_key(o)) {
                return Err(MempoolError::DoubleSpend(*outpoint));
            }

            if inner.txs.len() >= self.max_size {
                match inner.lowest_fee() {
                    Some((lowest, fee_per_byte)) if fee_per_byte < pending.fee_per_byte => {
                        inner.remove(&lowest);
                        debug!(tx = %short_hex(&lowest), "Evicted low-fee transaction from pool");
                    }
                    _ => return Err(MempoolError::PoolFull),
                }
            }

            for outpoint in tx.outpoints() {
                inner.spent.insert(*outpoint, tx_hash);
            }
            inner.txs.insert(tx_hash, pending);
        }

        debug!(tx = %short_hex(&tx_hash), fee = %fee, "Added transaction to pool");
        self.events.publish(NodeEvent::TransactionAdmitted(tx));
        Ok(tx_hash)
    }

    /// Pool transactions by fee per byte, highest first.
    pub fn get_pool(&self, limit: Option<usize>) -> Vec<Arc<Transaction>> {
        let inner = self.inner.read();
        let mut pending: Vec<&PendingTx> = inner.txs.values().collect();
        pending.sort_by(|a, b| {
            b.fee_per_byte
                .cmp(&a.fee_per_byte)
                .then(a.received_at.cmp(&b.received_at))
        });
        pending
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|p| p.tx.clone())
            .collect()
    }

    /// Drop transactions confirmed by a block, and any pool transaction that
    /// spends an output those confirmed transactions consumed.
    pub fn clean(&self, confirmed: &[Transaction]) -> usize {
        let mut inner = self.inner.write();
        let before = inner.txs.len();
        for tx in confirmed {
            inner.remove(&tx.hash());
            for outpoint in tx.outpoints() {
                if let Some(conflict) = inner.spent.get(outpoint).copied() {
                    inner.remove(&conflict);
                    debug!(tx = %short_hex(&conflict), "Removed conflicting transaction from pool");
                }
            }
        }
        let removed = before - inner.txs.len();
        if removed > 0 {
            info!(removed, remaining = inner.txs.len(), "Cleaned transaction pool");
        }
        removed
    }

    pub fn remove(&self, hash: &Hash256) -> Option<Arc<Transaction>> {
        self.inner.write().remove(hash).map(|pending| pending.tx)
    }

    /// Remove transactions received more than `max_age` ago.
    pub fn evict_old(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let stale: Vec<Hash256> = inner
            .txs
            .iter()
            .filter(|(_, pending)| now.duration_since(pending.received_at) > max_age)
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &stale {
            inner.remove(hash);
            debug!(tx = %short_hex(hash), "Evicted old transaction from pool");
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.inner.read().txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().txs.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.inner.read().txs.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash256) -> Option<PendingTx> {
        self.inner.read().txs.get(hash).cloned()
    }

    /// Hash of the pool transaction reserving `outpoint`, if any.
    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.inner.read().spent.get(outpoint).copied()
    }

    /// Sum of the fees of all pending transactions.
    pub fn total_fees(&self) -> Fixed64 {
        self.inner
            .read()
            .txs
            .values()
            .fold(Fixed64::ZERO, |acc, p| acc.checked_add(p.fee).unwrap_or(acc))
    }
}

/// Pool admission errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MempoolError {
    #[error("Transaction {} already in pool", short_hex(.0))]
    AlreadyExists(Hash256),

    #[error("Coinbase transactions cannot enter the pool")]
    CoinbaseNotAllowed,

    #[error("Output {0} is already spent")]
    DoubleSpend(OutPoint),

    #[error("Invalid transaction: {0}")]
    Invalid(ValidationError),

    #[error("Pool is full")]
    PoolFull,

    #[error("Ledger error: {0}")]
    Ledger(String),
}

impl From<ValidationError> for MempoolError {
    fn from(e: ValidationError) -> Self {
        match e {
            ValidationError::DoubleSpend(outpoint) => MempoolError::DoubleSpend(outpoint),
            ValidationError::Storage(msg) => MempoolError::Ledger(msg),
            other => MempoolError::Invalid(other),
        }
    }
}

impl MempoolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MempoolError::AlreadyExists(_) | MempoolError::PoolFull => ErrorKind::InvalidContext,
            MempoolError::CoinbaseNotAllowed => ErrorKind::InvalidStructure,
            MempoolError::DoubleSpend(_) => ErrorKind::DoubleSpend,
            MempoolError::Invalid(e) => e.kind(),
            MempoolError::Ledger(_) => ErrorKind::StorageFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ProgramHash;
    use crate::block::{native_asset_id, now_secs, Block};
    use crate::consensus::{BlockBuilder, ConsensusParams, Network};
    use crate::pow::solve_header;
    use crate::transaction::TxOutput;
    use tempfile::{tempdir, TempDir};

    fn owner(byte: u8) -> ProgramHash {
        ProgramHash::standard([byte; 20])
    }

    fn output(value: i64, to: ProgramHash) -> TxOutput {
        TxOutput {
            asset_id: native_asset_id(),
            value: Fixed64::from_units(value),
            program_hash: to,
        }
    }

    /// Ledger with one mined block whose coinbase pays 2 and 3 coins to
    /// `owner(1)`.
    fn funded_ledger() -> (TempDir, Arc<Ledger>, [OutPoint; 2]) {
        let dir = tempdir().unwrap();
        let params = Arc::new(ConsensusParams::for_network(Network::Regtest));
        let ledger = Arc::new(Ledger::open(dir.path(), params, EventBus::new()).unwrap());
        let builder = BlockBuilder::new(ledger.validator().clone(), owner(1));
        let tip = ledger.tip_header().unwrap();
        let mut block: Block = builder.build(ledger.as_ref(), &tip, &[], now_secs()).unwrap().block;
        block.transactions[0].outputs = vec![output(2, owner(1)), output(3, owner(1))];
        block.header.merkle_root = block.compute_merkle_root();
        assert!(solve_header(&mut block.header, 1_000_000).unwrap());
        let coinbase = block.transactions[0].hash();
        ledger.save_block(block).unwrap();
        ledger.flush().unwrap();
        (dir, ledger, [OutPoint::new(coinbase, 0), OutPoint::new(coinbase, 1)])
    }

    #[test]
    fn test_pool_new() {
        let (_dir, ledger, _) = funded_ledger();
        let pool = TxPool::new(ledger);
        assert!(pool.is_empty());
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_append_and_get_pool() {
        let (_dir, ledger, [funding, _]) = funded_ledger();
        let pool = TxPool::new(ledger);
        let tx = Transaction::new_transfer(vec![funding], vec![output(1, owner(2))]);

        let hash = pool.append(tx.clone()).unwrap();
        assert!(pool.contains(&hash));
        assert_eq!(pool.get(&hash).unwrap().fee, Fixed64::from_units(1));
        assert_eq!(pool.total_fees(), Fixed64::from_units(1));
        assert_eq!(pool.spender_of(&funding), Some(hash));
        assert_eq!(pool.get_pool(None), vec![Arc::new(tx.clone())]);
        assert_eq!(pool.append(tx).unwrap_err(), MempoolError::AlreadyExists(hash));
    }

    #[test]
    fn test_get_pool_orders_by_fee_per_byte() {
        let (_dir, ledger, [small, large]) = funded_ledger();
        let pool = TxPool::new(ledger);
        let cheap = Transaction::new_transfer(vec![large], vec![output(3, owner(2))]);
        let rich = Transaction::new_transfer(vec![small], vec![output(1, owner(2))]);
        pool.append(cheap.clone()).unwrap();
        pool.append(rich.clone()).unwrap();

        let ordered = pool.get_pool(None);
        assert_eq!(*ordered[0], rich);
        assert_eq!(*ordered[1], cheap);
        assert_eq!(pool.get_pool(Some(1)).len(), 1);
    }

    #[test]
    fn test_double_spend_rejected() {
        let (_dir, ledger, [funding, _]) = funded_ledger();
        let pool = TxPool::new(ledger);
        pool.append(Transaction::new_transfer(vec![funding], vec![output(2, owner(2))]))
            .unwrap();

        let err = pool
            .append(Transaction::new_transfer(vec![funding], vec![output(2, owner(3))]))
            .unwrap_err();
        assert_eq!(err, MempoolError::DoubleSpend(funding));
        assert_eq!(err.kind(), ErrorKind::DoubleSpend);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_unknown_input_is_double_spend() {
        let (_dir, ledger, [funding, _]) = funded_ledger();
        let pool = TxPool::new(ledger);
        let missing = OutPoint::new(funding.tx_hash, 7);
        let err = pool
            .append(Transaction::new_transfer(vec![missing], vec![output(1, owner(2))]))
            .unwrap_err();
        assert_eq!(err, MempoolError::DoubleSpend(missing));
    }

    #[test]
    fn test_coinbase_rejected() {
        let (_dir, ledger, _) = funded_ledger();
        let pool = TxPool::new(ledger);
        let err = pool
            .append(Transaction::new_coinbase(9, 1, vec![output(1, owner(2))]))
            .unwrap_err();
        assert_eq!(err, MempoolError::CoinbaseNotAllowed);
        assert_eq!(err.kind(), ErrorKind::InvalidStructure);
    }

    #[test]
    fn test_clean_removes_confirmed_and_conflicts() {
        let (_dir, ledger, [first, second]) = funded_ledger();
        let pool = TxPool::new(ledger);
        let confirmed = Transaction::new_transfer(vec![first], vec![output(2, owner(2))]);
        pool.append(confirmed.clone()).unwrap();
        let conflicting = pool
            .append(Transaction::new_transfer(vec![second], vec![output(3, owner(2))]))
            .unwrap();

        // A different spend of `second` confirmed elsewhere
        let rival = Transaction::new_transfer(vec![second], vec![output(1, owner(3))]);
        assert_eq!(pool.clean(&[confirmed, rival]), 2);
        assert!(!pool.contains(&conflicting));
        assert!(pool.is_empty());
        assert_eq!(pool.spender_of(&second), None);
    }

    #[test]
    fn test_remove_frees_reservation() {
        let (_dir, ledger, [funding, _]) = funded_ledger();
        let pool = TxPool::new(ledger);
        let hash = pool
            .append(Transaction::new_transfer(vec![funding], vec![output(2, owner(2))]))
            .unwrap();

        assert!(pool.remove(&hash).is_some());
        assert!(pool.remove(&hash).is_none());
        pool.append(Transaction::new_transfer(vec![funding], vec![output(1, owner(3))]))
            .unwrap();
    }

    #[test]
    fn test_full_pool_evicts_lower_fee() {
        let (_dir, ledger, [first, second]) = funded_ledger();
        let pool = TxPool::with_capacity(ledger, 1);

        let free = pool
            .append(Transaction::new_transfer(vec![first], vec![output(2, owner(2))]))
            .unwrap();
        assert_eq!(
            pool.append(Transaction::new_transfer(vec![second], vec![output(3, owner(2))]))
                .unwrap_err(),
            MempoolError::PoolFull
        );

        // A fee-paying transaction displaces the free one
        let paying = pool
            .append(Transaction::new_transfer(vec![second], vec![output(2, owner(2))]))
            .unwrap();
        assert!(pool.contains(&paying));
        assert!(!pool.contains(&free));
        assert_eq!(pool.spender_of(&first), None);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_evict_old() {
        let (_dir, ledger, [funding, _]) = funded_ledger();
        let pool = TxPool::new(ledger);
        pool.append(Transaction::new_transfer(vec![funding], vec![output(2, owner(2))]))
            .unwrap();

        assert_eq!(pool.evict_old(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(pool.evict_old(Duration::from_millis(1)), 1);
        assert!(pool.is_empty());
    }
}
