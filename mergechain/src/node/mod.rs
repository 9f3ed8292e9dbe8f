// Copyright (c) 2024 Mergechain Foundation

//! The node: ledger, transaction pool and miner wired together.

pub mod miner;

pub use miner::{AuxBlock, CycleOutcome, Miner, MinerError, MiningStats, MIN_MINING_PERIOD_MS};

use crossbeam_channel::Receiver;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::info;

use crate::address::ProgramHash;
use crate::block::Block;
use crate::consensus::ConsensusParams;
use crate::error::ErrorKind;
use crate::events::{EventBus, NodeEvent};
use crate::hash::Hash256;
use crate::ledger::{ChainState, Ledger, LedgerError, SaveOutcome, UtxoEntry};
use crate::mempool::{MempoolError, TxPool};
use crate::pow::AuxPow;
use crate::serialization::{CodecError, Decode};
use crate::transaction::Transaction;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Malformed payload: {0}")]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Mempool(#[from] MempoolError),

    #[error(transparent)]
    Miner(#[from] MinerError),

    #[error("No miner is configured")]
    MinerNotConfigured,
}

impl NodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NodeError::Codec(_) => ErrorKind::InvalidStructure,
            NodeError::Ledger(e) => e.kind(),
            NodeError::Mempool(e) => e.kind(),
            NodeError::Miner(e) => e.kind(),
            NodeError::MinerNotConfigured => ErrorKind::InvalidContext,
        }
    }
}

/// The main Mergechain node
pub struct Node {
    params: Arc<ConsensusParams>,
    events: EventBus,
    ledger: Arc<Ledger>,
    pool: Arc<TxPool>,
    miner: Option<Miner>,
}

impl Node {
    /// Open the ledger under `ledger_path` and attach a transaction pool.
    pub fn open(ledger_path: &Path, params: Arc<ConsensusParams>) -> Result<Self, NodeError> {
        let events = EventBus::new();
        let ledger = Arc::new(Ledger::open(ledger_path, params.clone(), events.clone())?);
        let pool = Arc::new(TxPool::new(ledger.clone()));

        // Confirmed transactions and their conflicts leave the pool
        let weak: Weak<TxPool> = Arc::downgrade(&pool);
        events.on_event(move |event| {
            if let NodeEvent::BlockPersisted(block) = event {
                if let Some(pool) = weak.upgrade() {
                    pool.clean(&block.transactions);
                }
            }
        });

        info!(network = %params.network, height = ledger.height(), "Node opened");
        Ok(Self {
            params,
            events,
            ledger,
            pool,
            miner: None,
        })
    }

    pub fn params(&self) -> &Arc<ConsensusParams> {
        &self.params
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn pool(&self) -> &Arc<TxPool> {
        &self.pool
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Receive every node event published from now on.
    pub fn subscribe(&self) -> Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Decode and submit a block in wire format.
    pub fn submit_block(&self, bytes: &[u8]) -> Result<SaveOutcome, NodeError> {
        let block = Block::from_bytes(bytes)?;
        self.add_block(block)
    }

    pub fn add_block(&self, block: Block) -> Result<SaveOutcome, NodeError> {
        Ok(self.ledger.save_block(block)?)
    }

    /// Decode a transaction in wire format and admit it to the pool.
    pub fn submit_transaction(&self, bytes: &[u8]) -> Result<Hash256, NodeError> {
        let tx = Transaction::from_bytes(bytes)?;
        self.add_transaction(tx)
    }

    pub fn add_transaction(&self, tx: Transaction) -> Result<Hash256, NodeError> {
        Ok(self.pool.append(tx)?)
    }

    pub fn height(&self) -> u32 {
        self.ledger.height()
    }

    pub fn chain_state(&self) -> ChainState {
        self.ledger.chain_state()
    }

    pub fn block_by_height(&self, height: u32) -> Result<Arc<Block>, NodeError> {
        Ok(self.ledger.get_block_by_height(height)?)
    }

    pub fn block(&self, hash: &Hash256) -> Result<Arc<Block>, NodeError> {
        Ok(self.ledger.get_block(hash)?)
    }

    pub fn transaction(&self, hash: &Hash256) -> Result<(Arc<Transaction>, u32), NodeError> {
        Ok(self.ledger.get_transaction(hash)?)
    }

    pub fn unspents(
        &self,
        program_hash: &ProgramHash,
        asset_id: Option<&Hash256>,
    ) -> Result<HashMap<Hash256, Vec<UtxoEntry>>, NodeError> {
        Ok(self.ledger.unspents(program_hash, asset_id)?)
    }

    /// Pending transactions, highest fee per byte first.
    pub fn pending_transactions(&self, limit: Option<usize>) -> Vec<Arc<Transaction>> {
        self.pool.get_pool(limit)
    }

    /// Configure a miner paying `payout`. Replaces and stops any previous one.
    pub fn set_miner(&mut self, payout: ProgramHash, period_ms: u64) -> &Miner {
        if let Some(previous) = self.miner.take() {
            previous.stop();
        }
        self.miner
            .insert(Miner::new(self.ledger.clone(), self.pool.clone(), payout, period_ms))
    }

    pub fn miner(&self) -> Option<&Miner> {
        self.miner.as_ref()
    }

    pub fn start_mining(&self) -> Result<(), NodeError> {
        let miner = self.miner.as_ref().ok_or(NodeError::MinerNotConfigured)?;
        Ok(miner.start()?)
    }

    pub fn stop_mining(&self) {
        if let Some(miner) = &self.miner {
            miner.stop();
        }
    }

    pub fn create_aux_block(&self, payout: ProgramHash) -> Result<AuxBlock, NodeError> {
        let miner = self.miner.as_ref().ok_or(NodeError::MinerNotConfigured)?;
        Ok(miner.create_aux_block(payout)?)
    }

    pub fn submit_aux_block(&self, hash: &Hash256, aux_pow: AuxPow) -> Result<SaveOutcome, NodeError> {
        let miner = self.miner.as_ref().ok_or(NodeError::MinerNotConfigured)?;
        Ok(miner.submit_aux_block(hash, aux_pow)?)
    }

    /// Wait until every block queued so far has been written.
    pub fn flush(&self) -> Result<(), NodeError> {
        Ok(self.ledger.flush()?)
    }

    /// Stop the miner, then drain and stop the ledger writer.
    pub fn shutdown(&self) {
        self.stop_mining();
        self.ledger.shutdown();
        info!(height = self.ledger.height(), "Node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::Network;
    use crate::serialization::Encode;
    use tempfile::tempdir;

    #[test]
    fn test_submit_malformed_block() {
        let dir = tempdir().unwrap();
        let node = Node::open(
            dir.path(),
            Arc::new(ConsensusParams::for_network(Network::Regtest)),
        )
        .unwrap();

        let err = node.submit_block(&[1, 2, 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidStructure);
    }

    #[test]
    fn test_submit_genesis_is_stale() {
        let dir = tempdir().unwrap();
        let params = Arc::new(ConsensusParams::for_network(Network::Regtest));
        let node = Node::open(dir.path(), params.clone()).unwrap();

        let bytes = Block::genesis(&params).to_bytes();
        assert_eq!(node.submit_block(&bytes).unwrap(), SaveOutcome::Stale);
    }

    #[test]
    fn test_mining_requires_miner() {
        let dir = tempdir().unwrap();
        let mut node = Node::open(
            dir.path(),
            Arc::new(ConsensusParams::for_network(Network::Regtest)),
        )
        .unwrap();
        assert!(matches!(node.start_mining(), Err(NodeError::MinerNotConfigured)));

        node.set_miner(ProgramHash::standard([5; 20]), 1000);
        node.miner().unwrap().mine_once().unwrap();
        node.flush().unwrap();
        assert_eq!(node.height(), 1);
        node.shutdown();
    }
}
