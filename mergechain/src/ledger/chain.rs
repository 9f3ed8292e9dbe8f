// Copyright (c) 2024 Mergechain Foundation

use crossbeam_channel::{bounded, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use super::cache::BlockCache;
use super::store::LedgerDb;
use super::utxo::UtxoEntry;
use super::worker::{self, LedgerTask};
use super::{ChainState, LedgerError, SaveOutcome};
use crate::address::ProgramHash;
use crate::block::{now_secs, Block, BlockHeader};
use crate::consensus::{AssetState, BlockValidator, ChainView, ConsensusParams, ValidationError};
use crate::events::{EventBus, NodeEvent};
use crate::hash::{short_hex, Hash256};
use crate::pow::next_required_bits;
use crate::transaction::{OutPoint, Transaction, TxOutput};

/// Capacity of the writer's task queue.
pub const TASK_QUEUE_CAPACITY: usize = 1024;

/// Most blocks held while waiting for their parent.
pub const MAX_DEFERRED_BLOCKS: usize = 256;

/// State shared between the ledger handle and its writer thread.
pub(crate) struct LedgerCore {
    store: LedgerDb,
    state: RwLock<ChainState>,
    cache: RwLock<BlockCache>,
    /// Future blocks keyed by the hash of the parent they wait for
    deferred: Mutex<HashMap<Hash256, Block>>,
    validator: BlockValidator,
    events: EventBus,
}

impl LedgerCore {
    fn chain_state(&self) -> ChainState {
        self.state.read().clone()
    }

    fn block(&self, hash: &Hash256) -> Result<Arc<Block>, LedgerError> {
        if let Some(block) = self.cache.read().block(hash) {
            return Ok(block);
        }
        self.store
            .block(hash)?
            .map(Arc::new)
            .ok_or_else(|| LedgerError::NotFound(format!("block {}", short_hex(hash))))
    }

    fn header(&self, hash: &Hash256) -> Result<BlockHeader, LedgerError> {
        if let Some(header) = self.cache.read().header(hash) {
            return Ok(header);
        }
        self.store
            .header(hash)?
            .ok_or_else(|| LedgerError::NotFound(format!("header {}", short_hex(hash))))
    }

    fn block_hash(&self, height: u32) -> Result<Hash256, LedgerError> {
        if let Some(hash) = self.cache.read().block_hash(height) {
            return Ok(hash);
        }
        self.store
            .block_hash(height)?
            .ok_or_else(|| LedgerError::NotFound(format!("block at height {}", height)))
    }

    fn transaction(&self, hash: &Hash256) -> Result<(Arc<Transaction>, u32), LedgerError> {
        if let Some(found) = self.cache.read().transaction(hash) {
            return Ok(found);
        }
        self.store
            .transaction(hash)?
            .map(|(tx, height)| (Arc::new(tx), height))
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", short_hex(hash))))
    }

    fn asset(&self, id: &Hash256) -> Result<AssetState, LedgerError> {
        if let Some(state) = self.cache.read().asset(id) {
            return Ok(state);
        }
        self.store
            .asset(id)?
            .ok_or_else(|| LedgerError::NotFound(format!("asset {}", short_hex(id))))
    }

    /// Hold a block whose parent has not been persisted yet. Hands the
    /// block back if its parent became the tip in the meantime.
    fn defer(&self, block: Block) -> Option<Block> {
        let mut deferred = self.deferred.lock();
        let parent = block.header.prev_block_hash;
        // The writer updates the state before taking this lock, so a parent
        // committed after this check will find the block in the map
        if self.state.read().tip_hash == parent {
            return Some(block);
        }
        if deferred.len() >= MAX_DEFERRED_BLOCKS && !deferred.contains_key(&parent) {
            warn!(
                height = block.height(),
                "Deferred block map is full, dropping future block"
            );
            return None;
        }
        debug!(height = block.height(), parent = %short_hex(&parent), "Deferring future block");
        deferred.insert(parent, block);
        None
    }

    /// Persist `block`, then any deferred descendants it unblocks.
    pub(crate) fn apply_persist(&self, block: Block) {
        let mut next = Some(block);
        while let Some(block) = next.take() {
            let hash = match self.commit_block(block) {
                Some(hash) => hash,
                None => break,
            };

            let child = {
                let mut deferred = self.deferred.lock();
                let height = self.state.read().height;
                let child = deferred.remove(&hash);
                deferred.retain(|_, waiting| waiting.height() > height);
                child
            };
            if let Some(child) = child {
                match self.validator.validate_block(&child, self, now_secs()) {
                    Ok(_) => next = Some(child),
                    Err(e) => warn!(
                        height = child.height(),
                        error = %e,
                        "Dropping deferred block"
                    ),
                }
            }
        }
    }

    fn commit_block(&self, block: Block) -> Option<Hash256> {
        let state = self.chain_state();
        let hash = block.hash();
        let height = block.height();
        if block.header.prev_block_hash != state.tip_hash || height != state.height + 1 {
            warn!(
                height,
                hash = %short_hex(&hash),
                tip = %short_hex(&state.tip_hash),
                "Block no longer extends the tip, dropping"
            );
            return None;
        }

        if let Err(e) = self.store.persist_block(&block) {
            error!(height, hash = %short_hex(&hash), error = %e, "Failed to persist block");
            return None;
        }

        let block = Arc::new(block);
        *self.state.write() = ChainState {
            height,
            tip_hash: hash,
            tip_timestamp: block.header.timestamp,
            tip_bits: block.header.bits,
        };
        {
            let mut cache = self.cache.write();
            cache.insert_block(block.clone());
            cache.evict(height);
        }

        info!(
            height,
            hash = %short_hex(&hash),
            txs = block.transactions.len(),
            "Added block"
        );
        self.events.publish(NodeEvent::BlockPersisted(block));
        Some(hash)
    }

    pub(crate) fn apply_rollback(&self, hash: &Hash256) {
        let state = self.chain_state();
        if state.tip_hash != *hash || state.height == 0 {
            warn!(hash = %short_hex(hash), "Rollback target is not a removable tip, ignoring");
            return;
        }

        let rolled_back = self.block(hash).and_then(|block| {
            let parent = self.header(&block.header.prev_block_hash)?;
            self.store.rollback_block(&block)?;
            Ok(parent)
        });
        let parent = match rolled_back {
            Ok(parent) => parent,
            Err(e) => {
                error!(hash = %short_hex(hash), error = %e, "Failed to roll back block");
                return;
            }
        };

        *self.state.write() = ChainState {
            height: parent.height,
            tip_hash: parent.hash(),
            tip_timestamp: parent.timestamp,
            tip_bits: parent.bits,
        };
        self.cache.write().remove_block(hash);
        info!(
            height = state.height,
            hash = %short_hex(hash),
            "Rolled back block"
        );
    }
}

fn storage(e: LedgerError) -> ValidationError {
    ValidationError::Storage(e.to_string())
}

fn optional<T>(result: Result<T, LedgerError>) -> Result<Option<T>, ValidationError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(LedgerError::NotFound(_)) => Ok(None),
        Err(e) => Err(storage(e)),
    }
}

impl ChainView for LedgerCore {
    fn tip(&self) -> Result<(u32, Hash256), ValidationError> {
        let state = self.state.read();
        Ok((state.height, state.tip_hash))
    }

    fn header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, ValidationError> {
        optional(LedgerCore::header(self, hash))
    }

    fn header_at_height(&self, height: u32) -> Result<Option<BlockHeader>, ValidationError> {
        optional(self.block_hash(height).and_then(|hash| LedgerCore::header(self, &hash)))
    }

    fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<TxOutput>, ValidationError> {
        self.store.unspent_output(outpoint).map_err(storage)
    }

    fn contains_transaction(&self, hash: &Hash256) -> Result<bool, ValidationError> {
        if self.cache.read().transaction(hash).is_some() {
            return Ok(true);
        }
        self.store.contains_transaction(hash).map_err(storage)
    }

    fn asset(&self, id: &Hash256) -> Result<Option<AssetState>, ValidationError> {
        optional(LedgerCore::asset(self, id))
    }
}

/// Handle to the chain. Reads are served from the cache or LMDB on the
/// caller's thread; writes go through the writer's task queue.
pub struct Ledger {
    core: Arc<LedgerCore>,
    params: Arc<ConsensusParams>,
    tasks: Sender<LedgerTask>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Ledger {
    /// Open or create the ledger under `path`. An empty ledger is
    /// initialized with the network's genesis block.
    pub fn open(
        path: &Path,
        params: Arc<ConsensusParams>,
        events: EventBus,
    ) -> Result<Self, LedgerError> {
        let store = LedgerDb::open(path)?;
        let genesis = Block::genesis(&params);

        let (tip_hash, _) = match store.current_block()? {
            Some(current) => {
                if store.block_hash(0)? != Some(genesis.hash()) {
                    return Err(LedgerError::GenesisMismatch);
                }
                current
            }
            None => {
                info!(network = %params.network, "Initializing ledger with genesis block");
                store.persist_block(&genesis)?;
                (genesis.hash(), 0)
            }
        };
        let tip = store
            .header(&tip_hash)?
            .ok_or_else(|| LedgerError::NotFound(format!("tip header {}", short_hex(&tip_hash))))?;
        let state = ChainState {
            height: tip.height,
            tip_hash,
            tip_timestamp: tip.timestamp,
            tip_bits: tip.bits,
        };
        info!(height = state.height, tip = %short_hex(&tip_hash), "Opened ledger");

        let (tasks, receiver) = bounded(TASK_QUEUE_CAPACITY);
        let core = Arc::new(LedgerCore {
            store,
            state: RwLock::new(state),
            cache: RwLock::new(BlockCache::default()),
            deferred: Mutex::new(HashMap::new()),
            validator: BlockValidator::new(params.clone()),
            events,
        });
        let worker = worker::spawn(core.clone(), receiver)?;

        Ok(Self {
            core,
            params,
            tasks,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn params(&self) -> &Arc<ConsensusParams> {
        &self.params
    }

    pub fn validator(&self) -> &BlockValidator {
        &self.core.validator
    }

    pub fn events(&self) -> &EventBus {
        &self.core.events
    }

    pub fn chain_state(&self) -> ChainState {
        self.core.chain_state()
    }

    pub fn height(&self) -> u32 {
        self.core.state.read().height
    }

    /// Submit a block for persistence.
    ///
    /// Blocks at or below the current height are ignored and blocks beyond
    /// the next height are deferred. The next block is validated here and
    /// queued for the writer; validation errors are returned.
    pub fn save_block(&self, block: Block) -> Result<SaveOutcome, LedgerError> {
        let state = self.chain_state();
        let height = block.height();

        if height <= state.height {
            debug!(height, tip = state.height, "Ignoring stale block");
            return Ok(SaveOutcome::Stale);
        }
        let block = if height > state.height + 1 {
            self.core.validator.check_block_sanity(&block)?;
            match self.core.defer(block) {
                Some(block) => block,
                None => return Ok(SaveOutcome::Deferred),
            }
        } else {
            block
        };

        self.core
            .validator
            .validate_block(&block, self.core.as_ref(), now_secs())?;

        let hash = block.hash();
        self.tasks
            .send(LedgerTask::Persist(Box::new(block)))
            .map_err(|_| LedgerError::WorkerStopped)?;
        Ok(SaveOutcome::Queued(hash))
    }

    /// Queue removal of the current tip.
    pub fn rollback_block(&self, hash: &Hash256) -> Result<(), LedgerError> {
        let state = self.chain_state();
        if state.tip_hash != *hash {
            return Err(LedgerError::NotTip(*hash));
        }
        if state.height == 0 {
            return Err(LedgerError::RollbackGenesis);
        }
        self.tasks
            .send(LedgerTask::Rollback(*hash))
            .map_err(|_| LedgerError::WorkerStopped)
    }

    /// Block until every task queued before this call has run.
    pub fn flush(&self) -> Result<(), LedgerError> {
        let (done, wait) = bounded(1);
        self.tasks
            .send(LedgerTask::Flush(done))
            .map_err(|_| LedgerError::WorkerStopped)?;
        wait.recv().map_err(|_| LedgerError::WorkerStopped)
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Arc<Block>, LedgerError> {
        self.core.block(hash)
    }

    pub fn get_block_by_height(&self, height: u32) -> Result<Arc<Block>, LedgerError> {
        let hash = self.core.block_hash(height)?;
        self.core.block(&hash)
    }

    /// A transaction and the height of its block.
    pub fn get_transaction(&self, hash: &Hash256) -> Result<(Arc<Transaction>, u32), LedgerError> {
        self.core.transaction(hash)
    }

    pub fn get_block_hash(&self, height: u32) -> Result<Hash256, LedgerError> {
        self.core.block_hash(height)
    }

    pub fn get_header(&self, hash: &Hash256) -> Result<BlockHeader, LedgerError> {
        self.core.header(hash)
    }

    pub fn get_asset(&self, id: &Hash256) -> Result<AssetState, LedgerError> {
        self.core.asset(id)
    }

    pub fn tip_header(&self) -> Result<BlockHeader, LedgerError> {
        let tip_hash = self.core.state.read().tip_hash;
        self.core.header(&tip_hash)
    }

    /// Compact target required for the block after the current tip.
    pub fn next_bits(&self) -> Result<u32, LedgerError> {
        let tip = self.tip_header()?;
        next_required_bits(&self.params, &tip, |height| {
            self.core
                .block_hash(height)
                .and_then(|hash| self.core.header(&hash))
                .ok()
                .map(|header| header.timestamp)
        })
        .map_err(|e| LedgerError::Invalid(e.into()))
    }

    pub fn get_unspent_from_program_hash(
        &self,
        program_hash: &ProgramHash,
        asset_id: &Hash256,
    ) -> Result<Vec<UtxoEntry>, LedgerError> {
        Ok(self
            .core
            .store
            .unspents(program_hash, Some(asset_id))?
            .remove(asset_id)
            .unwrap_or_default())
    }

    pub fn get_unspents_from_program_hash(
        &self,
        program_hash: &ProgramHash,
    ) -> Result<HashMap<Hash256, Vec<UtxoEntry>>, LedgerError> {
        self.core.store.unspents(program_hash, None)
    }

    /// Unspent entries of an owner, optionally restricted to one asset.
    pub fn unspents(
        &self,
        program_hash: &ProgramHash,
        asset_id: Option<&Hash256>,
    ) -> Result<HashMap<Hash256, Vec<UtxoEntry>>, LedgerError> {
        self.core.store.unspents(program_hash, asset_id)
    }

    pub fn deferred_count(&self) -> usize {
        self.core.deferred.lock().len()
    }

    /// Stop the writer after the tasks already queued and wait for it.
    pub fn shutdown(&self) {
        let handle = match self.worker.lock().take() {
            Some(handle) => handle,
            None => return,
        };
        let _ = self.tasks.send(LedgerTask::Shutdown);
        if handle.thread().id() == thread::current().id() {
            // Dropped from an event hook on the writer itself
            return;
        }
        if handle.join().is_err() {
            error!("Ledger writer panicked");
        }
    }
}

impl ChainView for Ledger {
    fn tip(&self) -> Result<(u32, Hash256), ValidationError> {
        self.core.tip()
    }

    fn header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, ValidationError> {
        ChainView::header(self.core.as_ref(), hash)
    }

    fn header_at_height(&self, height: u32) -> Result<Option<BlockHeader>, ValidationError> {
        self.core.header_at_height(height)
    }

    fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<TxOutput>, ValidationError> {
        self.core.unspent_output(outpoint)
    }

    fn contains_transaction(&self, hash: &Hash256) -> Result<bool, ValidationError> {
        self.core.contains_transaction(hash)
    }

    fn asset(&self, id: &Hash256) -> Result<Option<AssetState>, ValidationError> {
        ChainView::asset(self.core.as_ref(), id)
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::Fixed64;
    use crate::block::native_asset_id;
    use crate::consensus::{BlockBuilder, Network};
    use crate::error::ErrorKind;
    use crate::pow::solve_header;
    use tempfile::tempdir;

    fn regtest() -> Arc<ConsensusParams> {
        Arc::new(ConsensusParams::for_network(Network::Regtest))
    }

    fn next_block(ledger: &Ledger, builder: &BlockBuilder) -> Block {
        let tip = ledger.tip_header().unwrap();
        let mut block = builder.build(ledger, &tip, &[], now_secs()).unwrap().block;
        assert!(solve_header(&mut block.header, 1_000_000).unwrap());
        block
    }

    fn builder(ledger: &Ledger) -> BlockBuilder {
        BlockBuilder::new(ledger.validator().clone(), ProgramHash::standard([1; 20]))
    }

    #[test]
    fn test_ledger_open_and_genesis() {
        let dir = tempdir().unwrap();
        let params = regtest();
        let ledger = Ledger::open(dir.path(), params.clone(), EventBus::new()).unwrap();

        assert_eq!(ledger.height(), 0);
        let genesis = ledger.get_block_by_height(0).unwrap();
        assert_eq!(genesis.hash(), Block::genesis(&params).hash());
        assert_eq!(ledger.get_asset(&native_asset_id()).unwrap().asset.name, "MGC");
    }

    #[test]
    fn test_save_block_advances_height() {
        let dir = tempdir().unwrap();
        let events = EventBus::new();
        let persisted = events.subscribe();
        let ledger = Ledger::open(dir.path(), regtest(), events).unwrap();
        let builder = builder(&ledger);

        let block = next_block(&ledger, &builder);
        let hash = block.hash();
        assert_eq!(ledger.save_block(block.clone()).unwrap(), SaveOutcome::Queued(hash));
        ledger.flush().unwrap();

        assert_eq!(ledger.height(), 1);
        assert_eq!(ledger.get_block_hash(1).unwrap(), hash);
        assert_eq!(ledger.get_header(&hash).unwrap(), block.header);
        let coinbase = block.transactions[0].hash();
        assert_eq!(ledger.get_transaction(&coinbase).unwrap().1, 1);
        match persisted.try_recv().unwrap() {
            NodeEvent::BlockPersisted(b) => assert_eq!(b.hash(), hash),
            other => panic!("unexpected event {:?}", other),
        }

        // Resubmitting is stale
        assert_eq!(ledger.save_block(block).unwrap(), SaveOutcome::Stale);
    }

    #[test]
    fn test_invalid_block_rejected() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path(), regtest(), EventBus::new()).unwrap();
        let builder = builder(&ledger);

        let mut block = next_block(&ledger, &builder);
        block.transactions[0].outputs[0].value = Fixed64::from_units(1_000);
        block.header.merkle_root = block.compute_merkle_root();
        assert!(solve_header(&mut block.header, 1_000_000).unwrap());

        let err = ledger.save_block(block).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidContext);
        ledger.flush().unwrap();
        assert_eq!(ledger.height(), 0);
    }

    #[test]
    fn test_future_block_deferred_then_promoted() {
        let dir = tempdir().unwrap();
        let params = regtest();
        let ledger = Ledger::open(dir.path(), params.clone(), EventBus::new()).unwrap();
        let builder = builder(&ledger);

        // Build two blocks on a scratch ledger so the second can arrive first
        let scratch_dir = tempdir().unwrap();
        let scratch = Ledger::open(scratch_dir.path(), params, EventBus::new()).unwrap();
        let first = next_block(&scratch, &builder);
        scratch.save_block(first.clone()).unwrap();
        scratch.flush().unwrap();
        let second = next_block(&scratch, &builder);

        assert_eq!(ledger.save_block(second.clone()).unwrap(), SaveOutcome::Deferred);
        assert_eq!(ledger.deferred_count(), 1);
        assert_eq!(ledger.height(), 0);

        ledger.save_block(first).unwrap();
        ledger.flush().unwrap();
        assert_eq!(ledger.height(), 2);
        assert_eq!(ledger.chain_state().tip_hash, second.hash());
        assert_eq!(ledger.deferred_count(), 0);
    }

    #[test]
    fn test_rollback_only_tip() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open(dir.path(), regtest(), EventBus::new()).unwrap();
        let builder = builder(&ledger);

        let genesis_hash = ledger.chain_state().tip_hash;
        assert!(matches!(
            ledger.rollback_block(&genesis_hash),
            Err(LedgerError::RollbackGenesis)
        ));

        let block = next_block(&ledger, &builder);
        ledger.save_block(block.clone()).unwrap();
        ledger.flush().unwrap();

        assert!(matches!(
            ledger.rollback_block(&genesis_hash),
            Err(LedgerError::NotTip(_))
        ));

        ledger.rollback_block(&block.hash()).unwrap();
        ledger.flush().unwrap();
        assert_eq!(ledger.height(), 0);
        assert_eq!(ledger.chain_state().tip_hash, genesis_hash);
        assert_eq!(
            ledger.get_block(&block.hash()).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_reopen_restores_tip() {
        let dir = tempdir().unwrap();
        let params = regtest();
        let hash = {
            let ledger = Ledger::open(dir.path(), params.clone(), EventBus::new()).unwrap();
            let builder = builder(&ledger);
            let block = next_block(&ledger, &builder);
            ledger.save_block(block.clone()).unwrap();
            ledger.shutdown();
            block.hash()
        };

        let ledger = Ledger::open(dir.path(), params, EventBus::new()).unwrap();
        assert_eq!(ledger.height(), 1);
        assert_eq!(ledger.chain_state().tip_hash, hash);
    }

    #[test]
    fn test_shutdown_drains_queued_blocks() {
        let dir = tempdir().unwrap();
        let params = regtest();
        let ledger = Ledger::open(dir.path(), params.clone(), EventBus::new()).unwrap();
        let builder = builder(&ledger);

        let first = next_block(&ledger, &builder);
        let mut second = builder
            .build(&ledger, &first.header, &[], now_secs())
            .unwrap()
            .block;
        assert!(solve_header(&mut second.header, 1_000_000).unwrap());

        assert_eq!(ledger.save_block(first.clone()).unwrap(), SaveOutcome::Queued(first.hash()));
        // Queued directly or deferred until the writer persists `first`
        let outcome = ledger.save_block(second.clone()).unwrap();
        assert!(matches!(outcome, SaveOutcome::Queued(_) | SaveOutcome::Deferred));

        ledger.shutdown();
        drop(ledger);

        let ledger = Ledger::open(dir.path(), params, EventBus::new()).unwrap();
        assert_eq!(ledger.height(), 2);
        assert_eq!(ledger.chain_state().tip_hash, second.hash());
        assert_eq!(*ledger.get_block_by_height(1).unwrap(), first);
        assert_eq!(*ledger.get_block(&second.hash()).unwrap(), second);
        assert_eq!(ledger.deferred_count(), 0);
    }

    #[test]
    fn test_other_network_rejected() {
        let dir = tempdir().unwrap();
        drop(Ledger::open(dir.path(), regtest(), EventBus::new()).unwrap());

        let testnet = Arc::new(ConsensusParams::for_network(Network::Testnet));
        assert!(matches!(
            Ledger::open(dir.path(), testnet, EventBus::new()),
            Err(LedgerError::GenesisMismatch)
        ));
    }
}
