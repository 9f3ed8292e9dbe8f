// Copyright (c) 2024 Mergechain Foundation

//! Block production.
//!
//! Without merged mining the miner thread searches header nonces itself and
//! submits solved blocks to the ledger. With merged mining it only keeps a
//! candidate ready; a parent-chain miner fetches work with
//! [`Miner::create_aux_block`] and returns the proof through
//! [`Miner::submit_aux_block`].

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::address::ProgramHash;
use crate::block::{now_secs, Block};
use crate::consensus::{BlockBuildError, BlockBuilder};
use crate::error::ErrorKind;
use crate::events::NodeEvent;
use crate::hash::{short_hex, Hash256};
use crate::ledger::{Ledger, LedgerError, SaveOutcome};
use crate::mempool::TxPool;
use crate::pow::{solve_header, AuxPow, DifficultyError};

/// Shortest allowed pause between mining cycles
pub const MIN_MINING_PERIOD_MS: u64 = 100;

/// Nonces tried per cycle before the candidate is rebuilt
pub const MAX_NONCE_ATTEMPTS: u32 = 1 << 20;

/// Merged-mining candidates held at once
pub const MAX_AUX_CANDIDATES: usize = 64;

/// Mining statistics
#[derive(Debug, Clone)]
pub struct MiningStats {
    pub cycles: u64,
    pub blocks_found: u64,
    pub total_hashes: u64,
    pub start_time: Instant,
}

impl MiningStats {
    pub fn hashrate(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_hashes as f64 / elapsed
        } else {
            0.0
        }
    }
}

/// Work handed to a parent-chain miner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxBlock {
    /// Hash the parent coinbase must commit to
    pub hash: Hash256,
    pub prev_block_hash: Hash256,
    pub height: u32,
    pub bits: u32,
    pub chain_id: u32,
}

/// What one mining cycle produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A solved block was queued for persistence
    Submitted(Hash256),
    /// The nonce budget ran out without a solution
    Exhausted,
    /// A solved block lost the race to another block at its height
    Stale,
    /// A merged-mining candidate was refreshed
    Candidate(Hash256),
}

#[derive(Debug, Error)]
pub enum MinerError {
    #[error("Block assembly failed: {0}")]
    Build(#[from] BlockBuildError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Difficulty error: {0}")]
    Difficulty(#[from] DifficultyError),

    #[error("Merged mining is disabled on this network")]
    MergedMiningDisabled,

    #[error("Unknown aux block {}", short_hex(.0))]
    UnknownCandidate(Hash256),

    #[error("Failed to spawn miner thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl MinerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MinerError::Ledger(e) => e.kind(),
            MinerError::UnknownCandidate(_) => ErrorKind::NotFound,
            MinerError::MergedMiningDisabled => ErrorKind::InvalidContext,
            MinerError::Build(BlockBuildError::Storage(_)) | MinerError::Spawn(_) => {
                ErrorKind::StorageFailure
            }
            MinerError::Build(_) | MinerError::Difficulty(_) => ErrorKind::InvalidContext,
        }
    }
}

struct MinerShared {
    ledger: Arc<Ledger>,
    pool: Arc<TxPool>,
    builder: BlockBuilder,
    period: Duration,
    shutdown: AtomicBool,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
    /// Merged-mining candidates by block hash
    candidates: Mutex<HashMap<Hash256, Block>>,
    /// The candidate refreshed by the mining loop itself
    own_candidate: Mutex<Option<Hash256>>,
    cycles: AtomicU64,
    blocks_found: AtomicU64,
    total_hashes: AtomicU64,
    start_time: Instant,
}

/// The miner manages the block production thread
pub struct Miner {
    shared: Arc<MinerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Miner {
    /// Create a miner paying rewards to `payout`. A `period_ms` below
    /// [`MIN_MINING_PERIOD_MS`] is raised to it. The thread is not started.
    pub fn new(ledger: Arc<Ledger>, pool: Arc<TxPool>, payout: ProgramHash, period_ms: u64) -> Self {
        let period_ms = if period_ms < MIN_MINING_PERIOD_MS {
            warn!(
                period_ms,
                floor = MIN_MINING_PERIOD_MS,
                "Mining period below the floor, using the floor"
            );
            MIN_MINING_PERIOD_MS
        } else {
            period_ms
        };

        let (wake_tx, wake_rx) = bounded(1);
        let shared = Arc::new(MinerShared {
            builder: BlockBuilder::new(ledger.validator().clone(), payout),
            ledger,
            pool,
            period: Duration::from_millis(period_ms),
            shutdown: AtomicBool::new(false),
            wake_tx,
            wake_rx,
            candidates: Mutex::new(HashMap::new()),
            own_candidate: Mutex::new(None),
            cycles: AtomicU64::new(0),
            blocks_found: AtomicU64::new(0),
            total_hashes: AtomicU64::new(0),
            start_time: Instant::now(),
        });

        let weak: Weak<MinerShared> = Arc::downgrade(&shared);
        shared.ledger.events().on_event(move |event| {
            if let NodeEvent::BlockPersisted(block) = event {
                if let Some(shared) = weak.upgrade() {
                    shared.on_block_persisted(block);
                }
            }
        });

        Self {
            shared,
            handle: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.shared.period
    }

    pub fn payout(&self) -> ProgramHash {
        self.shared.builder.payout()
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    pub fn start(&self) -> Result<(), MinerError> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Ok(());
        }
        self.shared.shutdown.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        *handle = Some(
            thread::Builder::new()
                .name("miner".to_string())
                .spawn(move || mine_loop(shared))?,
        );
        info!(
            period_ms = self.shared.period.as_millis() as u64,
            merged = self.shared.ledger.params().merged_mining,
            "Miner started"
        );
        Ok(())
    }

    /// Signal the loop to stop and wait for it.
    pub fn stop(&self) {
        let handle = match self.handle.lock().take() {
            Some(handle) => handle,
            None => return,
        };
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shared.wake_tx.try_send(());
        if handle.join().is_err() {
            warn!("Miner thread panicked");
        }
        info!("Miner stopped");
    }

    /// Run a single mining cycle on the calling thread.
    pub fn mine_once(&self) -> Result<CycleOutcome, MinerError> {
        self.shared.mine_once()
    }

    /// Build a merged-mining candidate paying `payout` on top of the tip.
    pub fn create_aux_block(&self, payout: ProgramHash) -> Result<AuxBlock, MinerError> {
        self.shared.create_aux_block(payout)
    }

    /// Attach a parent-chain proof to a held candidate and submit it.
    pub fn submit_aux_block(&self, hash: &Hash256, aux_pow: AuxPow) -> Result<SaveOutcome, MinerError> {
        self.shared.submit_aux_block(hash, aux_pow)
    }

    pub fn candidate_count(&self) -> usize {
        self.shared.candidates.lock().len()
    }

    pub fn stats(&self) -> MiningStats {
        MiningStats {
            cycles: self.shared.cycles.load(Ordering::Relaxed),
            blocks_found: self.shared.blocks_found.load(Ordering::Relaxed),
            total_hashes: self.shared.total_hashes.load(Ordering::Relaxed),
            start_time: self.shared.start_time,
        }
    }
}

impl Drop for Miner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl MinerShared {
    fn mine_once(&self) -> Result<CycleOutcome, MinerError> {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        if self.ledger.params().merged_mining {
            let work = self.create_aux_block(self.builder.payout())?;
            if let Some(previous) = self.own_candidate.lock().replace(work.hash) {
                self.candidates.lock().remove(&previous);
            }
            return Ok(CycleOutcome::Candidate(work.hash));
        }

        let mut block = self.assemble(self.builder.payout())?;
        let found = solve_header(&mut block.header, MAX_NONCE_ATTEMPTS)?;
        let attempts = if found {
            u64::from(block.header.nonce) + 1
        } else {
            u64::from(MAX_NONCE_ATTEMPTS)
        };
        self.total_hashes.fetch_add(attempts, Ordering::Relaxed);
        if !found {
            debug!(height = block.height(), "Nonce budget exhausted");
            return Ok(CycleOutcome::Exhausted);
        }

        let height = block.height();
        match self.ledger.save_block(block)? {
            SaveOutcome::Queued(hash) => {
                self.blocks_found.fetch_add(1, Ordering::Relaxed);
                info!(height, hash = %short_hex(&hash), "Mined block");
                Ok(CycleOutcome::Submitted(hash))
            }
            _ => Ok(CycleOutcome::Stale),
        }
    }

    /// Candidate block on the current tip with the best pool transactions.
    fn assemble(&self, payout: ProgramHash) -> Result<Block, MinerError> {
        let tip = self.ledger.tip_header()?;
        let room = self.ledger.params().max_txs_per_block.saturating_sub(1);
        let pending = self.pool.get_pool(Some(room));
        let built = self
            .builder
            .build_for(self.ledger.as_ref(), &tip, &pending, now_secs(), payout)?;
        for hash in &built.skipped {
            self.pool.remove(hash);
        }
        Ok(built.block)
    }

    fn create_aux_block(&self, payout: ProgramHash) -> Result<AuxBlock, MinerError> {
        let params = self.ledger.params();
        if !params.merged_mining {
            return Err(MinerError::MergedMiningDisabled);
        }

        let block = self.assemble(payout)?;
        let work = AuxBlock {
            hash: block.hash(),
            prev_block_hash: block.header.prev_block_hash,
            height: block.height(),
            bits: block.header.bits,
            chain_id: params.aux_chain_id,
        };

        let mut candidates = self.candidates.lock();
        if candidates.len() >= MAX_AUX_CANDIDATES {
            if let Some(oldest) = candidates
                .iter()
                .min_by_key(|(_, block)| block.header.timestamp)
                .map(|(hash, _)| *hash)
            {
                candidates.remove(&oldest);
            }
        }
        candidates.insert(work.hash, block);
        debug!(height = work.height, hash = %short_hex(&work.hash), "Created aux block");
        Ok(work)
    }

    fn submit_aux_block(&self, hash: &Hash256, aux_pow: AuxPow) -> Result<SaveOutcome, MinerError> {
        // Released before save_block, which may wait on the writer queue
        let mut block = self
            .candidates
            .lock()
            .remove(hash)
            .ok_or(MinerError::UnknownCandidate(*hash))?;
        block.header.aux_pow = Some(aux_pow);

        let height = block.height();
        let outcome = self.ledger.save_block(block)?;
        if let SaveOutcome::Queued(_) = outcome {
            self.blocks_found.fetch_add(1, Ordering::Relaxed);
            info!(height, hash = %short_hex(hash), "Accepted merge-mined block");
        }
        Ok(outcome)
    }

    fn on_block_persisted(&self, block: &Block) {
        let tip = block.hash();
        let mut candidates = self.candidates.lock();
        let before = candidates.len();
        candidates.retain(|_, candidate| candidate.header.prev_block_hash == tip);
        if candidates.len() < before {
            debug!(discarded = before - candidates.len(), "Discarded stale aux blocks");
        }
        drop(candidates);
        let _ = self.wake_tx.try_send(());
    }
}

fn mine_loop(shared: Arc<MinerShared>) {
    while !shared.shutdown.load(Ordering::SeqCst) {
        if let Err(e) = shared.mine_once() {
            warn!(error = %e, "Mining cycle failed");
        }
        match shared.wake_rx.recv_timeout(shared.period) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
