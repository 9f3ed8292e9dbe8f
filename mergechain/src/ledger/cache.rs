//! In-memory cache of recently persisted blocks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::asset::Fixed64;
use crate::block::{Block, BlockHeader};
use crate::consensus::AssetState;
use crate::hash::Hash256;
use crate::transaction::{Payload, Transaction};

/// Blocks more than this many heights behind the tip are evicted.
pub const CACHE_DEPTH: u32 = 10;

#[derive(Default)]
pub(crate) struct BlockCache {
    blocks: HashMap<Hash256, Arc<Block>>,
    by_height: BTreeMap<u32, Hash256>,
    transactions: HashMap<Hash256, (Arc<Transaction>, u32)>,
    /// Assets registered by cached blocks, until an issuance touches them
    assets: HashMap<Hash256, AssetState>,
}

impl BlockCache {
    pub fn insert_block(&mut self, block: Arc<Block>) {
        let hash = block.hash();
        let height = block.height();
        for tx in &block.transactions {
            let tx_hash = tx.hash();
            match &tx.payload {
                Payload::RegisterAsset {
                    asset,
                    amount,
                    controller,
                } => {
                    self.assets.insert(
                        tx_hash,
                        AssetState {
                            asset: asset.clone(),
                            amount: *amount,
                            controller: *controller,
                            issued: Fixed64::ZERO,
                        },
                    );
                }
                _ => self.invalidate_assets(tx),
            }
            self.transactions
                .insert(tx_hash, (Arc::new(tx.clone()), height));
        }
        self.by_height.insert(height, hash);
        self.blocks.insert(hash, block);
    }

    pub fn remove_block(&mut self, hash: &Hash256) {
        if let Some(block) = self.blocks.remove(hash) {
            self.by_height.remove(&block.height());
            for tx in &block.transactions {
                self.invalidate_assets(tx);
                self.transactions.remove(&tx.hash());
            }
        }
    }

    /// Drop blocks more than [`CACHE_DEPTH`] heights below `tip_height`.
    pub fn evict(&mut self, tip_height: u32) {
        let keep_from = tip_height.saturating_sub(CACHE_DEPTH);
        let stale: Vec<Hash256> = self
            .by_height
            .range(..keep_from)
            .map(|(_, hash)| *hash)
            .collect();
        for hash in stale {
            if let Some(block) = self.blocks.remove(&hash) {
                self.by_height.remove(&block.height());
                for tx in &block.transactions {
                    self.invalidate_assets(tx);
                    self.transactions.remove(&tx.hash());
                }
            }
        }
    }

    fn invalidate_assets(&mut self, tx: &Transaction) {
        match &tx.payload {
            Payload::RegisterAsset { .. } => {
                self.assets.remove(&tx.hash());
            }
            Payload::IssueAsset => {
                for output in &tx.outputs {
                    self.assets.remove(&output.asset_id);
                }
            }
            _ => {}
        }
    }

    pub fn block(&self, hash: &Hash256) -> Option<Arc<Block>> {
        self.blocks.get(hash).cloned()
    }

    pub fn header(&self, hash: &Hash256) -> Option<BlockHeader> {
        self.blocks.get(hash).map(|block| block.header.clone())
    }

    pub fn block_hash(&self, height: u32) -> Option<Hash256> {
        self.by_height.get(&height).copied()
    }

    pub fn transaction(&self, hash: &Hash256) -> Option<(Arc<Transaction>, u32)> {
        self.transactions.get(hash).cloned()
    }

    pub fn asset(&self, id: &Hash256) -> Option<AssetState> {
        self.assets.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }
}
