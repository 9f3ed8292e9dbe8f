// Copyright (c) 2024 Mergechain Foundation

use bytes::{Buf, BufMut};
use lmdb::{
    Database, DatabaseFlags, Environment, EnvironmentFlags, RwTransaction,
    Transaction as LmdbTransaction, WriteFlags,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::keys::{
    asset_issued_key, asset_key, block_hash_key, current_block_key, header_key, transaction_key,
    version_key,
};
use super::utxo::{UtxoEntry, UtxoSet};
use super::LedgerError;
use crate::address::ProgramHash;
use crate::asset::{Asset, Fixed64};
use crate::block::{Block, BlockHeader};
use crate::consensus::AssetState;
use crate::hash::{short_hex, Hash256};
use crate::serialization::{read_list, write_list, CodecError, Decode, Encode};
use crate::transaction::{OutPoint, Payload, Transaction, TxOutput};

/// On-disk format version, written on first open.
pub const STORE_VERSION: u32 = 2;

const MAP_SIZE: usize = 1024 * 1024 * 1024; // 1GB

/// Value of the current block pointer
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct CurrentBlock {
    hash: Hash256,
    height: u32,
}

/// Header record: the header plus the hashes of the block's transactions.
struct TrimmedBlock {
    header: BlockHeader,
    tx_hashes: Vec<Hash256>,
}

impl Encode for TrimmedBlock {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.header.encode(buf);
        write_list(buf, &self.tx_hashes);
    }
}

impl Decode for TrimmedBlock {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            header: BlockHeader::decode(buf)?,
            tx_hashes: read_list(buf)?,
        })
    }
}

/// Asset record: metadata, the maximum issuable amount and the controller.
struct AssetRecord {
    asset: Asset,
    amount: Fixed64,
    controller: ProgramHash,
}

impl Encode for AssetRecord {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.asset.encode(buf);
        self.amount.encode(buf);
        self.controller.encode(buf);
    }
}

impl Decode for AssetRecord {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            asset: Asset::decode(buf)?,
            amount: Fixed64::decode(buf)?,
            controller: ProgramHash::decode(buf)?,
        })
    }
}

/// LMDB-backed chain storage.
///
/// All records share one database, namespaced by the key prefixes in
/// [`super::keys`]. Writes happen only through [`LedgerDb::persist_block`]
/// and [`LedgerDb::rollback_block`], each a single LMDB write transaction.
pub struct LedgerDb {
    env: Environment,
    db: Database,
    utxos: UtxoSet,
}

impl LedgerDb {
    /// Open or create the database under `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        fs::create_dir_all(path)?;

        let env = Environment::new()
            .set_flags(EnvironmentFlags::NO_SUB_DIR)
            .set_max_dbs(1)
            .set_map_size(MAP_SIZE)
            .open(&path.join("ledger.mdb"))?;
        let db = env.create_db(Some("chain"), DatabaseFlags::empty())?;

        let store = Self {
            env,
            db,
            utxos: UtxoSet::new(db),
        };
        store.check_version()?;
        Ok(store)
    }

    fn check_version(&self) -> Result<(), LedgerError> {
        let mut txn = self.env.begin_rw_txn()?;
        let version = match txn.get(self.db, &version_key()) {
            Ok(bytes) => Some(bincode::deserialize::<u32>(bytes).map_err(LedgerError::serialization)?),
            Err(lmdb::Error::NotFound) => None,
            Err(e) => return Err(e.into()),
        };
        match version {
            Some(STORE_VERSION) => Ok(()),
            Some(other) => Err(LedgerError::VersionMismatch(other)),
            None => {
                let bytes = bincode::serialize(&STORE_VERSION).map_err(LedgerError::serialization)?;
                txn.put(self.db, &version_key(), &bytes, WriteFlags::empty())?;
                txn.commit()?;
                info!(version = STORE_VERSION, "Initialized ledger database");
                Ok(())
            }
        }
    }

    pub fn utxos(&self) -> &UtxoSet {
        &self.utxos
    }

    /// Hash and height of the current tip, if any block is stored.
    pub fn current_block(&self) -> Result<Option<(Hash256, u32)>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        match txn.get(self.db, &current_block_key()) {
            Ok(bytes) => {
                let current: CurrentBlock =
                    bincode::deserialize(bytes).map_err(LedgerError::serialization)?;
                Ok(Some((current.hash, current.height)))
            }
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn trimmed_block<T: LmdbTransaction>(
        &self,
        txn: &T,
        hash: &Hash256,
    ) -> Result<Option<TrimmedBlock>, LedgerError> {
        match txn.get(self.db, &header_key(hash)) {
            Ok(bytes) => Ok(Some(TrimmedBlock::from_bytes(bytes)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_transaction<T: LmdbTransaction>(
        &self,
        txn: &T,
        hash: &Hash256,
    ) -> Result<Option<(Transaction, u32)>, LedgerError> {
        let bytes = match txn.get(self.db, &transaction_key(hash)) {
            Ok(bytes) => bytes,
            Err(lmdb::Error::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() < 4 {
            return Err(CodecError::UnexpectedEof {
                needed: 4,
                remaining: bytes.len(),
            }
            .into());
        }
        let (height, body) = bytes.split_at(4);
        let height = u32::from_le_bytes([height[0], height[1], height[2], height[3]]);
        Ok(Some((Transaction::from_bytes(body)?, height)))
    }

    /// The output referenced by `outpoint`, whether spent or not.
    fn referenced_output<T: LmdbTransaction>(
        &self,
        txn: &T,
        outpoint: &OutPoint,
    ) -> Result<TxOutput, LedgerError> {
        let (tx, _) = self
            .read_transaction(txn, &outpoint.tx_hash)?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {}", short_hex(&outpoint.tx_hash))))?;
        tx.outputs
            .get(outpoint.index as usize)
            .cloned()
            .ok_or_else(|| LedgerError::NotFound(format!("output {}", outpoint)))
    }

    fn spent_outputs<T: LmdbTransaction>(
        &self,
        txn: &T,
        tx: &Transaction,
    ) -> Result<Vec<TxOutput>, LedgerError> {
        tx.outpoints()
            .map(|outpoint| self.referenced_output(txn, outpoint))
            .collect()
    }

    fn read_issued<T: LmdbTransaction>(&self, txn: &T, id: &Hash256) -> Result<Fixed64, LedgerError> {
        match txn.get(self.db, &asset_issued_key(id)) {
            Ok(bytes) => Ok(Fixed64::from_bytes(bytes)?),
            Err(lmdb::Error::NotFound) => Ok(Fixed64::ZERO),
            Err(e) => Err(e.into()),
        }
    }

    pub fn header(&self, hash: &Hash256) -> Result<Option<BlockHeader>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        Ok(self.trimmed_block(&txn, hash)?.map(|trimmed| trimmed.header))
    }

    pub fn block(&self, hash: &Hash256) -> Result<Option<Block>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        let trimmed = match self.trimmed_block(&txn, hash)? {
            Some(trimmed) => trimmed,
            None => return Ok(None),
        };
        let mut transactions = Vec::with_capacity(trimmed.tx_hashes.len());
        for tx_hash in &trimmed.tx_hashes {
            let (tx, _) = self.read_transaction(&txn, tx_hash)?.ok_or_else(|| {
                LedgerError::NotFound(format!("transaction {} of stored block", short_hex(tx_hash)))
            })?;
            transactions.push(tx);
        }
        Ok(Some(Block {
            header: trimmed.header,
            transactions,
        }))
    }

    pub fn block_hash(&self, height: u32) -> Result<Option<Hash256>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        match txn.get(self.db, &block_hash_key(height)) {
            Ok(bytes) => Ok(Some(Hash256::from_bytes(bytes)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// A transaction and the height of the block containing it.
    pub fn transaction(&self, hash: &Hash256) -> Result<Option<(Transaction, u32)>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        self.read_transaction(&txn, hash)
    }

    pub fn contains_transaction(&self, hash: &Hash256) -> Result<bool, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        match txn.get(self.db, &transaction_key(hash)) {
            Ok(_) => Ok(true),
            Err(lmdb::Error::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn asset(&self, id: &Hash256) -> Result<Option<AssetState>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        let record = match txn.get(self.db, &asset_key(id)) {
            Ok(bytes) => AssetRecord::from_bytes(bytes)?,
            Err(lmdb::Error::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(AssetState {
            asset: record.asset,
            amount: record.amount,
            controller: record.controller,
            issued: self.read_issued(&txn, id)?,
        }))
    }

    /// The output at `outpoint` if it is currently unspent.
    pub fn unspent_output(&self, outpoint: &OutPoint) -> Result<Option<TxOutput>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        if !self.utxos.is_unspent(&txn, outpoint)? {
            return Ok(None);
        }
        self.referenced_output(&txn, outpoint).map(Some)
    }

    /// Unspent entries of `program_hash`, for one asset or all of them.
    pub fn unspents(
        &self,
        program_hash: &ProgramHash,
        asset_id: Option<&Hash256>,
    ) -> Result<HashMap<Hash256, Vec<UtxoEntry>>, LedgerError> {
        let txn = self.env.begin_ro_txn()?;
        match asset_id {
            Some(asset_id) => {
                let entries = self
                    .utxos
                    .get_unspent_from_program_hash(&txn, program_hash, asset_id)?;
                let mut unspents = HashMap::new();
                if !entries.is_empty() {
                    unspents.insert(*asset_id, entries);
                }
                Ok(unspents)
            }
            None => self.utxos.get_unspents_from_program_hash(&txn, program_hash),
        }
    }

    /// Persist `block` and all of its effects in one write transaction:
    /// header record, hash-by-height, transactions, unspent outputs, assets
    /// and finally the current block pointer.
    pub fn persist_block(&self, block: &Block) -> Result<(), LedgerError> {
        let hash = block.hash();
        let height = block.height();
        let mut txn = self.env.begin_rw_txn()?;

        let trimmed = TrimmedBlock {
            header: block.header.clone(),
            tx_hashes: block.tx_hashes(),
        };
        txn.put(self.db, &header_key(&hash), &trimmed.to_bytes(), WriteFlags::empty())?;
        txn.put(self.db, &block_hash_key(height), &hash, WriteFlags::empty())?;

        for (tx, tx_hash) in block.transactions.iter().zip(&trimmed.tx_hashes) {
            let mut record = height.to_le_bytes().to_vec();
            tx.encode(&mut record);
            txn.put(self.db, &transaction_key(tx_hash), &record, WriteFlags::empty())?;
        }

        let mut issuance = Vec::new();
        for (tx, tx_hash) in block.transactions.iter().zip(&trimmed.tx_hashes) {
            let spent = self.spent_outputs(&txn, tx)?;
            for (outpoint, output) in tx.outpoints().zip(&spent) {
                self.utxos.remove_output(&mut txn, outpoint, output)?;
            }
            for (index, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(*tx_hash, index as u16);
                self.utxos.add_output(&mut txn, &outpoint, output)?;
            }
            issuance.extend(tx.issued_amounts(&spent));
        }

        for (tx, tx_hash) in block.transactions.iter().zip(&trimmed.tx_hashes) {
            if let Payload::RegisterAsset {
                asset,
                amount,
                controller,
            } = &tx.payload
            {
                let record = AssetRecord {
                    asset: asset.clone(),
                    amount: *amount,
                    controller: *controller,
                };
                txn.put(self.db, &asset_key(tx_hash), &record.to_bytes(), WriteFlags::empty())?;
            }
        }
        for (asset_id, amount) in issuance {
            let issued = self.read_issued(&txn, &asset_id)?;
            let issued = issued
                .checked_add(amount)
                .ok_or(LedgerError::IssuanceOutOfRange(asset_id))?;
            txn.put(self.db, &asset_issued_key(&asset_id), &issued.to_bytes(), WriteFlags::empty())?;
        }

        let current = bincode::serialize(&CurrentBlock { hash, height })
            .map_err(LedgerError::serialization)?;
        txn.put(self.db, &current_block_key(), &current, WriteFlags::empty())?;

        txn.commit()?;
        debug!(height, hash = %short_hex(&hash), "Persisted block");
        Ok(())
    }

    /// Undo every effect of `block`, which must be the current tip, in the
    /// reverse order of [`LedgerDb::persist_block`].
    pub fn rollback_block(&self, block: &Block) -> Result<(), LedgerError> {
        let hash = block.hash();
        let height = block.height();
        let tx_hashes = block.tx_hashes();
        let mut txn = self.env.begin_rw_txn()?;

        let parent = CurrentBlock {
            hash: block.header.prev_block_hash,
            height: height.saturating_sub(1),
        };
        let current = bincode::serialize(&parent).map_err(LedgerError::serialization)?;
        txn.put(self.db, &current_block_key(), &current, WriteFlags::empty())?;

        for (tx, tx_hash) in block.transactions.iter().zip(&tx_hashes).rev() {
            let spent = self.spent_outputs(&txn, tx)?;
            for (asset_id, amount) in tx.issued_amounts(&spent) {
                let issued = self.read_issued(&txn, &asset_id)?;
                let issued = issued
                    .checked_sub(amount)
                    .filter(|issued| !issued.is_negative())
                    .ok_or(LedgerError::IssuanceOutOfRange(asset_id))?;
                if issued == Fixed64::ZERO {
                    delete(&mut txn, self.db, &asset_issued_key(&asset_id))?;
                } else {
                    txn.put(self.db, &asset_issued_key(&asset_id), &issued.to_bytes(), WriteFlags::empty())?;
                }
            }
            if matches!(tx.payload, Payload::RegisterAsset { .. }) {
                delete(&mut txn, self.db, &asset_key(tx_hash))?;
                delete(&mut txn, self.db, &asset_issued_key(tx_hash))?;
            }
        }

        for (tx, tx_hash) in block.transactions.iter().zip(&tx_hashes).rev() {
            for (index, output) in tx.outputs.iter().enumerate().rev() {
                let outpoint = OutPoint::new(*tx_hash, index as u16);
                self.utxos.remove_output(&mut txn, &outpoint, output)?;
            }
            let spent = self.spent_outputs(&txn, tx)?;
            for (outpoint, output) in tx.outpoints().zip(&spent) {
                self.utxos.add_output(&mut txn, outpoint, output)?;
            }
        }

        for tx_hash in &tx_hashes {
            delete(&mut txn, self.db, &transaction_key(tx_hash))?;
        }
        delete(&mut txn, self.db, &block_hash_key(height))?;
        delete(&mut txn, self.db, &header_key(&hash))?;

        txn.commit()?;
        debug!(height, hash = %short_hex(&hash), "Rolled back block");
        Ok(())
    }
}

fn delete(txn: &mut RwTransaction, db: Database, key: &[u8]) -> Result<(), LedgerError> {
    match txn.del(db, &key, None) {
        Ok(()) | Err(lmdb::Error::NotFound) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
