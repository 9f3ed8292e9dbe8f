// Copyright (c) 2024 Mergechain Foundation

//! The unspent output set.
//!
//! Two indexes are kept side by side in the ledger database:
//! - `0x91 || program_hash || asset_id` holds the owner's unspent entries for
//!   one asset;
//! - `0x90 || tx_hash` holds the still-unspent output indexes of one
//!   transaction, so spentness is answered without knowing the owner.
//!
//! Both are only written inside the ledger writer's LMDB transaction.

use lmdb::{Cursor, Database, RwTransaction, Transaction as LmdbTransaction, WriteFlags};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::keys::{unspent_index_key, utxo_key, utxo_owner_prefix};
use super::LedgerError;
use crate::address::ProgramHash;
use crate::asset::Fixed64;
use crate::hash::Hash256;
use crate::transaction::{OutPoint, TxOutput};

/// One unspent output, as listed under its owner and asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtxoEntry {
    pub tx_hash: Hash256,
    pub index: u16,
    pub value: Fixed64,
}

impl UtxoEntry {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.tx_hash, self.index)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UtxoSet {
    db: Database,
}

impl UtxoSet {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Unspent entries of one owner for one asset.
    pub fn get_unspent_from_program_hash<T: LmdbTransaction>(
        &self,
        txn: &T,
        program_hash: &ProgramHash,
        asset_id: &Hash256,
    ) -> Result<Vec<UtxoEntry>, LedgerError> {
        match txn.get(self.db, &utxo_key(program_hash, asset_id)) {
            Ok(bytes) => bincode::deserialize(bytes).map_err(LedgerError::serialization),
            Err(lmdb::Error::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Unspent entries of one owner, grouped by asset.
    pub fn get_unspents_from_program_hash<T: LmdbTransaction>(
        &self,
        txn: &T,
        program_hash: &ProgramHash,
    ) -> Result<HashMap<Hash256, Vec<UtxoEntry>>, LedgerError> {
        let prefix = utxo_owner_prefix(program_hash);
        let mut unspents = HashMap::new();

        let mut cursor = txn.open_ro_cursor(self.db)?;
        for item in cursor.iter_from(&prefix) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            let asset_id: Hash256 = key[prefix.len()..].try_into().map_err(|_| {
                LedgerError::Serialization(format!("malformed utxo key of {} bytes", key.len()))
            })?;
            let entries: Vec<UtxoEntry> =
                bincode::deserialize(value).map_err(LedgerError::serialization)?;
            unspents.insert(asset_id, entries);
        }
        Ok(unspents)
    }

    /// Overwrite the entries of one owner and asset. An empty list removes
    /// the record.
    pub fn persist_unspent_with_program_hash(
        &self,
        txn: &mut RwTransaction,
        program_hash: &ProgramHash,
        asset_id: &Hash256,
        entries: &[UtxoEntry],
    ) -> Result<(), LedgerError> {
        let key = utxo_key(program_hash, asset_id);
        if entries.is_empty() {
            return delete(txn, self.db, &key);
        }
        let bytes = bincode::serialize(entries).map_err(LedgerError::serialization)?;
        txn.put(self.db, &key, &bytes, WriteFlags::empty())?;
        Ok(())
    }

    /// Output indexes of `tx_hash` that are still unspent.
    pub fn unspent_indexes<T: LmdbTransaction>(
        &self,
        txn: &T,
        tx_hash: &Hash256,
    ) -> Result<Vec<u16>, LedgerError> {
        match txn.get(self.db, &unspent_index_key(tx_hash)) {
            Ok(bytes) => bincode::deserialize(bytes).map_err(LedgerError::serialization),
            Err(lmdb::Error::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_unspent<T: LmdbTransaction>(
        &self,
        txn: &T,
        outpoint: &OutPoint,
    ) -> Result<bool, LedgerError> {
        Ok(self
            .unspent_indexes(txn, &outpoint.tx_hash)?
            .contains(&outpoint.index))
    }

    fn put_unspent_indexes(
        &self,
        txn: &mut RwTransaction,
        tx_hash: &Hash256,
        indexes: &[u16],
    ) -> Result<(), LedgerError> {
        let key = unspent_index_key(tx_hash);
        if indexes.is_empty() {
            return delete(txn, self.db, &key);
        }
        let bytes = bincode::serialize(indexes).map_err(LedgerError::serialization)?;
        txn.put(self.db, &key, &bytes, WriteFlags::empty())?;
        Ok(())
    }

    /// Record `output` as unspent in both indexes.
    pub fn add_output(
        &self,
        txn: &mut RwTransaction,
        outpoint: &OutPoint,
        output: &TxOutput,
    ) -> Result<(), LedgerError> {
        let mut entries =
            self.get_unspent_from_program_hash(&*txn, &output.program_hash, &output.asset_id)?;
        entries.push(UtxoEntry {
            tx_hash: outpoint.tx_hash,
            index: outpoint.index,
            value: output.value,
        });
        self.persist_unspent_with_program_hash(
            txn,
            &output.program_hash,
            &output.asset_id,
            &entries,
        )?;

        let mut indexes = self.unspent_indexes(&*txn, &outpoint.tx_hash)?;
        if !indexes.contains(&outpoint.index) {
            indexes.push(outpoint.index);
            indexes.sort_unstable();
        }
        self.put_unspent_indexes(txn, &outpoint.tx_hash, &indexes)
    }

    /// Remove `output` from both indexes. Fails if it was not unspent.
    pub fn remove_output(
        &self,
        txn: &mut RwTransaction,
        outpoint: &OutPoint,
        output: &TxOutput,
    ) -> Result<(), LedgerError> {
        let mut entries =
            self.get_unspent_from_program_hash(&*txn, &output.program_hash, &output.asset_id)?;
        let before = entries.len();
        entries.retain(|entry| entry.outpoint() != *outpoint);
        if entries.len() == before {
            return Err(LedgerError::NotFound(format!("unspent output {}", outpoint)));
        }
        self.persist_unspent_with_program_hash(
            txn,
            &output.program_hash,
            &output.asset_id,
            &entries,
        )?;

        let mut indexes = self.unspent_indexes(&*txn, &outpoint.tx_hash)?;
        indexes.retain(|index| *index != outpoint.index);
        self.put_unspent_indexes(txn, &outpoint.tx_hash, &indexes)
    }
}

fn delete(txn: &mut RwTransaction, db: Database, key: &[u8]) -> Result<(), LedgerError> {
    match txn.del(db, &key, None) {
        Ok(()) | Err(lmdb::Error::NotFound) => Ok(()),
        Err(e) => Err(e.into()),
    }
}
