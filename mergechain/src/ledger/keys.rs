//! Key layout of the ledger database.
//!
//! Every record lives in a single LMDB database. The first key byte names the
//! namespace; the remainder identifies the record.

use crate::address::ProgramHash;
use crate::hash::Hash256;

/// Namespace prefixes. Values are part of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataEntryPrefix {
    /// Header plus the block's transaction hashes
    Header = 0x00,
    BlockHashByHeight = 0x01,
    /// Transaction with the height of its block
    Transaction = 0x02,
    CurrentBlock = 0x40,
    Version = 0x41,
    Asset = 0xc0,
    AssetIssued = 0xc1,
    /// Unspent output indexes of one transaction
    UnspentIndex = 0x90,
    /// Unspent outputs of one (program hash, asset) pair
    Utxo = 0x91,
}

fn prefixed(prefix: DataEntryPrefix, body: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + body.len());
    key.push(prefix as u8);
    key.extend_from_slice(body);
    key
}

pub fn header_key(hash: &Hash256) -> Vec<u8> {
    prefixed(DataEntryPrefix::Header, hash)
}

pub fn block_hash_key(height: u32) -> Vec<u8> {
    prefixed(DataEntryPrefix::BlockHashByHeight, &height.to_le_bytes())
}

pub fn transaction_key(hash: &Hash256) -> Vec<u8> {
    prefixed(DataEntryPrefix::Transaction, hash)
}

pub fn current_block_key() -> Vec<u8> {
    vec![DataEntryPrefix::CurrentBlock as u8]
}

pub fn version_key() -> Vec<u8> {
    vec![DataEntryPrefix::Version as u8]
}

pub fn asset_key(id: &Hash256) -> Vec<u8> {
    prefixed(DataEntryPrefix::Asset, id)
}

pub fn asset_issued_key(id: &Hash256) -> Vec<u8> {
    prefixed(DataEntryPrefix::AssetIssued, id)
}

pub fn unspent_index_key(tx_hash: &Hash256) -> Vec<u8> {
    prefixed(DataEntryPrefix::UnspentIndex, tx_hash)
}

/// All UTXO keys of one owner share this prefix.
pub fn utxo_owner_prefix(program_hash: &ProgramHash) -> Vec<u8> {
    prefixed(DataEntryPrefix::Utxo, program_hash.as_bytes())
}

pub fn utxo_key(program_hash: &ProgramHash, asset_id: &Hash256) -> Vec<u8> {
    let mut key = utxo_owner_prefix(program_hash);
    key.extend_from_slice(asset_id);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixes() {
        assert_eq!(header_key(&[1; 32])[0], 0x00);
        assert_eq!(block_hash_key(7), vec![0x01, 7, 0, 0, 0]);
        assert_eq!(transaction_key(&[1; 32])[0], 0x02);
        assert_eq!(current_block_key(), vec![0x40]);
        assert_eq!(version_key(), vec![0x41]);
        assert_eq!(asset_key(&[1; 32])[0], 0xc0);
        assert_eq!(asset_issued_key(&[1; 32])[0], 0xc1);
        assert_eq!(unspent_index_key(&[1; 32])[0], 0x90);
    }

    #[test]
    fn test_utxo_key_layout() {
        let owner = ProgramHash::standard([9; 20]);
        let key = utxo_key(&owner, &[3; 32]);
        assert_eq!(key.len(), 1 + 21 + 32);
        assert!(key.starts_with(&utxo_owner_prefix(&owner)));
        assert_eq!(&key[22..], &[3u8; 32]);
    }
}
