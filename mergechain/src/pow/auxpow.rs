// Copyright (c) 2024 Mergechain Foundation

//! Auxiliary proof-of-work for merged mining.
//!
//! A parent chain miner commits to this chain's block hash inside its own
//! coinbase script. The proof carries the parent coinbase, its merkle branch
//! into the parent header, the branch of this chain's block hash within the
//! merged-mining tree, and the parent header itself. When the parent header's
//! hash meets this chain's target, the proof stands in for a native
//! proof-of-work.
//!
//! Coinbase script layout after the marker:
//!
//! ```text
//! fa be 6d 6d | aux merkle root (32, byte-reversed) | tree size u32 LE | nonce u32 LE
//! ```

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::hash::{sha256d, Hash256, ZERO_HASH};
use crate::merkle::check_merkle_branch;
use crate::serialization::{
    read_i32, read_i64, read_list, read_u32, read_var_bytes, write_list, write_var_bytes,
    CodecError, Decode, Encode,
};

/// Marker preceding the merged-mining commitment in the parent coinbase.
pub const MERGED_MINING_HEADER: [u8; 4] = [0xfa, 0xbe, b'm', b'm'];

/// Deepest merged-mining tree accepted.
pub const MAX_AUX_BRANCH_LEN: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuxPowError {
    #[error("parent coinbase is not committed by the parent merkle root")]
    CoinbaseNotCommitted,

    #[error("parent coinbase has no inputs")]
    MissingCoinbaseInput,

    #[error("merged mining marker missing from parent coinbase")]
    MissingMarker,

    #[error("merged mining marker appears more than once")]
    MultipleMarkers,

    #[error("aux merkle root does not follow the merged mining marker")]
    RootNotAfterMarker,

    #[error("merkle tree size and nonce missing after aux merkle root")]
    MissingSizeAndNonce,

    #[error("merkle tree size {got} does not match branch length (expected {expected})")]
    WrongTreeSize { expected: u32, got: u32 },

    #[error("aux merkle index {got} does not match nonce-derived index {expected}")]
    WrongIndex { expected: u32, got: u32 },

    #[error("aux merkle branch too long: {0}")]
    BranchTooLong(usize),
}

/// An 80-byte Bitcoin-style parent block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentBlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl ParentBlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.to_bytes())
    }
}

impl Encode for ParentBlockHeader {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.version);
        buf.put_slice(&self.prev_block);
        buf.put_slice(&self.merkle_root);
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
    }
}

impl Decode for ParentBlockHeader {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            version: read_i32(buf)?,
            prev_block: Hash256::decode(buf)?,
            merkle_root: Hash256::decode(buf)?,
            timestamp: read_u32(buf)?,
            bits: read_u32(buf)?,
            nonce: read_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentTxIn {
    pub prev_hash: Hash256,
    pub prev_index: u32,
    pub script: Vec<u8>,
    pub sequence: u32,
}

impl Encode for ParentTxIn {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.prev_hash);
        buf.put_u32_le(self.prev_index);
        write_var_bytes(buf, &self.script);
        buf.put_u32_le(self.sequence);
    }
}

impl Decode for ParentTxIn {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            prev_hash: Hash256::decode(buf)?,
            prev_index: read_u32(buf)?,
            script: read_var_bytes(buf)?,
            sequence: read_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentTxOut {
    pub value: i64,
    pub script: Vec<u8>,
}

impl Encode for ParentTxOut {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64_le(self.value);
        write_var_bytes(buf, &self.script);
    }
}

impl Decode for ParentTxOut {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            value: read_i64(buf)?,
            script: read_var_bytes(buf)?,
        })
    }
}

/// The parent chain's coinbase transaction (legacy Bitcoin layout).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentTransaction {
    pub version: i32,
    pub inputs: Vec<ParentTxIn>,
    pub outputs: Vec<ParentTxOut>,
    pub lock_time: u32,
}

impl ParentTransaction {
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.to_bytes())
    }

    /// A coinbase whose only input script is `script`.
    pub fn coinbase(script: Vec<u8>) -> Self {
        Self {
            version: 1,
            inputs: vec![ParentTxIn {
                prev_hash: ZERO_HASH,
                prev_index: u32::MAX,
                script,
                sequence: u32::MAX,
            }],
            outputs: vec![ParentTxOut {
                value: 0,
                script: Vec::new(),
            }],
            lock_time: 0,
        }
    }
}

impl Encode for ParentTransaction {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.version);
        write_list(buf, &self.inputs);
        write_list(buf, &self.outputs);
        buf.put_u32_le(self.lock_time);
    }
}

impl Decode for ParentTransaction {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            version: read_i32(buf)?,
            inputs: read_list(buf)?,
            outputs: read_list(buf)?,
            lock_time: read_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxPow {
    pub parent_coinbase: ParentTransaction,
    /// Branch from the parent coinbase to the parent merkle root
    pub parent_coinbase_branch: Vec<Hash256>,
    pub parent_coinbase_index: u32,
    /// Branch from this chain's block hash to the merged-mining root
    pub aux_merkle_branch: Vec<Hash256>,
    pub aux_merkle_index: u32,
    pub parent_header: ParentBlockHeader,
}

impl AuxPow {
    /// Build a proof for a parent block that merge-mines only this chain.
    /// The parent header still needs a nonce that meets the target.
    pub fn for_single_chain(aux_block_hash: &Hash256, parent_bits: u32) -> Self {
        let parent_coinbase = ParentTransaction::coinbase(merged_mining_script(aux_block_hash, 1, 0));
        let parent_header = ParentBlockHeader {
            version: 1,
            prev_block: ZERO_HASH,
            merkle_root: parent_coinbase.hash(),
            timestamp: 0,
            bits: parent_bits,
            nonce: 0,
        };
        Self {
            parent_coinbase,
            parent_coinbase_branch: Vec::new(),
            parent_coinbase_index: 0,
            aux_merkle_branch: Vec::new(),
            aux_merkle_index: 0,
            parent_header,
        }
    }

    /// Hash of the parent header, checked against this chain's target.
    pub fn parent_hash(&self) -> Hash256 {
        self.parent_header.hash()
    }

    /// Verify that this proof commits to `aux_block_hash` for `chain_id`.
    pub fn check(&self, aux_block_hash: &Hash256, chain_id: u32) -> Result<(), AuxPowError> {
        let branch_len = self.aux_merkle_branch.len();
        if branch_len > MAX_AUX_BRANCH_LEN {
            return Err(AuxPowError::BranchTooLong(branch_len));
        }

        let coinbase_root = check_merkle_branch(
            &self.parent_coinbase.hash(),
            &self.parent_coinbase_branch,
            self.parent_coinbase_index,
        );
        if coinbase_root != self.parent_header.merkle_root {
            return Err(AuxPowError::CoinbaseNotCommitted);
        }

        let mut aux_root =
            check_merkle_branch(aux_block_hash, &self.aux_merkle_branch, self.aux_merkle_index);
        aux_root.reverse();

        let script = &self
            .parent_coinbase
            .inputs
            .first()
            .ok_or(AuxPowError::MissingCoinbaseInput)?
            .script;

        let marker_pos =
            find(script, &MERGED_MINING_HEADER).ok_or(AuxPowError::MissingMarker)?;
        let after_marker = marker_pos + MERGED_MINING_HEADER.len();
        if find(&script[after_marker..], &MERGED_MINING_HEADER).is_some() {
            return Err(AuxPowError::MultipleMarkers);
        }
        if !script[after_marker..].starts_with(&aux_root) {
            return Err(AuxPowError::RootNotAfterMarker);
        }

        let tail = &script[after_marker + aux_root.len()..];
        if tail.len() < 8 {
            return Err(AuxPowError::MissingSizeAndNonce);
        }
        let size = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let expected_size = 1u32 << branch_len;
        if size != expected_size {
            return Err(AuxPowError::WrongTreeSize {
                expected: expected_size,
                got: size,
            });
        }

        let nonce = u32::from_le_bytes([tail[4], tail[5], tail[6], tail[7]]);
        let expected_index = expected_index(nonce, chain_id, branch_len);
        if self.aux_merkle_index != expected_index {
            return Err(AuxPowError::WrongIndex {
                expected: expected_index,
                got: self.aux_merkle_index,
            });
        }

        Ok(())
    }
}

impl Encode for AuxPow {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.parent_coinbase.encode(buf);
        write_list(buf, &self.parent_coinbase_branch);
        buf.put_u32_le(self.parent_coinbase_index);
        write_list(buf, &self.aux_merkle_branch);
        buf.put_u32_le(self.aux_merkle_index);
        self.parent_header.encode(buf);
    }
}

impl Decode for AuxPow {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            parent_coinbase: ParentTransaction::decode(buf)?,
            parent_coinbase_branch: read_list(buf)?,
            parent_coinbase_index: read_u32(buf)?,
            aux_merkle_branch: read_list(buf)?,
            aux_merkle_index: read_u32(buf)?,
            parent_header: ParentBlockHeader::decode(buf)?,
        })
    }
}

/// Slot of a chain in the merged-mining tree, derived from the nonce and the
/// chain id so that different chains land on different leaves.
pub fn expected_index(nonce: u32, chain_id: u32, branch_len: usize) -> u32 {
    let mut rand = nonce;
    rand = rand.wrapping_mul(1_103_515_245).wrapping_add(12_345);
    rand = rand.wrapping_add(chain_id);
    rand = rand.wrapping_mul(1_103_515_245).wrapping_add(12_345);
    if branch_len >= 32 {
        return rand;
    }
    rand % (1u32 << branch_len)
}

/// Coinbase script committing to `aux_root` (given in natural byte order).
pub fn merged_mining_script(aux_root: &Hash256, tree_size: u32, nonce: u32) -> Vec<u8> {
    let mut reversed = *aux_root;
    reversed.reverse();

    let mut script = Vec::with_capacity(4 + 32 + 8);
    script.extend_from_slice(&MERGED_MINING_HEADER);
    script.extend_from_slice(&reversed);
    script.extend_from_slice(&tree_size.to_le_bytes());
    script.extend_from_slice(&nonce.to_le_bytes());
    script
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
