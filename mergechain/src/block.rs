// Copyright (c) 2024 Mergechain Foundation

use bytes::{Buf, BufMut};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::address::{ProgramHash, PROGRAM_HASH_LEN};
use crate::asset::{Asset, Fixed64};
use crate::consensus::params::ConsensusParams;
use crate::hash::{sha256d, Hash256, ZERO_HASH};
use crate::merkle::merkle_root;
use crate::pow::AuxPow;
use crate::serialization::{read_list, read_u32, read_u8, write_list, CodecError, Decode, Encode};
use crate::transaction::Transaction;

/// Current block version
pub const BLOCK_VERSION: u32 = 0;

/// Total native supply registered at genesis
pub const NATIVE_ASSET_SUPPLY: Fixed64 = Fixed64::from_units(33_000_000);

/// Controller of the native asset. No key owns it; native coins only come
/// from coinbase rewards.
pub const NATIVE_ASSET_CONTROLLER: ProgramHash = ProgramHash([0u8; PROGRAM_HASH_LEN]);

/// Block header containing PoW fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,

    /// Hash of the previous block (32 bytes)
    pub prev_block_hash: Hash256,

    /// Merkle root of transaction hashes
    pub merkle_root: Hash256,

    /// Block timestamp (unix seconds)
    pub timestamp: u32,

    /// Compact proof-of-work target
    pub bits: u32,

    pub nonce: u32,

    pub height: u32,

    /// Merged-mining proof; not covered by the block hash
    pub aux_pow: Option<AuxPow>,
}

impl BlockHeader {
    /// Write the fields covered by the block hash.
    pub fn encode_unsigned<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.version);
        buf.put_slice(&self.prev_block_hash);
        buf.put_slice(&self.merkle_root);
        buf.put_u32_le(self.timestamp);
        buf.put_u32_le(self.bits);
        buf.put_u32_le(self.nonce);
        buf.put_u32_le(self.height);
    }

    /// Compute the hash of this block header
    pub fn hash(&self) -> Hash256 {
        let mut unsigned = Vec::with_capacity(112);
        self.encode_unsigned(&mut unsigned);
        sha256d(&unsigned)
    }
}

impl Encode for BlockHeader {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.encode_unsigned(buf);
        match &self.aux_pow {
            Some(aux_pow) => {
                buf.put_u8(1);
                aux_pow.encode(buf);
            }
            None => buf.put_u8(0),
        }
    }
}

impl Decode for BlockHeader {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let version = read_u32(buf)?;
        let prev_block_hash = Hash256::decode(buf)?;
        let merkle_root = Hash256::decode(buf)?;
        let timestamp = read_u32(buf)?;
        let bits = read_u32(buf)?;
        let nonce = read_u32(buf)?;
        let height = read_u32(buf)?;
        let aux_pow = match read_u8(buf)? {
            0 => None,
            1 => Some(AuxPow::decode(buf)?),
            other => {
                return Err(CodecError::InvalidValue(format!(
                    "invalid aux pow flag {}",
                    other
                )))
            }
        };
        Ok(Self {
            version,
            prev_block_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
            height,
            aux_pow,
        })
    }
}

/// A complete block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    /// Coinbase first, then the remaining transactions in order
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn tx_hashes(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::hash).collect()
    }

    /// Merkle root over the current transaction list.
    pub fn compute_merkle_root(&self) -> Hash256 {
        merkle_root(&self.tx_hashes())
    }

    pub fn coinbase(&self) -> Option<&Transaction> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }

    /// The network's genesis block: a coinbase carrying the network magic
    /// and the registration of the native asset.
    pub fn genesis(params: &ConsensusParams) -> Self {
        let transactions = vec![
            Transaction::new_coinbase(0, u64::from(params.magic), Vec::new()),
            native_asset_registration(),
        ];
        let mut block = Self {
            header: BlockHeader {
                version: BLOCK_VERSION,
                prev_block_hash: ZERO_HASH,
                merkle_root: ZERO_HASH,
                timestamp: params.genesis_timestamp,
                bits: params.pow_limit_bits,
                nonce: 0,
                height: 0,
                aux_pow: None,
            },
            transactions,
        };
        block.header.merkle_root = block.compute_merkle_root();
        block
    }
}

impl Encode for Block {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        self.header.encode(buf);
        write_list(buf, &self.transactions);
    }
}

impl Decode for Block {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self {
            header: BlockHeader::decode(buf)?,
            transactions: read_list(buf)?,
        })
    }
}

/// The register-asset transaction creating the native asset.
pub fn native_asset_registration() -> Transaction {
    Transaction::new_register_asset(Asset::native(), NATIVE_ASSET_SUPPLY, NATIVE_ASSET_CONTROLLER)
}

/// Asset id of the native asset, identical on every network.
pub fn native_asset_id() -> Hash256 {
    static NATIVE_ASSET_ID: OnceLock<Hash256> = OnceLock::new();
    *NATIVE_ASSET_ID.get_or_init(|| native_asset_registration().hash())
}

/// Wall-clock time in unix seconds.
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
