// Copyright (c) 2024 Mergechain Foundation

//! Program hashes and their base58check address form.
//!
//! A program hash identifies who can spend an output. It is 21 bytes: a
//! one-byte prefix naming the program kind followed by a 20-byte digest of the
//! program code. The textual address is `base58check(program_hash)`.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::serialization::{read_array, CodecError, Decode, Encode};

/// Length of a program hash in bytes
pub const PROGRAM_HASH_LEN: usize = 21;

/// Prefix for single-signature programs
pub const PREFIX_STANDARD: u8 = 0x21;

/// Prefix for multi-signature programs
pub const PREFIX_MULTISIG: u8 = 0x12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("invalid base58check encoding: {0}")]
    InvalidEncoding(String),

    #[error("invalid address length {0}, expected {}", PROGRAM_HASH_LEN)]
    InvalidLength(usize),

    #[error("unknown address prefix 0x{0:02x}")]
    UnknownPrefix(u8),
}

/// Owner of an output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProgramHash(pub [u8; PROGRAM_HASH_LEN]);

impl ProgramHash {
    /// Build a program hash from a prefix and a 20-byte code digest.
    pub fn new(prefix: u8, digest: [u8; 20]) -> Self {
        let mut bytes = [0u8; PROGRAM_HASH_LEN];
        bytes[0] = prefix;
        bytes[1..].copy_from_slice(&digest);
        Self(bytes)
    }

    /// A standard (single-signature) program hash.
    pub fn standard(digest: [u8; 20]) -> Self {
        Self::new(PREFIX_STANDARD, digest)
    }

    pub fn prefix(&self) -> u8 {
        self.0[0]
    }

    pub fn as_bytes(&self) -> &[u8; PROGRAM_HASH_LEN] {
        &self.0
    }

    /// Parse a base58check address.
    pub fn from_address(address: &str) -> Result<Self, AddressError> {
        let bytes = bs58::decode(address)
            .with_check(None)
            .into_vec()
            .map_err(|e| AddressError::InvalidEncoding(e.to_string()))?;

        let bytes: [u8; PROGRAM_HASH_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| AddressError::InvalidLength(bytes.len()))?;

        match bytes[0] {
            PREFIX_STANDARD | PREFIX_MULTISIG => Ok(Self(bytes)),
            other => Err(AddressError::UnknownPrefix(other)),
        }
    }

    /// Encode as a base58check address.
    pub fn to_address(&self) -> String {
        bs58::encode(&self.0).with_check().into_string()
    }
}

impl fmt::Display for ProgramHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_address())
    }
}

impl fmt::Debug for ProgramHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProgramHash({})", hex::encode(self.0))
    }
}

impl FromStr for ProgramHash {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_address(s)
    }
}

impl Encode for ProgramHash {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.0);
    }
}

impl Decode for ProgramHash {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self(read_array(buf)?))
    }
}
