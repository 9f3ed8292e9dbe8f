// Copyright (c) 2024 Mergechain Foundation

//! Assets and fixed-point amounts.

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::serialization::{
    read_i64, read_u8, read_var_string, write_var_string, CodecError, Decode, Encode,
};

/// Number of decimal places carried by every amount.
pub const AMOUNT_DECIMALS: u8 = 8;

/// One whole unit in base units.
pub const COIN: i64 = 100_000_000;

/// Highest precision an asset may declare.
pub const MAX_PRECISION: u8 = AMOUNT_DECIMALS;

/// Fixed-point amount with 8 decimal places.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Fixed64(pub i64);

impl Fixed64 {
    pub const ZERO: Fixed64 = Fixed64(0);

    /// Whole units, e.g. `Fixed64::from_units(40)` is 40.00000000.
    pub const fn from_units(units: i64) -> Self {
        Self(units * COIN)
    }

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Fixed64) -> Option<Fixed64> {
        self.0.checked_add(other.0).map(Fixed64)
    }

    pub fn checked_sub(self, other: Fixed64) -> Option<Fixed64> {
        self.0.checked_sub(other.0).map(Fixed64)
    }

    /// Whether this amount can be expressed with `precision` decimal places.
    pub fn respects_precision(self, precision: u8) -> bool {
        if precision >= AMOUNT_DECIMALS {
            return true;
        }
        let unit = 10i64.pow(u32::from(AMOUNT_DECIMALS - precision));
        self.0 % unit == 0
    }
}

impl fmt::Display for Fixed64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let coin = COIN as u64;
        write!(f, "{}{}.{:08}", sign, abs / coin, abs % coin)
    }
}

impl Encode for Fixed64 {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_i64_le(self.0);
    }
}

impl Decode for Fixed64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        Ok(Self(read_i64(buf)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AssetType {
    Token = 0x00,
    Share = 0x01,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AssetRecordType {
    /// Balances are tracked as individual unspent outputs
    Unspent = 0x00,
    Balance = 0x01,
}

/// Metadata of a registered asset. The asset id is the hash of the
/// transaction that registered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Asset {
    pub name: String,
    pub description: String,
    pub precision: u8,
    pub asset_type: AssetType,
    pub record_type: AssetRecordType,
}

impl Asset {
    /// The chain's native asset, registered in the genesis block.
    pub fn native() -> Self {
        Self {
            name: "MGC".to_string(),
            description: "Mergechain native asset".to_string(),
            precision: MAX_PRECISION,
            asset_type: AssetType::Token,
            record_type: AssetRecordType::Unspent,
        }
    }
}

impl Encode for Asset {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        write_var_string(buf, &self.name);
        write_var_string(buf, &self.description);
        buf.put_u8(self.precision);
        buf.put_u8(self.asset_type as u8);
        buf.put_u8(self.record_type as u8);
    }
}

impl Decode for Asset {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError> {
        let name = read_var_string(buf)?;
        let description = read_var_string(buf)?;
        let precision = read_u8(buf)?;
        let asset_type = match read_u8(buf)? {
            0x00 => AssetType::Token,
            0x01 => AssetType::Share,
            other => {
                return Err(CodecError::InvalidValue(format!(
                    "unknown asset type 0x{:02x}",
                    other
                )))
            }
        };
        let record_type = match read_u8(buf)? {
            0x00 => AssetRecordType::Unspent,
            0x01 => AssetRecordType::Balance,
            other => {
                return Err(CodecError::InvalidValue(format!(
                    "unknown asset record type 0x{:02x}",
                    other
                )))
            }
        };
        Ok(Self {
            name,
            description,
            precision,
            asset_type,
            record_type,
        })
    }
}
