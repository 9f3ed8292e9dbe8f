// Copyright (c) 2024 Mergechain Foundation

//! Compact target encoding and difficulty retargeting.
//!
//! Targets are 256-bit integers carried in headers as 32-bit "bits":
//! one byte of exponent (size in bytes) and a 23-bit mantissa, with bit
//! 0x00800000 reserved as a sign flag. Decoding is exact. Encoding keeps only
//! the three most significant bytes, so `target_to_compact` loses low-order
//! precision. Block history depends on that rounding and it must stay as is.

use num_bigint::BigUint;
use thiserror::Error;
use tracing::debug;

use crate::block::BlockHeader;
use crate::consensus::params::ConsensusParams;
use crate::hash::Hash256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DifficultyError {
    #[error("compact target 0x{0:08x} is negative")]
    Negative(u32),

    #[error("compact target 0x{0:08x} overflows 256 bits")]
    Overflow(u32),

    #[error("compact target 0x{0:08x} is zero")]
    Zero(u32),

    #[error("no ancestor header at height {0}")]
    MissingAncestor(u32),
}

/// Expand compact bits into the full target.
pub fn compact_to_target(bits: u32) -> Result<BigUint, DifficultyError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;

    if word != 0 && bits & 0x0080_0000 != 0 {
        return Err(DifficultyError::Negative(bits));
    }
    if word != 0 && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)) {
        return Err(DifficultyError::Overflow(bits));
    }

    let target = if size <= 3 {
        word >>= 8 * (3 - size);
        BigUint::from(word)
    } else {
        BigUint::from(word) << (8 * (size - 3))
    };
    if target == BigUint::default() {
        return Err(DifficultyError::Zero(bits));
    }
    Ok(target)
}

/// Compress a target into compact bits, truncating to a 3-byte mantissa.
pub fn target_to_compact(target: &BigUint) -> u32 {
    let mut size = ((target.bits() + 7) / 8) as u32;
    let mut compact = if size <= 3 {
        low_u32(target) << (8 * (3 - size))
    } else {
        low_u32(&(target >> (8 * (size - 3))))
    };

    // The mantissa's high bit is the sign flag; shift into the next byte
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

fn low_u32(value: &BigUint) -> u32 {
    value.iter_u32_digits().next().unwrap_or(0)
}

/// Interpret a hash as a little-endian 256-bit integer.
pub fn hash_to_big(hash: &Hash256) -> BigUint {
    BigUint::from_bytes_le(hash)
}

/// Whether `hash` is numerically at or below `target`.
pub fn hash_meets_target(hash: &Hash256, target: &BigUint) -> bool {
    hash_to_big(hash) <= *target
}

/// Required bits for the block after `parent`.
///
/// `timestamp_at` resolves the timestamp of an ancestor of `parent` by
/// height; it is only called on a retarget boundary.
pub fn next_required_bits<F>(
    params: &ConsensusParams,
    parent: &BlockHeader,
    timestamp_at: F,
) -> Result<u32, DifficultyError>
where
    F: FnOnce(u32) -> Option<u32>,
{
    let interval = params.retarget_interval();
    let next_height = parent.height + 1;
    if next_height % interval != 0 {
        return Ok(parent.bits);
    }

    let first_height = parent.height.saturating_sub(interval - 1);
    let first_timestamp =
        timestamp_at(first_height).ok_or(DifficultyError::MissingAncestor(first_height))?;
    let actual_timespan = parent.timestamp.saturating_sub(first_timestamp);

    let bits = retarget(params, parent.bits, actual_timespan)?;
    debug!(
        height = next_height,
        actual_timespan,
        old_bits = format!("0x{:08x}", parent.bits),
        new_bits = format!("0x{:08x}", bits),
        "Difficulty retarget"
    );
    Ok(bits)
}

/// `old * clamp(actual, timespan/factor, timespan*factor) / timespan`,
/// capped at the pow limit.
pub fn retarget(
    params: &ConsensusParams,
    old_bits: u32,
    actual_timespan: u32,
) -> Result<u32, DifficultyError> {
    let timespan = u64::from(params.target_timespan);
    let factor = u64::from(params.adjustment_factor.max(1));
    let adjusted = u64::from(actual_timespan).clamp(timespan / factor, timespan * factor);

    let old_target = compact_to_target(old_bits)?;
    let mut new_target = old_target * BigUint::from(adjusted) / BigUint::from(timespan.max(1));

    let limit = params.pow_limit()?;
    if new_target > limit {
        new_target = limit;
    }
    Ok(target_to_compact(&new_target))
}
