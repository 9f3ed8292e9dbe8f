//! Proof-of-work: difficulty targets, merged-mining proofs and nonce search.

pub mod auxpow;
pub mod difficulty;

pub use auxpow::{AuxPow, AuxPowError};
pub use difficulty::{
    compact_to_target, hash_meets_target, next_required_bits, target_to_compact, DifficultyError,
};

use crate::block::BlockHeader;

/// Search header nonces, starting from the current one, until the block hash
/// meets the target in `header.bits`. Returns `false` if `max_attempts` ran
/// out first.
pub fn solve_header(header: &mut BlockHeader, max_attempts: u32) -> Result<bool, DifficultyError> {
    let target = compact_to_target(header.bits)?;
    for _ in 0..max_attempts {
        if hash_meets_target(&header.hash(), &target) {
            return Ok(true);
        }
        header.nonce = header.nonce.wrapping_add(1);
    }
    Ok(false)
}

/// Search parent header nonces until the parent hash meets `bits`.
pub fn solve_aux_pow(aux_pow: &mut AuxPow, bits: u32, max_attempts: u32) -> Result<bool, DifficultyError> {
    let target = compact_to_target(bits)?;
    for _ in 0..max_attempts {
        if hash_meets_target(&aux_pow.parent_hash(), &target) {
            return Ok(true);
        }
        aux_pow.parent_header.nonce = aux_pow.parent_header.nonce.wrapping_add(1);
    }
    Ok(false)
}
