// Copyright (c) 2024 Mergechain Foundation

//! Double SHA-256 hashing used for block, transaction and merkle identities.

use sha2::{Digest, Sha256};

/// A 256-bit hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];

/// The all-zero hash, used as the "no parent" marker.
pub const ZERO_HASH: Hash256 = [0u8; 32];

/// SHA-256 applied twice.
pub fn sha256d(data: &[u8]) -> Hash256 {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Hash the concatenation of two child nodes.
pub fn sha256d_pair(left: &Hash256, right: &Hash256) -> Hash256 {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    Sha256::digest(hasher.finalize()).into()
}

/// Short hex form for log lines.
pub fn short_hex(hash: &Hash256) -> String {
    hex::encode(&hash[0..8])
}
