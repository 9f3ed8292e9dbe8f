//! Bitcoin-style merkle trees: odd levels duplicate their last node.

use crate::hash::{sha256d_pair, Hash256, ZERO_HASH};

/// Root of the tree over `leaves`. An empty list yields the zero hash.
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return ZERO_HASH;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

/// Sibling hashes from leaf `index` up to (not including) the root.
pub fn merkle_branch(leaves: &[Hash256], mut index: usize) -> Vec<Hash256> {
    let mut branch = Vec::new();
    if index >= leaves.len() {
        return branch;
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let sibling = (index ^ 1).min(level.len() - 1);
        branch.push(level[sibling]);
        level = next_level(&level);
        index >>= 1;
    }
    branch
}

/// Fold `leaf` up through `branch`. Bit `i` of `index` says whether the leaf
/// sits on the right at level `i`.
pub fn check_merkle_branch(leaf: &Hash256, branch: &[Hash256], mut index: u32) -> Hash256 {
    let mut hash = *leaf;
    for sibling in branch {
        hash = if index & 1 == 1 {
            sha256d_pair(sibling, &hash)
        } else {
            sha256d_pair(&hash, sibling)
        };
        index >>= 1;
    }
    hash
}

fn next_level(level: &[Hash256]) -> Vec<Hash256> {
    level
        .chunks(2)
        .map(|pair| {
            let right = pair.get(1).unwrap_or(&pair[0]);
            sha256d_pair(&pair[0], right)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: u8) -> Vec<Hash256> {
        (0..n).map(|i| [i; 32]).collect()
    }

    #[test]
    fn test_single_leaf_is_root() {
        assert_eq!(merkle_root(&[[5u8; 32]]), [5u8; 32]);
        assert_eq!(merkle_root(&[]), ZERO_HASH);
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        let l = leaves(3);
        let expected = sha256d_pair(&sha256d_pair(&l[0], &l[1]), &sha256d_pair(&l[2], &l[2]));
        assert_eq!(merkle_root(&l), expected);
    }

    #[test]
    fn test_branch_reduces_to_root() {
        for n in 1..=9u8 {
            let l = leaves(n);
            let root = merkle_root(&l);
            for i in 0..n as usize {
                let branch = merkle_branch(&l, i);
                assert_eq!(check_merkle_branch(&l[i], &branch, i as u32), root);
            }
        }
    }

    #[test]
    fn test_wrong_index_misses_root() {
        let l = leaves(4);
        let branch = merkle_branch(&l, 1);
        assert_ne!(check_merkle_branch(&l[1], &branch, 2), merkle_root(&l));
    }
}
