mod common;

use common::{mine_block, native_balance, next_block, open_node, owner, regtest_params};
use mergechain::consensus::ConsensusParams;
use mergechain::error::ErrorKind;
use mergechain::ledger::SaveOutcome;
use mergechain::node::{MinerError, NodeError};
use mergechain::pow::{solve_aux_pow, AuxPow};

fn merged_params() -> ConsensusParams {
    ConsensusParams {
        merged_mining: true,
        ..regtest_params()
    }
}

#[test]
fn test_aux_work_round_trip() {
    let mut node = open_node(merged_params());
    let payout = owner(4);
    node.set_miner(owner(9), 1000);

    let work = node.create_aux_block(payout).unwrap();
    assert_eq!(work.height, 1);
    assert_eq!(work.prev_block_hash, node.chain_state().tip_hash);

    let mut aux_pow = AuxPow::for_single_chain(&work.hash, work.bits);
    assert!(solve_aux_pow(&mut aux_pow, work.bits, 1_000_000).unwrap());
    assert_eq!(
        node.submit_aux_block(&work.hash, aux_pow).unwrap(),
        SaveOutcome::Queued(work.hash)
    );
    node.flush().unwrap();

    assert_eq!(node.height(), 1);
    assert_eq!(native_balance(&node, &[payout]), node.params().block_reward);
}

#[test]
fn test_proof_for_other_block_rejected() {
    let mut node = open_node(merged_params());
    node.set_miner(owner(9), 1000);

    let work = node.create_aux_block(owner(4)).unwrap();
    let mut aux_pow = AuxPow::for_single_chain(&[0x55; 32], work.bits);
    assert!(solve_aux_pow(&mut aux_pow, work.bits, 1_000_000).unwrap());

    let err = node.submit_aux_block(&work.hash, aux_pow).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidContext);
    node.flush().unwrap();
    assert_eq!(node.height(), 0);
}

#[test]
fn test_competing_block_discards_candidate() {
    let mut node = open_node(merged_params());
    node.set_miner(owner(9), 1000);

    let work = node.create_aux_block(owner(4)).unwrap();
    assert_eq!(node.miner().unwrap().candidate_count(), 1);

    // Another producer wins the same height
    let rival = next_block(&node, owner(1), &[]);
    assert_eq!(rival.height(), work.height);
    assert_ne!(rival.hash(), work.hash);
    assert_eq!(node.add_block(rival.clone()).unwrap(), SaveOutcome::Queued(rival.hash()));
    node.flush().unwrap();

    assert_eq!(node.chain_state().tip_hash, rival.hash());
    assert_eq!(node.miner().unwrap().candidate_count(), 0);

    let mut aux_pow = AuxPow::for_single_chain(&work.hash, work.bits);
    assert!(solve_aux_pow(&mut aux_pow, work.bits, 1_000_000).unwrap());
    let err = node.submit_aux_block(&work.hash, aux_pow).unwrap_err();
    assert!(matches!(err, NodeError::Miner(MinerError::UnknownCandidate(hash)) if hash == work.hash));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(node.height(), 1);
}

#[test]
fn test_aux_work_requires_miner() {
    let node = open_node(merged_params());
    assert!(node.create_aux_block(owner(4)).is_err());
}

#[test]
fn test_merge_mined_chain_extends() {
    let node = open_node(merged_params());
    for _ in 0..3 {
        let block = mine_block(&node, owner(1), &[]);
        assert!(block.header.aux_pow.is_some());
    }
    assert_eq!(node.height(), 3);

    // Blocks without a proof are structurally invalid here
    let mut bare = common::next_block(&node, owner(1), &[]);
    bare.header.aux_pow = None;
    assert_eq!(node.add_block(bare).unwrap_err().kind(), ErrorKind::InvalidStructure);
}
