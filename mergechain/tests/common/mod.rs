//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use tempfile::TempDir;

use mergechain::address::ProgramHash;
use mergechain::asset::Fixed64;
use mergechain::block::{native_asset_id, now_secs, Block};
use mergechain::consensus::{BlockBuilder, ConsensusParams, Network};
use mergechain::ledger::SaveOutcome;
use mergechain::node::Node;
use mergechain::pow::{solve_aux_pow, solve_header, AuxPow};
use mergechain::transaction::{Transaction, TxOutput};

/// A node whose ledger lives in a temporary directory.
pub struct TestNode {
    pub node: Node,
    // Declared last so the node is dropped before its directory
    pub dir: TempDir,
}

impl std::ops::Deref for TestNode {
    type Target = Node;

    fn deref(&self) -> &Node {
        &self.node
    }
}

impl std::ops::DerefMut for TestNode {
    fn deref_mut(&mut self) -> &mut Node {
        &mut self.node
    }
}

pub fn regtest_params() -> ConsensusParams {
    ConsensusParams::for_network(Network::Regtest)
}

pub fn open_node(params: ConsensusParams) -> TestNode {
    let dir = tempfile::tempdir().expect("tempdir");
    let node = Node::open(dir.path(), Arc::new(params)).expect("open node");
    TestNode { node, dir }
}

pub fn regtest_node() -> TestNode {
    open_node(regtest_params())
}

pub fn owner(byte: u8) -> ProgramHash {
    ProgramHash::standard([byte; 20])
}

pub fn native_output(units: i64, to: ProgramHash) -> TxOutput {
    TxOutput {
        asset_id: native_asset_id(),
        value: Fixed64::from_units(units),
        program_hash: to,
    }
}

/// Build and solve the next block paying `payout`, without submitting it.
pub fn next_block(node: &Node, payout: ProgramHash, txs: &[Arc<Transaction>]) -> Block {
    let ledger = node.ledger();
    let builder = BlockBuilder::new(ledger.validator().clone(), payout);
    let tip = ledger.tip_header().expect("tip header");
    let built = builder
        .build(ledger.as_ref(), &tip, txs, now_secs())
        .expect("build block");
    assert!(built.skipped.is_empty(), "transactions skipped: {:?}", built.skipped);

    let mut block = built.block;
    if node.params().merged_mining {
        let mut aux_pow = AuxPow::for_single_chain(&block.hash(), block.header.bits);
        assert!(solve_aux_pow(&mut aux_pow, block.header.bits, 10_000_000).unwrap());
        block.header.aux_pow = Some(aux_pow);
    } else {
        assert!(solve_header(&mut block.header, 10_000_000).unwrap());
    }
    block
}

/// Mine, submit and wait for the next block.
pub fn mine_block(node: &Node, payout: ProgramHash, txs: &[Arc<Transaction>]) -> Block {
    let block = next_block(node, payout, txs);
    let outcome = node.add_block(block.clone()).expect("save block");
    assert_eq!(outcome, SaveOutcome::Queued(block.hash()));
    node.flush().expect("flush");
    block
}

pub fn mine_blocks(node: &Node, payout: ProgramHash, count: u32) -> Vec<Block> {
    (0..count).map(|_| mine_block(node, payout, &[])).collect()
}

/// Total native value held by `owners`.
pub fn native_balance(node: &Node, owners: &[ProgramHash]) -> Fixed64 {
    let asset = native_asset_id();
    owners
        .iter()
        .flat_map(|owner| {
            node.ledger()
                .get_unspent_from_program_hash(owner, &asset)
                .expect("unspents")
        })
        .fold(Fixed64::ZERO, |acc, entry| acc.checked_add(entry.value).unwrap())
}
