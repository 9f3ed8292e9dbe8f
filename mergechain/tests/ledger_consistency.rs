mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{mine_block, mine_blocks, native_balance, native_output, next_block, owner, regtest_node};
use mergechain::address::ProgramHash;
use mergechain::asset::{Asset, AssetRecordType, AssetType, Fixed64};
use mergechain::block::native_asset_id;
use mergechain::consensus::ValidationError;
use mergechain::error::ErrorKind;
use mergechain::events::NodeEvent;
use mergechain::hash::Hash256;
use mergechain::ledger::{LedgerError, SaveOutcome, UtxoEntry};
use mergechain::node::{Node, NodeError};
use mergechain::pow::solve_header;
use mergechain::transaction::{OutPoint, Transaction, TxInput, TxOutput};

/// Unspent entries of `owners`, in a canonical order.
fn snapshot(node: &Node, owners: &[ProgramHash]) -> Vec<HashMap<Hash256, Vec<UtxoEntry>>> {
    owners
        .iter()
        .map(|owner| {
            let mut unspents = node.unspents(owner, None).unwrap();
            for entries in unspents.values_mut() {
                entries.sort_by_key(|entry| (entry.tx_hash, entry.index));
            }
            unspents
        })
        .collect()
}

#[test]
fn test_utxo_conservation() {
    let node = regtest_node();
    let (alice, bob, carol) = (owner(1), owner(2), owner(3));
    let reward = node.params().block_reward;

    let blocks = mine_blocks(&node, alice, 3);
    let first = OutPoint::new(blocks[0].transactions[0].hash(), 0);
    let second = OutPoint::new(blocks[1].transactions[0].hash(), 0);

    // Two transfers in one block, one paying a fee of 1
    let to_bob = Transaction::new_transfer(vec![first], vec![native_output(2, bob), native_output(3, alice)]);
    let to_carol = Transaction::new_transfer(vec![second], vec![native_output(4, carol)]);
    node.add_transaction(to_bob).unwrap();
    node.add_transaction(to_carol).unwrap();
    mine_block(&node, alice, &node.pending_transactions(None));

    let minted = Fixed64(reward.value() * i64::from(node.height()));
    assert_eq!(native_balance(&node, &[alice, bob, carol]), minted);
    assert_eq!(native_balance(&node, &[bob]), Fixed64::from_units(2));
    assert_eq!(native_balance(&node, &[carol]), Fixed64::from_units(4));
}

#[test]
fn test_rollback_restores_state() {
    let node = regtest_node();
    let (alice, bob) = (owner(1), owner(2));
    let blocks = mine_blocks(&node, alice, 2);
    let funding = OutPoint::new(blocks[0].transactions[0].hash(), 0);

    let before_state = node.chain_state();
    let before = snapshot(&node, &[alice, bob]);

    let transfer = Transaction::new_transfer(vec![funding], vec![native_output(5, bob)]);
    node.add_transaction(transfer.clone()).unwrap();
    let block = mine_block(&node, alice, &node.pending_transactions(None));
    assert_ne!(snapshot(&node, &[alice, bob]), before);

    node.ledger().rollback_block(&block.hash()).unwrap();
    node.flush().unwrap();

    assert_eq!(node.chain_state(), before_state);
    assert_eq!(snapshot(&node, &[alice, bob]), before);
    assert_eq!(node.transaction(&transfer.hash()).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(node.block(&block.hash()).unwrap_err().kind(), ErrorKind::NotFound);

    // The restored output is spendable again
    node.add_transaction(transfer).unwrap();
    mine_block(&node, alice, &node.pending_transactions(None));
    assert_eq!(native_balance(&node, &[bob]), Fixed64::from_units(5));
}

#[test]
fn test_rollback_rejects_non_tip() {
    let node = regtest_node();
    let blocks = mine_blocks(&node, owner(1), 2);

    assert!(matches!(
        node.ledger().rollback_block(&blocks[0].hash()),
        Err(LedgerError::NotTip(_))
    ));
    let genesis = node.block_by_height(0).unwrap().hash();
    let err = node.ledger().rollback_block(&genesis).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidContext);
    assert_eq!(node.height(), 2);
}

#[test]
fn test_height_monotonic() {
    let node = regtest_node();
    let events = node.subscribe();
    mine_blocks(&node, owner(1), 5);

    let heights: Vec<u32> = events
        .try_iter()
        .filter_map(|event| match event {
            NodeEvent::BlockPersisted(block) => Some(block.height()),
            _ => None,
        })
        .collect();
    assert_eq!(heights, vec![1, 2, 3, 4, 5]);
    for height in 0..=5 {
        assert_eq!(node.block_by_height(height).unwrap().height(), height);
    }
}

#[test]
fn test_stale_and_future_blocks() {
    let node = regtest_node();
    let other = regtest_node();
    let payout = owner(1);

    // A chain of three blocks built elsewhere, delivered out of order
    let blocks: Vec<_> = (0..3).map(|_| mine_block(&other, payout, &[])).collect();

    assert_eq!(node.add_block(blocks[2].clone()).unwrap(), SaveOutcome::Deferred);
    assert_eq!(node.add_block(blocks[1].clone()).unwrap(), SaveOutcome::Deferred);
    assert_eq!(node.height(), 0);
    assert_eq!(node.ledger().deferred_count(), 2);

    assert_eq!(
        node.add_block(blocks[0].clone()).unwrap(),
        SaveOutcome::Queued(blocks[0].hash())
    );
    node.flush().unwrap();
    assert_eq!(node.height(), 3);
    assert_eq!(node.chain_state().tip_hash, blocks[2].hash());
    assert_eq!(node.ledger().deferred_count(), 0);

    assert_eq!(node.add_block(blocks[1].clone()).unwrap(), SaveOutcome::Stale);
}

#[test]
fn test_competing_block_rejected() {
    let node = regtest_node();
    let first = next_block(&node, owner(1), &[]);
    let rival = next_block(&node, owner(2), &[]);

    node.add_block(first).unwrap();
    node.flush().unwrap();
    assert_eq!(node.add_block(rival).unwrap(), SaveOutcome::Stale);
    assert_eq!(node.height(), 1);
}

fn share_asset() -> Asset {
    Asset {
        name: "SHR".to_string(),
        description: "shares".to_string(),
        precision: 0,
        asset_type: AssetType::Share,
        record_type: AssetRecordType::Balance,
    }
}

/// Issuance of `units` of `asset_id` to `to`, authorized by spending
/// `authority` and returning its native value to the issuer.
fn issue(
    asset_id: Hash256,
    units: i64,
    to: ProgramHash,
    authority: OutPoint,
    issuer: ProgramHash,
    change: i64,
) -> Transaction {
    Transaction::new_issue_asset(
        vec![authority],
        vec![
            TxOutput {
                asset_id,
                value: Fixed64::from_units(units),
                program_hash: to,
            },
            native_output(change, issuer),
        ],
    )
}

#[test]
fn test_asset_issuance_and_rollback() {
    let node = regtest_node();
    let issuer = owner(7);
    let blocks = mine_blocks(&node, issuer, 2);
    let fee_input = OutPoint::new(blocks[0].transactions[0].hash(), 0);
    let spare_input = OutPoint::new(blocks[1].transactions[0].hash(), 0);

    let mut register = Transaction::new_register_asset(share_asset(), Fixed64::from_units(50), issuer);
    register.inputs.push(TxInput::new(fee_input));
    register.outputs.push(native_output(5, issuer));
    let asset_id = register.hash();
    mine_block(&node, issuer, &[Arc::new(register)]);

    let state = node.ledger().get_asset(&asset_id).unwrap();
    assert_eq!(state.amount, Fixed64::from_units(50));
    assert_eq!(state.controller, issuer);
    assert_eq!(state.issued, Fixed64::ZERO);

    let first = issue(asset_id, 30, owner(8), OutPoint::new(asset_id, 0), issuer, 5);
    node.add_transaction(first).unwrap();
    let issue_block = mine_block(&node, issuer, &node.pending_transactions(None));
    assert_eq!(node.ledger().get_asset(&asset_id).unwrap().issued, Fixed64::from_units(30));
    let holdings = node.unspents(&owner(8), Some(&asset_id)).unwrap();
    assert_eq!(holdings[&asset_id][0].value, Fixed64::from_units(30));

    // Issuance beyond the registered amount is refused
    let over = issue(asset_id, 21, owner(9), spare_input, issuer, 5);
    assert_eq!(node.add_transaction(over.clone()).unwrap_err().kind(), ErrorKind::InvalidContext);

    node.ledger().rollback_block(&issue_block.hash()).unwrap();
    node.flush().unwrap();
    assert_eq!(node.ledger().get_asset(&asset_id).unwrap().issued, Fixed64::ZERO);
    assert!(node.unspents(&owner(8), Some(&asset_id)).unwrap().is_empty());
    node.add_transaction(over).unwrap();
}

#[test]
fn test_issuance_needs_controller_and_never_mints_native() {
    let node = regtest_node();
    let (issuer, stranger) = (owner(7), owner(9));
    let blocks = mine_blocks(&node, issuer, 1);
    let stranger_funds = mine_blocks(&node, stranger, 1);
    let fee_input = OutPoint::new(blocks[0].transactions[0].hash(), 0);
    let stranger_input = OutPoint::new(stranger_funds[0].transactions[0].hash(), 0);

    let mut register = Transaction::new_register_asset(share_asset(), Fixed64::from_units(50), issuer);
    register.inputs.push(TxInput::new(fee_input));
    let asset_id = register.hash();
    mine_block(&node, issuer, &[Arc::new(register)]);

    // Without inputs, or with inputs of someone other than the controller
    let unsigned = Transaction::new_issue_asset(
        vec![],
        vec![TxOutput {
            asset_id,
            value: Fixed64::from_units(10),
            program_hash: stranger,
        }],
    );
    assert_eq!(node.add_transaction(unsigned).unwrap_err().kind(), ErrorKind::InvalidContext);
    let foreign = issue(asset_id, 10, stranger, stranger_input, stranger, 5);
    assert_eq!(node.add_transaction(foreign).unwrap_err().kind(), ErrorKind::InvalidContext);

    // The native asset only comes from coinbase rewards
    let mint = Transaction::new_issue_asset(vec![], vec![native_output(1_000_000, stranger)]);
    assert_eq!(node.add_transaction(mint.clone()).unwrap_err().kind(), ErrorKind::InvalidContext);

    let mut block = next_block(&node, issuer, &[]);
    block.transactions.push(mint);
    block.header.merkle_root = block.compute_merkle_root();
    assert!(solve_header(&mut block.header, 10_000_000).unwrap());
    let err = node.add_block(block).unwrap_err();
    assert!(matches!(err, NodeError::Ledger(LedgerError::Invalid(ValidationError::NativeIssuance))));

    node.flush().unwrap();
    assert!(node.pool().is_empty());
    assert_eq!(node.height(), 3);
    assert_eq!(native_balance(&node, &[stranger]), node.params().block_reward);
}

#[test]
fn test_reopen_preserves_chain() {
    let common::TestNode { node, dir } = regtest_node();
    let blocks = mine_blocks(&node, owner(1), 3);
    let params = node.params().clone();
    node.shutdown();
    drop(node);

    let reopened = Node::open(dir.path(), params).unwrap();
    assert_eq!(reopened.height(), 3);
    assert_eq!(reopened.chain_state().tip_hash, blocks[2].hash());
    assert_eq!(
        native_balance(&reopened, &[owner(1)]),
        Fixed64(reopened.params().block_reward.value() * 3)
    );
    assert_eq!(native_asset_id(), reopened.block_by_height(0).unwrap().transactions[1].hash());
}
