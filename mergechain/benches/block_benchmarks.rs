// Copyright (c) 2024 Mergechain Foundation

//! Benchmarks for block operations.
//!
//! Run with: cargo bench -p mergechain --bench block_benchmarks
//!
//! These benchmarks measure the performance of:
//! - Block header hashing
//! - Merkle root computation
//! - Block encoding and decoding
//! - Compact target expansion

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use mergechain::address::ProgramHash;
use mergechain::asset::Fixed64;
use mergechain::block::{native_asset_id, Block};
use mergechain::consensus::{BlockValidator, ConsensusParams, Network};
use mergechain::pow::{compact_to_target, AuxPow};
use mergechain::serialization::{Decode, Encode};
use mergechain::transaction::{OutPoint, Transaction, TxOutput};
use std::sync::Arc;

/// Genesis followed by `count` transfers, each spending a distinct output.
fn block_with_transfers(count: usize) -> Block {
    let mut block = Block::genesis(&ConsensusParams::for_network(Network::Regtest));
    for i in 0..count {
        let mut seed = [0u8; 32];
        seed[..8].copy_from_slice(&(i as u64).to_le_bytes());
        block.transactions.push(Transaction::new_transfer(
            vec![OutPoint::new(seed, 0)],
            vec![TxOutput {
                asset_id: native_asset_id(),
                value: Fixed64::from_units(1),
                program_hash: ProgramHash::standard([i as u8; 20]),
            }],
        ));
    }
    block.header.merkle_root = block.compute_merkle_root();
    block
}

fn bench_header_hash(c: &mut Criterion) {
    let genesis = Block::genesis(&ConsensusParams::for_network(Network::Testnet));

    c.bench_function("BlockHeader hash", |b| {
        b.iter(|| black_box(genesis.header.hash()))
    });
}

fn bench_merkle_root(c: &mut Criterion) {
    let mut group = c.benchmark_group("merkle_root");
    for count in [10, 100, 1000] {
        let block = block_with_transfers(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &block, |b, block| {
            b.iter(|| black_box(block.compute_merkle_root()))
        });
    }
    group.finish();
}

fn bench_block_codec(c: &mut Criterion) {
    let block = block_with_transfers(100);
    let bytes = block.to_bytes();

    c.bench_function("Block encode (100 txs)", |b| {
        b.iter(|| black_box(block.to_bytes()))
    });
    c.bench_function("Block decode (100 txs)", |b| {
        b.iter(|| black_box(Block::from_bytes(&bytes).unwrap()))
    });
}

fn bench_block_sanity(c: &mut Criterion) {
    let validator = BlockValidator::new(Arc::new(ConsensusParams::for_network(Network::Regtest)));
    let block = block_with_transfers(100);

    c.bench_function("check_block_sanity (100 txs)", |b| {
        b.iter(|| black_box(validator.check_block_sanity(&block).is_ok()))
    });
}

fn bench_pow_checks(c: &mut Criterion) {
    c.bench_function("compact_to_target", |b| {
        b.iter(|| black_box(compact_to_target(black_box(0x1f0008ff)).unwrap()))
    });

    let aux_pow = AuxPow::for_single_chain(&[7u8; 32], 0x207fffff);
    c.bench_function("AuxPow check", |b| {
        b.iter(|| black_box(aux_pow.check(&[7u8; 32], 1224).is_ok()))
    });
}

criterion_group!(
    benches,
    bench_header_hash,
    bench_merkle_root,
    bench_block_codec,
    bench_block_sanity,
    bench_pow_checks,
);
criterion_main!(benches);
