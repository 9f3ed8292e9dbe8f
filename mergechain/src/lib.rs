// Copyright (c) 2024 Mergechain Foundation

//! Mergechain node library: a merge-mined proof-of-work full node core.
//!
//! The crate provides the chain data types and their wire codec, block and
//! transaction validation, difficulty and merged-mining proofs, LMDB-backed
//! ledger storage behind a single writer, the transaction pool and the
//! mining loop.

#![deny(clippy::print_stdout)]

pub mod address;
pub mod asset;
pub mod block;
pub mod config;
pub mod consensus;
pub mod error;
pub mod events;
pub mod hash;
pub mod ledger;
pub mod mempool;
pub mod merkle;
pub mod node;
pub mod pow;
pub mod serialization;
pub mod telemetry;
pub mod transaction;

// CLI command implementations used by the binary
pub mod commands;

pub use error::ErrorKind;
