// Copyright (c) 2024 Mergechain Foundation

//! Logging setup.
//!
//! Console logging goes through `tracing_subscriber::fmt`. `RUST_LOG`, when
//! set, takes precedence over the `--verbose` flag.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "mergechain=debug,info"
    } else {
        "info"
    }
}

/// Install the global tracing subscriber. Fails if one is already set.
pub fn init_tracing(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("Failed to initialize tracing: {}", e))
}
