// Copyright (c) 2024 Mergechain Foundation

//! The single ledger writer.
//!
//! Every mutation of the ledger is a [`LedgerTask`] drained in FIFO order by
//! one background thread. Failures are logged and the task dropped; the
//! chain height only advances when a write transaction commits.

use crossbeam_channel::{Receiver, Sender};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

use super::chain::LedgerCore;
use crate::block::Block;
use crate::hash::Hash256;

/// Work queued for the ledger writer
#[derive(Debug)]
pub enum LedgerTask {
    /// Persist a validated block extending the tip
    Persist(Box<Block>),
    /// Undo the current tip, identified by its hash
    Rollback(Hash256),
    /// Acknowledge once every earlier task has run
    Flush(Sender<()>),
    /// Stop after the tasks queued before this one
    Shutdown,
}

pub(crate) fn spawn(core: Arc<LedgerCore>, tasks: Receiver<LedgerTask>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("ledger-writer".to_string())
        .spawn(move || run(core, tasks))
}

fn run(core: Arc<LedgerCore>, tasks: Receiver<LedgerTask>) {
    debug!("Ledger writer started");
    while let Ok(task) = tasks.recv() {
        match task {
            LedgerTask::Persist(block) => core.apply_persist(*block),
            LedgerTask::Rollback(hash) => core.apply_rollback(&hash),
            LedgerTask::Flush(done) => {
                let _ = done.send(());
            }
            LedgerTask::Shutdown => break,
        }
    }
    info!("Ledger writer stopped");
}
