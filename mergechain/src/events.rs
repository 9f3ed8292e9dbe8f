// Copyright (c) 2024 Mergechain Foundation

//! Node events.
//!
//! Events are published synchronously by the component that caused them
//! (the ledger writer for persisted blocks, the pool for admitted
//! transactions). Hooks run first on the publishing thread, then every
//! channel subscriber receives a copy in publication order.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;

use crate::block::Block;
use crate::transaction::Transaction;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A block was committed to the ledger
    BlockPersisted(Arc<Block>),
    /// A transaction entered the pool
    TransactionAdmitted(Arc<Transaction>),
}

type Hook = Arc<dyn Fn(&NodeEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    hooks: Vec<Hook>,
    subscribers: Vec<Sender<NodeEvent>>,
}

/// Fan-out of node events to hooks and channel subscribers
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<Mutex<Listeners>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> Receiver<NodeEvent> {
        let (tx, rx) = unbounded();
        self.listeners.lock().subscribers.push(tx);
        rx
    }

    /// Register a callback run on the publishing thread before subscribers
    /// are notified.
    pub fn on_event<F>(&self, hook: F)
    where
        F: Fn(&NodeEvent) + Send + Sync + 'static,
    {
        self.listeners.lock().hooks.push(Arc::new(hook));
    }

    pub fn publish(&self, event: NodeEvent) {
        let hooks = self.listeners.lock().hooks.clone();
        for hook in &hooks {
            hook(&event);
        }

        // Dropped receivers are pruned
        self.listeners
            .lock()
            .subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.lock().subscribers.len()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.listeners.lock();
        f.debug_struct("EventBus")
            .field("hooks", &listeners.hooks.len())
            .field("subscribers", &listeners.subscribers.len())
            .finish()
    }
}
