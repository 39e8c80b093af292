//! Per-shard transaction queue with key intent locks.
//!
//! Every shard keeps the transactions scheduled on it ordered by txid. A shard only accepts a
//! txid strictly greater than every txid it accepted before, so all shards agree on the relative
//! order of any two transactions they share. Key intents form per-key FIFO queues in the same
//! order, and a transaction may run on a shard once none of its intents waits behind a
//! conflicting earlier intent.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use dfly_common::ids::{DbIndex, TxId};
use dfly_core::containers::HotMap;

use crate::plan::{KeyIntent, LockMode, TransactionMode};

type KeyQueue = VecDeque<(TxId, LockMode)>;

#[derive(Debug)]
struct QueuedTx {
    mode: TransactionMode,
    intents: Vec<KeyIntent>,
}

/// Ordered registry of the transactions scheduled on one shard.
#[derive(Debug, Default)]
pub struct TxQueue {
    watermark: TxId,
    entries: BTreeMap<TxId, QueuedTx>,
    globals: BTreeSet<TxId>,
    key_queues: HotMap<DbIndex, HotMap<Vec<u8>, KeyQueue>>,
}

impl TxQueue {
    /// Registers `txid` with its key intents.
    ///
    /// Returns `false` without side effects when `txid` does not exceed every txid this queue
    /// accepted before; the coordinator then retries with a fresh txid.
    pub fn try_schedule(
        &mut self,
        txid: TxId,
        mode: TransactionMode,
        intents: Vec<KeyIntent>,
    ) -> bool {
        if txid <= self.watermark {
            return false;
        }
        self.watermark = txid;
        if mode == TransactionMode::Global {
            let _ = self.globals.insert(txid);
        }
        for intent in &intents {
            self.key_queues
                .entry(intent.db)
                .or_default()
                .entry(intent.key.clone())
                .or_default()
                .push_back((txid, intent.lock_mode));
        }
        let _ = self.entries.insert(txid, QueuedTx { mode, intents });
        true
    }

    /// Drops `txid` and its key intents. Returns whether it was registered.
    pub fn remove(&mut self, txid: TxId) -> bool {
        let Some(queued) = self.entries.remove(&txid) else {
            return false;
        };
        let _ = self.globals.remove(&txid);
        for intent in &queued.intents {
            let Some(db_queues) = self.key_queues.get_mut(&intent.db) else {
                continue;
            };
            let mut now_empty = false;
            if let Some(queue) = db_queues.get_mut(intent.key.as_slice()) {
                queue.retain(|(queued_txid, _)| *queued_txid != txid);
                now_empty = queue.is_empty();
            }
            if now_empty {
                let _ = db_queues.remove(intent.key.as_slice());
            }
            if db_queues.is_empty() {
                let _ = self.key_queues.remove(&intent.db);
            }
        }
        true
    }

    /// Whether `txid` is registered.
    #[must_use]
    pub fn contains(&self, txid: TxId) -> bool {
        self.entries.contains_key(&txid)
    }

    /// Whether `txid` may run now without observing a conflicting transaction out of order.
    #[must_use]
    pub fn is_runnable(&self, txid: TxId) -> bool {
        let Some(queued) = self.entries.get(&txid) else {
            return false;
        };
        if queued.mode == TransactionMode::Global {
            return self.head() == Some(txid);
        }
        if self.globals.range(..txid).next().is_some() {
            return false;
        }
        queued
            .intents
            .iter()
            .all(|intent| self.intent_granted(txid, intent))
    }

    /// Lowest registered txid.
    #[must_use]
    pub fn head(&self) -> Option<TxId> {
        self.entries.keys().next().copied()
    }

    /// Highest txid ever accepted.
    #[must_use]
    pub fn watermark(&self) -> TxId {
        self.watermark
    }

    /// Number of registered transactions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no transaction is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of keys that currently carry at least one intent.
    #[must_use]
    pub fn locked_key_count(&self) -> usize {
        self.key_queues.values().map(HotMap::len).sum()
    }

    fn intent_granted(&self, txid: TxId, intent: &KeyIntent) -> bool {
        let Some(queue) = self
            .key_queues
            .get(&intent.db)
            .and_then(|db_queues| db_queues.get(intent.key.as_slice()))
        else {
            return false;
        };
        let mut earlier = queue
            .iter()
            .take_while(|(queued_txid, _)| *queued_txid != txid);
        match intent.lock_mode {
            LockMode::Exclusive => earlier.next().is_none(),
            LockMode::Shared => earlier.all(|(_, mode)| *mode == LockMode::Shared),
        }
    }
}
