//! Shard-owned state: the `DbSlice`, the transaction queue and hops waiting for their turn.

use std::collections::BTreeMap;

use dfly_common::ids::{DbIndex, ShardId, TxId};
use dfly_storage::DbSlice;
use tracing::{error, trace};

use crate::plan::{KeyIntent, TransactionMode};
use crate::scheduler::TxQueue;

/// Shard-local part of one transaction hop.
pub type HopTask = Box<dyn FnOnce(&mut EngineShard) + Send + 'static>;

/// Counters kept by every shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShardStats {
    /// Transactions accepted by the queue.
    pub tx_scheduled: u64,
    /// Scheduling attempts refused because the txid was already overtaken.
    pub schedule_conflicts: u64,
    /// Hops executed on this shard.
    pub hops_run: u64,
    /// Hops that had to wait behind a conflicting transaction.
    pub hops_deferred: u64,
    /// Transactions released after their final hop.
    pub tx_concluded: u64,
    /// Transactions released without a final hop.
    pub tx_cancelled: u64,
}

struct PendingHop {
    task: HopTask,
    is_final: bool,
}

/// All state owned by one shard worker.
pub struct EngineShard {
    shard_id: ShardId,
    db_slice: DbSlice,
    txq: TxQueue,
    pending: BTreeMap<TxId, PendingHop>,
    stats: ShardStats,
}

impl std::fmt::Debug for EngineShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineShard")
            .field("shard_id", &self.shard_id)
            .field("queued", &self.txq.len())
            .field("pending_hops", &self.pending.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl EngineShard {
    /// Builds shard state with databases `0..db_count` materialized.
    #[must_use]
    pub fn new(shard_id: ShardId, db_count: u16) -> Self {
        let mut db_slice = DbSlice::new(shard_id);
        for db in 0..db_count {
            db_slice.activate_db(db);
        }
        Self {
            shard_id,
            db_slice,
            txq: TxQueue::default(),
            pending: BTreeMap::new(),
            stats: ShardStats::default(),
        }
    }

    /// Owning shard id.
    #[must_use]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Shard keyspace.
    #[must_use]
    pub fn db_slice(&self) -> &DbSlice {
        &self.db_slice
    }

    /// Mutable shard keyspace.
    pub fn db_slice_mut(&mut self) -> &mut DbSlice {
        &mut self.db_slice
    }

    /// Transaction queue of this shard.
    #[must_use]
    pub fn txq(&self) -> &TxQueue {
        &self.txq
    }

    /// Shard counters.
    #[must_use]
    pub fn stats(&self) -> ShardStats {
        self.stats
    }

    /// Number of keys in `db` on this shard.
    #[must_use]
    pub fn db_size(&self, db: DbIndex) -> usize {
        self.db_slice.db_size(db)
    }

    pub(crate) fn schedule(
        &mut self,
        txid: TxId,
        mode: TransactionMode,
        intents: Vec<KeyIntent>,
    ) -> bool {
        if self.txq.try_schedule(txid, mode, intents) {
            self.stats.tx_scheduled += 1;
            trace!(shard = self.shard_id, txid, "transaction scheduled");
            true
        } else {
            self.stats.schedule_conflicts += 1;
            trace!(
                shard = self.shard_id,
                txid,
                watermark = self.txq.watermark(),
                "transaction overtaken"
            );
            false
        }
    }

    pub(crate) fn unschedule(&mut self, txid: TxId) -> bool {
        let _ = self.pending.remove(&txid);
        let removed = self.txq.remove(txid);
        if removed {
            self.stats.tx_cancelled += 1;
            trace!(shard = self.shard_id, txid, "transaction released");
            self.poll_execution();
        }
        removed
    }

    /// Accepts one hop of a scheduled transaction and runs every hop that became runnable.
    pub(crate) fn enqueue_hop(&mut self, txid: TxId, task: HopTask, is_final: bool) {
        if !self.txq.contains(txid) {
            error!(shard = self.shard_id, txid, "hop for unscheduled transaction dropped");
            return;
        }
        if self.pending.contains_key(&txid) {
            error!(shard = self.shard_id, txid, "transaction already has a pending hop");
            return;
        }
        if !self.txq.is_runnable(txid) {
            self.stats.hops_deferred += 1;
        }
        let _ = self.pending.insert(txid, PendingHop { task, is_final });
        self.poll_execution();
    }

    fn poll_execution(&mut self) {
        loop {
            let next = self
                .pending
                .keys()
                .copied()
                .find(|txid| self.txq.is_runnable(*txid));
            let Some(txid) = next else {
                break;
            };
            let Some(hop) = self.pending.remove(&txid) else {
                break;
            };
            (hop.task)(self);
            self.stats.hops_run += 1;
            if hop.is_final && self.txq.remove(txid) {
                self.stats.tx_concluded += 1;
                trace!(shard = self.shard_id, txid, "transaction concluded");
            }
        }
    }
}
