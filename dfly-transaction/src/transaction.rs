//! Coordinator side of a cross-shard transaction.
//!
//! A transaction first registers itself on every shard it touches under one txid, retrying with
//! a fresh txid whenever some shard has already accepted a later one. Once scheduled, each hop
//! dispatches the same callback to every touched shard; a shard runs it as soon as no earlier
//! conflicting transaction is still registered there. The final hop releases the registration.

use std::sync::Arc;
use std::sync::mpsc;

use dfly_common::error::{DflyError, DflyResult, OpResult, first_failure};
use dfly_common::ids::{DbIndex, ShardId, TxId, UNSCHEDULED_TXID};
use tracing::{debug, trace, warn};

use crate::engine_shard::EngineShard;
use crate::plan::{LockMode, TransactionMode, TransactionPlan};
use crate::shard_set::EngineShardSet;

/// Lifecycle marker of a coordinator transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Built but not registered on any shard.
    Unscheduled,
    /// Registered on every touched shard; no hop ran yet.
    Scheduled,
    /// At least one non-final hop completed.
    HopExecuted,
    /// Final hop completed or the transaction was aborted.
    Done,
}

/// One multi-shard operation driven from the calling thread.
#[derive(Debug)]
pub struct Transaction<'a> {
    shard_set: &'a EngineShardSet,
    plan: Arc<TransactionPlan>,
    txid: TxId,
    state: TxState,
    hops_executed: u32,
}

impl<'a> Transaction<'a> {
    /// Builds a lock-ahead transaction over `args`, where every `key_step` arguments form one
    /// record starting with its key.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::InvalidState` when `args` cannot be split into key records.
    pub fn for_keys(
        shard_set: &'a EngineShardSet,
        db_index: DbIndex,
        lock_mode: LockMode,
        args: Vec<Vec<u8>>,
        key_step: usize,
    ) -> DflyResult<Self> {
        let plan =
            TransactionPlan::lock_ahead(shard_set.resolver(), db_index, lock_mode, args, key_step)?;
        Ok(Self::with_plan(shard_set, plan))
    }

    /// Builds a global transaction that runs on every shard as a barrier.
    #[must_use]
    pub fn global(shard_set: &'a EngineShardSet, db_index: DbIndex) -> Self {
        Self::with_plan(
            shard_set,
            TransactionPlan::global(shard_set.shard_count(), db_index),
        )
    }

    fn with_plan(shard_set: &'a EngineShardSet, plan: TransactionPlan) -> Self {
        Self {
            shard_set,
            plan: Arc::new(plan),
            txid: UNSCHEDULED_TXID,
            state: TxState::Unscheduled,
            hops_executed: 0,
        }
    }

    /// Registers the transaction on every touched shard.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::InvalidState` when already scheduled,
    /// `DflyError::ScheduleExhausted` when every attempt was overtaken by concurrent
    /// transactions, and shard availability errors from the handshake.
    pub fn schedule(&mut self) -> DflyResult<()> {
        if self.state != TxState::Unscheduled {
            return Err(DflyError::InvalidState("transaction is already scheduled"));
        }
        let attempts = self.shard_set.config().schedule_attempts;
        let timeout = self.shard_set.config().hop_timeout;
        let shards = self.plan.touched_shards().to_vec();

        for attempt in 1..=attempts {
            let txid = self.shard_set.next_txid();
            let plan = Arc::clone(&self.plan);
            let replies = self.shard_set.shards().run_on(&shards, timeout, move |shard| {
                let intents = plan.key_intents(shard.shard_id());
                shard.schedule(txid, plan.mode(), intents)
            });
            let replies = match replies {
                Ok(replies) => replies,
                Err(error) => {
                    let _ = self.release(&shards, txid);
                    return Err(error);
                }
            };

            if replies.iter().all(|(_, accepted)| *accepted) {
                self.txid = txid;
                self.state = TxState::Scheduled;
                trace!(txid, attempt, shards = shards.len(), "transaction scheduled");
                return Ok(());
            }

            let accepted = replies
                .iter()
                .filter_map(|(shard, accepted)| accepted.then_some(*shard))
                .collect::<Vec<_>>();
            self.release(&accepted, txid)?;
            debug!(txid, attempt, "scheduling overtaken; retrying with a fresh txid");
            std::thread::yield_now();
        }
        Err(DflyError::ScheduleExhausted(attempts))
    }

    /// Runs `callback` once on every touched shard and returns results in shard order.
    ///
    /// With `is_final` the registration is released on every shard right after the callback.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::InvalidState` when the transaction is not scheduled or already done,
    /// and shard availability or timeout errors from the dispatch.
    pub fn execute<R, F>(&mut self, callback: F, is_final: bool) -> DflyResult<Vec<(ShardId, R)>>
    where
        R: Send + 'static,
        F: Fn(&TransactionPlan, &mut EngineShard) -> R + Send + Sync + 'static,
    {
        if !matches!(self.state, TxState::Scheduled | TxState::HopExecuted) {
            return Err(DflyError::InvalidState(
                "execute requires a scheduled transaction",
            ));
        }

        let callback = Arc::new(callback);
        let (reply_tx, reply_rx) = mpsc::channel();
        let txid = self.txid;
        for &shard in self.plan.touched_shards() {
            let callback = Arc::clone(&callback);
            let plan = Arc::clone(&self.plan);
            let reply_tx = reply_tx.clone();
            self.shard_set.shards().add(shard, move |engine: &mut EngineShard| {
                let hop = Box::new(move |engine: &mut EngineShard| {
                    let result = callback(&plan, engine);
                    let _ = reply_tx.send((shard, result));
                });
                engine.enqueue_hop(txid, hop, is_final);
            })?;
        }
        drop(reply_tx);

        let timeout = self.shard_set.config().hop_timeout;
        let mut results = Vec::with_capacity(self.plan.unique_shard_cnt());
        for _ in self.plan.touched_shards() {
            let reply = reply_rx.recv_timeout(timeout).map_err(|error| match error {
                mpsc::RecvTimeoutError::Timeout => DflyError::Timeout("transaction hop"),
                mpsc::RecvTimeoutError::Disconnected => {
                    DflyError::InvalidState("transaction hop was dropped by a shard")
                }
            })?;
            results.push(reply);
        }
        results.sort_unstable_by_key(|(shard, _)| *shard);

        self.hops_executed += 1;
        self.state = if is_final {
            TxState::Done
        } else {
            TxState::HopExecuted
        };
        trace!(txid, hop = self.hops_executed, is_final, "hop executed");
        Ok(results)
    }

    /// Schedules, runs one final hop and returns the first failure in shard order.
    ///
    /// # Errors
    ///
    /// Same as [`Transaction::schedule`] and [`Transaction::execute`].
    pub fn schedule_single_hop<F>(&mut self, callback: F) -> DflyResult<OpResult<()>>
    where
        F: Fn(&TransactionPlan, &mut EngineShard) -> OpResult<()> + Send + Sync + 'static,
    {
        let results = self.schedule_single_hop_with(callback)?;
        Ok(first_failure(results.iter().map(|(_, result)| result)))
    }

    /// Single-hop variant for transactions that touch exactly one shard.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::InvalidState` when the transaction spans more than one shard, plus
    /// the errors of [`Transaction::schedule_single_hop_with`].
    pub fn schedule_single_hop_t<R, F>(&mut self, callback: F) -> DflyResult<OpResult<R>>
    where
        R: Send + 'static,
        F: Fn(&TransactionPlan, &mut EngineShard) -> OpResult<R> + Send + Sync + 'static,
    {
        if self.plan.unique_shard_id().is_none() {
            return Err(DflyError::InvalidState(
                "single-result hop needs exactly one shard",
            ));
        }
        let mut results = self.schedule_single_hop_with(callback)?;
        results
            .pop()
            .map(|(_, result)| result)
            .ok_or(DflyError::InvalidState("shard returned no hop result"))
    }

    /// Schedules and runs one final hop, returning every shard's result in shard order.
    ///
    /// # Errors
    ///
    /// Same as [`Transaction::schedule`] and [`Transaction::execute`].
    pub fn schedule_single_hop_with<R, F>(&mut self, callback: F) -> DflyResult<Vec<(ShardId, R)>>
    where
        R: Send + 'static,
        F: Fn(&TransactionPlan, &mut EngineShard) -> R + Send + Sync + 'static,
    {
        self.schedule()?;
        self.execute(callback, true)
    }

    /// Cancels a scheduled transaction before its first hop.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::InvalidState` when the transaction is unscheduled, already ran a
    /// hop, or finished.
    pub fn abort(&mut self) -> DflyResult<()> {
        if self.state != TxState::Scheduled {
            return Err(DflyError::InvalidState(
                "abort is only allowed between scheduling and the first hop",
            ));
        }
        let shards = self.plan.touched_shards().to_vec();
        self.release(&shards, self.txid)?;
        self.state = TxState::Done;
        debug!(txid = self.txid, "transaction aborted");
        Ok(())
    }

    /// Allocated txid, or zero before scheduling.
    #[must_use]
    pub fn txid(&self) -> TxId {
        self.txid
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Database the transaction operates on.
    #[must_use]
    pub fn db_index(&self) -> DbIndex {
        self.plan.db_index()
    }

    /// Execution mode.
    #[must_use]
    pub fn mode(&self) -> TransactionMode {
        self.plan.mode()
    }

    /// Argument partitioning of this transaction.
    #[must_use]
    pub fn plan(&self) -> &TransactionPlan {
        &self.plan
    }

    /// Number of shards the transaction touches.
    #[must_use]
    pub fn unique_shard_cnt(&self) -> usize {
        self.plan.unique_shard_cnt()
    }

    /// The only shard touched, when there is exactly one.
    #[must_use]
    pub fn unique_shard_id(&self) -> Option<ShardId> {
        self.plan.unique_shard_id()
    }

    /// Whether `shard` takes part in the transaction.
    #[must_use]
    pub fn is_active(&self, shard: ShardId) -> bool {
        self.plan.is_active(shard)
    }

    /// Arguments routed to `shard`.
    #[must_use]
    pub fn shard_args_in_shard(&self, shard: ShardId) -> &[Vec<u8>] {
        self.plan.shard_args_in_shard(shard)
    }

    /// Original argument index of a shard-local argument position.
    #[must_use]
    pub fn reverse_arg_index(&self, shard: ShardId, local_index: usize) -> Option<usize> {
        self.plan.reverse_arg_index(shard, local_index)
    }

    /// Short identifier for logs.
    #[must_use]
    pub fn debug_id(&self) -> String {
        format!("{}@{}/{}", self.txid, self.hops_executed, self.plan.unique_shard_cnt())
    }

    fn release(&self, shards: &[ShardId], txid: TxId) -> DflyResult<()> {
        if shards.is_empty() {
            return Ok(());
        }
        let timeout = self.shard_set.config().hop_timeout;
        self.shard_set
            .shards()
            .run_on(shards, timeout, move |shard| shard.unschedule(txid))?;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if matches!(self.state, TxState::Scheduled | TxState::HopExecuted) {
            warn!(
                txid = self.txid,
                hops = self.hops_executed,
                "dropping unconcluded transaction"
            );
            let shards = self.plan.touched_shards().to_vec();
            let _ = self.release(&shards, self.txid);
        }
    }
}
