//! Per-shard serial executors.
//!
//! Every shard owns one worker thread and one FIFO task queue. The worker constructs the shard
//! state itself and is the only code that ever touches it, so mutual exclusion inside a shard is
//! structural: tasks run strictly one at a time, in the order they were submitted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use dfly_common::error::{DflyError, DflyResult};
use dfly_common::ids::{ShardCount, ShardId};
use tracing::{debug, trace};

/// One unit of work executed against shard-owned state.
pub type ShardTask<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

/// Fixed set of shard workers, each owning one instance of `S`.
pub struct ShardSet<S> {
    shard_count: ShardCount,
    senders: Vec<mpsc::Sender<ShardTask<S>>>,
    processed_per_shard: Arc<Vec<AtomicU64>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl<S> std::fmt::Debug for ShardSet<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardSet")
            .field("shard_count", &self.shard_count)
            .field("senders", &self.senders.len())
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl<S: 'static> ShardSet<S> {
    /// Starts one worker thread per shard; each worker builds its state with `factory`.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::InvalidState` when a worker thread cannot be spawned.
    pub fn new<F>(shard_count: ShardCount, factory: F) -> DflyResult<Self>
    where
        F: Fn(ShardId) -> S + Send + Sync + 'static,
    {
        let shard_len = usize::from(shard_count.get());
        let processed_per_shard = Arc::new(
            (0..shard_len)
                .map(|_| AtomicU64::new(0))
                .collect::<Vec<_>>(),
        );
        let factory = Arc::new(factory);

        let mut senders = Vec::with_capacity(shard_len);
        let mut workers = Vec::with_capacity(shard_len);
        for shard in shard_count.shard_ids() {
            let (sender, receiver) = mpsc::channel::<ShardTask<S>>();
            senders.push(sender);

            let processed = Arc::clone(&processed_per_shard);
            let shard_factory = Arc::clone(&factory);
            let handle = thread::Builder::new()
                .name(format!("shard-{shard}"))
                .spawn(move || {
                    let state = shard_factory(shard);
                    shard_worker_loop(shard, state, &receiver, &processed);
                })
                .map_err(|_| DflyError::InvalidState("failed to spawn shard worker thread"))?;
            workers.push(handle);
        }

        debug!(shards = shard_len, "shard workers started");
        Ok(Self {
            shard_count,
            senders,
            processed_per_shard,
            workers,
        })
    }

    /// Number of shard workers served by this set.
    #[must_use]
    pub fn shard_count(&self) -> ShardCount {
        self.shard_count
    }

    /// Submits one task to a shard queue without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::ShardUnavailable` when the shard is out of range or its worker is
    /// gone.
    pub fn add<F>(&self, shard: ShardId, task: F) -> DflyResult<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let Some(sender) = self.senders.get(usize::from(shard)) else {
            return Err(DflyError::ShardUnavailable(shard));
        };
        sender
            .send(Box::new(task))
            .map_err(|_| DflyError::ShardUnavailable(shard))
    }

    /// Runs `task` on one shard and blocks until it returns.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::ShardUnavailable` when the shard cannot accept or finish the task.
    pub fn await_on<R, F>(&self, shard: ShardId, task: F) -> DflyResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.add(shard, move |state| {
            let _ = reply_tx.send(task(state));
        })?;
        reply_rx
            .recv()
            .map_err(|_| DflyError::ShardUnavailable(shard))
    }

    /// Runs `task` on every listed shard in parallel and returns results in `shards` order.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::ShardUnavailable` when any listed shard cannot run the task and
    /// `DflyError::Timeout` when acknowledgements do not arrive within `timeout`.
    pub fn run_on<R, F>(
        &self,
        shards: &[ShardId],
        timeout: Duration,
        task: F,
    ) -> DflyResult<Vec<(ShardId, R)>>
    where
        R: Send + 'static,
        F: Fn(&mut S) -> R + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let (reply_tx, reply_rx) = mpsc::channel();
        for (position, shard) in shards.iter().copied().enumerate() {
            let task = Arc::clone(&task);
            let reply_tx = reply_tx.clone();
            self.add(shard, move |state| {
                let _ = reply_tx.send((position, task(state)));
            })?;
        }
        drop(reply_tx);

        let mut replies = (0..shards.len()).map(|_| None).collect::<Vec<Option<R>>>();
        for _ in shards {
            let (position, reply) = reply_rx.recv_timeout(timeout).map_err(|error| match error {
                mpsc::RecvTimeoutError::Timeout => DflyError::Timeout("shard acknowledgements"),
                mpsc::RecvTimeoutError::Disconnected => {
                    first_missing_shard(shards, &replies).map_or(
                        DflyError::InvalidState("shard reply channel closed"),
                        DflyError::ShardUnavailable,
                    )
                }
            })?;
            replies[position] = Some(reply);
        }

        Ok(shards
            .iter()
            .copied()
            .zip(replies)
            .filter_map(|(shard, reply)| reply.map(|reply| (shard, reply)))
            .collect())
    }

    /// Runs `task` on every shard in parallel and returns results in shard order.
    ///
    /// # Errors
    ///
    /// Same as [`ShardSet::run_on`].
    pub fn run_brief_in_parallel<R, F>(
        &self,
        timeout: Duration,
        task: F,
    ) -> DflyResult<Vec<(ShardId, R)>>
    where
        R: Send + 'static,
        F: Fn(&mut S) -> R + Send + Sync + 'static,
    {
        let shards = self.shard_count.shard_ids().collect::<Vec<_>>();
        self.run_on(&shards, timeout, task)
    }

    /// Number of tasks a shard worker has finished so far.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::ShardUnavailable` when shard id is out of range.
    pub fn processed_count(&self, shard: ShardId) -> DflyResult<u64> {
        self.processed_per_shard
            .get(usize::from(shard))
            .map(|counter| counter.load(Ordering::Acquire))
            .ok_or(DflyError::ShardUnavailable(shard))
    }
}

impl<S> Drop for ShardSet<S> {
    fn drop(&mut self) {
        // Closing every producer handle lets worker loops observe queue closure.
        self.senders.clear();

        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn shard_worker_loop<S>(
    shard: ShardId,
    mut state: S,
    receiver: &mpsc::Receiver<ShardTask<S>>,
    processed_per_shard: &[AtomicU64],
) {
    for task in receiver {
        task(&mut state);
        if let Some(counter) = processed_per_shard.get(usize::from(shard)) {
            counter.fetch_add(1, Ordering::Release);
        }
    }
    trace!(shard, "shard worker stopped");
}

fn first_missing_shard<R>(shards: &[ShardId], replies: &[Option<R>]) -> Option<ShardId> {
    shards
        .iter()
        .zip(replies)
        .find_map(|(shard, reply)| reply.is_none().then_some(*shard))
}

#[cfg(test)]
mod tests {
    use super::ShardSet;
    use dfly_common::error::DflyError;
    use dfly_common::ids::{ShardCount, ShardId};
    use googletest::prelude::*;
    use rstest::rstest;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn counting_set(shards: u16) -> ShardSet<(ShardId, Vec<u32>)> {
        ShardSet::new(ShardCount::new(shards).expect("count should be valid"), |shard| {
            (shard, Vec::new())
        })
        .expect("workers should start")
    }

    #[rstest]
    fn shard_set_rejects_out_of_range_target_shard() {
        let set = counting_set(2);
        let result = set.add(2, |_| {});
        assert_eq!(result, Err(DflyError::ShardUnavailable(2)));
    }

    #[rstest]
    fn await_on_runs_against_the_owning_state() {
        let set = counting_set(3);
        let owner = set
            .await_on(2, |(shard, _)| *shard)
            .expect("await should succeed");
        assert_that!(owner, eq(2));
    }

    #[rstest]
    fn tasks_run_in_submission_order_per_shard() {
        let set = counting_set(2);
        for value in 0..100_u32 {
            set.add(1, move |(_, log)| log.push(value))
                .expect("submission should succeed");
        }

        let log = set
            .await_on(1, |(_, log)| log.clone())
            .expect("await should succeed");
        assert_that!(&log, eq(&(0..100_u32).collect::<Vec<_>>()));
        assert_that!(set.processed_count(0).expect("shard is valid"), eq(0));
    }

    #[rstest]
    fn run_on_returns_results_in_requested_order() {
        let set = counting_set(4);
        let results = set
            .run_on(&[3, 1, 2], WAIT, |(shard, _)| u32::from(*shard) * 10)
            .expect("fanout should succeed");
        assert_that!(&results, eq(&vec![(3_u16, 30_u32), (1, 10), (2, 20)]));
    }

    #[rstest]
    fn run_brief_in_parallel_touches_every_shard_once() {
        let set = counting_set(3);
        let results = set
            .run_brief_in_parallel(WAIT, |(_, log)| {
                log.push(7);
                log.len()
            })
            .expect("fanout should succeed");
        assert_that!(&results, eq(&vec![(0_u16, 1_usize), (1, 1), (2, 1)]));
    }

    #[rstest]
    fn shard_set_drop_joins_workers() {
        let set = counting_set(2);
        set.add(0, |(_, log)| log.push(1))
            .expect("submission should succeed");
        drop(set);
    }
}
