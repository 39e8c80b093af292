//! Process-wide set of engine shards plus the txid allocator shared by coordinators.

use std::sync::atomic::{AtomicU64, Ordering};

use dfly_common::config::CoreConfig;
use dfly_common::error::DflyResult;
use dfly_common::ids::{ShardCount, ShardId, TxId};
use dfly_core::{HashTagShardResolver, ShardResolver, ShardSet};
use tracing::info;

use crate::engine_shard::EngineShard;

/// Engine shards driven by one serial worker each.
#[derive(Debug)]
pub struct EngineShardSet {
    config: CoreConfig,
    resolver: HashTagShardResolver,
    shards: ShardSet<EngineShard>,
    next_txid: AtomicU64,
}

impl EngineShardSet {
    /// Validates `config` and starts every shard worker.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::InvalidConfig` for an invalid configuration and
    /// `DflyError::InvalidState` when a worker cannot be started.
    pub fn new(config: CoreConfig) -> DflyResult<Self> {
        config.validate()?;
        let resolver = if config.lock_on_hashtags {
            HashTagShardResolver::with_hashtags(config.shard_count)
        } else {
            HashTagShardResolver::new(config.shard_count)
        };
        let db_count = config.db_count;
        let shards = ShardSet::new(config.shard_count, move |shard| {
            EngineShard::new(shard, db_count)
        })?;
        info!(
            shards = config.shard_count.get(),
            db_count,
            lock_on_hashtags = config.lock_on_hashtags,
            "engine shard set started"
        );
        Ok(Self {
            config,
            resolver,
            shards,
            next_txid: AtomicU64::new(0),
        })
    }

    /// Configuration the set was started with.
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Number of shards.
    #[must_use]
    pub fn size(&self) -> u16 {
        self.config.shard_count.get()
    }

    /// Shard count as a typed value.
    #[must_use]
    pub fn shard_count(&self) -> ShardCount {
        self.config.shard_count
    }

    /// Key router used by every transaction on this set.
    #[must_use]
    pub fn resolver(&self) -> &HashTagShardResolver {
        &self.resolver
    }

    /// Owner shard of `key`.
    #[must_use]
    pub fn shard_for_key(&self, key: &[u8]) -> ShardId {
        self.resolver.shard_for_key(key)
    }

    /// Advances the logical expiry clock on every shard.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::ShardUnavailable` or `DflyError::Timeout` when a shard does not
    /// acknowledge the update.
    pub fn update_expire_clock(&self, now_ms: u64) -> DflyResult<()> {
        self.run_brief_in_parallel(move |shard| shard.db_slice_mut().update_expire_clock(now_ms))?;
        Ok(())
    }

    /// Runs non-transactional work on one shard and waits for its result.
    ///
    /// The task is ordered only against other tasks on the same shard, never against
    /// transactions that are still waiting for their turn.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::ShardUnavailable` when the shard cannot run the task.
    pub fn await_on<R, F>(&self, shard: ShardId, task: F) -> DflyResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut EngineShard) -> R + Send + 'static,
    {
        self.shards.await_on(shard, task)
    }

    /// Runs non-transactional work on every shard and returns results in shard order.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::ShardUnavailable` or `DflyError::Timeout` when a shard does not
    /// reply within the hop timeout.
    pub fn run_brief_in_parallel<R, F>(&self, task: F) -> DflyResult<Vec<(ShardId, R)>>
    where
        R: Send + 'static,
        F: Fn(&mut EngineShard) -> R + Send + Sync + 'static,
    {
        self.shards
            .run_brief_in_parallel(self.config.hop_timeout, task)
    }

    pub(crate) fn shards(&self) -> &ShardSet<EngineShard> {
        &self.shards
    }

    pub(crate) fn next_txid(&self) -> TxId {
        self.next_txid.fetch_add(1, Ordering::AcqRel) + 1
    }
}
