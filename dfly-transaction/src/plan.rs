//! Transaction plan model: shard footprint and per-shard argument partitioning.

use std::ops::Range;

use dfly_common::error::{DflyError, DflyResult};
use dfly_common::ids::{DbIndex, ShardCount, ShardId};
use dfly_core::{HashTagShardResolver, ShardResolver};

/// Execution mode aligned with Dragonfly's high-level transaction modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// Shard-wide barrier over every shard.
    Global,
    /// Lock-ahead mode over known keys.
    LockAhead,
}

/// Key intent strength requested by a lock-ahead transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockMode {
    /// Read-only access; compatible with other shared intents.
    Shared,
    /// Read-write access; conflicts with every other intent on the key.
    Exclusive,
}

/// One key intent registered in a shard transaction queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyIntent {
    /// Database the key lives in.
    pub db: DbIndex,
    /// Key bytes.
    pub key: Vec<u8>,
    /// Requested strength.
    pub lock_mode: LockMode,
}

/// Immutable description of what a transaction touches.
///
/// Arguments are regrouped by owner shard. A record of `key_step` consecutive arguments starts
/// with its key and always lands on the key's shard, so `MSET k1 v1 k2 v2` with `key_step == 2`
/// keeps every value next to its key. The reverse index maps each regrouped position back to its
/// index in the caller's argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionPlan {
    db_index: DbIndex,
    mode: TransactionMode,
    lock_mode: LockMode,
    key_step: usize,
    args: Vec<Vec<u8>>,
    reverse_index: Vec<usize>,
    shard_ranges: Vec<Range<usize>>,
    touched_shards: Vec<ShardId>,
}

impl TransactionPlan {
    /// Partitions `args` over the shards owning their keys.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::InvalidState` for a zero `key_step`, an argument count that is not a
    /// multiple of `key_step`, or an empty argument list.
    pub fn lock_ahead(
        resolver: &HashTagShardResolver,
        db_index: DbIndex,
        lock_mode: LockMode,
        args: Vec<Vec<u8>>,
        key_step: usize,
    ) -> DflyResult<Self> {
        if key_step == 0 {
            return Err(DflyError::InvalidState("key step must be positive"));
        }
        if args.is_empty() {
            return Err(DflyError::InvalidState(
                "lock-ahead transaction needs at least one key",
            ));
        }
        if args.len() % key_step != 0 {
            return Err(DflyError::InvalidState(
                "argument count is not a multiple of the key step",
            ));
        }

        let shard_len = usize::from(resolver.shard_count().get());
        let mut buckets = vec![Vec::<usize>::new(); shard_len];
        for record_start in (0..args.len()).step_by(key_step) {
            let shard = resolver.shard_for_key(&args[record_start]);
            buckets[usize::from(shard)].extend(record_start..record_start + key_step);
        }

        let mut slots = args.into_iter().map(Some).collect::<Vec<_>>();
        let mut flat_args = Vec::with_capacity(slots.len());
        let mut reverse_index = Vec::with_capacity(slots.len());
        let mut shard_ranges = Vec::with_capacity(shard_len);
        let mut touched_shards = Vec::new();
        for (shard, bucket) in resolver.shard_count().shard_ids().zip(&buckets) {
            let start = flat_args.len();
            for &original in bucket {
                if let Some(arg) = slots[original].take() {
                    flat_args.push(arg);
                    reverse_index.push(original);
                }
            }
            if flat_args.len() > start {
                touched_shards.push(shard);
            }
            shard_ranges.push(start..flat_args.len());
        }

        Ok(Self {
            db_index,
            mode: TransactionMode::LockAhead,
            lock_mode,
            key_step,
            args: flat_args,
            reverse_index,
            shard_ranges,
            touched_shards,
        })
    }

    /// Plan of a global transaction that runs once on every shard without arguments.
    #[must_use]
    pub fn global(shard_count: ShardCount, db_index: DbIndex) -> Self {
        let shard_len = usize::from(shard_count.get());
        Self {
            db_index,
            mode: TransactionMode::Global,
            lock_mode: LockMode::Exclusive,
            key_step: 1,
            args: Vec::new(),
            reverse_index: Vec::new(),
            shard_ranges: vec![0..0; shard_len],
            touched_shards: shard_count.shard_ids().collect(),
        }
    }

    /// Logical database the transaction operates on.
    #[must_use]
    pub fn db_index(&self) -> DbIndex {
        self.db_index
    }

    /// Execution mode.
    #[must_use]
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Strength of the key intents.
    #[must_use]
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    /// Number of arguments forming one key record.
    #[must_use]
    pub fn key_step(&self) -> usize {
        self.key_step
    }

    /// Shards the transaction runs on, ascending.
    #[must_use]
    pub fn touched_shards(&self) -> &[ShardId] {
        &self.touched_shards
    }

    /// Number of shards the transaction runs on.
    #[must_use]
    pub fn unique_shard_cnt(&self) -> usize {
        self.touched_shards.len()
    }

    /// The only shard the transaction runs on, when there is exactly one.
    #[must_use]
    pub fn unique_shard_id(&self) -> Option<ShardId> {
        match self.touched_shards.as_slice() {
            [shard] => Some(*shard),
            _ => None,
        }
    }

    /// Whether `shard` takes part in the transaction.
    #[must_use]
    pub fn is_active(&self, shard: ShardId) -> bool {
        self.touched_shards.binary_search(&shard).is_ok()
    }

    /// Arguments routed to `shard`, in original relative order. Empty for inactive shards.
    #[must_use]
    pub fn shard_args_in_shard(&self, shard: ShardId) -> &[Vec<u8>] {
        match self.shard_ranges.get(usize::from(shard)) {
            Some(range) => &self.args[range.clone()],
            None => &[],
        }
    }

    /// Keys routed to `shard`: the first argument of every record.
    pub fn shard_keys(&self, shard: ShardId) -> impl Iterator<Item = &[u8]> {
        self.shard_args_in_shard(shard)
            .iter()
            .step_by(self.key_step)
            .map(Vec::as_slice)
    }

    /// Maps a position inside `shard_args_in_shard(shard)` back to the caller's argument index.
    #[must_use]
    pub fn reverse_arg_index(&self, shard: ShardId, local_index: usize) -> Option<usize> {
        let range = self.shard_ranges.get(usize::from(shard))?;
        if local_index >= range.len() {
            return None;
        }
        self.reverse_index.get(range.start + local_index).copied()
    }

    /// Key intents to register on `shard`; repeated keys keep the strongest mode once.
    #[must_use]
    pub fn key_intents(&self, shard: ShardId) -> Vec<KeyIntent> {
        if self.mode == TransactionMode::Global {
            return Vec::new();
        }
        let mut keys = self.shard_keys(shard).collect::<Vec<_>>();
        keys.sort_unstable();
        keys.dedup();
        keys.into_iter()
            .map(|key| KeyIntent {
                db: self.db_index,
                key: key.to_vec(),
                lock_mode: self.lock_mode,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{LockMode, TransactionMode, TransactionPlan};
    use dfly_common::error::DflyError;
    use dfly_common::ids::ShardCount;
    use dfly_core::{HashTagShardResolver, ShardResolver};
    use googletest::prelude::*;
    use rstest::rstest;

    fn resolver(shards: u16) -> HashTagShardResolver {
        HashTagShardResolver::new(ShardCount::new(shards).expect("count should be valid"))
    }

    fn args(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|item| item.as_bytes().to_vec()).collect()
    }

    #[rstest]
    #[case(0, 2, "key step must be positive")]
    #[case(2, 3, "argument count is not a multiple of the key step")]
    #[case(1, 0, "lock-ahead transaction needs at least one key")]
    fn lock_ahead_rejects_malformed_arguments(
        #[case] key_step: usize,
        #[case] arg_count: usize,
        #[case] reason: &'static str,
    ) {
        let input = (0..arg_count).map(|index| vec![b'a' + u8::try_from(index).unwrap_or(0)]);
        let result = TransactionPlan::lock_ahead(
            &resolver(4),
            0,
            LockMode::Exclusive,
            input.collect(),
            key_step,
        );
        assert_eq!(result, Err(DflyError::InvalidState(reason)));
    }

    #[rstest]
    fn records_stay_together_and_reverse_index_restores_order() {
        let resolver = resolver(4);
        let input = args(&["k1", "v1", "k2", "v2", "k3", "v3", "k4", "v4"]);
        let plan = TransactionPlan::lock_ahead(&resolver, 2, LockMode::Exclusive, input.clone(), 2)
            .expect("plan should build");

        let mut restored = vec![Vec::new(); input.len()];
        for &shard in plan.touched_shards() {
            let local = plan.shard_args_in_shard(shard);
            assert_that!(local.len() % 2, eq(0));
            for (position, arg) in local.iter().enumerate() {
                let original = plan
                    .reverse_arg_index(shard, position)
                    .expect("position should map back");
                restored[original] = arg.clone();
            }
            for key in plan.shard_keys(shard) {
                assert_that!(resolver.shard_for_key(key), eq(shard));
            }
        }
        assert_that!(&restored, eq(&input));
        assert_that!(plan.db_index(), eq(2));
        assert_that!(plan.mode(), eq(TransactionMode::LockAhead));
    }

    #[rstest]
    fn single_shard_plan_reports_unique_shard() {
        let plan = TransactionPlan::lock_ahead(
            &resolver(1),
            0,
            LockMode::Shared,
            args(&["a", "b", "c"]),
            1,
        )
        .expect("plan should build");
        assert_that!(plan.unique_shard_cnt(), eq(1));
        assert_that!(plan.unique_shard_id(), eq(Some(0)));
        assert_that!(plan.is_active(0), eq(true));
        assert_that!(plan.reverse_arg_index(0, 3), eq(None));
    }

    #[rstest]
    fn key_intents_deduplicate_repeated_keys() {
        let plan = TransactionPlan::lock_ahead(
            &resolver(1),
            0,
            LockMode::Shared,
            args(&["b", "a", "b"]),
            1,
        )
        .expect("plan should build");
        let keys = plan
            .key_intents(0)
            .into_iter()
            .map(|intent| intent.key)
            .collect::<Vec<_>>();
        assert_that!(&keys, eq(&args(&["a", "b"])));
    }

    #[rstest]
    fn global_plan_touches_every_shard_without_intents() {
        let plan = TransactionPlan::global(ShardCount::new(3).expect("count should be valid"), 0);
        assert_that!(plan.touched_shards(), eq(&[0_u16, 1, 2][..]));
        assert_that!(plan.unique_shard_id(), eq(None));
        assert_that!(plan.key_intents(1).is_empty(), eq(true));
        assert_that!(plan.shard_args_in_shard(1).is_empty(), eq(true));
    }
}
