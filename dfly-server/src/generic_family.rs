//! Keyspace commands that are not tied to one value type.

use dfly_common::error::{DflyResult, OpResult, OpStatus};
use dfly_transaction::{EngineShardSet, LockMode, Transaction};
use tracing::{debug, info};

use crate::context::CommandContext;

/// `DEL key...`; returns how many keys were removed.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling.
pub fn del(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    keys: Vec<Vec<u8>>,
) -> DflyResult<usize> {
    let mut tx = Transaction::for_keys(shard_set, cntx.db_index, LockMode::Exclusive, keys, 1)?;
    let removed = tx.schedule_single_hop_with(|plan, shard| {
        let db = plan.db_index();
        let keys = plan
            .shard_keys(shard.shard_id())
            .map(<[u8]>::to_vec)
            .collect::<Vec<_>>();
        let slice = shard.db_slice_mut();
        keys.iter()
            .filter(|key| slice.find(db, key).is_ok_and(|it| slice.delete(db, it)))
            .count()
    })?;
    Ok(removed.into_iter().map(|(_, count)| count).sum())
}

/// `EXISTS key...`; repeated keys are counted every time they appear.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling.
pub fn exists(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    keys: Vec<Vec<u8>>,
) -> DflyResult<usize> {
    let mut tx = Transaction::for_keys(shard_set, cntx.db_index, LockMode::Shared, keys, 1)?;
    let found = tx.schedule_single_hop_with(|plan, shard| {
        plan.shard_keys(shard.shard_id())
            .filter(|key| shard.db_slice().find(plan.db_index(), key).is_ok())
            .count()
    })?;
    Ok(found.into_iter().map(|(_, count)| count).sum())
}

/// `PEXPIREAT key at_ms`; `at_ms` at or before the logical clock deletes the key.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling. The inner result is `OpStatus::KeyNotFound`
/// for a missing key.
pub fn pexpire_at(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
    at_ms: u64,
) -> DflyResult<OpResult<()>> {
    let mut tx = Transaction::for_keys(
        shard_set,
        cntx.db_index,
        LockMode::Exclusive,
        vec![key.to_vec()],
        1,
    )?;
    tx.schedule_single_hop_t(move |plan, shard| {
        let db = plan.db_index();
        let key = plan
            .shard_keys(shard.shard_id())
            .next()
            .map(<[u8]>::to_vec)
            .ok_or(OpStatus::KeyNotFound)?;
        let slice = shard.db_slice_mut();
        let it = slice.find(db, &key)?;
        if at_ms <= slice.now() {
            let _ = slice.delete(db, it);
        } else {
            let _ = slice.expire(db, it, at_ms);
        }
        Ok(())
    })
}

/// `FLUSHDB`: empties the database on every shard as one barrier. Returns the removed count.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling.
pub fn flush_db(shard_set: &EngineShardSet, cntx: &CommandContext) -> DflyResult<usize> {
    let mut tx = Transaction::global(shard_set, cntx.db_index);
    let removed = tx.schedule_single_hop_with(|plan, shard| {
        shard.db_slice_mut().flush_db(plan.db_index())
    })?;
    let removed = removed.into_iter().map(|(_, count)| count).sum();
    info!(db = cntx.db_index, removed, "database flushed");
    Ok(removed)
}

/// `DBSIZE`: live and not-yet-swept entries summed over every shard.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling.
pub fn db_size(shard_set: &EngineShardSet, cntx: &CommandContext) -> DflyResult<usize> {
    let mut tx = Transaction::global(shard_set, cntx.db_index);
    let sizes = tx.schedule_single_hop_with(|plan, shard| shard.db_size(plan.db_index()))?;
    Ok(sizes.into_iter().map(|(_, size)| size).sum())
}

/// Removes up to `limit_per_shard` expired entries from every shard.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling.
pub fn sweep_expired(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    limit_per_shard: usize,
) -> DflyResult<usize> {
    let mut tx = Transaction::global(shard_set, cntx.db_index);
    let swept = tx.schedule_single_hop_with(move |plan, shard| {
        shard
            .db_slice_mut()
            .delete_expired_keys(plan.db_index(), limit_per_shard)
    })?;
    let swept = swept.into_iter().map(|(_, count)| count).sum();
    debug!(db = cntx.db_index, swept, "expired keys swept");
    Ok(swept)
}
