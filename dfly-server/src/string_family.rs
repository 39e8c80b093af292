//! String commands at the operation level.
//!
//! Every command builds one transaction over its keys and hands shard-local `op_*` functions to
//! the touched shards. Reply formatting is left to the protocol layer; commands return the
//! aggregated operation outcome.

use std::borrow::Cow;

use dfly_common::error::{DflyResult, OpResult, OpStatus};
use dfly_common::ids::DbIndex;
use dfly_storage::{DbSlice, EntryHandle, ObjType, ObjectValue};
use dfly_transaction::{EngineShard, EngineShardSet, LockMode, Transaction, TransactionPlan};
use tracing::{debug, error, trace};

use crate::context::{CommandContext, Protocol};

/// Largest string `SETRANGE` may produce.
pub const MAX_STR_LEN: usize = 1 << 28;

/// Relative expiries must stay below this many seconds (about eight and a half years).
pub const MAX_EXPIRE_DEADLINE_SEC: u64 = (1 << 28) - 1;

const MAX_EXPIRE_DEADLINE_MS: u64 = MAX_EXPIRE_DEADLINE_SEC * 1_000;

/// Existence condition of a `SET`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    /// Unconditional.
    #[default]
    Always,
    /// `NX`: only when the key is absent.
    IfNotExist,
    /// `XX`: only when the key exists.
    IfExists,
}

/// Options of one `SET`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetParams {
    /// Target database.
    pub db_index: DbIndex,
    /// Existence condition.
    pub how: SetCondition,
    /// Relative expiry; `0` means none.
    pub expire_after_ms: u64,
    /// Memcache flags to store with the value.
    pub memcache_flags: u32,
    /// `KEEPTTL`: leave an existing expiry alone when no new one is given.
    pub keep_ttl: bool,
    /// Capture the previous string value (`GETSET`, `SET ... GET`).
    pub return_previous: bool,
}

impl SetParams {
    /// Defaults for a connection: its database and memcache flags.
    #[must_use]
    pub fn from_context(cntx: &CommandContext) -> Self {
        Self {
            db_index: cntx.db_index,
            memcache_flags: cntx.memcache_flag,
            ..Self::default()
        }
    }
}

/// Shard-local `SET` over one `DbSlice`.
#[derive(Debug)]
pub struct SetCmd<'s> {
    db_slice: &'s mut DbSlice,
}

impl<'s> SetCmd<'s> {
    /// Wraps the shard keyspace.
    pub fn new(db_slice: &'s mut DbSlice) -> Self {
        Self { db_slice }
    }

    /// Stores `value` under `key` and returns the previous string when requested.
    ///
    /// # Errors
    ///
    /// Returns `OpStatus::Skipped` when the existence condition fails, `OpStatus::WrongType`
    /// when a previous value was requested from a non-string key and `OpStatus::OutOfRange`
    /// when the expiry reaches [`MAX_EXPIRE_DEADLINE_SEC`].
    pub fn set(
        &mut self,
        params: &SetParams,
        key: &[u8],
        value: &[u8],
    ) -> OpResult<Option<Vec<u8>>> {
        let db = params.db_index;
        let slice = &mut *self.db_slice;
        trace!(shard = slice.shard_id(), db, "set");

        let at_ms = match params.expire_after_ms {
            0 => 0,
            after_ms if after_ms >= MAX_EXPIRE_DEADLINE_MS => return Err(OpStatus::OutOfRange),
            after_ms => after_ms
                .checked_add(slice.now())
                .ok_or(OpStatus::OutOfRange)?,
        };
        let (it, expire_it) = slice.find_ext(db, key);

        if it.is_valid() {
            if params.how == SetCondition::IfNotExist {
                return Err(OpStatus::Skipped);
            }
            let previous = if params.return_previous {
                Some(string_bytes(slice, db, it)?.into_owned())
            } else {
                None
            };

            if expire_it.is_valid() && at_ms != 0 {
                let _ = slice.set_expire_at(db, expire_it, at_ms);
            } else if at_ms != 0 || !params.keep_ttl {
                let _ = slice.expire(db, it, at_ms);
            }

            slice.pre_update(db, it);
            if slice.get_mc_flag(db, it) != params.memcache_flags {
                slice.set_mc_flag(db, it, params.memcache_flags);
            }
            if let Some(stored) = slice.value_mut(db, it) {
                stored.set_string(value.to_vec());
            }
            slice.post_update(db, it);
            return Ok(previous);
        }

        if params.how == SetCondition::IfExists {
            return Err(OpStatus::Skipped);
        }
        let it = slice.add_new(db, key, ObjectValue::from_bytes(value.to_vec()), at_ms);
        if params.memcache_flags != 0 {
            slice.set_mc_flag(db, it, params.memcache_flags);
        }
        Ok(None)
    }
}

/// One `MGET` hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MGetEntry {
    /// Stored string.
    pub value: Vec<u8>,
    /// Memcache flags, when requested.
    pub mc_flag: u32,
    /// Entry version used as CAS token, when requested.
    pub mc_ver: u64,
}

fn string_bytes<'a>(slice: &'a DbSlice, db: DbIndex, it: EntryHandle) -> OpResult<Cow<'a, [u8]>> {
    slice
        .value(db, it)
        .ok_or(OpStatus::KeyNotFound)?
        .string_bytes()
        .ok_or(OpStatus::WrongType)
}

/// Reads a string key.
///
/// # Errors
///
/// Returns `OpStatus::KeyNotFound` or `OpStatus::WrongType`.
pub fn op_get(slice: &DbSlice, db: DbIndex, key: &[u8]) -> OpResult<Vec<u8>> {
    let it = slice.find_typed(db, key, ObjType::String)?;
    Ok(string_bytes(slice, db, it)?.into_owned())
}

/// Length of a string key.
///
/// # Errors
///
/// Returns `OpStatus::KeyNotFound` or `OpStatus::WrongType`.
pub fn op_strlen(slice: &DbSlice, db: DbIndex, key: &[u8]) -> OpResult<usize> {
    let it = slice.find_typed(db, key, ObjType::String)?;
    slice
        .value(db, it)
        .map(ObjectValue::size)
        .ok_or(OpStatus::KeyNotFound)
}

/// Adds `delta` to an integer string, creating it when absent unless `skip_on_missing`.
///
/// # Errors
///
/// Returns `OpStatus::KeyNotFound` for a missing key with `skip_on_missing`,
/// `OpStatus::WrongType`, `OpStatus::InvalidValue` for non-integer strings, and
/// `OpStatus::OutOfRange` on overflow; failures leave value and version untouched.
pub fn op_incr_by(
    slice: &mut DbSlice,
    db: DbIndex,
    key: &[u8],
    delta: i64,
    skip_on_missing: bool,
) -> OpResult<i64> {
    let (it, _) = slice.find_ext(db, key);
    if !it.is_valid() {
        if skip_on_missing {
            return Err(OpStatus::KeyNotFound);
        }
        let _ = slice.add_new(db, key, ObjectValue::Int(delta), 0);
        return Ok(delta);
    }

    let current = slice.value(db, it).ok_or(OpStatus::KeyNotFound)?;
    if current.obj_type() != ObjType::String {
        return Err(OpStatus::WrongType);
    }
    let previous = current.try_get_int().ok_or(OpStatus::InvalidValue)?;
    let next = previous.checked_add(delta).ok_or(OpStatus::OutOfRange)?;
    let _ = slice.update(db, it, |stored| stored.set_int(next));
    Ok(next)
}

fn join_extension(current: &[u8], extension: &[u8], prepend: bool) -> Vec<u8> {
    if prepend {
        [extension, current].concat()
    } else {
        [current, extension].concat()
    }
}

/// `APPEND`/`PREPEND` for Redis clients: creates the key when absent. Returns the new length.
///
/// # Errors
///
/// Returns `OpStatus::WrongType` for non-string keys.
pub fn op_extend_or_set(
    slice: &mut DbSlice,
    db: DbIndex,
    key: &[u8],
    extension: &[u8],
    prepend: bool,
) -> OpResult<usize> {
    let (it, inserted) = slice.add_or_find(db, key);
    if inserted {
        let _ = slice.update(db, it, |stored| stored.set_string(extension.to_vec()));
        return Ok(extension.len());
    }
    let joined = join_extension(&string_bytes(slice, db, it)?, extension, prepend);
    let length = joined.len();
    let _ = slice.update(db, it, |stored| stored.set_string(joined));
    Ok(length)
}

/// `APPEND`/`PREPEND` for memcache clients: never creates keys. Returns the new length.
///
/// # Errors
///
/// Returns `OpStatus::Skipped` when the key is missing or not a string.
pub fn op_extend_or_skip(
    slice: &mut DbSlice,
    db: DbIndex,
    key: &[u8],
    extension: &[u8],
    prepend: bool,
) -> OpResult<usize> {
    let it = slice
        .find_typed(db, key, ObjType::String)
        .map_err(|_| OpStatus::Skipped)?;
    let joined = join_extension(&string_bytes(slice, db, it)?, extension, prepend);
    let length = joined.len();
    let _ = slice.update(db, it, |stored| stored.set_string(joined));
    Ok(length)
}

/// Substring with inclusive, possibly negative bounds. Missing keys read as empty.
///
/// # Errors
///
/// Returns `OpStatus::WrongType` for non-string keys.
pub fn op_get_range(
    slice: &DbSlice,
    db: DbIndex,
    key: &[u8],
    start: i32,
    end: i32,
) -> OpResult<Vec<u8>> {
    let it = match slice.find_typed(db, key, ObjType::String) {
        Ok(it) => it,
        Err(OpStatus::KeyNotFound) => return Ok(Vec::new()),
        Err(status) => return Err(status),
    };
    let bytes = string_bytes(slice, db, it)?;
    let length = i64::try_from(bytes.len()).map_err(|_| OpStatus::OutOfRange)?;
    let mut start = i64::from(start);
    let mut end = i64::from(end);
    if start < 0 {
        start += length;
    }
    if end < 0 {
        end += length;
    }
    if length == 0 || start > end || start >= length {
        return Ok(Vec::new());
    }
    let start = usize::try_from(start.max(0)).map_err(|_| OpStatus::OutOfRange)?;
    let end = usize::try_from(end.clamp(0, length - 1)).map_err(|_| OpStatus::OutOfRange)?;
    Ok(bytes[start..=end].to_vec())
}

/// Overwrites part of a string starting at `offset`, zero-padding as needed. Returns the new
/// length.
///
/// # Errors
///
/// Returns `OpStatus::OutOfRange` when the result would exceed [`MAX_STR_LEN`],
/// `OpStatus::WrongType` for non-string keys, and `OpStatus::KeyNotFound` for an empty write
/// to a missing key.
pub fn op_set_range(
    slice: &mut DbSlice,
    db: DbIndex,
    key: &[u8],
    offset: usize,
    value: &[u8],
) -> OpResult<usize> {
    let min_size = offset
        .checked_add(value.len())
        .filter(|size| *size <= MAX_STR_LEN)
        .ok_or(OpStatus::OutOfRange)?;
    if min_size == 0 {
        return op_strlen(slice, db, key);
    }

    let (it, added) = slice.add_or_find(db, key);
    let mut bytes = if added {
        Vec::with_capacity(min_size)
    } else {
        string_bytes(slice, db, it)?.into_owned()
    };
    if bytes.len() < min_size {
        bytes.resize(min_size, 0);
    }
    bytes[offset..min_size].copy_from_slice(value);
    let length = bytes.len();
    let _ = slice.update(db, it, |stored| stored.set_string(bytes));
    Ok(length)
}

/// Reads `keys`; misses and non-strings are `None`.
#[must_use]
pub fn op_mget(
    slice: &DbSlice,
    db: DbIndex,
    keys: &[Vec<u8>],
    fetch_mcflag: bool,
    fetch_mcver: bool,
) -> Vec<Option<MGetEntry>> {
    keys.iter()
        .map(|key| {
            let it = slice.find_typed(db, key, ObjType::String).ok()?;
            let value = string_bytes(slice, db, it).ok()?.into_owned();
            let mc_flag = if fetch_mcflag { slice.get_mc_flag(db, it) } else { 0 };
            let mc_ver = if fetch_mcflag && fetch_mcver {
                slice.get_version(db, it).unwrap_or_default()
            } else {
                0
            };
            Some(MGetEntry {
                value,
                mc_flag,
                mc_ver,
            })
        })
        .collect()
}

/// Writes `key value` pairs through `writer`, logging and skipping pairs that fail.
///
/// Returns the number of pairs written.
pub fn op_mset_with<W>(slice: &mut DbSlice, db: DbIndex, args: &[Vec<u8>], mut writer: W) -> usize
where
    W: FnMut(&mut DbSlice, &[u8], &[u8]) -> OpResult<()>,
{
    debug_assert!(args.len() % 2 == 0, "mset arguments come in pairs");
    let mut written = 0;
    for pair in args.chunks_exact(2) {
        match writer(slice, &pair[0], &pair[1]) {
            Ok(()) => written += 1,
            Err(status) => {
                error!(shard = slice.shard_id(), db, %status, "unexpected mset failure");
            }
        }
    }
    written
}

/// Writes `key value` pairs with plain `SET` semantics.
pub fn op_mset(slice: &mut DbSlice, db: DbIndex, args: &[Vec<u8>]) -> usize {
    let params = SetParams {
        db_index: db,
        ..SetParams::default()
    };
    op_mset_with(slice, db, args, |slice, key, value| {
        SetCmd::new(slice).set(&params, key, value).map(|_| ())
    })
}

fn shard_args<'p>(plan: &'p TransactionPlan, shard: &EngineShard) -> &'p [Vec<u8>] {
    plan.shard_args_in_shard(shard.shard_id())
}

fn read_one<'s>(
    shard_set: &'s EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
) -> DflyResult<Transaction<'s>> {
    Transaction::for_keys(
        shard_set,
        cntx.db_index,
        LockMode::Shared,
        vec![key.to_vec()],
        1,
    )
}

fn single_key<'p>(plan: &'p TransactionPlan, shard: &EngineShard) -> OpResult<&'p [u8]> {
    shard_args(plan, shard)
        .first()
        .map(Vec::as_slice)
        .ok_or(OpStatus::KeyNotFound)
}

/// `SET key value [NX|XX] [PX ms] [KEEPTTL]`.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling; the inner result carries `Skipped` for a
/// failed condition.
pub fn set(
    shard_set: &EngineShardSet,
    key: &[u8],
    value: &[u8],
    params: SetParams,
) -> DflyResult<OpResult<()>> {
    let mut tx = Transaction::for_keys(
        shard_set,
        params.db_index,
        LockMode::Exclusive,
        vec![key.to_vec(), value.to_vec()],
        2,
    )?;
    tx.schedule_single_hop(move |plan, shard| {
        let [key, value] = shard_args(plan, shard) else {
            return Err(OpStatus::KeyNotFound);
        };
        SetCmd::new(shard.db_slice_mut())
            .set(&params, key, value)
            .map(|_| ())
    })
}

/// `SETEX`/`PSETEX`: unconditional set with a mandatory positive expiry.
///
/// # Errors
///
/// The inner result is `OpStatus::InvalidValue` for a non-positive expiry and
/// `OpStatus::OutOfRange` for one reaching [`MAX_EXPIRE_DEADLINE_SEC`].
pub fn set_ex(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
    value: &[u8],
    amount: i64,
    in_seconds: bool,
) -> DflyResult<OpResult<()>> {
    let Some(amount) = u64::try_from(amount).ok().filter(|amount| *amount > 0) else {
        return Ok(Err(OpStatus::InvalidValue));
    };
    let expire_after_ms = if in_seconds {
        amount.saturating_mul(1_000)
    } else {
        amount
    };
    if expire_after_ms >= MAX_EXPIRE_DEADLINE_MS {
        return Ok(Err(OpStatus::OutOfRange));
    }
    let params = SetParams {
        expire_after_ms,
        ..SetParams::from_context(cntx)
    };
    set(shard_set, key, value, params)
}

/// `GET key`.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling.
pub fn get(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
) -> DflyResult<OpResult<Vec<u8>>> {
    let mut tx = read_one(shard_set, cntx, key)?;
    let result = tx.schedule_single_hop_t(|plan, shard| {
        op_get(shard.db_slice(), plan.db_index(), single_key(plan, shard)?)
    })?;
    debug!(tx = %tx.debug_id(), found = result.is_ok(), "get");
    Ok(result)
}

/// `GETSET key value`: stores `value` and returns the previous string.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling. The inner result is `OpStatus::WrongType`
/// when the key holds another type.
pub fn get_set(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
    value: &[u8],
) -> DflyResult<OpResult<Option<Vec<u8>>>> {
    let params = SetParams {
        return_previous: true,
        ..SetParams::from_context(cntx)
    };
    let mut tx = Transaction::for_keys(
        shard_set,
        cntx.db_index,
        LockMode::Exclusive,
        vec![key.to_vec(), value.to_vec()],
        2,
    )?;
    tx.schedule_single_hop_t(move |plan, shard| {
        let [key, value] = shard_args(plan, shard) else {
            return Err(OpStatus::KeyNotFound);
        };
        SetCmd::new(shard.db_slice_mut()).set(&params, key, value)
    })
}

/// `INCRBY key delta`; memcache clients never create missing keys.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling.
pub fn incr_by(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
    delta: i64,
) -> DflyResult<OpResult<i64>> {
    let skip_on_missing = cntx.protocol == Protocol::Memcache;
    let mut tx = Transaction::for_keys(
        shard_set,
        cntx.db_index,
        LockMode::Exclusive,
        vec![key.to_vec()],
        1,
    )?;
    tx.schedule_single_hop_t(move |plan, shard| {
        let key = single_key(plan, shard)?;
        op_incr_by(shard.db_slice_mut(), plan.db_index(), key, delta, skip_on_missing)
    })
}

/// `INCR key`.
///
/// # Errors
///
/// Same as [`incr_by`].
pub fn incr(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
) -> DflyResult<OpResult<i64>> {
    incr_by(shard_set, cntx, key, 1)
}

/// `DECRBY key delta`.
///
/// # Errors
///
/// Same as [`incr_by`]; negating `i64::MIN` reports `OpStatus::OutOfRange`.
pub fn decr_by(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
    delta: i64,
) -> DflyResult<OpResult<i64>> {
    match delta.checked_neg() {
        Some(negated) => incr_by(shard_set, cntx, key, negated),
        None => Ok(Err(OpStatus::OutOfRange)),
    }
}

/// `DECR key`.
///
/// # Errors
///
/// Same as [`incr_by`].
pub fn decr(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
) -> DflyResult<OpResult<i64>> {
    incr_by(shard_set, cntx, key, -1)
}

fn extend(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
    extension: &[u8],
    prepend: bool,
) -> DflyResult<OpResult<usize>> {
    let protocol = cntx.protocol;
    let mut tx = Transaction::for_keys(
        shard_set,
        cntx.db_index,
        LockMode::Exclusive,
        vec![key.to_vec(), extension.to_vec()],
        2,
    )?;
    tx.schedule_single_hop_t(move |plan, shard| {
        let [key, extension] = shard_args(plan, shard) else {
            return Err(OpStatus::KeyNotFound);
        };
        let db = plan.db_index();
        match protocol {
            Protocol::Redis => op_extend_or_set(shard.db_slice_mut(), db, key, extension, prepend),
            Protocol::Memcache => {
                op_extend_or_skip(shard.db_slice_mut(), db, key, extension, prepend)
            }
        }
    })
}

/// `APPEND key value`. Memcache clients get `OpStatus::Skipped` for missing keys.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling.
pub fn append(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
    value: &[u8],
) -> DflyResult<OpResult<usize>> {
    extend(shard_set, cntx, key, value, false)
}

/// `PREPEND key value`.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling.
pub fn prepend(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
    value: &[u8],
) -> DflyResult<OpResult<usize>> {
    extend(shard_set, cntx, key, value, true)
}

/// `STRLEN key`; missing keys have length zero.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling.
pub fn str_len(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
) -> DflyResult<OpResult<usize>> {
    let mut tx = read_one(shard_set, cntx, key)?;
    let result = tx.schedule_single_hop_t(|plan, shard| {
        op_strlen(shard.db_slice(), plan.db_index(), single_key(plan, shard)?)
    })?;
    Ok(match result {
        Err(OpStatus::KeyNotFound) => Ok(0),
        other => other,
    })
}

/// `GETRANGE key start end`.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling.
pub fn get_range(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
    start: i32,
    end: i32,
) -> DflyResult<OpResult<Vec<u8>>> {
    let mut tx = read_one(shard_set, cntx, key)?;
    tx.schedule_single_hop_t(move |plan, shard| {
        op_get_range(shard.db_slice(), plan.db_index(), single_key(plan, shard)?, start, end)
    })
}

/// `SETRANGE key offset value`; an empty write to a missing key reports length zero.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling. The inner result is `OpStatus::OutOfRange`
/// for a negative offset or an oversized result.
pub fn set_range(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    key: &[u8],
    offset: i64,
    value: &[u8],
) -> DflyResult<OpResult<usize>> {
    let Ok(offset) = usize::try_from(offset) else {
        return Ok(Err(OpStatus::OutOfRange));
    };
    if offset.saturating_add(value.len()) > MAX_STR_LEN {
        return Ok(Err(OpStatus::OutOfRange));
    }
    let mut tx = Transaction::for_keys(
        shard_set,
        cntx.db_index,
        LockMode::Exclusive,
        vec![key.to_vec(), value.to_vec()],
        2,
    )?;
    let result = tx.schedule_single_hop_t(move |plan, shard| {
        let [key, value] = shard_args(plan, shard) else {
            return Err(OpStatus::KeyNotFound);
        };
        op_set_range(shard.db_slice_mut(), plan.db_index(), key, offset, value)
    })?;
    Ok(match result {
        Err(OpStatus::KeyNotFound) => Ok(0),
        other => other,
    })
}

/// `MGET key...`; results follow the argument order.
///
/// Reads take shared intents, so a writer that updated `x` and then `y` is never observed with
/// the new `y` but the old `x`.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling.
pub fn mget(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    keys: Vec<Vec<u8>>,
) -> DflyResult<Vec<Option<MGetEntry>>> {
    let fetch_mcflag = cntx.protocol == Protocol::Memcache;
    let fetch_mcver = fetch_mcflag && cntx.fetch_cas_version;
    let key_count = keys.len();
    let mut tx = Transaction::for_keys(shard_set, cntx.db_index, LockMode::Shared, keys, 1)?;
    let per_shard = tx.schedule_single_hop_with(move |plan, shard| {
        op_mget(
            shard.db_slice(),
            plan.db_index(),
            shard_args(plan, shard),
            fetch_mcflag,
            fetch_mcver,
        )
    })?;

    let mut ordered = vec![None; key_count];
    for (shard, entries) in per_shard {
        for (position, entry) in entries.into_iter().enumerate() {
            if let Some(original) = tx.reverse_arg_index(shard, position) {
                ordered[original] = entry;
            }
        }
    }
    Ok(ordered)
}

/// `MSET key value ...`; individual failures are logged and never abort the batch.
///
/// # Errors
///
/// Returns `DflyError::InvalidState` for an odd argument count and infrastructure errors from
/// scheduling.
pub fn mset(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    args: Vec<Vec<u8>>,
) -> DflyResult<()> {
    let mut tx = Transaction::for_keys(shard_set, cntx.db_index, LockMode::Exclusive, args, 2)?;
    debug!(shards = tx.unique_shard_cnt(), "mset");
    let _ = tx.schedule_single_hop(|plan, shard| {
        let args = shard_args(plan, shard);
        let _ = op_mset(shard.db_slice_mut(), plan.db_index(), args);
        Ok(())
    })?;
    Ok(())
}

/// `MSETNX key value ...`: writes every pair only when none of the keys exists.
///
/// The first hop checks existence on every shard; its aggregated answer decides what the
/// second, final hop does.
///
/// # Errors
///
/// Returns infrastructure errors from scheduling. The inner result is `OpStatus::Skipped` when
/// some key already existed, in which case nothing was written.
pub fn mset_nx(
    shard_set: &EngineShardSet,
    cntx: &CommandContext,
    args: Vec<Vec<u8>>,
) -> DflyResult<OpResult<()>> {
    let mut tx = Transaction::for_keys(shard_set, cntx.db_index, LockMode::Exclusive, args, 2)?;
    tx.schedule()?;

    let existing = tx.execute(
        |plan, shard| {
            plan.shard_keys(shard.shard_id())
                .any(|key| shard.db_slice().find(plan.db_index(), key).is_ok())
        },
        false,
    )?;
    let to_skip = existing.iter().any(|(_, exists)| *exists);

    let _ = tx.execute(
        move |plan, shard| {
            if !to_skip {
                let args = shard_args(plan, shard);
                let _ = op_mset(shard.db_slice_mut(), plan.db_index(), args);
            }
        },
        true,
    )?;
    Ok(if to_skip { Err(OpStatus::Skipped) } else { Ok(()) })
}
