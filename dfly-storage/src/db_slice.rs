//! Shard-local keyspace: an array of logical databases with lazy expiry and entry versioning.
//!
//! A `DbSlice` is owned by exactly one shard worker and is never shared, so every method takes
//! plain `&self`/`&mut self`. Expired entries are invisible to lookups as soon as the logical clock
//! reaches their deadline; they are physically removed only by mutating lookups, explicit deletes
//! or [`DbSlice::delete_expired_keys`].

use dfly_common::error::{OpResult, OpStatus};
use dfly_common::ids::{DbIndex, ShardId};
use dfly_core::containers::HotMap;
use tracing::{debug, error, trace};

use crate::snapshot::{SnapshotRecord, SnapshotState};
use crate::table::{PrimeEntry, PrimeTable, SlotRef};
use crate::value::{ObjType, ObjectValue};

/// Handle to a live primary entry, or the end sentinel.
///
/// Handles stay valid until the entry is deleted; a handle to a deleted entry never resolves to
/// a newer entry that reuses the same storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryHandle {
    slot: Option<SlotRef>,
}

impl EntryHandle {
    /// The end sentinel.
    #[must_use]
    pub fn end() -> Self {
        Self { slot: None }
    }

    fn at(slot: SlotRef) -> Self {
        Self { slot: Some(slot) }
    }

    /// Whether the handle refers to an entry.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.slot.is_some()
    }
}

/// Handle to an expiry record, or the end sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpireHandle {
    slot: Option<SlotRef>,
}

impl ExpireHandle {
    /// The end sentinel.
    #[must_use]
    pub fn end() -> Self {
        Self { slot: None }
    }

    fn at(slot: SlotRef) -> Self {
        Self { slot: Some(slot) }
    }

    /// Whether the handle refers to an expiry record.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.slot.is_some()
    }
}

/// Per-database counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DbStats {
    /// Live entries in the primary table, expired-but-unpurged included.
    pub key_count: usize,
    /// Entries carrying an expiry record.
    pub expire_count: usize,
    /// Entries carrying a protocol flag.
    pub mc_flag_count: usize,
    /// Approximate heap bytes owned by stored values.
    pub obj_memory_usage: usize,
}

#[derive(Debug, Default)]
pub(crate) struct DbTable {
    pub(crate) prime: PrimeTable,
    pub(crate) expire: HotMap<usize, u64>,
    pub(crate) mc_flags: HotMap<Box<[u8]>, u32>,
    obj_memory_usage: usize,
}

/// Shard-local keyspace.
#[derive(Debug)]
pub struct DbSlice {
    shard_id: ShardId,
    now_ms: u64,
    version_watermark: u64,
    db_arr: Vec<Option<DbTable>>,
    update_in_progress: Option<(DbIndex, SlotRef)>,
    snapshot: Option<SnapshotState>,
}

impl DbSlice {
    /// Creates an empty slice for one shard. Database 0 is active from the start.
    #[must_use]
    pub fn new(shard_id: ShardId) -> Self {
        let mut slice = Self {
            shard_id,
            now_ms: 0,
            version_watermark: 0,
            db_arr: Vec::new(),
            update_in_progress: None,
            snapshot: None,
        };
        slice.activate_db(0);
        slice
    }

    /// Owning shard.
    #[must_use]
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Sets the logical clock used for every expiry decision.
    pub fn update_expire_clock(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
    }

    /// Current logical clock.
    #[must_use]
    pub fn now(&self) -> u64 {
        self.now_ms
    }

    /// Creates database `db` if it does not exist yet. Idempotent.
    pub fn activate_db(&mut self, db: DbIndex) {
        let _ = self.materialize(db);
    }

    /// Activates `db` and pre-sizes it for `key_size` additional keys.
    pub fn reserve(&mut self, db: DbIndex, key_size: usize) {
        self.materialize(db).prime.reserve(key_size);
    }

    /// Whether `db` has been activated.
    #[must_use]
    pub fn is_db_valid(&self, db: DbIndex) -> bool {
        self.table(db).is_some()
    }

    /// Length of the database array, including inactive holes.
    #[must_use]
    pub fn db_array_size(&self) -> usize {
        self.db_arr.len()
    }

    /// Number of entries in the primary table of `db`.
    #[must_use]
    pub fn db_size(&self, db: DbIndex) -> usize {
        self.table(db).map_or(0, |table| table.prime.len())
    }

    /// Counters of `db`; zeroes for inactive databases.
    #[must_use]
    pub fn db_stats(&self, db: DbIndex) -> DbStats {
        self.table(db).map_or_else(DbStats::default, |table| DbStats {
            key_count: table.prime.len(),
            expire_count: table.expire.len(),
            mc_flag_count: table.mc_flags.len(),
            obj_memory_usage: table.obj_memory_usage,
        })
    }

    /// Looks up a live key.
    ///
    /// # Errors
    ///
    /// Returns `OpStatus::KeyNotFound` when the key is absent or expired.
    pub fn find(&self, db: DbIndex, key: &[u8]) -> OpResult<EntryHandle> {
        let (it, _) = self.find_ext(db, key);
        if it.is_valid() {
            Ok(it)
        } else {
            Err(OpStatus::KeyNotFound)
        }
    }

    /// Looks up a live key holding a value of `obj_type`.
    ///
    /// # Errors
    ///
    /// Returns `OpStatus::KeyNotFound` when the key is absent or expired and
    /// `OpStatus::WrongType` when it holds another type.
    pub fn find_typed(&self, db: DbIndex, key: &[u8], obj_type: ObjType) -> OpResult<EntryHandle> {
        let it = self.find(db, key)?;
        match self.value(db, it) {
            Some(value) if value.obj_type() == obj_type => Ok(it),
            Some(_) => Err(OpStatus::WrongType),
            None => Err(OpStatus::KeyNotFound),
        }
    }

    /// Looks up a live key together with its expiry record.
    ///
    /// Expired keys yield two end handles. Nothing is removed.
    #[must_use]
    pub fn find_ext(&self, db: DbIndex, key: &[u8]) -> (EntryHandle, ExpireHandle) {
        let Some(table) = self.table(db) else {
            return (EntryHandle::end(), ExpireHandle::end());
        };
        let Some(slot) = table.prime.find(key) else {
            return (EntryHandle::end(), ExpireHandle::end());
        };
        match table.expire.get(&slot.index()) {
            Some(&at_ms) if at_ms <= self.now_ms => (EntryHandle::end(), ExpireHandle::end()),
            Some(_) => (EntryHandle::at(slot), ExpireHandle::at(slot)),
            None => (EntryHandle::at(slot), ExpireHandle::end()),
        }
    }

    /// Returns the live entry for `key`, inserting an empty string entry when absent.
    ///
    /// The flag is `true` when the entry was inserted. An expired entry is purged first and
    /// counts as absent.
    pub fn add_or_find(&mut self, db: DbIndex, key: &[u8]) -> (EntryHandle, bool) {
        let _ = self.materialize(db);
        let _ = self.purge_if_expired(db, key);
        if let Some(slot) = self.table(db).and_then(|table| table.prime.find(key)) {
            return (EntryHandle::at(slot), false);
        }
        (self.insert_entry(db, key, ObjectValue::default(), 0), true)
    }

    /// Inserts a key that the caller knows is absent. `expire_at_ms == 0` means no expiry.
    ///
    /// Inserting a live key is a contract violation; release builds replace the old entry.
    pub fn add_new(
        &mut self,
        db: DbIndex,
        key: &[u8],
        value: ObjectValue,
        expire_at_ms: u64,
    ) -> EntryHandle {
        let _ = self.materialize(db);
        let _ = self.purge_if_expired(db, key);
        if let Some(slot) = self.table(db).and_then(|table| table.prime.find(key)) {
            debug_assert!(false, "add_new called for an existing key");
            error!(shard = self.shard_id, db, "add_new called for an existing key");
            let _ = self.remove_slot(db, slot);
        }
        self.insert_entry(db, key, value, expire_at_ms)
    }

    /// Inserts `key` only when no live entry exists. Returns whether it was inserted.
    pub fn add_if_not_exist(
        &mut self,
        db: DbIndex,
        key: &[u8],
        value: ObjectValue,
        expire_at_ms: u64,
    ) -> bool {
        let _ = self.materialize(db);
        let _ = self.purge_if_expired(db, key);
        if self.table(db).and_then(|table| table.prime.find(key)).is_some() {
            return false;
        }
        let _ = self.insert_entry(db, key, value, expire_at_ms);
        true
    }

    /// Sets (`at_ms != 0`) or removes (`at_ms == 0`) the expiry of an entry.
    ///
    /// Returns `false` when nothing changed. Entry versions are left untouched.
    pub fn expire(&mut self, db: DbIndex, it: EntryHandle, at_ms: u64) -> bool {
        let Some(slot) = it.slot else {
            return false;
        };
        self.preserve_for_snapshot(db, slot);
        let Some(table) = self.table_mut(db) else {
            return false;
        };
        let current = table.expire.get(&slot.index()).copied();
        let Some(entry) = table.prime.get_mut(slot) else {
            return false;
        };
        if at_ms == 0 {
            if current.is_none() {
                return false;
            }
            entry.has_expire = false;
            let _ = table.expire.remove(&slot.index());
            return true;
        }
        if current == Some(at_ms) {
            return false;
        }
        entry.has_expire = true;
        let _ = table.expire.insert(slot.index(), at_ms);
        true
    }

    /// Absolute expiry carried by an expiry record.
    #[must_use]
    pub fn expire_time(&self, db: DbIndex, exp: ExpireHandle) -> Option<u64> {
        let slot = exp.slot?;
        self.table(db)?.expire.get(&slot.index()).copied()
    }

    /// Rewrites an existing expiry record. `at_ms == 0` removes it.
    pub fn set_expire_at(&mut self, db: DbIndex, exp: ExpireHandle, at_ms: u64) -> bool {
        match exp.slot {
            Some(slot) => self.expire(db, EntryHandle::at(slot), at_ms),
            None => false,
        }
    }

    /// Removes an entry with its expiry record and flag. Returns whether it existed.
    pub fn delete(&mut self, db: DbIndex, it: EntryHandle) -> bool {
        it.slot.is_some_and(|slot| self.remove_slot(db, slot))
    }

    /// Removes every entry of `db`, keeping the database active. Returns the removed count.
    pub fn flush_db(&mut self, db: DbIndex) -> usize {
        if let (Some(snapshot), Some(table)) = (
            self.snapshot.as_mut(),
            self.db_arr.get(usize::from(db)).and_then(Option::as_ref),
        ) {
            let slots = table.prime.iter().map(|(slot, _, _)| slot).collect::<Vec<_>>();
            for slot in slots {
                snapshot.preserve(db, slot, table);
            }
        }
        let Some(table) = self.table_mut(db) else {
            return 0;
        };
        let removed = table.prime.clear();
        table.expire.clear();
        table.mc_flags.clear();
        table.obj_memory_usage = 0;
        debug!(shard = self.shard_id, db, removed, "flushed database");
        removed
    }

    /// Removes up to `limit` entries of `db` whose expiry has been reached.
    pub fn delete_expired_keys(&mut self, db: DbIndex, limit: usize) -> usize {
        let now_ms = self.now_ms;
        let Some(table) = self.table(db) else {
            return 0;
        };
        let expired = table
            .expire
            .iter()
            .filter(|&(_, &at_ms)| at_ms <= now_ms)
            .filter_map(|(&index, _)| table.prime.slot_ref(index))
            .take(limit)
            .collect::<Vec<_>>();
        let mut removed = 0;
        for slot in expired {
            if self.remove_slot(db, slot) {
                removed += 1;
            }
        }
        if removed > 0 {
            trace!(shard = self.shard_id, db, removed, "deleted expired keys");
        }
        removed
    }

    /// Opens the update bracket for an entry about to be mutated in place.
    ///
    /// Every `pre_update` must be followed by exactly one [`DbSlice::post_update`] for the same
    /// entry before any other bracket opens.
    pub fn pre_update(&mut self, db: DbIndex, it: EntryHandle) {
        let Some(slot) = it.slot else {
            debug_assert!(false, "pre_update on end handle");
            return;
        };
        debug_assert!(
            self.update_in_progress.is_none(),
            "nested pre_update brackets"
        );
        self.preserve_for_snapshot(db, slot);
        if let Some(table) = self.table_mut(db)
            && let Some(used) = table.prime.get(slot).map(|(_, entry)| entry.value.malloc_used())
        {
            table.obj_memory_usage = table.obj_memory_usage.saturating_sub(used);
        }
        self.update_in_progress = Some((db, slot));
    }

    /// Closes the update bracket: accounts the new value size and bumps the entry version.
    pub fn post_update(&mut self, db: DbIndex, it: EntryHandle) {
        let Some(slot) = it.slot else {
            debug_assert!(false, "post_update on end handle");
            return;
        };
        debug_assert_eq!(
            self.update_in_progress,
            Some((db, slot)),
            "post_update without matching pre_update"
        );
        self.update_in_progress = None;
        let bumped = self.table_mut(db).and_then(|table| {
            let entry = table.prime.get_mut(slot)?;
            entry.version += 1;
            let version = entry.version;
            let used = entry.value.malloc_used();
            table.obj_memory_usage += used;
            Some(version)
        });
        if let Some(version) = bumped {
            self.version_watermark = self.version_watermark.max(version);
        }
    }

    /// Mutates an entry value inside a full update bracket.
    pub fn update<R>(
        &mut self,
        db: DbIndex,
        it: EntryHandle,
        mutate: impl FnOnce(&mut ObjectValue) -> R,
    ) -> Option<R> {
        it.slot?;
        self.pre_update(db, it);
        let result = self.value_mut(db, it).map(mutate);
        self.post_update(db, it);
        result
    }

    /// Entry behind a handle.
    #[must_use]
    pub fn entry(&self, db: DbIndex, it: EntryHandle) -> Option<&PrimeEntry> {
        let slot = it.slot?;
        self.table(db)?.prime.get(slot).map(|(_, entry)| entry)
    }

    /// Key behind a handle.
    #[must_use]
    pub fn key(&self, db: DbIndex, it: EntryHandle) -> Option<&[u8]> {
        let slot = it.slot?;
        self.table(db)?.prime.get(slot).map(|(key, _)| key)
    }

    /// Value behind a handle.
    #[must_use]
    pub fn value(&self, db: DbIndex, it: EntryHandle) -> Option<&ObjectValue> {
        self.entry(db, it).map(PrimeEntry::value)
    }

    /// Mutable value behind a handle. Only valid inside an update bracket.
    pub fn value_mut(&mut self, db: DbIndex, it: EntryHandle) -> Option<&mut ObjectValue> {
        let slot = it.slot?;
        debug_assert_eq!(
            self.update_in_progress,
            Some((db, slot)),
            "value mutated outside an update bracket"
        );
        self.table_mut(db)?
            .prime
            .get_mut(slot)
            .map(|entry| &mut entry.value)
    }

    /// Current version of an entry.
    #[must_use]
    pub fn get_version(&self, db: DbIndex, it: EntryHandle) -> Option<u64> {
        self.entry(db, it).map(PrimeEntry::version)
    }

    /// Records a protocol flag on an entry; `0` clears it.
    pub fn set_mc_flag(&mut self, db: DbIndex, it: EntryHandle, flag: u32) {
        let Some(slot) = it.slot else {
            return;
        };
        let Some(table) = self.table_mut(db) else {
            return;
        };
        let Some(key) = table.prime.get(slot).map(|(key, _)| Box::<[u8]>::from(key)) else {
            return;
        };
        if flag == 0 {
            let _ = table.mc_flags.remove(&key);
        } else {
            let _ = table.mc_flags.insert(key, flag);
        }
        if let Some(entry) = table.prime.get_mut(slot) {
            entry.has_mc_flag = flag != 0;
        }
    }

    /// Protocol flag of an entry, `0` when none is recorded.
    #[must_use]
    pub fn get_mc_flag(&self, db: DbIndex, it: EntryHandle) -> u32 {
        let Some(slot) = it.slot else {
            return 0;
        };
        let Some(table) = self.table(db) else {
            return 0;
        };
        match table.prime.get(slot) {
            Some((key, entry)) if entry.has_flag() => {
                table.mc_flags.get(key).copied().unwrap_or_default()
            }
            _ => 0,
        }
    }

    /// Starts a point-in-time snapshot of every database. Returns `false` if one is running.
    pub fn begin_snapshot(&mut self) -> bool {
        if self.snapshot.is_some() {
            return false;
        }
        let state = SnapshotState::new(self.version_watermark, self.now_ms);
        debug!(
            shard = self.shard_id,
            start_version = state.start_version(),
            "snapshot started"
        );
        self.snapshot = Some(state);
        true
    }

    /// Emits up to `limit` snapshot records. An empty batch means the snapshot is complete.
    pub fn snapshot_next_batch(&mut self, limit: usize) -> Vec<SnapshotRecord> {
        match self.snapshot.as_mut() {
            Some(snapshot) => snapshot.next_batch(&self.db_arr, limit),
            None => Vec::new(),
        }
    }

    /// Whether a snapshot is running.
    #[must_use]
    pub fn is_snapshot_active(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Whether the running snapshot has emitted everything it owes.
    #[must_use]
    pub fn is_snapshot_exhausted(&self) -> bool {
        self.snapshot
            .as_ref()
            .is_some_and(|snapshot| snapshot.is_exhausted(self.db_arr.len()))
    }

    /// Stops the running snapshot. Returns whether one was running.
    pub fn end_snapshot(&mut self) -> bool {
        let ended = self.snapshot.take().is_some();
        if ended {
            debug!(shard = self.shard_id, "snapshot finished");
        }
        ended
    }

    fn table(&self, db: DbIndex) -> Option<&DbTable> {
        self.db_arr.get(usize::from(db))?.as_ref()
    }

    fn table_mut(&mut self, db: DbIndex) -> Option<&mut DbTable> {
        self.db_arr.get_mut(usize::from(db))?.as_mut()
    }

    fn materialize(&mut self, db: DbIndex) -> &mut DbTable {
        let index = usize::from(db);
        if self.db_arr.len() <= index {
            self.db_arr.resize_with(index + 1, || None);
        }
        let slot = &mut self.db_arr[index];
        if slot.is_none() {
            trace!(shard = self.shard_id, db, "activated database");
        }
        slot.get_or_insert_with(DbTable::default)
    }

    fn next_version(&mut self) -> u64 {
        self.version_watermark += 1;
        self.version_watermark
    }

    fn insert_entry(
        &mut self,
        db: DbIndex,
        key: &[u8],
        value: ObjectValue,
        expire_at_ms: u64,
    ) -> EntryHandle {
        let version = self.next_version();
        let table = self.materialize(db);
        let used = value.malloc_used();
        let mut entry = PrimeEntry::new(value, version);
        entry.has_expire = expire_at_ms != 0;
        let slot = table.prime.insert(key, entry);
        if expire_at_ms != 0 {
            let _ = table.expire.insert(slot.index(), expire_at_ms);
        }
        table.obj_memory_usage += used;
        EntryHandle::at(slot)
    }

    fn purge_if_expired(&mut self, db: DbIndex, key: &[u8]) -> bool {
        let now_ms = self.now_ms;
        let stale = self.table(db).and_then(|table| {
            let slot = table.prime.find(key)?;
            let at_ms = *table.expire.get(&slot.index())?;
            (at_ms <= now_ms).then_some(slot)
        });
        stale.is_some_and(|slot| self.remove_slot(db, slot))
    }

    fn remove_slot(&mut self, db: DbIndex, slot: SlotRef) -> bool {
        self.preserve_for_snapshot(db, slot);
        let Some(table) = self.table_mut(db) else {
            return false;
        };
        let Some((key, entry)) = table.prime.remove(slot) else {
            return false;
        };
        let _ = table.expire.remove(&slot.index());
        if entry.has_flag() {
            let _ = table.mc_flags.remove(&key);
        }
        table.obj_memory_usage = table
            .obj_memory_usage
            .saturating_sub(entry.value.malloc_used());
        true
    }

    fn preserve_for_snapshot(&mut self, db: DbIndex, slot: SlotRef) {
        let Some(snapshot) = self.snapshot.as_mut() else {
            return;
        };
        if let Some(table) = self.db_arr.get(usize::from(db)).and_then(Option::as_ref) {
            snapshot.preserve(db, slot, table);
        }
    }
}

#[cfg(test)]
mod tests;
