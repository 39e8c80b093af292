//! Point-in-time snapshot cooperation for one shard.
//!
//! A snapshot fixes the shard version watermark at start. A cursor then walks every database in
//! slot order, emitting entries whose version is not newer than that watermark. Mutations that
//! reach an entry the cursor has not visited yet first copy its pre-mutation state into a
//! preserved queue, so every entry that existed at snapshot start is emitted exactly once with
//! the value it had at that moment.

use std::collections::VecDeque;

use dfly_common::ids::DbIndex;
use dfly_core::containers::HotSet;
use tracing::trace;

use crate::db_slice::DbTable;
use crate::table::{PrimeEntry, SlotRef};
use crate::value::ObjectValue;

/// One serialized entry as captured by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// Logical database the entry belongs to.
    pub db: DbIndex,
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value at snapshot start.
    pub value: ObjectValue,
    /// Absolute expiry in milliseconds, if any.
    pub expire_at_ms: Option<u64>,
    /// Protocol flag, `0` when none is recorded.
    pub mc_flag: u32,
    /// Entry version at capture time.
    pub version: u64,
}

#[derive(Debug)]
pub(crate) struct SnapshotState {
    start_version: u64,
    started_at_ms: u64,
    cursor_db: usize,
    cursor_slot: usize,
    // Unvisited positions whose pre-snapshot state was already captured.
    captured: HotSet<(usize, usize)>,
    preserved: VecDeque<SnapshotRecord>,
}

impl SnapshotState {
    pub(crate) fn new(start_version: u64, started_at_ms: u64) -> Self {
        Self {
            start_version,
            started_at_ms,
            cursor_db: 0,
            cursor_slot: 0,
            captured: HotSet::default(),
            preserved: VecDeque::new(),
        }
    }

    pub(crate) fn start_version(&self) -> u64 {
        self.start_version
    }

    fn cursor_passed(&self, db: usize, index: usize) -> bool {
        (db, index) < (self.cursor_db, self.cursor_slot)
    }

    /// Captures the current state of `slot` if the cursor still owes it to the snapshot.
    pub(crate) fn preserve(&mut self, db: DbIndex, slot: SlotRef, table: &DbTable) {
        let position = (usize::from(db), slot.index());
        if self.cursor_passed(position.0, position.1) || self.captured.contains(&position) {
            return;
        }
        let Some((key, entry)) = table.prime.get(slot) else {
            return;
        };
        if entry.version() > self.start_version {
            return;
        }
        let _ = self.captured.insert(position);
        if let Some(record) = self.capture(db, key, entry, table, slot) {
            trace!(db, version = record.version, "preserved entry for snapshot");
            self.preserved.push_back(record);
        }
    }

    /// Emits up to `limit` records; preserved copies first, then cursor progress.
    pub(crate) fn next_batch(
        &mut self,
        db_arr: &[Option<DbTable>],
        limit: usize,
    ) -> Vec<SnapshotRecord> {
        let mut batch = Vec::new();
        while batch.len() < limit {
            let Some(record) = self.preserved.pop_front() else {
                break;
            };
            batch.push(record);
        }

        while batch.len() < limit && self.cursor_db < db_arr.len() {
            let Some(table) = db_arr[self.cursor_db].as_ref() else {
                self.advance_db();
                continue;
            };
            if self.cursor_slot >= table.prime.slot_count() {
                self.advance_db();
                continue;
            }
            let position = (self.cursor_db, self.cursor_slot);
            self.cursor_slot += 1;
            if self.captured.remove(&position) {
                continue;
            }
            let Some(slot) = table.prime.slot_ref(position.1) else {
                continue;
            };
            let Some((key, entry)) = table.prime.get(slot) else {
                continue;
            };
            if entry.version() > self.start_version {
                continue;
            }
            let Ok(db) = DbIndex::try_from(position.0) else {
                break;
            };
            if let Some(record) = self.capture(db, key, entry, table, slot) {
                batch.push(record);
            }
        }
        batch
    }

    pub(crate) fn is_exhausted(&self, db_arr_len: usize) -> bool {
        self.preserved.is_empty() && self.cursor_db >= db_arr_len
    }

    fn advance_db(&mut self) {
        self.cursor_db += 1;
        self.cursor_slot = 0;
    }

    fn capture(
        &self,
        db: DbIndex,
        key: &[u8],
        entry: &PrimeEntry,
        table: &DbTable,
        slot: SlotRef,
    ) -> Option<SnapshotRecord> {
        let expire_at_ms = table.expire.get(&slot.index()).copied();
        if expire_at_ms.is_some_and(|at| at <= self.started_at_ms) {
            return None;
        }
        let mc_flag = if entry.has_flag() {
            table.mc_flags.get(key).copied().unwrap_or_default()
        } else {
            0
        };
        Some(SnapshotRecord {
            db,
            key: key.to_vec(),
            value: entry.value().clone(),
            expire_at_ms,
            mc_flag,
            version: entry.version(),
        })
    }
}
