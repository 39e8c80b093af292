//! Generational slot table backing one logical database's primary keyspace.
//!
//! Entries live in a slot vector; a hash index maps key bytes to slot positions. Removing an
//! entry bumps the slot generation, so a stale [`SlotRef`] can never alias a newer entry that
//! reuses the same position.

use dfly_core::containers::HotMap;

use crate::value::ObjectValue;

/// Stable reference to one occupied slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotRef {
    index: usize,
    generation: u32,
}

impl SlotRef {
    /// Slot position inside the table.
    #[must_use]
    pub fn index(self) -> usize {
        self.index
    }
}

/// One versioned entry of the primary table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimeEntry {
    pub(crate) value: ObjectValue,
    pub(crate) version: u64,
    pub(crate) has_mc_flag: bool,
    pub(crate) has_expire: bool,
}

impl PrimeEntry {
    pub(crate) fn new(value: ObjectValue, version: u64) -> Self {
        Self {
            value,
            version,
            has_mc_flag: false,
            has_expire: false,
        }
    }

    /// Stored value.
    #[must_use]
    pub fn value(&self) -> &ObjectValue {
        &self.value
    }

    /// Version counter; bumped exactly once per completed update bracket.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether a protocol flag is recorded for this entry.
    #[must_use]
    pub fn has_flag(&self) -> bool {
        self.has_mc_flag
    }

    /// Whether an expiry record shadows this entry.
    #[must_use]
    pub fn has_expire(&self) -> bool {
        self.has_expire
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    occupant: Option<(Box<[u8]>, PrimeEntry)>,
}

/// Primary key → entry table of one database.
#[derive(Debug, Default)]
pub(crate) struct PrimeTable {
    slots: Vec<Slot>,
    index: HotMap<Box<[u8]>, usize>,
    free: Vec<usize>,
}

impl PrimeTable {
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Number of slot positions, occupied or not.
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn reserve(&mut self, additional: usize) {
        self.index.reserve(additional);
        self.slots.reserve(additional.saturating_sub(self.free.len()));
    }

    pub(crate) fn find(&self, key: &[u8]) -> Option<SlotRef> {
        let index = *self.index.get(key)?;
        self.slot_ref(index)
    }

    /// Returns a reference to the entry at `index` when that slot is occupied.
    pub(crate) fn slot_ref(&self, index: usize) -> Option<SlotRef> {
        let slot = self.slots.get(index)?;
        slot.occupant.as_ref().map(|_| SlotRef {
            index,
            generation: slot.generation,
        })
    }

    /// Inserts a new key. The key must be absent.
    pub(crate) fn insert(&mut self, key: &[u8], entry: PrimeEntry) -> SlotRef {
        debug_assert!(!self.index.contains_key(key), "key inserted twice");
        let key: Box<[u8]> = key.into();
        let index = if let Some(index) = self.free.pop() {
            index
        } else {
            self.slots.push(Slot::default());
            self.slots.len() - 1
        };
        let slot = &mut self.slots[index];
        slot.occupant = Some((key.clone(), entry));
        let _ = self.index.insert(key, index);
        SlotRef {
            index,
            generation: slot.generation,
        }
    }

    pub(crate) fn get(&self, slot: SlotRef) -> Option<(&[u8], &PrimeEntry)> {
        let stored = self.slots.get(slot.index)?;
        if stored.generation != slot.generation {
            return None;
        }
        stored
            .occupant
            .as_ref()
            .map(|(key, entry)| (key.as_ref(), entry))
    }

    pub(crate) fn get_mut(&mut self, slot: SlotRef) -> Option<&mut PrimeEntry> {
        let stored = self.slots.get_mut(slot.index)?;
        if stored.generation != slot.generation {
            return None;
        }
        stored.occupant.as_mut().map(|(_, entry)| entry)
    }

    pub(crate) fn remove(&mut self, slot: SlotRef) -> Option<(Box<[u8]>, PrimeEntry)> {
        let stored = self.slots.get_mut(slot.index)?;
        if stored.generation != slot.generation {
            return None;
        }
        let (key, entry) = stored.occupant.take()?;
        stored.generation = stored.generation.wrapping_add(1);
        let _ = self.index.remove(&key);
        self.free.push(slot.index);
        Some((key, entry))
    }

    /// Empties every slot, invalidating all outstanding slot references. Returns the number of
    /// entries dropped.
    pub(crate) fn clear(&mut self) -> usize {
        let removed = self.index.len();
        self.index.clear();
        self.free.clear();
        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            if slot.occupant.take().is_some() {
                slot.generation = slot.generation.wrapping_add(1);
            }
            self.free.push(index);
        }
        removed
    }

    /// Occupied entries in slot order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (SlotRef, &[u8], &PrimeEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.occupant.as_ref().map(|(key, entry)| {
                (
                    SlotRef {
                        index,
                        generation: slot.generation,
                    },
                    key.as_ref(),
                    entry,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{PrimeEntry, PrimeTable};
    use crate::value::ObjectValue;
    use googletest::prelude::*;
    use rstest::rstest;

    fn entry(text: &str) -> PrimeEntry {
        PrimeEntry::new(ObjectValue::from_bytes(text.as_bytes().to_vec()), 1)
    }

    #[rstest]
    fn insert_then_find_returns_same_slot() {
        let mut table = PrimeTable::default();
        let slot = table.insert(b"k", entry("v"));
        assert_that!(table.find(b"k"), eq(Some(slot)));
        assert_that!(table.len(), eq(1));
    }

    #[rstest]
    fn removed_slot_reference_goes_stale_after_reuse() {
        let mut table = PrimeTable::default();
        let first = table.insert(b"a", entry("1"));
        assert_that!(table.remove(first).is_some(), eq(true));

        let second = table.insert(b"b", entry("2"));
        assert_that!(second.index(), eq(first.index()));
        assert_that!(table.get(first).is_none(), eq(true));
        assert_that!(table.get_mut(first).is_none(), eq(true));
        assert_that!(table.remove(first).is_none(), eq(true));

        let (key, _) = table.get(second).expect("second entry is live");
        assert_that!(key, eq(b"b".as_slice()));
    }

    #[rstest]
    fn clear_invalidates_references_to_every_slot() {
        let mut table = PrimeTable::default();
        let a = table.insert(b"a", entry("1"));
        let b = table.insert(b"b", entry("2"));

        assert_that!(table.clear(), eq(2));
        assert_that!(table.len(), eq(0));
        assert_that!(table.find(b"a"), eq(None));

        let reused = table.insert(b"c", entry("3"));
        assert_that!(reused.index(), eq(a.index()));
        assert_that!(table.get(a).is_none(), eq(true));
        assert_that!(table.get(b).is_none(), eq(true));
        assert_that!(table.slot_count(), eq(2));
    }

    #[rstest]
    fn iter_skips_free_slots() {
        let mut table = PrimeTable::default();
        let a = table.insert(b"a", entry("1"));
        let _ = table.insert(b"b", entry("2"));
        let _ = table.remove(a);

        let keys = table.iter().map(|(_, key, _)| key.to_vec()).collect::<Vec<_>>();
        assert_that!(&keys, eq(&vec![b"b".to_vec()]));
        assert_that!(table.slot_count(), eq(2));
        assert_that!(table.slot_ref(a.index()).is_none(), eq(true));
    }
}
