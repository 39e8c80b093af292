use super::{DbSlice, EntryHandle};
use crate::value::{ObjType, ObjectValue};
use dfly_common::error::OpStatus;
use googletest::prelude::*;
use proptest::prelude::*;
use rstest::rstest;

fn string(text: &str) -> ObjectValue {
    ObjectValue::from_bytes(text.as_bytes().to_vec())
}

fn stored_string(slice: &DbSlice, key: &[u8]) -> Option<Vec<u8>> {
    let it = slice.find(0, key).ok()?;
    slice
        .value(0, it)
        .and_then(ObjectValue::string_bytes)
        .map(|bytes| bytes.into_owned())
}

#[rstest]
fn new_slice_has_db_zero_active() {
    let slice = DbSlice::new(3);
    assert_that!(slice.shard_id(), eq(3));
    assert_that!(slice.is_db_valid(0), eq(true));
    assert_that!(slice.is_db_valid(1), eq(false));
    assert_that!(slice.db_array_size(), eq(1));
}

#[rstest]
fn activate_and_reserve_grow_the_db_array() {
    let mut slice = DbSlice::new(0);
    slice.activate_db(4);
    slice.activate_db(4);
    slice.reserve(2, 128);
    assert_that!(slice.db_array_size(), eq(5));
    assert_that!(slice.is_db_valid(2), eq(true));
    assert_that!(slice.is_db_valid(3), eq(false));
    assert_that!(slice.db_size(2), eq(0));
}

#[rstest]
fn find_on_missing_key_reports_not_found() {
    let slice = DbSlice::new(0);
    assert_eq!(slice.find(0, b"missing"), Err(OpStatus::KeyNotFound));
    assert_eq!(slice.find(9, b"missing"), Err(OpStatus::KeyNotFound));
    let (it, exp) = slice.find_ext(0, b"missing");
    assert_that!(it.is_valid(), eq(false));
    assert_that!(exp.is_valid(), eq(false));
}

#[rstest]
fn add_or_find_inserts_once() {
    let mut slice = DbSlice::new(0);
    let (first, inserted) = slice.add_or_find(0, b"k");
    assert_that!(inserted, eq(true));
    let (second, inserted_again) = slice.add_or_find(0, b"k");
    assert_that!(inserted_again, eq(false));
    assert_that!(second, eq(first));
    assert_that!(slice.db_size(0), eq(1));
    assert_eq!(slice.value(0, first), Some(&ObjectValue::default()));
}

#[rstest]
fn find_typed_rejects_other_types() {
    let mut slice = DbSlice::new(0);
    let _ = slice.add_new(0, b"list", ObjectValue::List(vec![b"a".to_vec()].into()), 0);
    assert_eq!(
        slice.find_typed(0, b"list", ObjType::String),
        Err(OpStatus::WrongType)
    );
    assert_that!(slice.find_typed(0, b"list", ObjType::List).is_ok(), eq(true));
}

#[rstest]
fn expired_entries_are_hidden_but_not_removed_by_find() {
    let mut slice = DbSlice::new(0);
    let _ = slice.add_new(0, b"k", string("v"), 100);
    slice.update_expire_clock(99);
    let (it, exp) = slice.find_ext(0, b"k");
    assert_that!(it.is_valid(), eq(true));
    assert_that!(slice.expire_time(0, exp), eq(Some(100)));

    slice.update_expire_clock(100);
    assert_eq!(slice.find(0, b"k"), Err(OpStatus::KeyNotFound));
    assert_that!(slice.db_size(0), eq(1));

    slice.update_expire_clock(50);
    assert_that!(stored_string(&slice, b"k"), eq(&Some(b"v".to_vec())));
}

#[rstest]
fn mutating_lookup_purges_expired_entry() {
    let mut slice = DbSlice::new(0);
    let old = slice.add_new(0, b"k", string("v"), 10);
    let old_version = slice.get_version(0, old).expect("entry exists");
    slice.update_expire_clock(10);

    let (fresh, inserted) = slice.add_or_find(0, b"k");
    assert_that!(inserted, eq(true));
    assert_that!(slice.entry(0, fresh).map(|entry| entry.has_expire()), eq(Some(false)));
    assert_that!(
        slice.get_version(0, fresh).expect("entry exists") > old_version,
        eq(true)
    );
    assert_that!(slice.db_stats(0).expire_count, eq(0));
}

#[rstest]
fn add_if_not_exist_respects_live_and_expired_keys() {
    let mut slice = DbSlice::new(0);
    assert_that!(slice.add_if_not_exist(0, b"k", string("a"), 20), eq(true));
    assert_that!(slice.add_if_not_exist(0, b"k", string("b"), 0), eq(false));
    assert_that!(stored_string(&slice, b"k"), eq(&Some(b"a".to_vec())));

    slice.update_expire_clock(25);
    assert_that!(slice.add_if_not_exist(0, b"k", string("c"), 0), eq(true));
    assert_that!(stored_string(&slice, b"k"), eq(&Some(b"c".to_vec())));
}

#[rstest]
fn expire_reports_changes_and_keeps_version() {
    let mut slice = DbSlice::new(0);
    let it = slice.add_new(0, b"k", string("v"), 0);
    let version = slice.get_version(0, it);

    assert_that!(slice.expire(0, it, 0), eq(false));
    assert_that!(slice.expire(0, it, 500), eq(true));
    assert_that!(slice.expire(0, it, 500), eq(false));
    assert_that!(slice.expire(0, it, 700), eq(true));
    let (_, exp) = slice.find_ext(0, b"k");
    assert_that!(slice.expire_time(0, exp), eq(Some(700)));

    assert_that!(slice.set_expire_at(0, exp, 900), eq(true));
    assert_that!(slice.expire_time(0, exp), eq(Some(900)));
    assert_that!(slice.expire(0, it, 0), eq(true));
    assert_that!(slice.db_stats(0).expire_count, eq(0));
    assert_that!(slice.get_version(0, it), eq(version));
    assert_that!(slice.expire(0, EntryHandle::end(), 5), eq(false));
}

#[rstest]
fn update_bracket_bumps_version_exactly_once() {
    let mut slice = DbSlice::new(0);
    let it = slice.add_new(0, b"counter", ObjectValue::Int(10), 0);
    let before = slice.get_version(0, it).expect("entry exists");

    slice.pre_update(0, it);
    if let Some(value) = slice.value_mut(0, it) {
        value.set_int(15);
    }
    slice.post_update(0, it);

    assert_that!(slice.get_version(0, it), eq(Some(before + 1)));
    assert_eq!(slice.value(0, it), Some(&ObjectValue::Int(15)));

    let length = slice.update(0, it, |value| {
        value.set_string(b"longer string".to_vec());
        value.size()
    });
    assert_that!(length, eq(Some(13)));
    assert_that!(slice.get_version(0, it), eq(Some(before + 2)));
    assert_that!(slice.db_stats(0).obj_memory_usage >= 13, eq(true));
}

#[rstest]
fn delete_removes_entry_expiry_and_flag() {
    let mut slice = DbSlice::new(0);
    let it = slice.add_new(0, b"k", string("v"), 1_000);
    slice.set_mc_flag(0, it, 42);
    assert_that!(slice.get_mc_flag(0, it), eq(42));
    assert_that!(slice.entry(0, it).map(|entry| entry.has_flag()), eq(Some(true)));

    assert_that!(slice.delete(0, it), eq(true));
    assert_that!(slice.delete(0, it), eq(false));
    assert_that!(slice.entry(0, it).is_none(), eq(true));
    assert_that!(slice.get_mc_flag(0, it), eq(0));

    let stats = slice.db_stats(0);
    assert_that!(stats.key_count, eq(0));
    assert_that!(stats.expire_count, eq(0));
    assert_that!(stats.mc_flag_count, eq(0));
}

#[rstest]
fn stale_handle_never_resolves_to_recreated_key() {
    let mut slice = DbSlice::new(0);
    let old = slice.add_new(0, b"a", string("1"), 0);
    let _ = slice.delete(0, old);
    let fresh = slice.add_new(0, b"b", string("2"), 0);
    assert_that!(fresh, not(eq(old)));
    assert_that!(slice.value(0, old).is_none(), eq(true));
    assert_that!(slice.key(0, fresh), eq(Some(b"b".as_slice())));
}

#[rstest]
fn flush_db_clears_only_that_database() {
    let mut slice = DbSlice::new(0);
    slice.activate_db(1);
    let _ = slice.add_new(0, b"a", string("1"), 0);
    let _ = slice.add_new(0, b"b", string("2"), 10);
    let _ = slice.add_new(1, b"c", string("3"), 0);

    assert_that!(slice.flush_db(0), eq(2));
    assert_that!(slice.db_size(0), eq(0));
    assert_that!(slice.db_size(1), eq(1));
    assert_that!(slice.is_db_valid(0), eq(true));
    assert_that!(slice.db_stats(0).expire_count, eq(0));
}

#[rstest]
fn handles_taken_before_flush_stay_stale() {
    let mut slice = DbSlice::new(0);
    let old = slice.add_new(0, b"old", string("1"), 0);
    slice.set_mc_flag(0, old, 9);
    assert_that!(slice.flush_db(0), eq(1));

    let fresh = slice.add_new(0, b"new", string("2"), 0);
    assert_that!(slice.key(0, old), eq(None));
    assert_that!(slice.value(0, old).is_none(), eq(true));
    assert_that!(slice.get_mc_flag(0, old), eq(0));
    assert_that!(slice.key(0, fresh), eq(Some(b"new".as_slice())));
    assert_that!(slice.db_stats(0).mc_flag_count, eq(0));
}

#[rstest]
fn delete_expired_keys_honors_the_limit() {
    let mut slice = DbSlice::new(0);
    for index in 0..5_u8 {
        let _ = slice.add_new(0, &[b'k', index], string("v"), 10);
    }
    let _ = slice.add_new(0, b"live", string("v"), 0);
    slice.update_expire_clock(10);

    assert_that!(slice.delete_expired_keys(0, 3), eq(3));
    assert_that!(slice.db_size(0), eq(3));
    assert_that!(slice.delete_expired_keys(0, 10), eq(2));
    assert_that!(slice.db_size(0), eq(1));
    assert_that!(slice.delete_expired_keys(7, 10), eq(0));
}

#[rstest]
fn snapshot_emits_each_pre_snapshot_entry_once_with_start_value() {
    let mut slice = DbSlice::new(0);
    let a = slice.add_new(0, b"a", string("a0"), 0);
    let b = slice.add_new(0, b"b", string("b0"), 0);
    let _ = slice.add_new(0, b"c", string("c0"), 0);
    let _ = slice.add_new(0, b"gone", string("g0"), 5);
    slice.update_expire_clock(5);

    assert_that!(slice.begin_snapshot(), eq(true));
    assert_that!(slice.begin_snapshot(), eq(false));

    let _ = slice.update(0, a, |value| value.set_string(b"a1".to_vec()));
    let _ = slice.update(0, a, |value| value.set_string(b"a2".to_vec()));
    assert_that!(slice.delete(0, b), eq(true));
    let _ = slice.add_new(0, b"new", string("n0"), 0);

    let mut records = Vec::new();
    loop {
        let batch = slice.snapshot_next_batch(1);
        if batch.is_empty() {
            break;
        }
        records.extend(batch);
    }
    assert_that!(slice.is_snapshot_exhausted(), eq(true));
    assert_that!(slice.end_snapshot(), eq(true));
    assert_that!(slice.is_snapshot_active(), eq(false));

    let mut emitted = records
        .iter()
        .map(|record| {
            let value = record.value.string_bytes().map(|bytes| bytes.into_owned());
            (record.key.clone(), value)
        })
        .collect::<Vec<_>>();
    emitted.sort();
    assert_that!(
        &emitted,
        eq(&vec![
            (b"a".to_vec(), Some(b"a0".to_vec())),
            (b"b".to_vec(), Some(b"b0".to_vec())),
            (b"c".to_vec(), Some(b"c0".to_vec())),
        ])
    );
}

#[rstest]
fn flush_during_snapshot_preserves_unvisited_entries() {
    let mut slice = DbSlice::new(0);
    let first = slice.add_new(0, b"x", string("1"), 0);
    slice.set_mc_flag(0, first, 7);
    let _ = slice.add_new(0, b"y", string("2"), 90);

    assert_that!(slice.begin_snapshot(), eq(true));
    assert_that!(slice.flush_db(0), eq(2));

    let mut records = slice.snapshot_next_batch(16);
    assert_that!(slice.snapshot_next_batch(16).is_empty(), eq(true));
    records.sort_by(|left, right| left.key.cmp(&right.key));
    assert_that!(records.len(), eq(2));
    assert_that!(records[0].mc_flag, eq(7));
    assert_that!(records[1].expire_at_ms, eq(Some(90)));
}

#[derive(Debug, Clone)]
enum SliceOp {
    Add(u8),
    Update(u8),
    Delete(u8),
    Expire(u8, u64),
    Tick(u64),
}

fn slice_op() -> impl Strategy<Value = SliceOp> {
    prop_oneof![
        (0..4_u8).prop_map(SliceOp::Add),
        (0..4_u8).prop_map(SliceOp::Update),
        (0..4_u8).prop_map(SliceOp::Delete),
        ((0..4_u8), (0..40_u64)).prop_map(|(key, at)| SliceOp::Expire(key, at)),
        (0..40_u64).prop_map(SliceOp::Tick),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        ..ProptestConfig::default()
    })]

    #[test]
    fn observed_versions_never_repeat_or_go_backwards(
        ops in prop::collection::vec(slice_op(), 1..80),
    ) {
        let mut slice = DbSlice::new(0);
        let mut last_seen = [0_u64; 4];
        for op in ops {
            match op {
                SliceOp::Add(key) => {
                    let _ = slice.add_or_find(0, &[key]);
                }
                SliceOp::Update(key) => {
                    if let Ok(it) = slice.find(0, &[key]) {
                        let _ = slice.update(0, it, |value| value.set_int(i64::from(key)));
                    }
                }
                SliceOp::Delete(key) => {
                    if let Ok(it) = slice.find(0, &[key]) {
                        let _ = slice.delete(0, it);
                    }
                }
                SliceOp::Expire(key, at) => {
                    if let Ok(it) = slice.find(0, &[key]) {
                        let _ = slice.expire(0, it, at);
                    }
                }
                SliceOp::Tick(now) => slice.update_expire_clock(now),
            }
            for key in 0..4_u8 {
                if let Ok(it) = slice.find(0, &[key]) {
                    let version = slice.get_version(0, it).unwrap_or_default();
                    prop_assert!(version >= last_seen[usize::from(key)]);
                    last_seen[usize::from(key)] = version;
                }
            }
        }
    }
}
