//! Hot-path container aliases used by shard-local tables.
//!
//! Container choices stay centralized so allocator/container upgrades can be done in one place
//! without touching storage or scheduling logic.

use hashbrown::{HashMap as HbMap, HashSet as HbSet};

/// Hot-path hash map used by shard-local state tables.
pub type HotMap<K, V> = HbMap<K, V>;

/// Hot-path hash set used by secondary indexes and set-typed values.
pub type HotSet<T> = HbSet<T>;
