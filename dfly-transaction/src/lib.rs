//! Cross-shard transactions over shard-owned keyspaces.
//!
//! Coordinators build a [`Transaction`], schedule it on every shard owning one of its keys and
//! then run one or more hops. Shards execute hops of conflicting transactions strictly in txid
//! order, which gives every multi-key operation an atomic view across shards.

pub mod engine_shard;
pub mod plan;
pub mod scheduler;
pub mod shard_set;
pub mod transaction;

pub use engine_shard::{EngineShard, HopTask, ShardStats};
pub use plan::{KeyIntent, LockMode, TransactionMode, TransactionPlan};
pub use scheduler::TxQueue;
pub use shard_set::EngineShardSet;
pub use transaction::{Transaction, TxState};
