//! Core runtime abstractions shared by storage and transaction layers.
//!
//! The crate owns two concerns: deterministic key→shard routing and the per-shard serial
//! executors that give every shard a private, single-threaded execution domain.

pub mod containers;
pub mod runtime;
pub mod sharding;

pub use runtime::{ShardSet, ShardTask};
pub use sharding::{HashTagShardResolver, ShardResolver, key_lock_tag};
