//! Command families executed through the transactional shard set.
//!
//! Each family exposes shard-local `op_*` functions over a `DbSlice` and coordinator-side
//! commands that build a transaction, run the ops on the owning shards and aggregate results.

pub mod context;
pub mod generic_family;
pub mod string_family;

pub use context::{CommandContext, Protocol};
