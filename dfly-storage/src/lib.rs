//! Shard-local storage: versioned key tables with logical-clock expiry.

pub mod db_slice;
pub mod snapshot;
pub mod table;
pub mod value;

pub use db_slice::{DbSlice, DbStats, EntryHandle, ExpireHandle};
pub use snapshot::SnapshotRecord;
pub use table::PrimeEntry;
pub use value::{ObjType, ObjectValue};
