//! Shared error model for cross-crate APIs.
//!
//! Two channels are kept apart: [`DflyError`] reports infrastructure failures (configuration,
//! transaction state, shard availability) and [`OpStatus`] is the closed set of per-operation
//! outcomes that shard callbacks hand back to the command layer.

use thiserror::Error;

use crate::ids::ShardId;

/// Unified result type for infrastructure-level APIs.
pub type DflyResult<T> = Result<T, DflyError>;

/// Infrastructure failures surfaced by the runtime and transaction layers.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DflyError {
    /// Configuration is invalid for the requested operation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Runtime or transaction state does not allow this operation.
    #[error("invalid runtime state: {0}")]
    InvalidState(&'static str),

    /// Target shard executor is out of range, shutting down, or gone.
    #[error("shard {0} is unavailable")]
    ShardUnavailable(ShardId),

    /// Scheduling kept colliding with concurrently scheduled transactions.
    #[error("transaction could not be scheduled after {0} attempts")]
    ScheduleExhausted(u32),

    /// Shard acknowledgements did not arrive in time.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Per-operation failure kinds returned by shard-local callbacks.
///
/// Success is represented by `Ok` of [`OpResult`]; these variants are the only non-success
/// outcomes. [`OpStatus::Skipped`] is an expected outcome of conditional operations, not a
/// failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpStatus {
    /// Key is absent, including keys that expired on the logical clock.
    #[error("no such key")]
    KeyNotFound,

    /// Key exists but holds a value of another type.
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    /// Existing value cannot be interpreted as required.
    #[error("value is not an integer or out of range")]
    InvalidValue,

    /// Numeric operation would overflow.
    #[error("increment or decrement would overflow")]
    OutOfRange,

    /// Conditional operation was intentionally not performed.
    #[error("operation skipped")]
    Skipped,
}

/// Result of one shard-local operation.
pub type OpResult<T> = Result<T, OpStatus>;

/// Returns the first failure in shard order, or success when every shard succeeded.
///
/// # Errors
///
/// Returns the first non-success [`OpStatus`] found in `results`.
pub fn first_failure<'a, I>(results: I) -> OpResult<()>
where
    I: IntoIterator<Item = &'a OpResult<()>>,
{
    results
        .into_iter()
        .find_map(|result| result.as_ref().err().copied())
        .map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::{DflyError, OpResult, OpStatus, first_failure};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn first_failure_is_ok_when_all_shards_succeed() {
        let results: Vec<OpResult<()>> = vec![Ok(()), Ok(())];
        assert_that!(first_failure(&results), eq(Ok(())));
    }

    #[rstest]
    fn first_failure_keeps_shard_order() {
        let results = vec![Ok(()), Err(OpStatus::WrongType), Err(OpStatus::OutOfRange)];
        assert_that!(first_failure(&results), eq(Err(OpStatus::WrongType)));
    }

    #[rstest]
    fn errors_render_readable_messages() {
        assert_that!(
            DflyError::ShardUnavailable(3).to_string().as_str(),
            eq("shard 3 is unavailable")
        );
        assert_that!(
            OpStatus::InvalidValue.to_string().as_str(),
            eq("value is not an integer or out of range")
        );
    }
}
