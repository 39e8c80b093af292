//! Core configuration shared by shard-set bootstrap code.

use std::time::Duration;

use crate::error::{DflyError, DflyResult};
use crate::ids::ShardCount;

/// Bootstrap configuration for the shard set and its transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreConfig {
    /// Number of shard owners used by shared-nothing execution.
    pub shard_count: ShardCount,
    /// Logical databases materialized on every shard at startup.
    ///
    /// Higher indices are still activated lazily on first use.
    pub db_count: u16,
    /// Route keys by their `{tag}` section so related keys land on one shard.
    pub lock_on_hashtags: bool,
    /// Upper bound on re-scheduling after ordering conflicts with concurrent transactions.
    pub schedule_attempts: u32,
    /// Bounded wait for shard acknowledgements of one scheduling round or hop.
    pub hop_timeout: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            shard_count: ShardCount::new(4).expect("literal shard count must be non-zero"),
            db_count: 16,
            lock_on_hashtags: false,
            schedule_attempts: 64,
            hop_timeout: Duration::from_secs(10),
        }
    }
}

impl CoreConfig {
    /// Returns a default configuration with a custom shard count.
    #[must_use]
    pub fn with_shard_count(shard_count: ShardCount) -> Self {
        Self {
            shard_count,
            ..Self::default()
        }
    }

    /// Checks values that cannot be expressed through types alone.
    ///
    /// # Errors
    ///
    /// Returns `DflyError::InvalidConfig` for zero database count, zero scheduling attempts,
    /// or a zero hop timeout.
    pub fn validate(&self) -> DflyResult<()> {
        if self.db_count == 0 {
            return Err(DflyError::InvalidConfig("db_count must be positive"));
        }
        if self.schedule_attempts == 0 {
            return Err(DflyError::InvalidConfig("schedule_attempts must be positive"));
        }
        if self.hop_timeout.is_zero() {
            return Err(DflyError::InvalidConfig("hop_timeout must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::CoreConfig;
    use crate::error::DflyError;
    use crate::ids::ShardCount;
    use googletest::prelude::*;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    fn default_config_is_valid() {
        assert_that!(CoreConfig::default().validate(), eq(Ok(())));
    }

    #[rstest]
    fn with_shard_count_keeps_other_defaults() {
        let config = CoreConfig::with_shard_count(ShardCount::new(7).expect("literal is valid"));
        assert_that!(config.shard_count.get(), eq(7));
        assert_that!(config.db_count, eq(16));
    }

    #[rstest]
    #[case(CoreConfig { db_count: 0, ..CoreConfig::default() }, "db_count must be positive")]
    #[case(
        CoreConfig { schedule_attempts: 0, ..CoreConfig::default() },
        "schedule_attempts must be positive"
    )]
    #[case(
        CoreConfig { hop_timeout: Duration::ZERO, ..CoreConfig::default() },
        "hop_timeout must be positive"
    )]
    fn validate_rejects_degenerate_values(
        #[case] config: CoreConfig,
        #[case] reason: &'static str,
    ) {
        assert_that!(config.validate(), eq(Err(DflyError::InvalidConfig(reason))));
    }
}
