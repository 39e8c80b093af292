//! Per-connection state consulted by command families.

use dfly_common::ids::DbIndex;

/// Wire protocol spoken by the client that issued a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    /// RESP clients.
    #[default]
    Redis,
    /// Memcache text protocol clients.
    Memcache,
}

/// Connection-level parameters of one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandContext {
    /// Selected logical database.
    pub db_index: DbIndex,
    /// Client protocol.
    pub protocol: Protocol,
    /// Memcache flags attached to the current storage command.
    pub memcache_flag: u32,
    /// Whether memcache retrievals should also return CAS versions.
    pub fetch_cas_version: bool,
}

impl CommandContext {
    /// Redis connection on database `db_index`.
    #[must_use]
    pub fn redis(db_index: DbIndex) -> Self {
        Self {
            db_index,
            ..Self::default()
        }
    }

    /// Memcache connection; memcache always works on database 0.
    #[must_use]
    pub fn memcache() -> Self {
        Self {
            protocol: Protocol::Memcache,
            ..Self::default()
        }
    }
}
