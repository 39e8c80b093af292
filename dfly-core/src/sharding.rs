//! Shard routing abstractions.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use dfly_common::ids::{ShardCount, ShardId};

/// Resolves key ownership to a shard id.
pub trait ShardResolver {
    /// Returns the owner shard for the given key bytes.
    fn shard_for_key(&self, key: &[u8]) -> ShardId;
}

/// Hash-tag aware shard resolver.
///
/// Routing never changes while the shard count stays fixed. With `lock_on_hashtags` enabled,
/// keys such as `user:{42}:name` and `user:{42}:age` hash only their tag and therefore share an
/// owner shard.
#[derive(Debug, Clone)]
pub struct HashTagShardResolver {
    shard_count: ShardCount,
    lock_on_hashtags: bool,
}

impl HashTagShardResolver {
    /// Builds a resolver that hashes the full key.
    #[must_use]
    pub fn new(shard_count: ShardCount) -> Self {
        Self {
            shard_count,
            lock_on_hashtags: false,
        }
    }

    /// Builds a resolver that hashes only the `{tag}` part of keys that carry one.
    #[must_use]
    pub fn with_hashtags(shard_count: ShardCount) -> Self {
        Self {
            shard_count,
            lock_on_hashtags: true,
        }
    }

    /// Number of shards keys are distributed over.
    #[must_use]
    pub fn shard_count(&self) -> ShardCount {
        self.shard_count
    }

    fn routing_bytes<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        if self.lock_on_hashtags {
            key_lock_tag(key)
        } else {
            key
        }
    }
}

impl ShardResolver for HashTagShardResolver {
    fn shard_for_key(&self, key: &[u8]) -> ShardId {
        let mut hasher = DefaultHasher::new();
        self.routing_bytes(key).hash(&mut hasher);
        let shard = hasher.finish() % u64::from(self.shard_count.get());
        match ShardId::try_from(shard) {
            Ok(shard_id) => shard_id,
            Err(_) => unreachable!("modulo shard_count ensures shard id fits into u16"),
        }
    }
}

/// Returns the hash-tag section of `key`, or the whole key when it carries no non-empty tag.
///
/// The tag is the text between the first `{` and the first `}` after it.
#[must_use]
pub fn key_lock_tag(key: &[u8]) -> &[u8] {
    let Some(open) = key.iter().position(|byte| *byte == b'{') else {
        return key;
    };
    let rest = &key[open + 1..];
    match rest.iter().position(|byte| *byte == b'}') {
        Some(0) | None => key,
        Some(close) => &rest[..close],
    }
}

#[cfg(test)]
mod tests {
    use super::{HashTagShardResolver, ShardResolver, key_lock_tag};
    use dfly_common::ids::ShardCount;
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"hello".as_slice(), 4)]
    #[case(b"dragonfly-key".as_slice(), 8)]
    #[case(b"another-key".as_slice(), 16)]
    fn resolver_returns_valid_shard_range(#[case] key: &[u8], #[case] shard_count: u16) {
        let resolver =
            HashTagShardResolver::new(ShardCount::new(shard_count).expect("literal is valid"));
        let shard = resolver.shard_for_key(key);
        assert_that!(shard < shard_count, eq(true));
    }

    #[rstest]
    #[case(b"dragonfly-key".as_slice())]
    #[case(b"same-key".as_slice())]
    fn resolver_is_deterministic_for_same_input(#[case] key: &[u8]) {
        let resolver = HashTagShardResolver::new(ShardCount::new(4).expect("literal is valid"));
        let first = resolver.shard_for_key(key);
        let second = resolver.shard_for_key(key);
        assert_that!(first, eq(second));
    }

    #[rstest]
    #[case(b"user:{42}:name".as_slice(), b"42".as_slice())]
    #[case(b"{a}".as_slice(), b"a".as_slice())]
    #[case(b"no-tag".as_slice(), b"no-tag".as_slice())]
    #[case(b"empty:{}:tag".as_slice(), b"empty:{}:tag".as_slice())]
    #[case(b"open:{only".as_slice(), b"open:{only".as_slice())]
    fn lock_tag_extracts_first_non_empty_tag(#[case] key: &[u8], #[case] expected: &[u8]) {
        assert_that!(key_lock_tag(key), eq(expected));
    }

    #[rstest]
    fn hashtag_resolver_colocates_tagged_keys() {
        let resolver =
            HashTagShardResolver::with_hashtags(ShardCount::new(16).expect("literal is valid"));
        for suffix in 0..32 {
            let key = format!("session:{{tenant-7}}:{suffix}");
            assert_that!(
                resolver.shard_for_key(key.as_bytes()),
                eq(resolver.shard_for_key(b"tenant-7"))
            );
        }
    }
}
