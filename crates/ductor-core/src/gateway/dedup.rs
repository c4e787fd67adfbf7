//! In-memory LRU cache with TTL for message deduplication.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tracing::debug;

const DEFAULT_TTL: Duration = Duration::from_secs(30);
const DEFAULT_MAX_SIZE: usize = 200;

/// LRU + TTL dedup cache keyed on `(chat_id, message_id)`.
///
/// Uses monotonic time to avoid clock-drift issues. A duplicate hit
/// refreshes the entry's timestamp.
pub struct DedupeCache {
    cache: LruCache<(i64, i64), Instant>,
    ttl: Duration,
}

impl DedupeCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            cache: LruCache::new(
                NonZeroUsize::new(max_size.max(1)).expect("max_size is at least 1"),
            ),
            ttl,
        }
    }

    /// Return `true` if `key` was already seen within the TTL (duplicate).
    ///
    /// The first call for a key inserts it and returns `false`. Subsequent
    /// calls inside the TTL window return `true` and refresh the timestamp;
    /// after the TTL has passed the key counts as unseen again.
    pub fn check(&mut self, key: (i64, i64)) -> bool {
        let now = Instant::now();
        if let Some(seen_at) = self.cache.get_mut(&key) {
            if now.duration_since(*seen_at) < self.ttl {
                *seen_at = now;
                debug!(chat_id = key.0, message_id = key.1, "Dedup hit");
                return true;
            }
        }
        self.cache.put(key, now);
        false
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Number of entries currently in the cache.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_MAX_SIZE)
    }
}
