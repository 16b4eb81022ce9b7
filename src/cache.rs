//! Compiled query cache.
//!
//! Session private memo of Parse round trips, keyed by the query text
//! hash. Bounded by capacity with LRU displacement plus a write TTL,
//! so reclamation is deterministic. An expired or displaced entry is
//! simply a miss and the query is recompiled; its server side
//! statements are queued for closing on the next execution so they do
//! not pile up backend-side for the session's lifetime.
use std::hash::{BuildHasher, RandomState};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::query::Query;
use crate::statement::StatementName;

const DEFAULT_CAPACITY: NonZeroUsize = NonZeroUsize::new(1000).unwrap();
const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Server side prepared statements backing one [`Query`].
///
/// One statement name per sub-statement, in source order.
#[derive(Debug, Clone)]
pub(crate) struct CachedQuery {
    pub statements: Vec<StatementName>,
}

#[derive(Debug)]
struct Entry {
    value: CachedQuery,
    created: Instant,
}

#[derive(Debug)]
pub(crate) struct StatementCache {
    entries: LruCache<u64, Entry>,
    ttl: Duration,
    hasher: RandomState,
    /// Statements of displaced entries, still prepared server side.
    displaced: Vec<StatementName>,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::with(DEFAULT_CAPACITY, DEFAULT_TTL)
    }

    pub fn with(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(capacity),
            ttl,
            hasher: RandomState::new(),
            displaced: Vec::new(),
        }
    }

    pub fn key(&self, query: &Query) -> u64 {
        self.hasher.hash_one(query)
    }

    /// Lookup by key, bumping recency. Expired entries miss and are dropped.
    pub fn get(&mut self, key: u64) -> Option<&CachedQuery> {
        let expired = match self.entries.peek(&key) {
            Some(entry) => entry.created.elapsed() > self.ttl,
            None => return None,
        };
        if expired {
            if let Some(entry) = self.entries.pop(&key) {
                self.displaced.extend(entry.value.statements);
            }
            return None;
        }
        self.entries.get(&key).map(|e| &e.value)
    }

    /// Insert, displacing the least recently used entry beyond capacity.
    pub fn insert(&mut self, key: u64, value: CachedQuery) {
        let entry = Entry { value, created: Instant::now() };
        if let Some((_, old)) = self.entries.push(key, entry) {
            self.displaced.extend(old.value.statements);
        }
    }

    /// Drop an entry whose server side statements may no longer exist.
    pub fn remove(&mut self, key: u64) {
        self.entries.pop(&key);
    }

    /// Statements displaced since the last call, to be closed server
    /// side by the next execution.
    pub fn take_displaced(&mut self) -> Vec<StatementName> {
        std::mem::take(&mut self.displaced)
    }
}
