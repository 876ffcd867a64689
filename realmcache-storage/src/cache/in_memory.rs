//! In-process distributed cache.
//!
//! Stands in for the cluster grid: one `DashMap` per process, with
//! invalidations fanned out over a `broadcast` channel so tests can watch
//! what a remote member would receive.
//!
//! # Thread Safety
//!
//! - Entries live in a `DashMap`; `put` checks and inserts under the key's
//!   shard lock, so a stale write cannot slip in between check and insert
//! - Statistics and the revision clock are atomic counters
//! - `invalidate` never blocks on slow subscribers (they lag instead)
//!
//! # Revisioned Writes
//!
//! Invalidating a key stamps it with a fresh revision. A later `put` whose
//! snapshot carries an older `cache_timestamp` was read from the store
//! before that invalidation and is refused, as is a put older than the
//! snapshot already cached.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use realmcache_core::CacheResult;
use tokio::sync::broadcast;
use tracing::debug;

use super::realm_key::RealmScopedKey;
use super::snapshot::CachedUser;
use super::traits::{CacheStats, DistributedCache};

/// Default number of keyspace segments.
pub const DEFAULT_SEGMENT_COUNT: usize = 256;

const INVALIDATION_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct StatsInner {
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    stale_puts: AtomicU64,
    invalidations: AtomicU64,
}

/// What the cache knows about one key.
#[derive(Debug, Default)]
struct Slot {
    snapshot: Option<Arc<CachedUser>>,
    /// Revision of the most recent invalidation.
    invalidated_at: Option<i64>,
}

impl Slot {
    /// Whether a snapshot stamped `revision` may replace this slot's state.
    fn accepts(&self, revision: i64) -> bool {
        let after_invalidation = self.invalidated_at.map_or(true, |at| revision > at);
        let not_older = self
            .snapshot
            .as_ref()
            .map_or(true, |current| revision >= current.cache_timestamp());
        after_invalidation && not_older
    }
}

/// `DistributedCache` backed by process memory.
#[derive(Debug)]
pub struct InMemoryDistributedCache {
    entries: DashMap<RealmScopedKey, Slot>,
    segment_count: usize,
    revision: AtomicI64,
    stats: StatsInner,
    invalidations: broadcast::Sender<RealmScopedKey>,
}

impl InMemoryDistributedCache {
    pub fn new(segment_count: usize) -> Self {
        let (invalidations, _rx) = broadcast::channel(INVALIDATION_CHANNEL_CAPACITY);
        Self {
            entries: DashMap::new(),
            segment_count,
            revision: AtomicI64::new(0),
            stats: StatsInner::default(),
            invalidations,
        }
    }

    /// Receive every key invalidated from now on, as a remote member would.
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<RealmScopedKey> {
        self.invalidations.subscribe()
    }

    pub fn contains(&self, key: &RealmScopedKey) -> bool {
        self.entries
            .get(key)
            .map_or(false, |slot| slot.snapshot.is_some())
    }

    /// Number of cached snapshots.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.snapshot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cached snapshots falling into `segment`.
    pub fn entries_in_segment(&self, segment: usize) -> usize {
        self.entries
            .iter()
            .filter(|e| e.snapshot.is_some() && e.key().segment(self.segment_count) == segment)
            .count()
    }

    /// Revision of the last invalidation of `key`, if it was ever invalidated.
    pub fn invalidated_at(&self, key: &RealmScopedKey) -> Option<i64> {
        self.entries.get(key).and_then(|slot| slot.invalidated_at)
    }
}

impl Default for InMemoryDistributedCache {
    fn default() -> Self {
        Self::new(DEFAULT_SEGMENT_COUNT)
    }
}

#[async_trait]
impl DistributedCache for InMemoryDistributedCache {
    async fn get(&self, key: &RealmScopedKey) -> CacheResult<Option<Arc<CachedUser>>> {
        let found = self.entries.get(key).and_then(|slot| slot.snapshot.clone());
        if found.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    async fn put(&self, key: RealmScopedKey, snapshot: Arc<CachedUser>) -> CacheResult<bool> {
        let revision = snapshot.cache_timestamp();
        let mut slot = self.entries.entry(key).or_default();
        if !slot.accepts(revision) {
            self.stats.stale_puts.fetch_add(1, Ordering::Relaxed);
            debug!(
                key = %slot.key(),
                revision,
                invalidated_at = ?slot.invalidated_at,
                "Refused stale snapshot"
            );
            return Ok(false);
        }
        slot.snapshot = Some(snapshot);
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    async fn invalidate(&self, key: &RealmScopedKey) -> CacheResult<()> {
        {
            let mut slot = self.entries.entry(key.clone()).or_default();
            slot.snapshot = None;
            slot.invalidated_at = Some(self.next_revision());
        }
        self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        match self.invalidations.send(key.clone()) {
            Ok(receivers) => debug!(key = %key, receivers, "Broadcast invalidation"),
            Err(_) => debug!(key = %key, "No members subscribed to invalidations"),
        }
        Ok(())
    }

    fn segment_count(&self) -> usize {
        self.segment_count
    }

    fn next_revision(&self) -> i64 {
        self.revision.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        Ok(CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
            puts: self.stats.puts.load(Ordering::Relaxed),
            stale_puts: self.stats.stale_puts.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LiveUser, UserRecord};
    use realmcache_core::{RealmId, UserId};

    fn snapshot(id: &str) -> Arc<CachedUser> {
        snapshot_at(id, 1)
    }

    fn snapshot_at(id: &str, revision: i64) -> Arc<CachedUser> {
        let live = LiveUser::new(UserId::new(id), None, UserRecord::new(id));
        Arc::new(CachedUser::lazy(RealmId::new("r"), &live, revision))
    }

    fn key(id: &str) -> RealmScopedKey {
        RealmScopedKey::user(&RealmId::new("r"), &UserId::new(id))
    }

    #[tokio::test]
    async fn test_put_get_invalidate() {
        let cache = InMemoryDistributedCache::new(8);
        assert!(cache.get(&key("u1")).await.unwrap().is_none());

        assert!(cache.put(key("u1"), snapshot("u1")).await.unwrap());
        let hit = cache.get(&key("u1")).await.unwrap().unwrap();
        assert_eq!(hit.id(), &UserId::new("u1"));

        cache.invalidate(&key("u1")).await.unwrap();
        assert!(!cache.contains(&key("u1")));

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.entry_count, 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_put_read_before_invalidation_is_refused() {
        let cache = InMemoryDistributedCache::new(8);
        let loaded_at = cache.next_revision();
        cache.invalidate(&key("u1")).await.unwrap();

        assert!(!cache.put(key("u1"), snapshot_at("u1", loaded_at)).await.unwrap());
        assert!(!cache.contains(&key("u1")));
        assert!(cache.invalidated_at(&key("u1")).unwrap() > loaded_at);

        let fresh = cache.next_revision();
        assert!(cache.put(key("u1"), snapshot_at("u1", fresh)).await.unwrap());
        assert!(cache.contains(&key("u1")));

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.stale_puts, 1);
        assert_eq!(stats.puts, 1);
    }

    #[tokio::test]
    async fn test_older_snapshot_does_not_replace_newer() {
        let cache = InMemoryDistributedCache::new(8);
        assert!(cache.put(key("u1"), snapshot_at("u1", 5)).await.unwrap());
        assert!(!cache.put(key("u1"), snapshot_at("u1", 3)).await.unwrap());

        let cached = cache.get(&key("u1")).await.unwrap().unwrap();
        assert_eq!(cached.cache_timestamp(), 5);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidation_reaches_subscribers() {
        let cache = InMemoryDistributedCache::new(8);
        let mut member = cache.subscribe_invalidations();

        cache.invalidate(&key("u9")).await.unwrap();
        assert_eq!(member.recv().await.unwrap(), key("u9"));
    }

    #[test]
    fn test_revision_is_monotonic() {
        let cache = InMemoryDistributedCache::default();
        let a = cache.next_revision();
        let b = cache.next_revision();
        assert!(b > a);
        assert_eq!(cache.segment_count(), DEFAULT_SEGMENT_COUNT);
    }
}
