//! Distributed cache and invalidation contracts.
//!
//! The grid runtime (replication, eviction, membership) lives outside this
//! crate; these traits are the narrow surface the cache layer relies on.

use async_trait::async_trait;
use realmcache_core::{CacheResult, RealmId};
use std::sync::Arc;

use super::realm_key::RealmScopedKey;
use super::snapshot::CachedUser;

/// Cluster-wide cache of user snapshots.
///
/// Implementations must provide per-key atomicity for `put`, `get` and
/// `invalidate`. `invalidate` reaches every cluster member at least once.
#[async_trait]
pub trait DistributedCache: Send + Sync + 'static {
    async fn get(&self, key: &RealmScopedKey) -> CacheResult<Option<Arc<CachedUser>>>;

    /// Store `snapshot` unless it is stale.
    ///
    /// A snapshot is stale when its `cache_timestamp` is not newer than the
    /// key's last invalidation, or is older than the snapshot already
    /// cached. Returns whether the snapshot was stored. Callers take the
    /// revision from [`next_revision`](Self::next_revision) before reading
    /// the store.
    async fn put(&self, key: RealmScopedKey, snapshot: Arc<CachedUser>) -> CacheResult<bool>;

    /// Drop `key` on every member of the cluster and stamp it with a fresh
    /// revision, so snapshots read before now are refused by `put`.
    async fn invalidate(&self, key: &RealmScopedKey) -> CacheResult<()>;

    /// Number of keyspace segments in the current topology.
    fn segment_count(&self) -> usize;

    /// Next value of the cache's logical clock, used to stamp snapshots.
    fn next_revision(&self) -> i64;

    async fn stats(&self) -> CacheResult<CacheStats>;
}

/// Records which cached entries the current unit of work made stale.
///
/// Registration is local and cheap; the enclosing session broadcasts the
/// collected invalidations when the unit of work commits.
pub trait InvalidationRegistry: Send + Sync {
    fn register_user_invalidation(&self, realm: &RealmId, cached: &CachedUser);
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of entries written.
    pub puts: u64,
    /// Number of writes refused as stale.
    pub stale_puts: u64,
    /// Number of invalidations broadcast.
    pub invalidations: u64,
}
