//! realmcache Storage - Read-Through Identity Cache
//!
//! Sits in front of a durable identity store. Users are served from
//! immutable snapshots in a distributed cache and promoted to the store's
//! live object on first write. The bootstrap module warms the cache for a
//! whole realm after startup.

pub mod bootstrap;
pub mod cache;
pub mod store;

pub use store::{InMemoryUserStore, LiveUser, SegmentFault, UserModel, UserRecord, UserStore};

// Re-export cache types for callers
pub use cache::{
    segment_for, CacheStats, CachedUser, DistributedCache, InMemoryDistributedCache,
    InvalidationRegistry, PendingInvalidations, RealmScopedKey, SnapshotLoader, UserAdapter,
    UserCacheSession, DEFAULT_SEGMENT_COUNT,
};

// Re-export bootstrap types
pub use bootstrap::{
    BootstrapReport, BulkLoadCoordinator, InMemoryLeaderElection, InMemoryProgressStore,
    LeaderElection, ProgressEvent, ProgressSink, ProgressStore, RecordingProgressSink,
    SegmentProgress, TracingProgressSink,
};
