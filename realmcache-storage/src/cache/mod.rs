//! Read-through user cache with realm isolation.
//!
//! Reads are served from immutable [`CachedUser`] snapshots held in the
//! distributed cache. Writes go through a [`UserAdapter`], which promotes
//! itself to the durable store's live object exactly once and registers
//! the user for cluster-wide invalidation before doing so.
//!
//! # Realm Isolation
//!
//! The [`RealmScopedKey`] type cannot be constructed without a realm, so a
//! cache lookup can never cross realms.
//!
//! # Example
//!
//! ```ignore
//! let session = UserCacheSession::new(store, cache);
//!
//! // Served from the snapshot, no store round-trip on a hit
//! let user = session.user_by_id(&realm, &user_id).await?;
//!
//! // First write materializes and registers the invalidation
//! user.set_email(Some("b@x.com")).await?;
//!
//! // Broadcast to the cluster
//! session.commit().await?;
//! ```

pub mod adapter;
pub mod in_memory;
pub mod realm_key;
pub mod session;
pub mod snapshot;
pub mod traits;

pub use adapter::UserAdapter;
pub use in_memory::{InMemoryDistributedCache, DEFAULT_SEGMENT_COUNT};
pub use realm_key::{segment_for, RealmScopedKey};
pub use session::{PendingInvalidations, UserCacheSession};
pub use snapshot::{CachedUser, SnapshotLoader};
pub use traits::{CacheStats, DistributedCache, InvalidationRegistry};
