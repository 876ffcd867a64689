//! Per-unit-of-work user cache.
//!
//! One `UserCacheSession` serves one request. It hands out
//! [`UserAdapter`]s over cached snapshots, collects the invalidations the
//! adapters register while materializing, and broadcasts them on
//! [`UserCacheSession::commit`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use realmcache_core::{CacheResult, RealmId, UserId};
use tracing::{debug, info, warn};

use super::adapter::UserAdapter;
use super::realm_key::RealmScopedKey;
use super::snapshot::CachedUser;
use super::traits::{DistributedCache, InvalidationRegistry};
use crate::store::UserStore;

/// Keys made stale by the current unit of work.
#[derive(Debug, Default)]
pub struct PendingInvalidations {
    keys: Mutex<BTreeSet<RealmScopedKey>>,
}

impl PendingInvalidations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: RealmScopedKey) {
        self.lock().insert(key);
    }

    pub fn contains(&self, key: &RealmScopedKey) -> bool {
        self.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Pending keys in broadcast order.
    pub fn keys(&self) -> Vec<RealmScopedKey> {
        self.lock().iter().cloned().collect()
    }

    pub fn remove(&self, key: &RealmScopedKey) -> bool {
        self.lock().remove(key)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<RealmScopedKey>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InvalidationRegistry for PendingInvalidations {
    fn register_user_invalidation(&self, realm: &RealmId, cached: &CachedUser) {
        let mut keys = self.lock();
        keys.insert(RealmScopedKey::user(realm, cached.id()));
        keys.extend(cached.dependents().cloned());
    }
}

/// Read-through user cache scoped to one unit of work.
pub struct UserCacheSession<S: UserStore, C: DistributedCache> {
    store: Arc<S>,
    cache: Arc<C>,
    pending: Arc<PendingInvalidations>,
    managed: Mutex<HashMap<RealmScopedKey, Arc<UserAdapter<S>>>>,
}

impl<S: UserStore, C: DistributedCache> UserCacheSession<S, C> {
    pub fn new(store: Arc<S>, cache: Arc<C>) -> Self {
        Self {
            store,
            cache,
            pending: Arc::new(PendingInvalidations::new()),
            managed: Mutex::new(HashMap::new()),
        }
    }

    /// Invalidations registered so far and not yet committed.
    pub fn pending(&self) -> &PendingInvalidations {
        &self.pending
    }

    /// Look a user up, preferring this session's adapter, then the
    /// distributed cache, then the durable store.
    ///
    /// A user already invalidated in this session is never served from the
    /// distributed cache and never written back to it.
    pub async fn user_by_id(
        &self,
        realm: &RealmId,
        id: &UserId,
    ) -> CacheResult<Option<Arc<UserAdapter<S>>>> {
        let key = RealmScopedKey::user(realm, id);
        let existing = self.managed().get(&key).cloned();
        if existing.is_some() {
            return Ok(existing);
        }

        let cached = if self.pending.contains(&key) {
            debug!(key = %key, "User invalidated in this session, bypassing cache");
            match self.store.user_by_id(realm, id).await? {
                Some(live) => Arc::new(CachedUser::eager(
                    realm.clone(),
                    live.as_ref(),
                    self.cache.next_revision(),
                )),
                None => return Ok(None),
            }
        } else if let Some(hit) = self.cache.get(&key).await? {
            hit
        } else {
            // Stamped before the read so a concurrent invalidation wins.
            let revision = self.cache.next_revision();
            let Some(live) = self.store.user_by_id(realm, id).await? else {
                return Ok(None);
            };
            let snapshot = Arc::new(CachedUser::lazy(realm.clone(), live.as_ref(), revision));
            if self.cache.put(key.clone(), Arc::clone(&snapshot)).await? {
                debug!(key = %key, revision, "Cached user on miss");
            } else {
                debug!(key = %key, revision, "User invalidated while loading, not cached");
            }
            snapshot
        };

        let adapter = Arc::new(UserAdapter::new(
            cached,
            Arc::clone(&self.store),
            Arc::clone(&self.pending) as Arc<dyn InvalidationRegistry>,
        ));
        let adapter = Arc::clone(self.managed().entry(key).or_insert(adapter));
        Ok(Some(adapter))
    }

    /// Invalidate a user that may not have been loaded in this session.
    pub async fn invalidate_user(&self, realm: &RealmId, id: &UserId) -> CacheResult<()> {
        let key = RealmScopedKey::user(realm, id);
        let adapter = self.managed().get(&key).cloned();
        match adapter {
            Some(adapter) => adapter.invalidate().await,
            None => {
                self.pending.insert(key);
                Ok(())
            }
        }
    }

    /// Broadcast every pending invalidation and drop adapters that
    /// materialized. Returns the number of invalidations sent.
    ///
    /// A key leaves the pending set only once its broadcast succeeded.
    pub async fn commit(&self) -> CacheResult<usize> {
        let keys = self.pending.keys();
        for key in &keys {
            if let Err(e) = self.cache.invalidate(key).await {
                warn!(
                    key = %key,
                    remaining = self.pending.len(),
                    error = %e,
                    "Invalidation broadcast failed, keeping keys pending"
                );
                return Err(e);
            }
            self.pending.remove(key);
        }

        let evicted = {
            let mut managed = self.managed();
            let before = managed.len();
            managed.retain(|_, adapter| !adapter.is_marked_for_eviction());
            before - managed.len()
        };

        if !keys.is_empty() {
            info!(invalidations = keys.len(), evicted, "Committed user cache session");
        }
        Ok(keys.len())
    }

    fn managed(&self) -> std::sync::MutexGuard<'_, HashMap<RealmScopedKey, Arc<UserAdapter<S>>>> {
        self.managed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
