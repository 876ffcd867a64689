//! Immutable cached copy of a user.
//!
//! A `CachedUser` is built once from the durable store's live object and
//! never changes afterwards, with one exception: the attribute bag, the
//! required actions and the two relationship id sets may be left empty at
//! construction and filled on first access. Each of those cells is written
//! at most once; later reads see the first value.

use async_trait::async_trait;
use realmcache_core::{Attributes, CacheError, CacheResult, GroupId, RealmId, RoleId, UserId};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::realm_key::RealmScopedKey;
use crate::store::UserModel;

/// Capability to fetch the live user a snapshot was taken from.
///
/// Passed into the lazy accessors so the snapshot never holds on to a
/// request or session.
#[async_trait]
pub trait SnapshotLoader: Send + Sync {
    /// Live user backing the snapshot. Errors with not-found if it is gone.
    async fn load_user(&self) -> CacheResult<Arc<dyn UserModel>>;
}

/// Cached snapshot of a user.
#[derive(Debug)]
pub struct CachedUser {
    id: UserId,
    realm: RealmId,
    cache_timestamp: i64,
    created_timestamp: Option<i64>,
    username: Option<String>,
    enabled: bool,
    email_verified: bool,
    federation_link: Option<String>,
    service_account_client_link: Option<String>,
    cached_with: HashMap<String, BTreeSet<RealmScopedKey>>,
    attributes: OnceCell<Attributes>,
    required_actions: OnceCell<BTreeSet<String>>,
    role_mappings: OnceCell<BTreeSet<RoleId>>,
    groups: OnceCell<BTreeSet<GroupId>>,
}

impl CachedUser {
    /// Snapshot the scalar fields of `model`; collections load on demand.
    pub fn lazy(realm: RealmId, model: &dyn UserModel, cache_timestamp: i64) -> Self {
        Self {
            id: model.id().clone(),
            realm,
            cache_timestamp,
            created_timestamp: model.created_timestamp(),
            username: model.username(),
            enabled: model.is_enabled(),
            email_verified: model.is_email_verified(),
            federation_link: model.federation_link(),
            service_account_client_link: model.service_account_client_link(),
            cached_with: HashMap::new(),
            attributes: OnceCell::new(),
            required_actions: OnceCell::new(),
            role_mappings: OnceCell::new(),
            groups: OnceCell::new(),
        }
    }

    /// Snapshot everything up front. Used by bulk load so a warm cache
    /// never calls back into the store.
    pub fn eager(realm: RealmId, model: &dyn UserModel, cache_timestamp: i64) -> Self {
        let mut user = Self::lazy(realm, model, cache_timestamp);
        user.attributes = OnceCell::from(model.attributes());
        user.required_actions = OnceCell::from(model.required_actions());
        user.role_mappings = OnceCell::from(model.role_mapping_ids());
        user.groups = OnceCell::from(model.group_ids());
        user
    }

    /// Record that `dependent` must be invalidated together with this entry.
    pub fn with_cached_with(mut self, dependency: impl Into<String>, dependent: RealmScopedKey) -> Self {
        self.cached_with
            .entry(dependency.into())
            .or_default()
            .insert(dependent);
        self
    }

    pub fn id(&self) -> &UserId {
        &self.id
    }

    pub fn realm(&self) -> &RealmId {
        &self.realm
    }

    pub fn key(&self) -> RealmScopedKey {
        RealmScopedKey::user(&self.realm, &self.id)
    }

    pub fn cache_timestamp(&self) -> i64 {
        self.cache_timestamp
    }

    pub fn created_timestamp(&self) -> Option<i64> {
        self.created_timestamp
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_email_verified(&self) -> bool {
        self.email_verified
    }

    pub fn federation_link(&self) -> Option<&str> {
        self.federation_link.as_deref()
    }

    pub fn service_account_client_link(&self) -> Option<&str> {
        self.service_account_client_link.as_deref()
    }

    pub fn cached_with(&self) -> &HashMap<String, BTreeSet<RealmScopedKey>> {
        &self.cached_with
    }

    /// Every entry that has to go when this one is invalidated.
    pub fn dependents(&self) -> impl Iterator<Item = &RealmScopedKey> {
        self.cached_with.values().flatten()
    }

    pub async fn attributes(&self, loader: &dyn SnapshotLoader) -> CacheResult<&Attributes> {
        self.attributes
            .get_or_try_init(|| async { Ok::<_, CacheError>(loader.load_user().await?.attributes()) })
            .await
    }

    pub async fn required_actions(&self, loader: &dyn SnapshotLoader) -> CacheResult<&BTreeSet<String>> {
        self.required_actions
            .get_or_try_init(|| async { Ok::<_, CacheError>(loader.load_user().await?.required_actions()) })
            .await
    }

    pub async fn role_mappings(&self, loader: &dyn SnapshotLoader) -> CacheResult<&BTreeSet<RoleId>> {
        self.role_mappings
            .get_or_try_init(|| async { Ok::<_, CacheError>(loader.load_user().await?.role_mapping_ids()) })
            .await
    }

    pub async fn groups(&self, loader: &dyn SnapshotLoader) -> CacheResult<&BTreeSet<GroupId>> {
        self.groups
            .get_or_try_init(|| async { Ok::<_, CacheError>(loader.load_user().await?.group_ids()) })
            .await
    }

    /// True once the attribute bag has been filled.
    pub fn attributes_loaded(&self) -> bool {
        self.attributes.initialized()
    }
}
