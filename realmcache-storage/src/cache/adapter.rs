//! Read-through user adapter.
//!
//! A `UserAdapter` presents one logical user. While unmodified it answers
//! from the immutable [`CachedUser`] snapshot. The first mutation (or an
//! explicit [`UserAdapter::invalidate`]) materializes it: the user is
//! registered for cluster-wide invalidation and the live object is fetched
//! from the durable store. From then on every read and write goes to the
//! live object and the snapshot is never consulted again.
//!
//! The materialized state lives in a single-assignment cell. Concurrent
//! callers racing on the first write wait for one fetch; the transition is
//! one-way for the lifetime of the adapter.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use realmcache_core::{
    attr, normalize_identity_value, Attributes, CacheError, CacheResult, CachedKind, Group,
    GroupId, RealmId, Role, RoleId, UserId,
};
use tokio::sync::OnceCell;
use tracing::debug;

use super::snapshot::{CachedUser, SnapshotLoader};
use super::traits::InvalidationRegistry;
use crate::store::{UserModel, UserStore};

/// Result of the one materialization attempt that reached the store.
enum Materialized {
    Live(Arc<dyn UserModel>),
    /// The store no longer had the user. The adapter is poisoned.
    Gone,
}

/// A cached relationship id no longer resolves.
#[derive(Debug)]
struct StaleRelationship {
    kind: CachedKind,
    id: String,
}

enum Resolved<T> {
    Complete(Vec<T>),
    Stale(StaleRelationship),
}

/// Cache-backed view of a user.
pub struct UserAdapter<S: UserStore> {
    cached: Arc<CachedUser>,
    store: Arc<S>,
    invalidations: Arc<dyn InvalidationRegistry>,
    updated: OnceCell<Materialized>,
}

impl<S: UserStore> UserAdapter<S> {
    pub fn new(
        cached: Arc<CachedUser>,
        store: Arc<S>,
        invalidations: Arc<dyn InvalidationRegistry>,
    ) -> Self {
        Self {
            cached,
            store,
            invalidations,
            updated: OnceCell::new(),
        }
    }

    pub fn id(&self) -> &UserId {
        self.cached.id()
    }

    pub fn realm(&self) -> &RealmId {
        self.cached.realm()
    }

    /// The snapshot this adapter was built over.
    pub fn cached(&self) -> &Arc<CachedUser> {
        &self.cached
    }

    /// True once a materialization has reached the store, including the
    /// case where the store reported the user deleted.
    pub fn is_marked_for_eviction(&self) -> bool {
        self.updated.initialized()
    }

    /// Promote to the live object, at most one store fetch per adapter.
    ///
    /// The invalidation is registered before the fetch so other members stop
    /// trusting the snapshot before this one starts trusting the live object.
    /// Fails with not-found if the user was deleted; every later call fails
    /// the same way.
    pub async fn ensure_materialized(&self) -> CacheResult<Arc<dyn UserModel>> {
        let state = self
            .updated
            .get_or_try_init(|| async {
                self.invalidations
                    .register_user_invalidation(self.realm(), &self.cached);
                let live = self.store.user_by_id(self.realm(), self.id()).await?;
                debug!(
                    realm = %self.realm(),
                    user = %self.id(),
                    found = live.is_some(),
                    "Materialized cached user"
                );
                Ok::<_, CacheError>(match live {
                    Some(delegate) => Materialized::Live(delegate),
                    None => Materialized::Gone,
                })
            })
            .await?;

        match state {
            Materialized::Live(delegate) => Ok(Arc::clone(delegate)),
            Materialized::Gone => Err(CacheError::user_not_found(self.id().as_str())),
        }
    }

    /// Mark the user stale for the current unit of work.
    ///
    /// A concurrently deleted user is already as invalid as it gets, so
    /// not-found is not an error here.
    pub async fn invalidate(&self) -> CacheResult<()> {
        match self.ensure_materialized().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// `None` while cached-only, the live object once materialized.
    fn delegate(&self) -> CacheResult<Option<&Arc<dyn UserModel>>> {
        match self.updated.get() {
            None => Ok(None),
            Some(Materialized::Live(delegate)) => Ok(Some(delegate)),
            Some(Materialized::Gone) => Err(CacheError::user_not_found(self.id().as_str())),
        }
    }

    // ------------------------------------------------------------------
    // Scalar reads
    // ------------------------------------------------------------------

    /// Always the snapshot's value; it never changes after creation.
    pub fn created_timestamp(&self) -> Option<i64> {
        self.cached.created_timestamp()
    }

    pub fn username(&self) -> CacheResult<Option<String>> {
        Ok(match self.delegate()? {
            Some(d) => d.username(),
            None => self.cached.username().map(str::to_string),
        })
    }

    pub fn is_enabled(&self) -> CacheResult<bool> {
        Ok(match self.delegate()? {
            Some(d) => d.is_enabled(),
            None => self.cached.is_enabled(),
        })
    }

    pub fn is_email_verified(&self) -> CacheResult<bool> {
        Ok(match self.delegate()? {
            Some(d) => d.is_email_verified(),
            None => self.cached.is_email_verified(),
        })
    }

    pub fn federation_link(&self) -> CacheResult<Option<String>> {
        Ok(match self.delegate()? {
            Some(d) => d.federation_link(),
            None => self.cached.federation_link().map(str::to_string),
        })
    }

    pub fn service_account_client_link(&self) -> CacheResult<Option<String>> {
        Ok(match self.delegate()? {
            Some(d) => d.service_account_client_link(),
            None => self.cached.service_account_client_link().map(str::to_string),
        })
    }

    // ------------------------------------------------------------------
    // Attribute reads (may fill the snapshot's attribute bag)
    // ------------------------------------------------------------------

    pub async fn attributes(&self) -> CacheResult<Attributes> {
        if let Some(d) = self.delegate()? {
            return Ok(d.attributes());
        }
        Ok(self.cached.attributes(self).await?.clone())
    }

    pub async fn first_attribute(&self, name: &str) -> CacheResult<Option<String>> {
        if let Some(d) = self.delegate()? {
            return Ok(d.first_attribute(name));
        }
        let attributes = self.cached.attributes(self).await?;
        Ok(attributes.first(name).map(str::to_string))
    }

    pub async fn attribute(&self, name: &str) -> CacheResult<Vec<String>> {
        if let Some(d) = self.delegate()? {
            return Ok(d.attribute(name));
        }
        let attributes = self.cached.attributes(self).await?;
        Ok(attributes.get(name).map(<[String]>::to_vec).unwrap_or_default())
    }

    pub async fn email(&self) -> CacheResult<Option<String>> {
        self.first_attribute(attr::EMAIL).await
    }

    pub async fn first_name(&self) -> CacheResult<Option<String>> {
        self.first_attribute(attr::FIRST_NAME).await
    }

    pub async fn last_name(&self) -> CacheResult<Option<String>> {
        self.first_attribute(attr::LAST_NAME).await
    }

    pub async fn required_actions(&self) -> CacheResult<BTreeSet<String>> {
        if let Some(d) = self.delegate()? {
            return Ok(d.required_actions());
        }
        Ok(self.cached.required_actions(self).await?.clone())
    }

    // ------------------------------------------------------------------
    // Mutators: materialize, then write to the live object only
    // ------------------------------------------------------------------

    pub async fn set_username(&self, username: &str) -> CacheResult<()> {
        let delegate = self.ensure_materialized().await?;
        delegate.set_single_attribute(attr::USERNAME, &normalize_identity_value(username));
        Ok(())
    }

    pub async fn set_email(&self, email: Option<&str>) -> CacheResult<()> {
        let delegate = self.ensure_materialized().await?;
        match email {
            Some(email) => {
                delegate.set_single_attribute(attr::EMAIL, &normalize_identity_value(email))
            }
            None => delegate.remove_attribute(attr::EMAIL),
        }
        Ok(())
    }

    pub async fn set_first_name(&self, first_name: &str) -> CacheResult<()> {
        self.set_single_attribute(attr::FIRST_NAME, first_name).await
    }

    pub async fn set_last_name(&self, last_name: &str) -> CacheResult<()> {
        self.set_single_attribute(attr::LAST_NAME, last_name).await
    }

    pub async fn set_single_attribute(&self, name: &str, value: &str) -> CacheResult<()> {
        self.ensure_materialized().await?.set_single_attribute(name, value);
        Ok(())
    }

    pub async fn set_attribute(&self, name: &str, values: Vec<String>) -> CacheResult<()> {
        self.ensure_materialized().await?.set_attribute(name, values);
        Ok(())
    }

    pub async fn remove_attribute(&self, name: &str) -> CacheResult<()> {
        self.ensure_materialized().await?.remove_attribute(name);
        Ok(())
    }

    pub async fn set_enabled(&self, enabled: bool) -> CacheResult<()> {
        self.ensure_materialized().await?.set_enabled(enabled);
        Ok(())
    }

    pub async fn set_email_verified(&self, verified: bool) -> CacheResult<()> {
        self.ensure_materialized().await?.set_email_verified(verified);
        Ok(())
    }

    pub async fn set_federation_link(&self, link: Option<String>) -> CacheResult<()> {
        self.ensure_materialized().await?.set_federation_link(link);
        Ok(())
    }

    pub async fn set_service_account_client_link(&self, client: Option<String>) -> CacheResult<()> {
        self.ensure_materialized()
            .await?
            .set_service_account_client_link(client);
        Ok(())
    }

    pub async fn add_required_action(&self, action: &str) -> CacheResult<()> {
        self.ensure_materialized().await?.add_required_action(action);
        Ok(())
    }

    pub async fn remove_required_action(&self, action: &str) -> CacheResult<()> {
        self.ensure_materialized().await?.remove_required_action(action);
        Ok(())
    }

    pub async fn grant_role(&self, role: &RoleId) -> CacheResult<()> {
        self.ensure_materialized().await?.grant_role(role);
        Ok(())
    }

    pub async fn delete_role_mapping(&self, role: &RoleId) -> CacheResult<()> {
        self.ensure_materialized().await?.delete_role_mapping(role);
        Ok(())
    }

    pub async fn join_group(&self, group: &GroupId) -> CacheResult<()> {
        self.ensure_materialized().await?.join_group(group);
        Ok(())
    }

    pub async fn leave_group(&self, group: &GroupId) -> CacheResult<()> {
        self.ensure_materialized().await?.leave_group(group);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Relationship reads
    // ------------------------------------------------------------------

    /// Roles mapped directly to the user.
    ///
    /// If a cached role id no longer resolves the whole cached set is
    /// treated as stale: the adapter materializes and answers from the live
    /// object instead of returning a partial set.
    pub async fn role_mappings(&self) -> CacheResult<Vec<Role>> {
        if let Some(d) = self.delegate()? {
            return self.live_roles(d.as_ref()).await;
        }
        let ids = self.cached.role_mappings(self).await?;
        match self.resolve_roles(ids).await? {
            Resolved::Complete(roles) => Ok(roles),
            Resolved::Stale(stale) => {
                self.log_repair(&stale);
                let delegate = self.ensure_materialized().await?;
                self.live_roles(delegate.as_ref()).await
            }
        }
    }

    pub async fn realm_role_mappings(&self) -> CacheResult<Vec<Role>> {
        let realm = self.realm().clone();
        let roles = self.role_mappings().await?;
        Ok(roles.into_iter().filter(|r| r.is_realm_role_of(&realm)).collect())
    }

    pub async fn client_role_mappings(&self, client: &str) -> CacheResult<Vec<Role>> {
        let roles = self.role_mappings().await?;
        Ok(roles.into_iter().filter(|r| r.is_client_role_of(client)).collect())
    }

    /// Groups the user is a direct member of. Same repair rule as roles.
    pub async fn groups(&self) -> CacheResult<Vec<Group>> {
        if let Some(d) = self.delegate()? {
            return self.live_groups(d.as_ref()).await;
        }
        let ids = self.cached.groups(self).await?;
        match self.resolve_groups(ids).await? {
            Resolved::Complete(groups) => Ok(groups),
            Resolved::Stale(stale) => {
                self.log_repair(&stale);
                let delegate = self.ensure_materialized().await?;
                self.live_groups(delegate.as_ref()).await
            }
        }
    }

    /// Whether `role` is granted directly, through a composite, or through
    /// any group the user belongs to (including parent groups).
    pub async fn has_role(&self, role: &RoleId) -> CacheResult<bool> {
        if self.role_mappings().await?.iter().any(|r| r.has_role(role)) {
            return Ok(true);
        }
        for group in self.groups().await? {
            let mut visited = HashSet::new();
            let mut current = Some(group);
            while let Some(g) = current.take() {
                if !visited.insert(g.id.clone()) {
                    break;
                }
                if self.group_grants(&g, role).await? {
                    return Ok(true);
                }
                current = match &g.parent {
                    Some(parent) => self.store.group_by_id(self.realm(), parent).await?,
                    None => None,
                };
            }
        }
        Ok(false)
    }

    /// Whether the user is in `group` directly or through a subgroup.
    pub async fn is_member_of(&self, group: &GroupId) -> CacheResult<bool> {
        for g in self.groups().await? {
            let mut visited = HashSet::new();
            let mut current = Some(g);
            while let Some(g) = current.take() {
                if &g.id == group {
                    return Ok(true);
                }
                if !visited.insert(g.id.clone()) {
                    break;
                }
                current = match &g.parent {
                    Some(parent) => self.store.group_by_id(self.realm(), parent).await?,
                    None => None,
                };
            }
        }
        Ok(false)
    }

    async fn group_grants(&self, group: &Group, role: &RoleId) -> CacheResult<bool> {
        for id in &group.role_mappings {
            if id == role {
                return Ok(true);
            }
            if let Some(mapped) = self.store.role_by_id(self.realm(), id).await? {
                if mapped.has_role(role) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn resolve_roles(&self, ids: &BTreeSet<RoleId>) -> CacheResult<Resolved<Role>> {
        let mut roles = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.role_by_id(self.realm(), id).await? {
                Some(role) => roles.push(role),
                None => {
                    return Ok(Resolved::Stale(StaleRelationship {
                        kind: CachedKind::Role,
                        id: id.to_string(),
                    }))
                }
            }
        }
        Ok(Resolved::Complete(roles))
    }

    async fn resolve_groups(&self, ids: &BTreeSet<GroupId>) -> CacheResult<Resolved<Group>> {
        let mut groups = Vec::with_capacity(ids.len());
        for id in ids {
            match self.store.group_by_id(self.realm(), id).await? {
                Some(group) => groups.push(group),
                None => {
                    return Ok(Resolved::Stale(StaleRelationship {
                        kind: CachedKind::Group,
                        id: id.to_string(),
                    }))
                }
            }
        }
        Ok(Resolved::Complete(groups))
    }

    /// Live role mappings. Ids deleted concurrently are skipped.
    async fn live_roles(&self, delegate: &dyn UserModel) -> CacheResult<Vec<Role>> {
        let mut roles = Vec::new();
        for id in delegate.role_mapping_ids() {
            if let Some(role) = self.store.role_by_id(self.realm(), &id).await? {
                roles.push(role);
            }
        }
        Ok(roles)
    }

    async fn live_groups(&self, delegate: &dyn UserModel) -> CacheResult<Vec<Group>> {
        let mut groups = Vec::new();
        for id in delegate.group_ids() {
            if let Some(group) = self.store.group_by_id(self.realm(), &id).await? {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    fn log_repair(&self, stale: &StaleRelationship) {
        debug!(
            realm = %self.realm(),
            user = %self.id(),
            kind = %stale.kind,
            missing = %stale.id,
            "Cached relationship set is stale, materializing"
        );
    }
}

/// Fetches the live user without materializing, for lazy snapshot fills.
#[async_trait]
impl<S: UserStore> SnapshotLoader for UserAdapter<S> {
    async fn load_user(&self) -> CacheResult<Arc<dyn UserModel>> {
        self.store
            .user_by_id(self.realm(), self.id())
            .await?
            .ok_or_else(|| CacheError::user_not_found(self.id().as_str()))
    }
}

impl<S: UserStore> PartialEq for UserAdapter<S> {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl<S: UserStore> Eq for UserAdapter<S> {}

impl<S: UserStore> Hash for UserAdapter<S> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl<S: UserStore> fmt::Debug for UserAdapter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAdapter")
            .field("realm", self.realm())
            .field("id", self.id())
            .field("materialized", &self.is_marked_for_eviction())
            .finish()
    }
}
