//! Durable identity store contract and in-memory implementation.
//!
//! The durable store is the source of truth the cache sits in front of.
//! `UserStore` is the narrow async contract the cache uses; `UserModel` is
//! the live, mutable domain object the store hands out for one user.

use async_trait::async_trait;
use realmcache_core::{
    attr, Attributes, CacheError, CacheResult, Group, GroupId, RealmId, Role, RoleId,
    StoreError, UserId,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::cache::realm_key::segment_for;

// ============================================================================
// CONTRACTS
// ============================================================================

/// Live handle to a user held by the durable store.
///
/// Mutations apply to the store's copy directly; callers never need to
/// write the object back.
pub trait UserModel: Send + Sync + fmt::Debug {
    fn id(&self) -> &UserId;

    /// Set once at creation.
    fn created_timestamp(&self) -> Option<i64>;

    fn username(&self) -> Option<String> {
        self.first_attribute(attr::USERNAME)
    }

    fn first_attribute(&self, name: &str) -> Option<String>;
    fn attribute(&self, name: &str) -> Vec<String>;
    fn attributes(&self) -> Attributes;
    fn set_single_attribute(&self, name: &str, value: &str);
    fn set_attribute(&self, name: &str, values: Vec<String>);
    fn remove_attribute(&self, name: &str);

    fn is_enabled(&self) -> bool;
    fn set_enabled(&self, enabled: bool);
    fn is_email_verified(&self) -> bool;
    fn set_email_verified(&self, verified: bool);
    fn federation_link(&self) -> Option<String>;
    fn set_federation_link(&self, link: Option<String>);
    fn service_account_client_link(&self) -> Option<String>;
    fn set_service_account_client_link(&self, client: Option<String>);

    fn required_actions(&self) -> BTreeSet<String>;
    fn add_required_action(&self, action: &str);
    fn remove_required_action(&self, action: &str);

    fn role_mapping_ids(&self) -> BTreeSet<RoleId>;
    fn grant_role(&self, role: &RoleId);
    fn delete_role_mapping(&self, role: &RoleId);

    fn group_ids(&self) -> BTreeSet<GroupId>;
    fn join_group(&self, group: &GroupId);
    fn leave_group(&self, group: &GroupId);
}

/// Durable store contract used by the cache layer.
#[async_trait]
pub trait UserStore: Send + Sync + 'static {
    /// Live user by id, `None` if the store no longer has it.
    async fn user_by_id(&self, realm: &RealmId, id: &UserId)
        -> CacheResult<Option<Arc<dyn UserModel>>>;

    async fn role_by_id(&self, realm: &RealmId, id: &RoleId) -> CacheResult<Option<Role>>;

    async fn group_by_id(&self, realm: &RealmId, id: &GroupId) -> CacheResult<Option<Group>>;

    /// Ids of the users living in `segment` out of `segment_count`.
    ///
    /// Finite and restartable: calling it again for the same segment
    /// enumerates the same users (minus concurrent deletions).
    async fn user_ids_in_segment(
        &self,
        realm: &RealmId,
        segment: usize,
        segment_count: usize,
    ) -> CacheResult<Vec<UserId>>;
}

// ============================================================================
// LIVE USER
// ============================================================================

/// Mutable state of a stored user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRecord {
    pub attributes: Attributes,
    pub enabled: bool,
    pub email_verified: bool,
    pub federation_link: Option<String>,
    pub service_account_client_link: Option<String>,
    pub required_actions: BTreeSet<String>,
    pub role_mappings: BTreeSet<RoleId>,
    pub groups: BTreeSet<GroupId>,
}

impl UserRecord {
    pub fn new(username: &str) -> Self {
        let mut attributes = Attributes::new();
        attributes.set_single(attr::USERNAME, username.to_lowercase());
        Self {
            attributes,
            enabled: true,
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes.set_single(name, value);
        self
    }

    pub fn with_role(mut self, role: impl Into<RoleId>) -> Self {
        self.role_mappings.insert(role.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<GroupId>) -> Self {
        self.groups.insert(group.into());
        self
    }

    pub fn with_required_action(mut self, action: &str) -> Self {
        self.required_actions.insert(action.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// A user as held by [`InMemoryUserStore`].
#[derive(Debug)]
pub struct LiveUser {
    id: UserId,
    created_timestamp: Option<i64>,
    record: RwLock<UserRecord>,
}

impl LiveUser {
    pub fn new(id: UserId, created_timestamp: Option<i64>, record: UserRecord) -> Self {
        Self {
            id,
            created_timestamp,
            record: RwLock::new(record),
        }
    }

    fn read<T>(&self, f: impl FnOnce(&UserRecord) -> T) -> T {
        let guard = self.record.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write(&self, f: impl FnOnce(&mut UserRecord)) {
        let mut guard = self.record.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Copy of the current record.
    pub fn record(&self) -> UserRecord {
        self.read(|r| r.clone())
    }
}

impl UserModel for LiveUser {
    fn id(&self) -> &UserId {
        &self.id
    }

    fn created_timestamp(&self) -> Option<i64> {
        self.created_timestamp
    }

    fn first_attribute(&self, name: &str) -> Option<String> {
        self.read(|r| r.attributes.first(name).map(str::to_string))
    }

    fn attribute(&self, name: &str) -> Vec<String> {
        self.read(|r| r.attributes.get(name).map(<[String]>::to_vec).unwrap_or_default())
    }

    fn attributes(&self) -> Attributes {
        self.read(|r| r.attributes.clone())
    }

    fn set_single_attribute(&self, name: &str, value: &str) {
        self.write(|r| r.attributes.set_single(name, value))
    }

    fn set_attribute(&self, name: &str, values: Vec<String>) {
        self.write(|r| r.attributes.set(name, values))
    }

    fn remove_attribute(&self, name: &str) {
        self.write(|r| {
            r.attributes.remove(name);
        })
    }

    fn is_enabled(&self) -> bool {
        self.read(|r| r.enabled)
    }

    fn set_enabled(&self, enabled: bool) {
        self.write(|r| r.enabled = enabled)
    }

    fn is_email_verified(&self) -> bool {
        self.read(|r| r.email_verified)
    }

    fn set_email_verified(&self, verified: bool) {
        self.write(|r| r.email_verified = verified)
    }

    fn federation_link(&self) -> Option<String> {
        self.read(|r| r.federation_link.clone())
    }

    fn set_federation_link(&self, link: Option<String>) {
        self.write(|r| r.federation_link = link)
    }

    fn service_account_client_link(&self) -> Option<String> {
        self.read(|r| r.service_account_client_link.clone())
    }

    fn set_service_account_client_link(&self, client: Option<String>) {
        self.write(|r| r.service_account_client_link = client)
    }

    fn required_actions(&self) -> BTreeSet<String> {
        self.read(|r| r.required_actions.clone())
    }

    fn add_required_action(&self, action: &str) {
        self.write(|r| {
            r.required_actions.insert(action.to_string());
        })
    }

    fn remove_required_action(&self, action: &str) {
        self.write(|r| {
            r.required_actions.remove(action);
        })
    }

    fn role_mapping_ids(&self) -> BTreeSet<RoleId> {
        self.read(|r| r.role_mappings.clone())
    }

    fn grant_role(&self, role: &RoleId) {
        self.write(|r| {
            r.role_mappings.insert(role.clone());
        })
    }

    fn delete_role_mapping(&self, role: &RoleId) {
        self.write(|r| {
            r.role_mappings.remove(role);
        })
    }

    fn group_ids(&self) -> BTreeSet<GroupId> {
        self.read(|r| r.groups.clone())
    }

    fn join_group(&self, group: &GroupId) {
        self.write(|r| {
            r.groups.insert(group.clone());
        })
    }

    fn leave_group(&self, group: &GroupId) {
        self.write(|r| {
            r.groups.remove(group);
        })
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Kind of failure injected into segment enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFault {
    /// Store unavailable; a later attempt succeeds.
    Transient,
    /// Corrupt data; retrying does not help.
    Fatal,
}

#[derive(Debug, Default)]
struct RealmData {
    users: BTreeMap<UserId, Arc<LiveUser>>,
    roles: HashMap<RoleId, Role>,
    groups: HashMap<GroupId, Group>,
}

/// In-memory durable store for tests and local tooling.
///
/// Supports fault injection on segment enumeration and counts lookups so
/// callers can assert how often the cache went through to the store.
#[derive(Debug, Default)]
pub struct InMemoryUserStore {
    realms: RwLock<HashMap<RealmId, RealmData>>,
    faults: Mutex<HashMap<usize, (SegmentFault, u32)>>,
    user_lookups: AtomicUsize,
    segment_scans: AtomicUsize,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_realm<T>(&self, realm: &RealmId, f: impl FnOnce(&mut RealmData) -> T) -> CacheResult<T> {
        let mut realms = self.realms.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(f(realms.entry(realm.clone()).or_default()))
    }

    fn read_realm<T>(&self, realm: &RealmId, f: impl FnOnce(Option<&RealmData>) -> T) -> CacheResult<T> {
        let realms = self.realms.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(f(realms.get(realm)))
    }

    /// Insert or replace a user and return its live handle.
    pub fn insert_user(
        &self,
        realm: &RealmId,
        id: impl Into<UserId>,
        created_timestamp: Option<i64>,
        record: UserRecord,
    ) -> CacheResult<Arc<LiveUser>> {
        let id = id.into();
        let user = Arc::new(LiveUser::new(id.clone(), created_timestamp, record));
        self.with_realm(realm, |data| {
            data.users.insert(id, Arc::clone(&user));
        })?;
        Ok(user)
    }

    pub fn remove_user(&self, realm: &RealmId, id: &UserId) -> CacheResult<bool> {
        self.with_realm(realm, |data| data.users.remove(id).is_some())
    }

    pub fn insert_role(&self, realm: &RealmId, role: Role) -> CacheResult<()> {
        self.with_realm(realm, |data| {
            data.roles.insert(role.id.clone(), role);
        })
    }

    pub fn remove_role(&self, realm: &RealmId, id: &RoleId) -> CacheResult<bool> {
        self.with_realm(realm, |data| data.roles.remove(id).is_some())
    }

    pub fn insert_group(&self, realm: &RealmId, group: Group) -> CacheResult<()> {
        self.with_realm(realm, |data| {
            data.groups.insert(group.id.clone(), group);
        })
    }

    pub fn remove_group(&self, realm: &RealmId, id: &GroupId) -> CacheResult<bool> {
        self.with_realm(realm, |data| data.groups.remove(id).is_some())
    }

    pub fn user_count(&self, realm: &RealmId) -> CacheResult<usize> {
        self.read_realm(realm, |data| data.map(|d| d.users.len()).unwrap_or(0))
    }

    /// Make the next `times` enumerations of `segment` fail with `fault`.
    pub fn inject_segment_fault(&self, segment: usize, fault: SegmentFault, times: u32) -> CacheResult<()> {
        let mut faults = self.faults.lock().map_err(|_| StoreError::LockPoisoned)?;
        faults.insert(segment, (fault, times));
        Ok(())
    }

    /// Number of `user_by_id` calls served so far.
    pub fn user_lookups(&self) -> usize {
        self.user_lookups.load(Ordering::SeqCst)
    }

    /// Number of segment enumerations attempted so far.
    pub fn segment_scans(&self) -> usize {
        self.segment_scans.load(Ordering::SeqCst)
    }

    fn take_fault(&self, segment: usize) -> CacheResult<Option<SegmentFault>> {
        let mut faults = self.faults.lock().map_err(|_| StoreError::LockPoisoned)?;
        let Some((fault, remaining)) = faults.get_mut(&segment) else {
            return Ok(None);
        };
        let fault = *fault;
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            faults.remove(&segment);
        }
        Ok(Some(fault))
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn user_by_id(
        &self,
        realm: &RealmId,
        id: &UserId,
    ) -> CacheResult<Option<Arc<dyn UserModel>>> {
        self.user_lookups.fetch_add(1, Ordering::SeqCst);
        self.read_realm(realm, |data| {
            data.and_then(|d| d.users.get(id))
                .map(|u| Arc::clone(u) as Arc<dyn UserModel>)
        })
    }

    async fn role_by_id(&self, realm: &RealmId, id: &RoleId) -> CacheResult<Option<Role>> {
        self.read_realm(realm, |data| data.and_then(|d| d.roles.get(id)).cloned())
    }

    async fn group_by_id(&self, realm: &RealmId, id: &GroupId) -> CacheResult<Option<Group>> {
        self.read_realm(realm, |data| data.and_then(|d| d.groups.get(id)).cloned())
    }

    async fn user_ids_in_segment(
        &self,
        realm: &RealmId,
        segment: usize,
        segment_count: usize,
    ) -> CacheResult<Vec<UserId>> {
        self.segment_scans.fetch_add(1, Ordering::SeqCst);
        match self.take_fault(segment)? {
            Some(SegmentFault::Transient) => {
                return Err(CacheError::Store(StoreError::Unavailable {
                    reason: format!("segment {} temporarily unavailable", segment),
                }))
            }
            Some(SegmentFault::Fatal) => {
                return Err(CacheError::Store(StoreError::Corrupt {
                    id: format!("segment-{}", segment),
                    reason: "malformed user record".to_string(),
                }))
            }
            None => {}
        }

        self.read_realm(realm, |data| {
            data.map(|d| {
                d.users
                    .keys()
                    .filter(|id| segment_for(id.as_str(), segment_count) == segment)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn realm() -> RealmId {
        RealmId::new("test")
    }

    #[tokio::test]
    async fn test_user_by_id_returns_live_handle() {
        let store = InMemoryUserStore::new();
        let live = store
            .insert_user(&realm(), "u1", Some(1000), UserRecord::new("Alice"))
            .unwrap();

        let model = store.user_by_id(&realm(), &UserId::new("u1")).await.unwrap().unwrap();
        model.set_enabled(false);

        assert!(!live.is_enabled());
        assert_eq!(model.username().as_deref(), Some("alice"));
        assert_eq!(store.user_lookups(), 1);
    }

    #[tokio::test]
    async fn test_missing_user_is_none() {
        let store = InMemoryUserStore::new();
        let found = store.user_by_id(&realm(), &UserId::new("ghost")).await.unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_segments_partition_all_users() {
        let store = InMemoryUserStore::new();
        for i in 0..50 {
            store
                .insert_user(&realm(), format!("u{}", i), None, UserRecord::new(&format!("user{}", i)))
                .unwrap();
        }

        let mut seen = BTreeSet::new();
        for segment in 0..8 {
            for id in store.user_ids_in_segment(&realm(), segment, 8).await.unwrap() {
                assert!(seen.insert(id), "user enumerated in two segments");
            }
        }
        assert_eq!(seen.len(), 50);
    }

    #[tokio::test]
    async fn test_transient_fault_clears_after_count() {
        let store = InMemoryUserStore::new();
        store.inject_segment_fault(2, SegmentFault::Transient, 2).unwrap();

        let first = store.user_ids_in_segment(&realm(), 2, 4).await.unwrap_err();
        assert!(first.is_transient());
        assert!(store.user_ids_in_segment(&realm(), 2, 4).await.is_err());
        assert!(store.user_ids_in_segment(&realm(), 2, 4).await.is_ok());
        assert_eq!(store.segment_scans(), 3);
    }

    #[tokio::test]
    async fn test_fatal_fault_is_not_transient() {
        let store = InMemoryUserStore::new();
        store.inject_segment_fault(0, SegmentFault::Fatal, 1).unwrap();
        let err = store.user_ids_in_segment(&realm(), 0, 4).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
