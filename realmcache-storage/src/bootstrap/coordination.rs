//! Cluster coordination contracts for bootstrap.
//!
//! `ProgressStore` persists a realm's [`SegmentProgress`] so a crashed run
//! resumes instead of restarting. `LeaderElection` makes sure exactly one
//! node drives a realm's bootstrap at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use realmcache_core::{
    CacheResult, Held, Lease, LeaseData, NodeId, RealmId, StoreError, StoredLease,
};
use tracing::debug;

use super::segments::SegmentProgress;

// ============================================================================
// PROGRESS RECORD STORE
// ============================================================================

/// Persisted bootstrap progress, keyed by realm.
#[async_trait]
pub trait ProgressStore: Send + Sync + 'static {
    async fn load(&self, realm: &RealmId) -> CacheResult<Option<SegmentProgress>>;

    async fn save(&self, realm: &RealmId, progress: &SegmentProgress) -> CacheResult<()>;

    async fn remove(&self, realm: &RealmId) -> CacheResult<()>;
}

/// Progress store keeping serialized records in memory.
#[derive(Debug, Default)]
pub struct InMemoryProgressStore {
    records: DashMap<RealmId, String>,
    saves: AtomicUsize,
}

impl InMemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored JSON record, if any.
    pub fn raw(&self, realm: &RealmId) -> Option<String> {
        self.records.get(realm).map(|r| r.value().clone())
    }

    /// Store a record verbatim, bypassing validation.
    pub fn put_raw(&self, realm: &RealmId, record: impl Into<String>) {
        self.records.insert(realm.clone(), record.into());
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProgressStore for InMemoryProgressStore {
    async fn load(&self, realm: &RealmId) -> CacheResult<Option<SegmentProgress>> {
        let Some(raw) = self.raw(realm) else {
            return Ok(None);
        };
        let progress = serde_json::from_str(&raw).map_err(|e| StoreError::Corrupt {
            id: format!("progress/{}", realm),
            reason: e.to_string(),
        })?;
        Ok(Some(progress))
    }

    async fn save(&self, realm: &RealmId, progress: &SegmentProgress) -> CacheResult<()> {
        let raw = serde_json::to_string(progress).map_err(|e| StoreError::Corrupt {
            id: format!("progress/{}", realm),
            reason: e.to_string(),
        })?;
        self.records.insert(realm.clone(), raw);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove(&self, realm: &RealmId) -> CacheResult<()> {
        self.records.remove(realm);
        Ok(())
    }
}

// ============================================================================
// LEADER ELECTION
// ============================================================================

/// Cluster-wide lock deciding which node drives a realm's bootstrap.
#[async_trait]
pub trait LeaderElection: Send + Sync + 'static {
    /// Try to become the bootstrap leader for `realm`.
    ///
    /// `None` if another node holds a live lease.
    async fn acquire_bootstrap_leadership(
        &self,
        realm: &RealmId,
        node: NodeId,
        ttl: Duration,
    ) -> CacheResult<Option<Lease<Held>>>;

    /// Whether `lease` is still the current, unexpired lease for its realm.
    async fn is_leader(&self, lease: &Lease<Held>) -> CacheResult<bool>;

    /// Extend `lease` to expire `ttl` from now.
    ///
    /// Returns `false` without extending if `lease` is no longer the leader.
    async fn renew_leadership(&self, lease: &Lease<Held>, ttl: Duration) -> CacheResult<bool>;

    async fn release(&self, lease: Lease<Held>) -> CacheResult<()>;
}

/// Leader election backed by a process-local lease table.
#[derive(Debug, Default)]
pub struct InMemoryLeaderElection {
    leases: Mutex<HashMap<RealmId, StoredLease>>,
}

impl InMemoryLeaderElection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the current lease for `realm`, as if it had been taken away by
    /// the cluster (partition, expiry, operator action).
    pub fn revoke(&self, realm: &RealmId) -> CacheResult<()> {
        let mut leases = self.leases.lock().map_err(|_| StoreError::LockPoisoned)?;
        if let Some(stored) = leases.get_mut(realm) {
            stored.is_active = false;
        }
        Ok(())
    }

    /// Node holding a live lease on `realm`.
    pub fn holder(&self, realm: &RealmId) -> CacheResult<Option<NodeId>> {
        let leases = self.leases.lock().map_err(|_| StoreError::LockPoisoned)?;
        let now = Utc::now();
        Ok(leases
            .get(realm)
            .filter(|s| s.is_active && !s.data.is_expired(now))
            .map(|s| s.data.holder))
    }
}

#[async_trait]
impl LeaderElection for InMemoryLeaderElection {
    async fn acquire_bootstrap_leadership(
        &self,
        realm: &RealmId,
        node: NodeId,
        ttl: Duration,
    ) -> CacheResult<Option<Lease<Held>>> {
        let mut leases = self.leases.lock().map_err(|_| StoreError::LockPoisoned)?;
        let now = Utc::now();

        if let Some(current) = leases.get(realm) {
            if current.is_active && !current.data.is_expired(now) && current.data.holder != node {
                debug!(realm = %realm, holder = %current.data.holder, "Bootstrap lease held elsewhere");
                return Ok(None);
            }
        }

        let data = LeaseData::new(realm.clone(), node, now, ttl);
        leases.insert(
            realm.clone(),
            StoredLease {
                data: data.clone(),
                is_active: true,
            },
        );
        Ok(Some(Lease::new(data)))
    }

    async fn is_leader(&self, lease: &Lease<Held>) -> CacheResult<bool> {
        let leases = self.leases.lock().map_err(|_| StoreError::LockPoisoned)?;
        let Some(stored) = leases.get(lease.realm()) else {
            return Ok(false);
        };
        Ok(stored
            .clone()
            .into_held(Utc::now())
            .map(|current| current.lease_id() == lease.lease_id())
            .unwrap_or(false))
    }

    async fn renew_leadership(&self, lease: &Lease<Held>, ttl: Duration) -> CacheResult<bool> {
        let mut leases = self.leases.lock().map_err(|_| StoreError::LockPoisoned)?;
        let now = Utc::now();
        let Some(stored) = leases.get_mut(lease.realm()) else {
            return Ok(false);
        };
        let current = match stored.clone().into_held(now) {
            Ok(current) if current.lease_id() == lease.lease_id() => current,
            _ => return Ok(false),
        };
        stored.data = current.renew(now, ttl).release();
        Ok(true)
    }

    async fn release(&self, lease: Lease<Held>) -> CacheResult<()> {
        let data = lease.release();
        let mut leases = self.leases.lock().map_err(|_| StoreError::LockPoisoned)?;
        if let Some(stored) = leases.get_mut(&data.realm) {
            if stored.data.lease_id == data.lease_id {
                stored.is_active = false;
            }
        }
        Ok(())
    }
}
