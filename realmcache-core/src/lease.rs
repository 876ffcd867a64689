//! Bootstrap lease typestate for compile-time safety of leadership lifecycle.
//!
//! Only the node holding a `Lease<Held>` may drive a realm's bulk load.
//! Renewal and release are only available in the `Held` state, and release
//! consumes the lease so a stale handle cannot keep driving progress.
//!
//! # State Transition Diagram
//!
//! ```text
//! (free) ─── acquire() ──→ Held ─── release() ──→ (free)
//!                           │
//!                       renew() ↺
//! ```

use crate::{NodeId, RealmId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// LEASE DATA (internal storage, state-independent)
// ============================================================================

/// Persisted form of a bootstrap lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseData {
    pub lease_id: Uuid,
    pub realm: RealmId,
    pub holder: NodeId,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl LeaseData {
    pub fn new(realm: RealmId, holder: NodeId, now: Timestamp, ttl: Duration) -> Self {
        Self {
            lease_id: Uuid::now_v7(),
            realm,
            holder,
            acquired_at: now,
            expires_at: now + to_chrono(ttl),
        }
    }

    /// Check if the lease has expired based on current time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration)
        .unwrap_or_else(|_| chrono::Duration::milliseconds(duration.as_millis() as i64))
}

// ============================================================================
// TYPESTATE MARKERS
// ============================================================================

/// Marker trait for lease states.
pub trait LeaseState: private::Sealed + Send + Sync {}

/// Lease is currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Held;
impl LeaseState for Held {}

/// Lease has been released (for documentation; leases in this state don't exist at runtime).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Released;
impl LeaseState for Released {}

mod private {
    pub trait Sealed {}
    impl Sealed for super::Held {}
    impl Sealed for super::Released {}
}

// ============================================================================
// LEASE TYPESTATE WRAPPER
// ============================================================================

/// A bootstrap lease with compile-time state tracking.
#[derive(Debug, Clone)]
pub struct Lease<S: LeaseState> {
    data: LeaseData,
    _state: PhantomData<S>,
}

impl<S: LeaseState> Lease<S> {
    pub fn data(&self) -> &LeaseData {
        &self.data
    }

    pub fn lease_id(&self) -> Uuid {
        self.data.lease_id
    }

    pub fn realm(&self) -> &RealmId {
        &self.data.realm
    }

    pub fn holder(&self) -> NodeId {
        self.data.holder
    }

    pub fn expires_at(&self) -> Timestamp {
        self.data.expires_at
    }
}

impl Lease<Held> {
    /// Wrap freshly acquired lease data.
    ///
    /// Only leader election implementations should call this.
    pub fn new(data: LeaseData) -> Self {
        Lease {
            data,
            _state: PhantomData,
        }
    }

    /// Push the expiry out by `ttl` from `now`.
    pub fn renew(mut self, now: Timestamp, ttl: Duration) -> Self {
        self.data.expires_at = now + to_chrono(ttl);
        self
    }

    /// Release the lease and return the underlying data.
    pub fn release(self) -> LeaseData {
        self.data
    }
}

// ============================================================================
// STORAGE BOUNDARY: STORED LEASE
// ============================================================================

/// A lease as stored by the coordination service (state-agnostic).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredLease {
    pub data: LeaseData,
    pub is_active: bool,
}

impl StoredLease {
    /// Convert to a held lease if it is active and not expired.
    pub fn into_held(self, now: Timestamp) -> Result<Lease<Held>, LeaseStateError> {
        if !self.is_active {
            return Err(LeaseStateError::NotActive {
                lease_id: self.data.lease_id,
            });
        }
        if self.data.is_expired(now) {
            return Err(LeaseStateError::Expired {
                lease_id: self.data.lease_id,
                expired_at: self.data.expires_at,
            });
        }
        Ok(Lease::new(self.data))
    }
}

/// Errors when transitioning lease states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStateError {
    NotActive { lease_id: Uuid },
    Expired { lease_id: Uuid, expired_at: Timestamp },
}

impl fmt::Display for LeaseStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseStateError::NotActive { lease_id } => {
                write!(f, "Lease {} is not active", lease_id)
            }
            LeaseStateError::Expired {
                lease_id,
                expired_at,
            } => {
                write!(f, "Lease {} expired at {}", lease_id, expired_at)
            }
        }
    }
}

impl std::error::Error for LeaseStateError {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn make_lease_data() -> LeaseData {
        LeaseData::new(
            RealmId::new("master"),
            Uuid::now_v7(),
            Utc::now(),
            Duration::from_secs(300),
        )
    }

    #[test]
    fn test_lease_renew_moves_expiry() {
        let data = make_lease_data();
        let original = data.expires_at;
        let lease = Lease::<Held>::new(data);

        let renewed = lease.renew(Utc::now() + chrono::Duration::minutes(1), Duration::from_secs(300));
        assert!(renewed.expires_at() > original);
    }

    #[test]
    fn test_lease_release_consumes() {
        let data = make_lease_data();
        let lease = Lease::<Held>::new(data.clone());

        let released = lease.release();
        assert_eq!(released.lease_id, data.lease_id);
    }

    #[test]
    fn test_stored_lease_conversion() {
        let data = make_lease_data();
        let stored = StoredLease {
            data: data.clone(),
            is_active: true,
        };

        let held = stored.into_held(Utc::now()).unwrap();
        assert_eq!(held.lease_id(), data.lease_id);
        assert_eq!(held.realm(), &RealmId::new("master"));
    }

    #[test]
    fn test_stored_lease_expired() {
        let now = Utc::now();
        let mut data = make_lease_data();
        data.expires_at = now - chrono::Duration::minutes(1);

        let stored = StoredLease {
            data,
            is_active: true,
        };

        assert!(matches!(
            stored.into_held(now),
            Err(LeaseStateError::Expired { .. })
        ));
    }

    #[test]
    fn test_stored_lease_inactive() {
        let stored = StoredLease {
            data: make_lease_data(),
            is_active: false,
        };
        assert!(matches!(
            stored.into_held(Utc::now()),
            Err(LeaseStateError::NotActive { .. })
        ));
    }
}
