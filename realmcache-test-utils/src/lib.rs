//! realmcache Test Utilities
//!
//! Centralized test infrastructure for the realmcache workspace:
//! - Proptest generators for identity types and configuration
//! - Fixtures that seed the in-memory store
//! - Custom assertions for realmcache error variants
//! - A tracing subscriber for test output

pub use realmcache_core::{
    attr, Attributes, BootstrapConfig, BootstrapError, CacheError, CacheResult, ConfigError,
    Group, GroupId, RealmId, RetryConfig, Role, RoleId, StoreError, UserId,
};
pub use realmcache_storage::{
    InMemoryDistributedCache, InMemoryLeaderElection, InMemoryProgressStore, InMemoryUserStore,
    RecordingProgressSink, UserRecord,
};

use std::sync::{Arc, Once};
use std::time::Duration;

// ============================================================================
// TRACING
// ============================================================================

static TRACING: Once = Once::new();

/// Install a test-friendly tracing subscriber once per process.
///
/// Honours `RUST_LOG`; defaults to `realmcache_storage=debug,warn`.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    TRACING.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("realmcache_storage=debug,warn"));
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
        tracing::debug!("Test tracing initialized");
    });
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for realmcache types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a realm name.
    pub fn arb_realm_id() -> impl Strategy<Value = RealmId> {
        "[a-z][a-z0-9-]{0,15}".prop_map(RealmId::new)
    }

    /// Generate a user id.
    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        "[a-z0-9]{1,12}".prop_map(UserId::new)
    }

    /// Generate a multi-valued attribute bag.
    pub fn arb_attributes() -> impl Strategy<Value = Attributes> {
        prop::collection::btree_map(
            "[a-zA-Z]{1,10}",
            prop::collection::vec("[ -~]{0,16}", 1..4),
            0..6,
        )
        .prop_map(|map| map.into_iter().collect())
    }

    /// Generate a stored user record.
    pub fn arb_user_record() -> impl Strategy<Value = UserRecord> {
        (
            "[a-zA-Z][a-zA-Z0-9_.]{0,15}",
            arb_attributes(),
            any::<bool>(),
            any::<bool>(),
            prop::collection::btree_set("[a-z]{1,8}", 0..4),
            prop::collection::btree_set("[a-z]{1,8}", 0..4),
        )
            .prop_map(|(username, extra, enabled, verified, roles, groups)| {
                let mut record = UserRecord::new(&username);
                for (name, values) in extra.iter() {
                    if name != attr::USERNAME {
                        record.attributes.set(name.clone(), values.clone());
                    }
                }
                record.enabled = enabled;
                record.email_verified = verified;
                record.role_mappings = roles.into_iter().map(RoleId::new).collect();
                record.groups = groups.into_iter().map(GroupId::new).collect();
                record
            })
    }

    /// Generate a RetryConfig with capped backoff.
    pub fn arb_retry_config() -> impl Strategy<Value = RetryConfig> {
        (0u32..10, 1u64..1000, 1000u64..60000, 1.1f32..5.0f32).prop_map(
            |(max_retries, initial_ms, max_ms, multiplier)| RetryConfig {
                max_retries,
                initial_backoff: Duration::from_millis(initial_ms),
                max_backoff: Duration::from_millis(max_ms),
                backoff_multiplier: multiplier,
            },
        )
    }

    /// Generate a BootstrapConfig that passes validation.
    pub fn arb_valid_bootstrap_config() -> impl Strategy<Value = BootstrapConfig> {
        (1usize..256, 1usize..16, arb_retry_config(), 1u64..3600).prop_map(
            |(batch_size, load_concurrency, retry, ttl_secs)| BootstrapConfig {
                batch_size,
                load_concurrency,
                retry,
                lease_ttl: Duration::from_secs(ttl_secs),
            },
        )
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built fixtures for common scenarios.

    use super::*;

    /// The realm most tests run in.
    pub fn test_realm() -> RealmId {
        RealmId::new("test-realm")
    }

    /// Store holding `count` users `u0..u{count}` with usernames `user{i}`.
    pub fn seeded_store(realm: &RealmId, count: usize) -> Arc<InMemoryUserStore> {
        let store = Arc::new(InMemoryUserStore::new());
        for i in 0..count {
            let record = UserRecord::new(&format!("user{}", i))
                .with_attribute(attr::EMAIL, &format!("user{}@example.com", i));
            // A fresh in-memory store cannot fail to accept users.
            let _ = store.insert_user(realm, format!("u{}", i), Some(i as i64), record);
        }
        store
    }

    /// Realm roles `admin` (composite of `viewer`) and `viewer`, a client
    /// role `deploy` on client `ci`, and groups `eng` > `backend` where
    /// `eng` grants `deploy`.
    pub fn seed_roles_and_groups(store: &InMemoryUserStore, realm: &RealmId) -> CacheResult<()> {
        store.insert_role(
            realm,
            Role::realm_role("admin", "admin", realm.clone()).with_composite("viewer"),
        )?;
        store.insert_role(realm, Role::realm_role("viewer", "viewer", realm.clone()))?;
        store.insert_role(realm, Role::client_role("deploy", "deploy", "ci"))?;
        store.insert_group(realm, Group::new("eng", "engineering").with_role("deploy"))?;
        store.insert_group(realm, Group::new("backend", "backend").with_parent("eng"))?;
        Ok(())
    }

    /// Bootstrap config with no backoff so retry tests run instantly.
    pub fn fast_bootstrap_config(batch_size: usize) -> BootstrapConfig {
        BootstrapConfig::default()
            .with_batch_size(batch_size)
            .with_concurrency(4)
            .with_retry(RetryConfig::immediate(3))
    }

    /// Fresh distributed cache with `segments` segments.
    pub fn cache(segments: usize) -> Arc<InMemoryDistributedCache> {
        Arc::new(InMemoryDistributedCache::new(segments))
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for realmcache error variants.

    use super::*;

    /// Assert that a result is a not-found store error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(e) if e.is_not_found() => {}
            other => panic!("Expected NotFound, got: {:?}", other),
        }
    }

    /// Assert that a result is a bootstrap error matching `pred`.
    #[track_caller]
    pub fn assert_bootstrap_error<T: std::fmt::Debug>(
        result: &CacheResult<T>,
        pred: impl FnOnce(&BootstrapError) -> bool,
    ) {
        match result {
            Err(CacheError::Bootstrap(e)) if pred(e) => {}
            other => panic!("Unexpected bootstrap result: {:?}", other),
        }
    }

    /// Assert that a result is a configuration error.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &CacheResult<T>) {
        match result {
            Err(CacheError::Config(_)) => {}
            other => panic!("Expected Config error, got: {:?}", other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
