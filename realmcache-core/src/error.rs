//! Error types for realmcache operations

use crate::{CachedKind, RealmId};
use thiserror::Error;

/// Durable store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Entity not found: {kind:?} with id {id}")]
    NotFound { kind: CachedKind, id: String },

    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Errors raised while bootstrapping the distributed cache.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BootstrapError {
    #[error("Transient failure loading segment {segment}: {reason}")]
    Transient { segment: usize, reason: String },

    #[error("Fatal failure loading segment {segment}: {reason}")]
    Fatal { segment: usize, reason: String },

    #[error("Segment {segment} still failing after {attempts} attempts")]
    RetriesExhausted { segment: usize, attempts: u32 },

    #[error("Bootstrap leadership lost for realm {realm}")]
    LeadershipLost { realm: RealmId },

    #[error("Bootstrap leadership held by another node for realm {realm}")]
    NotLeader { realm: RealmId },

    #[error("Bootstrap cancelled")]
    Cancelled,

    #[error("Invalid progress record: {reason}")]
    InvalidProgress { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all realmcache errors.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Shorthand for a user missing from the durable store.
    pub fn user_not_found(id: impl Into<String>) -> Self {
        CacheError::Store(StoreError::NotFound {
            kind: CachedKind::User,
            id: id.into(),
        })
    }

    /// True if the entity is absent from the durable store.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::Store(StoreError::NotFound { .. }))
    }

    /// True if retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CacheError::Store(StoreError::Unavailable { .. })
                | CacheError::Store(StoreError::LockPoisoned)
                | CacheError::Bootstrap(BootstrapError::Transient { .. })
        )
    }
}

/// Result type alias for realmcache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display_not_found() {
        let err = StoreError::NotFound {
            kind: CachedKind::User,
            id: "u1".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Entity not found"));
        assert!(msg.contains("User"));
        assert!(msg.contains("u1"));
    }

    #[test]
    fn test_bootstrap_error_display_retries_exhausted() {
        let err = BootstrapError::RetriesExhausted {
            segment: 7,
            attempts: 4,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("7"));
        assert!(msg.contains("4 attempts"));
    }

    #[test]
    fn test_config_error_display_invalid_value() {
        let err = ConfigError::InvalidValue {
            field: "batch_size".to_string(),
            value: "0".to_string(),
            reason: "must be positive".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("batch_size"));
        assert!(msg.contains("must be positive"));
    }

    #[test]
    fn test_cache_error_classification() {
        assert!(CacheError::user_not_found("u1").is_not_found());
        assert!(!CacheError::user_not_found("u1").is_transient());

        let unavailable = CacheError::from(StoreError::Unavailable {
            reason: "connection reset".to_string(),
        });
        assert!(unavailable.is_transient());
        assert!(!unavailable.is_not_found());

        let fatal = CacheError::from(BootstrapError::Fatal {
            segment: 1,
            reason: "malformed".to_string(),
        });
        assert!(!fatal.is_transient());
    }

    #[test]
    fn test_cache_error_from_variants() {
        let store = CacheError::from(StoreError::LockPoisoned);
        assert!(matches!(store, CacheError::Store(_)));

        let bootstrap = CacheError::from(BootstrapError::Cancelled);
        assert!(matches!(bootstrap, CacheError::Bootstrap(_)));

        let config = CacheError::from(ConfigError::MissingRequired {
            field: "batch_size".to_string(),
        });
        assert!(matches!(config, CacheError::Config(_)));
    }
}
