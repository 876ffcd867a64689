//! realmcache Core - Identity Entity Types
//!
//! Pure data structures with no I/O. All other crates depend on this.
//! This crate contains the identifiers, realm-scoped roles and groups,
//! the error taxonomy, configuration types and the bootstrap lease.

pub mod config;
pub mod error;
pub mod lease;

pub use config::{BootstrapConfig, RetryConfig};
pub use error::{BootstrapError, CacheError, CacheResult, ConfigError, StoreError};
pub use lease::{Held, Lease, LeaseData, LeaseState, LeaseStateError, Released, StoredLease};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Identifier of a cluster node taking part in a bootstrap.
pub type NodeId = Uuid;

/// Generate a new UUIDv7 node id (timestamp-sortable).
pub fn new_node_id() -> NodeId {
    Uuid::now_v7()
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Realm identifier. Every cached entity is owned by exactly one realm.
    RealmId
);
string_id!(
    /// User identifier, unique within its realm.
    UserId
);
string_id!(
    /// Role identifier.
    RoleId
);
string_id!(
    /// Group identifier.
    GroupId
);

/// Discriminator for the kinds of entries the distributed cache holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CachedKind {
    User,
    Role,
    Group,
    UserSession,
}

impl CachedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CachedKind::User => "user",
            CachedKind::Role => "role",
            CachedKind::Group => "group",
            CachedKind::UserSession => "session",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(CachedKind::User),
            "role" => Some(CachedKind::Role),
            "group" => Some(CachedKind::Group),
            "session" => Some(CachedKind::UserSession),
            _ => None,
        }
    }
}

impl fmt::Display for CachedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ATTRIBUTES
// ============================================================================

/// Well-known user attribute names.
pub mod attr {
    pub const USERNAME: &str = "username";
    pub const EMAIL: &str = "email";
    pub const FIRST_NAME: &str = "firstName";
    pub const LAST_NAME: &str = "lastName";
}

/// Multi-valued attribute bag. Values keep insertion order per key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, Vec<String>>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value stored under `name`, if any.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0.get(name).map(Vec::as_slice)
    }

    /// Replace all values of `name` with a single value.
    pub fn set_single(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), vec![value.into()]);
    }

    pub fn set(&mut self, name: impl Into<String>, values: Vec<String>) {
        self.0.insert(name.into(), values);
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.0.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Vec<String>)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Lower-case an identity attribute (username, email) the way the store keeps it.
pub fn normalize_identity_value(value: &str) -> String {
    value.to_lowercase()
}

// ============================================================================
// ROLES AND GROUPS
// ============================================================================

/// Owner of a role: either the realm itself or one of its clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoleContainer {
    Realm(RealmId),
    Client(String),
}

/// A realm or client role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: RoleId,
    pub name: String,
    pub container: RoleContainer,
    /// Roles this role directly includes.
    pub composites: BTreeSet<RoleId>,
}

impl Role {
    pub fn realm_role(id: impl Into<RoleId>, name: impl Into<String>, realm: RealmId) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            container: RoleContainer::Realm(realm),
            composites: BTreeSet::new(),
        }
    }

    pub fn client_role(id: impl Into<RoleId>, name: impl Into<String>, client: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            container: RoleContainer::Client(client.into()),
            composites: BTreeSet::new(),
        }
    }

    pub fn with_composite(mut self, role: impl Into<RoleId>) -> Self {
        self.composites.insert(role.into());
        self
    }

    /// True if this role is `other` or directly includes it.
    pub fn has_role(&self, other: &RoleId) -> bool {
        &self.id == other || self.composites.contains(other)
    }

    pub fn is_realm_role_of(&self, realm: &RealmId) -> bool {
        matches!(&self.container, RoleContainer::Realm(r) if r == realm)
    }

    pub fn is_client_role_of(&self, client: &str) -> bool {
        matches!(&self.container, RoleContainer::Client(c) if c == client)
    }
}

/// A group of users. Groups inherit role mappings from their parents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub parent: Option<GroupId>,
    pub role_mappings: BTreeSet<RoleId>,
}

impl Group {
    pub fn new(id: impl Into<GroupId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent: None,
            role_mappings: BTreeSet::new(),
        }
    }

    pub fn with_parent(mut self, parent: impl Into<GroupId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<RoleId>) -> Self {
        self.role_mappings.insert(role.into());
        self
    }
}

// ============================================================================
// TESTS
// ============================================================================
