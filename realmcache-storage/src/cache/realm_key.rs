//! Realm-scoped cache key system for the distributed cache.
//!
//! A `RealmScopedKey` cannot be constructed without a realm, so a lookup
//! can never cross realms. The key also decides which keyspace segment an
//! entry lives in, which is the unit of bulk-load progress.

use realmcache_core::{CachedKind, RealmId, UserId};
use sha2::{Digest, Sha256};
use std::fmt;

/// Separator byte between the realm and the rest of the key.
const SEPARATOR: u8 = 0xFF;

/// A cache key scoped to a specific realm.
///
/// # Binary Format
///
/// - Bytes 0-3: realm length (big-endian u32)
/// - Realm bytes (UTF-8)
/// - Separator (0xFF)
/// - Kind discriminant (1 byte)
/// - Entity id bytes (UTF-8, rest of the buffer)
///
/// The length prefix keeps the encoding injective for arbitrary realm names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RealmScopedKey {
    inner: RealmKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct RealmKeyInner {
    realm: RealmId,
    kind: CachedKind,
    id: String,
}

impl RealmScopedKey {
    /// Create a new realm-scoped key. The only way to build one.
    pub fn new(realm: RealmId, kind: CachedKind, id: impl Into<String>) -> Self {
        Self {
            inner: RealmKeyInner {
                realm,
                kind,
                id: id.into(),
            },
        }
    }

    /// Key of a cached user.
    pub fn user(realm: &RealmId, id: &UserId) -> Self {
        Self::new(realm.clone(), CachedKind::User, id.as_str())
    }

    pub fn realm(&self) -> &RealmId {
        &self.inner.realm
    }

    pub fn kind(&self) -> CachedKind {
        self.inner.kind
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Keyspace segment this key belongs to.
    pub fn segment(&self, segment_count: usize) -> usize {
        segment_for(&self.inner.id, segment_count)
    }

    pub fn encode(&self) -> Vec<u8> {
        let realm = self.inner.realm.as_str().as_bytes();
        let id = self.inner.id.as_bytes();
        let mut bytes = Vec::with_capacity(4 + realm.len() + 2 + id.len());
        bytes.extend_from_slice(&(realm.len() as u32).to_be_bytes());
        bytes.extend_from_slice(realm);
        bytes.push(SEPARATOR);
        bytes.push(kind_to_byte(self.inner.kind));
        bytes.extend_from_slice(id);
        bytes
    }

    /// Decode a key from bytes.
    ///
    /// Returns `None` if the length prefix overruns the buffer, the separator
    /// is missing, the kind byte is unknown or either string is not UTF-8.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let len_bytes: [u8; 4] = bytes.get(0..4)?.try_into().ok()?;
        let realm_len = u32::from_be_bytes(len_bytes) as usize;
        let realm_end = 4usize.checked_add(realm_len)?;

        let realm = std::str::from_utf8(bytes.get(4..realm_end)?).ok()?;
        if *bytes.get(realm_end)? != SEPARATOR {
            return None;
        }
        let kind = byte_to_kind(*bytes.get(realm_end + 1)?)?;
        let id = std::str::from_utf8(bytes.get(realm_end + 2..)?).ok()?;

        Some(Self::new(RealmId::new(realm), kind, id))
    }
}

impl fmt::Display for RealmScopedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.inner.realm, self.inner.kind, self.inner.id)
    }
}

/// Map an entity id onto one of `segment_count` keyspace segments.
///
/// Stable across processes and nodes so the durable store and the cache
/// agree on segment membership.
pub fn segment_for(id: &str, segment_count: usize) -> usize {
    if segment_count == 0 {
        return 0;
    }
    let digest = Sha256::digest(id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[0..8]);
    (u64::from_be_bytes(head) % segment_count as u64) as usize
}

fn kind_to_byte(kind: CachedKind) -> u8 {
    match kind {
        CachedKind::User => 0,
        CachedKind::Role => 1,
        CachedKind::Group => 2,
        CachedKind::UserSession => 3,
    }
}

fn byte_to_kind(byte: u8) -> Option<CachedKind> {
    match byte {
        0 => Some(CachedKind::User),
        1 => Some(CachedKind::Role),
        2 => Some(CachedKind::Group),
        3 => Some(CachedKind::UserSession),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_and_getters() {
        let key = RealmScopedKey::new(RealmId::new("master"), CachedKind::Role, "admin");

        assert_eq!(key.realm(), &RealmId::new("master"));
        assert_eq!(key.kind(), CachedKind::Role);
        assert_eq!(key.id(), "admin");
        assert_eq!(key.to_string(), "master/role/admin");
    }

    #[test]
    fn test_encode_decode() {
        let key = RealmScopedKey::user(&RealmId::new("acme"), &UserId::new("u1"));
        let decoded = RealmScopedKey::decode(&key.encode()).expect("decode should succeed");
        assert_eq!(key, decoded);
    }

    #[test]
    fn test_decode_truncated() {
        assert!(RealmScopedKey::decode(&[]).is_none());
        assert!(RealmScopedKey::decode(&[0, 0, 0, 9, b'a']).is_none());
    }

    #[test]
    fn test_decode_wrong_separator() {
        let key = RealmScopedKey::user(&RealmId::new("acme"), &UserId::new("u1"));
        let mut bytes = key.encode();
        bytes[4 + 4] = 0x00;
        assert!(RealmScopedKey::decode(&bytes).is_none());
    }

    #[test]
    fn test_decode_invalid_kind() {
        let key = RealmScopedKey::user(&RealmId::new("acme"), &UserId::new("u1"));
        let mut bytes = key.encode();
        bytes[4 + 4 + 1] = 200;
        assert!(RealmScopedKey::decode(&bytes).is_none());
    }

    #[test]
    fn test_realm_boundary_is_unambiguous() {
        // "ab" + "c" and "a" + "bc" must never collide.
        let key1 = RealmScopedKey::new(RealmId::new("ab"), CachedKind::User, "c");
        let key2 = RealmScopedKey::new(RealmId::new("a"), CachedKind::User, "bc");
        assert_ne!(key1.encode(), key2.encode());
    }

    #[test]
    fn test_segment_for_is_stable_and_bounded() {
        for id in ["u1", "u2", "alice", ""] {
            let s = segment_for(id, 16);
            assert!(s < 16);
            assert_eq!(s, segment_for(id, 16));
        }
        assert_eq!(segment_for("anything", 0), 0);
        assert_eq!(segment_for("anything", 1), 0);
    }

    #[test]
    fn test_key_segment_ignores_realm() {
        let a = RealmScopedKey::user(&RealmId::new("r1"), &UserId::new("u7"));
        let b = RealmScopedKey::user(&RealmId::new("r2"), &UserId::new("u7"));
        assert_eq!(a.segment(32), b.segment(32));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn kind_strategy() -> impl Strategy<Value = CachedKind> {
        prop_oneof![
            Just(CachedKind::User),
            Just(CachedKind::Role),
            Just(CachedKind::Group),
            Just(CachedKind::UserSession),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Property: distinct keys never share an encoding.
        #[test]
        fn prop_encoding_is_injective(
            realm1 in ".{0,12}",
            realm2 in ".{0,12}",
            kind1 in kind_strategy(),
            kind2 in kind_strategy(),
            id1 in ".{0,12}",
            id2 in ".{0,12}",
        ) {
            let key1 = RealmScopedKey::new(RealmId::new(realm1), kind1, id1);
            let key2 = RealmScopedKey::new(RealmId::new(realm2), kind2, id2);

            if key1 == key2 {
                prop_assert_eq!(key1.encode(), key2.encode());
            } else {
                prop_assert_ne!(key1.encode(), key2.encode());
            }
        }

        /// Property: every key lands in a segment below the segment count.
        #[test]
        fn prop_segment_in_range(id in ".{0,24}", count in 1usize..512) {
            prop_assert!(segment_for(&id, count) < count);
        }
    }
}
