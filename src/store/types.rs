//! Wire-level value model shared with the replicated store.
//!
//! Every key binds to a [`Value`] tuple. Replicas resolve concurrent writes
//! with a total conflict order over (version, originatorId, ttlVersion);
//! the agent mirrors that order exactly so its persisted bindings can be
//! made to win against any remote mutation.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Identifier of one replication domain within the store.
///
/// Areas have independent key spaces and publication streams. The agent
/// creates per-area state lazily on first use and never destroys it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AreaId(String);

impl AreaId {
    /// Create an area id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The area id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AreaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AreaId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AreaId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A versioned value as replicated by the store.
///
/// `value` is absent for TTL-only updates, which refresh a key's lifetime
/// without carrying its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Monotone counter; the primary conflict-resolution key.
    pub version: u32,

    /// Node that last mutated the value.
    pub originator_id: String,

    /// Opaque payload; absent for TTL-only updates.
    pub value: Option<Bytes>,

    /// Time-to-live in milliseconds, or [`TTL_INFINITE`].
    ///
    /// [`TTL_INFINITE`]: crate::core::config::TTL_INFINITE
    pub ttl_ms: i64,

    /// Counter distinguishing successive TTL refreshes within one
    /// (version, originatorId).
    pub ttl_version: u32,

    /// Informational content hash. Written as 0, ignored on reads.
    pub hash: Option<u64>,
}

impl Value {
    /// Create a value. Outbound values carry a zero hash.
    pub fn new(
        version: u32,
        originator_id: impl Into<String>,
        value: Option<Bytes>,
        ttl_ms: i64,
        ttl_version: u32,
    ) -> Self {
        Self {
            version,
            originator_id: originator_id.into(),
            value,
            ttl_ms,
            ttl_version,
            hash: Some(0),
        }
    }

    /// Check whether this is a TTL-only update (payload absent).
    pub fn is_ttl_only(&self) -> bool {
        self.value.is_none()
    }

    /// Total conflict order: version, then originator id lexicographically,
    /// then ttlVersion. A strictly greater tuple wins replication.
    pub fn conflict_cmp(&self, other: &Value) -> Ordering {
        self.version
            .cmp(&other.version)
            .then_with(|| self.originator_id.cmp(&other.originator_id))
            .then_with(|| self.ttl_version.cmp(&other.ttl_version))
    }

    /// Strict ownership comparison on (version, originatorId) only.
    ///
    /// This is the prefix of the conflict order that decides which node owns
    /// a key; ttlVersion merely breaks ties between refreshes of the same
    /// owner.
    pub fn outranks(&self, other: &Value) -> bool {
        self.version > other.version
            || (self.version == other.version && self.originator_id > other.originator_id)
    }
}

/// A batch of key changes delivered for one area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    /// Area this publication belongs to.
    pub area: AreaId,

    /// Changed keys and their new values.
    pub key_vals: BTreeMap<String, Value>,

    /// Keys the store dropped after their TTL lapsed.
    pub expired_keys: Vec<String>,
}

impl Publication {
    /// Create an empty publication for an area.
    pub fn new(area: AreaId) -> Self {
        Self {
            area,
            key_vals: BTreeMap::new(),
            expired_keys: Vec::new(),
        }
    }
}

/// Subscription filter over originator ids and key prefixes.
///
/// Mirrors the store's own filter type: an empty filter matches every key;
/// otherwise a key matches when it starts with any configured prefix or its
/// value was originated by any configured node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyFilter {
    originator_ids: BTreeSet<String>,
    key_prefixes: Vec<String>,
}

impl KeyFilter {
    /// Create a filter from originator ids and key prefixes.
    pub fn new(originator_ids: BTreeSet<String>, key_prefixes: Vec<String>) -> Self {
        Self {
            originator_ids,
            key_prefixes,
        }
    }

    /// Check whether a (key, value) pair passes the filter.
    pub fn key_match(&self, key: &str, value: &Value) -> bool {
        if self.originator_ids.is_empty() && self.key_prefixes.is_empty() {
            return true;
        }
        self.key_prefixes.iter().any(|p| key.starts_with(p))
            || self.originator_ids.contains(&value.originator_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(version: u32, originator: &str, ttl_version: u32) -> Value {
        Value::new(version, originator, Some(Bytes::from_static(b"v")), 1000, ttl_version)
    }

    #[test]
    fn conflict_order_is_version_then_originator_then_ttl_version() {
        assert_eq!(
            value(2, "a", 0).conflict_cmp(&value(1, "z", 9)),
            Ordering::Greater
        );
        assert_eq!(
            value(1, "b", 0).conflict_cmp(&value(1, "a", 9)),
            Ordering::Greater
        );
        assert_eq!(
            value(1, "a", 3).conflict_cmp(&value(1, "a", 2)),
            Ordering::Greater
        );
        assert_eq!(value(1, "a", 2).conflict_cmp(&value(1, "a", 2)), Ordering::Equal);
    }

    #[test]
    fn outranks_ignores_ttl_version() {
        assert!(value(2, "a", 0).outranks(&value(1, "z", 9)));
        assert!(value(1, "b", 0).outranks(&value(1, "a", 9)));
        assert!(!value(1, "a", 5).outranks(&value(1, "a", 0)));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = KeyFilter::default();
        assert!(filter.key_match("any:key", &value(1, "n1", 0)));
    }

    #[test]
    fn filter_matches_prefix_or_originator() {
        let filter = KeyFilter::new(
            BTreeSet::from(["n2".to_string()]),
            vec!["adj:".to_string()],
        );
        assert!(filter.key_match("adj:node-7", &value(1, "n9", 0)));
        assert!(filter.key_match("prefix:node-7", &value(1, "n2", 0)));
        assert!(!filter.key_match("prefix:node-7", &value(1, "n9", 0)));
    }
}
