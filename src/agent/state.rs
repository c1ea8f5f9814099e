//! Per-area agent tables.
//!
//! All tables are keyed first by area, then by key. Areas come into
//! existence lazily on first touch and live for the rest of the agent's
//! lifetime. Lookup and lazy creation are separate entry points so that
//! read paths never mutate the area map while it is being iterated.

use crate::agent::KeyCallback;
use crate::core::backoff::ExponentialBackoff;
use crate::store::types::{AreaId, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Tables for one replication area.
#[derive(Default)]
pub(crate) struct AreaTables {
    /// Bindings this node promises to keep alive.
    pub persisted: BTreeMap<String, Value>,

    /// TTL refresh state: the value-less tuple to advertise next and the
    /// backoff pacing its refreshes. Present iff the key is tracked with a
    /// finite TTL.
    pub ttl_backoffs: BTreeMap<String, (Value, ExponentialBackoff)>,

    /// Gate on outbound advertisements, one per persisted key.
    pub advert_backoffs: BTreeMap<String, ExponentialBackoff>,

    /// Keys whose latest persisted value is not yet confirmed advertised.
    pub dirty: BTreeSet<String>,

    /// Per-key subscriber callbacks; latest registration wins.
    pub key_callbacks: BTreeMap<String, KeyCallback>,
}

impl AreaTables {
    /// Drop every trace of a key except its subscription.
    pub fn forget_key(&mut self, key: &str) {
        self.persisted.remove(key);
        self.advert_backoffs.remove(key);
        self.ttl_backoffs.remove(key);
        self.dirty.remove(key);
    }
}

/// The full table set, keyed by area.
#[derive(Default)]
pub(crate) struct AgentTables {
    areas: BTreeMap<AreaId, AreaTables>,
}

impl AgentTables {
    /// Look up an area without creating it.
    pub fn get(&self, area: &AreaId) -> Option<&AreaTables> {
        self.areas.get(area)
    }

    /// Fetch an area's tables, creating them on first touch.
    pub fn area_mut(&mut self, area: &AreaId) -> &mut AreaTables {
        self.areas.entry(area.clone()).or_default()
    }

    /// Iterate all areas mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&AreaId, &mut AreaTables)> {
        self.areas.iter_mut()
    }

    /// Iterate all area tables mutably.
    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut AreaTables> {
        self.areas.values_mut()
    }

    /// Areas currently holding at least one persisted key.
    pub fn areas_with_persisted_keys(&self) -> Vec<AreaId> {
        self.areas
            .iter()
            .filter(|(_, tables)| !tables.persisted.is_empty())
            .map(|(area, _)| area.clone())
            .collect()
    }

    /// Number of known areas.
    pub fn area_count(&self) -> usize {
        self.areas.len()
    }

    /// Iterate all areas immutably.
    pub fn iter(&self) -> impl Iterator<Item = (&AreaId, &AreaTables)> {
        self.areas.iter()
    }
}
