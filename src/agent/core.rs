//! Agent core: publication processing and the outbound engines.
//!
//! `AgentCore` owns every table and is driven exclusively by the event-loop
//! task, so none of this code takes locks. The store calls it makes are the
//! loop's only suspension points; timer work and publication processing
//! never overlap.
//!
//! Conflict handling follows the store's resolution order: for a persisted
//! key the agent re-asserts its own payload under a strictly greater
//! (version, originatorId) whenever a remote write shows up, and the
//! ttlVersion is reset on every such bump because the order tie-breaks on
//! it once version and originator are pinned to this node.

use crate::agent::{AgentStats, KeyCallback};
use crate::core::backoff::ExponentialBackoff;
use crate::core::config::{AgentConfig, SWEEP_RETRY, TTL_INFINITE};
use crate::store::client::{KeyDumpParams, KeyGetParams, KeySetParams, StoreHandle};
use crate::store::types::{AreaId, KeyFilter, Publication, Value};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::state::AgentTables;

/// Invoke a subscriber callback under a panic guard.
///
/// A panicking subscriber must not take down the event loop or starve the
/// remaining subscribers of their notifications.
fn invoke_callback(cb: &mut KeyCallback, key: &str, value: Option<&Value>) {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cb(key, value)));
    if outcome.is_err() {
        tracing::error!(key, "subscriber callback panicked; continuing dispatch");
    }
}

/// All agent state, owned by the event-loop task.
pub(crate) struct AgentCore {
    config: AgentConfig,
    store: Arc<dyn StoreHandle>,
    tables: AgentTables,

    /// Global catch-all receiving every key change and expiry.
    global_callback: Option<KeyCallback>,

    /// Single prefix-filter subscription.
    prefix_filter: Option<KeyFilter>,
    prefix_callback: Option<KeyCallback>,

    /// Deadline of the advertisement timer.
    pub(crate) advertise_at: Instant,

    /// Deadline of the TTL refresh timer.
    pub(crate) ttl_at: Instant,

    /// Deadline of the persisted-key sweep, when enabled.
    pub(crate) sweep_at: Option<Instant>,
}

impl AgentCore {
    pub(crate) fn new(config: AgentConfig, store: Arc<dyn StoreHandle>) -> Self {
        let now = Instant::now();
        let advertise_at = now + config.max_backoff;
        let ttl_at = now + config.max_ttl_update_interval;
        let sweep_at = config.sweep_period.map(|period| now + period);
        Self {
            config,
            store,
            tables: AgentTables::default(),
            global_callback: None,
            prefix_filter: None,
            prefix_callback: None,
            advertise_at,
            ttl_at,
            sweep_at,
        }
    }

    pub(crate) fn node_id(&self) -> &str {
        &self.config.node_id
    }

    // ========================================================================
    // Publication processing
    // ========================================================================

    /// Process one inbound publication from the store.
    ///
    /// For each value-bearing key: reconcile TTL tracking, defend persisted
    /// bindings by bumping past remote writes, and fire subscriber
    /// callbacks. Expired keys are dispatched after the pending
    /// advertisements are flushed.
    pub(crate) async fn process_publication(&mut self, publication: Publication) {
        debug_assert!(
            !publication.area.as_str().is_empty(),
            "publication without an area"
        );
        let area = publication.area.clone();
        tracing::debug!(
            area = %area,
            keys = publication.key_vals.len(),
            expired = publication.expired_keys.len(),
            "processing publication"
        );

        {
            let tables = self.tables.area_mut(&area);

            for (key, rcvd) in &publication.key_vals {
                if rcvd.is_ttl_only() {
                    // TTL resync happens against the refresh table below;
                    // nothing else to do for a value-less update.
                    continue;
                }

                if let Some(cb) = self.global_callback.as_mut() {
                    invoke_callback(cb, key, Some(rcvd));
                }

                match tables.persisted.get_mut(key) {
                    None => {
                        // Key set with a finite TTL but not persisted: keep the
                        // refresh state consistent with what peers replicated.
                        let mut lost = false;
                        if let Some((ttl_value, _)) = tables.ttl_backoffs.get_mut(key) {
                            if rcvd.outranks(ttl_value) {
                                lost = true;
                            } else if rcvd.version == ttl_value.version
                                && rcvd.originator_id == ttl_value.originator_id
                                && rcvd.ttl_version > ttl_value.ttl_version
                            {
                                // A refresh of ours came back with a higher
                                // ttlVersion; jump past it so the next refresh
                                // dominates. No re-advertisement needed.
                                tracing::debug!(
                                    key = %key,
                                    version = rcvd.version,
                                    ttl_version = rcvd.ttl_version + 1,
                                    "bumping ttl version past replicated refresh"
                                );
                                ttl_value.ttl_version = rcvd.ttl_version + 1;
                            }
                        }
                        if lost {
                            tracing::debug!(key = %key, area = %area, "key lost to remote writer; cancelling ttl refresh");
                            tables.ttl_backoffs.remove(key);
                        }

                        if let Some(cb) = tables.key_callbacks.get_mut(key) {
                            invoke_callback(cb, key, Some(rcvd));
                        }
                        if let (Some(filter), Some(cb)) =
                            (self.prefix_filter.as_ref(), self.prefix_callback.as_mut())
                        {
                            if filter.key_match(key, rcvd) {
                                invoke_callback(cb, key, Some(rcvd));
                            }
                        }
                    }
                    Some(cur) => {
                        // Stale echo of an older write; nothing to defend.
                        if cur.version > rcvd.version {
                            continue;
                        }

                        let mut value_change = false;
                        if cur.version < rcvd.version {
                            cur.originator_id = self.config.node_id.clone();
                            cur.version = rcvd.version + 1;
                            cur.ttl_version = 0;
                            value_change = true;
                        }

                        // Same version from another originator: claim it back
                        // with a higher version.
                        if !value_change && rcvd.originator_id != self.config.node_id {
                            cur.originator_id = self.config.node_id.clone();
                            cur.version += 1;
                            cur.ttl_version = 0;
                            value_change = true;
                        }

                        // Payload mismatch under our own (version, originator):
                        // our update was reflected back mangled, re-assert it.
                        if !value_change && cur.value != rcvd.value {
                            cur.originator_id = self.config.node_id.clone();
                            cur.version += 1;
                            cur.ttl_version = 0;
                            value_change = true;
                        }

                        if let Some((ttl_value, _)) = tables.ttl_backoffs.get(key) {
                            cur.ttl_version = ttl_value.ttl_version;
                        }

                        // The refresh engine bumps ttlVersion before sending, so
                        // adopting the received one as-is keeps ours dominant.
                        if cur.ttl_version < rcvd.ttl_version {
                            cur.ttl_version = rcvd.ttl_version;
                            if let Some((ttl_value, _)) = tables.ttl_backoffs.get_mut(key) {
                                ttl_value.ttl_version = rcvd.ttl_version;
                            }
                        }

                        if value_change {
                            tracing::debug!(
                                key = %key,
                                area = %area,
                                version = cur.version,
                                "defending persisted key against remote write"
                            );
                            if let Some(cb) = tables.key_callbacks.get_mut(key) {
                                invoke_callback(cb, key, Some(&*cur));
                            }
                            tables.dirty.insert(key.clone());
                        }
                    }
                }
            }
        }

        self.advertise_pending_keys().await;

        if !publication.expired_keys.is_empty() {
            self.process_expired_keys(&publication);
        }
    }

    /// Dispatch expiry notifications: the global catch-all first, then any
    /// per-key subscriber, both with an absent value.
    fn process_expired_keys(&mut self, publication: &Publication) {
        let tables = self.tables.area_mut(&publication.area);
        for key in &publication.expired_keys {
            if let Some(cb) = self.global_callback.as_mut() {
                invoke_callback(cb, key, None);
            }
            if let Some(cb) = tables.key_callbacks.get_mut(key) {
                invoke_callback(cb, key, None);
            }
        }
    }

    // ========================================================================
    // Advertise engine
    // ========================================================================

    /// Drain the dirty sets into store writes, respecting per-key backoffs.
    ///
    /// Every attempted key reports an error into its backoff first: each
    /// advertisement buys progressively more breathing room for a flapping
    /// key. The timer callback lazily resets backoffs whose gate has
    /// passed, so a quiet key starts fresh again.
    pub(crate) async fn advertise_pending_keys(&mut self) {
        let mut timeout = self.config.max_backoff;

        for (area, tables) in self.tables.iter_mut() {
            if tables.dirty.is_empty() {
                continue;
            }

            let mut key_vals = BTreeMap::new();
            let mut sent = Vec::new();
            for key in &tables.dirty {
                let (Some(value), Some(backoff)) = (
                    tables.persisted.get(key),
                    tables.advert_backoffs.get_mut(key),
                ) else {
                    debug_assert!(false, "dirty key without persisted state");
                    continue;
                };

                if !backoff.can_try_now() {
                    tracing::debug!(key = %key, area = %area, "skipping advertisement, backoff active");
                    timeout = timeout.min(backoff.time_until_retry());
                    continue;
                }

                backoff.report_error();
                timeout = timeout.min(backoff.time_until_retry());

                tracing::debug!(
                    key = %key,
                    area = %area,
                    version = value.version,
                    ttl_version = value.ttl_version,
                    "advertising key"
                );
                debug_assert!(value.value.is_some(), "persisted value without payload");
                key_vals.insert(key.clone(), value.clone());
                sent.push(key.clone());
            }

            if key_vals.is_empty() {
                continue;
            }

            match self.store.set_key_vals(area, KeySetParams { key_vals }).await {
                Ok(()) => {
                    for key in &sent {
                        tables.dirty.remove(key);
                    }
                }
                Err(e) => {
                    // Keys stay queued; the timer retries them.
                    tracing::error!(area = %area, error = %e, "failed to advertise key-vals");
                }
            }
        }

        self.advertise_at = Instant::now() + timeout;
    }

    /// Advertisement timer: flush pending keys, then drain any backoff whose
    /// gate has already passed so the next burst starts from the initial
    /// delay.
    pub(crate) async fn on_advertise_timer(&mut self) {
        self.advertise_pending_keys().await;

        for tables in self.tables.values_mut() {
            for (key, backoff) in tables.advert_backoffs.iter_mut() {
                if backoff.can_try_now() {
                    tracing::debug!(key = %key, "clearing advertisement backoff");
                    backoff.report_success();
                }
            }
        }
    }

    // ========================================================================
    // TTL refresh engine
    // ========================================================================

    /// Emit value-less TTL refreshes for every tracked key whose backoff
    /// allows one, then re-arm the TTL timer.
    pub(crate) async fn advertise_ttl_updates(&mut self) {
        let mut timeout = self.config.max_ttl_update_interval;

        for (area, tables) in self.tables.iter_mut() {
            let mut key_vals = BTreeMap::new();

            for (key, (ttl_value, backoff)) in tables.ttl_backoffs.iter_mut() {
                if !backoff.can_try_now() {
                    timeout = timeout.min(backoff.time_until_retry());
                    continue;
                }

                backoff.report_error();
                timeout = timeout.min(backoff.time_until_retry());

                // A local write may have raced ahead of this refresh state.
                if let Some(cur) = tables.persisted.get(key) {
                    if ttl_value.version < cur.version {
                        ttl_value.version = cur.version;
                        ttl_value.ttl_version = cur.ttl_version;
                    }
                }

                ttl_value.ttl_version += 1;
                debug_assert!(ttl_value.value.is_none(), "ttl refresh with payload");
                tracing::debug!(
                    key = %key,
                    area = %area,
                    version = ttl_value.version,
                    ttl_version = ttl_value.ttl_version,
                    "advertising ttl refresh"
                );
                key_vals.insert(key.clone(), ttl_value.clone());
            }

            if key_vals.is_empty() {
                continue;
            }
            if let Err(e) = self.store.set_key_vals(area, KeySetParams { key_vals }).await {
                tracing::error!(area = %area, error = %e, "failed to advertise ttl refreshes");
            }
        }

        self.ttl_at = Instant::now() + timeout;
    }

    /// Install or drop TTL refresh tracking for a key.
    ///
    /// Finite TTLs refresh about every quarter of the TTL window, giving
    /// four attempts per window. Unless the refresh should go out
    /// immediately, the first one waits a full interval since the key
    /// itself was just advertised.
    pub(crate) async fn schedule_ttl_updates(
        &mut self,
        area: &AreaId,
        key: &str,
        version: u32,
        ttl_version: u32,
        ttl_ms: i64,
        advertise_immediately: bool,
    ) {
        {
            let tables = self.tables.area_mut(area);
            if ttl_ms == TTL_INFINITE {
                // The key may have carried a finite TTL before.
                tables.ttl_backoffs.remove(key);
                return;
            }

            let ttl_value = Value::new(
                version,
                self.config.node_id.clone(),
                None,
                ttl_ms,
                ttl_version,
            );
            let quarter = Duration::from_millis((ttl_ms / 4).max(1) as u64);
            let mut backoff =
                ExponentialBackoff::new(quarter, quarter + Duration::from_millis(1));
            if !advertise_immediately {
                backoff.report_error();
            }
            tables
                .ttl_backoffs
                .insert(key.to_string(), (ttl_value, backoff));
        }

        self.advertise_ttl_updates().await;
    }

    pub(crate) async fn on_ttl_timer(&mut self) {
        self.advertise_ttl_updates().await;
    }

    // ========================================================================
    // Sweep engine
    // ========================================================================

    /// Re-read every persisted key from the store and re-advertise the ones
    /// it silently dropped. The surviving keys are reconciled through the
    /// regular publication path.
    pub(crate) async fn check_persisted_keys(&mut self) {
        let Some(period) = self.config.sweep_period else {
            return;
        };
        let mut timeout = period;

        for area in self.tables.areas_with_persisted_keys() {
            let keys: Vec<String> = self
                .tables
                .get(&area)
                .map(|tables| tables.persisted.keys().cloned().collect())
                .unwrap_or_default();
            if keys.is_empty() {
                continue;
            }

            let publication = match self
                .store
                .get_key_vals(&area, KeyGetParams { keys: keys.clone() })
                .await
            {
                Ok(publication) => publication,
                Err(e) => {
                    tracing::error!(area = %area, error = %e, "sweep read failed");
                    timeout = SWEEP_RETRY;
                    continue;
                }
            };

            let mut to_sync = BTreeMap::new();
            if let Some(tables) = self.tables.get(&area) {
                for key in &keys {
                    if !publication.key_vals.contains_key(key) {
                        if let Some(value) = tables.persisted.get(key) {
                            tracing::warn!(key = %key, area = %area, "persisted key missing from store; re-advertising");
                            to_sync.insert(key.clone(), value.clone());
                        }
                    }
                }
            }

            if !to_sync.is_empty() {
                if let Err(e) = self
                    .store
                    .set_key_vals(&area, KeySetParams { key_vals: to_sync })
                    .await
                {
                    tracing::error!(area = %area, error = %e, "failed to re-advertise swept keys");
                }
            }

            self.process_publication(publication).await;
        }

        self.sweep_at = Some(Instant::now() + timeout.min(period));
    }

    pub(crate) async fn on_sweep_timer(&mut self) {
        self.check_persisted_keys().await;
    }

    // ========================================================================
    // Key operations
    // ========================================================================

    /// Upsert a binding this node promises to keep alive.
    ///
    /// Returns `false` when the call is a no-op (payload and TTL identical
    /// to the cached persisted entry). The first persistence of a key that
    /// already exists in the store seeds versioning from the stored value.
    pub(crate) async fn persist_key(
        &mut self,
        area: &AreaId,
        key: &str,
        value: Bytes,
        ttl_ms: i64,
    ) -> bool {
        tracing::debug!(key, area = %area, ttl_ms, "persist_key");

        let cached = self
            .tables
            .get(area)
            .and_then(|tables| tables.persisted.get(key))
            .cloned();

        let mut entry = match cached {
            Some(existing) => {
                if existing.value.as_ref() == Some(&value) && existing.ttl_ms == ttl_ms {
                    return false;
                }
                let mut entry = existing;
                if let Some((ttl_value, _)) = self
                    .tables
                    .get(area)
                    .and_then(|tables| tables.ttl_backoffs.get(key))
                {
                    entry.ttl_version = ttl_value.ttl_version;
                }
                entry
            }
            None => match self.get_key(area, key).await {
                Some(stored) => {
                    // TTL-only updates are never stored, so a fetched value
                    // always carries a payload.
                    debug_assert!(stored.value.is_some());
                    stored
                }
                None => Value::new(0, self.config.node_id.clone(), Some(value.clone()), ttl_ms, 0),
            },
        };

        let mut value_change = false;
        if entry.version == 0 {
            entry.version = 1;
            value_change = true;
        } else if entry.originator_id != self.config.node_id
            || entry.value.as_ref() != Some(&value)
        {
            entry.version += 1;
            entry.ttl_version = 0;
            entry.value = Some(value.clone());
            entry.originator_id = self.config.node_id.clone();
            value_change = true;
        }

        // The TTL always takes effect; when it changes without a payload
        // change the refresh below goes out immediately so the new lifetime
        // reaches the store.
        let ttl_changed = ttl_ms != entry.ttl_ms;
        entry.ttl_ms = ttl_ms;

        {
            let tables = self.tables.area_mut(area);
            tables.persisted.insert(key.to_string(), entry.clone());
            tables.advert_backoffs.insert(
                key.to_string(),
                ExponentialBackoff::new(self.config.initial_backoff, self.config.max_backoff),
            );
            if value_change {
                if let Some(cb) = tables.key_callbacks.get_mut(key) {
                    invoke_callback(cb, key, Some(&entry));
                }
                tables.dirty.insert(key.to_string());
            }
        }

        self.advertise_pending_keys().await;
        self.schedule_ttl_updates(
            area,
            key,
            entry.version,
            entry.ttl_version,
            ttl_ms,
            ttl_changed && !value_change,
        )
        .await;

        true
    }

    /// Build an outbound value, resolving version 0 against the store.
    pub(crate) async fn build_value(
        &self,
        area: &AreaId,
        key: &str,
        value: Bytes,
        version: u32,
        ttl_ms: i64,
    ) -> Value {
        let mut out = Value::new(version, self.config.node_id.clone(), Some(value), ttl_ms, 0);
        if version == 0 {
            out.version = match self.get_key(area, key).await {
                Some(stored) => stored.version + 1,
                None => 1,
            };
        }
        out
    }

    /// One-shot write without persistence tracking.
    pub(crate) async fn set_key(
        &mut self,
        area: &AreaId,
        key: &str,
        value: Bytes,
        version: u32,
        ttl_ms: i64,
    ) -> crate::core::error::TetherResult<()> {
        let built = self.build_value(area, key, value, version, ttl_ms).await;
        self.set_key_value(area, key, built).await
    }

    /// One-shot write of a prebuilt value tuple.
    pub(crate) async fn set_key_value(
        &mut self,
        area: &AreaId,
        key: &str,
        value: Value,
    ) -> crate::core::error::TetherResult<()> {
        debug_assert!(value.value.is_some(), "set_key_value without payload");
        tracing::debug!(key, area = %area, version = value.version, "set_key");

        let mut key_vals = BTreeMap::new();
        key_vals.insert(key.to_string(), value.clone());
        let result = self.store.set_key_vals(area, KeySetParams { key_vals }).await;

        self.schedule_ttl_updates(area, key, value.version, value.ttl_version, value.ttl_ms, false)
            .await;
        result
    }

    /// Stop keeping a key alive. Publishes nothing; the stored value decays
    /// through its own TTL or a later writer.
    pub(crate) fn unset_key(&mut self, area: &AreaId, key: &str) {
        tracing::debug!(key, area = %area, "unset_key");
        self.tables.area_mut(area).forget_key(key);
    }

    /// Release ownership of a key: drop local state and, if the key still
    /// exists in the store, overwrite it with a version-bumped replacement.
    pub(crate) async fn clear_key(&mut self, area: &AreaId, key: &str, value: Bytes, ttl_ms: i64) {
        tracing::debug!(key, area = %area, "clear_key");
        self.unset_key(area, key);

        // A key absent from the store needs no tombstone value.
        let Some(mut stored) = self.get_key(area, key).await else {
            return;
        };
        stored.originator_id = self.config.node_id.clone();
        stored.version += 1;
        stored.ttl_ms = ttl_ms;
        stored.ttl_version = 0;
        stored.value = Some(value);

        let mut key_vals = BTreeMap::new();
        key_vals.insert(key.to_string(), stored);
        if let Err(e) = self.store.set_key_vals(area, KeySetParams { key_vals }).await {
            tracing::error!(key, area = %area, error = %e, "failed to clear key");
        }
    }

    /// Synchronous read of one key from the store.
    pub(crate) async fn get_key(&self, area: &AreaId, key: &str) -> Option<Value> {
        let params = KeyGetParams {
            keys: vec![key.to_string()],
        };
        let publication = match self.store.get_key_vals(area, params).await {
            Ok(publication) => publication,
            Err(e) => {
                tracing::error!(key, area = %area, error = %e, "failed to read key from store");
                return None;
            }
        };
        let found = publication.key_vals.get(key).cloned();
        if found.is_none() {
            tracing::debug!(key, area = %area, "key not found in store");
        }
        found
    }

    /// Snapshot read of every key under a prefix.
    pub(crate) async fn dump_all_with_prefix(
        &self,
        area: &AreaId,
        prefix: &str,
    ) -> Option<BTreeMap<String, Value>> {
        let mut params = KeyDumpParams {
            prefix: prefix.to_string(),
            keys: Vec::new(),
        };
        if !prefix.is_empty() {
            params.keys = vec![prefix.to_string()];
        }
        match self.store.dump_key_vals(params, vec![area.clone()]).await {
            Ok(publications) => publications.into_iter().next().map(|p| p.key_vals),
            Err(e) => {
                tracing::error!(area = %area, error = %e, "failed to dump keys from store");
                None
            }
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Install a per-key callback; the latest registration wins. Optionally
    /// fetch the key's current value.
    pub(crate) async fn subscribe_key(
        &mut self,
        area: &AreaId,
        key: &str,
        callback: KeyCallback,
        fetch: bool,
    ) -> Option<Value> {
        tracing::debug!(key, area = %area, "subscribe_key");
        self.tables
            .area_mut(area)
            .key_callbacks
            .insert(key.to_string(), callback);
        if fetch {
            self.get_key(area, key).await
        } else {
            None
        }
    }

    /// Remove a per-key callback.
    pub(crate) fn unsubscribe_key(&mut self, area: &AreaId, key: &str) {
        if self
            .tables
            .area_mut(area)
            .key_callbacks
            .remove(key)
            .is_none()
        {
            tracing::warn!(key, area = %area, "unsubscribe for key without a callback");
        }
    }

    /// Install the single prefix-filter subscription.
    pub(crate) fn subscribe_key_filter(&mut self, filter: KeyFilter, callback: KeyCallback) {
        self.prefix_filter = Some(filter);
        self.prefix_callback = Some(callback);
    }

    /// Remove the prefix-filter subscription.
    pub(crate) fn unsubscribe_key_filter(&mut self) {
        self.prefix_filter = None;
        self.prefix_callback = None;
    }

    /// Install or replace the global catch-all callback.
    pub(crate) fn set_kv_callback(&mut self, callback: KeyCallback) {
        self.global_callback = Some(callback);
    }

    /// Current table sizes.
    pub(crate) fn stats(&self) -> AgentStats {
        let mut stats = AgentStats {
            areas: self.tables.area_count(),
            ..AgentStats::default()
        };
        for (_, tables) in self.tables.iter() {
            stats.persisted_keys += tables.persisted.len();
            stats.ttl_tracked_keys += tables.ttl_backoffs.len();
            stats.pending_keys += tables.dirty.len();
            stats.subscribed_keys += tables.key_callbacks.len();
        }
        stats
    }
}
