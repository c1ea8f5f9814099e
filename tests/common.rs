//! Common test utilities.
//!
//! This module contains the in-memory store double and shared helpers for
//! integration tests. Import with `mod common;` in test files.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tether::{
    AgentConfig, AreaId, KeyDumpParams, KeyGetParams, KeySetParams, Publication,
    ReplicationAgent, StoreHandle, TetherError, TetherResult, Value,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// One recorded `set_key_vals` call.
#[derive(Debug, Clone)]
pub struct RecordedSet {
    pub area: AreaId,
    pub key_vals: BTreeMap<String, Value>,
    pub at: Instant,
}

#[derive(Default)]
struct StoreState {
    contents: BTreeMap<AreaId, BTreeMap<String, Value>>,
    sets: Vec<RecordedSet>,
    fail_sets: bool,
    fail_gets: bool,
}

/// In-memory store double.
///
/// Successful writes are recorded with a timestamp and merged into the
/// store contents; TTL-only updates refresh metadata without touching the
/// stored payload, like the real store. Reads and writes can be made to
/// fail on demand, and publications are injected through [`MockStore::publish`].
pub struct MockStore {
    state: Mutex<StoreState>,
    updates_tx: mpsc::Sender<TetherResult<Publication>>,
    updates_rx: Mutex<Option<mpsc::Receiver<TetherResult<Publication>>>>,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        let (updates_tx, updates_rx) = mpsc::channel(64);
        Arc::new(Self {
            state: Mutex::new(StoreState::default()),
            updates_tx,
            updates_rx: Mutex::new(Some(updates_rx)),
        })
    }

    /// Seed a value directly into the store contents.
    pub fn insert(&self, area: &AreaId, key: &str, value: Value) {
        self.state
            .lock()
            .contents
            .entry(area.clone())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Drop a key from the store contents, simulating silent loss.
    pub fn remove(&self, area: &AreaId, key: &str) {
        if let Some(keys) = self.state.lock().contents.get_mut(area) {
            keys.remove(key);
        }
    }

    /// Current stored value for a key.
    pub fn stored(&self, area: &AreaId, key: &str) -> Option<Value> {
        self.state
            .lock()
            .contents
            .get(area)
            .and_then(|keys| keys.get(key))
            .cloned()
    }

    /// All recorded writes, in order.
    pub fn sets(&self) -> Vec<RecordedSet> {
        self.state.lock().sets.clone()
    }

    pub fn set_count(&self) -> usize {
        self.state.lock().sets.len()
    }

    pub fn fail_sets(&self, fail: bool) {
        self.state.lock().fail_sets = fail;
    }

    pub fn fail_gets(&self, fail: bool) {
        self.state.lock().fail_gets = fail;
    }

    /// Inject an inbound publication.
    pub async fn publish(&self, publication: Publication) {
        self.updates_tx
            .send(Ok(publication))
            .await
            .expect("agent inbound queue closed");
    }

    /// Terminate the updates stream with an error item.
    pub async fn publish_error(&self) {
        self.updates_tx
            .send(Err(TetherError::store("stream terminated")))
            .await
            .expect("agent inbound queue closed");
    }
}

#[async_trait]
impl StoreHandle for MockStore {
    async fn get_key_vals(
        &self,
        area: &AreaId,
        params: KeyGetParams,
    ) -> TetherResult<Publication> {
        let state = self.state.lock();
        if state.fail_gets {
            return Err(TetherError::store("injected read failure"));
        }
        let mut publication = Publication::new(area.clone());
        if let Some(keys) = state.contents.get(area) {
            for key in &params.keys {
                if let Some(value) = keys.get(key) {
                    publication.key_vals.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(publication)
    }

    async fn dump_key_vals(
        &self,
        params: KeyDumpParams,
        areas: Vec<AreaId>,
    ) -> TetherResult<Vec<Publication>> {
        let state = self.state.lock();
        if state.fail_gets {
            return Err(TetherError::store("injected read failure"));
        }
        let mut publications = Vec::new();
        for area in areas {
            let mut publication = Publication::new(area.clone());
            if let Some(keys) = state.contents.get(&area) {
                for (key, value) in keys {
                    if key.starts_with(&params.prefix) {
                        publication.key_vals.insert(key.clone(), value.clone());
                    }
                }
            }
            publications.push(publication);
        }
        Ok(publications)
    }

    async fn set_key_vals(&self, area: &AreaId, params: KeySetParams) -> TetherResult<()> {
        let mut state = self.state.lock();
        if state.fail_sets {
            return Err(TetherError::store("injected write failure"));
        }
        state.sets.push(RecordedSet {
            area: area.clone(),
            key_vals: params.key_vals.clone(),
            at: Instant::now(),
        });
        let contents = state.contents.entry(area.clone()).or_default();
        for (key, value) in params.key_vals {
            if value.value.is_none() {
                // TTL-only update: refresh metadata, keep the stored payload.
                if let Some(existing) = contents.get_mut(&key) {
                    existing.version = value.version;
                    existing.originator_id = value.originator_id;
                    existing.ttl_ms = value.ttl_ms;
                    existing.ttl_version = value.ttl_version;
                }
            } else {
                contents.insert(key, value);
            }
        }
        Ok(())
    }

    fn updates(&self) -> mpsc::Receiver<TetherResult<Publication>> {
        self.updates_rx
            .lock()
            .take()
            .expect("updates reader already claimed")
    }
}

/// Agent plus the store double it talks to.
pub struct Harness {
    pub agent: ReplicationAgent,
    pub store: Arc<MockStore>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Spawn an agent against a fresh mock store.
pub fn spawn_agent(config: AgentConfig) -> Harness {
    init_tracing();
    let store = MockStore::new();
    let agent = ReplicationAgent::spawn(config, store.clone()).expect("config is valid");
    Harness { agent, store }
}

/// Let the agent drain its queues. With a paused clock this completes
/// immediately in virtual time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Byte payload helper.
pub fn b(s: &str) -> Bytes {
    Bytes::from(s.to_string())
}

/// A value as a remote peer would publish it.
pub fn remote_value(version: u32, originator: &str, payload: &str, ttl_ms: i64) -> Value {
    Value::new(version, originator, Some(b(payload)), ttl_ms, 0)
}

/// A single-key publication.
pub fn publication_of(area: &AreaId, key: &str, value: Value) -> Publication {
    let mut publication = Publication::new(area.clone());
    publication.key_vals.insert(key.to_string(), value);
    publication
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_store_applies_writes_and_filters_dumps() {
        let store = MockStore::new();
        let area = AreaId::new("A");

        let mut params = KeySetParams::default();
        params
            .key_vals
            .insert("adj:x".to_string(), remote_value(1, "n1", "v1", 1000));
        params
            .key_vals
            .insert("pfx:y".to_string(), remote_value(1, "n1", "v2", 1000));
        store.set_key_vals(&area, params).await.unwrap();
        assert_eq!(store.set_count(), 1);

        let dump = store
            .dump_key_vals(
                KeyDumpParams {
                    prefix: "adj:".to_string(),
                    keys: vec!["adj:".to_string()],
                },
                vec![area.clone()],
            )
            .await
            .unwrap();
        assert_eq!(dump[0].key_vals.len(), 1);
        assert!(dump[0].key_vals.contains_key("adj:x"));
    }

    #[tokio::test]
    async fn mock_store_ttl_update_keeps_payload() {
        let store = MockStore::new();
        let area = AreaId::new("A");
        store.insert(&area, "k", remote_value(1, "n1", "v", 1000));

        let mut params = KeySetParams::default();
        params
            .key_vals
            .insert("k".to_string(), Value::new(1, "n1", None, 1000, 7));
        store.set_key_vals(&area, params).await.unwrap();

        let stored = store.stored(&area, "k").unwrap();
        assert_eq!(stored.value, Some(b("v")));
        assert_eq!(stored.ttl_version, 7);
    }

    #[tokio::test]
    async fn mock_store_injected_failures() {
        let store = MockStore::new();
        let area = AreaId::new("A");

        store.fail_gets(true);
        let err = store
            .get_key_vals(&area, KeyGetParams { keys: vec!["k".to_string()] })
            .await
            .unwrap_err();
        assert!(err.is_retriable());

        store.fail_sets(true);
        let err = store
            .set_key_vals(&area, KeySetParams::default())
            .await
            .unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(store.set_count(), 0);
    }
}
