//! Replication agent handle and event loop.
//!
//! The agent runs as a single tokio task owning all mutable state. The
//! public [`ReplicationAgent`] handle posts commands onto that task over a
//! channel and awaits the reply, so every mutating operation executes on
//! the loop in submission order and timer work never interleaves with a
//! half-processed command.
//!
//! The loop multiplexes four event sources:
//! - commands from the handle
//! - inbound publications from the store's updates reader
//! - the advertisement timer
//! - the TTL refresh timer and, when configured, the sweep timer
//!
//! A terminal error on the updates reader ends inbound processing only;
//! local API calls keep working against the agent's own tables. Pending
//! advertisements are dropped at shutdown; callers that need at-least-once
//! persistence re-persist after restart or rely on the sweep.

use crate::core::config::AgentConfig;
use crate::core::error::{TetherError, TetherResult};
use crate::store::client::StoreHandle;
use crate::store::types::{AreaId, KeyFilter, Publication, Value};
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;

mod core;
mod state;

use self::core::AgentCore;

/// Subscriber callback.
///
/// Invoked with the key and its new value; `None` signals that the store
/// expired the key.
pub type KeyCallback = Box<dyn FnMut(&str, Option<&Value>) + Send + Sync + 'static>;

/// Current table sizes, aggregated over all areas.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AgentStats {
    /// Number of known areas.
    pub areas: usize,
    /// Keys this node keeps alive.
    pub persisted_keys: usize,
    /// Keys with active TTL refresh state.
    pub ttl_tracked_keys: usize,
    /// Keys awaiting advertisement.
    pub pending_keys: usize,
    /// Keys with a registered callback.
    pub subscribed_keys: usize,
}

/// Commands posted from the handle onto the event loop.
enum Command {
    PersistKey {
        area: AreaId,
        key: String,
        value: Bytes,
        ttl_ms: i64,
        resp: oneshot::Sender<bool>,
    },
    SetKey {
        area: AreaId,
        key: String,
        value: Bytes,
        version: u32,
        ttl_ms: i64,
        resp: oneshot::Sender<TetherResult<()>>,
    },
    SetKeyValue {
        area: AreaId,
        key: String,
        value: Value,
        resp: oneshot::Sender<TetherResult<()>>,
    },
    UnsetKey {
        area: AreaId,
        key: String,
        resp: oneshot::Sender<()>,
    },
    ClearKey {
        area: AreaId,
        key: String,
        value: Bytes,
        ttl_ms: i64,
        resp: oneshot::Sender<()>,
    },
    GetKey {
        area: AreaId,
        key: String,
        resp: oneshot::Sender<Option<Value>>,
    },
    DumpAllWithPrefix {
        area: AreaId,
        prefix: String,
        resp: oneshot::Sender<Option<BTreeMap<String, Value>>>,
    },
    SubscribeKey {
        area: AreaId,
        key: String,
        callback: KeyCallback,
        fetch: bool,
        resp: oneshot::Sender<Option<Value>>,
    },
    UnsubscribeKey {
        area: AreaId,
        key: String,
        resp: oneshot::Sender<()>,
    },
    SubscribeKeyFilter {
        filter: KeyFilter,
        callback: KeyCallback,
        resp: oneshot::Sender<()>,
    },
    UnsubscribeKeyFilter {
        resp: oneshot::Sender<()>,
    },
    SetKvCallback {
        callback: KeyCallback,
        resp: oneshot::Sender<()>,
    },
    Stats {
        resp: oneshot::Sender<AgentStats>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running replication agent.
///
/// Cheap to use from any task; every method posts onto the agent's event
/// loop and awaits the result. Dropping the handle aborts the loop without
/// flushing pending advertisements; use [`ReplicationAgent::stop`] for an
/// orderly shutdown.
#[derive(Debug)]
pub struct ReplicationAgent {
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: Option<JoinHandle<()>>,
}

impl ReplicationAgent {
    /// Validate the configuration and spawn the agent's event loop.
    ///
    /// The store's updates reader is claimed here; the inbound task runs
    /// until the reader terminates or the agent stops.
    pub fn spawn(config: AgentConfig, store: Arc<dyn StoreHandle>) -> TetherResult<Self> {
        config
            .validate()
            .map_err(|e| TetherError::InvalidConfig {
                message: e.to_string(),
            })?;

        let updates = store.updates();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let core = AgentCore::new(config, store);
        let task = tokio::spawn(event_loop(core, cmd_rx, updates));

        Ok(Self {
            cmd_tx,
            task: Some(task),
        })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> TetherResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .map_err(|_| TetherError::ShuttingDown)?;
        rx.await.map_err(|_| TetherError::ShuttingDown)
    }

    /// Persist a binding the agent will keep alive and defend.
    ///
    /// Returns `Ok(false)` when the call is a no-op (payload and TTL match
    /// the cached persisted entry).
    pub async fn persist_key(
        &self,
        area: AreaId,
        key: impl Into<String>,
        value: Bytes,
        ttl_ms: i64,
    ) -> TetherResult<bool> {
        let key = key.into();
        self.request(|resp| Command::PersistKey {
            area,
            key,
            value,
            ttl_ms,
            resp,
        })
        .await
    }

    /// One-shot write without persistence tracking.
    ///
    /// With `version` 0, the write goes out one version above the store's
    /// current value for the key (or 1 when absent). A TTL refresh schedule
    /// is installed for finite TTLs.
    pub async fn set_key(
        &self,
        area: AreaId,
        key: impl Into<String>,
        value: Bytes,
        version: u32,
        ttl_ms: i64,
    ) -> TetherResult<()> {
        let key = key.into();
        self.request(|resp| Command::SetKey {
            area,
            key,
            value,
            version,
            ttl_ms,
            resp,
        })
        .await?
    }

    /// One-shot write of a prebuilt value tuple.
    pub async fn set_key_value(
        &self,
        area: AreaId,
        key: impl Into<String>,
        value: Value,
    ) -> TetherResult<()> {
        let key = key.into();
        self.request(|resp| Command::SetKeyValue {
            area,
            key,
            value,
            resp,
        })
        .await?
    }

    /// Stop keeping a key alive. Publishes nothing.
    pub async fn unset_key(&self, area: AreaId, key: impl Into<String>) -> TetherResult<()> {
        let key = key.into();
        self.request(|resp| Command::UnsetKey { area, key, resp })
            .await
    }

    /// Release ownership of a key, replacing the stored value with a
    /// version-bumped `value` if the key still exists in the store.
    pub async fn clear_key(
        &self,
        area: AreaId,
        key: impl Into<String>,
        value: Bytes,
        ttl_ms: i64,
    ) -> TetherResult<()> {
        let key = key.into();
        self.request(|resp| Command::ClearKey {
            area,
            key,
            value,
            ttl_ms,
            resp,
        })
        .await
    }

    /// Read one key from the store. `None` when absent or unreachable.
    pub async fn get_key(
        &self,
        area: AreaId,
        key: impl Into<String>,
    ) -> TetherResult<Option<Value>> {
        let key = key.into();
        self.request(|resp| Command::GetKey { area, key, resp }).await
    }

    /// Snapshot read of every key under a prefix.
    pub async fn dump_all_with_prefix(
        &self,
        area: AreaId,
        prefix: impl Into<String>,
    ) -> TetherResult<Option<BTreeMap<String, Value>>> {
        let prefix = prefix.into();
        self.request(|resp| Command::DumpAllWithPrefix { area, prefix, resp })
            .await
    }

    /// Install a per-key callback; the latest registration wins. With
    /// `fetch`, returns the key's current store value.
    pub async fn subscribe_key(
        &self,
        area: AreaId,
        key: impl Into<String>,
        callback: impl FnMut(&str, Option<&Value>) + Send + Sync + 'static,
        fetch: bool,
    ) -> TetherResult<Option<Value>> {
        let key = key.into();
        let callback: KeyCallback = Box::new(callback);
        self.request(|resp| Command::SubscribeKey {
            area,
            key,
            callback,
            fetch,
            resp,
        })
        .await
    }

    /// Remove a per-key callback.
    pub async fn unsubscribe_key(&self, area: AreaId, key: impl Into<String>) -> TetherResult<()> {
        let key = key.into();
        self.request(|resp| Command::UnsubscribeKey { area, key, resp })
            .await
    }

    /// Install the single prefix-filter subscription, replacing any
    /// previous one.
    pub async fn subscribe_key_filter(
        &self,
        filter: KeyFilter,
        callback: impl FnMut(&str, Option<&Value>) + Send + Sync + 'static,
    ) -> TetherResult<()> {
        let callback: KeyCallback = Box::new(callback);
        self.request(|resp| Command::SubscribeKeyFilter {
            filter,
            callback,
            resp,
        })
        .await
    }

    /// Remove the prefix-filter subscription.
    pub async fn unsubscribe_key_filter(&self) -> TetherResult<()> {
        self.request(|resp| Command::UnsubscribeKeyFilter { resp })
            .await
    }

    /// Install or replace the global catch-all callback, which receives
    /// every value-bearing key change and every expiry.
    pub async fn set_kv_callback(
        &self,
        callback: impl FnMut(&str, Option<&Value>) + Send + Sync + 'static,
    ) -> TetherResult<()> {
        let callback: KeyCallback = Box::new(callback);
        self.request(|resp| Command::SetKvCallback { callback, resp })
            .await
    }

    /// Current table sizes.
    pub async fn stats(&self) -> TetherResult<AgentStats> {
        self.request(|resp| Command::Stats { resp }).await
    }

    /// Stop the event loop and wait for it to finish.
    ///
    /// Pending advertisements are dropped, not flushed.
    pub async fn stop(mut self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ReplicationAgent {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The agent's event loop: commands, inbound publications, and timers,
/// serialized on one task.
async fn event_loop(
    mut core: AgentCore,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    mut updates: mpsc::Receiver<TetherResult<Publication>>,
) {
    tracing::info!(node_id = %core.node_id(), "replication agent started");
    let mut inbound_open = true;

    loop {
        let advertise_at = core.advertise_at;
        let ttl_at = core.ttl_at;
        let sweep_at = core.sweep_at;

        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Stop { done }) => {
                    let _ = done.send(());
                    break;
                }
                Some(cmd) => handle_command(&mut core, cmd).await,
                // Handle dropped without an explicit stop.
                None => break,
            },
            update = updates.recv(), if inbound_open => match update {
                Some(Ok(publication)) => core.process_publication(publication).await,
                Some(Err(e)) => {
                    tracing::info!(error = %e, "store updates reader terminated");
                    inbound_open = false;
                }
                None => {
                    tracing::info!("store updates reader closed");
                    inbound_open = false;
                }
            },
            _ = time::sleep_until(advertise_at) => core.on_advertise_timer().await,
            _ = time::sleep_until(ttl_at) => core.on_ttl_timer().await,
            _ = time::sleep_until(sweep_at.unwrap_or(ttl_at)), if sweep_at.is_some() => {
                core.on_sweep_timer().await;
            }
        }
    }

    tracing::info!("replication agent stopped");
}

async fn handle_command(core: &mut AgentCore, cmd: Command) {
    match cmd {
        Command::PersistKey {
            area,
            key,
            value,
            ttl_ms,
            resp,
        } => {
            let changed = core.persist_key(&area, &key, value, ttl_ms).await;
            let _ = resp.send(changed);
        }
        Command::SetKey {
            area,
            key,
            value,
            version,
            ttl_ms,
            resp,
        } => {
            let result = core.set_key(&area, &key, value, version, ttl_ms).await;
            let _ = resp.send(result);
        }
        Command::SetKeyValue {
            area,
            key,
            value,
            resp,
        } => {
            let result = core.set_key_value(&area, &key, value).await;
            let _ = resp.send(result);
        }
        Command::UnsetKey { area, key, resp } => {
            core.unset_key(&area, &key);
            let _ = resp.send(());
        }
        Command::ClearKey {
            area,
            key,
            value,
            ttl_ms,
            resp,
        } => {
            core.clear_key(&area, &key, value, ttl_ms).await;
            let _ = resp.send(());
        }
        Command::GetKey { area, key, resp } => {
            let value = core.get_key(&area, &key).await;
            let _ = resp.send(value);
        }
        Command::DumpAllWithPrefix { area, prefix, resp } => {
            let dump = core.dump_all_with_prefix(&area, &prefix).await;
            let _ = resp.send(dump);
        }
        Command::SubscribeKey {
            area,
            key,
            callback,
            fetch,
            resp,
        } => {
            let value = core.subscribe_key(&area, &key, callback, fetch).await;
            let _ = resp.send(value);
        }
        Command::UnsubscribeKey { area, key, resp } => {
            core.unsubscribe_key(&area, &key);
            let _ = resp.send(());
        }
        Command::SubscribeKeyFilter {
            filter,
            callback,
            resp,
        } => {
            core.subscribe_key_filter(filter, callback);
            let _ = resp.send(());
        }
        Command::UnsubscribeKeyFilter { resp } => {
            core.unsubscribe_key_filter();
            let _ = resp.send(());
        }
        Command::SetKvCallback { callback, resp } => {
            core.set_kv_callback(callback);
            let _ = resp.send(());
        }
        Command::Stats { resp } => {
            let _ = resp.send(core.stats());
        }
        Command::Stop { .. } => unreachable!("handled by the event loop"),
    }
}
