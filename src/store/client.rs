//! Consumed store contract.
//!
//! The agent treats the node-local replicated store as an external
//! collaborator behind [`StoreHandle`]. Implementations are expected to be
//! cheap to call from the agent's event loop; the agent serializes every
//! call, so a slow implementation stalls timers and publication processing.
//!
//! The updates reader produces an indefinite stream of publications until
//! the store shuts down; a terminal error item (or channel close) ends the
//! agent's inbound processing while local APIs keep working.

use crate::core::error::TetherResult;
use crate::store::types::{AreaId, Publication, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Parameters for a keyed read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyGetParams {
    /// Keys to fetch.
    pub keys: Vec<String>,
}

/// Parameters for a write of one or more key-values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeySetParams {
    /// Key-values to merge into the store.
    pub key_vals: BTreeMap<String, Value>,
}

/// Parameters for a snapshot dump.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyDumpParams {
    /// Prefix the dumped keys must start with; empty dumps everything.
    pub prefix: String,

    /// Optional explicit key list narrowing the dump.
    pub keys: Vec<String>,
}

/// Handle to the node-local replicated store.
///
/// The handle is shared with the agent's event loop and must be safe to
/// call from it; implementations typically wrap a thread-safe client.
#[async_trait]
pub trait StoreHandle: Send + Sync {
    /// Read the listed keys from one area.
    async fn get_key_vals(
        &self,
        area: &AreaId,
        params: KeyGetParams,
    ) -> TetherResult<Publication>;

    /// Dump a snapshot of the given areas.
    async fn dump_key_vals(
        &self,
        params: KeyDumpParams,
        areas: Vec<AreaId>,
    ) -> TetherResult<Vec<Publication>>;

    /// Merge key-values into one area.
    async fn set_key_vals(&self, area: &AreaId, params: KeySetParams) -> TetherResult<()>;

    /// Obtain the inbound publication reader.
    ///
    /// The receiver yields publications until the store terminates the
    /// stream with an error item or closes the channel.
    fn updates(&self) -> mpsc::Receiver<TetherResult<Publication>>;
}
