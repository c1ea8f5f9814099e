//! Agent configuration and shared constants.
//!
//! The pacing constants here are shared with the replicated store's own
//! configuration; callers should read them from this module rather than
//! hardcode the values.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sentinel TTL for keys that never expire and need no refresh.
pub const TTL_INFINITE: i64 = i64::MAX;

/// First delay applied to a key's advertisement backoff.
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(64);

/// Ceiling on a key's advertisement backoff.
pub const MAX_BACKOFF: Duration = Duration::from_millis(8192);

/// Ceiling on the TTL refresh timer, regardless of tracked key TTLs.
pub const MAX_TTL_UPDATE_INTERVAL: Duration = Duration::from_secs(1200);

/// Retry delay for a failed sweep read, bounded by the sweep period.
pub const SWEEP_RETRY: Duration = Duration::from_secs(1);

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Identity stamped as originator on every value this node advertises.
    pub node_id: String,

    /// First delay of the per-key advertisement backoff.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff: Duration,

    /// Cap on the per-key advertisement backoff.
    #[serde(default = "default_max_backoff")]
    pub max_backoff: Duration,

    /// Cap on the TTL refresh timer.
    #[serde(default = "default_max_ttl_update_interval")]
    pub max_ttl_update_interval: Duration,

    /// Period of the persisted-key sweep. `None` disables the sweep.
    #[serde(default)]
    pub sweep_period: Option<Duration>,
}

fn default_initial_backoff() -> Duration {
    INITIAL_BACKOFF
}

fn default_max_backoff() -> Duration {
    MAX_BACKOFF
}

fn default_max_ttl_update_interval() -> Duration {
    MAX_TTL_UPDATE_INTERVAL
}

impl AgentConfig {
    /// Create a configuration with default pacing for the given node id.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
            max_ttl_update_interval: MAX_TTL_UPDATE_INTERVAL,
            sweep_period: None,
        }
    }

    /// Enable the persisted-key sweep with the given period.
    pub fn with_sweep_period(mut self, period: Duration) -> Self {
        self.sweep_period = Some(period);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            anyhow::bail!("node_id must not be empty");
        }
        if self.initial_backoff.is_zero() {
            anyhow::bail!("initial_backoff must be > 0");
        }
        if self.initial_backoff > self.max_backoff {
            anyhow::bail!(
                "initial_backoff ({:?}) must not exceed max_backoff ({:?})",
                self.initial_backoff,
                self.max_backoff
            );
        }
        if self.max_ttl_update_interval.is_zero() {
            anyhow::bail!("max_ttl_update_interval must be > 0");
        }
        if let Some(period) = self.sweep_period {
            if period.is_zero() {
                anyhow::bail!("sweep_period must be > 0 when set");
            }
        }
        Ok(())
    }
}
