//! Error types.
//!
//! Tether defines a small set of error conditions. Store transport failures
//! are caught and logged at the engine that issued the call; they never
//! unwind through the agent's event loop. The variants here surface through
//! the public API only.

use thiserror::Error;

/// Common Tether error conditions.
#[derive(Debug, Error)]
pub enum TetherError {
    /// Transport failure talking to the replicated store.
    #[error("store request failed: {message}")]
    Store { message: String },

    /// Key not present in the store.
    #[error("key not found")]
    KeyNotFound,

    /// The agent's event loop has stopped; the command was not processed.
    #[error("replication agent is shutting down")]
    ShuttingDown,

    /// Configuration rejected at construction.
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
}

impl TetherError {
    /// Create a Store transport error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Check if this error indicates the operation may be retried.
    ///
    /// Transport failures are retried by the responsible timer; the other
    /// conditions are terminal for the call that produced them.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Store { .. })
    }
}

/// Result type using TetherError.
pub type TetherResult<T> = Result<T, TetherError>;
