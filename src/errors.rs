//! Error types for the tilebet engine
//!
//! Nothing in this crate is treated as process-fatal. Invalid transitions and
//! stale settlement results are logged and ignored by the driver; malformed
//! envelopes are default-substituted by the relay. The variants here exist so
//! callers and tests can observe exactly why an action was refused.

use crate::engine::types::RoundState;
use thiserror::Error;

/// Root error type for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// An action was attempted in a state that forbids it. Reachable through
    /// ordinary UI races, so the driver logs and drops it.
    #[error("`{action}` not allowed in state {state}")]
    InvalidTransition {
        action: &'static str,
        state: RoundState,
    },

    /// A settlement result arrived for a selection that no longer exists.
    #[error("stale settlement result for selection token {token}")]
    StaleResult { token: u64 },

    /// A settlement envelope could not be normalized even with defaults.
    #[error("malformed settlement envelope: {0}")]
    MalformedEnvelope(String),

    /// Auto-play could not start or step.
    #[error("auto-play refused: {0}")]
    AutoPlay(String),

    /// Configuration failed validation or could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The settlement channel rejected an outbound envelope.
    #[error("settlement channel failure: {0}")]
    Channel(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
