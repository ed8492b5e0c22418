//! tilebet - round lifecycle and auto-play engine for a tile-reveal
//! wagering game
//!
//! The player stakes a wager, reveals board cells (or receives a
//! pre-committed outcome), and the engine resolves win or loss, pays out,
//! and can repeat the cycle unattended. Outcomes come from a local
//! generator in demo mode or an external settlement channel in live mode;
//! the round lifecycle is identical either way.
//!
//! Rendering, controls and the settlement transport are consumed through
//! the contracts in [`surfaces`] and [`engine::relay`]; the engine owns all
//! round state itself.

pub mod config;
pub mod engine;
pub mod errors;
pub mod surfaces;
pub mod timer;

pub use config::EngineConfig;
pub use engine::driver::{ControlEvent, Engine, EngineEvent};
pub use engine::types::{
    Assignment, CellId, CellOutcome, GameVariant, PlayMode, RelayMode, RoundOutcome, RoundResult,
    RoundState, Wager,
};
pub use errors::{EngineError, EngineResult};
