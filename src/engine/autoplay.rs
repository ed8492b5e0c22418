//! Auto-play session management
//!
//! Drives repeated round cycles with a fixed, pre-chosen selection pattern.
//! The orchestrator only tracks session accounting and stop semantics; the
//! driver owns the cadence timer and performs the actual round calls, so a
//! new cycle can never begin before the previous finalize completed.

use crate::config::AutoPlayDefaults;
use crate::engine::types::CellId;
use crate::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::info;

/// User-configured parameters for one auto-play session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutoStartRequest {
    /// `None` falls back to the configured default; both unset means
    /// unbounded.
    pub bets: Option<u32>,
    pub stop_on_profit: Option<f64>,
    pub stop_on_loss: Option<f64>,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    BetsExhausted,
    ProfitTarget,
    LossLimit,
    UserRequested,
    ModeSwitch,
    Server,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::BetsExhausted => "bets exhausted",
            StopReason::ProfitTarget => "profit target reached",
            StopReason::LossLimit => "loss limit reached",
            StopReason::UserRequested => "user requested",
            StopReason::ModeSwitch => "mode switch",
            StopReason::Server => "server requested",
        };
        write!(f, "{}", s)
    }
}

/// What the driver should do after a settled cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoStep {
    ScheduleNext,
    Stop(StopReason),
}

/// How a stop request takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    /// A cycle is in flight; it completes before the session ends.
    Finishing,
    /// The session ended now; any scheduled next cycle must be cancelled.
    CancelScheduled,
}

/// Accounting for a running auto-play session.
#[derive(Debug, Clone)]
pub struct AutoPlaySession {
    pub selected_cells: BTreeSet<CellId>,
    pub bets_remaining: Option<u32>,
    pub stop_on_profit: Option<f64>,
    pub stop_on_loss: Option<f64>,
    pub running: bool,
    pub finishing: bool,
    pub net_profit: f64,
    stop_reason: Option<StopReason>,
}

pub struct AutoPlayOrchestrator {
    session: Option<AutoPlaySession>,
    /// Chosen pattern, preserved across stops for later re-entry.
    selection: BTreeSet<CellId>,
}

impl AutoPlayOrchestrator {
    pub fn new() -> Self {
        Self {
            session: None,
            selection: BTreeSet::new(),
        }
    }

    pub fn selection(&self) -> &BTreeSet<CellId> {
        &self.selection
    }

    pub fn set_selection(&mut self, cells: BTreeSet<CellId>) {
        self.selection = cells;
    }

    pub fn session(&self) -> Option<&AutoPlaySession> {
        self.session.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.running)
    }

    pub fn is_finishing(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.finishing)
    }

    /// Begin a session over the current selection set. Refuses to start with
    /// nothing selected or while already running.
    pub fn start(
        &mut self,
        request: AutoStartRequest,
        defaults: &AutoPlayDefaults,
    ) -> EngineResult<&AutoPlaySession> {
        if self.is_running() {
            return Err(EngineError::AutoPlay("session already running".into()));
        }
        if self.selection.is_empty() {
            return Err(EngineError::AutoPlay("no cells selected".into()));
        }
        let bets_remaining = request.bets.or(defaults.default_bets);
        if bets_remaining == Some(0) {
            return Err(EngineError::AutoPlay("bet count must be positive".into()));
        }
        let session = AutoPlaySession {
            selected_cells: self.selection.clone(),
            bets_remaining,
            stop_on_profit: request.stop_on_profit.or(defaults.stop_on_profit),
            stop_on_loss: request.stop_on_loss.or(defaults.stop_on_loss),
            running: true,
            finishing: false,
            net_profit: 0.0,
            stop_reason: None,
        };
        info!(
            cells = session.selected_cells.len(),
            bets = ?session.bets_remaining,
            "auto-play session started"
        );
        self.session = Some(session);
        Ok(self.session.as_ref().expect("session just stored"))
    }

    /// Handle a stop request. Mid-cycle the session finishes its in-flight
    /// round first; between cycles it ends immediately.
    pub fn request_stop(&mut self, mid_cycle: bool, reason: StopReason) -> EngineResult<StopAction> {
        let Some(session) = self.session.as_mut() else {
            return Err(EngineError::AutoPlay("no session to stop".into()));
        };
        if mid_cycle {
            session.finishing = true;
            session.stop_reason = Some(reason);
            Ok(StopAction::Finishing)
        } else {
            self.end(reason);
            Ok(StopAction::CancelScheduled)
        }
    }

    /// Settle one completed cycle and decide whether another follows.
    pub fn on_cycle_settled(&mut self, stake: f64, payout: f64) -> AutoStep {
        let Some(session) = self.session.as_mut() else {
            return AutoStep::Stop(StopReason::UserRequested);
        };

        session.net_profit += payout - stake;
        if let Some(remaining) = session.bets_remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }

        let reason = if session.finishing {
            session.stop_reason.or(Some(StopReason::UserRequested))
        } else if session.bets_remaining == Some(0) {
            Some(StopReason::BetsExhausted)
        } else if session
            .stop_on_profit
            .is_some_and(|target| session.net_profit >= target)
        {
            Some(StopReason::ProfitTarget)
        } else if session
            .stop_on_loss
            .is_some_and(|limit| session.net_profit <= -limit)
        {
            Some(StopReason::LossLimit)
        } else {
            None
        };

        match reason {
            Some(reason) => {
                self.end(reason);
                AutoStep::Stop(reason)
            }
            None => AutoStep::ScheduleNext,
        }
    }

    /// Discard the session immediately, keeping the stored selection for
    /// later re-entry. Returns whether a session existed.
    pub fn force_stop(&mut self, reason: StopReason) -> bool {
        if self.session.is_some() {
            self.end(reason);
            true
        } else {
            false
        }
    }

    fn end(&mut self, reason: StopReason) {
        if let Some(session) = self.session.take() {
            info!(
                %reason,
                net_profit = session.net_profit,
                "auto-play session ended"
            );
        }
    }
}

impl Default for AutoPlayOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}
