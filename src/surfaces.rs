//! Consumed rendering and control-surface contracts
//!
//! The engine owns round state exclusively. Surfaces read through these
//! contracts and feed input back as [`crate::engine::driver::EngineEvent`]s;
//! they never mutate round state directly.

use crate::engine::autoplay::AutoPlayOrchestrator;
use crate::engine::round::RoundController;
use crate::engine::types::{Assignment, CellId, CellOutcome};
use std::collections::VecDeque;

/// Options for a forced full-board reveal.
#[derive(Debug, Clone, Copy, Default)]
pub struct RevealAllOptions {
    /// Skip per-cell pacing and show everything at once.
    pub instant: bool,
}

/// Options for clearing the board between rounds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetOptions {
    pub clear_selection: bool,
}

/// Completion callbacks a render surface reports back to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderCallback {
    RevealComplete { cell: CellId, outcome: CellOutcome },
    RoundComplete,
}

/// Board rendering contract.
///
/// Animated surfaces return `true` from [`RenderSurface::reveal_cell`] and
/// deliver completions asynchronously; the engine polls
/// [`RenderSurface::drain_callbacks`] after every command, and embedders of
/// fully external renderers may instead dispatch the callbacks as events.
pub trait RenderSurface {
    fn set_round(&mut self, assignment: &Assignment);

    /// Begin revealing one cell. Returns whether the reveal started.
    fn reveal_cell(&mut self, cell: CellId) -> bool;

    /// Force-reveal every remaining cell, then report round completion.
    fn reveal_all(&mut self, options: RevealAllOptions);

    fn reset(&mut self, options: ResetOptions);

    /// Completion callbacks produced since the last call.
    fn drain_callbacks(&mut self) -> Vec<RenderCallback> {
        Vec::new()
    }
}

/// Auto-play button face.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoButtonMode {
    Start,
    Stop,
    Finishing,
}

/// Control widget contract.
pub trait ControlSurface {
    fn set_bet_button_state(&mut self, enabled: bool);
    fn set_cashout_available(&mut self, available: bool);
    fn set_auto_button_mode(&mut self, mode: AutoButtonMode);
    fn set_remaining_bets(&mut self, remaining: Option<u32>);

    /// Display sync for the running payout multiplier.
    fn set_multiplier(&mut self, _multiplier: f64) {}

    /// Display sync for the server-tracked balance.
    fn set_profit_total(&mut self, _total: f64) {}

    /// Push a full derived snapshot in one pass.
    fn apply(&mut self, state: &ControlState) {
        self.set_bet_button_state(state.bet_enabled);
        self.set_cashout_available(state.cashout_available);
        self.set_auto_button_mode(state.auto_button);
        self.set_remaining_bets(state.remaining_bets);
        self.set_multiplier(state.multiplier);
    }
}

/// Every control widget state, derived as a pure function of engine state
/// and recomputed once per transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlState {
    pub bet_enabled: bool,
    pub cashout_available: bool,
    pub auto_button: AutoButtonMode,
    pub remaining_bets: Option<u32>,
    pub multiplier: f64,
}

impl ControlState {
    pub fn derive(round: &RoundController, auto: &AutoPlayOrchestrator) -> Self {
        let auto_button = if auto.is_finishing() {
            AutoButtonMode::Finishing
        } else if auto.is_running() {
            AutoButtonMode::Stop
        } else {
            AutoButtonMode::Start
        };

        Self {
            bet_enabled: round.state() == crate::engine::types::RoundState::Idle
                && !auto.is_running(),
            cashout_available: round.cashout_eligible() && !auto.is_running(),
            auto_button,
            remaining_bets: auto.session().and_then(|s| s.bets_remaining),
            multiplier: round.payout_multiplier(),
        }
    }
}

/// Render surface without animation: every command completes immediately.
#[derive(Default)]
pub struct HeadlessRender {
    assignment: Option<Assignment>,
    callbacks: VecDeque<RenderCallback>,
    revealed: Vec<CellId>,
    resets: usize,
}

impl HeadlessRender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revealed(&self) -> &[CellId] {
        &self.revealed
    }

    pub fn resets(&self) -> usize {
        self.resets
    }
}

impl RenderSurface for HeadlessRender {
    fn set_round(&mut self, assignment: &Assignment) {
        self.assignment = Some(assignment.clone());
        self.revealed.clear();
    }

    fn reveal_cell(&mut self, cell: CellId) -> bool {
        let Some(outcome) = self.assignment.as_ref().and_then(|a| a.outcome(cell)) else {
            return false;
        };
        self.revealed.push(cell);
        self.callbacks
            .push_back(RenderCallback::RevealComplete { cell, outcome });
        true
    }

    fn reveal_all(&mut self, _options: RevealAllOptions) {
        self.callbacks.push_back(RenderCallback::RoundComplete);
    }

    fn reset(&mut self, _options: ResetOptions) {
        self.assignment = None;
        self.revealed.clear();
        self.resets += 1;
    }

    fn drain_callbacks(&mut self) -> Vec<RenderCallback> {
        self.callbacks.drain(..).collect()
    }
}

/// Control surface that records the latest derived snapshot.
#[derive(Default)]
pub struct RecordingControls {
    pub last: Option<ControlState>,
    pub profit_total: Option<f64>,
    pub applies: usize,
}

impl ControlSurface for RecordingControls {
    fn set_bet_button_state(&mut self, _enabled: bool) {}
    fn set_cashout_available(&mut self, _available: bool) {}
    fn set_auto_button_mode(&mut self, _mode: AutoButtonMode) {}
    fn set_remaining_bets(&mut self, _remaining: Option<u32>) {}

    fn set_profit_total(&mut self, total: f64) {
        self.profit_total = Some(total);
    }

    fn apply(&mut self, state: &ControlState) {
        self.last = Some(state.clone());
        self.applies += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn tiny_assignment() -> Assignment {
        let cells: HashMap<CellId, CellOutcome> = [
            (0, CellOutcome::Safe),
            (1, CellOutcome::Mine),
            (2, CellOutcome::Safe),
        ]
        .into_iter()
        .collect();
        Assignment::mine_grid(cells)
    }

    #[test]
    fn test_headless_reveal_completes_immediately() {
        let mut render = HeadlessRender::new();
        render.set_round(&tiny_assignment());
        assert!(render.reveal_cell(1));
        assert_eq!(
            render.drain_callbacks(),
            vec![RenderCallback::RevealComplete {
                cell: 1,
                outcome: CellOutcome::Mine
            }]
        );
        assert!(render.drain_callbacks().is_empty());
    }

    #[test]
    fn test_headless_rejects_unknown_cell() {
        let mut render = HeadlessRender::new();
        render.set_round(&tiny_assignment());
        assert!(!render.reveal_cell(9));
        assert!(render.drain_callbacks().is_empty());
    }

    #[test]
    fn test_headless_reveal_all_reports_round_complete() {
        let mut render = HeadlessRender::new();
        render.set_round(&tiny_assignment());
        render.reveal_all(RevealAllOptions { instant: true });
        assert_eq!(render.drain_callbacks(), vec![RenderCallback::RoundComplete]);
    }
}
