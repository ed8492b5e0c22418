//! Per-round state machine
//!
//! The controller owns the canonical [`Assignment`] and [`RoundState`] for
//! one board. It accepts wagers and cell selections, applies settlement
//! results, tracks cashout eligibility and closes the round. It performs no
//! I/O of its own; the driver routes its transitions to the relay and the
//! render surface.

use crate::engine::types::{
    Assignment, CellId, CellOutcome, PlayMode, RoundOutcome, RoundResult, RoundState, Selection,
    SelectionToken, Wager,
};
use crate::errors::{EngineError, EngineResult};
use chrono::Utc;
use std::collections::BTreeSet;
use tracing::debug;
use uuid::Uuid;

/// Flat payout for pre-committed match rounds.
const MATCH_WIN_MULTIPLIER: f64 = 2.0;

/// Progress of an in-flight reveal batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevealProgress {
    /// More completions outstanding.
    Pending,
    /// Batch done, round continues.
    BackToActive,
    /// Batch done and the round closed; remaining cells must be
    /// force-revealed before finalizing.
    Closed(RoundOutcome),
    /// Completion for a cell the controller is not tracking, e.g. during a
    /// full-board reveal. Dropped.
    Ignored,
}

/// The per-round state machine.
pub struct RoundController {
    board_cells: u8,
    state: RoundState,
    play_mode: PlayMode,
    round_id: Option<Uuid>,
    wager: Option<Wager>,
    assignment: Option<Assignment>,
    revealed: BTreeSet<CellId>,
    revealed_safe: u32,
    selection: Option<Selection>,
    in_flight: BTreeSet<CellId>,
    hit_mine: bool,
    token_seq: u64,
    pending_result: Option<RoundResult>,
}

impl RoundController {
    pub fn new(board_cells: u8) -> Self {
        Self {
            board_cells,
            state: RoundState::Idle,
            play_mode: PlayMode::Manual,
            round_id: None,
            wager: None,
            assignment: None,
            revealed: BTreeSet::new(),
            revealed_safe: 0,
            selection: None,
            in_flight: BTreeSet::new(),
            hit_mine: false,
            token_seq: 0,
            pending_result: None,
        }
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn play_mode(&self) -> PlayMode {
        self.play_mode
    }

    pub fn set_play_mode(&mut self, mode: PlayMode) {
        self.play_mode = mode;
    }

    pub fn round_id(&self) -> Option<Uuid> {
        self.round_id
    }

    pub fn wager(&self) -> Option<&Wager> {
        self.wager.as_ref()
    }

    pub fn assignment(&self) -> Option<&Assignment> {
        self.assignment.as_ref()
    }

    pub fn revealed_safe(&self) -> u32 {
        self.revealed_safe
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    /// Cashout requires an active round with at least one safe reveal.
    pub fn cashout_eligible(&self) -> bool {
        self.state == RoundState::RoundActive && self.revealed_safe > 0
    }

    /// Fair-odds multiplier accumulated over the safe reveals so far.
    pub fn payout_multiplier(&self) -> f64 {
        self.multiplier_at(self.revealed_safe)
    }

    fn multiplier_at(&self, safe_reveals: u32) -> f64 {
        let Some(assignment) = self.assignment.as_ref() else {
            return 1.0;
        };
        if assignment.is_precommitted() {
            return 1.0;
        }
        let total = assignment.len() as f64;
        let safe = assignment.safe_count() as f64;
        let mut multiplier = 1.0;
        for i in 0..safe_reveals {
            let i = i as f64;
            if safe - i <= 0.0 {
                break;
            }
            multiplier *= (total - i) / (safe - i);
        }
        multiplier
    }

    /// `Idle -> AwaitingBet`. A second submit while a round exists is
    /// rejected, which is what prevents double-staking.
    pub fn submit_bet(&mut self, wager: Wager) -> EngineResult<()> {
        self.guard("bet", self.state == RoundState::Idle)?;
        self.round_id = Some(Uuid::new_v4());
        self.wager = Some(wager);
        self.state = RoundState::AwaitingBet;
        Ok(())
    }

    /// `AwaitingBet -> RoundActive`. Resets the reveal counters.
    pub fn apply_assignment(&mut self, assignment: Assignment) -> EngineResult<()> {
        self.guard("assignment", self.state == RoundState::AwaitingBet)?;
        self.revealed.clear();
        self.revealed_safe = 0;
        self.hit_mine = false;
        self.assignment = Some(assignment);
        self.state = RoundState::RoundActive;
        Ok(())
    }

    /// `RoundActive -> SelectionPending` for a single manual pick.
    pub fn pick_cell(&mut self, cell: CellId) -> EngineResult<Selection> {
        self.guard("pick", self.state == RoundState::RoundActive)?;
        if self.play_mode == PlayMode::Auto {
            return Err(EngineError::InvalidTransition {
                action: "manual pick in auto mode",
                state: self.state,
            });
        }
        if cell >= self.board_cells || self.revealed.contains(&cell) {
            return Err(EngineError::InvalidTransition {
                action: "pick revealed or unknown cell",
                state: self.state,
            });
        }
        let selection = Selection::single(cell, self.mint_token());
        self.selection = Some(selection.clone());
        self.state = RoundState::SelectionPending;
        Ok(selection)
    }

    /// `RoundActive -> SelectionPending` for a stored auto-play batch or a
    /// pre-committed layout resolved in one pass.
    pub fn select_batch(&mut self, cells: BTreeSet<CellId>) -> EngineResult<Selection> {
        self.guard("batch", self.state == RoundState::RoundActive)?;
        let precommitted = self
            .assignment
            .as_ref()
            .is_some_and(|a| a.is_precommitted());
        if self.play_mode != PlayMode::Auto && !precommitted {
            return Err(EngineError::InvalidTransition {
                action: "batch in manual mode",
                state: self.state,
            });
        }
        if cells.is_empty() {
            return Err(EngineError::AutoPlay("empty batch selection".into()));
        }
        if cells
            .iter()
            .any(|c| *c >= self.board_cells || self.revealed.contains(c))
        {
            return Err(EngineError::AutoPlay("batch contains unusable cells".into()));
        }
        let selection = Selection::batch(cells, self.mint_token());
        self.selection = Some(selection.clone());
        self.state = RoundState::SelectionPending;
        Ok(selection)
    }

    /// `SelectionPending -> AwaitingSettlement` once the relay took the
    /// selection.
    pub fn mark_dispatched(&mut self, token: SelectionToken) -> EngineResult<()> {
        self.guard("dispatch", self.state == RoundState::SelectionPending)?;
        self.check_token(token)?;
        self.state = RoundState::AwaitingSettlement;
        Ok(())
    }

    /// Apply a settlement result for the live selection and hand back the
    /// reveals to execute, in delivery order.
    ///
    /// Results whose token no longer matches are discarded as stale; that is
    /// what protects against a reset racing a remote response.
    pub fn apply_selection_result(
        &mut self,
        token: SelectionToken,
        outcomes: &[(CellId, CellOutcome)],
    ) -> EngineResult<Vec<(CellId, CellOutcome)>> {
        self.guard("settlement", self.state == RoundState::AwaitingSettlement)?;
        self.check_token(token)?;
        let selection = self.selection.take().unwrap_or_else(|| {
            Selection::batch(BTreeSet::new(), token)
        });

        let mut reveals = Vec::with_capacity(outcomes.len());
        for (cell, outcome) in outcomes {
            if !selection.cells.contains(cell) {
                debug!(cell, "settlement outcome for unselected cell dropped");
                continue;
            }
            self.in_flight.insert(*cell);
            reveals.push((*cell, *outcome));
        }

        if reveals.is_empty() {
            // Nothing usable in the result; resume the round.
            self.state = RoundState::RoundActive;
        }
        Ok(reveals)
    }

    /// Process one reveal completion from the render surface. Counters move
    /// here, after the animation, so no later action can race a cell that is
    /// still being revealed.
    pub fn on_reveal_complete(
        &mut self,
        cell: CellId,
        outcome: CellOutcome,
    ) -> EngineResult<RevealProgress> {
        if !self.in_flight.remove(&cell) {
            return Ok(RevealProgress::Ignored);
        }
        self.guard("reveal", self.state == RoundState::AwaitingSettlement)?;

        self.revealed.insert(cell);
        match outcome {
            CellOutcome::Mine => self.hit_mine = true,
            CellOutcome::Safe => self.revealed_safe += 1,
            CellOutcome::Symbol(_) => {}
        }

        if !self.in_flight.is_empty() {
            return Ok(RevealProgress::Pending);
        }

        let assignment = self.assignment.as_ref().ok_or_else(|| {
            EngineError::InvalidTransition {
                action: "reveal without assignment",
                state: self.state,
            }
        })?;

        if assignment.is_precommitted() {
            let outcome = if assignment.winning_symbol().is_some() {
                RoundOutcome::Win
            } else {
                RoundOutcome::Loss
            };
            let payout = match outcome {
                RoundOutcome::Win => self.stake() * MATCH_WIN_MULTIPLIER,
                _ => 0.0,
            };
            self.close(outcome, payout);
            return Ok(RevealProgress::Closed(outcome));
        }

        if self.hit_mine {
            self.close(RoundOutcome::Loss, 0.0);
            return Ok(RevealProgress::Closed(RoundOutcome::Loss));
        }

        let full_win = assignment.safe_count() > 0
            && self.revealed_safe as usize == assignment.safe_count();
        if full_win {
            let payout = self.stake() * self.payout_multiplier();
            self.close(RoundOutcome::Win, payout);
            return Ok(RevealProgress::Closed(RoundOutcome::Win));
        }

        self.state = RoundState::RoundActive;
        Ok(RevealProgress::BackToActive)
    }

    /// `RoundActive -> Cashout`. Returns the payout for display and relay.
    pub fn request_cashout(&mut self) -> EngineResult<f64> {
        self.guard("cashout", self.cashout_eligible())?;
        let payout = self.stake() * self.payout_multiplier();
        self.close(RoundOutcome::CashedOut, payout);
        Ok(payout)
    }

    /// Apply a server-confirmed cashout amount to the not-yet-finalized
    /// result. Confirmations arriving after finalize are stale.
    pub fn confirm_cashout(&mut self, payout: Option<f64>) -> EngineResult<()> {
        self.guard("cashout confirmation", self.state == RoundState::Cashout)?;
        if let (Some(result), Some(confirmed)) = (self.pending_result.as_mut(), payout) {
            result.payout = confirmed;
        }
        Ok(())
    }

    /// `GameOver | Cashout -> Finalizing`. Emits the round summary.
    pub fn begin_finalize(&mut self) -> EngineResult<RoundResult> {
        self.guard(
            "finalize",
            matches!(self.state, RoundState::GameOver | RoundState::Cashout),
        )?;
        let result = self.pending_result.take().ok_or(EngineError::InvalidTransition {
            action: "finalize without result",
            state: self.state,
        })?;
        self.state = RoundState::Finalizing;
        Ok(result)
    }

    /// Return to `Idle`, discarding the wager, assignment and any pending
    /// selection. Idempotent: resetting an idle controller is a no-op and
    /// reports `false`.
    pub fn reset(&mut self) -> bool {
        if self.state == RoundState::Idle {
            return false;
        }
        self.round_id = None;
        self.wager = None;
        self.assignment = None;
        self.revealed.clear();
        self.revealed_safe = 0;
        self.selection = None;
        self.in_flight.clear();
        self.hit_mine = false;
        self.pending_result = None;
        self.state = RoundState::Idle;
        true
    }

    fn stake(&self) -> f64 {
        self.wager.as_ref().map(|w| w.amount).unwrap_or(0.0)
    }

    fn close(&mut self, outcome: RoundOutcome, payout: f64) {
        self.pending_result = Some(RoundResult {
            round_id: self.round_id.unwrap_or_else(Uuid::new_v4),
            wager: self
                .wager
                .clone()
                .unwrap_or_else(|| Wager::new(0.0, 0)),
            outcome,
            payout,
            revealed_safe: self.revealed_safe,
            settled_at: Utc::now(),
        });
        self.state = match outcome {
            RoundOutcome::CashedOut => RoundState::Cashout,
            _ => RoundState::GameOver,
        };
    }

    fn mint_token(&mut self) -> SelectionToken {
        self.token_seq += 1;
        SelectionToken(self.token_seq)
    }

    fn check_token(&self, token: SelectionToken) -> EngineResult<()> {
        match self.selection.as_ref() {
            Some(s) if s.token == token => Ok(()),
            _ => Err(EngineError::StaleResult { token: token.0 }),
        }
    }

    fn guard(&self, action: &'static str, ok: bool) -> EngineResult<()> {
        if ok {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                action,
                state: self.state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn mine_assignment(mines: &[CellId], cells: u8) -> Assignment {
        let map: HashMap<CellId, CellOutcome> = (0..cells)
            .map(|c| {
                let o = if mines.contains(&c) {
                    CellOutcome::Mine
                } else {
                    CellOutcome::Safe
                };
                (c, o)
            })
            .collect();
        Assignment::mine_grid(map)
    }

    fn active_controller() -> RoundController {
        let mut round = RoundController::new(25);
        round.submit_bet(Wager::new(1.0, 5)).unwrap();
        round
            .apply_assignment(mine_assignment(&[20, 21, 22, 23, 24], 25))
            .unwrap();
        round
    }

    fn resolve_pick(round: &mut RoundController, cell: CellId) -> RevealProgress {
        let selection = round.pick_cell(cell).unwrap();
        round.mark_dispatched(selection.token).unwrap();
        let outcome = round.assignment().unwrap().outcome(cell).unwrap();
        let reveals = round
            .apply_selection_result(selection.token, &[(cell, outcome)])
            .unwrap();
        let mut progress = RevealProgress::Pending;
        for (cell, outcome) in reveals {
            progress = round.on_reveal_complete(cell, outcome).unwrap();
        }
        progress
    }

    #[test]
    fn test_double_bet_rejected() {
        let mut round = RoundController::new(25);
        round.submit_bet(Wager::new(1.0, 5)).unwrap();
        let err = round.submit_bet(Wager::new(1.0, 5)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_safe_pick_round_trip() {
        let mut round = active_controller();
        assert!(!round.cashout_eligible());
        let progress = resolve_pick(&mut round, 0);
        assert_eq!(progress, RevealProgress::BackToActive);
        assert_eq!(round.state(), RoundState::RoundActive);
        assert_eq!(round.revealed_safe(), 1);
        assert!(round.cashout_eligible());
        assert!(round.payout_multiplier() > 1.0);
    }

    #[test]
    fn test_mine_pick_closes_round() {
        let mut round = active_controller();
        let progress = resolve_pick(&mut round, 20);
        assert_eq!(progress, RevealProgress::Closed(RoundOutcome::Loss));
        assert_eq!(round.state(), RoundState::GameOver);
        assert!(!round.cashout_eligible());
    }

    #[test]
    fn test_pick_rejected_while_pending() {
        let mut round = active_controller();
        round.pick_cell(0).unwrap();
        let err = round.pick_cell(1).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_pick_rejected_on_revealed_cell() {
        let mut round = active_controller();
        resolve_pick(&mut round, 0);
        let err = round.pick_cell(0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_pick_rejected_in_auto_mode() {
        let mut round = active_controller();
        round.set_play_mode(PlayMode::Auto);
        let err = round.pick_cell(0).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[test]
    fn test_stale_result_discarded() {
        let mut round = active_controller();
        let selection = round.pick_cell(0).unwrap();
        round.mark_dispatched(selection.token).unwrap();
        let stale = SelectionToken(selection.token.0 + 100);
        let err = round
            .apply_selection_result(stale, &[(0, CellOutcome::Safe)])
            .unwrap_err();
        assert!(matches!(err, EngineError::StaleResult { .. }));
        // The genuine result still applies afterwards.
        let reveals = round
            .apply_selection_result(selection.token, &[(0, CellOutcome::Safe)])
            .unwrap();
        assert_eq!(reveals.len(), 1);
    }

    #[test]
    fn test_batch_reveal_and_full_flow() {
        let mut round = active_controller();
        round.set_play_mode(PlayMode::Auto);
        let cells: BTreeSet<CellId> = [0, 1, 2].into_iter().collect();
        let selection = round.select_batch(cells).unwrap();
        round.mark_dispatched(selection.token).unwrap();
        let outcomes: Vec<(CellId, CellOutcome)> =
            vec![(0, CellOutcome::Safe), (1, CellOutcome::Safe), (2, CellOutcome::Safe)];
        let reveals = round
            .apply_selection_result(selection.token, &outcomes)
            .unwrap();
        assert_eq!(reveals.len(), 3);
        assert_eq!(
            round.on_reveal_complete(0, CellOutcome::Safe).unwrap(),
            RevealProgress::Pending
        );
        assert_eq!(
            round.on_reveal_complete(1, CellOutcome::Safe).unwrap(),
            RevealProgress::Pending
        );
        assert_eq!(
            round.on_reveal_complete(2, CellOutcome::Safe).unwrap(),
            RevealProgress::BackToActive
        );
        assert_eq!(round.revealed_safe(), 3);
    }

    #[test]
    fn test_full_win_closes_with_payout() {
        let mut round = RoundController::new(4);
        round.submit_bet(Wager::new(1.0, 2)).unwrap();
        round
            .apply_assignment(mine_assignment(&[2, 3], 4))
            .unwrap();
        resolve_pick(&mut round, 0);
        let progress = resolve_pick(&mut round, 1);
        assert_eq!(progress, RevealProgress::Closed(RoundOutcome::Win));
        let result = round.begin_finalize().unwrap();
        assert_eq!(result.outcome, RoundOutcome::Win);
        // 4/2 * 3/1 = 6x on a full clear of a 4-cell, 2-mine board.
        assert!((result.payout - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_cashout_payout_and_finalize() {
        let mut round = active_controller();
        resolve_pick(&mut round, 0);
        resolve_pick(&mut round, 1);
        let payout = round.request_cashout().unwrap();
        // 25/20 * 24/19 after two safe reveals on a 25-cell, 5-mine board.
        assert!((payout - (25.0 / 20.0) * (24.0 / 19.0)).abs() < 1e-9);
        assert_eq!(round.state(), RoundState::Cashout);
        round.confirm_cashout(Some(1.6)).unwrap();
        let result = round.begin_finalize().unwrap();
        assert_eq!(result.outcome, RoundOutcome::CashedOut);
        assert!((result.payout - 1.6).abs() < 1e-9);
        assert_eq!(round.state(), RoundState::Finalizing);
        assert!(!round.cashout_eligible());
    }

    #[test]
    fn test_cashout_rejected_without_safe_reveal() {
        let mut round = active_controller();
        assert!(round.request_cashout().is_err());
    }

    #[test]
    fn test_reset_idempotence() {
        let mut round = RoundController::new(25);
        assert!(!round.reset());
        round.submit_bet(Wager::new(1.0, 5)).unwrap();
        assert!(round.reset());
        assert_eq!(round.state(), RoundState::Idle);
        assert!(round.assignment().is_none());
        assert!(!round.reset());
    }

    #[test]
    fn test_reset_invalidates_selection_token() {
        let mut round = active_controller();
        let selection = round.pick_cell(0).unwrap();
        round.mark_dispatched(selection.token).unwrap();
        round.reset();
        round.submit_bet(Wager::new(1.0, 5)).unwrap();
        round
            .apply_assignment(mine_assignment(&[20], 25))
            .unwrap();
        // The old token can no longer resolve anything on the new round.
        let err = round
            .apply_selection_result(selection.token, &[(0, CellOutcome::Safe)])
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidTransition { .. } | EngineError::StaleResult { .. }
        ));
    }

    #[test]
    fn test_precommitted_round_resolves_in_one_batch() {
        let mut round = RoundController::new(6);
        round.submit_bet(Wager::new(2.0, 4)).unwrap();
        let symbols: HashMap<CellId, u8> =
            [(0, 1), (1, 1), (2, 1), (3, 2), (4, 2), (5, 3)].into_iter().collect();
        round
            .apply_assignment(Assignment::match_types(symbols, Some(1)))
            .unwrap();
        let cells: BTreeSet<CellId> = (0..6).collect();
        let selection = round.select_batch(cells).unwrap();
        round.mark_dispatched(selection.token).unwrap();
        let outcomes: Vec<(CellId, CellOutcome)> = (0..6)
            .map(|c| (c, round.assignment().unwrap().outcome(c).unwrap()))
            .collect();
        let reveals = round
            .apply_selection_result(selection.token, &outcomes)
            .unwrap();
        let mut last = RevealProgress::Pending;
        for (cell, outcome) in reveals {
            last = round.on_reveal_complete(cell, outcome).unwrap();
        }
        assert_eq!(last, RevealProgress::Closed(RoundOutcome::Win));
        let result = round.begin_finalize().unwrap();
        assert!((result.payout - 4.0).abs() < 1e-9);
    }
}
