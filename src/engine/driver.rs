//! Engine driver: the single owner of all round state
//!
//! All four trigger sources (control-surface events, timer expirations,
//! settlement messages and render completion callbacks) funnel into one
//! event queue processed a single item at a time, so transition ordering and
//! reentrancy follow from the queue discipline rather than callback depth.
//!
//! The queue itself is synchronous; [`Engine::run`] wraps it in a
//! current-thread async loop that turns due timers and channel traffic into
//! queued events.

use crate::config::EngineConfig;
use crate::engine::autoplay::{
    AutoPlayOrchestrator, AutoStartRequest, AutoStep, StopAction, StopReason,
};
use crate::engine::relay::{
    InboundMessage, OutboundMessage, RelayBridge, RelayDecision, RelayEnvelope, SettlementChannel,
};
use crate::engine::round::{RevealProgress, RoundController};
use crate::engine::types::{
    Assignment, CellId, CellOutcome, PlayMode, RelayMode, RoundResult, RoundState, SelectionToken,
    Wager,
};
use crate::errors::{EngineError, EngineResult};
use crate::surfaces::{
    ControlState, ControlSurface, RenderCallback, RenderSurface, ResetOptions, RevealAllOptions,
};
use crate::timer::{TimerKind, TimerRegistry, TimerToken};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::{BTreeSet, VecDeque};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Discrete events consumed by the engine, one at a time.
#[derive(Debug)]
pub enum EngineEvent {
    /// UI input relayed by the embedder.
    Control(ControlEvent),
    /// Raw envelope from the settlement channel.
    Inbound(RelayEnvelope),
    /// A cooperative timer expired.
    TimerFired(TimerToken),
    /// Completion callback from the render surface.
    Render(RenderCallback),
    /// Normalized settlement message, delivered after demo latency.
    Message(InboundMessage),
    /// Begin the next auto-play cycle.
    AutoCycle,
    /// Reveal the next staggered batch cell.
    RevealNext,
}

/// Control-surface input events.
#[derive(Debug, Clone)]
pub enum ControlEvent {
    Bet { amount: f64 },
    CellPicked(CellId),
    Cashout,
    ModeChange(PlayMode),
    RelayModeChange(RelayMode),
    StartAutoBet(AutoStartRequest),
    StopAutoBet,
    SelectionChanged(BTreeSet<CellId>),
    MinesChanged(u8),
    BetValueChanged(f64),
}

/// The round-lifecycle engine. Owns the controller, orchestrator, bridge,
/// timers and surfaces; nothing outside mutates round state.
pub struct Engine<R: RenderSurface, C: ControlSurface> {
    config: EngineConfig,
    round: RoundController,
    auto: AutoPlayOrchestrator,
    relay: RelayBridge,
    timers: TimerRegistry<EngineEvent>,
    render: R,
    controls: C,
    queue: VecDeque<EngineEvent>,
    outbox: VecDeque<RelayEnvelope>,
    rng: StdRng,
    bet_amount: f64,
    mines: u8,
    reveal_queue: VecDeque<(CellId, CellOutcome)>,
    auto_cycle_timer: Option<TimerToken>,
    /// Play-mode flip deferred until the finishing cycle settles.
    pending_play_mode: Option<PlayMode>,
    last_controls: Option<ControlState>,
    results: Vec<RoundResult>,
}

impl<R: RenderSurface, C: ControlSurface> Engine<R, C> {
    pub fn new(config: EngineConfig, render: R, controls: C) -> EngineResult<Self> {
        Self::with_rng(config, render, controls, StdRng::from_entropy())
    }

    /// Deterministic construction for tests and replays.
    pub fn with_seed(config: EngineConfig, render: R, controls: C, seed: u64) -> EngineResult<Self> {
        Self::with_rng(config, render, controls, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: EngineConfig, render: R, controls: C, rng: StdRng) -> EngineResult<Self> {
        config.validate()?;
        let round = RoundController::new(config.board.cell_count);
        let relay = RelayBridge::new(&config.relay, &config.timing);
        Ok(Self {
            bet_amount: 1.0,
            mines: config.board.default_mines,
            round,
            auto: AutoPlayOrchestrator::new(),
            relay,
            timers: TimerRegistry::new(),
            render,
            controls,
            queue: VecDeque::new(),
            outbox: VecDeque::new(),
            rng,
            reveal_queue: VecDeque::new(),
            auto_cycle_timer: None,
            pending_play_mode: None,
            last_controls: None,
            results: Vec::new(),
            config,
        })
    }

    pub fn round(&self) -> &RoundController {
        &self.round
    }

    pub fn auto(&self) -> &AutoPlayOrchestrator {
        &self.auto
    }

    pub fn relay(&self) -> &RelayBridge {
        &self.relay
    }

    pub fn relay_mut(&mut self) -> &mut RelayBridge {
        &mut self.relay
    }

    pub fn render(&self) -> &R {
        &self.render
    }

    pub fn controls(&self) -> &C {
        &self.controls
    }

    pub fn results(&self) -> &[RoundResult] {
        &self.results
    }

    pub fn armed_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn armed_tokens(&self) -> Vec<TimerToken> {
        self.timers.tokens()
    }

    pub fn take_outbox(&mut self) -> Vec<RelayEnvelope> {
        self.outbox.drain(..).collect()
    }

    /// Tear down: cancel every timer, drop pending selections and queued
    /// work, stop any auto-play session and return the board to idle.
    pub fn shutdown(&mut self) {
        self.queue.clear();
        self.outbox.clear();
        self.timers.cancel_all();
        self.auto_cycle_timer = None;
        self.reveal_queue.clear();
        self.relay.clear_pending();
        self.auto.force_stop(StopReason::UserRequested);
        self.round.reset();
        self.render.reset(ResetOptions {
            clear_selection: true,
        });
        self.refresh_controls();
    }

    /// Queue one event and process until the queue drains.
    pub fn dispatch(&mut self, event: EngineEvent) {
        self.queue.push_back(event);
        self.pump();
    }

    /// Fire a specific timer now. Invalidated tokens are no-ops.
    pub fn fire_timer(&mut self, token: TimerToken) {
        if let Some(event) = self.timers.fire(token) {
            self.dispatch(event);
        }
    }

    /// Repeatedly fire every armed timer until none remain. Intended for
    /// synchronous tests; a session that keeps scheduling work forever would
    /// spin, so iterations are capped.
    pub fn flush_timers(&mut self) {
        for _ in 0..10_000 {
            let tokens = self.timers.tokens();
            if tokens.is_empty() {
                return;
            }
            for token in tokens {
                self.fire_timer(token);
            }
        }
        warn!("flush_timers hit its iteration cap");
    }

    /// Process queued events one at a time, folding in render callbacks and
    /// refreshing the derived control state after each.
    fn pump(&mut self) {
        while let Some(event) = self.queue.pop_front() {
            self.handle(event);
            for callback in self.render.drain_callbacks() {
                self.queue.push_back(EngineEvent::Render(callback));
            }
            self.refresh_controls();
        }
    }

    fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Control(control) => {
                if let Err(e) = self.handle_control(control) {
                    warn!(error = %e, "control event dropped");
                }
            }
            EngineEvent::Inbound(envelope) => {
                if let Some(message) = self.relay.accept_inbound(envelope) {
                    self.handle_message(message, true);
                }
            }
            EngineEvent::Message(message) => self.handle_message(message, false),
            EngineEvent::TimerFired(token) => {
                if let Some(event) = self.timers.fire(token) {
                    self.queue.push_back(event);
                }
            }
            EngineEvent::Render(callback) => {
                if let Err(e) = self.handle_render(callback) {
                    warn!(error = %e, "render callback dropped");
                }
            }
            EngineEvent::AutoCycle => {
                self.auto_cycle_timer = None;
                if let Err(e) = self.begin_auto_cycle() {
                    warn!(error = %e, "auto cycle aborted");
                    self.auto.force_stop(StopReason::UserRequested);
                }
            }
            EngineEvent::RevealNext => self.reveal_next(),
        }
    }

    fn handle_control(&mut self, event: ControlEvent) -> EngineResult<()> {
        match event {
            ControlEvent::Bet { amount } => {
                if self.auto.is_running() {
                    return Err(EngineError::InvalidTransition {
                        action: "manual bet during auto-play",
                        state: self.round.state(),
                    });
                }
                let wager = Wager::new(amount, self.mines);
                self.round.submit_bet(wager.clone())?;
                self.bet_amount = amount;
                let decision = self
                    .relay
                    .submit_bet(&mut self.rng, &wager, &self.config.board);
                self.apply_decision(decision);
                Ok(())
            }
            ControlEvent::CellPicked(cell) => {
                let selection = self.round.pick_cell(cell)?;
                let assignment = self
                    .round
                    .assignment()
                    .cloned()
                    .ok_or(EngineError::InvalidTransition {
                        action: "pick without assignment",
                        state: self.round.state(),
                    })?;
                let decision = self.relay.resolve_selection(&selection, &assignment);
                self.round.mark_dispatched(selection.token)?;
                self.apply_decision(decision);
                Ok(())
            }
            ControlEvent::Cashout => {
                if self.auto.is_running() {
                    return Err(EngineError::InvalidTransition {
                        action: "cashout during auto-play",
                        state: self.round.state(),
                    });
                }
                let payout = self.round.request_cashout()?;
                if let Some(envelope) = self.relay.notify_cashout(payout) {
                    self.outbox.push_back(envelope);
                }
                self.render.reveal_all(RevealAllOptions::default());
                Ok(())
            }
            ControlEvent::ModeChange(mode) => {
                if mode == self.round.play_mode() {
                    return Ok(());
                }
                if self.auto.session().is_some() {
                    let mid_cycle = self.round.state() != RoundState::Idle;
                    match self.auto.request_stop(mid_cycle, StopReason::ModeSwitch)? {
                        StopAction::Finishing => {
                            // The in-flight cycle still needs its batch
                            // semantics; flip modes once it settles.
                            debug!("mode switch deferred until in-flight cycle settles");
                            self.pending_play_mode = Some(mode);
                            return Ok(());
                        }
                        StopAction::CancelScheduled => self.cancel_auto_cycle(),
                    }
                }
                self.round.set_play_mode(mode);
                Ok(())
            }
            ControlEvent::RelayModeChange(mode) => {
                self.relay.set_mode(mode);
                Ok(())
            }
            ControlEvent::StartAutoBet(request) => {
                if self.round.state() != RoundState::Idle {
                    return Err(EngineError::AutoPlay("round already in progress".into()));
                }
                let bets = {
                    let session = self.auto.start(request, &self.config.autoplay)?;
                    session.bets_remaining
                };
                self.round.set_play_mode(PlayMode::Auto);
                if let Some(envelope) = self
                    .relay
                    .notify_autobet_start(bets, self.auto.selection())
                {
                    self.outbox.push_back(envelope);
                }
                self.queue.push_back(EngineEvent::AutoCycle);
                Ok(())
            }
            ControlEvent::StopAutoBet => {
                let mid_cycle = self.round.state() != RoundState::Idle;
                match self.auto.request_stop(mid_cycle, StopReason::UserRequested)? {
                    StopAction::Finishing => {}
                    StopAction::CancelScheduled => self.cancel_auto_cycle(),
                }
                if let Some(envelope) = self.relay.notify_autobet_stop(false) {
                    self.outbox.push_back(envelope);
                }
                Ok(())
            }
            ControlEvent::SelectionChanged(cells) => {
                if self.auto.is_running() {
                    return Err(EngineError::AutoPlay(
                        "selection is fixed while a session runs".into(),
                    ));
                }
                self.auto.set_selection(cells);
                Ok(())
            }
            ControlEvent::MinesChanged(mines) => {
                self.guard_idle("mines change")?;
                self.mines = mines;
                if let Some(envelope) = self
                    .relay
                    .notify_config(OutboundMessage::MinesChanged { mines })
                {
                    self.outbox.push_back(envelope);
                }
                Ok(())
            }
            ControlEvent::BetValueChanged(amount) => {
                self.guard_idle("bet value change")?;
                self.bet_amount = amount;
                if let Some(envelope) = self
                    .relay
                    .notify_config(OutboundMessage::BetValueChanged { amount })
                {
                    self.outbox.push_back(envelope);
                }
                Ok(())
            }
        }
    }

    fn handle_message(&mut self, message: InboundMessage, from_channel: bool) {
        match message {
            InboundMessage::BetResult {
                token: None,
                layout,
                ..
            } => {
                if let Err(e) = self.apply_round_layout(layout) {
                    warn!(error = %e, "bet result dropped");
                }
            }
            InboundMessage::BetResult {
                token: Some(token),
                cells,
                ..
            } => self.apply_settlement(token, cells),
            InboundMessage::AutoBetResult { token, cells } => {
                // Live servers push batch results without our local token;
                // normalize onto the selection currently awaiting one.
                let token = token.or_else(|| self.round.selection().map(|s| s.token));
                match token {
                    Some(token) => self.apply_settlement(token, cells),
                    None => warn!("auto result with no selection awaiting it"),
                }
            }
            InboundMessage::StopAutoBet => {
                if self.auto.session().is_some() {
                    let mid_cycle = self.round.state() != RoundState::Idle;
                    match self.auto.request_stop(mid_cycle, StopReason::Server) {
                        Ok(StopAction::CancelScheduled) => self.cancel_auto_cycle(),
                        Ok(StopAction::Finishing) => {}
                        Err(e) => debug!(error = %e, "server stop with no session"),
                    }
                    // Acknowledge; reactive, so a loopback harness drops it.
                    if let Some(envelope) = self.relay.notify_autobet_stop(from_channel) {
                        self.outbox.push_back(envelope);
                    }
                }
            }
            InboundMessage::FinalizeBet => self.force_finalize(),
            InboundMessage::CashoutConfirmed { payout } => {
                if let Err(e) = self.round.confirm_cashout(payout) {
                    debug!(error = %e, "stale cashout confirmation discarded");
                }
            }
            InboundMessage::ProfitTotal(total) => self.controls.set_profit_total(total),
            InboundMessage::ProfitMultiplier(multiplier) => {
                self.controls.set_multiplier(multiplier)
            }
        }
    }

    /// Commit the round layout, falling back to a locally replicated one
    /// when the settlement service omitted it.
    fn apply_round_layout(&mut self, layout: Option<Assignment>) -> EngineResult<()> {
        let layout = match layout {
            Some(layout) => layout,
            None => {
                warn!("bet result without layout, replicating locally");
                let wager = self
                    .round
                    .wager()
                    .cloned()
                    .unwrap_or_else(|| Wager::new(self.bet_amount, self.mines));
                self.relay
                    .replicate_layout(&mut self.rng, &wager, &self.config.board)
            }
        };
        self.round.apply_assignment(layout)?;
        let assignment = self
            .round
            .assignment()
            .cloned()
            .ok_or(EngineError::InvalidTransition {
                action: "layout apply",
                state: self.round.state(),
            })?;
        self.render.set_round(&assignment);
        info!(round = ?self.round.round_id(), "round active");

        if self.auto.is_running() {
            // The pattern captured at session start, not the live selection.
            let cells = self
                .auto
                .session()
                .map(|s| s.selected_cells.clone())
                .unwrap_or_default();
            self.launch_batch(cells)?;
        } else if assignment.is_precommitted() {
            let cells: BTreeSet<CellId> = assignment.iter().map(|(cell, _)| cell).collect();
            self.launch_batch(cells)?;
        }
        Ok(())
    }

    fn launch_batch(&mut self, cells: BTreeSet<CellId>) -> EngineResult<()> {
        let selection = self.round.select_batch(cells)?;
        let assignment = self
            .round
            .assignment()
            .cloned()
            .ok_or(EngineError::InvalidTransition {
                action: "batch without assignment",
                state: self.round.state(),
            })?;
        let decision = self.relay.resolve_batch(&selection, &assignment);
        self.round.mark_dispatched(selection.token)?;
        self.apply_decision(decision);
        Ok(())
    }

    fn apply_settlement(&mut self, token: SelectionToken, cells: Vec<(CellId, CellOutcome)>) {
        match self.round.apply_selection_result(token, &cells) {
            Ok(reveals) => {
                self.relay.resolved(token);
                self.reveal_queue.extend(reveals);
                if !self.reveal_queue.is_empty() {
                    self.queue.push_back(EngineEvent::RevealNext);
                }
            }
            Err(EngineError::StaleResult { token: raw }) => {
                debug!(token = raw, "stale settlement result discarded");
                self.relay.resolved(token);
            }
            Err(e) => warn!(error = %e, "settlement result dropped"),
        }
    }

    /// Reveal the next cell of the current batch, pacing the rest.
    fn reveal_next(&mut self) {
        let Some((cell, outcome)) = self.reveal_queue.pop_front() else {
            return;
        };
        if !self.render.reveal_cell(cell) {
            // Surface refused; complete the reveal ourselves so the round
            // cannot stall on a presentation failure.
            warn!(cell, "render surface refused reveal");
            self.queue
                .push_back(EngineEvent::Render(RenderCallback::RevealComplete {
                    cell,
                    outcome,
                }));
        }
        if !self.reveal_queue.is_empty() {
            self.timers.arm(
                TimerKind::Pacing,
                self.config.timing.reveal_pacing(),
                EngineEvent::RevealNext,
            );
        }
    }

    fn handle_render(&mut self, callback: RenderCallback) -> EngineResult<()> {
        match callback {
            RenderCallback::RevealComplete { cell, outcome } => {
                match self.round.on_reveal_complete(cell, outcome)? {
                    RevealProgress::Pending => Ok(()),
                    RevealProgress::BackToActive => {
                        // An auto cycle collects its partial win as soon as
                        // the whole batch survived.
                        if self.auto.session().is_some() {
                            let payout = self.round.request_cashout()?;
                            if let Some(envelope) = self.relay.notify_cashout(payout) {
                                self.outbox.push_back(envelope);
                            }
                            self.render.reveal_all(RevealAllOptions::default());
                        }
                        Ok(())
                    }
                    RevealProgress::Ignored => {
                        debug!(cell, "untracked reveal completion ignored");
                        Ok(())
                    }
                    RevealProgress::Closed(outcome) => {
                        debug!(?outcome, "round closed, revealing remainder");
                        self.render.reveal_all(RevealAllOptions::default());
                        Ok(())
                    }
                }
            }
            RenderCallback::RoundComplete => self.finalize_round(),
        }
    }

    fn finalize_round(&mut self) -> EngineResult<()> {
        let result = self.round.begin_finalize()?;
        info!(
            round = %result.round_id,
            outcome = ?result.outcome,
            payout = result.payout,
            "round finalized"
        );
        self.results.push(result.clone());

        let auto_active = self.auto.session().is_some();
        self.reset_board();

        if auto_active {
            match self.auto.on_cycle_settled(result.wager.amount, result.payout) {
                AutoStep::ScheduleNext => {
                    let token = self.timers.arm(
                        TimerKind::Cadence,
                        self.config.timing.reset_delay(),
                        EngineEvent::AutoCycle,
                    );
                    self.auto_cycle_timer = Some(token);
                }
                AutoStep::Stop(reason) => {
                    if !matches!(reason, StopReason::UserRequested | StopReason::Server) {
                        if let Some(envelope) = self.relay.notify_autobet_stop(false) {
                            self.outbox.push_back(envelope);
                        }
                    }
                    if let Some(mode) = self.pending_play_mode.take() {
                        self.round.set_play_mode(mode);
                    }
                }
            }
        }
        Ok(())
    }

    fn begin_auto_cycle(&mut self) -> EngineResult<()> {
        if !self.auto.is_running() {
            return Ok(());
        }
        let wager = Wager::new(self.bet_amount, self.mines);
        self.round.submit_bet(wager.clone())?;
        let decision = self
            .relay
            .submit_bet(&mut self.rng, &wager, &self.config.board);
        self.apply_decision(decision);
        Ok(())
    }

    /// Abort whatever is in flight and settle into idle. Used for the
    /// server's forced finalize.
    fn force_finalize(&mut self) {
        match self.round.state() {
            RoundState::GameOver | RoundState::Cashout => {
                if let Err(e) = self.finalize_round() {
                    warn!(error = %e, "forced finalize failed, aborting round");
                    self.abort_round();
                }
            }
            RoundState::Idle => {}
            _ => self.abort_round(),
        }
    }

    fn abort_round(&mut self) {
        self.timers.cancel_all();
        self.auto_cycle_timer = None;
        self.reveal_queue.clear();
        self.relay.clear_pending();
        self.auto.force_stop(StopReason::Server);
        self.round.reset();
        self.render.reset(ResetOptions {
            clear_selection: true,
        });
        info!("round aborted to idle");
    }

    fn reset_board(&mut self) {
        self.timers.cancel_kind(TimerKind::Pacing);
        self.reveal_queue.clear();
        self.round.reset();
        self.render.reset(ResetOptions::default());
    }

    fn cancel_auto_cycle(&mut self) {
        if let Some(token) = self.auto_cycle_timer.take() {
            self.timers.cancel(token);
        }
    }

    fn apply_decision(&mut self, decision: RelayDecision) {
        match decision {
            RelayDecision::Defer { delay, message } => {
                self.timers
                    .arm(TimerKind::Cadence, delay, EngineEvent::Message(message));
            }
            RelayDecision::Forward(envelope) => self.outbox.push_back(envelope),
            RelayDecision::Await => {}
        }
    }

    fn guard_idle(&self, action: &'static str) -> EngineResult<()> {
        if self.round.state() == RoundState::Idle {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                action,
                state: self.round.state(),
            })
        }
    }

    fn refresh_controls(&mut self) {
        let state = ControlState::derive(&self.round, &self.auto);
        if self.last_controls.as_ref() != Some(&state) {
            self.controls.apply(&state);
            self.last_controls = Some(state);
        }
    }

    /// Drive the engine from async edges: embedder events, channel traffic
    /// and timer deadlines. Returns once the event source closes and no
    /// queued work or armed timer remains.
    pub async fn run(
        &mut self,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
        mut inbound: mpsc::UnboundedReceiver<RelayEnvelope>,
        channel: &mut dyn SettlementChannel,
    ) -> EngineResult<()> {
        self.relay.set_loopback(channel.is_loopback());
        let mut events_open = true;
        let mut inbound_open = true;

        loop {
            self.pump();
            while let Some(envelope) = self.outbox.pop_front() {
                channel.send(envelope).await?;
            }
            if !self.queue.is_empty() {
                continue;
            }

            self.timers.assign_deadlines(Instant::now());
            let deadline = self.timers.next_deadline();

            if !events_open && self.timers.is_empty() && self.outbox.is_empty() {
                // Drain any already-buffered channel traffic before deciding
                // the engine is quiescent.
                match inbound.try_recv() {
                    Ok(envelope) => {
                        self.queue.push_back(EngineEvent::Inbound(envelope));
                        continue;
                    }
                    Err(_) => break,
                }
            }

            tokio::select! {
                // Settlement traffic drains before new embedder input so a
                // reply is always processed ahead of the action after it.
                biased;
                maybe = inbound.recv(), if inbound_open => match maybe {
                    Some(envelope) => self.queue.push_back(EngineEvent::Inbound(envelope)),
                    None => inbound_open = false,
                },
                maybe = events.recv(), if events_open => match maybe {
                    Some(event) => self.queue.push_back(event),
                    None => events_open = false,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let now = Instant::now();
                    for token in self.timers.due(now) {
                        if let Some(event) = self.timers.fire(token) {
                            self.queue.push_back(event);
                        }
                    }
                },
            }
        }
        Ok(())
    }
}
