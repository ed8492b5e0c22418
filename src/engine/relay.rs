//! Outcome routing between the local generator and the settlement channel
//!
//! Every player action passes through the bridge, which decides whether it
//! resolves locally (demo) or over the external channel (live), and every
//! inbound settlement envelope is normalized here into the one shape the
//! round controller consumes. Pending selections remember the mode they were
//! dispatched under, so toggling demo and live mid-flight cannot corrupt a
//! round.

use crate::config::{BoardConfig, RelayConfig, TimingConfig};
use crate::engine::outcome::OutcomeGenerator;
use crate::engine::types::{
    Assignment, CellId, CellOutcome, GameVariant, RelayMode, Selection, SelectionToken, Wager,
};
use crate::errors::EngineResult;
use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

/// Direction of an envelope relative to the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

/// Wire envelope exchanged with the settlement channel.
///
/// `suppressed` marks outbound messages produced while reacting to an
/// inbound one; a loopback harness echoes them back and the bridge drops
/// them instead of re-delivering them as new events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayEnvelope {
    pub direction: Direction,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub suppressed: bool,
}

impl RelayEnvelope {
    pub fn outbound(kind: &str, payload: Value, suppressed: bool) -> Self {
        Self {
            direction: Direction::Out,
            kind: kind.to_string(),
            payload,
            suppressed,
        }
    }

    pub fn inbound(kind: &str, payload: Value) -> Self {
        Self {
            direction: Direction::In,
            kind: kind.to_string(),
            payload,
            suppressed: false,
        }
    }
}

/// Actions the engine sends toward the settlement service.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Bet { amount: f64, board_param: u8 },
    ManualSelection { token: u64, cell: CellId },
    StartAutoBet { bets: Option<u32>, cells: Vec<CellId> },
    StopAutoBet,
    Cashout { payout: f64 },
    MinesChanged { mines: u8 },
    BetValueChanged { amount: f64 },
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Bet { .. } => "action:bet",
            OutboundMessage::ManualSelection { .. } => "game:manual-selection",
            OutboundMessage::StartAutoBet { .. } => "control:start-autobet",
            OutboundMessage::StopAutoBet => "action:stop-autobet",
            OutboundMessage::Cashout { .. } => "action:cashout",
            OutboundMessage::MinesChanged { .. } => "control:mines",
            OutboundMessage::BetValueChanged { .. } => "control:bet-value",
        }
    }

    fn payload(&self) -> Value {
        match self {
            OutboundMessage::Bet { amount, board_param } => {
                json!({ "amount": amount, "board_param": board_param })
            }
            OutboundMessage::ManualSelection { token, cell } => {
                json!({ "token": token, "cell": cell })
            }
            OutboundMessage::StartAutoBet { bets, cells } => {
                json!({ "bets": bets, "cells": cells })
            }
            OutboundMessage::StopAutoBet => Value::Null,
            OutboundMessage::Cashout { payout } => json!({ "payout": payout }),
            OutboundMessage::MinesChanged { mines } => json!({ "mines": mines }),
            OutboundMessage::BetValueChanged { amount } => json!({ "amount": amount }),
        }
    }

    pub fn envelope(&self, suppressed: bool) -> RelayEnvelope {
        RelayEnvelope::outbound(self.kind(), self.payload(), suppressed)
    }
}

/// Settlement results after normalization, independent of their source.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    BetResult {
        token: Option<SelectionToken>,
        cells: Vec<(CellId, CellOutcome)>,
        layout: Option<Assignment>,
    },
    AutoBetResult {
        token: Option<SelectionToken>,
        cells: Vec<(CellId, CellOutcome)>,
    },
    StopAutoBet,
    FinalizeBet,
    CashoutConfirmed { payout: Option<f64> },
    ProfitTotal(f64),
    ProfitMultiplier(f64),
}

#[derive(Debug, Default, Deserialize)]
struct ResultPayload {
    #[serde(default)]
    token: Option<u64>,
    #[serde(default)]
    cells: Vec<RawCellReveal>,
    #[serde(default)]
    layout: Option<Assignment>,
}

#[derive(Debug, Deserialize)]
struct RawCellReveal {
    cell: CellId,
    #[serde(default)]
    outcome: Option<CellOutcome>,
}

impl RawCellReveal {
    /// Missing or unknown outcomes count as losses so the state machine
    /// never stalls on a malformed field.
    fn normalize(self) -> (CellId, CellOutcome) {
        match self.outcome {
            Some(outcome) => (self.cell, outcome),
            None => {
                warn!(cell = self.cell, "reveal outcome missing, treating as loss");
                (self.cell, CellOutcome::Mine)
            }
        }
    }
}

/// Opaque transport for live-mode envelopes.
#[async_trait]
pub trait SettlementChannel: Send {
    async fn send(&mut self, envelope: RelayEnvelope) -> EngineResult<()>;

    /// Whether this channel echoes traffic back locally.
    fn is_loopback(&self) -> bool {
        false
    }
}

/// Discards everything; the demo mode default.
pub struct NullChannel;

#[async_trait]
impl SettlementChannel for NullChannel {
    async fn send(&mut self, _envelope: RelayEnvelope) -> EngineResult<()> {
        Ok(())
    }
}

/// Test harness that echoes every outbound envelope straight back as
/// inbound traffic. Suppressed echoes are dropped by the bridge on the way
/// back in.
pub struct LoopbackChannel {
    tx: tokio::sync::mpsc::UnboundedSender<RelayEnvelope>,
}

impl LoopbackChannel {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<RelayEnvelope>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl SettlementChannel for LoopbackChannel {
    async fn send(&mut self, envelope: RelayEnvelope) -> EngineResult<()> {
        let echo = RelayEnvelope {
            direction: Direction::In,
            ..envelope
        };
        // Receiver gone means the driver already shut down.
        let _ = self.tx.send(echo);
        Ok(())
    }

    fn is_loopback(&self) -> bool {
        true
    }
}

/// What the bridge decided to do with an action.
#[derive(Debug)]
pub enum RelayDecision {
    /// Demo resolution: deliver `message` after the simulated latency.
    Defer {
        delay: Duration,
        message: InboundMessage,
    },
    /// Live resolution: push the envelope to the channel and wait.
    Forward(RelayEnvelope),
    /// Live resolution where the server pushes the result unprompted.
    Await,
}

/// Single choke point between the engine and outcome sources.
pub struct RelayBridge {
    mode: RelayMode,
    demo_win_probability: f64,
    demo_latency: Duration,
    loopback: bool,
    /// Selection token to the mode it was dispatched under.
    pending: DashMap<u64, RelayMode>,
}

impl RelayBridge {
    pub fn new(relay: &RelayConfig, timing: &TimingConfig) -> Self {
        Self {
            mode: relay.mode,
            demo_win_probability: relay.demo_win_probability,
            demo_latency: timing.demo_latency(),
            loopback: false,
            pending: DashMap::new(),
        }
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    /// Switch demo/live. In-flight selections keep their recorded mode.
    pub fn set_mode(&mut self, mode: RelayMode) {
        if self.mode != mode {
            debug!(from = %self.mode, to = %mode, pending = self.pending.len(), "relay mode switch");
            self.mode = mode;
        }
    }

    pub fn set_loopback(&mut self, loopback: bool) {
        self.loopback = loopback;
    }

    /// Mode a selection was dispatched under, while unresolved.
    pub fn originating_mode(&self, token: SelectionToken) -> Option<RelayMode> {
        self.pending.get(&token.0).map(|entry| *entry.value())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Route a wager. Demo mode commits a full layout locally; live mode
    /// forwards the action and waits for the server's layout.
    pub fn submit_bet<R: Rng>(
        &self,
        rng: &mut R,
        wager: &Wager,
        board: &BoardConfig,
    ) -> RelayDecision {
        match self.mode {
            RelayMode::Demo => {
                let layout = self.demo_layout(rng, wager, board);
                RelayDecision::Defer {
                    delay: self.demo_latency,
                    message: InboundMessage::BetResult {
                        token: None,
                        cells: Vec::new(),
                        layout: Some(layout),
                    },
                }
            }
            RelayMode::Live => RelayDecision::Forward(
                OutboundMessage::Bet {
                    amount: wager.amount,
                    board_param: wager.board_param,
                }
                .envelope(false),
            ),
        }
    }

    /// Route a single-cell selection.
    pub fn resolve_selection(
        &self,
        selection: &Selection,
        assignment: &Assignment,
    ) -> RelayDecision {
        self.pending.insert(selection.token.0, self.mode);
        match self.mode {
            RelayMode::Demo => RelayDecision::Defer {
                delay: self.demo_latency,
                message: InboundMessage::BetResult {
                    token: Some(selection.token),
                    cells: Self::committed_outcomes(selection, assignment),
                    layout: None,
                },
            },
            RelayMode::Live => {
                let cell = selection.cells.iter().next().copied().unwrap_or(0);
                RelayDecision::Forward(
                    OutboundMessage::ManualSelection {
                        token: selection.token.0,
                        cell,
                    }
                    .envelope(false),
                )
            }
        }
    }

    /// Route an auto-play batch. The live server already knows the pattern
    /// from the session start and pushes its result unprompted.
    pub fn resolve_batch(&self, selection: &Selection, assignment: &Assignment) -> RelayDecision {
        self.pending.insert(selection.token.0, self.mode);
        match self.mode {
            RelayMode::Demo => RelayDecision::Defer {
                delay: self.demo_latency,
                message: InboundMessage::AutoBetResult {
                    token: Some(selection.token),
                    cells: Self::committed_outcomes(selection, assignment),
                },
            },
            RelayMode::Live => RelayDecision::Await,
        }
    }

    /// A selection resolved or was discarded; forget its origin.
    pub fn resolved(&self, token: SelectionToken) {
        self.pending.remove(&token.0);
    }

    /// Drop every pending record, e.g. on reset.
    pub fn clear_pending(&self) {
        self.pending.clear();
    }

    /// Outbound notification for a cashout request. Demo rounds settle
    /// locally without one.
    pub fn notify_cashout(&self, payout: f64) -> Option<RelayEnvelope> {
        match self.mode {
            RelayMode::Demo => None,
            RelayMode::Live => Some(OutboundMessage::Cashout { payout }.envelope(false)),
        }
    }

    pub fn notify_autobet_start(
        &self,
        bets: Option<u32>,
        cells: &BTreeSet<CellId>,
    ) -> Option<RelayEnvelope> {
        match self.mode {
            RelayMode::Demo => None,
            RelayMode::Live => Some(
                OutboundMessage::StartAutoBet {
                    bets,
                    cells: cells.iter().copied().collect(),
                }
                .envelope(false),
            ),
        }
    }

    /// Outbound stop notice. `reactive` marks it as triggered by an inbound
    /// message so a loopback harness will not re-deliver it.
    pub fn notify_autobet_stop(&self, reactive: bool) -> Option<RelayEnvelope> {
        match self.mode {
            RelayMode::Demo => None,
            RelayMode::Live => {
                Some(OutboundMessage::StopAutoBet.envelope(reactive && self.loopback))
            }
        }
    }

    pub fn notify_config(&self, message: OutboundMessage) -> Option<RelayEnvelope> {
        match self.mode {
            RelayMode::Demo => None,
            RelayMode::Live => Some(message.envelope(false)),
        }
    }

    /// Normalize an inbound envelope, substituting defaults for malformed
    /// payloads. Suppressed echoes and unknown kinds yield `None`.
    pub fn accept_inbound(&self, envelope: RelayEnvelope) -> Option<InboundMessage> {
        if envelope.suppressed {
            debug!(kind = %envelope.kind, "suppressed echo dropped");
            return None;
        }
        match envelope.kind.as_str() {
            "bet-result" => {
                let payload = Self::result_payload(&envelope);
                Some(InboundMessage::BetResult {
                    token: payload.token.map(SelectionToken),
                    cells: payload
                        .cells
                        .into_iter()
                        .map(RawCellReveal::normalize)
                        .collect(),
                    layout: payload.layout,
                })
            }
            "auto-bet-result" => {
                let payload = Self::result_payload(&envelope);
                Some(InboundMessage::AutoBetResult {
                    token: payload.token.map(SelectionToken),
                    cells: payload
                        .cells
                        .into_iter()
                        .map(RawCellReveal::normalize)
                        .collect(),
                })
            }
            "stop-autobet" => Some(InboundMessage::StopAutoBet),
            "finalize-bet" => Some(InboundMessage::FinalizeBet),
            "cashout" => {
                let payout = envelope
                    .payload
                    .get("payout")
                    .and_then(Value::as_f64);
                Some(InboundMessage::CashoutConfirmed { payout })
            }
            "profit:update-total" => {
                Some(InboundMessage::ProfitTotal(Self::f64_field(&envelope, "total")))
            }
            "profit:update-multiplier" => Some(InboundMessage::ProfitMultiplier(
                Self::f64_field(&envelope, "multiplier"),
            )),
            other => {
                warn!(kind = other, "unknown settlement envelope dropped");
                None
            }
        }
    }

    fn result_payload(envelope: &RelayEnvelope) -> ResultPayload {
        match serde_json::from_value(envelope.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "malformed payload, using defaults");
                ResultPayload::default()
            }
        }
    }

    fn f64_field(envelope: &RelayEnvelope, field: &str) -> f64 {
        match envelope.payload.get(field).and_then(Value::as_f64) {
            Some(value) => value,
            None => {
                warn!(kind = %envelope.kind, field, "missing numeric field, using 0");
                0.0
            }
        }
    }

    fn committed_outcomes(
        selection: &Selection,
        assignment: &Assignment,
    ) -> Vec<(CellId, CellOutcome)> {
        selection
            .cells
            .iter()
            .map(|&cell| {
                let outcome = assignment.outcome(cell).unwrap_or_else(|| {
                    warn!(cell, "selection outside committed layout, treating as loss");
                    CellOutcome::Mine
                });
                (cell, outcome)
            })
            .collect()
    }

    /// Replicate a plausible committed layout for rendering when the
    /// settlement service omitted one from its reply.
    pub fn replicate_layout<R: Rng>(
        &self,
        rng: &mut R,
        wager: &Wager,
        board: &BoardConfig,
    ) -> Assignment {
        self.demo_layout(rng, wager, board)
    }

    fn demo_layout<R: Rng>(&self, rng: &mut R, wager: &Wager, board: &BoardConfig) -> Assignment {
        match board.variant {
            GameVariant::Mines => OutcomeGenerator::mine_layout(
                rng,
                board.cell_count,
                wager.board_param,
                &BTreeSet::new(),
            ),
            GameVariant::MatchTypes => {
                if rng.gen_bool(self.demo_win_probability) {
                    OutcomeGenerator::winning_layout(rng, board.cell_count, board.type_count, None)
                        .assignment
                } else {
                    OutcomeGenerator::losing_layout(rng, board.cell_count, board.type_count)
                }
            }
        }
    }
}
