//! End-to-end round lifecycle scenarios driven through the engine event
//! queue: manual rounds, auto-play sessions, mode switches, and live-mode
//! settlement over a scripted channel.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use tilebet::engine::autoplay::AutoStartRequest;
use tilebet::engine::relay::{
    Direction, LoopbackChannel, RelayEnvelope, SettlementChannel,
};
use tilebet::surfaces::{
    AutoButtonMode, HeadlessRender, RecordingControls, RenderCallback, RenderSurface,
    ResetOptions, RevealAllOptions,
};
use tilebet::{
    Assignment, CellId, CellOutcome, ControlEvent, Engine, EngineConfig, EngineEvent, PlayMode,
    RelayMode, RoundOutcome, RoundState,
};
use tokio::sync::mpsc;

type DemoEngine = Engine<HeadlessRender, RecordingControls>;

fn demo_engine(seed: u64) -> DemoEngine {
    Engine::with_seed(
        EngineConfig::default(),
        HeadlessRender::new(),
        RecordingControls::default(),
        seed,
    )
    .unwrap()
}

fn control(event: ControlEvent) -> EngineEvent {
    EngineEvent::Control(event)
}

/// Place a bet and let the demo latency timer deliver the layout.
fn activate_round(engine: &mut DemoEngine, amount: f64) {
    engine.dispatch(control(ControlEvent::Bet { amount }));
    engine.flush_timers();
    assert_eq!(engine.round().state(), RoundState::RoundActive);
}

fn find_cell(engine: &DemoEngine, want_mine: bool) -> CellId {
    engine
        .round()
        .assignment()
        .unwrap()
        .iter()
        .find(|(_, outcome)| outcome.is_unsafe() == want_mine)
        .map(|(cell, _)| cell)
        .unwrap()
}

#[test]
fn test_scenario_bet_activates_round_with_committed_mines() {
    let mut engine = demo_engine(1);
    engine.dispatch(control(ControlEvent::MinesChanged(5)));
    engine.dispatch(control(ControlEvent::Bet { amount: 1.0 }));
    assert_eq!(engine.round().state(), RoundState::AwaitingBet);
    assert_eq!(engine.armed_timers(), 1);

    engine.flush_timers();
    assert_eq!(engine.round().state(), RoundState::RoundActive);
    let assignment = engine.round().assignment().unwrap();
    assert_eq!(assignment.len(), 25);
    assert_eq!(assignment.mine_count(), 5);
}

#[test]
fn test_scenario_safe_pick_enables_cashout() {
    let mut engine = demo_engine(2);
    activate_round(&mut engine, 1.0);

    let safe = find_cell(&engine, false);
    engine.dispatch(control(ControlEvent::CellPicked(safe)));
    assert_eq!(engine.round().state(), RoundState::AwaitingSettlement);

    engine.flush_timers();
    assert_eq!(engine.round().state(), RoundState::RoundActive);
    assert_eq!(engine.round().revealed_safe(), 1);
    assert!(engine.round().cashout_eligible());
    let controls = engine.controls().last.clone().unwrap();
    assert!(controls.cashout_available);
    assert!(controls.multiplier > 1.0);
}

#[test]
fn test_scenario_mine_pick_ends_round() {
    let mut engine = Engine::with_seed(
        EngineConfig::default(),
        StagedRender::default(),
        RecordingControls::default(),
        3,
    )
    .unwrap();
    engine.dispatch(control(ControlEvent::Bet { amount: 1.0 }));
    engine.flush_timers();

    let mine = engine
        .round()
        .assignment()
        .unwrap()
        .iter()
        .find(|(_, o)| o.is_unsafe())
        .map(|(c, _)| c)
        .unwrap();
    engine.dispatch(control(ControlEvent::CellPicked(mine)));
    engine.flush_timers();
    assert_eq!(engine.render().revealed, vec![mine]);

    // The animated surface reports the completion itself.
    engine.dispatch(EngineEvent::Render(RenderCallback::RevealComplete {
        cell: mine,
        outcome: CellOutcome::Mine,
    }));
    assert_eq!(engine.round().state(), RoundState::GameOver);
    assert!(!engine.round().cashout_eligible());
    assert_eq!(engine.render().reveal_all_calls, 1);

    engine.dispatch(EngineEvent::Render(RenderCallback::RoundComplete));
    assert_eq!(engine.round().state(), RoundState::Idle);
    assert_eq!(engine.results().len(), 1);
    assert_eq!(engine.results()[0].outcome, RoundOutcome::Loss);
    assert_eq!(engine.results()[0].payout, 0.0);
}

#[test]
fn test_scenario_cashout_round_trip() {
    let mut engine = demo_engine(4);
    activate_round(&mut engine, 2.0);

    let safe = find_cell(&engine, false);
    engine.dispatch(control(ControlEvent::CellPicked(safe)));
    engine.flush_timers();

    engine.dispatch(control(ControlEvent::Cashout));
    assert_eq!(engine.round().state(), RoundState::Idle);
    let result = &engine.results()[0];
    assert_eq!(result.outcome, RoundOutcome::CashedOut);
    // One safe reveal on a 25-cell board with 5 mines pays 25/20.
    assert!((result.payout - 2.0 * 25.0 / 20.0).abs() < 1e-9);
}

#[test]
fn test_scenario_auto_play_runs_exactly_three_cycles() {
    let mut engine = demo_engine(5);
    engine.dispatch(control(ControlEvent::SelectionChanged(
        [0u8, 1].into_iter().collect(),
    )));
    engine.dispatch(control(ControlEvent::StartAutoBet(AutoStartRequest {
        bets: Some(3),
        ..Default::default()
    })));
    engine.flush_timers();

    assert_eq!(engine.results().len(), 3);
    assert!(!engine.auto().is_running());
    assert!(engine.auto().session().is_none());
    assert_eq!(engine.round().state(), RoundState::Idle);
    assert_eq!(engine.armed_timers(), 0);
    // The pattern survives for re-entry.
    assert_eq!(engine.auto().selection().len(), 2);
}

#[test]
fn test_scenario_mode_switch_mid_cycle_finishes_then_stops() {
    let mut engine = demo_engine(6);
    engine.dispatch(control(ControlEvent::SelectionChanged(
        [0u8, 1].into_iter().collect(),
    )));
    engine.dispatch(control(ControlEvent::StartAutoBet(AutoStartRequest {
        bets: None,
        ..Default::default()
    })));
    // First cycle is in flight awaiting its layout.
    assert_eq!(engine.round().state(), RoundState::AwaitingBet);

    engine.dispatch(control(ControlEvent::ModeChange(PlayMode::Manual)));
    assert!(engine.auto().is_finishing());

    engine.flush_timers();
    assert_eq!(engine.results().len(), 1);
    assert!(engine.auto().session().is_none());
    assert_eq!(engine.armed_timers(), 0);
    assert_eq!(engine.round().state(), RoundState::Idle);
    assert_eq!(engine.round().play_mode(), PlayMode::Manual);
    assert_eq!(engine.auto().selection().len(), 2);
}

#[test]
fn test_stop_between_cycles_cancels_schedule() {
    let mut engine = demo_engine(7);
    engine.dispatch(control(ControlEvent::SelectionChanged(
        [0u8].into_iter().collect(),
    )));
    engine.dispatch(control(ControlEvent::StartAutoBet(AutoStartRequest {
        bets: Some(10),
        ..Default::default()
    })));

    // Drive timers one at a time until the first cycle has settled and the
    // next one is merely scheduled.
    while engine.results().is_empty() {
        let tokens = engine.armed_tokens();
        assert!(!tokens.is_empty(), "cycle stalled");
        engine.fire_timer(tokens[0]);
    }
    assert_eq!(engine.round().state(), RoundState::Idle);
    assert_eq!(engine.armed_timers(), 1);

    engine.dispatch(control(ControlEvent::StopAutoBet));
    assert_eq!(engine.armed_timers(), 0);
    assert!(engine.auto().session().is_none());
    assert_eq!(engine.results().len(), 1);
}

#[test]
fn test_shutdown_cancels_everything() {
    let mut engine = demo_engine(12);
    engine.dispatch(control(ControlEvent::SelectionChanged(
        [0u8, 1].into_iter().collect(),
    )));
    engine.dispatch(control(ControlEvent::StartAutoBet(AutoStartRequest {
        bets: Some(5),
        ..Default::default()
    })));
    assert!(engine.armed_timers() > 0);

    engine.shutdown();
    assert_eq!(engine.round().state(), RoundState::Idle);
    assert_eq!(engine.armed_timers(), 0);
    assert!(engine.auto().session().is_none());
    assert_eq!(engine.relay().pending_count(), 0);
    assert!(engine.results().is_empty());
}

#[test]
fn test_second_bet_while_round_active_is_ignored() {
    let mut engine = demo_engine(8);
    activate_round(&mut engine, 1.0);
    let before = engine.round().round_id();

    engine.dispatch(control(ControlEvent::Bet { amount: 5.0 }));
    assert_eq!(engine.round().state(), RoundState::RoundActive);
    assert_eq!(engine.round().round_id(), before);
    assert_eq!(engine.armed_timers(), 0);
}

#[test]
fn test_auto_button_reflects_session_state() {
    let mut engine = demo_engine(9);
    assert_eq!(
        engine.controls().last.as_ref().map(|c| c.auto_button),
        None
    );
    engine.dispatch(control(ControlEvent::SelectionChanged(
        [0u8].into_iter().collect(),
    )));
    engine.dispatch(control(ControlEvent::StartAutoBet(AutoStartRequest {
        bets: Some(2),
        ..Default::default()
    })));
    assert_eq!(
        engine.controls().last.as_ref().unwrap().auto_button,
        AutoButtonMode::Stop
    );
    engine.dispatch(control(ControlEvent::StopAutoBet));
    assert_eq!(
        engine.controls().last.as_ref().unwrap().auto_button,
        AutoButtonMode::Finishing
    );
    engine.flush_timers();
    assert_eq!(
        engine.controls().last.as_ref().unwrap().auto_button,
        AutoButtonMode::Start
    );
}

/// Render surface that records commands and never completes on its own,
/// standing in for a fully animated external board.
#[derive(Default)]
struct StagedRender {
    revealed: Vec<CellId>,
    reveal_all_calls: usize,
    resets: usize,
}

impl RenderSurface for StagedRender {
    fn set_round(&mut self, _assignment: &Assignment) {
        self.revealed.clear();
    }

    fn reveal_cell(&mut self, cell: CellId) -> bool {
        self.revealed.push(cell);
        true
    }

    fn reveal_all(&mut self, _options: RevealAllOptions) {
        self.reveal_all_calls += 1;
    }

    fn reset(&mut self, _options: ResetOptions) {
        self.resets += 1;
    }
}

/// Settlement service scripted over a fixed committed layout.
struct ScriptedServer {
    tx: mpsc::UnboundedSender<RelayEnvelope>,
    layout: Assignment,
}

#[async_trait]
impl SettlementChannel for ScriptedServer {
    async fn send(&mut self, envelope: RelayEnvelope) -> tilebet::EngineResult<()> {
        match envelope.kind.as_str() {
            "action:bet" => {
                let reply = RelayEnvelope {
                    direction: Direction::In,
                    kind: "bet-result".into(),
                    payload: json!({ "layout": self.layout }),
                    suppressed: false,
                };
                let _ = self.tx.send(reply);
            }
            "game:manual-selection" => {
                let token = envelope.payload["token"].as_u64();
                let cell = envelope.payload["cell"].as_u64().unwrap_or(0) as CellId;
                let outcome = self.layout.outcome(cell).unwrap_or(CellOutcome::Mine);
                let reply = RelayEnvelope {
                    direction: Direction::In,
                    kind: "bet-result".into(),
                    payload: json!({
                        "token": token,
                        "cells": [{ "cell": cell, "outcome": outcome }],
                    }),
                    suppressed: false,
                };
                let _ = self.tx.send(reply);
            }
            _ => {}
        }
        Ok(())
    }
}

fn live_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.relay.mode = RelayMode::Live;
    config
}

fn corner_mine_layout() -> Assignment {
    let cells: HashMap<CellId, CellOutcome> = (0..25)
        .map(|c| {
            let outcome = if c >= 20 {
                CellOutcome::Mine
            } else {
                CellOutcome::Safe
            };
            (c, outcome)
        })
        .collect();
    Assignment::mine_grid(cells)
}

#[tokio::test]
async fn test_live_round_settles_over_scripted_channel() {
    let mut engine = Engine::with_seed(
        live_config(),
        HeadlessRender::new(),
        RecordingControls::default(),
        10,
    )
    .unwrap();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let mut server = ScriptedServer {
        tx: inbound_tx,
        layout: corner_mine_layout(),
    };

    events_tx.send(control(ControlEvent::Bet { amount: 1.0 })).unwrap();
    events_tx.send(control(ControlEvent::CellPicked(0))).unwrap();
    events_tx.send(control(ControlEvent::Cashout)).unwrap();
    drop(events_tx);

    engine.run(events_rx, inbound_rx, &mut server).await.unwrap();

    assert_eq!(engine.round().state(), RoundState::Idle);
    assert_eq!(engine.results().len(), 1);
    let result = &engine.results()[0];
    assert_eq!(result.outcome, RoundOutcome::CashedOut);
    assert_eq!(result.revealed_safe, 1);
    assert!((result.payout - 25.0 / 20.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_loopback_echo_cannot_loop_the_engine() {
    let mut engine = Engine::with_seed(
        live_config(),
        HeadlessRender::new(),
        RecordingControls::default(),
        11,
    )
    .unwrap();

    // Start the session before entering the loop so the server stop below
    // finds a running cycle.
    engine.dispatch(control(ControlEvent::SelectionChanged(
        [0u8].into_iter().collect(),
    )));
    engine.dispatch(control(ControlEvent::StartAutoBet(
        AutoStartRequest::default(),
    )));
    assert_eq!(engine.round().state(), RoundState::AwaitingBet);

    let (events_tx, events_rx) = mpsc::unbounded_channel::<EngineEvent>();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let mut channel = LoopbackChannel::new(inbound_tx.clone());

    // Server-initiated stop arrives while the first cycle awaits its layout;
    // the engine acknowledges with a suppressed outbound stop, and the echo
    // of that acknowledgement must die at the bridge.
    inbound_tx
        .send(RelayEnvelope::inbound("stop-autobet", json!({})))
        .unwrap();
    drop(events_tx);
    drop(inbound_tx);

    engine.run(events_rx, inbound_rx, &mut channel).await.unwrap();

    assert!(engine.auto().is_finishing());
    assert_eq!(engine.results().len(), 0);
}
