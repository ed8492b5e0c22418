//! tilebet demo binary
//!
//! Runs a scripted auto-play session against the local outcome generator
//! and prints the per-round results.

use clap::Parser;
use std::collections::BTreeSet;
use tilebet::engine::autoplay::AutoStartRequest;
use tilebet::engine::relay::NullChannel;
use tilebet::surfaces::{HeadlessRender, RecordingControls};
use tilebet::{ControlEvent, Engine, EngineConfig, EngineEvent};
use tokio::sync::mpsc;

#[derive(Parser, Debug)]
#[command(name = "tilebet")]
#[command(about = "Tile-reveal wagering engine demo", long_about = None)]
struct Args {
    /// Number of auto-play rounds
    #[arg(long, default_value = "5")]
    rounds: u32,

    /// Wager per round
    #[arg(long, default_value = "1.0")]
    bet: f64,

    /// Mines on the board
    #[arg(long, default_value = "5")]
    mines: u8,

    /// Cells picked each round (taken from the top-left corner)
    #[arg(long, default_value = "3")]
    cells: u8,

    /// RNG seed for reproducible sessions
    #[arg(long)]
    seed: Option<u64>,

    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    let mut engine = match args.seed {
        Some(seed) => Engine::with_seed(config, HeadlessRender::new(), RecordingControls::default(), seed)?,
        None => Engine::new(config, HeadlessRender::new(), RecordingControls::default())?,
    };

    let selection: BTreeSet<u8> = (0..args.cells).collect();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (_inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    events_tx.send(EngineEvent::Control(ControlEvent::MinesChanged(args.mines)))?;
    events_tx.send(EngineEvent::Control(ControlEvent::BetValueChanged(args.bet)))?;
    events_tx.send(EngineEvent::Control(ControlEvent::SelectionChanged(selection)))?;
    events_tx.send(EngineEvent::Control(ControlEvent::StartAutoBet(
        AutoStartRequest {
            bets: Some(args.rounds),
            ..Default::default()
        },
    )))?;
    drop(events_tx);

    let mut channel = NullChannel;
    engine.run(events_rx, inbound_rx, &mut channel).await?;

    let mut staked = 0.0;
    let mut returned = 0.0;
    for result in engine.results() {
        staked += result.wager.amount;
        returned += result.payout;
        println!(
            "round {} {:?} stake {:.2} payout {:.2} safe reveals {}",
            result.round_id, result.outcome, result.wager.amount, result.payout, result.revealed_safe
        );
    }
    println!(
        "{} rounds, staked {:.2}, returned {:.2}, net {:+.2}",
        engine.results().len(),
        staked,
        returned,
        returned - staked
    );
    Ok(())
}
