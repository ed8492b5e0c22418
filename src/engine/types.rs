//! Core domain types shared across the engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use uuid::Uuid;

/// Board cells are indexed `0..cell_count`.
pub type CellId = u8;

/// Per-board lifecycle state. Exactly one state is active at any time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RoundState {
    Idle,
    AwaitingBet,
    SelectionPending,
    RoundActive,
    AwaitingSettlement,
    Cashout,
    GameOver,
    Finalizing,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RoundState::Idle => "idle",
            RoundState::AwaitingBet => "awaiting-bet",
            RoundState::SelectionPending => "selection-pending",
            RoundState::RoundActive => "round-active",
            RoundState::AwaitingSettlement => "awaiting-settlement",
            RoundState::Cashout => "cashout",
            RoundState::GameOver => "game-over",
            RoundState::Finalizing => "finalizing",
        };
        write!(f, "{}", s)
    }
}

/// Whether rounds are driven one pick at a time or as a stored batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlayMode {
    Manual,
    Auto,
}

/// Which layout family a board plays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GameVariant {
    /// Progressive grid reveal against hidden mines.
    Mines,
    /// Pre-committed match-type layout revealed in one pass.
    MatchTypes,
}

/// Where outcomes are resolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Outcomes produced by the local generator.
    Demo,
    /// Outcomes supplied by the external settlement channel.
    Live,
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayMode::Demo => write!(f, "demo"),
            RelayMode::Live => write!(f, "live"),
        }
    }
}

/// A staked wager. Immutable once the round is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wager {
    pub amount: f64,
    /// Board parameter: mine count for grid rounds, type count for match rounds.
    pub board_param: u8,
    pub placed_at: DateTime<Utc>,
}

impl Wager {
    pub fn new(amount: f64, board_param: u8) -> Self {
        Self {
            amount,
            board_param,
            placed_at: Utc::now(),
        }
    }
}

/// Content committed to a single cell for the lifetime of a round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CellOutcome {
    Safe,
    Mine,
    /// Match-type content key.
    Symbol(u8),
}

impl CellOutcome {
    /// An unsafe reveal ends the round as a loss.
    pub fn is_unsafe(&self) -> bool {
        matches!(self, CellOutcome::Mine)
    }
}

/// The committed cell-to-outcome mapping for one round.
///
/// Generated once when the round starts and never mutated afterwards;
/// revealed cells are always a subset of its key set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    cells: HashMap<CellId, CellOutcome>,
    /// Set for match-type layouts that pay out.
    winning_symbol: Option<u8>,
}

impl Assignment {
    /// Build a grid layout of safe and mine cells.
    pub fn mine_grid(cells: HashMap<CellId, CellOutcome>) -> Self {
        Self {
            cells,
            winning_symbol: None,
        }
    }

    /// Build a match-type layout. `winning_symbol` is `Some` for winning
    /// layouts and `None` for losing ones.
    pub fn match_types(symbols: HashMap<CellId, u8>, winning_symbol: Option<u8>) -> Self {
        let cells = symbols
            .into_iter()
            .map(|(cell, sym)| (cell, CellOutcome::Symbol(sym)))
            .collect();
        Self {
            cells,
            winning_symbol,
        }
    }

    pub fn outcome(&self, cell: CellId) -> Option<CellOutcome> {
        self.cells.get(&cell).copied()
    }

    pub fn contains(&self, cell: CellId) -> bool {
        self.cells.contains_key(&cell)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CellId, CellOutcome)> + '_ {
        self.cells.iter().map(|(c, o)| (*c, *o))
    }

    pub fn mine_count(&self) -> usize {
        self.cells
            .values()
            .filter(|o| matches!(o, CellOutcome::Mine))
            .count()
    }

    pub fn safe_count(&self) -> usize {
        self.cells
            .values()
            .filter(|o| matches!(o, CellOutcome::Safe))
            .count()
    }

    pub fn winning_symbol(&self) -> Option<u8> {
        self.winning_symbol
    }

    /// Match-type layouts resolve in a single batch reveal; the win or loss
    /// was committed when the layout was generated.
    pub fn is_precommitted(&self) -> bool {
        self.cells
            .values()
            .any(|o| matches!(o, CellOutcome::Symbol(_)))
    }

    /// Count how often a symbol appears in a match-type layout.
    pub fn symbol_count(&self, symbol: u8) -> usize {
        self.cells
            .values()
            .filter(|o| matches!(o, CellOutcome::Symbol(s) if *s == symbol))
            .count()
    }
}

/// Identity token minted per selection. Stale settlement results are
/// detected by comparing against the live selection's token, which survives
/// rapid re-arm where a boolean flag would not.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SelectionToken(pub u64);

impl fmt::Display for SelectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sel-{}", self.0)
    }
}

/// The cell or cells currently awaiting resolution.
///
/// Exists only while a round has a pick in flight; destroyed on resolution
/// or cancellation.
#[derive(Debug, Clone)]
pub struct Selection {
    pub cells: BTreeSet<CellId>,
    pub token: SelectionToken,
}

impl Selection {
    pub fn single(cell: CellId, token: SelectionToken) -> Self {
        let mut cells = BTreeSet::new();
        cells.insert(cell);
        Self { cells, token }
    }

    pub fn batch(cells: BTreeSet<CellId>, token: SelectionToken) -> Self {
        Self { cells, token }
    }
}

/// Terminal disposition of a settled round.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoundOutcome {
    Win,
    Loss,
    /// Early settlement at the current partial-win state.
    CashedOut,
}

/// Summary produced when a round finalizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundResult {
    pub round_id: Uuid,
    pub wager: Wager,
    pub outcome: RoundOutcome,
    pub payout: f64,
    pub revealed_safe: u32,
    pub settled_at: DateTime<Utc>,
}

impl RoundResult {
    /// Net effect of the round on the player balance.
    pub fn net(&self) -> f64 {
        self.payout - self.wager.amount
    }
}
