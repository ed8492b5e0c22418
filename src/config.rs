//! Configuration management with validation and defaults

use crate::engine::types::{GameVariant, RelayMode};
use crate::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub board: BoardConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub autoplay: AutoPlayDefaults,
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Board geometry and default wager parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub variant: GameVariant,
    pub cell_count: u8,
    pub default_mines: u8,
    /// Distinct symbols available to match-type layouts.
    pub type_count: u8,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            variant: GameVariant::Mines,
            cell_count: 25,
            default_mines: 5,
            type_count: 8,
        }
    }
}

/// Delays for the cooperative timers, in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Simulated settlement latency for demo-mode resolutions.
    pub demo_latency_ms: u64,
    /// Pause between auto-play cycles.
    pub autoplay_reset_delay_ms: u64,
    /// Stagger between reveals of a batch.
    pub reveal_pacing_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            demo_latency_ms: 350,
            autoplay_reset_delay_ms: 600,
            reveal_pacing_ms: 120,
        }
    }
}

impl TimingConfig {
    pub fn demo_latency(&self) -> Duration {
        Duration::from_millis(self.demo_latency_ms)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.autoplay_reset_delay_ms)
    }

    pub fn reveal_pacing(&self) -> Duration {
        Duration::from_millis(self.reveal_pacing_ms)
    }
}

/// Defaults applied to auto-play sessions when the start request leaves a
/// field unset.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoPlayDefaults {
    /// `None` means unbounded.
    pub default_bets: Option<u32>,
    pub stop_on_profit: Option<f64>,
    pub stop_on_loss: Option<f64>,
}

impl Default for AutoPlayDefaults {
    fn default() -> Self {
        Self {
            default_bets: Some(10),
            stop_on_profit: None,
            stop_on_loss: None,
        }
    }
}

/// Outcome routing configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub mode: RelayMode,
    /// Probability that a demo match-type round is generated as a win.
    pub demo_win_probability: f64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: RelayMode::Demo,
            demo_win_probability: 0.4,
        }
    }
}

impl EngineConfig {
    /// Validate cross-field constraints.
    pub fn validate(&self) -> EngineResult<()> {
        if self.board.cell_count == 0 {
            return Err(EngineError::Config("cell_count must be positive".into()));
        }
        if self.board.default_mines == 0 || self.board.default_mines >= self.board.cell_count {
            return Err(EngineError::Config(format!(
                "default_mines must be in 1..{}",
                self.board.cell_count
            )));
        }
        if self.board.type_count < 2 {
            return Err(EngineError::Config("type_count must be at least 2".into()));
        }
        if !(0.0..=1.0).contains(&self.relay.demo_win_probability) {
            return Err(EngineError::Config(format!(
                "demo_win_probability {} outside [0, 1]",
                self.relay.demo_win_probability
            )));
        }
        if let Some(0) = self.autoplay.default_bets {
            return Err(EngineError::Config("default_bets must be positive".into()));
        }
        Ok(())
    }

    /// Parse a TOML document.
    pub fn from_toml(source: &str) -> EngineResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let source = std::fs::read_to_string(path.as_ref())
            .map_err(|e| EngineError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_toml(&source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_degenerate_board() {
        let mut config = EngineConfig::default();
        config.board.default_mines = config.board.cell_count;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_probability() {
        let mut config = EngineConfig::default();
        config.relay.demo_win_probability = 1.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_section_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [board]
            cell_count = 16
            default_mines = 3
            type_count = 6
            "#,
        )
        .unwrap();
        assert_eq!(config.board.cell_count, 16);
        assert_eq!(config.timing.demo_latency_ms, 350);
        assert_eq!(config.relay.mode, RelayMode::Demo);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "[relay]\nmode = \"live\"\ndemo_win_probability = 0.5\n"
        )
        .unwrap();
        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.relay.mode, RelayMode::Live);
    }
}
