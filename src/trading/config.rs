//! Trading configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::error::{TradingError, TradingResult};

/// One year.
const MAX_POSITION_HOURS: i64 = 24 * 365;

/// One day.
const MAX_CYCLE_MINUTES: u64 = 24 * 60;

/// Which trailing-stop variant is active for this deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingStrategyKind {
    /// Close when P&L falls below a fraction of the peak
    Percentage,
    /// Close when P&L falls a fixed amount below the peak
    FixedDistance,
}

impl std::fmt::Display for TrailingStrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrailingStrategyKind::Percentage => f.write_str("percentage"),
            TrailingStrategyKind::FixedDistance => f.write_str("fixed_distance"),
        }
    }
}

/// Configuration for risk, position lifecycle and scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    // === Portfolio ===
    /// Starting account balance the equity stop is measured against
    pub initial_balance: Decimal,

    /// Drawdown percentage that trips the equity stop (negative, e.g. -5.0)
    pub equity_stop_pct: Decimal,

    /// Maximum number of open positions including reinforcements
    pub max_concurrent_positions: usize,

    /// Pairs fed to the strength calculator each main cycle
    pub symbols: Vec<String>,

    /// Broker symbol suffix (e.g. ".m"), stripped before normalization
    pub symbol_suffix: String,

    // === Position lifecycle ===
    /// Close a position once its P&L reaches this amount
    pub profit_target_abs: Decimal,

    /// Close a position once its loss reaches this amount (positive number)
    pub stop_loss_abs: Decimal,

    /// Close a position after it has been open this many hours
    pub max_position_duration_hours: i64,

    /// Peak P&L at which the trailing stop arms
    pub trailing_trigger_abs: Decimal,

    pub trailing_strategy: TrailingStrategyKind,

    /// Share of peak P&L kept by the percentage trailing stop (0-1)
    pub trailing_retention_fraction: Decimal,

    /// Distance below peak P&L for the fixed-distance trailing stop
    pub trailing_distance_abs: Decimal,

    // === Exit signals ===
    /// Distinct currency reversals in one tick needed before acting
    pub exit_signal_threshold_count: usize,

    /// Trend slopes within this band count as flat
    pub exit_signal_noise_threshold: f64,

    // === Reinforcement ===
    pub reinforcement_enabled: bool,

    /// P&L drop per minute that counts as a rapid adverse move
    pub rapid_move_threshold_per_minute: Decimal,

    /// Minimum loss before a structural reinforcement is considered
    pub reinforcement_min_drawdown_abs: Decimal,

    /// Minimum base/quote strength gap that still favours the position
    pub min_strength_differential: f64,

    /// Compensation fraction gained per unit of strength differential
    pub compensation_per_strength: f64,

    /// Bounds on how far the blended entry moves toward the current price
    pub min_compensation_fraction: f64,
    pub max_compensation_fraction: f64,

    /// Reinforcement volume cap as a multiple of the original volume
    pub max_reinforcement_volume_ratio: Decimal,

    /// Lot granularity
    pub volume_step: Decimal,

    // === Entry pricing ===
    /// Strength differential above which entry price is adjusted
    pub entry_strength_threshold: f64,

    /// Pips of adjustment per unit of strength differential
    pub entry_pips_per_strength: Decimal,

    /// Hard cap on entry adjustment
    pub max_entry_adjust_pips: Decimal,

    // === Scheduling ===
    pub main_cycle_period_minutes: u64,
    pub monitoring_period_minutes: u64,

    /// Trading session in UTC hours, [start, end)
    pub session_start_hour: u32,
    pub session_end_hour: u32,

    /// Close everything when the main cycle finds the session over
    pub close_at_session_end: bool,

    // === Broker boundary ===
    pub broker_max_attempts: u32,
    pub broker_retry_initial_ms: u64,

    /// Timeout applied to every broker and pipeline call
    pub call_timeout_secs: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            initial_balance: dec!(10000),
            equity_stop_pct: dec!(-5.0),
            max_concurrent_positions: 18,
            symbols: [
                "EURUSD", "GBPUSD", "USDJPY", "USDCHF", "AUDUSD", "USDCAD", "NZDUSD", "EURJPY",
                "GBPJPY", "EURGBP",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            symbol_suffix: String::new(),

            profit_target_abs: dec!(75),
            stop_loss_abs: dec!(50),
            max_position_duration_hours: 4,
            trailing_trigger_abs: dec!(30),
            trailing_strategy: TrailingStrategyKind::FixedDistance,
            trailing_retention_fraction: dec!(0.7),
            trailing_distance_abs: dec!(15),

            exit_signal_threshold_count: 3,
            exit_signal_noise_threshold: 0.5,

            reinforcement_enabled: true,
            rapid_move_threshold_per_minute: dec!(5),
            reinforcement_min_drawdown_abs: dec!(20),
            min_strength_differential: 1.0,
            compensation_per_strength: 0.1,
            min_compensation_fraction: 0.2,
            max_compensation_fraction: 0.5,
            max_reinforcement_volume_ratio: dec!(1),
            volume_step: dec!(0.01),

            entry_strength_threshold: 1.0,
            entry_pips_per_strength: dec!(1),
            max_entry_adjust_pips: dec!(2),

            main_cycle_period_minutes: 30,
            monitoring_period_minutes: 5,
            session_start_hour: 8,
            session_end_hour: 20,
            close_at_session_end: false,

            broker_max_attempts: 3,
            broker_retry_initial_ms: 500,
            call_timeout_secs: 30,
        }
    }
}

impl TradingConfig {
    /// Load from a TOML file; absent keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Reject values that would make any tick meaningless.
    pub fn validate(&self) -> TradingResult<()> {
        fn bad(msg: impl Into<String>) -> TradingResult<()> {
            Err(TradingError::Configuration(msg.into()))
        }

        if self.initial_balance <= Decimal::ZERO {
            return bad(format!("initial_balance must be positive, got {}", self.initial_balance));
        }
        if self.equity_stop_pct >= Decimal::ZERO {
            return bad(format!("equity_stop_pct must be negative, got {}", self.equity_stop_pct));
        }
        if self.profit_target_abs <= Decimal::ZERO {
            return bad("profit_target_abs must be positive");
        }
        if self.stop_loss_abs <= Decimal::ZERO {
            return bad("stop_loss_abs must be positive");
        }
        if self.max_position_duration_hours <= 0 || self.max_position_duration_hours > MAX_POSITION_HOURS {
            return bad(format!(
                "max_position_duration_hours must be within 1..={}, got {}",
                MAX_POSITION_HOURS, self.max_position_duration_hours
            ));
        }
        if self.trailing_trigger_abs <= Decimal::ZERO {
            return bad("trailing_trigger_abs must be positive");
        }
        match self.trailing_strategy {
            TrailingStrategyKind::Percentage => {
                if self.trailing_retention_fraction <= Decimal::ZERO
                    || self.trailing_retention_fraction >= Decimal::ONE
                {
                    return bad("trailing_retention_fraction must be between 0 and 1");
                }
            }
            TrailingStrategyKind::FixedDistance => {
                if self.trailing_distance_abs <= Decimal::ZERO {
                    return bad("trailing_distance_abs must be positive");
                }
            }
        }
        if self.exit_signal_threshold_count == 0 {
            return bad("exit_signal_threshold_count must be at least 1");
        }
        if !(self.exit_signal_noise_threshold >= 0.0) {
            return bad("exit_signal_noise_threshold must be non-negative");
        }
        if self.main_cycle_period_minutes == 0 || self.monitoring_period_minutes == 0 {
            return bad("cycle periods must be positive");
        }
        if self.main_cycle_period_minutes > MAX_CYCLE_MINUTES {
            return bad(format!("main_cycle_period_minutes cannot exceed {}", MAX_CYCLE_MINUTES));
        }
        if self.monitoring_period_minutes > self.main_cycle_period_minutes {
            return bad("monitoring_period_minutes cannot exceed main_cycle_period_minutes");
        }
        if self.session_end_hour > 24 || self.session_start_hour >= self.session_end_hour {
            return bad(format!(
                "invalid session hours {}..{}",
                self.session_start_hour, self.session_end_hour
            ));
        }
        if self.max_concurrent_positions == 0 {
            return bad("max_concurrent_positions must be at least 1");
        }
        if self.volume_step <= Decimal::ZERO {
            return bad("volume_step must be positive");
        }
        if !(0.0 < self.min_compensation_fraction
            && self.min_compensation_fraction <= self.max_compensation_fraction
            && self.max_compensation_fraction < 1.0)
        {
            return bad("compensation fractions must satisfy 0 < min <= max < 1");
        }
        if self.max_entry_adjust_pips < Decimal::ZERO {
            return bad("max_entry_adjust_pips cannot be negative");
        }
        if self.broker_max_attempts == 0 {
            return bad("broker_max_attempts must be at least 1");
        }
        if self.call_timeout_secs == 0 {
            return bad("call_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn main_cycle_period(&self) -> Duration {
        Duration::from_secs(self.main_cycle_period_minutes * 60)
    }

    pub fn monitoring_period(&self) -> Duration {
        Duration::from_secs(self.monitoring_period_minutes * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TradingConfig::default().validate().is_ok());
    }

    #[test]
    fn test_positive_equity_stop_rejected() {
        let config = TradingConfig {
            equity_stop_pct: dec!(5.0),
            ..TradingConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, TradingError::Configuration(_)));
        assert!(err.to_string().contains("equity_stop_pct"));
    }

    #[test]
    fn test_retention_fraction_only_checked_for_percentage() {
        let mut config = TradingConfig {
            trailing_retention_fraction: dec!(1.5),
            trailing_strategy: TrailingStrategyKind::FixedDistance,
            ..TradingConfig::default()
        };
        assert!(config.validate().is_ok());

        config.trailing_strategy = TrailingStrategyKind::Percentage;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_monitoring_slower_than_main_cycle_rejected() {
        let config = TradingConfig {
            main_cycle_period_minutes: 5,
            monitoring_period_minutes: 10,
            ..TradingConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        let config = TradingConfig {
            max_position_duration_hours: i64::MAX,
            ..TradingConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_position_duration_hours"));

        let config = TradingConfig {
            main_cycle_period_minutes: u64::MAX,
            ..TradingConfig::default()
        };
        assert!(config.validate().is_err());

        let config = TradingConfig {
            max_position_duration_hours: 24 * 365,
            ..TradingConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TradingConfig::from_toml(
            r#"
            equity_stop_pct = -3.5
            trailing_strategy = "percentage"
            symbols = ["EURUSD", "USDJPY"]
            "#,
        )
        .unwrap();

        assert_eq!(config.equity_stop_pct, dec!(-3.5));
        assert_eq!(config.trailing_strategy, TrailingStrategyKind::Percentage);
        assert_eq!(config.symbols.len(), 2);
        assert_eq!(config.profit_target_abs, dec!(75));
        assert!(config.validate().is_ok());
    }
}
