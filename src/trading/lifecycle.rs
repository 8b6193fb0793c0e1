//! Per-position close rules: time exit, profit target, stop loss, trailing stop.
//!
//! Rules are evaluated in a fixed order and the first match wins:
//! 1. max duration
//! 2. profit target
//! 3. stop loss
//! 4. trailing stop (armed once peak P&L reaches the trigger)
//!
//! The peak P&L is raised on every evaluation before any rule runs.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::models::{CloseReason, Position};

use super::config::{TradingConfig, TrailingStrategyKind};

/// Decision to close one position.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseDecision {
    pub position_id: u64,
    pub reason: CloseReason,
    pub pnl: Decimal,
}

/// Trailing-stop variant. Only consulted once the stop is armed.
pub trait TrailingStop: Send + Sync {
    /// True when `current` has given back enough of `peak` to close.
    fn should_close(&self, peak: Decimal, current: Decimal) -> bool;

    fn name(&self) -> &'static str;
}

/// Keep a fraction of the peak: close at or below `peak * retention`.
#[derive(Debug, Clone)]
pub struct PercentageTrailingStop {
    pub retention_fraction: Decimal,
}

impl TrailingStop for PercentageTrailingStop {
    fn should_close(&self, peak: Decimal, current: Decimal) -> bool {
        current <= peak * self.retention_fraction
    }

    fn name(&self) -> &'static str {
        "percentage"
    }
}

/// Fixed give-back: close at or below `peak - distance`.
#[derive(Debug, Clone)]
pub struct FixedDistanceTrailingStop {
    pub distance: Decimal,
}

impl TrailingStop for FixedDistanceTrailingStop {
    fn should_close(&self, peak: Decimal, current: Decimal) -> bool {
        current <= peak - self.distance
    }

    fn name(&self) -> &'static str {
        "fixed_distance"
    }
}

/// Build the trailing stop selected by configuration.
pub fn trailing_stop_from_config(config: &TradingConfig) -> Box<dyn TrailingStop> {
    match config.trailing_strategy {
        TrailingStrategyKind::Percentage => Box::new(PercentageTrailingStop {
            retention_fraction: config.trailing_retention_fraction,
        }),
        TrailingStrategyKind::FixedDistance => Box::new(FixedDistanceTrailingStop {
            distance: config.trailing_distance_abs,
        }),
    }
}

/// Evaluates open positions against the close rules.
pub struct PositionLifecycleManager {
    profit_target: Decimal,
    stop_loss: Decimal,
    max_duration: Duration,
    trailing_trigger: Decimal,
    trailing: Box<dyn TrailingStop>,
}

impl PositionLifecycleManager {
    pub fn new(config: &TradingConfig) -> Self {
        Self::with_trailing_stop(config, trailing_stop_from_config(config))
    }

    pub fn with_trailing_stop(config: &TradingConfig, trailing: Box<dyn TrailingStop>) -> Self {
        Self {
            profit_target: config.profit_target_abs,
            stop_loss: config.stop_loss_abs,
            max_duration: Duration::hours(config.max_position_duration_hours),
            trailing_trigger: config.trailing_trigger_abs,
            trailing,
        }
    }

    pub fn trailing_name(&self) -> &'static str {
        self.trailing.name()
    }

    /// Value the position at `current_price`, raise its peak, and apply the rules.
    ///
    /// Mutates only P&L tracking fields; status changes are applied by the caller
    /// once the broker confirms the close.
    pub fn evaluate(
        &self,
        position: &mut Position,
        current_price: Decimal,
        now: DateTime<Utc>,
    ) -> Option<CloseDecision> {
        if !position.is_open() {
            return None;
        }

        let pnl = position.pnl_at(current_price);
        position.observe(pnl, now);

        let reason = self.check_rules(position, now)?;
        Some(CloseDecision {
            position_id: position.id,
            reason,
            pnl,
        })
    }

    /// Apply the ordered rules to an already-valued position.
    pub fn check_rules(&self, position: &Position, now: DateTime<Utc>) -> Option<CloseReason> {
        let pnl = position.current_pnl;
        let peak = position.peak();

        let age = now - position.open_time;
        if age >= self.max_duration {
            info!(
                ticket = position.id,
                symbol = %position.symbol,
                hours = age.num_hours(),
                pnl = %pnl,
                "Max position duration reached"
            );
            return Some(CloseReason::TimeExit);
        }

        if pnl >= self.profit_target {
            info!(
                ticket = position.id,
                pnl = %pnl,
                target = %self.profit_target,
                "Profit target hit"
            );
            return Some(CloseReason::ProfitTarget);
        }

        if pnl <= -self.stop_loss {
            warn!(
                ticket = position.id,
                pnl = %pnl,
                stop = %self.stop_loss,
                "Stop loss hit"
            );
            return Some(CloseReason::StopLoss);
        }

        if peak >= self.trailing_trigger && self.trailing.should_close(peak, pnl) {
            info!(
                ticket = position.id,
                peak = %peak,
                pnl = %pnl,
                strategy = self.trailing.name(),
                "Trailing stop hit"
            );
            return Some(CloseReason::TrailingStop);
        }

        debug!(ticket = position.id, pnl = %pnl, peak = %peak, "Position holds");
        None
    }
}
