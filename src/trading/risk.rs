//! Portfolio-wide equity stop.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, error};

use crate::models::PortfolioSnapshot;

use super::context::TradingContext;
use super::error::{TradingError, TradingResult};

/// Outcome of an equity-stop evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct EquityCheck {
    pub breached: bool,
    pub reason: String,
    pub drawdown_pct: Decimal,
    pub snapshot: PortfolioSnapshot,
}

/// Drawdown of `equity` from `initial_balance`, in percent (negative when losing).
pub fn drawdown_pct(equity: Decimal, initial_balance: Decimal) -> TradingResult<Decimal> {
    if initial_balance <= Decimal::ZERO {
        return Err(TradingError::Configuration(format!(
            "initial balance must be positive, got {}",
            initial_balance
        )));
    }
    Ok((equity - initial_balance) / initial_balance * dec!(100))
}

/// Evaluates portfolio drawdown against the equity stop.
pub struct PortfolioRiskEngine {
    equity_stop_pct: Decimal,
}

impl PortfolioRiskEngine {
    pub fn new(equity_stop_pct: Decimal) -> Self {
        Self { equity_stop_pct }
    }

    /// Check a snapshot against a drawdown threshold. Pure.
    pub fn check(
        snapshot: &PortfolioSnapshot,
        initial_balance: Decimal,
        equity_stop_pct: Decimal,
    ) -> TradingResult<(bool, String, Decimal)> {
        let drawdown = drawdown_pct(snapshot.equity_value(), initial_balance)?;
        if drawdown <= equity_stop_pct {
            let reason = format!(
                "equity_stop: drawdown {}% <= {}% (equity {})",
                drawdown.round_dp(2),
                equity_stop_pct,
                snapshot.equity_value().round_dp(2)
            );
            Ok((true, reason, drawdown))
        } else {
            Ok((false, String::new(), drawdown))
        }
    }

    /// Snapshot the portfolio at `now`, record it in the history, and check the stop.
    ///
    /// Unrealized P&L is recomputed from open positions every call.
    pub fn evaluate(&self, ctx: &mut TradingContext, now: DateTime<Utc>) -> TradingResult<EquityCheck> {
        let snapshot = ctx.snapshot(now);
        let (breached, reason, drawdown) =
            Self::check(&snapshot, ctx.initial_balance, self.equity_stop_pct)?;
        ctx.history.push(snapshot.clone());

        if breached {
            error!(
                equity = %snapshot.equity_value(),
                drawdown_pct = %drawdown.round_dp(2),
                threshold = %self.equity_stop_pct,
                "Equity stop breached"
            );
        } else {
            debug!(
                equity = %snapshot.equity_value(),
                drawdown_pct = %drawdown.round_dp(2),
                "Equity within limits"
            );
        }

        Ok(EquityCheck {
            breached,
            reason,
            drawdown_pct: drawdown,
            snapshot,
        })
    }
}
