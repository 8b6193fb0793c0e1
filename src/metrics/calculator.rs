//! Session performance summary: P&L, win rate, dispersion, drawdown, close reasons.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use statrs::statistics::Statistics;
use tracing::info;

use crate::models::{CloseReason, PortfolioSnapshot};
use crate::trading::TradingContext;

/// Aggregated session statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSummary {
    pub equity_value: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub open_positions: usize,

    pub closed_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Share of closed trades with positive P&L (0-1)
    pub win_rate: f64,
    pub mean_pnl: f64,
    pub pnl_std_dev: f64,

    /// Largest peak-to-trough equity drop over the recorded history
    pub max_drawdown: Decimal,
    /// Same drop as a fraction of the peak (0-1)
    pub max_drawdown_pct: f64,

    pub closes_by_reason: BTreeMap<CloseReason, usize>,
}

/// Builds a [`SessionSummary`] from trading state.
pub struct SummaryCalculator;

impl SummaryCalculator {
    pub fn calculate(ctx: &TradingContext, now: DateTime<Utc>) -> SessionSummary {
        let snapshot = ctx.snapshot(now);
        let mut summary = SessionSummary {
            equity_value: snapshot.equity_value(),
            realized_pnl: snapshot.realized_pnl(),
            unrealized_pnl: snapshot.unrealized_pnl(),
            open_positions: snapshot.position_count(),
            closed_trades: ctx.closed.len(),
            ..SessionSummary::default()
        };

        let pnls: Vec<Decimal> = ctx.closed.iter().map(|p| p.current_pnl).collect();
        Self::calculate_pnl_stats(&mut summary, &pnls);

        for reason in ctx.closed.iter().filter_map(|p| p.close_reason()) {
            *summary.closes_by_reason.entry(reason).or_insert(0) += 1;
        }

        let (max_dd, max_dd_pct) = Self::max_drawdown(&ctx.history);
        summary.max_drawdown = max_dd;
        summary.max_drawdown_pct = max_dd_pct;

        summary
    }

    fn calculate_pnl_stats(summary: &mut SessionSummary, pnls: &[Decimal]) {
        if pnls.is_empty() {
            return;
        }

        summary.winning_trades = pnls.iter().filter(|p| **p > Decimal::ZERO).count();
        summary.losing_trades = pnls.iter().filter(|p| **p < Decimal::ZERO).count();
        summary.win_rate = summary.winning_trades as f64 / pnls.len() as f64;

        let values: Vec<f64> = pnls.iter().filter_map(|p| p.to_f64()).collect();
        summary.mean_pnl = values.clone().mean();
        if values.len() >= 2 {
            summary.pnl_std_dev = values.std_dev();
        }
    }

    /// Max peak-to-trough equity drop, absolute and as a fraction of the peak.
    pub fn max_drawdown(history: &[PortfolioSnapshot]) -> (Decimal, f64) {
        let mut peak: Option<Decimal> = None;
        let mut max_dd = Decimal::ZERO;
        let mut max_dd_pct = 0.0f64;

        for snap in history {
            let equity = snap.equity_value();
            let top = match peak {
                Some(p) if p >= equity => p,
                _ => {
                    peak = Some(equity);
                    equity
                }
            };

            let dd = top - equity;
            if dd > max_dd {
                max_dd = dd;
            }
            if top > Decimal::ZERO {
                let pct = dd.to_f64().unwrap_or(0.0) / top.to_f64().unwrap_or(1.0);
                if pct > max_dd_pct {
                    max_dd_pct = pct;
                }
            }
        }

        (max_dd, max_dd_pct)
    }
}

impl SessionSummary {
    pub fn log(&self, cycle: u64) {
        info!(
            cycle,
            equity = %self.equity_value.round_dp(2),
            realized = %self.realized_pnl.round_dp(2),
            unrealized = %self.unrealized_pnl.round_dp(2),
            open = self.open_positions,
            closed = self.closed_trades,
            win_rate = %format!("{:.1}%", self.win_rate * 100.0),
            mean_pnl = %format!("{:.2}", self.mean_pnl),
            std_dev = %format!("{:.2}", self.pnl_std_dev),
            max_drawdown = %self.max_drawdown.round_dp(2),
            by_reason = ?self.closes_by_reason,
            "Session summary"
        );
    }
}
