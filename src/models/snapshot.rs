//! Immutable per-tick portfolio snapshot.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Portfolio state at one evaluation tick. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    timestamp: DateTime<Utc>,
    realized_pnl: Decimal,
    unrealized_pnl: Decimal,
    position_count: usize,
    equity_value: Decimal,
}

impl PortfolioSnapshot {
    pub fn new(
        timestamp: DateTime<Utc>,
        initial_balance: Decimal,
        realized_pnl: Decimal,
        unrealized_pnl: Decimal,
        position_count: usize,
    ) -> Self {
        Self {
            timestamp,
            realized_pnl,
            unrealized_pnl,
            position_count,
            equity_value: initial_balance + realized_pnl + unrealized_pnl,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn realized_pnl(&self) -> Decimal {
        self.realized_pnl
    }

    pub fn unrealized_pnl(&self) -> Decimal {
        self.unrealized_pnl
    }

    pub fn position_count(&self) -> usize {
        self.position_count
    }

    pub fn equity_value(&self) -> Decimal {
        self.equity_value
    }
}
