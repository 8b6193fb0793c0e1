//! Mutable trading state, owned by the orchestrator and lent to each component.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::models::{CloseReason, CurrencyStrengthSnapshot, PortfolioSnapshot, Position, PositionStatus};

/// New-trade suspension after a protective action failed.
#[derive(Debug, Clone, PartialEq)]
pub struct HaltState {
    pub reason: String,
    pub since: DateTime<Utc>,
}

/// Result of reconciling with the broker's open-position list.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SyncReport {
    pub adopted: Vec<u64>,
    pub vanished: Vec<u64>,
}

/// Everything that survives between ticks.
#[derive(Debug, Clone)]
pub struct TradingContext {
    pub initial_balance: Decimal,

    /// Cumulative P&L of closed positions. Changed only by `finalize_close`.
    pub realized_pnl: Decimal,

    /// Open and closing positions by ticket
    pub positions: BTreeMap<u64, Position>,

    /// Positions closed this session
    pub closed: Vec<Position>,

    /// One snapshot per risk evaluation
    pub history: Vec<PortfolioSnapshot>,

    pub previous_strength: Option<CurrencyStrengthSnapshot>,

    pub halt: Option<HaltState>,

    /// Equity-stop closures still owed to the broker
    pub outstanding_closures: BTreeSet<u64>,

    /// Exit-signal closures the broker refused, retried next main cycle
    pub pending_exit_closures: BTreeSet<u64>,

    pub cycle_count: u64,
}

impl TradingContext {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            initial_balance,
            realized_pnl: Decimal::ZERO,
            positions: BTreeMap::new(),
            closed: Vec::new(),
            history: Vec::new(),
            previous_strength: None,
            halt: None,
            outstanding_closures: BTreeSet::new(),
            pending_exit_closures: BTreeSet::new(),
            cycle_count: 0,
        }
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values().filter(|p| p.is_open())
    }

    pub fn open_count(&self) -> usize {
        self.open_positions().count()
    }

    pub fn open_tickets(&self) -> Vec<u64> {
        self.open_positions().map(|p| p.id).collect()
    }

    /// Sum of `current_pnl` over open positions.
    pub fn unrealized_pnl(&self) -> Decimal {
        self.open_positions().map(|p| p.current_pnl).sum()
    }

    /// Originals that currently have an open reinforcement.
    pub fn active_reinforcement_origins(&self) -> BTreeSet<u64> {
        self.open_positions()
            .filter_map(|p| p.reinforcement_of)
            .collect()
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> PortfolioSnapshot {
        PortfolioSnapshot::new(
            now,
            self.initial_balance,
            self.realized_pnl,
            self.unrealized_pnl(),
            self.open_count(),
        )
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_some()
    }

    /// Flag a position as having a close in flight. False if it is not open.
    pub fn begin_close(&mut self, ticket: u64) -> bool {
        match self.positions.get_mut(&ticket) {
            Some(pos) if pos.is_open() => {
                pos.status = PositionStatus::Closing;
                true
            }
            _ => false,
        }
    }

    /// Broker refused the close: the position stays open for the next tick.
    pub fn abort_close(&mut self, ticket: u64) {
        if let Some(pos) = self.positions.get_mut(&ticket) {
            if pos.status == PositionStatus::Closing {
                pos.status = PositionStatus::Open;
            }
        }
    }

    /// Broker confirmed the close: move its P&L into realized and retire it.
    pub fn finalize_close(
        &mut self,
        ticket: u64,
        reason: CloseReason,
        at: DateTime<Utc>,
    ) -> Option<Position> {
        let mut pos = self.positions.remove(&ticket)?;
        if !pos.mark_closed(reason, at) {
            return None;
        }
        self.realized_pnl += pos.current_pnl;
        self.outstanding_closures.remove(&ticket);
        self.pending_exit_closures.remove(&ticket);
        self.closed.push(pos.clone());
        Some(pos)
    }

    /// Reconcile with the broker's view of open positions.
    ///
    /// Unknown tickets are adopted; tickets the broker no longer lists are closed
    /// at their last evaluated P&L.
    pub fn sync_with_broker(&mut self, broker_positions: Vec<Position>, now: DateTime<Utc>) -> SyncReport {
        let mut report = SyncReport::default();
        let listed: BTreeSet<u64> = broker_positions.iter().map(|p| p.id).collect();

        for pos in broker_positions {
            if !self.positions.contains_key(&pos.id) {
                info!(ticket = pos.id, symbol = %pos.symbol, "Adopting broker position");
                report.adopted.push(pos.id);
                self.positions.insert(pos.id, pos);
            }
        }

        let vanished: Vec<u64> = self
            .positions
            .keys()
            .copied()
            .filter(|t| !listed.contains(t))
            .collect();
        for ticket in vanished {
            if let Some(pos) = self.finalize_close(ticket, CloseReason::BrokerClosed, now) {
                warn!(ticket, pnl = %pos.current_pnl, "Position closed outside the controller");
                report.vanished.push(ticket);
            }
        }

        report
    }
}
