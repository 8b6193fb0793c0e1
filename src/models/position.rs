//! Position model: an open or closed forex trade tracked by the controller.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn flip(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    /// Parse the broker/pipeline spellings (`BUY`, `long`, `SELL`, `short`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "long" | "buy" => Some(Direction::Long),
            "short" | "sell" => Some(Direction::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    /// A close has been requested and the broker call is in flight.
    Closing,
    Closed,
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    TimeExit,
    ProfitTarget,
    StopLoss,
    TrailingStop,
    ExitSignal,
    EquityStop,
    SessionEnd,
    DecisionClose,
    /// The broker no longer lists the ticket (closed outside the controller).
    BrokerClosed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TimeExit => "time_exit",
            CloseReason::ProfitTarget => "profit_target",
            CloseReason::StopLoss => "stop_loss",
            CloseReason::TrailingStop => "trailing_stop",
            CloseReason::ExitSignal => "exit_signal",
            CloseReason::EquityStop => "equity_stop",
            CloseReason::SessionEnd => "session_end",
            CloseReason::DecisionClose => "decision_close",
            CloseReason::BrokerClosed => "broker_closed",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base and quote currency of a six-letter pair, if it has that shape.
pub fn split_pair(symbol: &str) -> Option<(&str, &str)> {
    if symbol.len() >= 6 && symbol.is_char_boundary(3) && symbol.is_char_boundary(6) {
        Some((&symbol[..3], &symbol[3..6]))
    } else {
        None
    }
}

fn is_yen_quoted(symbol: &str) -> bool {
    split_pair(symbol).map_or(false, |(_, quote)| quote.eq_ignore_ascii_case("JPY"))
}

/// Money per unit of price movement per lot.
pub fn pip_multiplier(symbol: &str) -> Decimal {
    if is_yen_quoted(symbol) {
        dec!(1000)
    } else {
        dec!(10000)
    }
}

/// Size of one pip in price units.
pub fn pip_size(symbol: &str) -> Decimal {
    if is_yen_quoted(symbol) {
        dec!(0.01)
    } else {
        dec!(0.0001)
    }
}

/// A trade unit identified by its broker ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Broker ticket
    pub id: u64,

    /// Canonical pair, e.g. "EURUSD"
    pub symbol: String,

    pub direction: Direction,

    pub entry_price: Decimal,

    /// Lots
    pub volume: Decimal,

    pub open_time: DateTime<Utc>,

    /// P&L at the last evaluated price
    pub current_pnl: Decimal,

    /// High-water mark of `current_pnl`; `None` until first evaluation
    pub peak_pnl: Option<Decimal>,

    /// Ticket of the position this one reinforces
    pub reinforcement_of: Option<u64>,

    pub status: PositionStatus,

    close_reason: Option<CloseReason>,

    pub close_time: Option<DateTime<Utc>>,

    /// Time and P&L of the previous evaluation, for move-rate detection
    #[serde(default)]
    pub last_observed: Option<(DateTime<Utc>, Decimal)>,
}

impl Position {
    /// Create an open position as reported by the broker.
    pub fn new(
        id: u64,
        symbol: impl Into<String>,
        direction: Direction,
        entry_price: Decimal,
        volume: Decimal,
        open_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            symbol: symbol.into(),
            direction,
            entry_price,
            volume,
            open_time,
            current_pnl: Decimal::ZERO,
            peak_pnl: None,
            reinforcement_of: None,
            status: PositionStatus::Open,
            close_reason: None,
            close_time: None,
            last_observed: None,
        }
    }

    /// Mark this position as a reinforcement of `origin`.
    pub fn with_reinforcement_of(mut self, origin: u64) -> Self {
        self.reinforcement_of = Some(origin);
        self
    }

    /// P&L if the position were valued at `price`.
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        self.direction.sign() * (price - self.entry_price) * pip_multiplier(&self.symbol) * self.volume
    }

    /// Record a fresh P&L observation and raise the peak.
    ///
    /// Returns the previous observation so callers can measure the move rate.
    pub fn observe(&mut self, pnl: Decimal, at: DateTime<Utc>) -> Option<(DateTime<Utc>, Decimal)> {
        self.current_pnl = pnl;
        self.peak_pnl = Some(match self.peak_pnl {
            Some(peak) => peak.max(pnl),
            None => pnl,
        });
        self.last_observed.replace((at, pnl))
    }

    /// Peak P&L, falling back to the current P&L before the first evaluation.
    pub fn peak(&self) -> Decimal {
        self.peak_pnl.unwrap_or(self.current_pnl)
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Finalize the close. The first reason recorded wins.
    ///
    /// Returns false if the position was already closed.
    pub fn mark_closed(&mut self, reason: CloseReason, at: DateTime<Utc>) -> bool {
        if self.status == PositionStatus::Closed || self.close_reason.is_some() {
            return false;
        }
        self.status = PositionStatus::Closed;
        self.close_reason = Some(reason);
        self.close_time = Some(at);
        true
    }

    /// Base and quote currency codes.
    pub fn currencies(&self) -> Option<(&str, &str)> {
        split_pair(&self.symbol)
    }

    pub fn is_reinforcement(&self) -> bool {
        self.reinforcement_of.is_some()
    }
}
