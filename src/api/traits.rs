//! Collaborator contracts consumed by the trading core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{CurrencyStrengthSnapshot, Direction, Position, RawPriceData, TradeProposal};
use crate::trading::TradingResult;

/// Price source for live and historical quotes.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Latest price, `None` when the terminal has no quote.
    async fn live_price(&self, symbol: &str) -> Option<Decimal>;

    /// Price in effect at `at`, `None` when no history covers it.
    async fn historical_price(&self, symbol: &str, at: DateTime<Utc>) -> Option<Decimal>;
}

/// Turns raw prices into per-currency strength.
#[async_trait]
pub trait StrengthCalculator: Send + Sync {
    async fn snapshot(&self, raw: &RawPriceData) -> TradingResult<CurrencyStrengthSnapshot>;
}

/// Context handed to the decision pipeline each main cycle.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DecisionContext {
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub open_positions: Vec<Position>,
    pub strength: Option<CurrencyStrengthSnapshot>,
    pub equity_value: Decimal,
}

/// External producer of new-trade and closure proposals.
#[async_trait]
pub trait DecisionPipeline: Send + Sync {
    async fn propose_trades(&self, context: &DecisionContext) -> TradingResult<Vec<TradeProposal>>;

    async fn propose_closures(&self, context: &DecisionContext) -> TradingResult<Vec<u64>>;
}

/// Order execution boundary.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Open a position, returning the broker ticket.
    async fn open_position(
        &self,
        symbol: &str,
        direction: Direction,
        volume: Decimal,
        price: Decimal,
    ) -> TradingResult<u64>;

    async fn close_position(&self, ticket: u64) -> TradingResult<()>;

    async fn list_open_positions(&self) -> TradingResult<Vec<Position>>;
}

/// Time source. The same core runs against wall-clock or replayed time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// True when `now()` is the real present and live quotes apply.
    fn is_live(&self) -> bool;
}
