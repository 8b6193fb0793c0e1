//! Wire types for the broker bridge and decision service.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Direction, Position, StrengthReading, TradeProposal};

/// Quote from `GET /price/{symbol}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceResponse {
    #[serde(default)]
    pub symbol: String,
    pub price: Option<Decimal>,
    #[serde(default)]
    pub time: Option<DateTime<Utc>>,
}

/// Body of `POST /orders`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest<'a> {
    pub symbol: &'a str,
    /// "BUY" or "SELL"
    pub side: &'static str,
    pub volume: Decimal,
    pub price: Decimal,
}

/// Result of `POST /orders`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderResponse {
    pub ticket: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Open position from `GET /positions`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionResponse {
    pub ticket: u64,
    pub symbol: String,
    #[serde(alias = "type")]
    pub side: String,
    #[serde(alias = "priceOpen")]
    pub entry_price: Decimal,
    pub volume: Decimal,
    #[serde(alias = "time")]
    pub open_time: DateTime<Utc>,
}

impl PositionResponse {
    /// Convert to a tracked position. Unknown sides are rejected.
    pub fn into_position(self, symbol_suffix: &str) -> Option<Position> {
        let direction = Direction::parse(&self.side)?;
        let symbol = if symbol_suffix.is_empty() {
            self.symbol
        } else {
            self.symbol
                .strip_suffix(symbol_suffix)
                .map(str::to_string)
                .unwrap_or(self.symbol)
        };
        Some(Position::new(
            self.ticket,
            symbol,
            direction,
            self.entry_price,
            self.volume,
            self.open_time,
        ))
    }
}

/// Result of `POST /strength`.
#[derive(Debug, Clone, Deserialize)]
pub struct StrengthResponse {
    pub timestamp: DateTime<Utc>,
    pub readings: BTreeMap<String, StrengthReading>,
}

/// Result of `POST /proposals/trades`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TradeProposalsResponse {
    #[serde(default)]
    pub proposals: Vec<TradeProposal>,
}

/// Result of `POST /proposals/closures`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClosureProposalsResponse {
    #[serde(default)]
    pub tickets: Vec<u64>,
}
