//! REST client for the broker terminal bridge.
//!
//! The bridge exposes quotes, order entry, open positions and the strength
//! calculator over HTTP. One client implements all three collaborator traits.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::models::{CurrencyStrengthSnapshot, Direction, Position, RawPriceData};
use crate::trading::{TradingError, TradingResult};

use super::types::*;
use super::{BrokerGateway, MarketData, StrengthCalculator};


/// Client for the terminal bridge.
pub struct BridgeClient {
    client: Client,
    base_url: String,
    symbol_suffix: String,
}

fn transport_error(operation: &str, e: reqwest::Error) -> TradingError {
    if e.is_timeout() {
        TradingError::timeout(operation)
    } else {
        TradingError::broker(operation, e.to_string())
    }
}

/// Read the ticket out of an order reply.
///
/// A refused order is a retryable broker error. A successful status whose
/// body cannot be read may hide a fill, so it is reported as unconfirmed.
fn parse_order(operation: &str, status: StatusCode, body: &str) -> TradingResult<u64> {
    if !status.is_success() {
        let reason = serde_json::from_str::<OrderResponse>(body)
            .ok()
            .and_then(|order| order.error)
            .unwrap_or_else(|| format!("order rejected with status {}", status));
        return Err(TradingError::broker(operation, reason));
    }

    let order: OrderResponse = serde_json::from_str(body)
        .map_err(|e| TradingError::order_unconfirmed(operation, e.to_string()))?;
    match order.ticket {
        Some(ticket) => Ok(ticket),
        None => Err(TradingError::order_unconfirmed(
            operation,
            order.error.unwrap_or_else(|| "accepted without a ticket".to_string()),
        )),
    }
}

impl BridgeClient {
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            symbol_suffix: String::new(),
        })
    }

    /// Broker symbols carry this suffix (e.g. ".m"); it is added on requests and
    /// stripped from listed positions.
    pub fn with_symbol_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.symbol_suffix = suffix.into();
        self
    }

    fn broker_symbol(&self, symbol: &str) -> String {
        format!("{}{}", symbol, self.symbol_suffix)
    }

    async fn fetch_price(&self, symbol: &str, at: Option<DateTime<Utc>>) -> Result<Option<Decimal>> {
        let mut url = format!("{}/price/{}", self.base_url, self.broker_symbol(symbol));
        if let Some(at) = at {
            url = format!("{}?at={}", url, at.to_rfc3339());
        }

        debug!(url = %url, "Fetching price");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to fetch price")?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Price request failed: {} - {}", status, body);
        }

        let quote: PriceResponse = response
            .json()
            .await
            .context("Failed to parse price response")?;
        Ok(quote.price)
    }
}

#[async_trait]
impl MarketData for BridgeClient {
    async fn live_price(&self, symbol: &str) -> Option<Decimal> {
        match self.fetch_price(symbol, None).await {
            Ok(price) => price,
            Err(e) => {
                warn!(symbol, error = %e, "Live price unavailable");
                None
            }
        }
    }

    async fn historical_price(&self, symbol: &str, at: DateTime<Utc>) -> Option<Decimal> {
        match self.fetch_price(symbol, Some(at)).await {
            Ok(price) => price,
            Err(e) => {
                warn!(symbol, at = %at, error = %e, "Historical price unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl BrokerGateway for BridgeClient {
    async fn open_position(
        &self,
        symbol: &str,
        direction: Direction,
        volume: Decimal,
        price: Decimal,
    ) -> TradingResult<u64> {
        let operation = format!("open {}", symbol);
        let broker_symbol = self.broker_symbol(symbol);
        let body = OrderRequest {
            symbol: &broker_symbol,
            side: match direction {
                Direction::Long => "BUY",
                Direction::Short => "SELL",
            },
            volume,
            price,
        };

        let response = self
            .client
            .post(format!("{}/orders", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&operation, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TradingError::order_unconfirmed(&operation, e.to_string()))?;
        parse_order(&operation, status, &text)
    }

    async fn close_position(&self, ticket: u64) -> TradingResult<()> {
        let operation = format!("close {}", ticket);
        let response = self
            .client
            .delete(format!("{}/positions/{}", self.base_url, ticket))
            .send()
            .await
            .map_err(|e| transport_error(&operation, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TradingError::broker(operation, format!("{} - {}", status, body)));
        }
        Ok(())
    }

    async fn list_open_positions(&self) -> TradingResult<Vec<Position>> {
        let response = self
            .client
            .get(format!("{}/positions", self.base_url))
            .send()
            .await
            .map_err(|e| transport_error("list positions", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TradingError::broker("list positions", format!("{} - {}", status, body)));
        }

        let items: Vec<PositionResponse> = response
            .json()
            .await
            .map_err(|e| transport_error("list positions", e))?;

        Ok(items
            .into_iter()
            .filter_map(|p| {
                let ticket = p.ticket;
                let pos = p.into_position(&self.symbol_suffix);
                if pos.is_none() {
                    warn!(ticket, "Skipping broker position with unknown side");
                }
                pos
            })
            .collect())
    }
}

#[async_trait]
impl StrengthCalculator for BridgeClient {
    async fn snapshot(&self, raw: &RawPriceData) -> TradingResult<CurrencyStrengthSnapshot> {
        let response = self
            .client
            .post(format!("{}/strength", self.base_url))
            .json(raw)
            .send()
            .await
            .map_err(|e| match transport_error("strength", e) {
                TradingError::Broker { message, .. } => TradingError::DataUnavailable {
                    symbol: format!("strength ({})", message),
                },
                other => other,
            })?;

        if !response.status().is_success() {
            return Err(TradingError::DataUnavailable {
                symbol: format!("strength ({})", response.status()),
            });
        }

        let body: StrengthResponse = response.json().await.map_err(|e| TradingError::DataUnavailable {
            symbol: format!("strength ({})", e),
        })?;
        Ok(CurrencyStrengthSnapshot::new(body.timestamp, body.readings))
    }
}
