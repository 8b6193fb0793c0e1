//! Currency pair canonicalization and strength-adjusted entry pricing.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::api::MarketData;
use crate::models::{pip_size, split_pair, CurrencyStrengthSnapshot, Direction};

use super::error::{TradingError, TradingResult};
use super::TradingConfig;

/// Market-convention quotations. The reverse of any entry is an inverted quote.
pub const CANONICAL_PAIRS: [&str; 28] = [
    "EURUSD", "GBPUSD", "AUDUSD", "NZDUSD", "USDJPY", "USDCHF", "USDCAD", "EURGBP", "EURJPY",
    "EURCHF", "EURAUD", "EURCAD", "EURNZD", "GBPJPY", "GBPCHF", "GBPAUD", "GBPCAD", "GBPNZD",
    "AUDJPY", "AUDCHF", "AUDCAD", "AUDNZD", "NZDJPY", "NZDCHF", "NZDCAD", "CADJPY", "CADCHF",
    "CHFJPY",
];

/// Canonical form of an inverted quotation, if `pair` is one.
fn inverted_to_canonical(pair: &str) -> Option<&'static str> {
    let (base, quote) = split_pair(pair)?;
    CANONICAL_PAIRS.iter().copied().find(|canonical| {
        split_pair(canonical).map_or(false, |(b, q)| b == quote && q == base)
    })
}

/// Corrects pair quotation and prices new orders.
pub struct CurrencyPairNormalizer {
    symbol_suffix: String,
    entry_strength_threshold: f64,
    entry_pips_per_strength: Decimal,
    max_entry_adjust_pips: Decimal,
}

impl CurrencyPairNormalizer {
    pub fn new(config: &TradingConfig) -> Self {
        Self {
            symbol_suffix: config.symbol_suffix.to_ascii_uppercase(),
            entry_strength_threshold: config.entry_strength_threshold,
            entry_pips_per_strength: config.entry_pips_per_strength,
            max_entry_adjust_pips: config.max_entry_adjust_pips,
        }
    }

    /// Strip separators and broker suffix, upper-case.
    fn clean(&self, raw: &str) -> String {
        let mut cleaned: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, '/' | '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_uppercase();
        if !self.symbol_suffix.is_empty() && cleaned.ends_with(&self.symbol_suffix) {
            cleaned.truncate(cleaned.len() - self.symbol_suffix.len());
        }
        cleaned
    }

    /// Map an inverted quotation to its canonical pair and flip the direction.
    ///
    /// Anything not in the inversion table keeps its direction. The pair always
    /// comes back in symbol form (separators removed, upper-cased, broker suffix
    /// stripped) so it matches price and position symbols.
    pub fn normalize(&self, raw_pair: &str, direction: Direction) -> (String, Direction) {
        let pair = self.clean(raw_pair);
        match inverted_to_canonical(&pair) {
            Some(canonical) => {
                warn!(
                    raw = %raw_pair,
                    canonical = %canonical,
                    from = %direction,
                    to = %direction.flip(),
                    "Inverted quotation corrected"
                );
                (canonical.to_string(), direction.flip())
            }
            None => (pair, direction),
        }
    }

    /// Reference price adjusted toward a better fill when strength favours the trade.
    ///
    /// Live quotes are used only when `at` is the present; otherwise, or when the live
    /// quote is missing, the historical price at `at` is used.
    pub async fn entry_price(
        &self,
        market: &dyn MarketData,
        pair: &str,
        direction: Direction,
        strength: Option<&CurrencyStrengthSnapshot>,
        at: DateTime<Utc>,
        live: bool,
    ) -> TradingResult<Decimal> {
        let live_price = if live { market.live_price(pair).await } else { None };
        let base_price = match live_price {
            Some(p) => p,
            None => market
                .historical_price(pair, at)
                .await
                .ok_or_else(|| TradingError::PriceUnavailable {
                    symbol: pair.to_string(),
                })?,
        };

        let adjustment = strength
            .and_then(|s| {
                let (base, quote) = split_pair(pair)?;
                s.differential(base, quote)
            })
            .map(|diff| self.adjustment(pair, direction, diff))
            .unwrap_or(Decimal::ZERO);

        debug!(
            pair = %pair,
            direction = %direction,
            base_price = %base_price,
            adjustment = %adjustment,
            "Entry price computed"
        );
        Ok(base_price + adjustment)
    }

    /// Signed price adjustment for a base-minus-quote strength differential.
    fn adjustment(&self, pair: &str, direction: Direction, diff: f64) -> Decimal {
        if diff.abs() <= self.entry_strength_threshold {
            return Decimal::ZERO;
        }
        let favourable = match direction {
            Direction::Long => diff > 0.0,
            Direction::Short => diff < 0.0,
        };
        if !favourable {
            return Decimal::ZERO;
        }

        let pips = Decimal::from_f64(diff.abs())
            .map(|d| d * self.entry_pips_per_strength)
            .unwrap_or(self.max_entry_adjust_pips)
            .min(self.max_entry_adjust_pips);

        // Better price: lower for buys, higher for sells.
        -direction.sign() * pips * pip_size(pair)
    }
}
