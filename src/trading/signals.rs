//! Currency strength reversal detection.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info};

use crate::models::{CurrencyStrengthSnapshot, Position, Trend};

/// A currency whose strength trend reversed between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitSignal {
    pub currency: String,
    /// Trend the currency reversed into
    pub direction: Trend,
    /// Change in trend slope, current minus previous
    pub magnitude: f64,
}

/// Compares consecutive strength snapshots.
pub struct UfoSignalComparator {
    noise_threshold: f64,
}

impl UfoSignalComparator {
    pub fn new(noise_threshold: f64) -> Self {
        Self { noise_threshold }
    }

    /// Reversals for every currency present in both snapshots.
    ///
    /// Without a previous snapshot there is no baseline and nothing is emitted.
    pub fn compare(
        &self,
        current: &CurrencyStrengthSnapshot,
        previous: Option<&CurrencyStrengthSnapshot>,
    ) -> Vec<ExitSignal> {
        let Some(previous) = previous else {
            debug!("No previous strength snapshot, skipping reversal check");
            return Vec::new();
        };

        current
            .readings
            .iter()
            .filter_map(|(currency, now)| {
                let before = previous.get(currency)?;
                let was = Trend::classify(before.trend, self.noise_threshold);
                let is = Trend::classify(now.trend, self.noise_threshold);
                if !was.is_opposite(is) {
                    return None;
                }
                debug!(
                    currency = %currency,
                    was = ?was,
                    is = ?is,
                    "Strength trend reversed"
                );
                Some(ExitSignal {
                    currency: currency.clone(),
                    direction: is,
                    magnitude: now.trend - before.trend,
                })
            })
            .collect()
    }
}

/// Distinct currencies named by a batch of signals.
pub fn signalled_currencies(signals: &[ExitSignal]) -> BTreeSet<String> {
    signals.iter().map(|s| s.currency.clone()).collect()
}

/// Tickets of open positions to close for this tick's signals.
///
/// Nothing is closed until the number of distinct signalled currencies reaches
/// `threshold`; then every open position touching one of them is selected.
pub fn positions_to_close<'a>(
    signals: &[ExitSignal],
    threshold: usize,
    positions: impl IntoIterator<Item = &'a Position>,
) -> Vec<u64> {
    let currencies = signalled_currencies(signals);
    if currencies.len() < threshold {
        return Vec::new();
    }

    let tickets: Vec<u64> = positions
        .into_iter()
        .filter(|p| p.is_open())
        .filter(|p| {
            p.currencies().map_or(false, |(base, quote)| {
                currencies.contains(base) || currencies.contains(quote)
            })
        })
        .map(|p| p.id)
        .collect();

    info!(
        currencies = ?currencies,
        affected = tickets.len(),
        "Exit signal threshold reached"
    );
    tickets
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, StrengthReading};
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn snapshot(trends: &[(&str, f64)]) -> CurrencyStrengthSnapshot {
        let readings: BTreeMap<String, StrengthReading> = trends
            .iter()
            .map(|(c, t)| (c.to_string(), StrengthReading { strength: 0.0, trend: *t }))
            .collect();
        CurrencyStrengthSnapshot::new(Utc::now(), readings)
    }

    fn open(id: u64, symbol: &str) -> Position {
        Position::new(id, symbol, Direction::Long, dec!(1), dec!(0.1), Utc::now())
    }

    #[test]
    fn test_first_tick_has_no_signals() {
        let comparator = UfoSignalComparator::new(0.5);
        assert!(comparator.compare(&snapshot(&[("EUR", 2.0)]), None).is_empty());
    }

    #[test]
    fn test_reversal_beyond_noise_emits_signal() {
        let comparator = UfoSignalComparator::new(0.5);
        let previous = snapshot(&[("EUR", 1.2), ("USD", -0.9), ("JPY", 0.3), ("GBP", 1.0)]);
        let current = snapshot(&[("EUR", -0.8), ("USD", 1.1), ("JPY", -0.9), ("CHF", -3.0)]);

        let signals = comparator.compare(&current, Some(&previous));
        let currencies: Vec<_> = signals.iter().map(|s| s.currency.as_str()).collect();

        // JPY was flat, CHF and GBP are not in both snapshots
        assert_eq!(currencies, vec!["EUR", "USD"]);
        let eur = &signals[0];
        assert_eq!(eur.direction, Trend::Weakening);
        assert!((eur.magnitude - (-2.0)).abs() < 1e-9);
    }

    #[test]
    fn test_aggregation_threshold() {
        let positions = vec![open(1, "EURUSD"), open(2, "GBPJPY"), open(3, "AUDNZD"), open(4, "NZDCAD")];
        let two = vec![
            ExitSignal { currency: "EUR".into(), direction: Trend::Weakening, magnitude: -2.0 },
            ExitSignal { currency: "JPY".into(), direction: Trend::Strengthening, magnitude: 2.0 },
        ];
        assert!(positions_to_close(&two, 3, &positions).is_empty());

        let mut three = two.clone();
        three.push(ExitSignal { currency: "CAD".into(), direction: Trend::Weakening, magnitude: -1.5 });
        assert_eq!(positions_to_close(&three, 3, &positions), vec![1, 2, 4]);
    }

    #[test]
    fn test_duplicate_currency_counts_once() {
        let positions = vec![open(1, "EURUSD")];
        let signals = vec![
            ExitSignal { currency: "EUR".into(), direction: Trend::Weakening, magnitude: -2.0 },
            ExitSignal { currency: "EUR".into(), direction: Trend::Weakening, magnitude: -2.5 },
            ExitSignal { currency: "USD".into(), direction: Trend::Strengthening, magnitude: 1.0 },
        ];
        assert!(positions_to_close(&signals, 3, &positions).is_empty());
    }
}
