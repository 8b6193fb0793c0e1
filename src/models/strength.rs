//! Currency strength snapshots produced by the external strength calculator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Strength metric and trend slope for one currency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrengthReading {
    /// Relative strength level
    pub strength: f64,

    /// Signed trend: positive when strengthening, negative when weakening
    pub trend: f64,
}

/// Trend classification after applying a noise band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Strengthening,
    Weakening,
    Flat,
}

impl Trend {
    pub fn classify(slope: f64, noise: f64) -> Self {
        if slope > noise {
            Trend::Strengthening
        } else if slope < -noise {
            Trend::Weakening
        } else {
            Trend::Flat
        }
    }

    pub fn is_opposite(&self, other: Trend) -> bool {
        matches!(
            (self, other),
            (Trend::Strengthening, Trend::Weakening) | (Trend::Weakening, Trend::Strengthening)
        )
    }
}

/// Per-currency strength at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrencyStrengthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub readings: BTreeMap<String, StrengthReading>,
}

impl CurrencyStrengthSnapshot {
    pub fn new(timestamp: DateTime<Utc>, readings: BTreeMap<String, StrengthReading>) -> Self {
        Self { timestamp, readings }
    }

    pub fn get(&self, currency: &str) -> Option<&StrengthReading> {
        self.readings.get(currency)
    }

    /// Base minus quote strength, if both currencies are present.
    pub fn differential(&self, base: &str, quote: &str) -> Option<f64> {
        let base = self.readings.get(base)?;
        let quote = self.readings.get(quote)?;
        Some(base.strength - quote.strength)
    }
}

/// Latest prices handed to the strength calculator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPriceData {
    pub timestamp: DateTime<Utc>,
    pub prices: BTreeMap<String, Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trend_classification() {
        assert_eq!(Trend::classify(0.8, 0.5), Trend::Strengthening);
        assert_eq!(Trend::classify(-0.8, 0.5), Trend::Weakening);
        assert_eq!(Trend::classify(0.3, 0.5), Trend::Flat);
        assert!(Trend::Strengthening.is_opposite(Trend::Weakening));
        assert!(!Trend::Flat.is_opposite(Trend::Weakening));
    }

    #[test]
    fn test_differential() {
        let mut readings = BTreeMap::new();
        readings.insert("EUR".to_string(), StrengthReading { strength: 3.0, trend: 0.1 });
        readings.insert("USD".to_string(), StrengthReading { strength: -1.5, trend: 0.0 });
        let snap = CurrencyStrengthSnapshot::new(Utc::now(), readings);

        assert_eq!(snap.differential("EUR", "USD"), Some(4.5));
        assert_eq!(snap.differential("EUR", "JPY"), None);
    }
}
