//! Compensating trades for adverse positions.
//!
//! A reinforcement is opened in the same direction as the original position and
//! sized so the blended entry moves part of the way toward the current price.
//! The share of the gap closed comes from the base/quote strength differential.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use tracing::{debug, info};

use crate::models::{
    CurrencyStrengthSnapshot, Direction, Position, ReinforcementPlan, ReinforcementReason,
};

use super::TradingConfig;

/// What prompted a reinforcement check.
#[derive(Debug, Clone, Copy)]
pub enum MarketEvent<'a> {
    /// Monitoring tick saw P&L drop at `pnl_drop_per_minute`.
    RapidAdverseMove {
        pnl_drop_per_minute: Decimal,
        strength: Option<&'a CurrencyStrengthSnapshot>,
    },
    /// Main cycle strength analysis.
    StrengthAnalysis { strength: &'a CurrencyStrengthSnapshot },
}

/// P&L lost per minute between two observations; `None` if no time passed.
pub fn pnl_drop_rate(
    previous: (DateTime<Utc>, Decimal),
    current: (DateTime<Utc>, Decimal),
) -> Option<Decimal> {
    let millis = (current.0 - previous.0).num_milliseconds();
    if millis <= 0 {
        return None;
    }
    let minutes = Decimal::from(millis) / Decimal::from(60_000);
    Some((previous.1 - current.1) / minutes)
}

/// Decides and sizes reinforcement trades.
pub struct ReinforcementPlanner {
    rapid_move_threshold: Decimal,
    min_drawdown: Decimal,
    min_strength_differential: f64,
    compensation_per_strength: f64,
    min_fraction: f64,
    max_fraction: f64,
    max_volume_ratio: Decimal,
    volume_step: Decimal,
}

impl ReinforcementPlanner {
    pub fn new(config: &TradingConfig) -> Self {
        Self {
            rapid_move_threshold: config.rapid_move_threshold_per_minute,
            min_drawdown: config.reinforcement_min_drawdown_abs,
            min_strength_differential: config.min_strength_differential,
            compensation_per_strength: config.compensation_per_strength,
            min_fraction: config.min_compensation_fraction,
            max_fraction: config.max_compensation_fraction,
            max_volume_ratio: config.max_reinforcement_volume_ratio,
            volume_step: config.volume_step,
        }
    }

    /// Propose a reinforcement for `position`, or `None`.
    ///
    /// `active_origins` holds tickets that already have an open reinforcement;
    /// those are never reinforced again until it closes.
    pub fn plan(
        &self,
        position: &Position,
        current_price: Decimal,
        event: MarketEvent<'_>,
        active_origins: &BTreeSet<u64>,
    ) -> Option<ReinforcementPlan> {
        if !position.is_open() || position.is_reinforcement() {
            return None;
        }
        if active_origins.contains(&position.id) {
            debug!(ticket = position.id, "Reinforcement already open, suppressed");
            return None;
        }
        if position.current_pnl >= Decimal::ZERO || position.pnl_at(current_price) >= Decimal::ZERO {
            return None;
        }

        let favour = |strength: &CurrencyStrengthSnapshot| -> Option<f64> {
            let (base, quote) = position.currencies()?;
            let diff = strength.differential(base, quote)?;
            Some(match position.direction {
                Direction::Long => diff,
                Direction::Short => -diff,
            })
        };

        let (fraction, reason) = match event {
            MarketEvent::RapidAdverseMove {
                pnl_drop_per_minute,
                strength,
            } => {
                if pnl_drop_per_minute < self.rapid_move_threshold {
                    return None;
                }
                match strength.and_then(favour) {
                    // Structure has turned against the trade: do not average down.
                    Some(f) if f <= -self.min_strength_differential => return None,
                    Some(f) if f > 0.0 => (self.fraction_for(f), ReinforcementReason::RapidAdverseMove),
                    _ => (self.min_fraction, ReinforcementReason::RapidAdverseMove),
                }
            }
            MarketEvent::StrengthAnalysis { strength } => {
                if position.current_pnl > -self.min_drawdown {
                    return None;
                }
                let f = favour(strength)?;
                if f < self.min_strength_differential {
                    return None;
                }
                (self.fraction_for(f), ReinforcementReason::StructuralFavor)
            }
        };

        let fraction = Decimal::from_f64(fraction)?;
        let gap = position.entry_price - current_price;
        let compensation_price = position.entry_price - gap * fraction;

        // Blended entry (V0*E + v*P) / (V0 + v) = E - f*(E - P)  =>  v = V0 * f / (1 - f)
        let raw_volume = position.volume * fraction / (Decimal::ONE - fraction);
        let capped = raw_volume.min(position.volume * self.max_volume_ratio);
        let new_volume = (capped / self.volume_step)
            .round_dp_with_strategy(0, RoundingStrategy::ToZero)
            * self.volume_step;
        if new_volume < self.volume_step {
            return None;
        }

        info!(
            ticket = position.id,
            symbol = %position.symbol,
            reason = reason.as_str(),
            volume = %new_volume,
            compensation_price = %compensation_price,
            "Reinforcement planned"
        );

        Some(ReinforcementPlan {
            target_position_id: position.id,
            symbol: position.symbol.clone(),
            new_direction: position.direction,
            new_volume,
            compensation_price,
            reason,
        })
    }

    /// Share of the entry/price gap to compensate for a favouring differential.
    fn fraction_for(&self, favouring_diff: f64) -> f64 {
        (favouring_diff * self.compensation_per_strength).clamp(self.min_fraction, self.max_fraction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StrengthReading;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;

    fn strength(eur: f64, usd: f64) -> CurrencyStrengthSnapshot {
        let mut readings = BTreeMap::new();
        readings.insert("EUR".to_string(), StrengthReading { strength: eur, trend: 0.0 });
        readings.insert("USD".to_string(), StrengthReading { strength: usd, trend: 0.0 });
        CurrencyStrengthSnapshot::new(Utc::now(), readings)
    }

    /// Long 1 lot EURUSD from 1.1000, valued at 1.0970 (P&L -30).
    fn adverse_long() -> (Position, Decimal) {
        let mut pos = Position::new(5, "EURUSD", Direction::Long, dec!(1.1000), dec!(1), Utc::now());
        let price = dec!(1.0970);
        let pnl = pos.pnl_at(price);
        pos.observe(pnl, Utc::now());
        (pos, price)
    }

    fn planner() -> ReinforcementPlanner {
        ReinforcementPlanner::new(&TradingConfig::default())
    }

    #[test]
    fn test_structural_plan_sizes_toward_compensation_price() {
        let (pos, price) = adverse_long();
        let snap = strength(5.0, 1.0); // diff 4.0 -> fraction 0.4

        let plan = planner()
            .plan(&pos, price, MarketEvent::StrengthAnalysis { strength: &snap }, &BTreeSet::new())
            .unwrap();

        assert_eq!(plan.new_direction, Direction::Long);
        assert_eq!(plan.reason, ReinforcementReason::StructuralFavor);
        assert_eq!(plan.compensation_price, dec!(1.0988));
        // 1 * 0.4 / 0.6 = 0.666.. -> 0.66 lots
        assert_eq!(plan.new_volume, dec!(0.66));
    }

    #[test]
    fn test_structural_requires_favouring_strength() {
        let (pos, price) = adverse_long();
        let against = strength(1.0, 5.0);
        assert!(planner()
            .plan(&pos, price, MarketEvent::StrengthAnalysis { strength: &against }, &BTreeSet::new())
            .is_none());
    }

    #[test]
    fn test_second_trigger_suppressed_while_reinforcement_open() {
        let (pos, price) = adverse_long();
        let snap = strength(5.0, 1.0);
        let mut active = BTreeSet::new();
        active.insert(pos.id);

        assert!(planner()
            .plan(&pos, price, MarketEvent::StrengthAnalysis { strength: &snap }, &active)
            .is_none());
        let rapid = MarketEvent::RapidAdverseMove { pnl_drop_per_minute: dec!(50), strength: None };
        assert!(planner().plan(&pos, price, rapid, &active).is_none());
    }

    #[test]
    fn test_rapid_move_below_threshold_ignored() {
        let (pos, price) = adverse_long();
        let slow = MarketEvent::RapidAdverseMove { pnl_drop_per_minute: dec!(1), strength: None };
        assert!(planner().plan(&pos, price, slow, &BTreeSet::new()).is_none());

        let fast = MarketEvent::RapidAdverseMove { pnl_drop_per_minute: dec!(6), strength: None };
        let plan = planner().plan(&pos, price, fast, &BTreeSet::new()).unwrap();
        assert_eq!(plan.reason, ReinforcementReason::RapidAdverseMove);
        // min fraction 0.2: 1 * 0.2 / 0.8 = 0.25
        assert_eq!(plan.new_volume, dec!(0.25));
    }

    #[test]
    fn test_profitable_position_never_reinforced() {
        let mut pos = Position::new(6, "EURUSD", Direction::Long, dec!(1.1000), dec!(1), Utc::now());
        pos.observe(dec!(10), Utc::now());
        let snap = strength(5.0, 1.0);
        assert!(planner()
            .plan(&pos, dec!(1.1010), MarketEvent::StrengthAnalysis { strength: &snap }, &BTreeSet::new())
            .is_none());
    }

    #[test]
    fn test_reinforcement_itself_not_reinforced() {
        let (pos, price) = adverse_long();
        let pos = pos.with_reinforcement_of(1);
        let fast = MarketEvent::RapidAdverseMove { pnl_drop_per_minute: dec!(60), strength: None };
        assert!(planner().plan(&pos, price, fast, &BTreeSet::new()).is_none());
    }

    #[test]
    fn test_drop_rate() {
        let t0 = Utc::now();
        let rate = pnl_drop_rate((t0, dec!(10)), (t0 + Duration::minutes(5), dec!(-15))).unwrap();
        assert_eq!(rate, dec!(5));
        assert!(pnl_drop_rate((t0, dec!(10)), (t0, dec!(0))).is_none());
    }
}
