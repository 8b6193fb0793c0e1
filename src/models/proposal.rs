//! Trade proposals and reinforcement plans.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;

/// New trade suggested by the external decision pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeProposal {
    pub symbol: String,
    pub direction: Direction,
    /// Lots
    pub size: Decimal,
}

/// What prompted a reinforcement plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReinforcementReason {
    /// P&L fell faster than the configured per-minute rate
    RapidAdverseMove,
    /// Strength still favours the original direction despite drawdown
    StructuralFavor,
}

impl ReinforcementReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReinforcementReason::RapidAdverseMove => "rapid_adverse_move",
            ReinforcementReason::StructuralFavor => "structural_favor",
        }
    }
}

/// Compensating trade proposed for an adverse position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReinforcementPlan {
    pub target_position_id: u64,
    pub symbol: String,
    pub new_direction: Direction,
    pub new_volume: Decimal,
    /// Blended entry price the reinforcement aims for
    pub compensation_price: Decimal,
    pub reason: ReinforcementReason,
}
