//! Data models for positions, portfolio snapshots, currency strength and proposals.

mod position;
mod proposal;
mod snapshot;
mod strength;

pub use position::{pip_size, split_pair, CloseReason, Direction, Position, PositionStatus};
pub use proposal::{ReinforcementPlan, ReinforcementReason, TradeProposal};
pub use snapshot::PortfolioSnapshot;
pub use strength::{CurrencyStrengthSnapshot, RawPriceData, StrengthReading, Trend};
