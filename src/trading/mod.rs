//! Trading core: risk, position lifecycle, exit signals, reinforcement, pair normalization.

mod config;
mod context;
mod error;
mod lifecycle;
mod normalizer;
mod reinforcement;
mod retry;
mod risk;
mod signals;

pub use config::TradingConfig;
pub use context::{HaltState, TradingContext};
pub use error::{TradingError, TradingResult};
pub use lifecycle::{CloseDecision, PositionLifecycleManager};
pub use normalizer::CurrencyPairNormalizer;
pub use reinforcement::{pnl_drop_rate, MarketEvent, ReinforcementPlanner};
pub use retry::{with_retry, RetryPolicy};
pub use risk::PortfolioRiskEngine;
pub use signals::{positions_to_close, signalled_currencies, UfoSignalComparator};
