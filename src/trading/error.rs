//! Trading error types.

use thiserror::Error;

/// Errors raised by the trading core and its collaborators.
#[derive(Debug, Clone, Error)]
pub enum TradingError {
    /// Market data missing for a symbol. Skips that position for the tick.
    #[error("Market data unavailable for {symbol}")]
    DataUnavailable { symbol: String },

    /// Neither a live nor a historical price could be obtained.
    #[error("No price available for {symbol}")]
    PriceUnavailable { symbol: String },

    /// Broker rejected or failed an open/close/list call.
    #[error("Broker error during {operation}: {message}")]
    Broker { operation: String, message: String },

    /// Order was sent but its outcome could not be read back. Never resubmitted;
    /// the next broker sync adopts the position if it was filled.
    #[error("Order outcome unknown during {operation}: {message}")]
    OrderUnconfirmed { operation: String, message: String },

    /// Invalid or missing configuration value.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A protective action could not complete.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// An external call exceeded its timeout.
    #[error("Timed out during {operation}")]
    Timeout { operation: String },

    /// Decision pipeline failed to produce proposals.
    #[error("Decision pipeline error: {0}")]
    Pipeline(String),
}

impl TradingError {
    pub fn broker(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn order_unconfirmed(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::OrderUnconfirmed {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    /// Whether the error must abort the remaining phases of the current tick.
    pub fn is_tick_abort(&self) -> bool {
        matches!(self, TradingError::Timeout { .. })
    }
}

pub type TradingResult<T> = std::result::Result<T, TradingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TradingError::broker("close 42", "market closed");
        assert_eq!(err.to_string(), "Broker error during close 42: market closed");

        let err = TradingError::Configuration("equity_stop_pct must be negative".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: equity_stop_pct must be negative"
        );
    }

    #[test]
    fn test_only_timeouts_abort_ticks() {
        assert!(TradingError::timeout("open").is_tick_abort());
        assert!(!TradingError::broker("open", "requote").is_tick_abort());
        assert!(!TradingError::order_unconfirmed("open", "truncated body").is_tick_abort());
        assert!(!TradingError::DataUnavailable { symbol: "EURUSD".into() }.is_tick_abort());
    }
}
