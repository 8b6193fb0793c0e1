//! Collaborator boundaries: market data, strength, decisions, broker, clock, events.

mod bridge_client;
mod clock;
mod decision_client;
mod events;
mod traits;
mod types;

pub use bridge_client::BridgeClient;
pub use clock::{ReplayClock, SystemClock};
pub use decision_client::HttpDecisionPipeline;
pub use events::{ChannelEventSink, EventSink, RecordingEventSink, TickKind, TracingEventSink, TradingEvent};
pub use traits::{BrokerGateway, Clock, DecisionContext, DecisionPipeline, MarketData, StrengthCalculator};
