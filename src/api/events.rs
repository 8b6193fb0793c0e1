//! Structured trading events and fire-and-forget sinks.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{CloseReason, Direction, ReinforcementReason};

/// Which rhythm produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickKind {
    MainCycle,
    Monitoring,
}

/// Domain event emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TradingEvent {
    TickStarted {
        tick_id: Uuid,
        kind: TickKind,
        at: DateTime<Utc>,
    },
    TickAborted {
        tick_id: Uuid,
        kind: TickKind,
        reason: String,
    },
    PositionAdopted {
        ticket: u64,
        symbol: String,
    },
    PositionOpened {
        ticket: u64,
        symbol: String,
        direction: Direction,
        volume: Decimal,
        price: Decimal,
        reinforcement_of: Option<u64>,
    },
    PositionClosed {
        ticket: u64,
        symbol: String,
        reason: CloseReason,
        pnl: Decimal,
    },
    CloseFailed {
        ticket: u64,
        reason: CloseReason,
        error: String,
    },
    EquityStopTriggered {
        drawdown_pct: Decimal,
        equity_value: Decimal,
    },
    ExitSignals {
        currencies: Vec<String>,
        acted: bool,
    },
    ReinforcementOpened {
        origin: u64,
        ticket: u64,
        reason: ReinforcementReason,
        volume: Decimal,
    },
    Halted {
        reason: String,
    },
    HaltCleared,
    CycleSummary {
        cycle: u64,
        equity_value: Decimal,
        realized_pnl: Decimal,
        unrealized_pnl: Decimal,
        open_positions: usize,
    },
}

/// Receiver of trading events. Must never block the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: TradingEvent);
}

/// Writes events to the log as JSON.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: TradingEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "ufo_trader::events", event = %json),
            Err(e) => debug!(error = %e, "Failed to serialize event"),
        }
    }
}

/// Forwards events to a bounded channel, dropping them when it is full.
pub struct ChannelEventSink {
    tx: mpsc::Sender<TradingEvent>,
}

impl ChannelEventSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TradingEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: TradingEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!(error = %e, "Event dropped");
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<TradingEvent>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TradingEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: TradingEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
