//! Historical replay: the live orchestrator driven by a simulated clock.
//!
//! Features:
//! - Frames of prices, strength readings and recorded proposals loaded from JSON
//! - Paper broker filling at the requested price
//! - Main cycle and monitoring tick fired on simulated time
//! - Session statistics at the end of the run

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use crate::api::{
    BrokerGateway, Clock, DecisionContext, DecisionPipeline, EventSink, MarketData, ReplayClock,
    StrengthCalculator,
};
use crate::bot::{Collaborators, CycleOrchestrator, TickOutcome};
use crate::db::Database;
use crate::metrics::SessionSummary;
use crate::models::{
    CurrencyStrengthSnapshot, Direction, Position, RawPriceData, StrengthReading, TradeProposal,
};
use crate::trading::{TradingConfig, TradingError, TradingResult};

/// One recorded instant.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayFrame {
    pub timestamp: DateTime<Utc>,

    /// Mid prices by canonical pair
    #[serde(default)]
    pub prices: BTreeMap<String, Decimal>,

    /// Strength readings the calculator produced at this instant
    #[serde(default)]
    pub strength: Option<BTreeMap<String, StrengthReading>>,

    /// Trade proposals the decision pipeline made at this instant
    #[serde(default)]
    pub proposals: Vec<TradeProposal>,

    /// Tickets the decision pipeline asked to close
    #[serde(default)]
    pub closures: Vec<u64>,
}

/// Time-ordered frames.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayData {
    pub frames: Vec<ReplayFrame>,
}

impl ReplayData {
    pub fn new(mut frames: Vec<ReplayFrame>) -> Self {
        frames.sort_by_key(|f| f.timestamp);
        Self { frames }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay data {}", path.display()))?;
        let data: ReplayData = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse replay data {}", path.display()))?;
        Ok(Self::new(data.frames))
    }

    /// Index of the latest frame at or before `at`.
    fn index_at(&self, at: DateTime<Utc>) -> Option<usize> {
        let after = self.frames.partition_point(|f| f.timestamp <= at);
        after.checked_sub(1)
    }

    fn frame_at(&self, at: DateTime<Utc>) -> Option<&ReplayFrame> {
        self.index_at(at).map(|i| &self.frames[i])
    }
}

// ============== Replay collaborators ==============

/// Prices as recorded; there is no live quote in a replay.
pub struct ReplayMarketData {
    data: Arc<ReplayData>,
}

impl ReplayMarketData {
    pub fn new(data: Arc<ReplayData>) -> Self {
        Self { data }
    }
}

#[async_trait]
impl MarketData for ReplayMarketData {
    async fn live_price(&self, _symbol: &str) -> Option<Decimal> {
        None
    }

    async fn historical_price(&self, symbol: &str, at: DateTime<Utc>) -> Option<Decimal> {
        let last = self.data.index_at(at)?;
        self.data.frames[..=last]
            .iter()
            .rev()
            .find_map(|f| f.prices.get(symbol).copied())
    }
}

/// Strength readings as recorded.
pub struct ReplayStrengthCalculator {
    data: Arc<ReplayData>,
}

impl ReplayStrengthCalculator {
    pub fn new(data: Arc<ReplayData>) -> Self {
        Self { data }
    }
}

#[async_trait]
impl StrengthCalculator for ReplayStrengthCalculator {
    async fn snapshot(&self, raw: &RawPriceData) -> TradingResult<CurrencyStrengthSnapshot> {
        let frame = self.data.frame_at(raw.timestamp);
        match frame.and_then(|f| f.strength.clone().map(|r| (f.timestamp, r))) {
            Some((timestamp, readings)) => Ok(CurrencyStrengthSnapshot::new(timestamp, readings)),
            None => Err(TradingError::DataUnavailable {
                symbol: "strength".to_string(),
            }),
        }
    }
}

/// Recorded proposals, each frame's handed out once.
pub struct ReplayDecisionPipeline {
    data: Arc<ReplayData>,
    trades_used: Mutex<BTreeSet<usize>>,
    closures_used: Mutex<BTreeSet<usize>>,
}

impl ReplayDecisionPipeline {
    pub fn new(data: Arc<ReplayData>) -> Self {
        Self {
            data,
            trades_used: Mutex::new(BTreeSet::new()),
            closures_used: Mutex::new(BTreeSet::new()),
        }
    }

    fn claim(&self, used: &Mutex<BTreeSet<usize>>, at: DateTime<Utc>) -> Option<usize> {
        let index = self.data.index_at(at)?;
        let mut used = used.lock().ok()?;
        used.insert(index).then_some(index)
    }
}

#[async_trait]
impl DecisionPipeline for ReplayDecisionPipeline {
    async fn propose_trades(&self, context: &DecisionContext) -> TradingResult<Vec<TradeProposal>> {
        Ok(self
            .claim(&self.trades_used, context.timestamp)
            .map(|i| self.data.frames[i].proposals.clone())
            .unwrap_or_default())
    }

    async fn propose_closures(&self, context: &DecisionContext) -> TradingResult<Vec<u64>> {
        Ok(self
            .claim(&self.closures_used, context.timestamp)
            .map(|i| self.data.frames[i].closures.clone())
            .unwrap_or_default())
    }
}

/// In-memory broker that fills every order at the requested price.
pub struct PaperBroker {
    clock: Arc<dyn Clock>,
    positions: Mutex<BTreeMap<u64, Position>>,
    next_ticket: AtomicU64,
}

impl PaperBroker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            positions: Mutex::new(BTreeMap::new()),
            next_ticket: AtomicU64::new(1),
        }
    }

    fn book(&self) -> TradingResult<std::sync::MutexGuard<'_, BTreeMap<u64, Position>>> {
        self.positions
            .lock()
            .map_err(|_| TradingError::broker("paper book", "lock poisoned"))
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    async fn open_position(
        &self,
        symbol: &str,
        direction: Direction,
        volume: Decimal,
        price: Decimal,
    ) -> TradingResult<u64> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let position = Position::new(ticket, symbol, direction, price, volume, self.clock.now());
        self.book()?.insert(ticket, position);
        debug!(ticket, symbol, price = %price, "Paper fill");
        Ok(ticket)
    }

    async fn close_position(&self, ticket: u64) -> TradingResult<()> {
        match self.book()?.remove(&ticket) {
            Some(_) => Ok(()),
            None => Err(TradingError::broker(
                format!("close {}", ticket),
                "unknown ticket",
            )),
        }
    }

    async fn list_open_positions(&self) -> TradingResult<Vec<Position>> {
        Ok(self.book()?.values().cloned().collect())
    }
}

// ============== Replay driver ==============

/// Replay run summary.
#[derive(Debug, Clone)]
pub struct ReplayReport {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub frames: usize,
    pub main_cycles: usize,
    pub monitoring_ticks: usize,
    pub aborted_ticks: usize,
    pub equity_stops: usize,
    pub summary: SessionSummary,
}

impl std::fmt::Display for ReplayReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = &self.summary;
        writeln!(f, "\n{:=^60}", " REPLAY RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "Period: {} to {}",
            self.start_time.format("%Y-%m-%d %H:%M"),
            self.end_time.format("%Y-%m-%d %H:%M"))?;
        writeln!(f, "Frames: {}  Main cycles: {}  Monitoring ticks: {}",
            self.frames, self.main_cycles, self.monitoring_ticks)?;
        writeln!(f, "Aborted ticks: {}  Equity stops: {}", self.aborted_ticks, self.equity_stops)?;
        writeln!(f)?;
        writeln!(f, "--- Equity ---")?;
        writeln!(f, "Final:       {:.2}", s.equity_value)?;
        writeln!(f, "Realized:    {:.2}", s.realized_pnl)?;
        writeln!(f, "Unrealized:  {:.2} ({} open)", s.unrealized_pnl, s.open_positions)?;
        writeln!(f, "Max DD:      {:.2} ({:.2}%)", s.max_drawdown, s.max_drawdown_pct * 100.0)?;
        writeln!(f)?;
        writeln!(f, "--- Trades ---")?;
        writeln!(f, "Closed:      {} ({:.1}% winners)", s.closed_trades, s.win_rate * 100.0)?;
        writeln!(f, "Mean P&L:    {:.2} (std {:.2})", s.mean_pnl, s.pnl_std_dev)?;
        for (reason, count) in &s.closes_by_reason {
            writeln!(f, "  {:<16} {}", reason.as_str(), count)?;
        }
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// Drives a [`CycleOrchestrator`] over recorded frames.
pub struct Replayer {
    config: TradingConfig,
    data: Arc<ReplayData>,
}

impl Replayer {
    pub fn new(config: TradingConfig, data: ReplayData) -> Self {
        Self {
            config,
            data: Arc::new(data),
        }
    }

    pub async fn run(&self, events: Arc<dyn EventSink>, db: Option<Database>) -> Result<ReplayReport> {
        let (Some(first), Some(last)) = (self.data.frames.first(), self.data.frames.last()) else {
            anyhow::bail!("Replay data has no frames");
        };
        let (start_time, end_time) = (first.timestamp, last.timestamp);

        let clock = ReplayClock::new(start_time);
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let services = Collaborators {
            market: Arc::new(ReplayMarketData::new(self.data.clone())),
            strength: Arc::new(ReplayStrengthCalculator::new(self.data.clone())),
            pipeline: Arc::new(ReplayDecisionPipeline::new(self.data.clone())),
            broker: Arc::new(PaperBroker::new(shared_clock.clone())),
            clock: shared_clock,
            events,
        };

        let mut orchestrator = CycleOrchestrator::new(self.config.clone(), services)?;
        if let Some(db) = db {
            orchestrator = orchestrator.with_database(db);
        }

        info!(
            frames = self.data.frames.len(),
            start = %start_time,
            end = %end_time,
            "Starting replay"
        );

        let main_period = Duration::minutes(self.config.main_cycle_period_minutes as i64);
        let monitoring_period = Duration::minutes(self.config.monitoring_period_minutes as i64);
        let mut next_main = start_time;
        let mut next_monitoring = start_time + monitoring_period;

        let mut report = ReplayReport {
            start_time,
            end_time,
            frames: self.data.frames.len(),
            main_cycles: 0,
            monitoring_ticks: 0,
            aborted_ticks: 0,
            equity_stops: 0,
            summary: SessionSummary::default(),
        };

        for frame in &self.data.frames {
            let now = frame.timestamp;
            clock.advance_to(now);

            let outcome = if now >= next_main {
                while next_main <= now {
                    next_main += main_period;
                }
                next_monitoring = now + monitoring_period;
                report.main_cycles += 1;
                orchestrator.run_main_cycle().await
            } else if now >= next_monitoring {
                while next_monitoring <= now {
                    next_monitoring += monitoring_period;
                }
                report.monitoring_ticks += 1;
                orchestrator.run_monitoring_tick().await
            } else {
                continue;
            };

            match outcome {
                TickOutcome::Aborted(_) => report.aborted_ticks += 1,
                TickOutcome::EquityStop => report.equity_stops += 1,
                _ => {}
            }
        }

        report.summary = orchestrator.summary().await;
        info!(
            main_cycles = report.main_cycles,
            monitoring_ticks = report.monitoring_ticks,
            equity = %report.summary.equity_value,
            "Replay complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RecordingEventSink;
    use crate::models::CloseReason;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn frame(minute: i64, price: Decimal) -> ReplayFrame {
        let mut prices = BTreeMap::new();
        prices.insert("EURUSD".to_string(), price);
        ReplayFrame {
            timestamp: Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap() + Duration::minutes(minute),
            prices,
            strength: None,
            proposals: Vec::new(),
            closures: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_market_data_uses_latest_frame_at_or_before() {
        let data = Arc::new(ReplayData::new(vec![frame(0, dec!(1.1000)), frame(5, dec!(1.1010))]));
        let market = ReplayMarketData::new(data.clone());
        let t0 = data.frames[0].timestamp;

        assert_eq!(market.historical_price("EURUSD", t0 + Duration::minutes(3)).await, Some(dec!(1.1000)));
        assert_eq!(market.historical_price("EURUSD", t0 + Duration::minutes(9)).await, Some(dec!(1.1010)));
        assert_eq!(market.historical_price("EURUSD", t0 - Duration::minutes(1)).await, None);
        assert_eq!(market.live_price("EURUSD").await, None);
    }

    #[tokio::test]
    async fn test_replay_hits_stop_loss_on_monitoring_tick() {
        let mut opening = frame(0, dec!(1.1000));
        opening.proposals.push(TradeProposal {
            symbol: "EURUSD".into(),
            direction: Direction::Long,
            size: dec!(1),
        });
        let data = ReplayData::new(vec![
            opening,
            frame(5, dec!(1.0990)),
            frame(10, dec!(1.0970)),
            frame(15, dec!(1.0940)),
        ]);
        let config = TradingConfig {
            symbols: vec!["EURUSD".to_string()],
            reinforcement_enabled: false,
            ..TradingConfig::default()
        };

        let events = RecordingEventSink::new();
        let report = Replayer::new(config, data)
            .run(Arc::new(events.clone()), None)
            .await
            .unwrap();

        assert_eq!(report.main_cycles, 1);
        assert_eq!(report.monitoring_ticks, 3);
        assert_eq!(report.summary.realized_pnl, dec!(-60));
        assert_eq!(report.summary.closes_by_reason.get(&CloseReason::StopLoss), Some(&1));
        assert_eq!(report.summary.open_positions, 0);
    }

    #[tokio::test]
    async fn test_pipeline_proposals_handed_out_once() {
        let mut opening = frame(0, dec!(1.1000));
        opening.closures.push(9);
        let data = Arc::new(ReplayData::new(vec![opening]));
        let pipeline = ReplayDecisionPipeline::new(data.clone());
        let context = DecisionContext {
            timestamp: data.frames[0].timestamp,
            cycle: 1,
            open_positions: Vec::new(),
            strength: None,
            equity_value: dec!(10000),
        };

        assert_eq!(pipeline.propose_closures(&context).await.unwrap(), vec![9]);
        assert!(pipeline.propose_closures(&context).await.unwrap().is_empty());
    }
}
