//! Cycle orchestrator: the main cycle and the monitoring tick over one trading context.
//!
//! Main cycle phases:
//! 1. Session check (optionally close everything at session end)
//! 2. Broker sync
//! 3. Valuation and equity stop (a breach mass-closes and ends the tick)
//! 4. Outstanding equity-stop closures while halted
//! 5. Lifecycle closes
//! 6. Strength analysis and exit signals
//! 7. Structural reinforcement
//! 8. Decision pipeline closures and trades
//! 9. Summary and persistence
//!
//! The monitoring tick runs 2-5, then rapid-move reinforcement. It is skipped
//! while a main cycle holds the run token.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Timelike, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{
    BrokerGateway, Clock, DecisionContext, DecisionPipeline, EventSink, MarketData,
    StrengthCalculator, TickKind, TradingEvent,
};
use crate::db::Database;
use crate::metrics::{SessionSummary, SummaryCalculator};
use crate::models::{CloseReason, CurrencyStrengthSnapshot, Direction, Position, RawPriceData, ReinforcementPlan};
use crate::trading::{
    pnl_drop_rate, positions_to_close, signalled_currencies, with_retry, CloseDecision,
    CurrencyPairNormalizer, HaltState, MarketEvent, PortfolioRiskEngine, PositionLifecycleManager,
    ReinforcementPlanner, RetryPolicy, TradingConfig, TradingContext, TradingError, TradingResult,
    UfoSignalComparator,
};

/// External services the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub market: Arc<dyn MarketData>,
    pub strength: Arc<dyn StrengthCalculator>,
    pub pipeline: Arc<dyn DecisionPipeline>,
    pub broker: Arc<dyn BrokerGateway>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn EventSink>,
}

/// How a tick ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Completed,
    /// Another tick held the run token
    Skipped,
    OutsideSession,
    /// Equity stop fired; later phases did not run
    EquityStop,
    /// A timeout or failed broker sync cut the tick short
    Aborted(String),
}

/// Per-tick valuation of one open position.
#[derive(Debug, Clone)]
struct Valuation {
    price: Decimal,
    decision: Option<CloseDecision>,
    drop_rate: Option<Decimal>,
}

/// Top-level state machine.
pub struct CycleOrchestrator {
    config: TradingConfig,
    services: Collaborators,
    db: Option<Database>,

    risk: PortfolioRiskEngine,
    lifecycle: PositionLifecycleManager,
    comparator: UfoSignalComparator,
    planner: ReinforcementPlanner,
    normalizer: CurrencyPairNormalizer,
    retry: RetryPolicy,

    // Holding the guard is holding the run token.
    state: Mutex<TradingContext>,
}

impl CycleOrchestrator {
    /// Build an orchestrator. Invalid configuration is rejected here, before any tick.
    pub fn new(config: TradingConfig, services: Collaborators) -> TradingResult<Self> {
        config.validate()?;
        let lifecycle = PositionLifecycleManager::new(&config);

        info!(
            trailing = lifecycle.trailing_name(),
            equity_stop_pct = %config.equity_stop_pct,
            main_minutes = config.main_cycle_period_minutes,
            monitoring_minutes = config.monitoring_period_minutes,
            "Orchestrator configured"
        );

        Ok(Self {
            risk: PortfolioRiskEngine::new(config.equity_stop_pct),
            lifecycle,
            comparator: UfoSignalComparator::new(config.exit_signal_noise_threshold),
            planner: ReinforcementPlanner::new(&config),
            normalizer: CurrencyPairNormalizer::new(&config),
            retry: RetryPolicy::new(
                config.broker_max_attempts,
                std::time::Duration::from_millis(config.broker_retry_initial_ms),
                config.call_timeout(),
            ),
            state: Mutex::new(TradingContext::new(config.initial_balance)),
            db: None,
            services,
            config,
        })
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    /// Take the run token. No tick can start while the guard is held.
    #[cfg(test)]
    pub async fn lock_context(&self) -> tokio::sync::MutexGuard<'_, TradingContext> {
        self.state.lock().await
    }

    pub async fn summary(&self) -> SessionSummary {
        let ctx = self.state.lock().await;
        SummaryCalculator::calculate(&ctx, self.services.clock.now())
    }

    fn emit(&self, event: TradingEvent) {
        self.services.events.emit(event);
    }

    // ==================== Ticks ====================

    /// Full main cycle. Waits for the run token if a monitoring tick holds it.
    pub async fn run_main_cycle(&self) -> TickOutcome {
        let mut ctx = self.state.lock().await;
        let now = self.services.clock.now();
        ctx.cycle_count += 1;

        let tick_id = Uuid::new_v4();
        self.emit(TradingEvent::TickStarted {
            tick_id,
            kind: TickKind::MainCycle,
            at: now,
        });
        info!(cycle = ctx.cycle_count, at = %now, "Main cycle");

        let outcome = match self.main_cycle(&mut ctx, now).await {
            Ok(outcome) => outcome,
            Err(e) => self.abort(tick_id, TickKind::MainCycle, e),
        };
        self.persist(&ctx, now).await;
        outcome
    }

    /// Risk, lifecycle and rapid-move reinforcement. Skipped if the run token is taken.
    pub async fn run_monitoring_tick(&self) -> TickOutcome {
        let Ok(mut ctx) = self.state.try_lock() else {
            debug!("Main cycle in flight, monitoring tick skipped");
            return TickOutcome::Skipped;
        };
        let now = self.services.clock.now();

        let tick_id = Uuid::new_v4();
        self.emit(TradingEvent::TickStarted {
            tick_id,
            kind: TickKind::Monitoring,
            at: now,
        });
        debug!(at = %now, "Monitoring tick");

        let outcome = match self.monitoring_tick(&mut ctx, now).await {
            Ok(outcome) => outcome,
            Err(e) => self.abort(tick_id, TickKind::Monitoring, e),
        };
        self.persist(&ctx, now).await;
        outcome
    }

    fn abort(&self, tick_id: Uuid, kind: TickKind, e: TradingError) -> TickOutcome {
        warn!(kind = ?kind, error = %e, "Tick aborted, remaining phases skipped");
        self.emit(TradingEvent::TickAborted {
            tick_id,
            kind,
            reason: e.to_string(),
        });
        TickOutcome::Aborted(e.to_string())
    }

    async fn main_cycle(&self, ctx: &mut TradingContext, now: DateTime<Utc>) -> TradingResult<TickOutcome> {
        // 1. Session
        if !self.in_session(now) {
            if self.config.close_at_session_end {
                self.sync_positions(ctx, now).await?;
                if ctx.open_count() > 0 {
                    self.value_positions(ctx, now).await;
                    info!(open = ctx.open_count(), "Session over, closing all positions");
                    self.close_all(ctx, CloseReason::SessionEnd, now).await;
                }
            }
            debug!(hour = now.hour(), "Outside trading session");
            return Ok(TickOutcome::OutsideSession);
        }

        // 2-5. Sync, valuation, equity stop, halt retry, lifecycle
        let valuations = match self.protect(ctx, now).await? {
            Some(v) => v,
            None => return Ok(TickOutcome::EquityStop),
        };

        // 6. Strength and exit signals
        self.retry_exit_closures(ctx, now).await?;
        let strength = self.analyse_strength(ctx, now).await?;

        // 7. Structural reinforcement
        if let Some(strength) = strength.as_ref() {
            self.reinforce(ctx, &valuations, Some(strength), false, now).await?;
        }

        // 8. Decision pipeline
        self.consume_pipeline(ctx, strength.as_ref(), now).await?;

        // 9. Summary
        let summary = SummaryCalculator::calculate(ctx, now);
        summary.log(ctx.cycle_count);
        self.emit(TradingEvent::CycleSummary {
            cycle: ctx.cycle_count,
            equity_value: summary.equity_value,
            realized_pnl: summary.realized_pnl,
            unrealized_pnl: summary.unrealized_pnl,
            open_positions: summary.open_positions,
        });

        Ok(TickOutcome::Completed)
    }

    async fn monitoring_tick(&self, ctx: &mut TradingContext, now: DateTime<Utc>) -> TradingResult<TickOutcome> {
        let valuations = match self.protect(ctx, now).await? {
            Some(v) => v,
            None => return Ok(TickOutcome::EquityStop),
        };

        let strength = ctx.previous_strength.clone();
        self.reinforce(ctx, &valuations, strength.as_ref(), true, now).await?;

        Ok(TickOutcome::Completed)
    }

    fn in_session(&self, now: DateTime<Utc>) -> bool {
        let hour = now.hour();
        hour >= self.config.session_start_hour && hour < self.config.session_end_hour
    }

    /// Phases shared by both rhythms. `None` means the equity stop fired.
    async fn protect(
        &self,
        ctx: &mut TradingContext,
        now: DateTime<Utc>,
    ) -> TradingResult<Option<BTreeMap<u64, Valuation>>> {
        self.sync_positions(ctx, now).await?;
        let valuations = self.value_positions(ctx, now).await;

        let check = self.risk.evaluate(ctx, now)?;
        if check.breached {
            warn!(reason = %check.reason, "Equity stop, closing all positions");
            self.emit(TradingEvent::EquityStopTriggered {
                drawdown_pct: check.drawdown_pct,
                equity_value: check.snapshot.equity_value(),
            });
            self.mass_close(ctx, now).await;
            return Ok(None);
        }

        self.retry_outstanding(ctx, now).await?;
        self.apply_lifecycle(ctx, &valuations, now).await?;
        Ok(Some(valuations))
    }

    // ==================== Broker sync ====================

    async fn sync_positions(&self, ctx: &mut TradingContext, now: DateTime<Utc>) -> TradingResult<()> {
        let broker = self.services.broker.clone();
        let listed = with_retry(self.retry, "list positions", || broker.list_open_positions()).await?;
        let report = ctx.sync_with_broker(listed, now);

        for ticket in &report.adopted {
            if let Some(db) = &self.db {
                match db.get_mark(*ticket).await {
                    Ok(Some(mark)) => {
                        if let Some(pos) = ctx.positions.get_mut(ticket) {
                            pos.peak_pnl = mark.peak_pnl;
                            pos.reinforcement_of = mark.reinforcement_of;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(ticket, error = %e, "Failed to restore position mark"),
                }
            }
            if let Some(pos) = ctx.positions.get(ticket) {
                self.emit(TradingEvent::PositionAdopted {
                    ticket: *ticket,
                    symbol: pos.symbol.clone(),
                });
            }
        }

        for ticket in &report.vanished {
            if let Some(pos) = ctx.closed.iter().rev().find(|p| p.id == *ticket).cloned() {
                self.journal_close(&pos).await;
            }
        }

        Ok(())
    }

    // ==================== Valuation ====================

    async fn quote(&self, symbol: &str, now: DateTime<Utc>) -> Option<Decimal> {
        let market = self.services.market.as_ref();
        let live = self.services.clock.is_live();
        let fetch = async {
            if live {
                if let Some(price) = market.live_price(symbol).await {
                    return Some(price);
                }
            }
            market.historical_price(symbol, now).await
        };

        match tokio::time::timeout(self.config.call_timeout(), fetch).await {
            Ok(price) => price,
            Err(_) => {
                warn!(symbol, "Price request timed out");
                None
            }
        }
    }

    async fn quotes(&self, symbols: &BTreeSet<String>, now: DateTime<Utc>) -> BTreeMap<String, Decimal> {
        let fetched = join_all(symbols.iter().map(|s| async move { (s.clone(), self.quote(s, now).await) })).await;
        fetched
            .into_iter()
            .filter_map(|(symbol, price)| price.map(|p| (symbol, p)))
            .collect()
    }

    /// Mark open positions to market and collect their close decisions.
    ///
    /// Positions without a price keep their previous P&L and are skipped.
    async fn value_positions(&self, ctx: &mut TradingContext, now: DateTime<Utc>) -> BTreeMap<u64, Valuation> {
        let symbols: BTreeSet<String> = ctx.open_positions().map(|p| p.symbol.clone()).collect();
        let prices = self.quotes(&symbols, now).await;

        let mut valuations = BTreeMap::new();
        for pos in ctx.positions.values_mut().filter(|p| p.is_open()) {
            let Some(&price) = prices.get(&pos.symbol) else {
                let err = TradingError::DataUnavailable {
                    symbol: pos.symbol.clone(),
                };
                warn!(ticket = pos.id, error = %err, "Position skipped this tick");
                continue;
            };

            let previous = pos.last_observed;
            let decision = self.lifecycle.evaluate(pos, price, now);
            let drop_rate = match (previous, pos.last_observed) {
                (Some(prev), Some(cur)) => pnl_drop_rate(prev, cur),
                _ => None,
            };

            valuations.insert(
                pos.id,
                Valuation {
                    price,
                    decision,
                    drop_rate,
                },
            );
        }
        valuations
    }

    // ==================== Closing ====================

    /// Close one position through the broker.
    ///
    /// Ok(false) means the broker refused after retries; the position stays open.
    async fn close_one(
        &self,
        ctx: &mut TradingContext,
        ticket: u64,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> TradingResult<bool> {
        if !ctx.begin_close(ticket) {
            return Ok(false);
        }

        let broker = self.services.broker.clone();
        let operation = format!("close {}", ticket);
        match with_retry(self.retry, &operation, || broker.close_position(ticket)).await {
            Ok(()) => {
                if let Some(pos) = ctx.finalize_close(ticket, reason, now) {
                    info!(
                        ticket,
                        symbol = %pos.symbol,
                        reason = %reason,
                        pnl = %pos.current_pnl,
                        realized = %ctx.realized_pnl,
                        "Position closed"
                    );
                    self.emit(TradingEvent::PositionClosed {
                        ticket,
                        symbol: pos.symbol.clone(),
                        reason,
                        pnl: pos.current_pnl,
                    });
                    self.journal_close(&pos).await;
                }
                Ok(true)
            }
            Err(e) => {
                ctx.abort_close(ticket);
                warn!(ticket, reason = %reason, error = %e, "Close failed, position stays open");
                self.emit(TradingEvent::CloseFailed {
                    ticket,
                    reason,
                    error: e.to_string(),
                });
                if e.is_tick_abort() {
                    Err(e)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Close every open position, returning the tickets that could not be closed.
    async fn close_all(&self, ctx: &mut TradingContext, reason: CloseReason, now: DateTime<Utc>) -> Vec<u64> {
        let mut failed = Vec::new();
        for ticket in ctx.open_tickets() {
            match self.close_one(ctx, ticket, reason, now).await {
                Ok(true) => {}
                Ok(false) | Err(_) => failed.push(ticket),
            }
        }
        failed
    }

    async fn mass_close(&self, ctx: &mut TradingContext, now: DateTime<Utc>) {
        let failed = self.close_all(ctx, CloseReason::EquityStop, now).await;
        if failed.is_empty() {
            info!(realized = %ctx.realized_pnl, "Equity stop closures complete");
            return;
        }

        let violation = TradingError::InvariantViolation(format!(
            "equity stop could not close tickets {:?}",
            failed
        ));
        error!(error = %violation, "Halting new trades until closures complete");
        ctx.outstanding_closures.extend(failed);
        if ctx.halt.is_none() {
            ctx.halt = Some(HaltState {
                reason: violation.to_string(),
                since: now,
            });
            self.emit(TradingEvent::Halted {
                reason: violation.to_string(),
            });
        }
    }

    async fn retry_outstanding(&self, ctx: &mut TradingContext, now: DateTime<Utc>) -> TradingResult<()> {
        if ctx.halt.is_none() {
            return Ok(());
        }

        let outstanding: Vec<u64> = ctx.outstanding_closures.iter().copied().collect();
        for ticket in outstanding {
            if !ctx.positions.contains_key(&ticket) {
                ctx.outstanding_closures.remove(&ticket);
                continue;
            }
            self.close_one(ctx, ticket, CloseReason::EquityStop, now).await?;
        }

        if ctx.outstanding_closures.is_empty() {
            let halted_minutes = ctx.halt.as_ref().map_or(0, |h| (now - h.since).num_minutes());
            info!(halted_minutes, "Outstanding equity-stop closures complete, halt cleared");
            ctx.halt = None;
            self.emit(TradingEvent::HaltCleared);
        } else {
            warn!(outstanding = ?ctx.outstanding_closures, "Trading still halted");
        }
        Ok(())
    }

    async fn apply_lifecycle(
        &self,
        ctx: &mut TradingContext,
        valuations: &BTreeMap<u64, Valuation>,
        now: DateTime<Utc>,
    ) -> TradingResult<()> {
        for (ticket, valuation) in valuations {
            if let Some(decision) = &valuation.decision {
                self.close_one(ctx, *ticket, decision.reason, now).await?;
            }
        }
        Ok(())
    }

    // ==================== Strength and exit signals ====================

    async fn analyse_strength(
        &self,
        ctx: &mut TradingContext,
        now: DateTime<Utc>,
    ) -> TradingResult<Option<CurrencyStrengthSnapshot>> {
        let symbols: BTreeSet<String> = self.config.symbols.iter().cloned().collect();
        let prices = self.quotes(&symbols, now).await;
        if prices.is_empty() {
            warn!("No prices for strength analysis this cycle");
            return Ok(None);
        }

        let raw = RawPriceData {
            timestamp: now,
            prices,
        };
        let current = match tokio::time::timeout(self.config.call_timeout(), self.services.strength.snapshot(&raw)).await
        {
            Ok(Ok(snapshot)) => snapshot,
            Ok(Err(e)) => {
                warn!(error = %e, "Strength snapshot unavailable");
                return Ok(None);
            }
            Err(_) => {
                warn!("Strength calculation timed out");
                return Ok(None);
            }
        };

        let signals = self.comparator.compare(&current, ctx.previous_strength.as_ref());
        if !signals.is_empty() {
            let tickets = positions_to_close(&signals, self.config.exit_signal_threshold_count, ctx.open_positions());
            self.emit(TradingEvent::ExitSignals {
                currencies: signalled_currencies(&signals).into_iter().collect(),
                acted: !tickets.is_empty(),
            });
            ctx.previous_strength = Some(current.clone());
            for ticket in tickets {
                if !self.close_one(ctx, ticket, CloseReason::ExitSignal, now).await? {
                    ctx.pending_exit_closures.insert(ticket);
                }
            }
        } else {
            ctx.previous_strength = Some(current.clone());
        }

        Ok(Some(current))
    }

    /// Exit-signal closes refused earlier. The reversal that marked them is
    /// already the baseline, so it will not be seen again.
    async fn retry_exit_closures(&self, ctx: &mut TradingContext, now: DateTime<Utc>) -> TradingResult<()> {
        let pending: Vec<u64> = ctx.pending_exit_closures.iter().copied().collect();
        for ticket in pending {
            if !ctx.positions.get(&ticket).map_or(false, |p| p.is_open()) {
                ctx.pending_exit_closures.remove(&ticket);
                continue;
            }
            if self.close_one(ctx, ticket, CloseReason::ExitSignal, now).await? {
                ctx.pending_exit_closures.remove(&ticket);
            }
        }
        if !ctx.pending_exit_closures.is_empty() {
            warn!(pending = ?ctx.pending_exit_closures, "Exit-signal closes still refused");
        }
        Ok(())
    }

    // ==================== Reinforcement ====================

    async fn reinforce(
        &self,
        ctx: &mut TradingContext,
        valuations: &BTreeMap<u64, Valuation>,
        strength: Option<&CurrencyStrengthSnapshot>,
        rapid: bool,
        now: DateTime<Utc>,
    ) -> TradingResult<()> {
        if !self.config.reinforcement_enabled {
            return Ok(());
        }
        if ctx.is_halted() {
            debug!("Halted, reinforcement suspended");
            return Ok(());
        }

        let mut active = ctx.active_reinforcement_origins();
        for (ticket, valuation) in valuations {
            if ctx.open_count() >= self.config.max_concurrent_positions {
                debug!("Position limit reached, no further reinforcement");
                break;
            }
            let Some(position) = ctx.positions.get(ticket).filter(|p| p.is_open()) else {
                continue;
            };

            let event = if rapid {
                let Some(rate) = valuation.drop_rate else {
                    continue;
                };
                MarketEvent::RapidAdverseMove {
                    pnl_drop_per_minute: rate,
                    strength,
                }
            } else {
                let Some(strength) = strength else {
                    continue;
                };
                MarketEvent::StrengthAnalysis { strength }
            };

            let Some(plan) = self.planner.plan(position, valuation.price, event, &active) else {
                continue;
            };
            if self.execute_plan(ctx, &plan, strength, now).await? {
                active.insert(plan.target_position_id);
            }
        }
        Ok(())
    }

    async fn execute_plan(
        &self,
        ctx: &mut TradingContext,
        plan: &ReinforcementPlan,
        strength: Option<&CurrencyStrengthSnapshot>,
        now: DateTime<Utc>,
    ) -> TradingResult<bool> {
        let opened = self
            .open_order(ctx, &plan.symbol, plan.new_direction, plan.new_volume, strength, Some(plan.target_position_id), now)
            .await?;

        if let Some(ticket) = opened {
            self.emit(TradingEvent::ReinforcementOpened {
                origin: plan.target_position_id,
                ticket,
                reason: plan.reason,
                volume: plan.new_volume,
            });
        }
        Ok(opened.is_some())
    }

    // ==================== Orders ====================

    /// Normalize, price and open a position. `Ok(None)` when skipped this tick.
    #[allow(clippy::too_many_arguments)]
    async fn open_order(
        &self,
        ctx: &mut TradingContext,
        raw_symbol: &str,
        direction: Direction,
        volume: Decimal,
        strength: Option<&CurrencyStrengthSnapshot>,
        reinforcement_of: Option<u64>,
        now: DateTime<Utc>,
    ) -> TradingResult<Option<u64>> {
        let (symbol, direction) = self.normalizer.normalize(raw_symbol, direction);

        let pricing = self.normalizer.entry_price(
            self.services.market.as_ref(),
            &symbol,
            direction,
            strength,
            now,
            self.services.clock.is_live(),
        );
        let price = match tokio::time::timeout(self.config.call_timeout(), pricing).await {
            Ok(Ok(price)) => price,
            Ok(Err(e)) => {
                warn!(symbol = %symbol, error = %e, "Order skipped");
                return Ok(None);
            }
            Err(_) => {
                let e = TradingError::PriceUnavailable { symbol: symbol.clone() };
                warn!(error = %e, "Entry price lookup timed out, order skipped");
                return Ok(None);
            }
        };

        let broker = self.services.broker.clone();
        let operation = format!("open {}", symbol);
        let ticket = match with_retry(self.retry, &operation, || {
            broker.open_position(&symbol, direction, volume, price)
        })
        .await
        {
            Ok(ticket) => ticket,
            Err(e) if e.is_tick_abort() => return Err(e),
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Order abandoned for this tick");
                return Ok(None);
            }
        };

        let mut position = Position::new(ticket, symbol.clone(), direction, price, volume, now);
        if let Some(origin) = reinforcement_of {
            position = position.with_reinforcement_of(origin);
        }
        if let Some(db) = &self.db {
            if let Err(e) = db.save_mark(&position).await {
                warn!(ticket, error = %e, "Failed to save position mark");
            }
        }
        ctx.positions.insert(ticket, position);

        info!(
            ticket,
            symbol = %symbol,
            direction = %direction,
            volume = %volume,
            price = %price,
            reinforcement_of = ?reinforcement_of,
            "Position opened"
        );
        self.emit(TradingEvent::PositionOpened {
            ticket,
            symbol,
            direction,
            volume,
            price,
            reinforcement_of,
        });
        Ok(Some(ticket))
    }

    // ==================== Decision pipeline ====================

    async fn consume_pipeline(
        &self,
        ctx: &mut TradingContext,
        strength: Option<&CurrencyStrengthSnapshot>,
        now: DateTime<Utc>,
    ) -> TradingResult<()> {
        if ctx.is_halted() {
            info!("Halted, decision pipeline skipped");
            return Ok(());
        }

        let context = DecisionContext {
            timestamp: now,
            cycle: ctx.cycle_count,
            open_positions: ctx.open_positions().cloned().collect(),
            strength: strength.cloned(),
            equity_value: ctx.snapshot(now).equity_value(),
        };
        let timeout = self.config.call_timeout();

        let closures = match tokio::time::timeout(timeout, self.services.pipeline.propose_closures(&context)).await {
            Err(_) => return Err(TradingError::timeout("propose closures")),
            Ok(Err(e)) if e.is_tick_abort() => return Err(e),
            Ok(Err(e)) => {
                warn!(error = %e, "Closure proposals unavailable");
                Vec::new()
            }
            Ok(Ok(tickets)) => tickets,
        };
        for ticket in closures {
            if ctx.positions.get(&ticket).map_or(false, |p| p.is_open()) {
                self.close_one(ctx, ticket, CloseReason::DecisionClose, now).await?;
            } else {
                debug!(ticket, "Closure proposal for unknown ticket ignored");
            }
        }

        let proposals = match tokio::time::timeout(timeout, self.services.pipeline.propose_trades(&context)).await {
            Err(_) => return Err(TradingError::timeout("propose trades")),
            Ok(Err(e)) if e.is_tick_abort() => return Err(e),
            Ok(Err(e)) => {
                warn!(error = %e, "Trade proposals unavailable");
                Vec::new()
            }
            Ok(Ok(proposals)) => proposals,
        };
        for proposal in proposals {
            if ctx.open_count() >= self.config.max_concurrent_positions {
                warn!(
                    max = self.config.max_concurrent_positions,
                    "Position limit reached, remaining proposals dropped"
                );
                break;
            }
            if proposal.size <= Decimal::ZERO {
                warn!(symbol = %proposal.symbol, size = %proposal.size, "Proposal with no size ignored");
                continue;
            }
            self.open_order(ctx, &proposal.symbol, proposal.direction, proposal.size, strength, None, now)
                .await?;
        }
        Ok(())
    }

    // ==================== Persistence ====================

    async fn journal_close(&self, position: &Position) {
        if let Some(db) = &self.db {
            if let Err(e) = db.record_closed_position(position).await {
                warn!(ticket = position.id, error = %e, "Failed to journal closed position");
            }
        }
    }

    async fn persist(&self, ctx: &TradingContext, now: DateTime<Utc>) {
        let Some(db) = &self.db else {
            return;
        };
        if let Err(e) = db.record_snapshot(&ctx.snapshot(now)).await {
            warn!(error = %e, "Failed to record portfolio snapshot");
        }
        for pos in ctx.open_positions() {
            if let Err(e) = db.save_mark(pos).await {
                warn!(ticket = pos.id, error = %e, "Failed to save position mark");
            }
        }
    }

    // ==================== Run loop ====================

    /// Drive both rhythms on the wall clock until ctrl-c.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            main_minutes = self.config.main_cycle_period_minutes,
            monitoring_minutes = self.config.monitoring_period_minutes,
            "Starting orchestrator run loop"
        );

        let mut main = interval(self.config.main_cycle_period());
        let mut monitoring = interval(self.config.monitoring_period());
        main.set_missed_tick_behavior(MissedTickBehavior::Delay);
        monitoring.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first monitoring tick would fire immediately alongside the main cycle.
        monitoring.tick().await;

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        let mut in_flight = MainCycleSlot::default();

        loop {
            tokio::select! {
                _ = main.tick() => {
                    in_flight.start(self.clone()).await;
                }
                _ = monitoring.tick() => {
                    let outcome = self.run_monitoring_tick().await;
                    debug!(outcome = ?outcome, "Monitoring tick finished");
                }
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        in_flight.join().await;
        self.summary().await.log(self.state.lock().await.cycle_count);
        info!("Orchestrator stopped");
        Ok(())
    }
}

/// The spawned main cycle of the live loop. At most one runs at a time.
#[derive(Default)]
struct MainCycleSlot {
    handle: Option<JoinHandle<TickOutcome>>,
}

impl MainCycleSlot {
    fn is_busy(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Spawn a main cycle unless the previous one is still running.
    async fn start(&mut self, orchestrator: Arc<CycleOrchestrator>) -> bool {
        if self.is_busy() {
            debug!("Previous main cycle still running, tick skipped");
            return false;
        }
        self.join().await;
        self.handle = Some(tokio::spawn(async move { orchestrator.run_main_cycle().await }));
        true
    }

    async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(outcome) => debug!(outcome = ?outcome, "Main cycle finished"),
                Err(e) => error!(error = %e, "Main cycle task failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{RecordingEventSink, ReplayClock};
    use crate::models::{PositionStatus, StrengthReading, TradeProposal};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeMarket {
        prices: StdMutex<BTreeMap<String, Decimal>>,
    }

    impl FakeMarket {
        fn set(&self, symbol: &str, price: Decimal) {
            self.prices.lock().unwrap().insert(symbol.to_string(), price);
        }
    }

    #[async_trait]
    impl MarketData for FakeMarket {
        async fn live_price(&self, symbol: &str) -> Option<Decimal> {
            self.prices.lock().unwrap().get(symbol).copied()
        }

        async fn historical_price(&self, symbol: &str, _at: DateTime<Utc>) -> Option<Decimal> {
            self.prices.lock().unwrap().get(symbol).copied()
        }
    }

    #[derive(Default)]
    struct FakeStrength {
        current: StdMutex<Option<CurrencyStrengthSnapshot>>,
    }

    #[async_trait]
    impl StrengthCalculator for FakeStrength {
        async fn snapshot(&self, _raw: &RawPriceData) -> TradingResult<CurrencyStrengthSnapshot> {
            self.current
                .lock()
                .unwrap()
                .clone()
                .ok_or_else(|| TradingError::DataUnavailable { symbol: "strength".into() })
        }
    }

    #[derive(Default)]
    struct FakePipeline {
        trades: StdMutex<Vec<TradeProposal>>,
        trade_calls: AtomicU32,
        slow_closures: AtomicBool,
    }

    #[async_trait]
    impl DecisionPipeline for FakePipeline {
        async fn propose_trades(&self, _context: &DecisionContext) -> TradingResult<Vec<TradeProposal>> {
            self.trade_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.trades.lock().unwrap().clone())
        }

        async fn propose_closures(&self, _context: &DecisionContext) -> TradingResult<Vec<u64>> {
            if self.slow_closures.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
            Ok(Vec::new())
        }
    }

    struct FakeBroker {
        open: StdMutex<BTreeMap<u64, Position>>,
        next_ticket: AtomicU64,
        fail_closes: AtomicBool,
        slow_closes: AtomicBool,
        close_calls: AtomicU32,
        opened: StdMutex<Vec<(String, Direction, Decimal)>>,
    }

    impl FakeBroker {
        fn new() -> Self {
            Self {
                open: StdMutex::new(BTreeMap::new()),
                next_ticket: AtomicU64::new(100),
                fail_closes: AtomicBool::new(false),
                slow_closes: AtomicBool::new(false),
                close_calls: AtomicU32::new(0),
                opened: StdMutex::new(Vec::new()),
            }
        }

        fn seed(&self, pos: Position) {
            self.open.lock().unwrap().insert(pos.id, pos);
        }

        fn opened(&self) -> Vec<(String, Direction, Decimal)> {
            self.opened.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerGateway for FakeBroker {
        async fn open_position(
            &self,
            symbol: &str,
            direction: Direction,
            volume: Decimal,
            price: Decimal,
        ) -> TradingResult<u64> {
            let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
            self.opened.lock().unwrap().push((symbol.to_string(), direction, volume));
            self.open
                .lock()
                .unwrap()
                .insert(ticket, Position::new(ticket, symbol, direction, price, volume, Utc::now()));
            Ok(ticket)
        }

        async fn close_position(&self, ticket: u64) -> TradingResult<()> {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            if self.slow_closes.load(Ordering::SeqCst) {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
            if self.fail_closes.load(Ordering::SeqCst) {
                return Err(TradingError::broker(format!("close {}", ticket), "market closed"));
            }
            self.open.lock().unwrap().remove(&ticket);
            Ok(())
        }

        async fn list_open_positions(&self) -> TradingResult<Vec<Position>> {
            Ok(self.open.lock().unwrap().values().cloned().collect())
        }
    }

    struct Harness {
        orchestrator: CycleOrchestrator,
        market: Arc<FakeMarket>,
        strength: Arc<FakeStrength>,
        pipeline: Arc<FakePipeline>,
        broker: Arc<FakeBroker>,
        clock: ReplayClock,
        events: RecordingEventSink,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap()
    }

    fn test_config() -> TradingConfig {
        TradingConfig {
            symbols: vec!["EURUSD".to_string()],
            broker_retry_initial_ms: 1,
            call_timeout_secs: 1,
            ..TradingConfig::default()
        }
    }

    fn harness(config: TradingConfig) -> Harness {
        let market = Arc::new(FakeMarket::default());
        let strength = Arc::new(FakeStrength::default());
        let pipeline = Arc::new(FakePipeline::default());
        let broker = Arc::new(FakeBroker::new());
        let clock = ReplayClock::new(start());
        let events = RecordingEventSink::new();

        let services = Collaborators {
            market: market.clone(),
            strength: strength.clone(),
            pipeline: pipeline.clone(),
            broker: broker.clone(),
            clock: Arc::new(clock.clone()),
            events: Arc::new(events.clone()),
        };
        Harness {
            orchestrator: CycleOrchestrator::new(config, services).unwrap(),
            market,
            strength,
            pipeline,
            broker,
            clock,
            events,
        }
    }

    fn long(id: u64, symbol: &str, entry: Decimal, volume: Decimal) -> Position {
        Position::new(id, symbol, Direction::Long, entry, volume, start())
    }

    fn strength(trends: &[(&str, f64)]) -> CurrencyStrengthSnapshot {
        let readings = trends
            .iter()
            .map(|(c, t)| (c.to_string(), StrengthReading { strength: 0.0, trend: *t }))
            .collect();
        CurrencyStrengthSnapshot::new(start(), readings)
    }

    #[test]
    fn test_invalid_config_rejected_before_any_tick() {
        let h = harness(test_config());
        let services = h.orchestrator.services.clone();
        let config = TradingConfig {
            equity_stop_pct: dec!(5),
            ..test_config()
        };
        assert!(matches!(
            CycleOrchestrator::new(config, services),
            Err(TradingError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_equity_stop_short_circuits_cycle() {
        let h = harness(test_config());
        h.broker.seed(long(1, "EURUSD", dec!(1.1000), dec!(10)));
        h.broker.seed(long(2, "EURUSD", dec!(1.1000), dec!(10)));
        h.market.set("EURUSD", dec!(1.0970)); // -300 each, equity 9400
        h.pipeline.trades.lock().unwrap().push(TradeProposal {
            symbol: "GBPUSD".into(),
            direction: Direction::Long,
            size: dec!(0.1),
        });

        let outcome = h.orchestrator.run_main_cycle().await;

        assert_eq!(outcome, TickOutcome::EquityStop);
        assert!(h.broker.opened().is_empty());
        assert_eq!(h.pipeline.trade_calls.load(Ordering::SeqCst), 0);

        let ctx = h.orchestrator.lock_context().await;
        assert_eq!(ctx.open_count(), 0);
        assert_eq!(ctx.realized_pnl, dec!(-600));
        assert!(ctx.closed.iter().all(|p| p.close_reason() == Some(CloseReason::EquityStop)));
        assert!(h
            .events
            .events()
            .iter()
            .any(|e| matches!(e, TradingEvent::EquityStopTriggered { .. })));
    }

    #[tokio::test]
    async fn test_exit_signals_act_only_at_threshold() {
        let h = harness(test_config());
        h.broker.seed(long(1, "EURUSD", dec!(1.1000), dec!(0.1)));
        h.broker.seed(long(2, "GBPJPY", dec!(190.00), dec!(0.1)));
        h.broker.seed(long(3, "AUDNZD", dec!(1.0800), dec!(0.1)));
        h.market.set("EURUSD", dec!(1.1000));
        h.market.set("GBPJPY", dec!(190.00));
        h.market.set("AUDNZD", dec!(1.0800));

        let previous = strength(&[("EUR", 1.0), ("USD", -1.0), ("JPY", 1.0), ("AUD", 0.1)]);

        // Two reversals: nothing closes
        h.orchestrator.lock_context().await.previous_strength = Some(previous.clone());
        *h.strength.current.lock().unwrap() =
            Some(strength(&[("EUR", -1.0), ("USD", 1.0), ("JPY", 1.0), ("AUD", 0.1)]));
        assert_eq!(h.orchestrator.run_main_cycle().await, TickOutcome::Completed);
        assert_eq!(h.orchestrator.lock_context().await.open_count(), 3);

        // Third reversal (JPY): EURUSD and GBPJPY close, AUDNZD stays
        h.orchestrator.lock_context().await.previous_strength = Some(previous);
        *h.strength.current.lock().unwrap() =
            Some(strength(&[("EUR", -1.0), ("USD", 1.0), ("JPY", -1.0), ("AUD", 0.1)]));
        assert_eq!(h.orchestrator.run_main_cycle().await, TickOutcome::Completed);

        let ctx = h.orchestrator.lock_context().await;
        assert_eq!(ctx.open_tickets(), vec![3]);
        let mut closed: Vec<u64> = ctx.closed.iter().map(|p| p.id).collect();
        closed.sort();
        assert_eq!(closed, vec![1, 2]);
        assert!(ctx.closed.iter().all(|p| p.close_reason() == Some(CloseReason::ExitSignal)));
    }

    #[tokio::test]
    async fn test_refused_exit_signal_close_retried_next_cycle() {
        let h = harness(test_config());
        h.broker.seed(long(1, "EURUSD", dec!(1.1000), dec!(0.1)));
        h.market.set("EURUSD", dec!(1.1000));
        h.broker.fail_closes.store(true, Ordering::SeqCst);

        h.orchestrator.lock_context().await.previous_strength =
            Some(strength(&[("EUR", 1.0), ("USD", -1.0), ("JPY", 1.0)]));
        *h.strength.current.lock().unwrap() =
            Some(strength(&[("EUR", -1.0), ("USD", 1.0), ("JPY", -1.0)]));
        assert_eq!(h.orchestrator.run_main_cycle().await, TickOutcome::Completed);
        {
            let ctx = h.orchestrator.lock_context().await;
            assert_eq!(ctx.open_tickets(), vec![1]);
            assert!(ctx.pending_exit_closures.contains(&1));
        }

        // Same snapshot again: no new reversal, the refused close is still owed
        h.broker.fail_closes.store(false, Ordering::SeqCst);
        h.clock.advance_to(start() + Duration::minutes(30));
        assert_eq!(h.orchestrator.run_main_cycle().await, TickOutcome::Completed);

        let ctx = h.orchestrator.lock_context().await;
        assert_eq!(ctx.open_count(), 0);
        assert!(ctx.pending_exit_closures.is_empty());
        assert_eq!(ctx.closed[0].close_reason(), Some(CloseReason::ExitSignal));
    }

    #[tokio::test]
    async fn test_missing_price_skips_position() {
        let h = harness(test_config());
        h.broker.seed(long(1, "GBPUSD", dec!(1.2700), dec!(1)));

        assert_eq!(h.orchestrator.run_monitoring_tick().await, TickOutcome::Completed);
        assert_eq!(h.orchestrator.run_main_cycle().await, TickOutcome::Completed);

        let ctx = h.orchestrator.lock_context().await;
        assert_eq!(ctx.open_tickets(), vec![1]);
        assert_eq!(ctx.positions[&1].current_pnl, Decimal::ZERO);
        assert_eq!(ctx.positions[&1].peak_pnl, None);
        assert!(ctx.closed.is_empty());
        assert_eq!(h.broker.close_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_timeout_aborts_cycle() {
        let h = harness(test_config());
        h.broker.seed(long(1, "EURUSD", dec!(1.1000), dec!(1)));
        h.market.set("EURUSD", dec!(1.1080)); // +80, profit target
        h.broker.slow_closes.store(true, Ordering::SeqCst);

        let outcome = h.orchestrator.run_main_cycle().await;

        assert!(matches!(outcome, TickOutcome::Aborted(_)));
        assert_eq!(h.broker.close_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.pipeline.trade_calls.load(Ordering::SeqCst), 0);
        let ctx = h.orchestrator.lock_context().await;
        assert_eq!(ctx.positions[&1].status, PositionStatus::Open);
        assert_eq!(ctx.realized_pnl, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_main_cycle_slot_runs_one_at_a_time() {
        let h = harness(test_config());
        let orchestrator = Arc::new(h.orchestrator);
        let mut slot = MainCycleSlot::default();

        let guard = orchestrator.lock_context().await;
        assert!(slot.start(orchestrator.clone()).await);
        tokio::task::yield_now().await;
        assert!(!slot.start(orchestrator.clone()).await);
        drop(guard);

        slot.join().await;
        assert!(!slot.is_busy());
        assert_eq!(orchestrator.lock_context().await.cycle_count, 1);
    }

    #[tokio::test]
    async fn test_monitoring_tick_is_idempotent() {
        let h = harness(test_config());
        h.broker.seed(long(1, "EURUSD", dec!(1.1000), dec!(1)));
        h.market.set("EURUSD", dec!(1.0990)); // -10

        assert_eq!(h.orchestrator.run_monitoring_tick().await, TickOutcome::Completed);
        h.clock.advance_to(start() + Duration::minutes(5));
        assert_eq!(h.orchestrator.run_monitoring_tick().await, TickOutcome::Completed);

        let ctx = h.orchestrator.lock_context().await;
        assert_eq!(ctx.realized_pnl, Decimal::ZERO);
        assert_eq!(ctx.open_count(), 1);
        assert_eq!(ctx.history.len(), 2);
        assert_eq!(h.broker.close_calls.load(Ordering::SeqCst), 0);
        assert!(h.broker.opened().is_empty());
    }

    #[tokio::test]
    async fn test_rapid_move_reinforces_once() {
        let h = harness(TradingConfig {
            stop_loss_abs: dec!(500),
            ..test_config()
        });
        h.broker.seed(long(1, "EURUSD", dec!(1.1000), dec!(1)));

        h.market.set("EURUSD", dec!(1.0990)); // -10
        h.orchestrator.run_monitoring_tick().await;

        h.clock.advance_to(start() + Duration::minutes(1));
        h.market.set("EURUSD", dec!(1.0970)); // -30, 20/min
        h.orchestrator.run_monitoring_tick().await;

        let opened = h.broker.opened();
        assert_eq!(opened, vec![("EURUSD".to_string(), Direction::Long, dec!(0.25))]);

        h.clock.advance_to(start() + Duration::minutes(2));
        h.market.set("EURUSD", dec!(1.0940)); // -60, 30/min, reinforcement still open
        h.orchestrator.run_monitoring_tick().await;

        assert_eq!(h.broker.opened().len(), 1);
        let ctx = h.orchestrator.lock_context().await;
        assert_eq!(ctx.positions[&100].reinforcement_of, Some(1));
        assert!(h
            .events
            .events()
            .iter()
            .any(|e| matches!(e, TradingEvent::ReinforcementOpened { origin: 1, ticket: 100, .. })));
    }

    #[tokio::test]
    async fn test_broker_failure_keeps_position_open() {
        let h = harness(test_config());
        h.broker.seed(long(1, "EURUSD", dec!(1.1000), dec!(1)));
        h.broker.fail_closes.store(true, Ordering::SeqCst);
        h.market.set("EURUSD", dec!(1.1080)); // +80, profit target

        h.orchestrator.run_monitoring_tick().await;
        {
            let ctx = h.orchestrator.lock_context().await;
            assert_eq!(ctx.positions[&1].status, PositionStatus::Open);
            assert_eq!(ctx.realized_pnl, Decimal::ZERO);
        }
        assert_eq!(h.broker.close_calls.load(Ordering::SeqCst), 3);

        h.broker.fail_closes.store(false, Ordering::SeqCst);
        h.clock.advance_to(start() + Duration::minutes(5));
        h.orchestrator.run_monitoring_tick().await;

        let ctx = h.orchestrator.lock_context().await;
        assert_eq!(ctx.open_count(), 0);
        assert_eq!(ctx.realized_pnl, dec!(80));
        assert_eq!(ctx.closed[0].close_reason(), Some(CloseReason::ProfitTarget));
    }

    #[tokio::test]
    async fn test_incomplete_mass_close_halts_new_trades() {
        let h = harness(test_config());
        h.broker.seed(long(1, "EURUSD", dec!(1.1000), dec!(20)));
        h.broker.fail_closes.store(true, Ordering::SeqCst);
        h.market.set("EURUSD", dec!(1.0970)); // -600

        assert_eq!(h.orchestrator.run_main_cycle().await, TickOutcome::EquityStop);
        {
            let ctx = h.orchestrator.lock_context().await;
            assert!(ctx.is_halted());
            assert!(ctx.outstanding_closures.contains(&1));
        }

        // Price recovers but the broker still refuses: pipeline trades stay suspended
        h.market.set("EURUSD", dec!(1.1000));
        h.pipeline.trades.lock().unwrap().push(TradeProposal {
            symbol: "EURUSD".into(),
            direction: Direction::Long,
            size: dec!(0.1),
        });
        h.clock.advance_to(start() + Duration::minutes(30));
        assert_eq!(h.orchestrator.run_main_cycle().await, TickOutcome::Completed);
        assert!(h.broker.opened().is_empty());
        assert_eq!(h.pipeline.trade_calls.load(Ordering::SeqCst), 0);

        // Monitoring retries the outstanding closure and clears the halt
        h.broker.fail_closes.store(false, Ordering::SeqCst);
        h.clock.advance_to(start() + Duration::minutes(35));
        h.orchestrator.run_monitoring_tick().await;

        let ctx = h.orchestrator.lock_context().await;
        assert!(!ctx.is_halted());
        assert_eq!(ctx.closed[0].close_reason(), Some(CloseReason::EquityStop));
        let events = h.events.events();
        assert!(events.iter().any(|e| matches!(e, TradingEvent::Halted { .. })));
        assert!(events.contains(&TradingEvent::HaltCleared));
    }

    #[tokio::test]
    async fn test_monitoring_skipped_while_token_held() {
        let h = harness(test_config());
        let guard = h.orchestrator.lock_context().await;
        assert_eq!(h.orchestrator.run_monitoring_tick().await, TickOutcome::Skipped);
        drop(guard);
        assert_eq!(h.orchestrator.run_monitoring_tick().await, TickOutcome::Completed);
    }

    #[tokio::test]
    async fn test_pipeline_trade_is_normalized() {
        let h = harness(test_config());
        h.market.set("USDCAD", dec!(1.3500));
        h.pipeline.trades.lock().unwrap().push(TradeProposal {
            symbol: "CADUSD".into(),
            direction: Direction::Long,
            size: dec!(0.2),
        });

        assert_eq!(h.orchestrator.run_main_cycle().await, TickOutcome::Completed);

        assert_eq!(h.broker.opened(), vec![("USDCAD".to_string(), Direction::Short, dec!(0.2))]);
        let ctx = h.orchestrator.lock_context().await;
        assert_eq!(ctx.positions[&100].entry_price, dec!(1.3500));
    }

    #[tokio::test]
    async fn test_session_end_closes_positions() {
        let h = harness(TradingConfig {
            close_at_session_end: true,
            ..test_config()
        });
        h.broker.seed(long(1, "EURUSD", dec!(1.1000), dec!(0.1)));
        h.market.set("EURUSD", dec!(1.1010));
        h.clock.advance_to(Utc.with_ymd_and_hms(2024, 3, 4, 20, 30, 0).unwrap());

        assert_eq!(h.orchestrator.run_main_cycle().await, TickOutcome::OutsideSession);

        let ctx = h.orchestrator.lock_context().await;
        assert_eq!(ctx.open_count(), 0);
        assert_eq!(ctx.closed[0].close_reason(), Some(CloseReason::SessionEnd));
    }

    #[tokio::test]
    async fn test_pipeline_timeout_aborts_cycle() {
        let h = harness(test_config());
        h.pipeline.slow_closures.store(true, Ordering::SeqCst);

        let outcome = h.orchestrator.run_main_cycle().await;

        assert!(matches!(outcome, TickOutcome::Aborted(_)));
        assert_eq!(h.pipeline.trade_calls.load(Ordering::SeqCst), 0);
        assert!(h
            .events
            .events()
            .iter()
            .any(|e| matches!(e, TradingEvent::TickAborted { kind: TickKind::MainCycle, .. })));
    }

    #[tokio::test]
    async fn test_vanished_ticket_closed_as_broker_closed() {
        let h = harness(test_config());
        h.broker.seed(long(1, "EURUSD", dec!(1.1000), dec!(1)));
        h.market.set("EURUSD", dec!(1.1020));
        h.orchestrator.run_monitoring_tick().await;

        h.broker.open.lock().unwrap().clear();
        h.orchestrator.run_monitoring_tick().await;

        let ctx = h.orchestrator.lock_context().await;
        assert_eq!(ctx.realized_pnl, dec!(20));
        assert_eq!(ctx.closed[0].close_reason(), Some(CloseReason::BrokerClosed));
    }
}
