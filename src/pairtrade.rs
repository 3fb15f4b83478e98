use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::PairBotConfig;
use crate::pairs::PairKey;
use crate::persistence::{
    cooldown_active, purge_expired_cooldowns, CooldownRegistry, OpenPairRegistry,
    PersistenceStore,
};
use crate::ports::{
    closes, Broker, MarketClock, MarketData, Order, OrderAmount, OrderQueryStatus, OrderSide,
    OrderStatus, PositionSnapshot, TimeInForce,
};
use crate::signal::{build_model, SpreadModel};
use crate::sizing::{BookExposure, PositionSizer};
use crate::trade::pnl_log::{PnlLogRecord, PnlLogger};

/// Lifecycle of one pair inside a trading session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairPhase {
    Candidate,
    Opening,
    Open,
    CloseEligible,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Signal,
    HoldingTime,
    OneLegMissing,
    LegsGone,
}

impl CloseReason {
    fn label(self) -> &'static str {
        match self {
            CloseReason::Signal => "signal",
            CloseReason::HoldingTime => "holding_time",
            CloseReason::OneLegMissing => "one_leg_missing",
            CloseReason::LegsGone => "legs_gone",
        }
    }
}

/// What the session should do before the first cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStart {
    Open,
    WaitFor(Duration),
    NotToday,
}

struct OpenCandidate {
    pair: PairKey,
    reference: f64,
    short_bid: Decimal,
}

pub struct PairTradeEngine {
    cfg: PairBotConfig,
    broker: Arc<dyn Broker>,
    market: Arc<dyn MarketData>,
    store: Arc<dyn PersistenceStore>,
    model: Box<dyn SpreadModel>,
    sizer: PositionSizer,
    pnl_logger: Option<PnlLogger>,
    open_pairs: OpenPairRegistry,
    cooldowns: CooldownRegistry,
    phases: HashMap<PairKey, PairPhase>,
}

impl PairTradeEngine {
    /// Builds the engine and restores the open-pair and cooldown records.
    pub fn new(
        cfg: PairBotConfig,
        broker: Arc<dyn Broker>,
        market: Arc<dyn MarketData>,
        store: Arc<dyn PersistenceStore>,
    ) -> Result<Self> {
        let open_pairs = store
            .load_open_pairs()
            .context("failed to restore open pairs")?;
        let cooldowns = store
            .load_cooldowns()
            .context("failed to restore cooldowns")?;
        log::info!(
            "[STATE] restored {} open pairs, {} cooldowns",
            open_pairs.len(),
            cooldowns.len()
        );
        for (pair, reference) in &open_pairs {
            log::info!("[STATE] open {} reference={:.6}", pair, reference);
        }
        let phases = open_pairs
            .keys()
            .map(|pair| (pair.clone(), PairPhase::Open))
            .collect();

        Ok(Self {
            model: build_model(&cfg),
            sizer: PositionSizer::from_config(&cfg),
            pnl_logger: Some(PnlLogger::new(cfg.pnl_dir(), cfg.pnl_retention_days)),
            cfg,
            broker,
            market,
            store,
            open_pairs,
            cooldowns,
            phases,
        })
    }

    pub fn open_pairs(&self) -> &OpenPairRegistry {
        &self.open_pairs
    }

    pub fn cooldowns(&self) -> &CooldownRegistry {
        &self.cooldowns
    }

    pub fn phase(&self, pair: &PairKey) -> Option<PairPhase> {
        self.phases.get(pair).copied()
    }

    fn set_phase(&mut self, pair: &PairKey, phase: PairPhase) {
        let previous = self.phases.insert(pair.clone(), phase);
        if previous != Some(phase) {
            log::debug!("[STATE] {} {:?} -> {:?}", pair, previous, phase);
        }
        if phase == PairPhase::Closed {
            self.phases.remove(pair);
        }
    }

    fn symbols_in_open_pairs(&self) -> HashSet<&str> {
        self.open_pairs.keys().flat_map(|pair| pair.legs()).collect()
    }

    /// Drops expired cooldowns and old P&L journals. Returns the released symbols.
    pub fn cleanup(&mut self, today: NaiveDate) -> Result<Vec<String>> {
        let released = purge_expired_cooldowns(&mut self.cooldowns, today, self.cfg.cooldown_days);
        if !released.is_empty() {
            self.store
                .save_cooldowns(&self.cooldowns)
                .context("failed to save cooldowns")?;
            log::info!("[STATE] cooldown expired for {}", released.join(","));
        }
        if let Some(logger) = &self.pnl_logger {
            let removed = logger.cleanup(today);
            if removed > 0 {
                log::info!("[PNL] removed {} old journal files", removed);
            }
        }
        Ok(released)
    }

    fn session_start(&self, clock: &MarketClock) -> SessionStart {
        if clock.is_open {
            return SessionStart::Open;
        }
        let wait = clock.seconds_until_open();
        if wait > self.cfg.max_wait_for_open_hours * 3600 {
            SessionStart::NotToday
        } else {
            SessionStart::WaitFor(Duration::from_secs(wait.max(0) as u64))
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        log::info!(
            "[CONFIG] model={} interval={}s max_positions={} entry_percent={}",
            self.model.name(),
            self.cfg.interval_secs,
            self.cfg.max_positions,
            self.cfg.entry_percent
        );
        let clock = self
            .broker
            .get_market_clock()
            .await
            .context("failed to read market clock")?;
        match self.session_start(&clock) {
            SessionStart::Open => {}
            SessionStart::WaitFor(wait) => {
                log::info!("Market opens in {:?}, waiting", wait);
                sleep(wait).await;
            }
            SessionStart::NotToday => {
                log::info!("Market not open today (next open {})", clock.next_open);
                return Ok(());
            }
        }

        self.cleanup(clock.timestamp.date_naive())?;

        let interval = Duration::from_secs(self.cfg.interval_secs);
        loop {
            let clock = match self.broker.get_market_clock().await {
                Ok(clock) => clock,
                Err(e) => {
                    log::error!("failed to read market clock: {}", e);
                    sleep(interval).await;
                    continue;
                }
            };
            if !clock.is_open {
                log::info!("Market closed, ending session");
                break;
            }
            self.step(&clock).await;
            sleep(interval).await;
        }
        Ok(())
    }

    /// One polling cycle: openings first, then closes.
    pub async fn step(&mut self, clock: &MarketClock) {
        if let Err(e) = self.open_step(clock).await {
            log::error!("[ORDER] open step failed: {:?}", e);
        }
        if let Err(e) = self.close_step(clock).await {
            log::error!("[CLOSE] close step failed: {:?}", e);
        }
    }

    async fn open_step(&mut self, clock: &MarketClock) -> Result<()> {
        let today = clock.timestamp.date_naive();
        let Some(snapshot) = self
            .store
            .load_snapshot()
            .context("failed to load training snapshot")?
        else {
            log::info!("[TRAIN] no training snapshot, nothing to open");
            return Ok(());
        };
        let age = snapshot.age_days(today);
        if age > self.cfg.max_snapshot_age_days {
            log::warn!(
                "[TRAIN] training snapshot from {} is {} days old, not opening",
                snapshot.trained_at_date,
                age
            );
            return Ok(());
        }

        let positions = self
            .broker
            .get_open_positions()
            .await
            .context("failed to read positions")?;

        let candidates = self.open_candidates(&snapshot.ranked_pairs(), &positions, today).await;
        if candidates.is_empty() {
            log::debug!("[ORDER] no tradable pairs this cycle");
            return Ok(());
        }

        let account = self
            .broker
            .get_account_snapshot()
            .await
            .context("failed to read account")?;
        let available =
            PositionSizer::available_cash(account.equity, account.cash, self.cfg.entry_percent);
        let book = BookExposure {
            open_pairs: self.open_pairs.len(),
            open_positions: positions.len(),
            existing_notional: positions.values().map(PositionSnapshot::entry_notional).sum(),
        };
        let bids: Vec<Decimal> = candidates.iter().map(|c| c.short_bid).collect();
        let decision = self.sizer.size(&bids, available, book);
        if decision.is_empty() {
            log::info!(
                "[SIZING] no trade: equity={} cash={} available={} candidates={}",
                account.equity,
                account.cash,
                available,
                candidates.len()
            );
            return Ok(());
        }
        log::info!(
            "[SIZING] {} trades at {} each (available {})",
            decision.trade_count,
            decision.notional_per_trade,
            available
        );

        let mut opened = 0;
        for candidate in candidates {
            if opened >= decision.trade_count {
                break;
            }
            let pair = candidate.pair;
            let qty = self
                .sizer
                .shortable_qty(candidate.short_bid, decision.notional_per_trade);
            if qty.is_zero() {
                log::debug!(
                    "[SIZING] {}: {} too small to short at {}",
                    pair,
                    decision.notional_per_trade,
                    candidate.short_bid
                );
                continue;
            }

            self.set_phase(&pair, PairPhase::Opening);
            match self.open_pair(&pair, qty).await {
                Ok(()) => {
                    self.open_pairs.insert(pair.clone(), candidate.reference);
                    self.store
                        .save_open_pairs(&self.open_pairs)
                        .context("failed to save open pairs")?;
                    self.set_phase(&pair, PairPhase::Open);
                    opened += 1;
                }
                Err(e) => {
                    log::warn!("[ORDER] failed to open {}: {:?}", pair, e);
                    self.set_phase(&pair, PairPhase::Candidate);
                }
            }
        }
        Ok(())
    }

    /// Snapshot pairs that may open this cycle, in ranking order, with the
    /// short-leg bid the sizer needs.
    async fn open_candidates(
        &self,
        ranked: &[(PairKey, f64)],
        positions: &HashMap<String, PositionSnapshot>,
        today: NaiveDate,
    ) -> Vec<OpenCandidate> {
        let mut taken: HashSet<String> = self
            .symbols_in_open_pairs()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut candidates = Vec::new();
        for (pair, reference) in ranked {
            if self.open_pairs.contains_key(pair) {
                continue;
            }
            let blocked = pair.legs().into_iter().find(|symbol| {
                taken.contains(*symbol)
                    || positions.contains_key(*symbol)
                    || cooldown_active(&self.cooldowns, symbol, today, self.cfg.cooldown_days)
            });
            if let Some(symbol) = blocked {
                log::debug!("[ORDER] {} skipped: {} unavailable", pair, symbol);
                continue;
            }
            let quote = match self.market.get_latest_quote(&pair.short_leg).await {
                Ok(quote) => quote,
                Err(e) => {
                    log::warn!("[ORDER] {} skipped: no quote for {}: {}", pair, pair.short_leg, e);
                    continue;
                }
            };
            taken.extend(pair.symbols());
            candidates.push(OpenCandidate {
                pair: pair.clone(),
                reference: *reference,
                short_bid: quote.bid_price,
            });
        }
        candidates
    }

    /// Short leg by quantity, then the long leg for the filled short notional.
    async fn open_pair(&self, pair: &PairKey, qty: Decimal) -> Result<()> {
        let short = self
            .broker
            .submit_order(
                &pair.short_leg,
                OrderSide::Sell,
                OrderAmount::Quantity(qty),
                TimeInForce::Day,
            )
            .await
            .with_context(|| format!("short leg {}", pair.short_leg))?;
        log::info!(
            "[ORDER] {} short {} x{} submitted id={}",
            pair,
            pair.short_leg,
            qty,
            short.id
        );
        self.wait_for_fill().await;

        let short_fill = self
            .broker
            .get_order_by_id(&short.id)
            .await
            .with_context(|| format!("short leg fill {}", short.id))?;
        let long_notional = match short_fill.filled_notional() {
            Some(notional) if notional > Decimal::ZERO => notional.round_dp(2),
            _ => {
                return Err(anyhow!(
                    "short leg {} not filled (status {:?})",
                    pair.short_leg,
                    short_fill.status
                ))
            }
        };

        let long = match self
            .broker
            .submit_order(
                &pair.long_leg,
                OrderSide::Buy,
                OrderAmount::Notional(long_notional),
                TimeInForce::Day,
            )
            .await
        {
            Ok(order) => order,
            Err(e) => {
                log::error!(
                    "[ORDER] failed to place long leg {} for {}: {}",
                    pair.long_leg,
                    pair,
                    e
                );
                self.unwind_short_leg(pair, &short_fill).await;
                return Err(anyhow!("long leg {}: {}", pair.long_leg, e));
            }
        };
        log::info!(
            "[ORDER] {} long {} ${} submitted id={}",
            pair,
            pair.long_leg,
            long_notional,
            long.id
        );
        self.wait_for_fill().await;

        match self.broker.get_order_by_id(&long.id).await {
            Ok(fill) if is_dead_order(&fill) => {
                log::error!(
                    "[ORDER] long leg {} for {} ended {:?} without fills",
                    pair.long_leg,
                    pair,
                    fill.status
                );
                self.unwind_short_leg(pair, &short_fill).await;
                Err(anyhow!("long leg {} not filled", pair.long_leg))
            }
            Ok(fill) => {
                log::info!(
                    "[ORDER] {} opened: short {}@{:?} long {}@{:?}",
                    pair,
                    short_fill.filled_qty,
                    short_fill.filled_avg_price,
                    fill.filled_qty,
                    fill.filled_avg_price
                );
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "[ORDER] {} long fill of {} unknown ({}), treating as open",
                    pair,
                    long.id,
                    e
                );
                Ok(())
            }
        }
    }

    async fn unwind_short_leg(&self, pair: &PairKey, short_fill: &Order) {
        match self.broker.close_position(&pair.short_leg).await {
            Ok(order) => log::warn!(
                "[SAFETY] unwound short leg {} of {} (order {})",
                pair.short_leg,
                pair,
                order.id
            ),
            Err(e) => log::error!(
                "[SAFETY] FAILED TO UNWIND short leg {} of {}: orphaned qty {}: {}",
                pair.short_leg,
                pair,
                short_fill.filled_qty,
                e
            ),
        }
    }

    async fn wait_for_fill(&self) {
        if self.cfg.fill_wait_ms > 0 {
            sleep(Duration::from_millis(self.cfg.fill_wait_ms)).await;
        }
    }

    async fn close_step(&mut self, clock: &MarketClock) -> Result<()> {
        if self.open_pairs.is_empty() {
            return Ok(());
        }
        let today = clock.timestamp.date_naive();
        let positions = self
            .broker
            .get_open_positions()
            .await
            .context("failed to read positions")?;

        let open: Vec<(PairKey, f64)> = self
            .open_pairs
            .iter()
            .map(|(pair, reference)| (pair.clone(), *reference))
            .collect();
        for (pair, reference) in open {
            if let Err(e) = self
                .evaluate_open_pair(&pair, reference, &positions, clock, today)
                .await
            {
                log::error!("[CLOSE] {}: {:?}", pair, e);
            }
        }
        Ok(())
    }

    async fn evaluate_open_pair(
        &mut self,
        pair: &PairKey,
        reference: f64,
        positions: &HashMap<String, PositionSnapshot>,
        clock: &MarketClock,
        today: NaiveDate,
    ) -> Result<()> {
        let short = positions.get(&pair.short_leg);
        let long = positions.get(&pair.long_leg);
        let reason = match (short, long) {
            (None, None) => {
                log::warn!("[CLOSE] {}: both legs gone at the broker, dropping", pair);
                return self.finish_close(pair, today, 0.0, CloseReason::LegsGone, clock.timestamp);
            }
            (Some(_), None) | (None, Some(_)) => CloseReason::OneLegMissing,
            (Some(_), Some(_)) => match self.exit_reason(pair, reference, clock).await? {
                Some(reason) => reason,
                None => return Ok(()),
            },
        };

        self.set_phase(pair, PairPhase::CloseEligible);
        log::info!("[CLOSE] {} eligible ({})", pair, reason.label());
        self.set_phase(pair, PairPhase::Closing);

        let mut pnl = 0.0;
        let mut all_closed = true;
        for position in [short, long].into_iter().flatten() {
            match self.broker.close_position(&position.symbol).await {
                Ok(order) => {
                    pnl += position.unrealized_pnl().to_f64().unwrap_or(0.0);
                    log::info!(
                        "[CLOSE] {} closed {} qty={} order={}",
                        pair,
                        position.symbol,
                        position.qty,
                        order.id
                    );
                }
                Err(e) => {
                    all_closed = false;
                    log::error!("[CLOSE] {} failed to close {}: {}", pair, position.symbol, e);
                }
            }
        }

        if all_closed {
            self.finish_close(pair, today, pnl, reason, clock.timestamp)
        } else {
            self.set_phase(pair, PairPhase::Open);
            Ok(())
        }
    }

    async fn exit_reason(
        &self,
        pair: &PairKey,
        reference: f64,
        clock: &MarketClock,
    ) -> Result<Option<CloseReason>> {
        if self.signal_says_exit(pair, reference).await == Some(true) {
            return Ok(Some(CloseReason::Signal));
        }
        if clock.minutes_until_close() > self.cfg.near_close_minutes {
            return Ok(None);
        }
        let orders = self
            .broker
            .get_orders(&pair.symbols(), OrderQueryStatus::All)
            .await
            .context("failed to read orders")?;
        let Some(last_order_at) = orders.iter().map(|o| o.submitted_at).max() else {
            return Ok(None);
        };
        let held_days = (clock.timestamp - last_order_at).num_days();
        if held_days > self.cfg.max_holding_days {
            log::info!("[CLOSE] {} held {} days", pair, held_days);
            return Ok(Some(CloseReason::HoldingTime));
        }
        Ok(None)
    }

    async fn signal_says_exit(&self, pair: &PairKey, reference: f64) -> Option<bool> {
        let lookback = self.cfg.lookback_days;
        let short = match self.market.get_daily_bars(&pair.short_leg, lookback).await {
            Ok(bars) => closes(&bars),
            Err(e) => {
                log::warn!("[CLOSE] {}: no bars for {}: {}", pair, pair.short_leg, e);
                return None;
            }
        };
        let long = match self.market.get_daily_bars(&pair.long_leg, lookback).await {
            Ok(bars) => closes(&bars),
            Err(e) => {
                log::warn!("[CLOSE] {}: no bars for {}: {}", pair, pair.long_leg, e);
                return None;
            }
        };
        let decision = self.model.should_exit(reference, &short, &long);
        if decision.is_none() {
            log::debug!("[SIGNAL] {} {} signal unavailable", pair, self.model.name());
        }
        decision
    }

    /// Removes the record, cools both legs down and journals the result.
    fn finish_close(
        &mut self,
        pair: &PairKey,
        today: NaiveDate,
        pnl: f64,
        reason: CloseReason,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.open_pairs.remove(pair);
        self.store
            .save_open_pairs(&self.open_pairs)
            .context("failed to save open pairs")?;
        for symbol in pair.legs() {
            self.cooldowns.insert(symbol.to_string(), today);
        }
        self.store
            .save_cooldowns(&self.cooldowns)
            .context("failed to save cooldowns")?;
        self.set_phase(pair, PairPhase::Closed);
        log::info!("[CLOSE] {} closed ({}) pnl={:.2}", pair, reason.label(), pnl);

        if let Some(logger) = &self.pnl_logger {
            let record =
                PnlLogRecord::new(&pair.short_leg, &pair.long_leg, pnl, reason.label(), at);
            if let Err(err) = logger.log(&record, today) {
                log::warn!("[PNL] failed to write pnl log: {:?}", err);
            }
        }
        Ok(())
    }
}

fn is_dead_order(order: &Order) -> bool {
    matches!(order.status, OrderStatus::Canceled | OrderStatus::Rejected)
        && order.filled_qty.is_zero()
}
