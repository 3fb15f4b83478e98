use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use lazy_static::lazy_static;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    AccountSnapshot, Broker, BrokerError, MarketClock, MarketData, Order, OrderAmount,
    OrderQueryStatus, OrderSide, OrderStatus, PositionSnapshot, TimeInForce,
};
use crate::config::PairBotConfig;

lazy_static! {
    static ref PAPER_FILL_RATIO: Decimal = {
        match env::var("PAPER_FILL_RATIO") {
            Ok(val) => val
                .parse::<Decimal>()
                .map(|v| v.clamp(Decimal::ZERO, Decimal::ONE))
                .unwrap_or(Decimal::ONE),
            Err(_) => Decimal::ONE,
        }
    };
}

#[derive(Debug, Clone)]
struct PaperPosition {
    qty: Decimal,
    avg_entry_price: Decimal,
}

#[derive(Debug, Default)]
struct PaperState {
    cash: Decimal,
    positions: HashMap<String, PaperPosition>,
    orders: Vec<Order>,
    now: Option<DateTime<Utc>>,
}

/// In-memory execution venue. Market orders fill at the latest quote.
pub struct PaperBroker {
    market: Arc<dyn MarketData>,
    session_open: NaiveTime,
    session_close: NaiveTime,
    fill_ratio: Decimal,
    state: Mutex<PaperState>,
}

impl PaperBroker {
    pub fn new(
        market: Arc<dyn MarketData>,
        starting_cash: Decimal,
        session_open: NaiveTime,
        session_close: NaiveTime,
    ) -> Self {
        Self {
            market,
            session_open,
            session_close,
            fill_ratio: *PAPER_FILL_RATIO,
            state: Mutex::new(PaperState {
                cash: starting_cash,
                ..PaperState::default()
            }),
        }
    }

    pub fn from_config(market: Arc<dyn MarketData>, cfg: &PairBotConfig) -> Self {
        Self::new(
            market,
            cfg.paper_starting_cash,
            cfg.paper_session_open,
            cfg.paper_session_close,
        )
    }

    pub fn with_fill_ratio(mut self, ratio: Decimal) -> Self {
        self.fill_ratio = ratio.clamp(Decimal::ZERO, Decimal::ONE);
        self
    }

    /// Pins the venue clock; `None` follows wall time.
    pub fn set_time(&self, now: Option<DateTime<Utc>>) -> Result<(), BrokerError> {
        self.lock()?.now = now;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, PaperState>, BrokerError> {
        self.state
            .lock()
            .map_err(|_| BrokerError::Other("paper account state poisoned".to_string()))
    }

    fn now(&self) -> Result<DateTime<Utc>, BrokerError> {
        Ok(self.lock()?.now.unwrap_or_else(Utc::now))
    }

    fn session_bounds(&self, day: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            day.and_time(self.session_open).and_utc(),
            day.and_time(self.session_close).and_utc(),
        )
    }

    fn next_trading_day(mut day: NaiveDate) -> NaiveDate {
        loop {
            day += Duration::days(1);
            if is_trading_day(day) {
                return day;
            }
        }
    }

    async fn fill_price(&self, symbol: &str, side: OrderSide) -> Result<Decimal, BrokerError> {
        let quote = self.market.get_latest_quote(symbol).await?;
        let price = match side {
            OrderSide::Buy => quote.ask_price,
            OrderSide::Sell => quote.bid_price,
        };
        if price <= Decimal::ZERO {
            return Err(BrokerError::Rejected(format!(
                "no tradable quote for {} ({})",
                symbol, price
            )));
        }
        Ok(price)
    }

    fn record_fill(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: OrderAmount,
        price: Decimal,
        fill_ratio: Decimal,
    ) -> Result<Order, BrokerError> {
        let requested = match amount {
            OrderAmount::Quantity(qty) => qty,
            OrderAmount::Notional(notional) => (notional / price).round_dp(6),
        };
        if requested <= Decimal::ZERO {
            return Err(BrokerError::Rejected(format!(
                "order size for {} must be positive: {:?}",
                symbol, amount
            )));
        }
        let filled = (requested * fill_ratio).round_dp(6);
        let status = if filled >= requested {
            OrderStatus::Filled
        } else if filled > Decimal::ZERO {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::New
        };

        let mut state = self.lock()?;
        let now = state.now.unwrap_or_else(Utc::now);
        if filled > Decimal::ZERO {
            let signed = match side {
                OrderSide::Buy => filled,
                OrderSide::Sell => -filled,
            };
            state.cash -= signed * price;
            apply_fill(&mut state.positions, symbol, signed, price);
        }
        let order = Order {
            id: rand::random::<u64>().to_string(),
            symbol: symbol.to_string(),
            side,
            amount,
            status,
            filled_qty: filled,
            filled_avg_price: (filled > Decimal::ZERO).then_some(price),
            submitted_at: now,
        };
        state.orders.push(order.clone());
        log::info!(
            "[PAPER_FILL] symbol={}, side={:?}, qty={}, price={}, status={:?}",
            symbol,
            side,
            filled,
            price,
            status
        );
        Ok(order)
    }
}

fn is_trading_day(day: NaiveDate) -> bool {
    !matches!(day.weekday(), Weekday::Sat | Weekday::Sun)
}

fn apply_fill(
    positions: &mut HashMap<String, PaperPosition>,
    symbol: &str,
    signed_qty: Decimal,
    price: Decimal,
) {
    let (old_qty, old_price) = positions
        .get(symbol)
        .map(|p| (p.qty, p.avg_entry_price))
        .unwrap_or((Decimal::ZERO, Decimal::ZERO));
    let new_qty = old_qty + signed_qty;
    if new_qty.is_zero() {
        positions.remove(symbol);
        return;
    }
    let same_direction = old_qty.is_zero() || old_qty.is_sign_negative() == signed_qty.is_sign_negative();
    let crossed = old_qty.is_sign_negative() != new_qty.is_sign_negative();
    let avg_entry_price = if same_direction {
        (old_qty.abs() * old_price + signed_qty.abs() * price) / new_qty.abs()
    } else if crossed {
        price
    } else {
        old_price
    };
    positions.insert(
        symbol.to_string(),
        PaperPosition {
            qty: new_qty,
            avg_entry_price,
        },
    );
}

#[async_trait]
impl Broker for PaperBroker {
    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
        let positions = self.get_open_positions().await?;
        let cash = self.lock()?.cash;
        let market_value: Decimal = positions
            .values()
            .map(|p| p.qty * p.current_price)
            .sum();
        Ok(AccountSnapshot {
            equity: cash + market_value,
            cash,
        })
    }

    async fn get_open_positions(&self) -> Result<HashMap<String, PositionSnapshot>, BrokerError> {
        let held: Vec<(String, PaperPosition)> = self
            .lock()?
            .positions
            .iter()
            .map(|(symbol, p)| (symbol.clone(), p.clone()))
            .collect();
        let mut snapshots = HashMap::with_capacity(held.len());
        for (symbol, position) in held {
            let current_price = match self.market.get_latest_price(&symbol).await {
                Ok(price) => price,
                Err(BrokerError::NotFound(_)) => position.avg_entry_price,
                Err(e) => return Err(e),
            };
            snapshots.insert(
                symbol.clone(),
                PositionSnapshot {
                    symbol,
                    qty: position.qty,
                    avg_entry_price: position.avg_entry_price,
                    current_price,
                },
            );
        }
        Ok(snapshots)
    }

    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: OrderAmount,
        _time_in_force: TimeInForce,
    ) -> Result<Order, BrokerError> {
        let price = self.fill_price(symbol, side).await?;
        self.record_fill(symbol, side, amount, price, self.fill_ratio)
    }

    async fn get_order_by_id(&self, order_id: &str) -> Result<Order, BrokerError> {
        self.lock()?
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound(format!("order {}", order_id)))
    }

    async fn close_position(&self, symbol: &str) -> Result<Order, BrokerError> {
        let qty = self
            .lock()?
            .positions
            .get(symbol)
            .map(|p| p.qty)
            .ok_or_else(|| BrokerError::NotFound(format!("no position in {}", symbol)))?;
        let side = if qty.is_sign_negative() {
            OrderSide::Buy
        } else {
            OrderSide::Sell
        };
        let price = self.fill_price(symbol, side).await?;
        self.record_fill(
            symbol,
            side,
            OrderAmount::Quantity(qty.abs()),
            price,
            Decimal::ONE,
        )
    }

    async fn get_orders(
        &self,
        symbols: &[String],
        status: OrderQueryStatus,
    ) -> Result<Vec<Order>, BrokerError> {
        let state = self.lock()?;
        Ok(state
            .orders
            .iter()
            .rev()
            .filter(|o| symbols.is_empty() || symbols.contains(&o.symbol))
            .filter(|o| status.matches(o.status))
            .cloned()
            .collect())
    }

    async fn get_market_clock(&self) -> Result<MarketClock, BrokerError> {
        let now = self.now()?;
        let today = now.date_naive();
        let (open, close) = self.session_bounds(today);
        let trading_today = is_trading_day(today);

        let (is_open, next_open, next_close) = if trading_today && now >= open && now < close {
            let (next_open, _) = self.session_bounds(Self::next_trading_day(today));
            (true, next_open, close)
        } else if trading_today && now < open {
            (false, open, close)
        } else {
            let (next_open, next_close) = self.session_bounds(Self::next_trading_day(today));
            (false, next_open, next_close)
        };

        Ok(MarketClock {
            timestamp: now,
            is_open,
            next_open,
            next_close,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{DailyBar, Quote};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    struct StaticQuotes {
        quotes: HashMap<String, Quote>,
    }

    #[async_trait]
    impl MarketData for StaticQuotes {
        async fn get_daily_bars(
            &self,
            _symbol: &str,
            _lookback_days: u32,
        ) -> Result<Vec<DailyBar>, BrokerError> {
            Ok(vec![])
        }

        async fn get_latest_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
            self.quotes
                .get(symbol)
                .copied()
                .ok_or_else(|| BrokerError::NotFound(symbol.to_string()))
        }

        async fn get_latest_price(&self, symbol: &str) -> Result<Decimal, BrokerError> {
            let quote = self.get_latest_quote(symbol).await?;
            Ok((quote.bid_price + quote.ask_price) / dec!(2))
        }
    }

    fn broker() -> PaperBroker {
        let mut quotes = HashMap::new();
        quotes.insert(
            "KO".to_string(),
            Quote {
                bid_price: dec!(59.9),
                ask_price: dec!(60.1),
            },
        );
        quotes.insert(
            "PEP".to_string(),
            Quote {
                bid_price: dec!(50),
                ask_price: dec!(50),
            },
        );
        PaperBroker::new(
            Arc::new(StaticQuotes { quotes }),
            dec!(100000),
            NaiveTime::from_hms_opt(14, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(21, 0, 0).unwrap(),
        )
        .with_fill_ratio(Decimal::ONE)
    }

    #[tokio::test]
    async fn short_then_notional_long_updates_cash_and_positions() {
        let broker = broker();
        let short = broker
            .submit_order("PEP", OrderSide::Sell, OrderAmount::Quantity(dec!(200)), TimeInForce::Day)
            .await
            .unwrap();
        assert_eq!(short.status, OrderStatus::Filled);
        assert_eq!(short.filled_notional(), Some(dec!(10000)));

        let long = broker
            .submit_order("KO", OrderSide::Buy, OrderAmount::Notional(dec!(10000)), TimeInForce::Day)
            .await
            .unwrap();
        assert_eq!(long.filled_avg_price, Some(dec!(60.1)));

        let positions = broker.get_open_positions().await.unwrap();
        assert_eq!(positions["PEP"].qty, dec!(-200));
        assert!(positions["KO"].qty > Decimal::ZERO);

        let account = broker.get_account_snapshot().await.unwrap();
        assert_eq!(account.cash, dec!(100000) + dec!(10000) - long.filled_notional().unwrap());

        let fetched = broker.get_order_by_id(&short.id).await.unwrap();
        assert_eq!(fetched, short);
        let orders = broker
            .get_orders(&["PEP".to_string(), "KO".to_string()], OrderQueryStatus::Closed)
            .await
            .unwrap();
        assert_eq!(orders[0].id, long.id);
        assert_eq!(orders[1].id, short.id);
    }

    #[tokio::test]
    async fn close_position_flattens_even_with_partial_fills() {
        let broker = broker().with_fill_ratio(dec!(0.5));
        let short = broker
            .submit_order("PEP", OrderSide::Sell, OrderAmount::Quantity(dec!(200)), TimeInForce::Day)
            .await
            .unwrap();
        assert_eq!(short.status, OrderStatus::PartiallyFilled);
        assert_eq!(short.filled_qty, dec!(100));

        let cover = broker.close_position("PEP").await.unwrap();
        assert_eq!(cover.side, OrderSide::Buy);
        assert_eq!(cover.filled_qty, dec!(100));
        assert!(broker.get_open_positions().await.unwrap().is_empty());
        assert!(matches!(
            broker.close_position("PEP").await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn clock_follows_weekday_session() {
        let broker = broker();
        // Monday before the open
        broker
            .set_time(Some(Utc.with_ymd_and_hms(2024, 3, 4, 13, 0, 0).unwrap()))
            .unwrap();
        let clock = broker.get_market_clock().await.unwrap();
        assert!(!clock.is_open);
        assert_eq!(clock.seconds_until_open(), 5400);

        broker
            .set_time(Some(Utc.with_ymd_and_hms(2024, 3, 4, 20, 50, 0).unwrap()))
            .unwrap();
        let clock = broker.get_market_clock().await.unwrap();
        assert!(clock.is_open);
        assert_eq!(clock.minutes_until_close(), 10);

        // Saturday rolls to Monday
        broker
            .set_time(Some(Utc.with_ymd_and_hms(2024, 3, 9, 15, 0, 0).unwrap()))
            .unwrap();
        let clock = broker.get_market_clock().await.unwrap();
        assert!(!clock.is_open);
        assert_eq!(
            clock.next_open,
            Utc.with_ymd_and_hms(2024, 3, 11, 14, 30, 0).unwrap()
        );
    }

    #[test]
    fn fills_track_average_entry_price() {
        let mut positions = HashMap::new();
        apply_fill(&mut positions, "KO", dec!(10), dec!(50));
        apply_fill(&mut positions, "KO", dec!(10), dec!(60));
        assert_eq!(positions["KO"].avg_entry_price, dec!(55));
        apply_fill(&mut positions, "KO", dec!(-5), dec!(70));
        assert_eq!(positions["KO"].avg_entry_price, dec!(55));
        apply_fill(&mut positions, "KO", dec!(-25), dec!(40));
        assert_eq!(positions["KO"].qty, dec!(-10));
        assert_eq!(positions["KO"].avg_entry_price, dec!(40));
        apply_fill(&mut positions, "KO", dec!(10), dec!(45));
        assert!(positions.is_empty());
    }
}
