use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt;

pub mod bar_file;
pub mod paper_broker;

#[derive(Debug, Clone, PartialEq)]
pub enum BrokerError {
    RateLimited(String),
    Transport(String),
    Rejected(String),
    NotFound(String),
    Other(String),
}

impl BrokerError {
    /// Rate limits and transport failures are worth another attempt; everything
    /// else is a verdict from the venue.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::RateLimited(_) | BrokerError::Transport(_))
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BrokerError::RateLimited(e) => write!(f, "Rate limited: {}", e),
            BrokerError::Transport(e) => write!(f, "Transport error: {}", e),
            BrokerError::Rejected(e) => write!(f, "Rejected: {}", e),
            BrokerError::NotFound(e) => write!(f, "Not found: {}", e),
            BrokerError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for BrokerError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeInForce {
    Day,
}

/// Market orders are sized either in shares or in dollars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderAmount {
    Quantity(Decimal),
    Notional(Decimal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderQueryStatus {
    Open,
    Closed,
    All,
}

impl OrderQueryStatus {
    pub fn matches(self, status: OrderStatus) -> bool {
        match self {
            OrderQueryStatus::Open => !status.is_closed(),
            OrderQueryStatus::Closed => status.is_closed(),
            OrderQueryStatus::All => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub amount: OrderAmount,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub submitted_at: DateTime<Utc>,
}

impl Order {
    pub fn filled_notional(&self) -> Option<Decimal> {
        self.filled_avg_price.map(|price| price * self.filled_qty)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccountSnapshot {
    pub equity: Decimal,
    pub cash: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionSnapshot {
    pub symbol: String,
    /// Signed share count; negative for shorts.
    pub qty: Decimal,
    pub avg_entry_price: Decimal,
    pub current_price: Decimal,
}

impl PositionSnapshot {
    pub fn entry_notional(&self) -> Decimal {
        self.qty.abs() * self.avg_entry_price
    }

    /// Profit of the position in dollars at the current price.
    pub fn unrealized_pnl(&self) -> Decimal {
        (self.current_price - self.avg_entry_price) * self.qty
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketClock {
    pub timestamp: DateTime<Utc>,
    pub is_open: bool,
    pub next_open: DateTime<Utc>,
    pub next_close: DateTime<Utc>,
}

impl MarketClock {
    pub fn seconds_until_open(&self) -> i64 {
        (self.next_open - self.timestamp).num_seconds().max(0)
    }

    pub fn minutes_until_close(&self) -> i64 {
        (self.next_close - self.timestamp).num_minutes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub bid_price: Decimal,
    pub ask_price: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub vwap: f64,
}

pub fn closes(bars: &[DailyBar]) -> Vec<f64> {
    bars.iter().map(|bar| bar.close).collect()
}

/// Execution venue. Implementations must be usable behind `Arc<dyn Broker>`.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, BrokerError>;

    async fn get_open_positions(&self) -> Result<HashMap<String, PositionSnapshot>, BrokerError>;

    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: OrderAmount,
        time_in_force: TimeInForce,
    ) -> Result<Order, BrokerError>;

    async fn get_order_by_id(&self, order_id: &str) -> Result<Order, BrokerError>;

    async fn close_position(&self, symbol: &str) -> Result<Order, BrokerError>;

    /// Newest first.
    async fn get_orders(
        &self,
        symbols: &[String],
        status: OrderQueryStatus,
    ) -> Result<Vec<Order>, BrokerError>;

    async fn get_market_clock(&self) -> Result<MarketClock, BrokerError>;
}

#[async_trait]
pub trait MarketData: Send + Sync {
    /// Daily bars, oldest first, covering the last `lookback_days` calendar days.
    async fn get_daily_bars(
        &self,
        symbol: &str,
        lookback_days: u32,
    ) -> Result<Vec<DailyBar>, BrokerError>;

    async fn get_latest_quote(&self, symbol: &str) -> Result<Quote, BrokerError>;

    async fn get_latest_price(&self, symbol: &str) -> Result<Decimal, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn only_rate_limits_and_transport_errors_are_transient() {
        assert!(BrokerError::RateLimited("429".into()).is_transient());
        assert!(BrokerError::Transport("reset".into()).is_transient());
        assert!(!BrokerError::Rejected("insufficient buying power".into()).is_transient());
        assert!(!BrokerError::NotFound("AAPL".into()).is_transient());
        assert!(!BrokerError::Other("boom".into()).is_transient());
    }

    #[test]
    fn short_position_pnl_is_positive_when_price_falls() {
        let position = PositionSnapshot {
            symbol: "XOM".into(),
            qty: dec!(-100),
            avg_entry_price: dec!(50),
            current_price: dec!(45),
        };
        assert_eq!(position.entry_notional(), dec!(5000));
        assert_eq!(position.unrealized_pnl(), dec!(500));
    }

    #[test]
    fn clock_counts_down_to_open_and_close() {
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 13, 0, 0).unwrap();
        let clock = MarketClock {
            timestamp: now,
            is_open: false,
            next_open: Utc.with_ymd_and_hms(2024, 3, 4, 14, 30, 0).unwrap(),
            next_close: Utc.with_ymd_and_hms(2024, 3, 4, 21, 0, 0).unwrap(),
        };
        assert_eq!(clock.seconds_until_open(), 5400);
        assert_eq!(clock.minutes_until_close(), 480);
    }

    #[test]
    fn query_status_filters_terminal_orders() {
        assert!(OrderQueryStatus::Closed.matches(OrderStatus::Filled));
        assert!(!OrderQueryStatus::Closed.matches(OrderStatus::PartiallyFilled));
        assert!(OrderQueryStatus::Open.matches(OrderStatus::New));
        assert!(OrderQueryStatus::All.matches(OrderStatus::Rejected));
    }
}
