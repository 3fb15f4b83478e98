use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::PairBotConfig;
use crate::ports::{
    AccountSnapshot, Broker, BrokerError, DailyBar, MarketClock, MarketData, Order, OrderAmount,
    OrderQueryStatus, OrderSide, PositionSnapshot, Quote, TimeInForce,
};
use crate::rate_limit_notifier::notify_rate_limit;
use crate::trade::retry::RetryPolicy;
use std::time::Duration;

fn report_rate_limit<T>(operation: &str, detail: &str, result: &Result<T, BrokerError>) {
    if let Err(err @ BrokerError::RateLimited(_)) = result {
        let context = format!("{} ({})", operation, detail);
        notify_rate_limit(&context, &err.to_string());
    }
}

/// Execution collaborator wrapped with retries and rate-limit reporting.
pub struct BrokerBox {
    pub inner: Arc<dyn Broker>,
    policy: RetryPolicy,
}

impl BrokerBox {
    pub fn new(inner: Arc<dyn Broker>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn from_config(inner: Arc<dyn Broker>, cfg: &PairBotConfig) -> Self {
        Self::new(
            inner,
            RetryPolicy::new(
                cfg.order_retry_attempts,
                Duration::from_millis(cfg.order_retry_delay_ms),
                cfg.order_retry_backoff,
            ),
        )
    }
}

#[async_trait]
impl Broker for BrokerBox {
    async fn get_account_snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
        let inner = &self.inner;
        self.policy
            .run("get_account_snapshot", move || async move {
                let result = inner.get_account_snapshot().await;
                report_rate_limit("get_account_snapshot", "account", &result);
                result
            })
            .await
    }

    async fn get_open_positions(&self) -> Result<HashMap<String, PositionSnapshot>, BrokerError> {
        let inner = &self.inner;
        self.policy
            .run("get_open_positions", move || async move {
                let result = inner.get_open_positions().await;
                report_rate_limit("get_open_positions", "account", &result);
                result
            })
            .await
    }

    async fn submit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: OrderAmount,
        time_in_force: TimeInForce,
    ) -> Result<Order, BrokerError> {
        let inner = &self.inner;
        let detail = format!("{} | {:?} {:?}", symbol, side, amount);
        let detail = detail.as_str();
        self.policy
            .run("submit_order", move || async move {
                let result = inner
                    .submit_order(symbol, side, amount, time_in_force)
                    .await;
                report_rate_limit("submit_order", detail, &result);
                result
            })
            .await
    }

    async fn get_order_by_id(&self, order_id: &str) -> Result<Order, BrokerError> {
        let inner = &self.inner;
        self.policy
            .run("get_order_by_id", move || async move {
                let result = inner.get_order_by_id(order_id).await;
                report_rate_limit("get_order_by_id", order_id, &result);
                result
            })
            .await
    }

    async fn close_position(&self, symbol: &str) -> Result<Order, BrokerError> {
        let inner = &self.inner;
        self.policy
            .run("close_position", move || async move {
                let result = inner.close_position(symbol).await;
                report_rate_limit("close_position", symbol, &result);
                result
            })
            .await
    }

    async fn get_orders(
        &self,
        symbols: &[String],
        status: OrderQueryStatus,
    ) -> Result<Vec<Order>, BrokerError> {
        let inner = &self.inner;
        let detail = symbols.join(",");
        let detail = detail.as_str();
        self.policy
            .run("get_orders", move || async move {
                let result = inner.get_orders(symbols, status).await;
                report_rate_limit("get_orders", detail, &result);
                result
            })
            .await
    }

    async fn get_market_clock(&self) -> Result<MarketClock, BrokerError> {
        let inner = &self.inner;
        self.policy
            .run("get_market_clock", move || async move {
                let result = inner.get_market_clock().await;
                report_rate_limit("get_market_clock", "clock", &result);
                result
            })
            .await
    }
}

/// Market-data collaborator wrapped with retries and rate-limit reporting.
pub struct MarketDataBox {
    pub inner: Arc<dyn MarketData>,
    policy: RetryPolicy,
}

impl MarketDataBox {
    pub fn new(inner: Arc<dyn MarketData>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn from_config(inner: Arc<dyn MarketData>, cfg: &PairBotConfig) -> Self {
        Self::new(
            inner,
            RetryPolicy::new(
                cfg.data_retry_attempts,
                Duration::from_millis(cfg.data_retry_delay_ms),
                cfg.data_retry_backoff,
            ),
        )
    }
}

#[async_trait]
impl MarketData for MarketDataBox {
    async fn get_daily_bars(
        &self,
        symbol: &str,
        lookback_days: u32,
    ) -> Result<Vec<DailyBar>, BrokerError> {
        let inner = &self.inner;
        self.policy
            .run("get_daily_bars", move || async move {
                let result = inner.get_daily_bars(symbol, lookback_days).await;
                report_rate_limit("get_daily_bars", symbol, &result);
                result
            })
            .await
    }

    async fn get_latest_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let inner = &self.inner;
        self.policy
            .run("get_latest_quote", move || async move {
                let result = inner.get_latest_quote(symbol).await;
                report_rate_limit("get_latest_quote", symbol, &result);
                result
            })
            .await
    }

    async fn get_latest_price(&self, symbol: &str) -> Result<Decimal, BrokerError> {
        let inner = &self.inner;
        self.policy
            .run("get_latest_price", move || async move {
                let result = inner.get_latest_price(symbol).await;
                report_rate_limit("get_latest_price", symbol, &result);
                result
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyData {
        calls: AtomicUsize,
        failures: usize,
    }

    #[async_trait]
    impl MarketData for FlakyData {
        async fn get_daily_bars(
            &self,
            _symbol: &str,
            _lookback_days: u32,
        ) -> Result<Vec<DailyBar>, BrokerError> {
            Ok(vec![])
        }

        async fn get_latest_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(BrokerError::RateLimited(format!("429 on {}", symbol)));
            }
            Ok(Quote {
                bid_price: Decimal::from(10),
                ask_price: Decimal::from(11),
            })
        }

        async fn get_latest_price(&self, _symbol: &str) -> Result<Decimal, BrokerError> {
            Err(BrokerError::NotFound("no trades".into()))
        }
    }

    struct RejectingBroker {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Broker for RejectingBroker {
        async fn get_account_snapshot(&self) -> Result<AccountSnapshot, BrokerError> {
            Ok(AccountSnapshot {
                equity: Decimal::ZERO,
                cash: Decimal::ZERO,
            })
        }

        async fn get_open_positions(
            &self,
        ) -> Result<HashMap<String, PositionSnapshot>, BrokerError> {
            Ok(HashMap::new())
        }

        async fn submit_order(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _amount: OrderAmount,
            _time_in_force: TimeInForce,
        ) -> Result<Order, BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::Rejected("not shortable".into()))
        }

        async fn get_order_by_id(&self, order_id: &str) -> Result<Order, BrokerError> {
            Err(BrokerError::NotFound(order_id.to_string()))
        }

        async fn close_position(&self, symbol: &str) -> Result<Order, BrokerError> {
            Err(BrokerError::NotFound(symbol.to_string()))
        }

        async fn get_orders(
            &self,
            _symbols: &[String],
            _status: OrderQueryStatus,
        ) -> Result<Vec<Order>, BrokerError> {
            Ok(vec![])
        }

        async fn get_market_clock(&self) -> Result<MarketClock, BrokerError> {
            let now = Utc::now();
            Ok(MarketClock {
                timestamp: now,
                is_open: false,
                next_open: now,
                next_close: now,
            })
        }
    }

    #[tokio::test]
    async fn market_data_box_retries_rate_limits() {
        let data = Arc::new(FlakyData {
            calls: AtomicUsize::new(0),
            failures: 2,
        });
        let boxed = MarketDataBox::new(data.clone(), RetryPolicy::new(3, Duration::ZERO, 2.0));
        let quote = boxed.get_latest_quote("KO").await.unwrap();
        assert_eq!(quote.bid_price, Decimal::from(10));
        assert_eq!(data.calls.load(Ordering::SeqCst), 3);
        assert!(boxed.get_latest_price("KO").await.is_err());
    }

    #[tokio::test]
    async fn broker_box_does_not_retry_rejections() {
        let broker = Arc::new(RejectingBroker {
            calls: AtomicUsize::new(0),
        });
        let boxed = BrokerBox::new(broker.clone(), RetryPolicy::new(3, Duration::ZERO, 3.0));
        let result = boxed
            .submit_order(
                "PEP",
                OrderSide::Sell,
                OrderAmount::Quantity(Decimal::from(100)),
                TimeInForce::Day,
            )
            .await;
        assert!(matches!(result, Err(BrokerError::Rejected(_))));
        assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
    }
}
