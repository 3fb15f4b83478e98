use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::{BrokerError, DailyBar, MarketData, Quote};

// Layout of one line of the daily dump file
#[derive(Debug, Clone, Deserialize)]
struct DumpedSymbolBar {
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: f64,
    #[serde(default)]
    vwap: Option<f64>,
    #[serde(default)]
    bid_price: Option<f64>,
    #[serde(default)]
    ask_price: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct DumpedDataEntry {
    timestamp: i64,
    prices: HashMap<String, DumpedSymbolBar>,
}

/// Market data served from a JSONL dump of daily snapshots.
#[derive(Debug)]
pub struct BarFileMarketData {
    bars: HashMap<String, BTreeMap<NaiveDate, DumpedSymbolBar>>,
    last_date: NaiveDate,
}

impl BarFileMarketData {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, BrokerError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            BrokerError::Other(format!("failed to open bar file {}: {}", path.display(), e))
        })?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, BrokerError> {
        let mut bars: HashMap<String, BTreeMap<NaiveDate, DumpedSymbolBar>> = HashMap::new();
        let mut last_date: Option<NaiveDate> = None;

        for line in reader.lines() {
            let line =
                line.map_err(|e| BrokerError::Other(format!("failed to read bar line: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: DumpedDataEntry = serde_json::from_str(&line).map_err(|e| {
                BrokerError::Other(format!("failed to parse bar entry '{}': {}", line, e))
            })?;
            let date = DateTime::from_timestamp_millis(entry.timestamp)
                .ok_or_else(|| {
                    BrokerError::Other(format!("invalid bar timestamp {}", entry.timestamp))
                })?
                .date_naive();
            last_date = Some(last_date.map_or(date, |d| d.max(date)));
            for (symbol, bar) in entry.prices {
                bars.entry(symbol).or_default().insert(date, bar);
            }
        }

        let last_date = last_date
            .ok_or_else(|| BrokerError::Other("bar file is empty or invalid".to_string()))?;
        log::info!(
            "Loaded daily bars for {} symbols through {}",
            bars.len(),
            last_date
        );
        Ok(Self { bars, last_date })
    }

    pub fn last_date(&self) -> NaiveDate {
        self.last_date
    }

    fn series(&self, symbol: &str) -> Result<&BTreeMap<NaiveDate, DumpedSymbolBar>, BrokerError> {
        self.bars
            .get(symbol)
            .ok_or_else(|| BrokerError::NotFound(format!("no bars for {}", symbol)))
    }

    fn latest(&self, symbol: &str) -> Result<&DumpedSymbolBar, BrokerError> {
        self.series(symbol)?
            .values()
            .next_back()
            .ok_or_else(|| BrokerError::NotFound(format!("no bars for {}", symbol)))
    }
}

fn to_decimal(value: f64, symbol: &str) -> Result<Decimal, BrokerError> {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(4))
        .ok_or_else(|| BrokerError::Other(format!("unrepresentable price {} for {}", value, symbol)))
}

#[async_trait]
impl MarketData for BarFileMarketData {
    async fn get_daily_bars(
        &self,
        symbol: &str,
        lookback_days: u32,
    ) -> Result<Vec<DailyBar>, BrokerError> {
        let start = self.last_date - Duration::days(i64::from(lookback_days));
        let bars = self
            .series(symbol)?
            .range(start..)
            .filter(|(date, _)| **date > start)
            .map(|(date, bar)| DailyBar {
                date: *date,
                open: bar.open,
                high: bar.high,
                low: bar.low,
                close: bar.close,
                volume: bar.volume,
                vwap: bar.vwap.unwrap_or(bar.close),
            })
            .collect();
        Ok(bars)
    }

    async fn get_latest_quote(&self, symbol: &str) -> Result<Quote, BrokerError> {
        let bar = self.latest(symbol)?;
        Ok(Quote {
            bid_price: to_decimal(bar.bid_price.unwrap_or(bar.close), symbol)?,
            ask_price: to_decimal(bar.ask_price.unwrap_or(bar.close), symbol)?,
        })
    }

    async fn get_latest_price(&self, symbol: &str) -> Result<Decimal, BrokerError> {
        to_decimal(self.latest(symbol)?.close, symbol)
    }
}
