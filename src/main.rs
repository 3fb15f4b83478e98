use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, FixedOffset, Utc};
use env_logger::Builder;
use log::LevelFilter;
use pairbot::config::{PairBotConfig, RunMode};
use pairbot::pairtrade::PairTradeEngine;
use pairbot::persistence::{purge_expired_cooldowns, JsonFileStore, PersistenceStore};
use pairbot::ports::bar_file::BarFileMarketData;
use pairbot::ports::paper_broker::PaperBroker;
use pairbot::ports::{Broker, MarketData};
use pairbot::trade::execution::broker_box::{BrokerBox, MarketDataBox};
use pairbot::trade::pnl_log::PnlLogger;
use pairbot::training::Trainer;
use std::env;
use std::io::Write;
use std::str::FromStr;
use std::sync::Arc;

fn init_logging() -> Result<()> {
    let offset_seconds = env::var("TIMEZONE_OFFSET")
        .unwrap_or_else(|_| "0".to_string())
        .parse::<i32>()
        .context("Invalid TIMEZONE_OFFSET")?;
    let offset = FixedOffset::east_opt(offset_seconds).ok_or_else(|| anyhow!("Invalid offset"))?;
    Builder::from_default_env()
        .format(move |buf, record| {
            let utc_now: DateTime<Utc> = Utc::now();
            let local_now = utc_now.with_timezone(&offset);
            writeln!(
                buf,
                "{} [{}] - {}",
                local_now.format("%Y-%m-%dT%H:%M:%S%z"),
                record.level(),
                record.args()
            )
        })
        .filter(
            None,
            LevelFilter::from_str(&env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
                .unwrap_or(LevelFilter::Info),
        )
        .init();
    Ok(())
}

fn run_mode() -> Result<RunMode> {
    let raw = env::args()
        .nth(1)
        .or_else(|| env::var("PAIRBOT_MODE").ok())
        .unwrap_or_else(|| "trade".to_string());
    Ok(RunMode::from_str(&raw)?)
}

fn market_data(cfg: &PairBotConfig) -> Result<Arc<dyn MarketData>> {
    let path = cfg
        .bars_file
        .as_ref()
        .ok_or_else(|| anyhow!("BARS_FILE is not set"))?;
    let data = BarFileMarketData::new(path)
        .with_context(|| format!("failed to load bars from {}", path.display()))?;
    Ok(Arc::new(MarketDataBox::from_config(Arc::new(data), cfg)))
}

fn cleanup(cfg: &PairBotConfig, store: &dyn PersistenceStore) -> Result<()> {
    let today = Utc::now().date_naive();
    let mut cooldowns = store.load_cooldowns().context("failed to load cooldowns")?;
    let released = purge_expired_cooldowns(&mut cooldowns, today, cfg.cooldown_days);
    store
        .save_cooldowns(&cooldowns)
        .context("failed to save cooldowns")?;
    log::info!(
        "[STATE] released {} cooldowns, {} remain",
        released.len(),
        cooldowns.len()
    );
    let removed = PnlLogger::new(cfg.pnl_dir(), cfg.pnl_retention_days).cleanup(today);
    log::info!("[PNL] removed {} old journal files", removed);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let git_hash = option_env!("PAIRBOT_GIT_HASH").unwrap_or("unknown");
    log::info!("pairbot git: {}", git_hash);

    let mode = run_mode()?;
    let cfg = PairBotConfig::from_env_or_yaml().context("invalid pairbot config")?;
    let store: Arc<dyn PersistenceStore> = Arc::new(JsonFileStore::from_config(&cfg));
    log::info!("Starting pairbot in {:?} mode", mode);

    match mode {
        RunMode::Cleanup => cleanup(&cfg, store.as_ref()),
        RunMode::Train => {
            let market = market_data(&cfg)?;
            let trainer = Trainer::new(cfg, market, store);
            trainer.run(Utc::now().date_naive()).await?;
            Ok(())
        }
        RunMode::Trade => {
            let market = market_data(&cfg)?;
            let paper: Arc<dyn Broker> = Arc::new(PaperBroker::from_config(market.clone(), &cfg));
            let broker: Arc<dyn Broker> = Arc::new(BrokerBox::from_config(paper, &cfg));
            let mut engine = PairTradeEngine::new(cfg, broker, market, store)
                .context("failed to initialize pairbot engine")?;
            engine.run().await
        }
    }
}
