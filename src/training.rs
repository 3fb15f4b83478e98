use anyhow::{Context, Result};
use chrono::NaiveDate;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use crate::config::PairBotConfig;
use crate::pairs::cluster::{ClusterAssignment, FeatureClusterer, FeatureMatrix};
use crate::pairs::cointegration::CointegrationFilter;
use crate::pairs::former::PairFormer;
use crate::persistence::{cooldown_active, PersistenceStore, TrainingSnapshot};
use crate::ports::{closes, MarketData};
use crate::signal::{build_model, SpreadModel};

/// Offline pipeline producing the training snapshot the engine trades from.
pub struct Trainer {
    cfg: PairBotConfig,
    market: Arc<dyn MarketData>,
    store: Arc<dyn PersistenceStore>,
    clusterer: FeatureClusterer,
    former: PairFormer,
    cointegration: CointegrationFilter,
    model: Box<dyn SpreadModel>,
}

impl Trainer {
    pub fn new(
        cfg: PairBotConfig,
        market: Arc<dyn MarketData>,
        store: Arc<dyn PersistenceStore>,
    ) -> Self {
        Self {
            clusterer: FeatureClusterer::from_config(&cfg),
            former: PairFormer::from_config(&cfg),
            cointegration: CointegrationFilter::from_config(&cfg),
            model: build_model(&cfg),
            cfg,
            market,
            store,
        }
    }

    pub async fn run(&self, today: NaiveDate) -> Result<TrainingSnapshot> {
        let cooldowns = self.store.load_cooldowns().context("failed to load cooldowns")?;
        let excluded: HashSet<String> = cooldowns
            .keys()
            .filter(|symbol| cooldown_active(&cooldowns, symbol, today, self.cfg.cooldown_days))
            .cloned()
            .collect();
        if !excluded.is_empty() {
            log::info!("[TRAIN] excluding {} symbols in cooldown", excluded.len());
        }

        let matrix = FeatureMatrix::from_csv_path(&self.cfg.features_file)?
            .without_symbols(&excluded);
        let assignments = self.clusterer.fit(&matrix).context("clustering failed")?;
        let cluster_path = self.cfg.cluster_csv_path();
        write_cluster_csv(&cluster_path, &assignments)
            .with_context(|| format!("failed to write {}", cluster_path.display()))?;

        let candidates = self.former.form_pairs(&assignments, &excluded);

        let mut history: HashMap<String, Option<Vec<f64>>> = HashMap::new();
        let mut final_pairs = BTreeMap::new();
        let mut ranking = Vec::new();
        for candidate in &candidates {
            let pair = &candidate.pair;
            let Some(short_leg) = self.closes_for(&pair.short_leg, &mut history).await else {
                continue;
            };
            let Some(long_leg) = self.closes_for(&pair.long_leg, &mut history).await else {
                continue;
            };

            let Some(coint) = self.cointegration.test(&short_leg, &long_leg) else {
                log::debug!("[TRAIN] {}: not enough clean history to test", pair);
                continue;
            };
            if !self.cointegration.accepts(&coint) {
                log::debug!(
                    "[TRAIN] {}: rejected, p={:.4} t={:.3}",
                    pair,
                    coint.p_value,
                    coint.t_stat
                );
                continue;
            }

            match self.model.evaluate(&short_leg, &long_leg) {
                Some(signal) if signal.enter => {
                    log::info!(
                        "[TRAIN] {}: divergence={:.4} z={:.2} p={:.4} {}={:.4}",
                        pair,
                        candidate.divergence,
                        candidate.divergence_z,
                        coint.p_value,
                        self.model.name(),
                        signal.value
                    );
                    final_pairs.insert(pair.clone(), signal.reference);
                    ranking.push(pair.clone());
                }
                Some(_) => log::debug!("[TRAIN] {}: {} not enterable", pair, self.model.name()),
                None => log::debug!("[TRAIN] {}: {} signal unavailable", pair, self.model.name()),
            }
        }

        let snapshot = TrainingSnapshot {
            trained_at_date: today,
            final_pairs,
            ranking,
        };
        self.store
            .save_snapshot(&snapshot)
            .context("failed to save training snapshot")?;
        log::info!(
            "[TRAIN] {} of {} candidates tradable ({} model)",
            snapshot.final_pairs.len(),
            candidates.len(),
            self.model.name()
        );
        Ok(snapshot)
    }

    async fn closes_for(
        &self,
        symbol: &str,
        history: &mut HashMap<String, Option<Vec<f64>>>,
    ) -> Option<Vec<f64>> {
        if let Some(cached) = history.get(symbol) {
            return cached.clone();
        }
        let fetched = match self
            .market
            .get_daily_bars(symbol, self.cfg.lookback_days)
            .await
        {
            Ok(bars) if !bars.is_empty() => Some(closes(&bars)),
            Ok(_) => {
                log::warn!("[TRAIN] no bars for {}, skipping its pairs", symbol);
                None
            }
            Err(e) => {
                log::warn!("[TRAIN] failed to fetch bars for {}: {}", symbol, e);
                None
            }
        };
        history.insert(symbol.to_string(), fetched.clone());
        fetched
    }
}

fn write_cluster_csv(path: &Path, assignments: &[ClusterAssignment]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["symbol", "cluster", "momentum"])?;
    for assignment in assignments {
        writer.write_record([
            assignment.symbol.clone(),
            assignment.cluster_id.to_string(),
            assignment.momentum.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
