use crate::config::PairBotConfig;
use crate::pairs::PairKey;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Open pair -> reference value captured at entry.
pub type OpenPairRegistry = BTreeMap<PairKey, f64>;
/// Symbol -> date its last pair was closed.
pub type CooldownRegistry = BTreeMap<String, NaiveDate>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSnapshot {
    pub trained_at_date: NaiveDate,
    pub final_pairs: BTreeMap<PairKey, f64>,
    #[serde(default)]
    pub ranking: Vec<PairKey>,
}

impl TrainingSnapshot {
    /// Pairs in ranking order; anything missing from the ranking goes last.
    pub fn ranked_pairs(&self) -> Vec<(PairKey, f64)> {
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(self.final_pairs.len());
        for key in &self.ranking {
            if let Some(value) = self.final_pairs.get(key) {
                if seen.insert(key.clone()) {
                    out.push((key.clone(), *value));
                }
            }
        }
        for (key, value) in &self.final_pairs {
            if !seen.contains(key) {
                out.push((key.clone(), *value));
            }
        }
        out
    }

    pub fn age_days(&self, today: NaiveDate) -> i64 {
        (today - self.trained_at_date).num_days()
    }
}

pub fn cooldown_active(
    cooldowns: &CooldownRegistry,
    symbol: &str,
    today: NaiveDate,
    window_days: i64,
) -> bool {
    cooldowns
        .get(symbol)
        .map(|closed_on| (today - *closed_on).num_days() <= window_days)
        .unwrap_or(false)
}

/// Removes entries older than the window. Returns the removed symbols.
pub fn purge_expired_cooldowns(
    cooldowns: &mut CooldownRegistry,
    today: NaiveDate,
    window_days: i64,
) -> Vec<String> {
    let expired: Vec<String> = cooldowns
        .iter()
        .filter(|(_, closed_on)| (today - **closed_on).num_days() > window_days)
        .map(|(symbol, _)| symbol.clone())
        .collect();
    for symbol in &expired {
        cooldowns.remove(symbol);
    }
    expired
}

/// Durable storage for the three engine records. Every save replaces the
/// whole record.
pub trait PersistenceStore: Send + Sync {
    fn load_open_pairs(&self) -> Result<OpenPairRegistry>;
    fn save_open_pairs(&self, record: &OpenPairRegistry) -> Result<()>;
    fn load_cooldowns(&self) -> Result<CooldownRegistry>;
    fn save_cooldowns(&self, record: &CooldownRegistry) -> Result<()>;
    fn load_snapshot(&self) -> Result<Option<TrainingSnapshot>>;
    fn save_snapshot(&self, snapshot: &TrainingSnapshot) -> Result<()>;
}

pub const OPEN_PAIRS_FILE: &str = "open_pairs.json";
pub const COOLDOWNS_FILE: &str = "cooldowns.json";
pub const SNAPSHOT_FILE: &str = "training_snapshot.json";

#[derive(Debug, Clone)]
pub struct JsonFileStore {
    open_pairs_path: PathBuf,
    cooldowns_path: PathBuf,
    snapshot_path: PathBuf,
}

impl JsonFileStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            open_pairs_path: dir.join(OPEN_PAIRS_FILE),
            cooldowns_path: dir.join(COOLDOWNS_FILE),
            snapshot_path: dir.join(SNAPSHOT_FILE),
        }
    }

    pub fn from_config(cfg: &PairBotConfig) -> Self {
        Self::new(&cfg.state_dir)
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()))
            }
        };
        if content.trim().is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(value))
    }

    /// Writes through a temp file and a rename.
    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }
}

impl PersistenceStore for JsonFileStore {
    fn load_open_pairs(&self) -> Result<OpenPairRegistry> {
        Ok(Self::read_json(&self.open_pairs_path)?.unwrap_or_default())
    }

    fn save_open_pairs(&self, record: &OpenPairRegistry) -> Result<()> {
        Self::write_json(&self.open_pairs_path, record)
    }

    fn load_cooldowns(&self) -> Result<CooldownRegistry> {
        Ok(Self::read_json(&self.cooldowns_path)?.unwrap_or_default())
    }

    fn save_cooldowns(&self, record: &CooldownRegistry) -> Result<()> {
        Self::write_json(&self.cooldowns_path, record)
    }

    fn load_snapshot(&self) -> Result<Option<TrainingSnapshot>> {
        Self::read_json(&self.snapshot_path)
    }

    fn save_snapshot(&self, snapshot: &TrainingSnapshot) -> Result<()> {
        Self::write_json(&self.snapshot_path, snapshot)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn missing_and_empty_files_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load_open_pairs().unwrap().is_empty());
        assert!(store.load_cooldowns().unwrap().is_empty());
        assert!(store.load_snapshot().unwrap().is_none());

        fs::write(dir.path().join(OPEN_PAIRS_FILE), "  \n").unwrap();
        assert!(store.load_open_pairs().unwrap().is_empty());
    }

    #[test]
    fn records_round_trip_with_exact_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested"));

        let mut open = OpenPairRegistry::new();
        open.insert(PairKey::new("KO", "PEP"), 1.0375);
        open.insert(PairKey::new("BRK.B", "JPM"), -0.25);
        store.save_open_pairs(&open).unwrap();
        assert_eq!(store.load_open_pairs().unwrap(), open);

        let mut cooldowns = CooldownRegistry::new();
        cooldowns.insert("KO".to_string(), date("2024-05-01"));
        store.save_cooldowns(&cooldowns).unwrap();
        let raw = fs::read_to_string(dir.path().join("nested").join(COOLDOWNS_FILE)).unwrap();
        assert!(raw.contains("\"2024-05-01\""));
        assert_eq!(store.load_cooldowns().unwrap(), cooldowns);

        let snapshot = TrainingSnapshot {
            trained_at_date: date("2024-05-02"),
            final_pairs: open.clone(),
            ranking: vec![PairKey::new("KO", "PEP"), PairKey::new("BRK.B", "JPM")],
        };
        store.save_snapshot(&snapshot).unwrap();
        assert_eq!(store.load_snapshot().unwrap(), Some(snapshot));
    }

    #[test]
    fn reads_hand_written_open_pairs_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(OPEN_PAIRS_FILE),
            r#"{"AAPL,MSFT": 1.02, "XOM,CVX": 0.5}"#,
        )
        .unwrap();
        let store = JsonFileStore::new(dir.path());
        let open = store.load_open_pairs().unwrap();
        assert_eq!(open.get(&PairKey::new("AAPL", "MSFT")), Some(&1.02));
        assert_eq!(open.len(), 2);
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(COOLDOWNS_FILE), "{not json").unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load_cooldowns().is_err());
    }

    #[test]
    fn cooldown_window_is_inclusive() {
        let mut cooldowns = CooldownRegistry::new();
        cooldowns.insert("OLD".to_string(), date("2024-01-01"));
        cooldowns.insert("EDGE".to_string(), date("2024-02-01"));
        cooldowns.insert("NEW".to_string(), date("2024-02-20"));
        let today = date("2024-03-03");

        assert!(!cooldown_active(&cooldowns, "OLD", today, 31));
        assert!(cooldown_active(&cooldowns, "EDGE", today, 31));
        assert!(cooldown_active(&cooldowns, "NEW", today, 31));
        assert!(!cooldown_active(&cooldowns, "NONE", today, 31));

        let removed = purge_expired_cooldowns(&mut cooldowns, today, 31);
        assert_eq!(removed, vec!["OLD".to_string()]);
        assert_eq!(cooldowns.len(), 2);
    }

    #[test]
    fn snapshot_ranking_orders_pairs() {
        let mut final_pairs = BTreeMap::new();
        final_pairs.insert(PairKey::new("A", "B"), 1.0);
        final_pairs.insert(PairKey::new("C", "D"), 2.0);
        final_pairs.insert(PairKey::new("E", "F"), 3.0);
        let snapshot = TrainingSnapshot {
            trained_at_date: date("2024-01-10"),
            final_pairs,
            ranking: vec![PairKey::new("C", "D"), PairKey::new("X", "Y")],
        };
        let ranked: Vec<String> = snapshot
            .ranked_pairs()
            .into_iter()
            .map(|(k, _)| k.to_string())
            .collect();
        assert_eq!(ranked, vec!["C,D", "A,B", "E,F"]);
        assert_eq!(snapshot.age_days(date("2024-01-17")), 7);
    }
}
