use anyhow::{anyhow, Context, Result};
use chrono::NaiveTime;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::fs::File;
use std::num::{ParseFloatError, ParseIntError};
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEFAULT_INTERVAL_SECS: u64 = 120;
const DEFAULT_FILL_WAIT_MS: u64 = 1000;
const DEFAULT_ENTRY_PERCENT: &str = "0.9";
const DEFAULT_MAX_POSITIONS: usize = 40;
const DEFAULT_MIN_VIABLE_PAIRS: usize = 20;
const DEFAULT_LOT_SIZE: u32 = 100;
const DEFAULT_ODD_LOT_MIN: u32 = 50;
const DEFAULT_COOLDOWN_DAYS: i64 = 31;
const DEFAULT_MAX_HOLDING_DAYS: i64 = 30;
const DEFAULT_NEAR_CLOSE_MINUTES: i64 = 15;
const DEFAULT_SIGNAL_MODEL: &str = "ratio";
const DEFAULT_ENTRY_Z: f64 = 1.0;
const DEFAULT_EXIT_Z: f64 = 0.0;
const DEFAULT_RATIO_WINDOW: usize = 30;
const DEFAULT_COINT_SIGNIFICANCE: f64 = 0.05;
const DEFAULT_COINT_MAX_LAG: usize = 1;
const DEFAULT_MIN_OVERLAP: usize = 20;
const DEFAULT_PCA_VARIANCE: f64 = 0.99;
const DEFAULT_CLUSTER_DISTANCE: f64 = 0.3;
const DEFAULT_MOMENTUM_COLUMN: &str = "m47";
const DEFAULT_MIN_DIVERGENCE_Z: f64 = 2.0;
const DEFAULT_LOOKBACK_DAYS: u32 = 30;
const DEFAULT_OU_RATE: f64 = 0.05;
const DEFAULT_OU_COST: f64 = 0.05;
const DEFAULT_OU_TRADING_DAYS: f64 = 252.0;
const DEFAULT_OU_ALLOC_STEPS: usize = 100;
const DEFAULT_ORDER_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_ORDER_RETRY_DELAY_MS: u64 = 1000;
const DEFAULT_ORDER_RETRY_BACKOFF: f64 = 3.0;
const DEFAULT_DATA_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_DATA_RETRY_DELAY_MS: u64 = 60_000;
const DEFAULT_DATA_RETRY_BACKOFF: f64 = 2.0;
const DEFAULT_STATE_DIR: &str = "saveddata";
const DEFAULT_FEATURES_FILE: &str = "saveddata/features.csv";
const DEFAULT_MAX_WAIT_FOR_OPEN_HOURS: i64 = 8;
const DEFAULT_MAX_SNAPSHOT_AGE_DAYS: i64 = 7;
const DEFAULT_PNL_RETENTION_DAYS: i64 = 90;
const DEFAULT_PAPER_STARTING_CASH: &str = "100000";
const DEFAULT_PAPER_SESSION_OPEN: &str = "14:30";
const DEFAULT_PAPER_SESSION_CLOSE: &str = "21:00";

/// What the binary does on this invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Train,
    Trade,
    Cleanup,
}

impl FromStr for RunMode {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(RunMode::Train),
            "trade" => Ok(RunMode::Trade),
            "cleanup" => Ok(RunMode::Cleanup),
            other => Err(ConfigError::UnknownOption("run mode", other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalModelKind {
    Ratio,
    Kalman,
    Ou,
}

impl FromStr for SignalModelKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ratio" => Ok(SignalModelKind::Ratio),
            "kalman" => Ok(SignalModelKind::Kalman),
            "ou" => Ok(SignalModelKind::Ou),
            other => Err(ConfigError::UnknownOption("signal model", other.to_string())),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ParseIntError(ParseIntError),
    ParseFloatError(ParseFloatError),
    DecimalParseError(rust_decimal::Error),
    TimeParseError(chrono::ParseError),
    UnknownOption(&'static str, String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ParseIntError(e) => write!(f, "Parse int error: {}", e),
            ConfigError::ParseFloatError(e) => write!(f, "Parse float error: {}", e),
            ConfigError::DecimalParseError(e) => write!(f, "Decimal parse error: {}", e),
            ConfigError::TimeParseError(e) => write!(f, "Time parse error: {}", e),
            ConfigError::UnknownOption(what, value) => write!(f, "Unknown {}: '{}'", what, value),
            ConfigError::Invalid(e) => write!(f, "Invalid config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ParseIntError> for ConfigError {
    fn from(err: ParseIntError) -> ConfigError {
        ConfigError::ParseIntError(err)
    }
}

impl From<ParseFloatError> for ConfigError {
    fn from(err: ParseFloatError) -> ConfigError {
        ConfigError::ParseFloatError(err)
    }
}

impl From<rust_decimal::Error> for ConfigError {
    fn from(err: rust_decimal::Error) -> ConfigError {
        ConfigError::DecimalParseError(err)
    }
}

impl From<chrono::ParseError> for ConfigError {
    fn from(err: chrono::ParseError) -> ConfigError {
        ConfigError::TimeParseError(err)
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct PairBotYaml {
    interval_secs: Option<u64>,
    fill_wait_ms: Option<u64>,
    entry_percent: Option<Decimal>,
    max_positions: Option<usize>,
    min_viable_pairs: Option<usize>,
    lot_size: Option<Decimal>,
    odd_lot_min: Option<Decimal>,
    cooldown_days: Option<i64>,
    max_holding_days: Option<i64>,
    near_close_minutes: Option<i64>,
    signal_model: Option<String>,
    entry_z_score: Option<f64>,
    exit_z_score: Option<f64>,
    ratio_window: Option<usize>,
    coint_significance: Option<f64>,
    coint_max_lag: Option<usize>,
    min_overlap_bars: Option<usize>,
    pca_variance: Option<f64>,
    cluster_distance_threshold: Option<f64>,
    momentum_column: Option<String>,
    min_divergence_z: Option<f64>,
    lookback_days: Option<u32>,
    ou_rate: Option<f64>,
    ou_cost: Option<f64>,
    ou_trading_days: Option<f64>,
    ou_alloc_steps: Option<usize>,
    order_retry_attempts: Option<u32>,
    order_retry_delay_ms: Option<u64>,
    order_retry_backoff: Option<f64>,
    data_retry_attempts: Option<u32>,
    data_retry_delay_ms: Option<u64>,
    data_retry_backoff: Option<f64>,
    state_dir: Option<PathBuf>,
    features_file: Option<PathBuf>,
    bars_file: Option<PathBuf>,
    max_wait_for_open_hours: Option<i64>,
    max_snapshot_age_days: Option<i64>,
    pnl_retention_days: Option<i64>,
    paper_starting_cash: Option<Decimal>,
    paper_session_open: Option<String>,
    paper_session_close: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PairBotConfig {
    pub interval_secs: u64,
    pub fill_wait_ms: u64,
    pub entry_percent: Decimal,
    pub max_positions: usize,
    pub min_viable_pairs: usize,
    pub lot_size: Decimal,
    pub odd_lot_min: Decimal,
    pub cooldown_days: i64,
    pub max_holding_days: i64,
    pub near_close_minutes: i64,
    pub signal_model: SignalModelKind,
    pub entry_z: f64,
    pub exit_z: f64,
    pub ratio_window: usize,
    pub coint_significance: f64,
    pub coint_max_lag: usize,
    pub min_overlap: usize,
    pub pca_variance: f64,
    pub cluster_distance_threshold: f64,
    pub momentum_column: String,
    pub min_divergence_z: f64,
    pub lookback_days: u32,
    pub ou_rate: f64,
    pub ou_cost: f64,
    pub ou_trading_days: f64,
    pub ou_alloc_steps: usize,
    pub order_retry_attempts: u32,
    pub order_retry_delay_ms: u64,
    pub order_retry_backoff: f64,
    pub data_retry_attempts: u32,
    pub data_retry_delay_ms: u64,
    pub data_retry_backoff: f64,
    pub state_dir: PathBuf,
    pub features_file: PathBuf,
    pub bars_file: Option<PathBuf>,
    pub max_wait_for_open_hours: i64,
    pub max_snapshot_age_days: i64,
    pub pnl_retention_days: i64,
    pub paper_starting_cash: Decimal,
    pub paper_session_open: NaiveTime,
    pub paper_session_close: NaiveTime,
}

fn parse_session_time(value: &str) -> Result<NaiveTime, ConfigError> {
    Ok(NaiveTime::parse_from_str(value.trim(), "%H:%M")?)
}

fn parse_decimal(value: &str) -> Result<Decimal, ConfigError> {
    Ok(Decimal::from_str(value.trim())?)
}

impl PairBotConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("PAIRBOT_CONFIG")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open pairbot config {}", path_ref.display()))?;
        let yaml: PairBotYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse pairbot config {}", path_ref.display()))?;
        let mut cfg = Self::from_yaml(yaml)?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        log::info!("[CONFIG] loaded {}", path_ref.display());
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::from_yaml(PairBotYaml::default())?;
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        log::info!("[CONFIG] no PAIRBOT_CONFIG, using env and defaults");
        Ok(cfg)
    }

    fn from_yaml(yaml: PairBotYaml) -> Result<Self, ConfigError> {
        let signal_model = yaml
            .signal_model
            .as_deref()
            .unwrap_or(DEFAULT_SIGNAL_MODEL)
            .parse()?;
        let paper_session_open = parse_session_time(
            yaml.paper_session_open
                .as_deref()
                .unwrap_or(DEFAULT_PAPER_SESSION_OPEN),
        )?;
        let paper_session_close = parse_session_time(
            yaml.paper_session_close
                .as_deref()
                .unwrap_or(DEFAULT_PAPER_SESSION_CLOSE),
        )?;

        Ok(PairBotConfig {
            interval_secs: yaml.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS),
            fill_wait_ms: yaml.fill_wait_ms.unwrap_or(DEFAULT_FILL_WAIT_MS),
            entry_percent: match yaml.entry_percent {
                Some(value) => value,
                None => parse_decimal(DEFAULT_ENTRY_PERCENT)?,
            },
            max_positions: yaml.max_positions.unwrap_or(DEFAULT_MAX_POSITIONS),
            min_viable_pairs: yaml.min_viable_pairs.unwrap_or(DEFAULT_MIN_VIABLE_PAIRS),
            lot_size: yaml.lot_size.unwrap_or(Decimal::from(DEFAULT_LOT_SIZE)),
            odd_lot_min: yaml.odd_lot_min.unwrap_or(Decimal::from(DEFAULT_ODD_LOT_MIN)),
            cooldown_days: yaml.cooldown_days.unwrap_or(DEFAULT_COOLDOWN_DAYS),
            max_holding_days: yaml.max_holding_days.unwrap_or(DEFAULT_MAX_HOLDING_DAYS),
            near_close_minutes: yaml.near_close_minutes.unwrap_or(DEFAULT_NEAR_CLOSE_MINUTES),
            signal_model,
            entry_z: yaml.entry_z_score.unwrap_or(DEFAULT_ENTRY_Z),
            exit_z: yaml.exit_z_score.unwrap_or(DEFAULT_EXIT_Z),
            ratio_window: yaml.ratio_window.unwrap_or(DEFAULT_RATIO_WINDOW),
            coint_significance: yaml
                .coint_significance
                .unwrap_or(DEFAULT_COINT_SIGNIFICANCE),
            coint_max_lag: yaml.coint_max_lag.unwrap_or(DEFAULT_COINT_MAX_LAG),
            min_overlap: yaml.min_overlap_bars.unwrap_or(DEFAULT_MIN_OVERLAP),
            pca_variance: yaml.pca_variance.unwrap_or(DEFAULT_PCA_VARIANCE),
            cluster_distance_threshold: yaml
                .cluster_distance_threshold
                .unwrap_or(DEFAULT_CLUSTER_DISTANCE),
            momentum_column: yaml
                .momentum_column
                .unwrap_or_else(|| DEFAULT_MOMENTUM_COLUMN.to_string()),
            min_divergence_z: yaml.min_divergence_z.unwrap_or(DEFAULT_MIN_DIVERGENCE_Z),
            lookback_days: yaml.lookback_days.unwrap_or(DEFAULT_LOOKBACK_DAYS),
            ou_rate: yaml.ou_rate.unwrap_or(DEFAULT_OU_RATE),
            ou_cost: yaml.ou_cost.unwrap_or(DEFAULT_OU_COST),
            ou_trading_days: yaml.ou_trading_days.unwrap_or(DEFAULT_OU_TRADING_DAYS),
            ou_alloc_steps: yaml.ou_alloc_steps.unwrap_or(DEFAULT_OU_ALLOC_STEPS),
            order_retry_attempts: yaml
                .order_retry_attempts
                .unwrap_or(DEFAULT_ORDER_RETRY_ATTEMPTS),
            order_retry_delay_ms: yaml
                .order_retry_delay_ms
                .unwrap_or(DEFAULT_ORDER_RETRY_DELAY_MS),
            order_retry_backoff: yaml
                .order_retry_backoff
                .unwrap_or(DEFAULT_ORDER_RETRY_BACKOFF),
            data_retry_attempts: yaml
                .data_retry_attempts
                .unwrap_or(DEFAULT_DATA_RETRY_ATTEMPTS),
            data_retry_delay_ms: yaml
                .data_retry_delay_ms
                .unwrap_or(DEFAULT_DATA_RETRY_DELAY_MS),
            data_retry_backoff: yaml
                .data_retry_backoff
                .unwrap_or(DEFAULT_DATA_RETRY_BACKOFF),
            state_dir: yaml
                .state_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR)),
            features_file: yaml
                .features_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FEATURES_FILE)),
            bars_file: yaml.bars_file,
            max_wait_for_open_hours: yaml
                .max_wait_for_open_hours
                .unwrap_or(DEFAULT_MAX_WAIT_FOR_OPEN_HOURS),
            max_snapshot_age_days: yaml
                .max_snapshot_age_days
                .unwrap_or(DEFAULT_MAX_SNAPSHOT_AGE_DAYS),
            pnl_retention_days: yaml
                .pnl_retention_days
                .unwrap_or(DEFAULT_PNL_RETENTION_DAYS),
            paper_starting_cash: match yaml.paper_starting_cash {
                Some(value) => value,
                None => parse_decimal(DEFAULT_PAPER_STARTING_CASH)?,
            },
            paper_session_open,
            paper_session_close,
        })
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = env::var("INTERVAL_SECS") {
            self.interval_secs = value.trim().parse()?;
        }
        if let Ok(value) = env::var("FILL_WAIT_MS") {
            self.fill_wait_ms = value.trim().parse()?;
        }
        if let Ok(value) = env::var("ENTRY_PERCENT") {
            self.entry_percent = parse_decimal(&value)?;
        }
        if let Ok(value) = env::var("MAX_POSITIONS") {
            self.max_positions = value.trim().parse()?;
        }
        if let Ok(value) = env::var("MIN_VIABLE_PAIRS") {
            self.min_viable_pairs = value.trim().parse()?;
        }
        if let Ok(value) = env::var("COOLDOWN_DAYS") {
            self.cooldown_days = value.trim().parse()?;
        }
        if let Ok(value) = env::var("MAX_HOLDING_DAYS") {
            self.max_holding_days = value.trim().parse()?;
        }
        if let Ok(value) = env::var("SIGNAL_MODEL") {
            if !value.trim().is_empty() {
                self.signal_model = value.parse()?;
            }
        }
        if let Ok(value) = env::var("ENTRY_Z_SCORE") {
            self.entry_z = value.trim().parse()?;
        }
        if let Ok(value) = env::var("EXIT_Z_SCORE") {
            self.exit_z = value.trim().parse()?;
        }
        if let Ok(value) = env::var("COINT_SIGNIFICANCE") {
            self.coint_significance = value.trim().parse()?;
        }
        if let Ok(value) = env::var("MIN_DIVERGENCE_Z") {
            self.min_divergence_z = value.trim().parse()?;
        }
        if let Ok(value) = env::var("LOOKBACK_DAYS") {
            self.lookback_days = value.trim().parse()?;
        }
        if let Ok(value) = env::var("STATE_DIR") {
            if !value.trim().is_empty() {
                self.state_dir = PathBuf::from(value.trim());
            }
        }
        if let Ok(value) = env::var("FEATURES_FILE") {
            if !value.trim().is_empty() {
                self.features_file = PathBuf::from(value.trim());
            }
        }
        if let Ok(value) = env::var("BARS_FILE") {
            if !value.trim().is_empty() {
                self.bars_file = Some(PathBuf::from(value.trim()));
            }
        }
        if let Ok(value) = env::var("PAPER_STARTING_CASH") {
            self.paper_starting_cash = parse_decimal(&value)?;
        }
        if let Ok(value) = env::var("PAPER_SESSION_OPEN") {
            self.paper_session_open = parse_session_time(&value)?;
        }
        if let Ok(value) = env::var("PAPER_SESSION_CLOSE") {
            self.paper_session_close = parse_session_time(&value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.entry_percent <= Decimal::ZERO || self.entry_percent > Decimal::ONE {
            return Err(anyhow!(
                "entry_percent must be in (0, 1], got {}",
                self.entry_percent
            ));
        }
        if self.max_positions == 0 {
            return Err(anyhow!("max_positions must be positive"));
        }
        if self.lot_size <= Decimal::ZERO || self.odd_lot_min < Decimal::ZERO {
            return Err(anyhow!("lot_size must be positive and odd_lot_min non-negative"));
        }
        if !(self.coint_significance > 0.0 && self.coint_significance < 1.0) {
            return Err(anyhow!(
                "coint_significance must be in (0, 1), got {}",
                self.coint_significance
            ));
        }
        if !(self.pca_variance > 0.0 && self.pca_variance <= 1.0) {
            return Err(anyhow!("pca_variance must be in (0, 1]"));
        }
        if self.ratio_window < 2 || self.min_overlap < 2 {
            return Err(anyhow!("ratio_window and min_overlap_bars need at least 2 bars"));
        }
        if self.cooldown_days < 0 || self.max_holding_days < 0 {
            return Err(anyhow!("day counts cannot be negative"));
        }
        if self.order_retry_attempts == 0 || self.data_retry_attempts == 0 {
            return Err(anyhow!("retry attempts must be at least 1"));
        }
        if self.paper_session_open >= self.paper_session_close {
            return Err(anyhow!(
                "paper session opens at {} but closes at {}",
                self.paper_session_open,
                self.paper_session_close
            ));
        }
        Ok(())
    }

    pub fn pnl_dir(&self) -> PathBuf {
        self.state_dir.join("pnl")
    }

    pub fn cluster_csv_path(&self) -> PathBuf {
        self.state_dir.join("cluster.csv")
    }
}

#[cfg(test)]
impl PairBotConfig {
    pub(crate) fn for_tests() -> Self {
        let mut cfg = match Self::from_yaml(PairBotYaml::default()) {
            Ok(cfg) => cfg,
            Err(e) => panic!("default config: {}", e),
        };
        cfg.fill_wait_ms = 0;
        cfg.order_retry_delay_ms = 0;
        cfg.data_retry_delay_ms = 0;
        cfg.min_viable_pairs = 1;
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = PairBotConfig::from_yaml(PairBotYaml::default()).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.signal_model, SignalModelKind::Ratio);
        assert_eq!(cfg.cooldown_days, 31);
        assert_eq!(cfg.lot_size, Decimal::from(100));
        assert_eq!(cfg.momentum_column, "m47");
    }

    #[test]
    fn yaml_fields_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "signal_model: kalman\nmax_positions: 12\nentry_percent: 0.5\nstate_dir: /tmp/pairbot\npaper_session_open: \"13:30\""
        )
        .unwrap();
        let yaml: PairBotYaml =
            serde_yaml::from_reader(File::open(file.path()).unwrap()).unwrap();
        let cfg = PairBotConfig::from_yaml(yaml).unwrap();
        assert_eq!(cfg.signal_model, SignalModelKind::Kalman);
        assert_eq!(cfg.max_positions, 12);
        assert_eq!(cfg.entry_percent, Decimal::from_str("0.5").unwrap());
        assert_eq!(cfg.state_dir, PathBuf::from("/tmp/pairbot"));
        assert_eq!(cfg.paper_session_open, NaiveTime::from_hms_opt(13, 30, 0).unwrap());
    }

    #[test]
    fn unknown_signal_model_is_rejected() {
        let yaml = PairBotYaml {
            signal_model: Some("garch".to_string()),
            ..Default::default()
        };
        let err = PairBotConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("garch"));
    }

    #[test]
    fn validation_catches_nonsense() {
        let mut cfg = PairBotConfig::for_tests();
        cfg.entry_percent = Decimal::from(2);
        assert!(cfg.validate().is_err());

        let mut cfg = PairBotConfig::for_tests();
        cfg.max_positions = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = PairBotConfig::for_tests();
        cfg.coint_significance = 1.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn run_mode_parses_case_insensitively() {
        assert_eq!("TRAIN".parse::<RunMode>().unwrap(), RunMode::Train);
        assert_eq!(" cleanup ".parse::<RunMode>().unwrap(), RunMode::Cleanup);
        assert!("backtest".parse::<RunMode>().is_err());
    }
}
