use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PnlLogRecord {
    pub ts: i64,
    pub pair: String,
    pub short_leg: String,
    pub long_leg: String,
    pub pnl: f64,
    pub reason: String,
}

impl PnlLogRecord {
    pub fn new(short_leg: &str, long_leg: &str, pnl: f64, reason: &str, at: DateTime<Utc>) -> Self {
        Self {
            ts: at.timestamp(),
            pair: format!("{},{}", short_leg, long_leg),
            short_leg: short_leg.to_string(),
            long_leg: long_leg.to_string(),
            pnl,
            reason: reason.to_string(),
        }
    }
}

/// Realized pair P&L journal: one JSON line per closed pair in a file per day.
#[derive(Debug, Clone)]
pub struct PnlLogger {
    dir: PathBuf,
    retain_days: i64,
}

impl PnlLogger {
    pub fn new<P: AsRef<Path>>(dir: P, retain_days: i64) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            retain_days: retain_days.max(1),
        }
    }

    pub fn log(&self, record: &PnlLogRecord, today: NaiveDate) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let line = serde_json::to_string(record)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(today))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn log_path(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("pnl-{}.jsonl", day.format("%Y%m%d")))
    }

    /// Deletes journal files dated before the retention window.
    pub fn cleanup(&self, today: NaiveDate) -> usize {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(day) = pnl_log_date(&path) else {
                continue;
            };
            if (today - day).num_days() > self.retain_days && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

fn pnl_log_date(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let stamp = name.strip_prefix("pnl-")?.strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(stamp, "%Y%m%d").ok()
}
