//! Usage Statistics
//!
//! Per-candidate counters for reporting: how often a configuration was
//! committed and at what latency. Nothing here feeds back into
//! selection.

use crate::candidate::Latency;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Stored counters for one candidate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub uses: u64,
    pub total_latency_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl UsageRecord {
    fn record(&mut self, latency: Latency) {
        self.uses += 1;
        if latency.is_reachable() {
            self.total_latency_ms += latency.as_millis();
        }
        self.last_used = Some(Utc::now());
    }
}

/// Aggregate line of the stats report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub path: String,
    pub uses: u64,
    pub average_latency_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
}

impl UsageReport {
    fn from_record(path: &str, record: &UsageRecord) -> Self {
        let average_latency_ms = if record.uses == 0 {
            0.0
        } else {
            ((record.total_latency_ms / record.uses as f64) * 100.0).round() / 100.0
        };
        Self {
            path: path.to_string(),
            uses: record.uses,
            average_latency_ms,
            last_used: record.last_used,
        }
    }
}

/// Destination for usage events
pub trait StatsSink: Send + Sync {
    /// Count one committed activation
    fn record_use(&self, path: &Path, latency: Latency) -> Result<(), StatsError>;

    /// Aggregates, most used first
    fn report(&self) -> Vec<UsageReport>;
}

fn build_report(records: &BTreeMap<String, UsageRecord>) -> Vec<UsageReport> {
    let mut report: Vec<UsageReport> = records
        .iter()
        .map(|(path, record)| UsageReport::from_record(path, record))
        .collect();
    report.sort_by(|a, b| b.uses.cmp(&a.uses));
    report
}

/// Statistics kept only in memory
#[derive(Debug, Default)]
pub struct MemoryStats {
    records: Mutex<BTreeMap<String, UsageRecord>>,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatsSink for MemoryStats {
    fn record_use(&self, path: &Path, latency: Latency) -> Result<(), StatsError> {
        let mut records = self.records.lock().map_err(|_| StatsError::Poisoned)?;
        records
            .entry(path.display().to_string())
            .or_default()
            .record(latency);
        Ok(())
    }

    fn report(&self) -> Vec<UsageReport> {
        self.records
            .lock()
            .map(|records| build_report(&records))
            .unwrap_or_default()
    }
}

/// Statistics persisted as a JSON object keyed by configuration path
///
/// The file is rewritten after every recorded use.
#[derive(Debug)]
pub struct JsonStatsStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, UsageRecord>>,
}

impl JsonStatsStore {
    /// Open a store, loading previous statistics if the file exists
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StatsError> {
        let path = path.into();
        let records = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| StatsError::Io(e.to_string()))?;
            serde_json::from_str(&content).map_err(|e| StatsError::Parse(e.to_string()))?
        } else {
            BTreeMap::new()
        };

        debug!("Loaded usage stats for {} configurations", records.len());
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, records: &BTreeMap<String, UsageRecord>) -> Result<(), StatsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StatsError::Io(e.to_string()))?;
        }
        let json = serde_json::to_string_pretty(records)
            .map_err(|e| StatsError::Parse(e.to_string()))?;
        std::fs::write(&self.path, json).map_err(|e| StatsError::Io(e.to_string()))
    }
}

impl StatsSink for JsonStatsStore {
    fn record_use(&self, path: &Path, latency: Latency) -> Result<(), StatsError> {
        let mut records = self.records.lock().map_err(|_| StatsError::Poisoned)?;
        records
            .entry(path.display().to_string())
            .or_default()
            .record(latency);
        self.save(&records)
    }

    fn report(&self) -> Vec<UsageReport> {
        self.records
            .lock()
            .map(|records| build_report(&records))
            .unwrap_or_default()
    }
}

/// Statistics errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum StatsError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Stats lock poisoned")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_report() {
        let stats = MemoryStats::new();
        stats.record_use(Path::new("/vpn/a.ovpn"), Latency::from_millis(40.0)).unwrap();
        stats.record_use(Path::new("/vpn/a.ovpn"), Latency::from_millis(60.0)).unwrap();
        stats.record_use(Path::new("/vpn/b.ovpn"), Latency::from_millis(10.0)).unwrap();

        let report = stats.report();

        assert_eq!(report.len(), 2);
        assert_eq!(report[0].path, "/vpn/a.ovpn");
        assert_eq!(report[0].uses, 2);
        assert_eq!(report[0].average_latency_ms, 50.0);
        assert!(report[0].last_used.is_some());
    }

    #[test]
    fn test_json_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("logs/rotation_stats.json");

        {
            let store = JsonStatsStore::open(&file).unwrap();
            store.record_use(Path::new("/vpn/de.conf"), Latency::from_millis(25.0)).unwrap();
        }
        assert!(file.exists());

        let reopened = JsonStatsStore::open(&file).unwrap();
        reopened.record_use(Path::new("/vpn/de.conf"), Latency::from_millis(35.0)).unwrap();

        let report = reopened.report();
        assert_eq!(report[0].uses, 2);
        assert_eq!(report[0].average_latency_ms, 30.0);
    }

    #[test]
    fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stats.json");
        std::fs::write(&file, "not json").unwrap();

        assert!(matches!(JsonStatsStore::open(&file), Err(StatsError::Parse(_))));
    }

    #[test]
    fn test_empty_report() {
        assert!(MemoryStats::new().report().is_empty());
    }
}
