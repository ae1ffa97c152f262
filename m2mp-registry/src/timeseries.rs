//! Time-series samples.

use crate::error::RegistryError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// One timestamped record for a series key (`dev-<uuid>` for devices).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedSample {
    pub key: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub time: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl TimedSample {
    pub fn new(
        key: impl Into<String>,
        data_type: impl Into<String>,
        time: DateTime<Utc>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            key: key.into(),
            data_type: data_type.into(),
            time,
            data,
        }
    }
}

/// Append-only sample storage.
pub trait TimeSeriesStore: Send + Sync {
    fn append(&self, sample: TimedSample) -> Result<(), RegistryError>;

    /// Most recent samples of `key`, newest first.
    fn latest(&self, key: &str, limit: usize) -> Result<Vec<TimedSample>, RegistryError>;
}

/// In-memory store keeping a bounded number of samples per key.
pub struct MemoryTimeSeries {
    series: RwLock<HashMap<String, VecDeque<TimedSample>>>,
    per_key: usize,
}

impl MemoryTimeSeries {
    pub fn new(per_key: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            per_key: per_key.max(1),
        }
    }

    /// Total number of samples held.
    pub fn len(&self) -> usize {
        self.series.read().values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryTimeSeries {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl TimeSeriesStore for MemoryTimeSeries {
    fn append(&self, sample: TimedSample) -> Result<(), RegistryError> {
        let mut series = self.series.write();
        let entries = series.entry(sample.key.clone()).or_default();
        if entries.len() >= self.per_key {
            entries.pop_front();
        }
        entries.push_back(sample);
        Ok(())
    }

    fn latest(&self, key: &str, limit: usize) -> Result<Vec<TimedSample>, RegistryError> {
        let series = self.series.read();
        let mut samples: Vec<TimedSample> = series
            .get(key)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default();
        samples.sort_by(|a, b| b.time.cmp(&a.time));
        samples.truncate(limit);
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_latest_newest_first() {
        let store = MemoryTimeSeries::default();
        store
            .append(TimedSample::new("dev-1", "sen:temp", at(20), json!("21")))
            .unwrap();
        store
            .append(TimedSample::new("dev-1", "sen:temp", at(10), json!("20")))
            .unwrap();
        store
            .append(TimedSample::new("dev-2", "sen:temp", at(30), json!("5")))
            .unwrap();

        let latest = store.latest("dev-1", 10).unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].time, at(20));
        assert_eq!(store.latest("dev-1", 1).unwrap().len(), 1);
        assert!(store.latest("dev-3", 5).unwrap().is_empty());
    }

    #[test]
    fn test_bounded_per_key() {
        let store = MemoryTimeSeries::new(2);
        for i in 0..5 {
            store
                .append(TimedSample::new("dev-1", "x", at(i), json!(i)))
                .unwrap();
        }
        assert_eq!(store.len(), 2);
        assert_eq!(store.latest("dev-1", 5).unwrap()[1].time, at(3));
    }

    #[test]
    fn test_sample_serialization() {
        let sample = TimedSample::new("dev-1", "_server", at(0), json!({"type": "x"}));
        let value = serde_json::to_value(&sample).unwrap();
        assert_eq!(value["type"], "_server");
        assert_eq!(value["key"], "dev-1");
    }
}
