//! Responses-per-second tracking from cumulative packet counters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// Kea's statistic timestamps are local wall time without a zone; they are
/// taken as UTC.
const KEA_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// A counter reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpsSample {
    pub count: u64,
    pub sampled_at: DateTime<Utc>,
}

/// What happened between two consecutive readings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RpsInterval {
    pub delta: u64,
    pub rate: f64,
}

/// Counter increase since `previous`. A drop means the daemon restarted
/// and counted from zero again, so the whole new value is the increase.
pub fn compute_delta(previous: Option<&RpsSample>, current: &RpsSample) -> u64 {
    match previous {
        None => 0,
        Some(prev) if current.count >= prev.count => current.count - prev.count,
        Some(_) => current.count,
    }
}

pub fn compute_interval(previous: Option<&RpsSample>, current: &RpsSample) -> RpsInterval {
    let delta = compute_delta(previous, current);
    let elapsed = previous
        .map(|prev| (current.sampled_at - prev.sampled_at).num_milliseconds() as f64 / 1000.0)
        .unwrap_or(0.0);
    let rate = if elapsed > 0.0 { delta as f64 / elapsed } else { 0.0 };
    RpsInterval { delta, rate }
}

/// Remembers the last reading of each daemon. Each daemon's slot has its
/// own lock so concurrent pulls for one daemon are serialized while
/// different daemons proceed independently.
#[derive(Default)]
pub struct RpsWorker {
    previous: Mutex<HashMap<i64, Arc<Mutex<Option<RpsSample>>>>>,
}

impl RpsWorker {
    /// Starts from readings persisted by an earlier run.
    pub fn with_samples(samples: impl IntoIterator<Item = (i64, RpsSample)>) -> Self {
        let previous = samples
            .into_iter()
            .map(|(daemon_id, sample)| (daemon_id, Arc::new(Mutex::new(Some(sample)))))
            .collect();
        Self { previous: Mutex::new(previous) }
    }

    fn slot(&self, daemon_id: i64) -> Arc<Mutex<Option<RpsSample>>> {
        let mut slots = self.previous.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(daemon_id).or_default().clone()
    }

    /// Records `sample` as the daemon's latest reading and returns the
    /// interval it closes.
    pub fn observe(&self, daemon_id: i64, sample: RpsSample) -> RpsInterval {
        let slot = self.slot(daemon_id);
        let mut previous = slot.lock().unwrap_or_else(PoisonError::into_inner);
        let interval = compute_interval(previous.as_ref(), &sample);
        *previous = Some(sample);
        interval
    }

    #[cfg(test)]
    fn previous(&self, daemon_id: i64) -> Option<RpsSample> {
        let slot = self.slot(daemon_id);
        let previous = slot.lock().unwrap_or_else(PoisonError::into_inner);
        *previous
    }
}

/// Arguments of a `statistic-get` answer: the counter name mapped to
/// `[value, timestamp]` pairs, most recent first.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct StatisticArgs(HashMap<String, Vec<(i64, String)>>);

impl StatisticArgs {
    /// Latest reading of `counter`. `Ok(None)` when the daemon has no
    /// samples yet.
    pub fn latest(&self, counter: &str) -> Result<Option<RpsSample>, String> {
        let Some(samples) = self.0.get(counter) else {
            return Ok(None);
        };
        let Some((count, timestamp)) = samples.first() else {
            return Ok(None);
        };
        Ok(Some(RpsSample {
            count: super::lease::counter_value(*count),
            sampled_at: parse_kea_timestamp(timestamp)?,
        }))
    }
}

pub fn decode_statistic(arguments: &Value) -> Result<StatisticArgs, String> {
    StatisticArgs::deserialize(arguments).map_err(|e| e.to_string())
}

pub fn parse_kea_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    NaiveDateTime::parse_from_str(s, KEA_TIMESTAMP_FORMAT)
        .map(|t| t.and_utc())
        .map_err(|e| format!("bad timestamp {:?}: {}", s, e))
}
