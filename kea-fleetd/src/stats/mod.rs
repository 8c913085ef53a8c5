pub mod lease;
pub mod puller;
pub mod rps;
pub mod usage;

use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use thiserror::Error;
use crate::kea::commands::TransportError;
use self::rps::{RpsInterval, RpsSample};

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("problem with getting statistics from {app}: {source}")]
    Transport {
        app: String,
        #[source]
        source: TransportError,
    },
    #[error("problem with {command} and kea daemon {daemon} of {app}: result == {result}, msg: {text}")]
    Command {
        app: String,
        daemon: String,
        command: String,
        result: i64,
        text: String,
    },
    #[error("invalid {command} response from kea daemon {daemon} of {app}: {reason}")]
    Data {
        app: String,
        daemon: String,
        command: String,
        reason: String,
    },
    #[error("failed to store statistics: {0:#}")]
    Store(anyhow::Error),
}

/// Every problem hit during one pull. The pull still stores whatever it
/// did collect.
#[derive(Debug, Error)]
#[error("{} problem(s) while pulling statistics: {}", .0.len(), summarize(.0))]
pub struct PullError(pub Vec<StatsError>);

fn summarize(errors: &[StatsError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

/// Counters reported for one local subnet of a daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSubnetStats {
    pub daemon_id: i64,
    pub local_subnet_id: i64,
    pub counters: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonRps {
    pub daemon_id: i64,
    pub sample: RpsSample,
    pub interval: RpsInterval,
}

/// What one pull collected, written to the store in one go.
#[derive(Debug, Clone)]
pub struct StatsBatch {
    pub collected_at: DateTime<Utc>,
    pub lease_rows: Vec<LocalSubnetStats>,
    pub rps: Vec<DaemonRps>,
}

impl StatsBatch {
    pub fn new(collected_at: DateTime<Utc>) -> Self {
        Self {
            collected_at,
            lease_rows: Vec::new(),
            rps: Vec::new(),
        }
    }
}
