//! Decoding of `stat-lease4-get` / `stat-lease6-get` result sets.

use std::collections::BTreeMap;
use serde::Deserialize;
use shared::protocol::{
    STAT_ASSIGNED_ADDRESSES, STAT_ASSIGNED_NAS, STAT_ASSIGNED_PDS, STAT_DECLINED_ADDRESSES,
    STAT_DECLINED_NAS, STAT_TOTAL_ADDRESSES, STAT_TOTAL_NAS, STAT_TOTAL_PDS,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultSet {
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<i64>>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatLeaseArgs {
    #[serde(rename = "result-set", default)]
    pub result_set: Option<ResultSet>,
}

/// A lease counter column. Kea 1.6 misspelled the address counters; both
/// spellings decode to the same counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseCounter {
    TotalAddresses,
    AssignedAddresses,
    DeclinedAddresses,
    TotalNas,
    AssignedNas,
    DeclinedNas,
    TotalPds,
    AssignedPds,
    Other(String),
}

impl LeaseCounter {
    pub fn from_column(column: &str) -> Self {
        match column {
            "total-addresses" | "total-addreses" => LeaseCounter::TotalAddresses,
            "assigned-addresses" | "assigned-addreses" => LeaseCounter::AssignedAddresses,
            "declined-addresses" | "declined-addreses" => LeaseCounter::DeclinedAddresses,
            "total-nas" => LeaseCounter::TotalNas,
            "assigned-nas" => LeaseCounter::AssignedNas,
            "declined-nas" => LeaseCounter::DeclinedNas,
            "total-pds" => LeaseCounter::TotalPds,
            "assigned-pds" => LeaseCounter::AssignedPds,
            other => LeaseCounter::Other(other.to_string()),
        }
    }

    /// Canonical counter name used for storage.
    pub fn name(&self) -> &str {
        match self {
            LeaseCounter::TotalAddresses => STAT_TOTAL_ADDRESSES,
            LeaseCounter::AssignedAddresses => STAT_ASSIGNED_ADDRESSES,
            LeaseCounter::DeclinedAddresses => STAT_DECLINED_ADDRESSES,
            LeaseCounter::TotalNas => STAT_TOTAL_NAS,
            LeaseCounter::AssignedNas => STAT_ASSIGNED_NAS,
            LeaseCounter::DeclinedNas => STAT_DECLINED_NAS,
            LeaseCounter::TotalPds => STAT_TOTAL_PDS,
            LeaseCounter::AssignedPds => STAT_ASSIGNED_PDS,
            LeaseCounter::Other(name) => name,
        }
    }
}

/// Kea sends unsigned counters as signed integers, with -1 standing for
/// "too many to count". Every negative value is taken as its two's
/// complement, so -1 becomes `u64::MAX`.
pub fn counter_value(raw: i64) -> u64 {
    raw as u64
}

/// Counters reported for one local subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseStatsRow {
    pub local_subnet_id: i64,
    pub counters: BTreeMap<String, u64>,
}

/// Decodes a result set into one row per local subnet. Column 0 must
/// carry the subnet id.
pub fn decode_rows(result_set: &ResultSet) -> Result<Vec<LeaseStatsRow>, String> {
    if result_set.columns.is_empty() && result_set.rows.is_empty() {
        return Ok(Vec::new());
    }
    match result_set.columns.first() {
        Some(first) if first == "subnet-id" => {}
        _ => return Err("result set lacks the subnet-id column".to_string()),
    }

    let counters: Vec<LeaseCounter> = result_set.columns[1..]
        .iter()
        .map(|c| LeaseCounter::from_column(c))
        .collect();

    result_set
        .rows
        .iter()
        .map(|row| {
            if row.len() != result_set.columns.len() {
                return Err(format!(
                    "row has {} values but {} columns are declared",
                    row.len(),
                    result_set.columns.len()
                ));
            }
            Ok(LeaseStatsRow {
                local_subnet_id: row[0],
                counters: counters
                    .iter()
                    .zip(&row[1..])
                    .map(|(counter, &raw)| (counter.name().to_string(), counter_value(raw)))
                    .collect(),
            })
        })
        .collect()
}

/// Replaces the counters present in `update`; others are left as they were.
pub fn merge_counters(stored: &mut BTreeMap<String, u64>, update: &BTreeMap<String, u64>) {
    for (name, value) in update {
        stored.insert(name.clone(), *value);
    }
}
