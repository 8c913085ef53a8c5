use std::collections::BTreeMap;
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use crate::stats::lease::merge_counters;
use crate::stats::usage::{global_counters, subnet_utilization};
use crate::stats::StatsBatch;
use super::db;

/// Stores a pull's counters and refreshes utilization and fleet totals,
/// in one transaction.
pub fn apply_stats(conn: &mut Connection, batch: &StatsBatch) -> Result<()> {
    let tx = conn.transaction().context("Failed to begin transaction")?;
    let collected_at = batch.collected_at.to_rfc3339();

    for row in &batch.lease_rows {
        let stored: Option<(i64, Option<String>)> = tx
            .query_row(
                "SELECT subnet_id, stats FROM local_subnet WHERE daemon_id = ?1 AND local_subnet_id = ?2",
                params![row.daemon_id, row.local_subnet_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .context("Failed to look up local subnet")?;

        let Some((subnet_id, stats_json)) = stored else {
            tracing::warn!(
                "Daemon {} reported statistics for unknown subnet id {}",
                row.daemon_id,
                row.local_subnet_id
            );
            continue;
        };

        let mut stats: BTreeMap<String, u64> = match stats_json {
            Some(json) => serde_json::from_str(&json).context("Corrupt local subnet statistics")?,
            None => BTreeMap::new(),
        };
        merge_counters(&mut stats, &row.counters);

        tx.execute(
            "UPDATE local_subnet SET stats = ?1, stats_collected_at = ?2
             WHERE daemon_id = ?3 AND subnet_id = ?4",
            params![serde_json::to_string(&stats)?, &collected_at, row.daemon_id, subnet_id],
        )
        .context("Failed to update local subnet statistics")?;
        tx.execute(
            "UPDATE subnet SET stats_collected_at = ?1 WHERE id = ?2",
            params![&collected_at, subnet_id],
        )
        .context("Failed to update subnet")?;
    }

    for rps in &batch.rps {
        tx.execute(
            "INSERT INTO daemon_rps (daemon_id, sample_count, sampled_at, delta, rate)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(daemon_id) DO UPDATE SET
                sample_count = excluded.sample_count,
                sampled_at = excluded.sampled_at,
                delta = excluded.delta,
                rate = excluded.rate",
            params![
                rps.daemon_id,
                rps.sample.count as i64,
                rps.sample.sampled_at.to_rfc3339(),
                rps.interval.delta as i64,
                rps.interval.rate,
            ],
        )
        .context("Failed to store daemon rps")?;
    }

    refresh_totals(&tx)?;

    tx.commit().context("Failed to commit statistics")?;
    Ok(())
}

/// Recomputes each subnet's utilization and the fleet-wide counters.
pub(crate) fn refresh_totals(conn: &Connection) -> Result<()> {
    let subnets = db::all_subnets(conn)?;
    for subnet in &subnets {
        let (addr, pd) = subnet_utilization(subnet);
        conn.execute(
            "UPDATE subnet SET addr_utilization = ?1, pd_utilization = ?2 WHERE id = ?3",
            params![addr, pd, subnet.id],
        )
        .context("Failed to update subnet utilization")?;
    }

    let global = db::global_reservations(conn)?;
    let sums = global_counters(&subnets, global);

    conn.execute("DELETE FROM statistic", [])
        .context("Failed to clear statistics")?;
    for (name, value) in &sums {
        conn.execute(
            "INSERT INTO statistic (name, value) VALUES (?1, ?2)",
            params![name, value.to_string()],
        )
        .context("Failed to store statistic")?;
    }
    Ok(())
}
