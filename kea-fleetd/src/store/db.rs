use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use shared::keaconfig::KeaConfig;
use shared::types::{
    AccessPoint, AccessPointKind, App, Daemon, Event, EventLevel, HaMember, HaService, LocalSubnet,
    Machine, Subnet,
};
use crate::stats::rps::RpsSample;
use crate::stats::usage::GlobalReservations;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS machine (
        id          INTEGER PRIMARY KEY,
        address     TEXT NOT NULL UNIQUE,
        agent_port  INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS app (
        id              INTEGER PRIMARY KEY,
        machine_id      INTEGER NOT NULL REFERENCES machine(id) ON DELETE CASCADE,
        control_address TEXT NOT NULL,
        control_port    INTEGER NOT NULL,
        use_secure      INTEGER NOT NULL DEFAULT 0,
        key             TEXT,
        active          INTEGER NOT NULL DEFAULT 0,
        version         TEXT NOT NULL DEFAULT '',
        UNIQUE (control_address, control_port)
    );

    CREATE TABLE IF NOT EXISTS daemon (
        id               INTEGER PRIMARY KEY,
        app_id           INTEGER NOT NULL REFERENCES app(id) ON DELETE CASCADE,
        name             TEXT NOT NULL,
        active           INTEGER NOT NULL,
        monitored        INTEGER NOT NULL DEFAULT 1,
        version          TEXT NOT NULL DEFAULT '',
        extended_version TEXT NOT NULL DEFAULT '',
        uptime           INTEGER NOT NULL DEFAULT 0,
        reloaded_at      TEXT,
        config           TEXT,
        config_hash      TEXT,
        subnet_index     TEXT NOT NULL DEFAULT '{}',
        UNIQUE (app_id, name)
    );

    CREATE TABLE IF NOT EXISTS shared_network (
        id      INTEGER PRIMARY KEY,
        name    TEXT NOT NULL,
        family  INTEGER NOT NULL,
        UNIQUE (name, family)
    );

    CREATE TABLE IF NOT EXISTS subnet (
        id                 INTEGER PRIMARY KEY,
        prefix             TEXT NOT NULL UNIQUE,
        shared_network_id  INTEGER REFERENCES shared_network(id) ON DELETE SET NULL,
        addr_utilization   INTEGER NOT NULL DEFAULT 0,
        pd_utilization     INTEGER NOT NULL DEFAULT 0,
        stats_collected_at TEXT
    );

    CREATE TABLE IF NOT EXISTS local_subnet (
        daemon_id             INTEGER NOT NULL REFERENCES daemon(id) ON DELETE CASCADE,
        subnet_id             INTEGER NOT NULL REFERENCES subnet(id) ON DELETE CASCADE,
        local_subnet_id       INTEGER NOT NULL,
        out_of_pool_addresses INTEGER NOT NULL DEFAULT 0,
        out_of_pool_prefixes  INTEGER NOT NULL DEFAULT 0,
        stats                 TEXT,
        stats_collected_at    TEXT,
        PRIMARY KEY (daemon_id, subnet_id)
    );

    CREATE INDEX IF NOT EXISTS idx_local_subnet_id ON local_subnet(daemon_id, local_subnet_id);

    CREATE TABLE IF NOT EXISTS host (
        id          INTEGER PRIMARY KEY,
        daemon_id   INTEGER NOT NULL REFERENCES daemon(id) ON DELETE CASCADE,
        identifier  TEXT NOT NULL,
        addresses   TEXT NOT NULL,
        prefixes    TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS ha_service (
        id           INTEGER PRIMARY KEY,
        kind         TEXT NOT NULL,
        mode         TEXT NOT NULL,
        server_names TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS ha_member (
        service_id  INTEGER NOT NULL REFERENCES ha_service(id) ON DELETE CASCADE,
        server_name TEXT NOT NULL,
        role        TEXT,
        daemon_id   INTEGER REFERENCES daemon(id) ON DELETE SET NULL,
        PRIMARY KEY (service_id, server_name)
    );

    CREATE TABLE IF NOT EXISTS event (
        id          INTEGER PRIMARY KEY,
        created_at  TEXT NOT NULL,
        level       TEXT NOT NULL,
        text        TEXT NOT NULL,
        details     TEXT NOT NULL DEFAULT '',
        machine     TEXT,
        app_id      INTEGER REFERENCES app(id) ON DELETE SET NULL,
        app         TEXT,
        daemon_id   INTEGER REFERENCES daemon(id) ON DELETE SET NULL,
        daemon      TEXT,
        subnet      TEXT
    );

    CREATE TABLE IF NOT EXISTS statistic (
        name   TEXT PRIMARY KEY,
        value  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS daemon_rps (
        daemon_id     INTEGER PRIMARY KEY REFERENCES daemon(id) ON DELETE CASCADE,
        sample_count  INTEGER NOT NULL,
        sampled_at    TEXT NOT NULL,
        delta         INTEGER NOT NULL,
        rate          REAL NOT NULL
    );
"#;

/// Latest responses-per-second figures of a daemon.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaemonRate {
    pub daemon_id: i64,
    pub sampled_at: DateTime<Utc>,
    pub delta: u64,
    pub rate: f64,
}

/// The persistent view of the fleet.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create the SQLite database with WAL mode and foreign keys enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("Failed to configure database")?;

        conn.execute_batch(SCHEMA)
            .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    pub(crate) fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn find_app(&self, address: &str, port: u16) -> Result<Option<App>> {
        app_by_endpoint(&self.conn, address, port)
    }

    pub fn get_app(&self, id: i64) -> Result<Option<App>> {
        app_by_id(&self.conn, id)
    }

    pub fn get_all_apps(&self) -> Result<Vec<App>> {
        all_apps(&self.conn)
    }

    pub fn get_subnets(&self) -> Result<Vec<Subnet>> {
        all_subnets(&self.conn)
    }

    pub fn get_global_stats(&self) -> Result<BTreeMap<String, BigUint>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, value FROM statistic ORDER BY name")
            .context("Failed to prepare query")?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .context("Failed to query statistics")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect statistics")?;

        rows.into_iter()
            .map(|(name, value)| {
                let parsed = value
                    .parse::<BigUint>()
                    .with_context(|| format!("Corrupt value of statistic {}: {:?}", name, value))?;
                Ok((name, parsed))
            })
            .collect()
    }

    /// Most recent events first.
    pub fn get_events(&self, limit: usize) -> Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, created_at, level, text, details, machine, app_id, app,
                        daemon_id, daemon, subnet
                 FROM event ORDER BY id DESC LIMIT ?1",
            )
            .context("Failed to prepare query")?;

        let events = stmt
            .query_map([limit as i64], row_to_event)
            .context("Failed to query events")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect events")?;

        Ok(events)
    }

    pub fn get_ha_services(&self) -> Result<Vec<HaService>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, kind, mode FROM ha_service ORDER BY id")
            .context("Failed to prepare query")?;

        let mut services = stmt
            .query_map([], |row| {
                Ok(HaService {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    mode: row.get(2)?,
                    members: Vec::new(),
                })
            })
            .context("Failed to query HA services")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect HA services")?;

        let mut members_stmt = self
            .conn
            .prepare(
                "SELECT server_name, role, daemon_id FROM ha_member
                 WHERE service_id = ?1 ORDER BY server_name",
            )
            .context("Failed to prepare query")?;

        for service in &mut services {
            service.members = members_stmt
                .query_map([service.id], |row| {
                    Ok(HaMember {
                        server_name: row.get(0)?,
                        role: row.get(1)?,
                        daemon_id: row.get(2)?,
                    })
                })
                .context("Failed to query HA members")?
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to collect HA members")?;
        }

        Ok(services)
    }

    /// Last counter readings, used to resume rate tracking after a restart.
    pub fn get_rps_samples(&self) -> Result<Vec<(i64, RpsSample)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT daemon_id, sample_count, sampled_at FROM daemon_rps")
            .context("Failed to prepare query")?;

        let samples = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    RpsSample {
                        count: row.get::<_, i64>(1)? as u64,
                        sampled_at: parse_time(row, 2)?,
                    },
                ))
            })
            .context("Failed to query rps samples")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect rps samples")?;

        Ok(samples)
    }

    pub fn get_daemon_rates(&self) -> Result<Vec<DaemonRate>> {
        let mut stmt = self
            .conn
            .prepare("SELECT daemon_id, sampled_at, delta, rate FROM daemon_rps ORDER BY daemon_id")
            .context("Failed to prepare query")?;

        let rates = stmt
            .query_map([], |row| {
                Ok(DaemonRate {
                    daemon_id: row.get(0)?,
                    sampled_at: parse_time(row, 1)?,
                    delta: row.get::<_, i64>(2)? as u64,
                    rate: row.get(3)?,
                })
            })
            .context("Failed to query daemon rates")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect daemon rates")?;

        Ok(rates)
    }
}

const APP_QUERY: &str = "SELECT a.id, a.control_address, a.control_port, a.use_secure, a.key,
        a.active, a.version, m.id, m.address, m.agent_port
    FROM app a JOIN machine m ON m.id = a.machine_id";

const DAEMON_QUERY: &str = "SELECT id, name, active, monitored, version, extended_version,
        uptime, reloaded_at, config, config_hash, subnet_index
    FROM daemon";

pub(crate) fn all_apps(conn: &Connection) -> Result<Vec<App>> {
    let mut stmt = conn
        .prepare(&format!("{} ORDER BY a.id", APP_QUERY))
        .context("Failed to prepare query")?;

    let mut apps = stmt
        .query_map([], row_to_app)
        .context("Failed to query apps")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect apps")?;

    for app in &mut apps {
        if let Some(id) = app.id {
            app.daemons = app_daemons(conn, id)?;
        }
    }
    Ok(apps)
}

pub(crate) fn app_by_id(conn: &Connection, id: i64) -> Result<Option<App>> {
    let app = conn
        .query_row(&format!("{} WHERE a.id = ?1", APP_QUERY), [id], row_to_app)
        .optional()
        .context("Failed to query app")?;
    with_daemons(conn, app)
}

pub(crate) fn app_by_endpoint(conn: &Connection, address: &str, port: u16) -> Result<Option<App>> {
    let app = conn
        .query_row(
            &format!("{} WHERE a.control_address = ?1 AND a.control_port = ?2", APP_QUERY),
            params![address, port],
            row_to_app,
        )
        .optional()
        .context("Failed to query app")?;
    with_daemons(conn, app)
}

fn with_daemons(conn: &Connection, app: Option<App>) -> Result<Option<App>> {
    match app {
        Some(mut app) => {
            if let Some(id) = app.id {
                app.daemons = app_daemons(conn, id)?;
            }
            Ok(Some(app))
        }
        None => Ok(None),
    }
}

pub(crate) fn app_daemons(conn: &Connection, app_id: i64) -> Result<Vec<Daemon>> {
    let mut stmt = conn
        .prepare(&format!("{} WHERE app_id = ?1 ORDER BY name", DAEMON_QUERY))
        .context("Failed to prepare query")?;

    let daemons = stmt
        .query_map([app_id], row_to_daemon)
        .context("Failed to query daemons")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect daemons")?;

    Ok(daemons)
}

/// Daemons of every app, ordered by id.
pub(crate) fn all_daemons(conn: &Connection) -> Result<Vec<Daemon>> {
    let mut stmt = conn
        .prepare(&format!("{} ORDER BY id", DAEMON_QUERY))
        .context("Failed to prepare query")?;

    let daemons = stmt
        .query_map([], row_to_daemon)
        .context("Failed to query daemons")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect daemons")?;

    Ok(daemons)
}

/// Subnets ordered by id, each with its local subnets ordered by daemon.
pub(crate) fn all_subnets(conn: &Connection) -> Result<Vec<Subnet>> {
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.prefix, n.name, s.addr_utilization, s.pd_utilization, s.stats_collected_at
             FROM subnet s LEFT JOIN shared_network n ON n.id = s.shared_network_id
             ORDER BY s.id",
        )
        .context("Failed to prepare query")?;

    let mut subnets = stmt
        .query_map([], |row| {
            Ok(Subnet {
                id: row.get(0)?,
                prefix: row.get(1)?,
                shared_network: row.get(2)?,
                addr_utilization: row.get(3)?,
                pd_utilization: row.get(4)?,
                stats_collected_at: parse_optional_time(row, 5)?,
                local_subnets: Vec::new(),
            })
        })
        .context("Failed to query subnets")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect subnets")?;

    let mut local_stmt = conn
        .prepare(
            "SELECT subnet_id, daemon_id, local_subnet_id, stats, stats_collected_at,
                    out_of_pool_addresses, out_of_pool_prefixes
             FROM local_subnet ORDER BY subnet_id, daemon_id",
        )
        .context("Failed to prepare query")?;

    let locals = local_stmt
        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row_to_local_subnet(row)?)))
        .context("Failed to query local subnets")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect local subnets")?;

    let mut by_subnet: HashMap<i64, Vec<LocalSubnet>> = HashMap::new();
    for (subnet_id, local) in locals {
        by_subnet.entry(subnet_id).or_default().push(local);
    }
    for subnet in &mut subnets {
        subnet.local_subnets = by_subnet.remove(&subnet.id).unwrap_or_default();
    }

    Ok(subnets)
}

/// Distinct reservations declared outside any subnet, across all daemons.
pub(crate) fn global_reservations(conn: &Connection) -> Result<GlobalReservations> {
    let mut stmt = conn
        .prepare("SELECT addresses, prefixes FROM host")
        .context("Failed to prepare query")?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                json_column::<Vec<IpAddr>>(row, 0)?,
                json_column::<Vec<String>>(row, 1)?,
            ))
        })
        .context("Failed to query hosts")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect hosts")?;

    let mut addresses = BTreeSet::new();
    let mut prefixes = BTreeSet::new();
    for (host_addresses, host_prefixes) in rows {
        addresses.extend(host_addresses);
        prefixes.extend(host_prefixes);
    }

    Ok(GlobalReservations {
        v4_addresses: addresses.iter().filter(|a| a.is_ipv4()).count() as u64,
        v6_addresses: addresses.iter().filter(|a| a.is_ipv6()).count() as u64,
        prefixes: prefixes.len() as u64,
    })
}

pub(crate) fn insert_event(conn: &Connection, event: &mut Event) -> Result<()> {
    conn.execute(
        "INSERT INTO event (created_at, level, text, details, machine, app_id, app,
                            daemon_id, daemon, subnet)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            event.created_at.to_rfc3339(),
            event.level.as_str(),
            &event.text,
            &event.details,
            &event.machine,
            event.app_id,
            &event.app,
            event.daemon_id,
            &event.daemon,
            &event.subnet,
        ],
    )
    .context("Failed to insert event")?;

    event.id = Some(conn.last_insert_rowid());
    Ok(())
}

fn row_to_app(row: &Row) -> Result<App, rusqlite::Error> {
    let machine = Machine {
        id: row.get(7)?,
        address: row.get(8)?,
        agent_port: row.get(9)?,
    };
    let control = AccessPoint {
        kind: AccessPointKind::Control,
        address: row.get(1)?,
        port: row.get(2)?,
        use_secure_protocol: row.get::<_, i32>(3)? != 0,
        key: row.get(4)?,
    };
    let mut app = App::new(machine, control);
    app.id = row.get(0)?;
    app.active = row.get::<_, i32>(5)? != 0;
    app.version = row.get(6)?;
    Ok(app)
}

fn row_to_daemon(row: &Row) -> Result<Daemon, rusqlite::Error> {
    let config = row
        .get::<_, Option<String>>(8)?
        .map(|json| KeaConfig::from_json(&json))
        .transpose()
        .map_err(|e| conversion_error(8, e))?;

    Ok(Daemon {
        id: row.get(0)?,
        name: row.get(1)?,
        active: row.get::<_, i32>(2)? != 0,
        monitored: row.get::<_, i32>(3)? != 0,
        version: row.get(4)?,
        extended_version: row.get(5)?,
        uptime: row.get(6)?,
        reloaded_at: parse_optional_time(row, 7)?,
        config,
        config_hash: row.get(9)?,
        subnet_index: json_column(row, 10)?,
    })
}

fn row_to_local_subnet(row: &Row) -> Result<LocalSubnet, rusqlite::Error> {
    let stats = match row.get::<_, Option<String>>(3)? {
        Some(json) => Some(serde_json::from_str(&json).map_err(|e| conversion_error(3, e))?),
        None => None,
    };
    Ok(LocalSubnet {
        daemon_id: row.get(1)?,
        local_subnet_id: row.get(2)?,
        stats,
        stats_collected_at: parse_optional_time(row, 4)?,
        out_of_pool_addresses: row.get::<_, i64>(5)? as u64,
        out_of_pool_prefixes: row.get::<_, i64>(6)? as u64,
    })
}

fn row_to_event(row: &Row) -> Result<Event, rusqlite::Error> {
    let level: String = row.get(2)?;
    let level = EventLevel::parse(&level).ok_or_else(|| {
        conversion_error(2, std::io::Error::new(std::io::ErrorKind::InvalidData, format!("unknown level {}", level)))
    })?;

    Ok(Event {
        id: row.get(0)?,
        created_at: parse_time(row, 1)?,
        level,
        text: row.get(3)?,
        details: row.get(4)?,
        machine: row.get(5)?,
        app_id: row.get(6)?,
        app: row.get(7)?,
        daemon_id: row.get(8)?,
        daemon: row.get(9)?,
        subnet: row.get(10)?,
    })
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row, idx: usize) -> Result<T, rusqlite::Error> {
    let json: String = row.get(idx)?;
    serde_json::from_str(&json).map_err(|e| conversion_error(idx, e))
}

fn parse_time(row: &Row, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_optional_time(row: &Row, idx: usize) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    match row.get::<_, Option<String>>(idx)? {
        Some(_) => parse_time(row, idx).map(Some),
        None => Ok(None),
    }
}
