//! Persists one reconciled app together with everything derived from its
//! daemons' configurations, atomically.

use std::collections::{BTreeMap, BTreeSet};
use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use shared::keaconfig::{index_subnets, ConfigSubnet, Reservation};
use shared::protocol::is_dhcp_daemon;
use shared::types::{App, Daemon, Event, EventLevel, Machine};
use crate::ha::{detect_services, HaServiceCandidate};
use super::db;

/// Above this many new subnets only the summary event is raised.
const SUBNET_EVENT_LIMIT: usize = 10;

/// The app as stored, and every event raised by the commit.
#[derive(Debug, Clone)]
pub struct CommitOutcome {
    pub app: App,
    pub events: Vec<Event>,
}

/// Writes the app, its daemons, their subnets, host reservations and HA
/// services, plus `change_events`, in one transaction. Nothing is written
/// when any step fails.
pub fn commit_app(conn: &mut Connection, app: &App, change_events: Vec<Event>) -> Result<CommitOutcome> {
    let tx = conn.transaction().context("Failed to begin transaction")?;

    let mut app = app.clone();
    let machine_id = upsert_machine(&tx, &app.machine)?;
    app.machine.id = Some(machine_id);
    let (app_id, app_added) = upsert_app(&tx, &app, machine_id)?;
    app.id = Some(app_id);

    let mut events = Vec::new();
    if app_added {
        events.push(Event::new(EventLevel::Info, "added {app} on {machine}").with_app(&app));
    }

    let mut added_daemons = Vec::new();
    for daemon in &mut app.daemons {
        let (daemon_id, inserted) = upsert_daemon(&tx, app_id, daemon)?;
        daemon.id = Some(daemon_id);
        if inserted {
            added_daemons.push(daemon.clone());
        }
    }
    for daemon in &added_daemons {
        events.push(Event::new(EventLevel::Info, "added {daemon} to {app}").with_app(&app).with_daemon(daemon));
    }

    for mut event in change_events {
        event.app_id = Some(app_id);
        if event.daemon_id.is_none() {
            if let Some(daemon) = event.daemon.as_deref().and_then(|name| app.daemon(name)) {
                event.daemon_id = daemon.id;
            }
        }
        events.push(event);
    }

    let label = app.label();
    let mut added_subnets = Vec::new();
    for daemon in &mut app.daemons {
        let Some(daemon_id) = daemon.id else { continue };
        if !is_dhcp_daemon(&daemon.name) {
            continue;
        }
        let Some(config) = &daemon.config else { continue };

        let parsed = config
            .subnets()
            .and_then(|subnets| index_subnets(&subnets).map(|index| (subnets, index)));
        let (subnets, index) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Skipping subnets of {} on {}: {}", daemon.name, label, e);
                continue;
            }
        };

        added_subnets.extend(sync_subnets(&tx, daemon_id, &subnets, &index)?);
        daemon.subnet_index = index;
        tx.execute(
            "UPDATE daemon SET subnet_index = ?1 WHERE id = ?2",
            params![serde_json::to_string(&daemon.subnet_index)?, daemon_id],
        )
        .context("Failed to store subnet index")?;

        match config.global_reservations() {
            Ok(reservations) => replace_hosts(&tx, daemon_id, &reservations)?,
            Err(e) => tracing::warn!("Skipping host reservations of {} on {}: {}", daemon.name, label, e),
        }
    }
    delete_orphans(&tx)?;

    if !added_subnets.is_empty() {
        if added_subnets.len() < SUBNET_EVENT_LIMIT {
            for prefix in &added_subnets {
                events.push(Event::new(EventLevel::Info, "added {subnet} to {app}").with_app(&app).with_subnet(prefix));
            }
        }
        events.push(
            Event::new(EventLevel::Info, format!("added {} subnets to {{app}}", added_subnets.len())).with_app(&app),
        );
    }

    let stored_daemons = db::all_daemons(&tx)?;
    for daemon in &app.daemons {
        let Some(daemon_id) = daemon.id else { continue };
        let candidates = detect_services(daemon, &stored_daemons);
        commit_ha_services(&tx, daemon_id, &candidates)?;
    }

    for event in &mut events {
        db::insert_event(&tx, event)?;
    }

    tx.commit().context("Failed to commit app")?;
    Ok(CommitOutcome { app, events })
}

fn upsert_machine(conn: &Connection, machine: &Machine) -> Result<i64> {
    conn.execute(
        "INSERT INTO machine (address, agent_port) VALUES (?1, ?2)
         ON CONFLICT(address) DO UPDATE SET agent_port = excluded.agent_port",
        params![&machine.address, machine.agent_port],
    )
    .context("Failed to upsert machine")?;

    conn.query_row("SELECT id FROM machine WHERE address = ?1", [&machine.address], |row| row.get(0))
        .context("Failed to look up machine")
}

/// Returns the app id and whether the app is new.
fn upsert_app(conn: &Connection, app: &App, machine_id: i64) -> Result<(i64, bool)> {
    let ap = app
        .control_access_point()
        .with_context(|| format!("{} has no control access point", app.label()))?;

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM app WHERE control_address = ?1 AND control_port = ?2",
            params![&ap.address, ap.port],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to look up app")?;

    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE app SET machine_id = ?1, use_secure = ?2, key = ?3, active = ?4, version = ?5
                 WHERE id = ?6",
                params![machine_id, ap.use_secure_protocol as i32, &ap.key, app.active as i32, &app.version, id],
            )
            .context("Failed to update app")?;
            Ok((id, false))
        }
        None => {
            conn.execute(
                "INSERT INTO app (machine_id, control_address, control_port, use_secure, key, active, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    machine_id,
                    &ap.address,
                    ap.port,
                    ap.use_secure_protocol as i32,
                    &ap.key,
                    app.active as i32,
                    &app.version,
                ],
            )
            .context("Failed to insert app")?;
            Ok((conn.last_insert_rowid(), true))
        }
    }
}

/// Returns the daemon id and whether the daemon is new.
fn upsert_daemon(conn: &Connection, app_id: i64, daemon: &Daemon) -> Result<(i64, bool)> {
    let config_json = daemon
        .config
        .as_ref()
        .map(|c| serde_json::to_string(c.as_value()))
        .transpose()
        .context("Failed to serialize configuration")?;
    let index_json = serde_json::to_string(&daemon.subnet_index)?;

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM daemon WHERE app_id = ?1 AND name = ?2",
            params![app_id, &daemon.name],
            |row| row.get(0),
        )
        .optional()
        .context("Failed to look up daemon")?;

    match existing {
        Some(id) => {
            conn.execute(
                "UPDATE daemon SET active = ?1, monitored = ?2, version = ?3, extended_version = ?4,
                        uptime = ?5, reloaded_at = ?6, config = ?7, config_hash = ?8
                 WHERE id = ?9",
                params![
                    daemon.active as i32,
                    daemon.monitored as i32,
                    &daemon.version,
                    &daemon.extended_version,
                    daemon.uptime,
                    daemon.reloaded_at.map(|t| t.to_rfc3339()),
                    config_json,
                    &daemon.config_hash,
                    id,
                ],
            )
            .context("Failed to update daemon")?;
            Ok((id, false))
        }
        None => {
            conn.execute(
                "INSERT INTO daemon (app_id, name, active, monitored, version, extended_version,
                                     uptime, reloaded_at, config, config_hash, subnet_index)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    app_id,
                    &daemon.name,
                    daemon.active as i32,
                    daemon.monitored as i32,
                    &daemon.version,
                    &daemon.extended_version,
                    daemon.uptime,
                    daemon.reloaded_at.map(|t| t.to_rfc3339()),
                    config_json,
                    &daemon.config_hash,
                    index_json,
                ],
            )
            .context("Failed to insert daemon")?;
            Ok((conn.last_insert_rowid(), true))
        }
    }
}

/// Makes the daemon's local subnets match its configuration. Counters
/// already collected for kept subnets survive. Returns the prefixes of
/// subnets that did not exist before.
fn sync_subnets(
    conn: &Connection,
    daemon_id: i64,
    subnets: &[ConfigSubnet],
    index: &BTreeMap<String, i64>,
) -> Result<Vec<String>> {
    let mut added = Vec::new();
    let mut kept = BTreeSet::new();

    for subnet in subnets {
        let prefix = subnet.prefix.to_string();
        let family = if subnet.prefix.addr.is_ipv6() { 6 } else { 4 };

        let network_id = match &subnet.shared_network {
            Some(name) => Some(upsert_shared_network(conn, name, family)?),
            None => None,
        };

        let existing: Option<i64> = conn
            .query_row("SELECT id FROM subnet WHERE prefix = ?1", [&prefix], |row| row.get(0))
            .optional()
            .context("Failed to look up subnet")?;

        let subnet_id = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE subnet SET shared_network_id = ?1 WHERE id = ?2",
                    params![network_id, id],
                )
                .context("Failed to update subnet")?;
                id
            }
            None => {
                conn.execute(
                    "INSERT INTO subnet (prefix, shared_network_id) VALUES (?1, ?2)",
                    params![&prefix, network_id],
                )
                .context("Failed to insert subnet")?;
                added.push(prefix.clone());
                conn.last_insert_rowid()
            }
        };

        let local_id = index.get(&prefix).copied().unwrap_or(0);
        conn.execute(
            "INSERT INTO local_subnet (daemon_id, subnet_id, local_subnet_id,
                                       out_of_pool_addresses, out_of_pool_prefixes)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(daemon_id, subnet_id) DO UPDATE SET
                local_subnet_id = excluded.local_subnet_id,
                out_of_pool_addresses = excluded.out_of_pool_addresses,
                out_of_pool_prefixes = excluded.out_of_pool_prefixes",
            params![
                daemon_id,
                subnet_id,
                local_id,
                subnet.out_of_pool_addresses() as i64,
                subnet.out_of_pool_prefixes() as i64,
            ],
        )
        .context("Failed to upsert local subnet")?;
        kept.insert(subnet_id);
    }

    let mut stmt = conn
        .prepare("SELECT subnet_id FROM local_subnet WHERE daemon_id = ?1")
        .context("Failed to prepare query")?;
    let current = stmt
        .query_map([daemon_id], |row| row.get::<_, i64>(0))
        .context("Failed to query local subnets")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect local subnets")?;

    for subnet_id in current.into_iter().filter(|id| !kept.contains(id)) {
        conn.execute(
            "DELETE FROM local_subnet WHERE daemon_id = ?1 AND subnet_id = ?2",
            params![daemon_id, subnet_id],
        )
        .context("Failed to delete local subnet")?;
    }

    Ok(added)
}

fn upsert_shared_network(conn: &Connection, name: &str, family: i32) -> Result<i64> {
    conn.execute(
        "INSERT INTO shared_network (name, family) VALUES (?1, ?2)
         ON CONFLICT(name, family) DO NOTHING",
        params![name, family],
    )
    .context("Failed to upsert shared network")?;

    conn.query_row(
        "SELECT id FROM shared_network WHERE name = ?1 AND family = ?2",
        params![name, family],
        |row| row.get(0),
    )
    .context("Failed to look up shared network")
}

/// Subnets no daemon serves any more, and networks without subnets.
fn delete_orphans(conn: &Connection) -> Result<()> {
    let subnets = conn
        .execute("DELETE FROM subnet WHERE id NOT IN (SELECT subnet_id FROM local_subnet)", [])
        .context("Failed to delete orphaned subnets")?;
    conn.execute(
        "DELETE FROM shared_network WHERE id NOT IN
            (SELECT shared_network_id FROM subnet WHERE shared_network_id IS NOT NULL)",
        [],
    )
    .context("Failed to delete orphaned shared networks")?;
    if subnets > 0 {
        tracing::debug!("Deleted {} orphaned subnets", subnets);
    }
    Ok(())
}

fn replace_hosts(conn: &Connection, daemon_id: i64, reservations: &[Reservation]) -> Result<()> {
    conn.execute("DELETE FROM host WHERE daemon_id = ?1", [daemon_id])
        .context("Failed to delete hosts")?;

    for reservation in reservations {
        let prefixes: Vec<String> = reservation.prefixes.iter().map(|p| p.to_string()).collect();
        conn.execute(
            "INSERT INTO host (daemon_id, identifier, addresses, prefixes) VALUES (?1, ?2, ?3, ?4)",
            params![
                daemon_id,
                &reservation.identifier,
                serde_json::to_string(&reservation.addresses)?,
                serde_json::to_string(&prefixes)?,
            ],
        )
        .context("Failed to insert host")?;
    }
    Ok(())
}

/// Upserts the services detected for a daemon. A candidate matches a
/// stored service of the same kind sharing any server name. The daemon is
/// detached from services it no longer belongs to; services left without
/// any daemon are removed.
fn commit_ha_services(conn: &Connection, daemon_id: i64, candidates: &[HaServiceCandidate]) -> Result<()> {
    let mut kept = Vec::new();

    for candidate in candidates {
        let service_id = match find_ha_service(conn, candidate)? {
            Some(id) => {
                conn.execute(
                    "UPDATE ha_service SET mode = ?1, server_names = ?2 WHERE id = ?3",
                    params![&candidate.mode, serde_json::to_string(&candidate.server_names)?, id],
                )
                .context("Failed to update HA service")?;
                id
            }
            None => {
                conn.execute(
                    "INSERT INTO ha_service (kind, mode, server_names) VALUES (?1, ?2, ?3)",
                    params![&candidate.kind, &candidate.mode, serde_json::to_string(&candidate.server_names)?],
                )
                .context("Failed to insert HA service")?;
                conn.last_insert_rowid()
            }
        };

        for member in &candidate.members {
            conn.execute(
                "INSERT INTO ha_member (service_id, server_name, role, daemon_id) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(service_id, server_name) DO UPDATE SET
                    role = excluded.role,
                    daemon_id = COALESCE(excluded.daemon_id, ha_member.daemon_id)",
                params![service_id, &member.server_name, &member.role, member.daemon_id],
            )
            .context("Failed to upsert HA member")?;
        }

        let mut stmt = conn
            .prepare("SELECT server_name FROM ha_member WHERE service_id = ?1")
            .context("Failed to prepare query")?;
        let stored_names = stmt
            .query_map([service_id], |row| row.get::<_, String>(0))
            .context("Failed to query HA members")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect HA members")?;
        for name in stored_names.iter().filter(|n| !candidate.server_names.contains(n)) {
            conn.execute(
                "DELETE FROM ha_member WHERE service_id = ?1 AND server_name = ?2",
                params![service_id, name],
            )
            .context("Failed to delete HA member")?;
        }

        kept.push(service_id);
    }

    let kept_json = serde_json::to_string(&kept)?;
    conn.execute(
        "UPDATE ha_member SET daemon_id = NULL
         WHERE daemon_id = ?1 AND service_id NOT IN (SELECT value FROM json_each(?2))",
        params![daemon_id, kept_json],
    )
    .context("Failed to detach daemon from HA services")?;

    conn.execute(
        "DELETE FROM ha_service WHERE id NOT IN
            (SELECT service_id FROM ha_member WHERE daemon_id IS NOT NULL)",
        [],
    )
    .context("Failed to delete abandoned HA services")?;

    Ok(())
}

fn find_ha_service(conn: &Connection, candidate: &HaServiceCandidate) -> Result<Option<i64>> {
    let mut stmt = conn
        .prepare("SELECT id, server_names FROM ha_service WHERE kind = ?1 ORDER BY id")
        .context("Failed to prepare query")?;
    let services = stmt
        .query_map([&candidate.kind], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
        .context("Failed to query HA services")?
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to collect HA services")?;

    for (id, names_json) in services {
        let names: Vec<String> = serde_json::from_str(&names_json)
            .with_context(|| format!("Corrupt server names of HA service {}", id))?;
        if names.iter().any(|n| candidate.server_names.contains(n)) {
            return Ok(Some(id));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::keaconfig::KeaConfig;
    use shared::types::{AccessPoint, AccessPointKind};
    use crate::store::db::Store;

    fn test_app(machine: &str, address: &str) -> App {
        App::new(
            Machine { id: None, address: machine.to_string(), agent_port: 8080 },
            AccessPoint {
                kind: AccessPointKind::Control,
                address: address.to_string(),
                port: 8000,
                use_secure_protocol: false,
                key: None,
            },
        )
    }

    fn dhcp4(config: serde_json::Value) -> Daemon {
        Daemon {
            config: Some(KeaConfig::new(config)),
            version: "2.4.1".to_string(),
            ..Daemon::new("dhcp4", true)
        }
    }

    fn two_subnets() -> serde_json::Value {
        json!({ "Dhcp4": {
            "subnet4": [
                { "id": 10, "subnet": "192.0.2.0/24", "pools": [{ "pool": "192.0.2.1 - 192.0.2.200" }] },
                { "id": 20, "subnet": "192.0.3.0/24",
                  "pools": [{ "pool": "192.0.3.1 - 192.0.3.100" }],
                  "reservations": [
                    { "hw-address": "aa:bb:cc:dd:ee:01", "ip-address": "192.0.3.150" },
                    { "hw-address": "aa:bb:cc:dd:ee:02", "ip-address": "192.0.3.151" }
                  ] }
            ],
            "reservations": [{ "hw-address": "aa:bb:cc:dd:ee:ff", "ip-address": "198.51.100.7" }]
        }})
    }

    fn ha_config(this: &str, peers: &[&str]) -> serde_json::Value {
        let peers: Vec<_> = peers.iter().map(|p| json!({ "name": p, "role": "primary" })).collect();
        json!({ "Dhcp4": {
            "hooks-libraries": [{
                "library": "/usr/lib/kea/hooks/libdhcp_ha.so",
                "parameters": { "high-availability": [{
                    "this-server-name": this, "mode": "load-balancing", "peers": peers
                }] }
            }]
        }})
    }

    #[test]
    fn test_commit_new_app() {
        let mut store = Store::open(":memory:").unwrap();
        let mut app = test_app("host-a", "192.0.2.1");
        app.daemons = vec![Daemon::new("ca", true), dhcp4(two_subnets())];

        let outcome = commit_app(store.conn_mut(), &app, vec![]).unwrap();
        let app_id = outcome.app.id.unwrap();
        assert!(outcome.app.daemons.iter().all(|d| d.id.is_some()));

        let texts: Vec<String> = outcome.events.iter().map(|e| e.render()).collect();
        assert_eq!(texts[0], "added app kea@192.0.2.1:8000 on machine host-a");
        assert!(texts.contains(&"added daemon dhcp4 to app kea@192.0.2.1:8000".to_string()));
        assert!(texts.contains(&"added subnet 192.0.2.0/24 to app kea@192.0.2.1:8000".to_string()));
        assert!(texts.contains(&"added 2 subnets to app kea@192.0.2.1:8000".to_string()));
        assert!(outcome.events.iter().all(|e| e.id.is_some() && e.app_id == Some(app_id)));

        let stored = store.get_app(app_id).unwrap().unwrap();
        let daemon = stored.daemon("dhcp4").unwrap();
        assert_eq!(daemon.subnet_index["192.0.3.0/24"], 20);
        assert!(daemon.config.is_some());

        let subnets = store.get_subnets().unwrap();
        assert_eq!(subnets.len(), 2);
        assert_eq!(subnets[1].local_subnets[0].out_of_pool_addresses, 2);
        assert_eq!(subnets[1].local_subnets[0].local_subnet_id, 20);

        let global = db::global_reservations(store.conn_mut()).unwrap();
        assert_eq!(global.v4_addresses, 1);
        assert_eq!(store.get_events(100).unwrap().len(), outcome.events.len());
    }

    #[test]
    fn test_recommit_adds_nothing() {
        let mut store = Store::open(":memory:").unwrap();
        let mut app = test_app("host-a", "192.0.2.1");
        app.daemons = vec![Daemon::new("ca", true), dhcp4(two_subnets())];
        let first = commit_app(store.conn_mut(), &app, vec![]).unwrap();

        let second = commit_app(store.conn_mut(), &first.app, vec![]).unwrap();
        assert!(second.events.is_empty());
        assert_eq!(second.app.id, first.app.id);
        assert_eq!(store.get_all_apps().unwrap().len(), 1);
    }

    #[test]
    fn test_change_events_resolved() {
        let mut store = Store::open(":memory:").unwrap();
        let mut app = test_app("host-a", "192.0.2.1");
        app.daemons = vec![Daemon::new("ca", true), Daemon::new("dhcp4", false)];
        let first = commit_app(store.conn_mut(), &app, vec![]).unwrap();

        let mut event = Event::new(EventLevel::Warning, "{daemon} is unreachable").with_app(&app);
        event.daemon = Some("dhcp4".to_string());
        let outcome = commit_app(store.conn_mut(), &first.app, vec![event]).unwrap();

        assert_eq!(outcome.events.len(), 1);
        assert_eq!(outcome.events[0].daemon_id, first.app.daemon("dhcp4").unwrap().id);
        assert_eq!(outcome.events[0].render(), "daemon dhcp4 is unreachable");
    }

    #[test]
    fn test_removed_subnets_are_deleted() {
        let mut store = Store::open(":memory:").unwrap();
        let mut app = test_app("host-a", "192.0.2.1");
        app.daemons = vec![dhcp4(two_subnets())];
        let first = commit_app(store.conn_mut(), &app, vec![]).unwrap();

        let mut app = first.app.clone();
        app.daemons[0].config = Some(KeaConfig::new(json!({ "Dhcp4": {
            "subnet4": [{ "id": 10, "subnet": "192.0.2.0/24" }]
        }})));
        commit_app(store.conn_mut(), &app, vec![]).unwrap();

        let subnets = store.get_subnets().unwrap();
        assert_eq!(subnets.len(), 1);
        assert_eq!(subnets[0].prefix, "192.0.2.0/24");
    }

    #[test]
    fn test_many_subnets_summarized() {
        let mut store = Store::open(":memory:").unwrap();
        let subnets: Vec<_> = (1..=12)
            .map(|i| json!({ "id": i, "subnet": format!("10.{}.0.0/16", i) }))
            .collect();
        let mut app = test_app("host-a", "192.0.2.1");
        app.daemons = vec![dhcp4(json!({ "Dhcp4": { "subnet4": subnets } }))];

        let outcome = commit_app(store.conn_mut(), &app, vec![]).unwrap();
        let subnet_events: Vec<_> = outcome.events.iter().filter(|e| e.text.contains("subnet")).collect();
        assert_eq!(subnet_events.len(), 1);
        assert_eq!(subnet_events[0].render(), "added 12 subnets to app kea@192.0.2.1:8000");
    }

    #[test]
    fn test_bad_config_skips_subnets() {
        let mut store = Store::open(":memory:").unwrap();
        let mut app = test_app("host-a", "192.0.2.1");
        app.daemons = vec![dhcp4(json!({ "Dhcp4": { "subnet4": [{ "id": 1, "subnet": "nonsense" }] } }))];

        let outcome = commit_app(store.conn_mut(), &app, vec![]).unwrap();
        assert!(outcome.app.id.is_some());
        assert!(store.get_subnets().unwrap().is_empty());
    }

    #[test]
    fn test_ha_service_from_two_apps() {
        for order in [[0usize, 1], [1, 0]] {
            let mut store = Store::open(":memory:").unwrap();
            let mut apps = vec![test_app("host-a", "192.0.2.1"), test_app("host-b", "192.0.2.2")];
            apps[0].daemons = vec![dhcp4(ha_config("server1", &["server1", "server2", "server4"]))];
            apps[1].daemons = vec![dhcp4(ha_config("server2", &["server1", "server2", "server4"]))];

            let mut ids = BTreeMap::new();
            for i in order {
                let outcome = commit_app(store.conn_mut(), &apps[i], vec![]).unwrap();
                ids.insert(i, outcome.app.daemons[0].id);
            }

            let services = store.get_ha_services().unwrap();
            assert_eq!(services.len(), 1, "order {:?}", order);
            let service = &services[0];
            assert_eq!(service.mode, "load-balancing");
            let members: Vec<_> = service.members.iter().map(|m| (m.server_name.as_str(), m.daemon_id)).collect();
            assert_eq!(members, vec![("server1", ids[&0]), ("server2", ids[&1]), ("server4", None)]);
        }
    }

    #[test]
    fn test_ha_service_dropped_with_hook() {
        let mut store = Store::open(":memory:").unwrap();
        let mut app = test_app("host-a", "192.0.2.1");
        app.daemons = vec![dhcp4(ha_config("server1", &["server1", "server2"]))];
        let first = commit_app(store.conn_mut(), &app, vec![]).unwrap();
        assert_eq!(store.get_ha_services().unwrap().len(), 1);

        let mut app = first.app.clone();
        app.daemons[0].config = Some(KeaConfig::new(json!({ "Dhcp4": {} })));
        commit_app(store.conn_mut(), &app, vec![]).unwrap();
        assert!(store.get_ha_services().unwrap().is_empty());
    }
}
