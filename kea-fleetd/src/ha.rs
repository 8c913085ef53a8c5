//! Infers high availability services from the daemons' HA hook settings.
//!
//! Daemons don't share any identifier across machines, so membership is
//! derived from server names: daemons of the same kind whose hook
//! configurations reference overlapping sets of server names belong to the
//! same service.

use shared::keaconfig::HaConfig;
use shared::protocol::is_dhcp_daemon;
use shared::types::{Daemon, HaMember};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaServiceCandidate {
    /// Daemon name the service is scoped to
    pub kind: String,
    /// Taken verbatim from the detecting daemon's hook
    pub mode: String,
    /// Every configured server name, sorted
    pub server_names: Vec<String>,
    /// One entry per server name, in the same order
    pub members: Vec<HaMember>,
}

fn ha_config_of(daemon: &Daemon) -> Option<HaConfig> {
    if !is_dhcp_daemon(&daemon.name) {
        return None;
    }
    daemon.config.as_ref()?.ha_config()
}

/// Detects the HA services `daemon` takes part in. `stored` holds the
/// daemons of every app; `daemon` itself may or may not be among them.
pub fn detect_services(daemon: &Daemon, stored: &[Daemon]) -> Vec<HaServiceCandidate> {
    let Some(ha) = ha_config_of(daemon) else {
        return Vec::new();
    };
    let names = ha.server_names();

    let members = names
        .iter()
        .map(|&name| {
            let daemon_id = if name == ha.this_server_name {
                daemon.id
            } else {
                find_peer(daemon, name, &ha.this_server_name, stored)
            };
            HaMember {
                server_name: name.to_string(),
                role: ha.role_of(name).map(str::to_string),
                daemon_id,
            }
        })
        .collect();

    vec![HaServiceCandidate {
        kind: daemon.name.clone(),
        mode: ha.mode.clone(),
        server_names: names.iter().map(|n| n.to_string()).collect(),
        members,
    }]
}

/// The stored daemon calling itself `server_name` whose relationship
/// references this server back. Lowest id wins when misconfigured daemons
/// share a name.
fn find_peer(daemon: &Daemon, server_name: &str, this_server_name: &str, stored: &[Daemon]) -> Option<i64> {
    stored
        .iter()
        .filter(|other| other.name == daemon.name)
        .filter(|other| other.id.is_some() && other.id != daemon.id)
        .filter(|other| {
            ha_config_of(other).is_some_and(|peer| {
                peer.this_server_name == server_name
                    && peer.server_names().contains(this_server_name)
            })
        })
        .filter_map(|other| other.id)
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::keaconfig::KeaConfig;

    fn ha_daemon(id: i64, kind: &str, this: &str, mode: &str, peers: &[&str]) -> Daemon {
        let root = if kind == "dhcp4" { "Dhcp4" } else { "Dhcp6" };
        let peers: Vec<_> = peers
            .iter()
            .enumerate()
            .map(|(i, p)| json!({ "name": p, "role": if i == 0 { "primary" } else { "secondary" } }))
            .collect();
        let body = json!({
            "hooks-libraries": [{
                "library": "/usr/lib/kea/hooks/libdhcp_ha.so",
                "parameters": {
                    "high-availability": [{
                        "this-server-name": this,
                        "mode": mode,
                        "peers": peers
                    }]
                }
            }]
        });
        let mut config = serde_json::Map::new();
        config.insert(root.to_string(), body);
        Daemon {
            id: Some(id),
            config: Some(KeaConfig::new(config.into())),
            ..Daemon::new(kind, true)
        }
    }

    fn fleet() -> Vec<Daemon> {
        vec![
            ha_daemon(1, "dhcp4", "server1", "load-balancing", &["server1", "server2", "server4"]),
            ha_daemon(2, "dhcp6", "server1", "hot-standby", &["server1", "server2"]),
            ha_daemon(3, "dhcp4", "server2", "load-balancing", &["server1", "server2", "server4"]),
            ha_daemon(4, "dhcp6", "server2", "hot-standby", &["server1", "server2"]),
        ]
    }

    #[test]
    fn test_load_balancing_trio() {
        let daemons = fleet();
        let services = detect_services(&daemons[0], &daemons);
        assert_eq!(services.len(), 1);

        let service = &services[0];
        assert_eq!(service.kind, "dhcp4");
        assert_eq!(service.mode, "load-balancing");
        assert_eq!(service.server_names, vec!["server1", "server2", "server4"]);
        let ids: Vec<_> = service.members.iter().map(|m| m.daemon_id).collect();
        assert_eq!(ids, vec![Some(1), Some(3), None]);
        assert_eq!(service.members[0].role.as_deref(), Some("primary"));
    }

    #[test]
    fn test_same_service_from_either_side() {
        let daemons = fleet();
        let from_first = detect_services(&daemons[0], &daemons);
        let from_second = detect_services(&daemons[2], &daemons);
        assert_eq!(from_first[0].server_names, from_second[0].server_names);
        assert_eq!(from_first[0].members, from_second[0].members);
    }

    #[test]
    fn test_order_independent() {
        let daemons = fleet();
        let mut reversed = daemons.clone();
        reversed.reverse();
        for daemon in &daemons {
            assert_eq!(detect_services(daemon, &daemons), detect_services(daemon, &reversed));
        }
    }

    #[test]
    fn test_kinds_are_not_mixed() {
        let daemons = fleet();
        let services = detect_services(&daemons[1], &daemons);
        let ids: Vec<_> = services[0].members.iter().map(|m| m.daemon_id).collect();
        assert_eq!(ids, vec![Some(2), Some(4)]);
    }

    #[test]
    fn test_unrelated_pair_ignored() {
        let mut daemons = fleet();
        // Also calls itself server2 but pairs with server9 only.
        daemons.push(ha_daemon(0, "dhcp4", "server2", "hot-standby", &["server2", "server9"]));
        let services = detect_services(&daemons[0], &daemons);
        assert_eq!(services[0].members[1].daemon_id, Some(3));

        // A second daemon really paired with server1 under the same name.
        daemons.push(ha_daemon(9, "dhcp4", "server2", "load-balancing", &["server1", "server2"]));
        let services = detect_services(&daemons[0], &daemons);
        assert_eq!(services[0].members[1].daemon_id, Some(3));
    }

    #[test]
    fn test_mode_mismatch_passed_through() {
        let daemons = vec![
            ha_daemon(1, "dhcp4", "server1", "load-balancing", &["server1", "server2"]),
            ha_daemon(2, "dhcp4", "server2", "hot-standby", &["server1", "server2"]),
        ];
        assert_eq!(detect_services(&daemons[0], &daemons)[0].mode, "load-balancing");
        assert_eq!(detect_services(&daemons[1], &daemons)[0].mode, "hot-standby");
        assert_eq!(detect_services(&daemons[1], &daemons)[0].members[0].daemon_id, Some(1));
    }

    #[test]
    fn test_no_ha_hook() {
        let daemon = Daemon {
            id: Some(1),
            config: Some(KeaConfig::new(json!({ "Dhcp4": {} }))),
            ..Daemon::new("dhcp4", true)
        };
        assert!(detect_services(&daemon, &[]).is_empty());
        assert!(detect_services(&Daemon::new("ca", true), &[]).is_empty());
    }
}
