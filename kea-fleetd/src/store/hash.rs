use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::keaconfig::KeaConfig;
use shared::types::App;

/// Hash only stable fields: uptime and reload time change on every poll
/// but don't represent a meaningful change of the fleet.
#[derive(Serialize)]
struct DaemonView<'a> {
    name: &'a str,
    active: bool,
    monitored: bool,
    version: &'a str,
    config_hash: Option<&'a str>,
}

#[derive(Serialize)]
struct AppView<'a> {
    id: Option<i64>,
    label: String,
    active: bool,
    daemons: Vec<DaemonView<'a>>,
}

/// Computes a SHA-256 hash of the fleet state.
/// Apps are sorted by id and daemons by name for deterministic output.
pub fn fleet_hash(apps: &[App]) -> String {
    let mut indices: Vec<usize> = (0..apps.len()).collect();
    indices.sort_by_key(|&i| (apps[i].id, apps[i].label()));

    let views: Vec<AppView<'_>> = indices
        .iter()
        .map(|&i| {
            let app = &apps[i];
            let mut daemons: Vec<DaemonView<'_>> = app
                .daemons
                .iter()
                .map(|d| DaemonView {
                    name: &d.name,
                    active: d.active,
                    monitored: d.monitored,
                    version: &d.version,
                    config_hash: d.config_hash.as_deref(),
                })
                .collect();
            daemons.sort_by(|a, b| a.name.cmp(b.name));
            AppView {
                id: app.id,
                label: app.label(),
                active: app.active,
                daemons,
            }
        })
        .collect();

    digest(&views)
}

/// SHA-256 of the configuration serialized with sorted keys.
pub fn config_hash(config: &KeaConfig) -> String {
    digest(config.as_value())
}

fn digest<T: Serialize + ?Sized>(value: &T) -> String {
    // Serializing plain views and JSON values cannot fail.
    let json = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&json))
}
