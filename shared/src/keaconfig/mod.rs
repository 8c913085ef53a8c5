//! Typed accessors over a configuration document returned by Kea's
//! `config-get`. Only the fields the monitor needs are exposed; the raw
//! document never leaves this module except for hashing and storage.

pub mod ranges;

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use crate::protocol::{DAEMON_D2, DAEMON_DHCP4, DAEMON_DHCP6, HOOK_HA};

pub use ranges::{AddressRange, PdPool, Prefix};

const ROOT_NAMES: [&str; 4] = ["Dhcp4", "Dhcp6", "Control-agent", "DhcpDdns"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid prefix {0}")]
    InvalidPrefix(String),
    #[error("invalid pool {0}")]
    InvalidPool(String),
    #[error("invalid address {0}")]
    InvalidAddress(String),
    #[error("subnet {0} is configured more than once")]
    DuplicatePrefix(String),
    #[error("malformed configuration: {0}")]
    Malformed(String),
}

/// Configuration of one Kea daemon as returned by `config-get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeaConfig(Value);

/// Which service daemons the control agent forwards commands to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlSockets {
    pub dhcp4: bool,
    pub dhcp6: bool,
    pub d2: bool,
}

impl ControlSockets {
    /// Daemon names with a declared control socket.
    pub fn daemons(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.dhcp4 {
            names.push(DAEMON_DHCP4);
        }
        if self.dhcp6 {
            names.push(DAEMON_DHCP6);
        }
        if self.d2 {
            names.push(DAEMON_D2);
        }
        names
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaPeer {
    pub name: String,
    pub role: Option<String>,
}

/// Parameters of the high availability hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaConfig {
    pub this_server_name: String,
    pub mode: String,
    pub peers: Vec<HaPeer>,
}

impl HaConfig {
    /// All server names the relationship references, this server included.
    pub fn server_names(&self) -> BTreeSet<&str> {
        let mut names: BTreeSet<&str> = self.peers.iter().map(|p| p.name.as_str()).collect();
        names.insert(self.this_server_name.as_str());
        names
    }

    pub fn role_of(&self, server_name: &str) -> Option<&str> {
        self.peers
            .iter()
            .find(|p| p.name == server_name)
            .and_then(|p| p.role.as_deref())
    }
}

/// A host reservation reduced to what the statistics need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub identifier: String,
    pub addresses: Vec<IpAddr>,
    pub prefixes: Vec<Prefix>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigSubnet {
    pub id: Option<i64>,
    pub prefix: Prefix,
    pub shared_network: Option<String>,
    pub pools: Vec<AddressRange>,
    pub pd_pools: Vec<PdPool>,
    pub reservations: Vec<Reservation>,
}

impl ConfigSubnet {
    pub fn out_of_pool_addresses(&self) -> u64 {
        self.reservations
            .iter()
            .flat_map(|r| r.addresses.iter())
            .filter(|addr| !self.pools.iter().any(|pool| pool.contains(addr)))
            .count() as u64
    }

    pub fn out_of_pool_prefixes(&self) -> u64 {
        self.reservations
            .iter()
            .flat_map(|r| r.prefixes.iter())
            .filter(|prefix| !self.pd_pools.iter().any(|pool| pool.contains(prefix)))
            .count() as u64
    }
}

#[derive(Deserialize)]
struct RawHook {
    library: String,
    #[serde(default)]
    parameters: Option<Value>,
}

#[derive(Deserialize)]
struct RawHaPeer {
    name: String,
    #[serde(default)]
    role: Option<String>,
}

#[derive(Deserialize)]
struct RawHa {
    #[serde(rename = "this-server-name", default)]
    this_server_name: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    peers: Vec<RawHaPeer>,
}

#[derive(Deserialize)]
struct RawPool {
    pool: String,
}

#[derive(Deserialize)]
struct RawPdPool {
    prefix: String,
    #[serde(rename = "prefix-len")]
    prefix_len: u8,
    #[serde(rename = "delegated-len", default)]
    delegated_len: Option<u8>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct RawReservation {
    hw_address: Option<String>,
    client_id: Option<String>,
    duid: Option<String>,
    circuit_id: Option<String>,
    flex_id: Option<String>,
    ip_address: Option<String>,
    #[serde(default)]
    ip_addresses: Vec<String>,
    #[serde(default)]
    prefixes: Vec<String>,
}

#[derive(Deserialize)]
struct RawSubnet {
    #[serde(default)]
    id: Option<i64>,
    subnet: String,
    #[serde(default)]
    pools: Vec<RawPool>,
    #[serde(rename = "pd-pools", default)]
    pd_pools: Vec<RawPdPool>,
    #[serde(default)]
    reservations: Vec<RawReservation>,
}

impl RawReservation {
    fn into_reservation(self) -> Result<Reservation, ConfigError> {
        let identifier = [
            self.hw_address.map(|v| format!("hw-address={}", v)),
            self.client_id.map(|v| format!("client-id={}", v)),
            self.duid.map(|v| format!("duid={}", v)),
            self.circuit_id.map(|v| format!("circuit-id={}", v)),
            self.flex_id.map(|v| format!("flex-id={}", v)),
        ]
        .into_iter()
        .flatten()
        .next()
        .unwrap_or_default();

        let mut addresses = Vec::new();
        let mut prefixes = Vec::new();
        for text in self.ip_address.into_iter().chain(self.ip_addresses) {
            // Some configurations put delegated prefixes in the address field.
            if text.contains('/') {
                prefixes.push(text.parse::<Prefix>()?);
            } else {
                let addr = text
                    .trim()
                    .parse::<IpAddr>()
                    .map_err(|_| ConfigError::InvalidAddress(text.clone()))?;
                addresses.push(addr);
            }
        }
        for text in self.prefixes {
            prefixes.push(text.parse::<Prefix>()?);
        }

        Ok(Reservation { identifier, addresses, prefixes })
    }
}

impl RawSubnet {
    fn into_subnet(self, shared_network: Option<&str>) -> Result<ConfigSubnet, ConfigError> {
        let prefix = self.subnet.parse::<Prefix>()?.network();
        let pools = self
            .pools
            .iter()
            .map(|p| p.pool.parse::<AddressRange>())
            .collect::<Result<Vec<_>, _>>()?;
        let pd_pools = self
            .pd_pools
            .iter()
            .map(|p| {
                let addr: IpAddr = p
                    .prefix
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidPrefix(p.prefix.clone()))?;
                Ok(PdPool {
                    prefix: Prefix::new(addr, p.prefix_len)?,
                    delegated_len: p.delegated_len.unwrap_or(p.prefix_len),
                })
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        let reservations = self
            .reservations
            .into_iter()
            .map(RawReservation::into_reservation)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ConfigSubnet {
            id: self.id,
            prefix,
            shared_network: shared_network.map(str::to_string),
            pools,
            pd_pools,
            reservations,
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: &Value, what: &str) -> Result<T, ConfigError> {
    serde_json::from_value(value.clone())
        .map_err(|e| ConfigError::Malformed(format!("{}: {}", what, e)))
}

impl KeaConfig {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json).map(Self)
    }

    /// The document, for hashing and storage only.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Top level key naming the daemon type, e.g. "Dhcp4".
    pub fn root_name(&self) -> Option<&'static str> {
        let map = self.0.as_object()?;
        ROOT_NAMES.into_iter().find(|name| map.contains_key(*name))
    }

    fn root(&self) -> Option<&serde_json::Map<String, Value>> {
        self.0.get(self.root_name()?)?.as_object()
    }

    fn subnet_key(&self) -> Option<&'static str> {
        match self.root_name()? {
            "Dhcp4" => Some("subnet4"),
            "Dhcp6" => Some("subnet6"),
            _ => None,
        }
    }

    fn hooks(&self) -> Vec<RawHook> {
        self.root()
            .and_then(|root| root.get("hooks-libraries"))
            .and_then(|hooks| decode::<Vec<RawHook>>(hooks, "hooks-libraries").ok())
            .unwrap_or_default()
    }

    /// True if a hook library whose path contains `fragment` is loaded.
    pub fn has_hook(&self, fragment: &str) -> bool {
        self.hooks().iter().any(|h| h.library.contains(fragment))
    }

    pub fn control_sockets(&self) -> ControlSockets {
        let sockets = self
            .root()
            .and_then(|root| root.get("control-sockets"))
            .and_then(Value::as_object);
        match sockets {
            Some(s) => ControlSockets {
                dhcp4: s.contains_key(DAEMON_DHCP4),
                dhcp6: s.contains_key(DAEMON_DHCP6),
                d2: s.contains_key(DAEMON_D2),
            },
            None => ControlSockets::default(),
        }
    }

    /// The first relationship configured in the HA hook. `None` when the
    /// hook is absent or lacks a server name or peers.
    pub fn ha_config(&self) -> Option<HaConfig> {
        let hook = self.hooks().into_iter().find(|h| h.library.contains(HOOK_HA))?;
        let params = hook.parameters?;
        let relationships = params.get("high-availability")?;
        let first = match relationships {
            Value::Array(items) => items.first()?,
            other => other,
        };
        let raw: RawHa = decode(first, "high-availability").ok()?;
        let this_server_name = raw.this_server_name.filter(|n| !n.is_empty())?;
        if raw.peers.is_empty() {
            return None;
        }
        Some(HaConfig {
            this_server_name,
            mode: raw.mode.unwrap_or_default(),
            peers: raw
                .peers
                .into_iter()
                .map(|p| HaPeer { name: p.name, role: p.role })
                .collect(),
        })
    }

    /// Top level subnets followed by the subnets of each shared network.
    pub fn subnets(&self) -> Result<Vec<ConfigSubnet>, ConfigError> {
        let (root, key) = match (self.root(), self.subnet_key()) {
            (Some(root), Some(key)) => (root, key),
            _ => return Ok(Vec::new()),
        };

        let mut subnets = Vec::new();
        if let Some(top) = root.get(key) {
            for raw in decode::<Vec<RawSubnet>>(top, key)? {
                subnets.push(raw.into_subnet(None)?);
            }
        }

        if let Some(Value::Array(networks)) = root.get("shared-networks") {
            for net in networks {
                let name = net.get("name").and_then(Value::as_str);
                if let Some(list) = net.get(key) {
                    for raw in decode::<Vec<RawSubnet>>(list, key)? {
                        subnets.push(raw.into_subnet(name)?);
                    }
                }
            }
        }

        Ok(subnets)
    }

    /// Reservations declared at the top level of the configuration.
    pub fn global_reservations(&self) -> Result<Vec<Reservation>, ConfigError> {
        match self.root().and_then(|root| root.get("reservations")) {
            Some(list) => decode::<Vec<RawReservation>>(list, "reservations")?
                .into_iter()
                .map(RawReservation::into_reservation)
                .collect(),
            None => Ok(Vec::new()),
        }
    }
}

/// Builds the prefix to local subnet id lookup of a daemon.
pub fn index_subnets(subnets: &[ConfigSubnet]) -> Result<BTreeMap<String, i64>, ConfigError> {
    let mut index = BTreeMap::new();
    for subnet in subnets {
        let prefix = subnet.prefix.to_string();
        if index.insert(prefix.clone(), subnet.id.unwrap_or(0)).is_some() {
            return Err(ConfigError::DuplicatePrefix(prefix));
        }
    }
    Ok(index)
}
