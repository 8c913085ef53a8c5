use std::collections::BTreeMap;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::keaconfig::KeaConfig;
use crate::protocol::DAEMON_CA;

/// A host running the monitoring agent next to one or more apps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    pub id: Option<i64>,
    pub address: String,
    pub agent_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessPointKind {
    Control,
}

/// An endpoint through which an app accepts commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPoint {
    pub kind: AccessPointKind,
    pub address: String,
    pub port: u16,
    pub use_secure_protocol: bool,
    /// Basic auth credentials in the form `user:password`
    #[serde(skip_serializing)]
    pub key: Option<String>,
}

/// One monitored Kea server instance.
/// This is the canonical data model used by the daemon, the store and the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    /// Store identity, `None` until the first successful commit
    pub id: Option<i64>,

    pub machine: Machine,

    pub access_points: Vec<AccessPoint>,

    /// True iff every daemon of the app is active
    pub active: bool,

    /// Version reported by the control daemon
    pub version: String,

    pub daemons: Vec<Daemon>,
}

impl App {
    /// A never-seen app reachable through the given control endpoint.
    pub fn new(machine: Machine, control: AccessPoint) -> Self {
        Self {
            id: None,
            machine,
            access_points: vec![control],
            active: false,
            version: String::new(),
            daemons: Vec::new(),
        }
    }

    pub fn control_access_point(&self) -> Option<&AccessPoint> {
        self.access_points
            .iter()
            .find(|ap| ap.kind == AccessPointKind::Control)
    }

    pub fn daemon(&self, name: &str) -> Option<&Daemon> {
        self.daemons.iter().find(|d| d.name == name)
    }

    /// Human readable label used when rendering events and logs.
    pub fn label(&self) -> String {
        match self.control_access_point() {
            Some(ap) => format!("kea@{}:{}", ap.address, ap.port),
            None => format!("kea@{}", self.machine.address),
        }
    }
}

/// One named process within an app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Daemon {
    pub id: Option<i64>,
    pub name: String,
    pub active: bool,
    /// Operator opt-out; unmonitored daemons raise no alerts
    pub monitored: bool,
    pub version: String,
    pub extended_version: String,
    /// Seconds since the daemon started
    pub uptime: i64,
    /// Poll time minus seconds since the last reconfiguration
    pub reloaded_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub config: Option<KeaConfig>,
    /// SHA-256 of the canonical configuration JSON
    pub config_hash: Option<String>,
    /// Subnet prefix to local subnet id, rebuilt on every commit
    #[serde(default)]
    pub subnet_index: BTreeMap<String, i64>,
}

impl Daemon {
    pub fn new(name: impl Into<String>, active: bool) -> Self {
        Self {
            id: None,
            name: name.into(),
            active,
            monitored: true,
            version: String::new(),
            extended_version: String::new(),
            uptime: 0,
            reloaded_at: None,
            config: None,
            config_hash: None,
            subnet_index: BTreeMap::new(),
        }
    }

    pub fn is_control_agent(&self) -> bool {
        self.name == DAEMON_CA
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warning => "warning",
            EventLevel::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(EventLevel::Info),
            "warning" => Some(EventLevel::Warning),
            "error" => Some(EventLevel::Error),
            _ => None,
        }
    }
}

/// An immutable record of a state transition.
///
/// `text` is a template that may reference `{machine}`, `{app}`, `{daemon}`
/// and `{subnet}`; the references are carried alongside so the text can be
/// rendered after the related rows got their ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub level: EventLevel,
    pub text: String,
    pub details: String,
    pub machine: Option<String>,
    pub app_id: Option<i64>,
    pub app: Option<String>,
    pub daemon_id: Option<i64>,
    pub daemon: Option<String>,
    pub subnet: Option<String>,
}

impl Event {
    pub fn new(level: EventLevel, text: impl Into<String>) -> Self {
        Self {
            id: None,
            created_at: Utc::now(),
            level,
            text: text.into(),
            details: String::new(),
            machine: None,
            app_id: None,
            app: None,
            daemon_id: None,
            daemon: None,
            subnet: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    /// Attaches the app and its machine.
    pub fn with_app(mut self, app: &App) -> Self {
        self.machine = Some(app.machine.address.clone());
        self.app_id = app.id;
        self.app = Some(app.label());
        self
    }

    pub fn with_daemon(mut self, daemon: &Daemon) -> Self {
        self.daemon_id = daemon.id;
        self.daemon = Some(daemon.name.clone());
        self
    }

    pub fn with_subnet(mut self, prefix: impl Into<String>) -> Self {
        self.subnet = Some(prefix.into());
        self
    }

    /// Substitutes the references into the template.
    pub fn render(&self) -> String {
        let mut text = self.text.clone();
        if let Some(machine) = &self.machine {
            text = text.replace("{machine}", &format!("machine {}", machine));
        }
        if let Some(app) = &self.app {
            text = text.replace("{app}", &format!("app {}", app));
        }
        if let Some(daemon) = &self.daemon {
            text = text.replace("{daemon}", &format!("daemon {}", daemon));
        }
        if let Some(subnet) = &self.subnet {
            text = text.replace("{subnet}", &format!("subnet {}", subnet));
        }
        text
    }
}

/// One daemon's view of a subnet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSubnet {
    pub daemon_id: i64,
    pub local_subnet_id: i64,
    /// Lease counters as last reported, `None` until the first pull
    pub stats: Option<BTreeMap<String, u64>>,
    pub stats_collected_at: Option<DateTime<Utc>>,
    /// Host reservations outside every address pool of the subnet
    pub out_of_pool_addresses: u64,
    /// Prefix reservations outside every prefix delegation pool
    pub out_of_pool_prefixes: u64,
}

/// A logical subnet identified by its prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: i64,
    pub prefix: String,
    pub shared_network: Option<String>,
    /// Per-mille
    pub addr_utilization: i32,
    /// Per-mille
    pub pd_utilization: i32,
    pub stats_collected_at: Option<DateTime<Utc>>,
    pub local_subnets: Vec<LocalSubnet>,
}

impl Subnet {
    pub fn is_ipv6(&self) -> bool {
        self.prefix.contains(':')
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaMember {
    pub server_name: String,
    pub role: Option<String>,
    /// `None` while no stored daemon claims the server name
    pub daemon_id: Option<i64>,
}

/// A detected high availability relationship between daemons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaService {
    pub id: i64,
    /// Daemon name the service is scoped to, e.g. "dhcp4"
    pub kind: String,
    pub mode: String,
    /// Ordered by server name
    pub members: Vec<HaMember>,
}
