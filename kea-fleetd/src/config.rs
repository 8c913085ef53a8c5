use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::types::{AccessPoint, AccessPointKind, Machine};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub apps: Vec<AppEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_state_interval")]
    pub state_interval_secs: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
    /// Round-trip budget for one batch of commands
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    /// Apps reconciled concurrently
    #[serde(default = "default_workers")]
    pub workers: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// A Kea control endpoint to monitor.
#[derive(Debug, Clone, Deserialize)]
pub struct AppEndpoint {
    pub machine: String,
    #[serde(default = "default_agent_port")]
    pub agent_port: u16,
    pub address: String,
    #[serde(default = "default_control_port")]
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub key: Option<String>,
}

impl AppEndpoint {
    pub fn machine(&self) -> Machine {
        Machine {
            id: None,
            address: self.machine.clone(),
            agent_port: self.agent_port,
        }
    }

    pub fn access_point(&self) -> AccessPoint {
        AccessPoint {
            kind: AccessPointKind::Control,
            address: self.address.clone(),
            port: self.port,
            use_secure_protocol: self.secure,
            key: self.key.clone(),
        }
    }
}

fn default_state_interval() -> u64 {
    30
}

fn default_stats_interval() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    2000
}

fn default_workers() -> usize {
    4
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/kea-fleet/fleet.db")
}

fn default_listen() -> String {
    "[::]:8054".to_string()
}

fn default_agent_port() -> u16 {
    8080
}

fn default_control_port() -> u16 {
    8000
}

impl MonitorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            state_interval_secs: default_state_interval(),
            stats_interval_secs: default_stats_interval(),
            request_timeout_ms: default_request_timeout(),
            workers: default_workers(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        anyhow::ensure!(config.monitor.workers > 0, "monitor.workers must be positive");
        anyhow::ensure!(
            config.monitor.state_interval_secs > 0 && config.monitor.stats_interval_secs > 0,
            "polling intervals must be positive"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.monitor.state_interval_secs, 30);
        assert_eq!(config.monitor.request_timeout(), Duration::from_secs(2));
        assert_eq!(config.api.listen, "[::]:8054");
        assert!(config.apps.is_empty());
    }

    #[test]
    fn test_apps() {
        let config = Config::parse(
            r#"
            [monitor]
            workers = 2

            [[apps]]
            machine = "primary"
            address = "192.0.2.33"
            secure = true
            key = "admin:secret"

            [[apps]]
            machine = "secondary"
            address = "192.0.2.66"
            port = 8001
            "#,
        )
        .unwrap();

        assert_eq!(config.monitor.workers, 2);
        assert_eq!(config.apps.len(), 2);
        let ap = config.apps[0].access_point();
        assert_eq!(ap.port, 8000);
        assert!(ap.use_secure_protocol);
        assert_eq!(config.apps[1].machine().agent_port, 8080);
        assert_eq!(config.apps[1].port, 8001);
    }

    #[test]
    fn test_rejects_zero_workers() {
        assert!(Config::parse("[monitor]\nworkers = 0\n").is_err());
    }
}
