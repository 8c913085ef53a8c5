//! Polls an app's daemons and reconciles the answers with the stored state.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use shared::keaconfig::KeaConfig;
use shared::protocol::{is_dhcp_daemon, CMD_CONFIG_GET, CMD_STATUS_GET, CMD_VERSION_GET, DAEMON_CA};
use shared::types::{App, Daemon, Event, EventLevel};
use crate::kea::commands::{
    forward_within, Command, CommandForwarder, CommandResponse, StatusArgs, TransportError, VersionArgs,
};
use crate::store::hash::config_hash;

/// Outcome of one poll of an app.
#[derive(Debug)]
pub struct Reconciliation {
    pub app: App,
    /// Change events, to be emitted only once the app is committed
    pub events: Vec<Event>,
    /// False when the control agent was down and the stored daemons were kept
    pub daemons_replaced: bool,
    /// True when the control agent answered both its commands
    pub reachable: bool,
    /// Error text per daemon name
    pub errors: BTreeMap<String, String>,
}

/// Daemons materialized from the latest poll, keyed by name.
#[derive(Debug, Default)]
pub struct Poll {
    pub daemons: BTreeMap<String, Daemon>,
    pub errors: BTreeMap<String, String>,
}

impl Poll {
    /// Starts from the stored daemon of that name, assumed active until a
    /// command fails.
    fn seed(&mut self, app: &App, name: &str) {
        let daemon = match app.daemon(name) {
            Some(stored) => Daemon { active: true, ..stored.clone() },
            None => Daemon::new(name, true),
        };
        self.daemons.insert(name.to_string(), daemon);
    }

    fn degrade(&mut self, name: &str, error: String) {
        tracing::warn!("{}", error);
        if let Some(daemon) = self.daemons.get_mut(name) {
            daemon.active = false;
        }
        self.errors.entry(name.to_string()).or_insert(error);
    }

    /// Applies one command type's outcome to the daemons it addressed.
    /// Daemons that got no successful answer are degraded.
    fn apply<F>(
        &mut self,
        command: &str,
        addressed: &[String],
        outcome: Result<Vec<CommandResponse>, TransportError>,
        mut update: F,
    ) where
        F: FnMut(&mut Daemon, &CommandResponse) -> Result<(), String>,
    {
        let responses = match outcome {
            Ok(responses) => responses,
            Err(e) => {
                for name in addressed {
                    self.degrade(name, format!("problem with {} response: {}", command, e));
                }
                return;
            }
        };

        let mut answered = HashSet::new();
        for rsp in &responses {
            if !addressed.contains(&rsp.daemon) {
                tracing::warn!("unrecognized daemon {:?} in {} response", rsp.daemon, command);
                continue;
            }
            let Some(daemon) = self.daemons.get_mut(&rsp.daemon) else {
                tracing::warn!("unrecognized daemon {:?} in {} response", rsp.daemon, command);
                continue;
            };
            answered.insert(rsp.daemon.clone());

            if !rsp.is_success() {
                let error = format!(
                    "problem with {} and kea daemon {}: result == {}, msg: {}",
                    command, rsp.daemon, rsp.result, rsp.text
                );
                self.degrade(&rsp.daemon, error);
                continue;
            }
            if let Err(error) = update(daemon, rsp) {
                self.degrade(&rsp.daemon, format!("problem with {} and kea daemon {}: {}", command, rsp.daemon, error));
            }
        }

        for name in addressed {
            if !answered.contains(name) {
                self.degrade(name, format!("no {} response from kea daemon {}", command, name));
            }
        }
    }
}

fn set_version(daemon: &mut Daemon, rsp: &CommandResponse) -> Result<(), String> {
    let args: Option<VersionArgs> = rsp.decode_arguments().map_err(|e| e.to_string())?;
    daemon.version = rsp.text.clone();
    daemon.extended_version = args.map(|a| a.extended).unwrap_or_default();
    Ok(())
}

fn set_config(daemon: &mut Daemon, rsp: &CommandResponse) -> Result<(), String> {
    let args = rsp.arguments.clone().ok_or("empty configuration")?;
    let config = KeaConfig::new(args);
    daemon.config_hash = Some(config_hash(&config));
    daemon.config = Some(config);
    Ok(())
}

pub struct Reconciler {
    forwarder: Arc<dyn CommandForwarder>,
    timeout: Duration,
}

impl Reconciler {
    pub fn new(forwarder: Arc<dyn CommandForwarder>, timeout: Duration) -> Self {
        Self { forwarder, timeout }
    }

    /// Polls the app and diffs the result against its stored state.
    pub async fn reconcile(&self, app: &App) -> Reconciliation {
        let now = Utc::now();
        let mut poll = Poll::default();

        match self.poll_control_agent(app, &mut poll).await {
            Some(daemons) => self.poll_daemons(app, now, &daemons, &mut poll).await,
            None => tracing::warn!("problem with getting state from {}", app.label()),
        }

        find_changes(app, poll)
    }

    /// Phase A: version and configuration of the control agent. Returns the
    /// service daemons it exposes, or `None` if the cycle must stop here.
    async fn poll_control_agent(&self, app: &App, poll: &mut Poll) -> Option<Vec<String>> {
        let cmds = [
            Command::new(CMD_VERSION_GET, &[]),
            Command::new(CMD_CONFIG_GET, &[]),
        ];

        let mut result = match forward_within(self.forwarder.as_ref(), app, &cmds, self.timeout).await {
            Ok(result) => result,
            Err(e) => {
                poll.errors.insert(DAEMON_CA.to_string(), format!("problem with control agent: {}", e));
                return None;
            }
        };

        poll.seed(app, DAEMON_CA);
        let ca = [DAEMON_CA.to_string()];

        let version = result.take(0).and_then(|list| non_empty(CMD_VERSION_GET, list));
        poll.apply(CMD_VERSION_GET, &ca, version, set_version);
        if !poll.daemons[DAEMON_CA].active {
            return None;
        }

        let config = result.take(1).and_then(|list| non_empty(CMD_CONFIG_GET, list));
        poll.apply(CMD_CONFIG_GET, &ca, config, set_config);
        let ca_daemon = &poll.daemons[DAEMON_CA];
        if !ca_daemon.active {
            return None;
        }

        let sockets = ca_daemon
            .config
            .as_ref()
            .map(|c| c.control_sockets())
            .unwrap_or_default();
        Some(sockets.daemons().into_iter().map(str::to_string).collect())
    }

    /// Phase B: version, status and configuration of the service daemons in
    /// one round trip. Each command type degrades only what it addressed.
    async fn poll_daemons(&self, app: &App, now: DateTime<Utc>, daemons: &[String], poll: &mut Poll) {
        if daemons.is_empty() {
            return;
        }
        for name in daemons {
            poll.seed(app, name);
        }

        let all: Vec<&str> = daemons.iter().map(String::as_str).collect();
        let dhcp: Vec<String> = daemons.iter().filter(|d| is_dhcp_daemon(d)).cloned().collect();
        let dhcp_refs: Vec<&str> = dhcp.iter().map(String::as_str).collect();

        let mut cmds = vec![Command::new(CMD_VERSION_GET, &all)];
        if !dhcp.is_empty() {
            cmds.push(Command::new(CMD_STATUS_GET, &dhcp_refs));
        }
        cmds.push(Command::new(CMD_CONFIG_GET, &all));

        let mut result = match forward_within(self.forwarder.as_ref(), app, &cmds, self.timeout).await {
            Ok(result) => result,
            Err(e) => {
                for name in daemons {
                    poll.degrade(name, format!("problem with getting state from kea daemon {}: {}", name, e));
                }
                return;
            }
        };

        poll.apply(CMD_VERSION_GET, daemons, result.take(0), set_version);

        let mut next = 1;
        if !dhcp.is_empty() {
            poll.apply(CMD_STATUS_GET, &dhcp, result.take(next), |daemon, rsp| {
                if let Some(args) = rsp.decode_arguments::<StatusArgs>().map_err(|e| e.to_string())? {
                    let reloaded_at = chrono::Duration::try_seconds(args.reload)
                        .and_then(|since| now.checked_sub_signed(since))
                        .ok_or_else(|| format!("invalid reload time {}", args.reload))?;
                    daemon.uptime = args.uptime;
                    daemon.reloaded_at = Some(reloaded_at);
                }
                Ok(())
            });
            next += 1;
        }

        poll.apply(CMD_CONFIG_GET, daemons, result.take(next), set_config);
    }
}

fn non_empty(command: &str, list: Vec<CommandResponse>) -> Result<Vec<CommandResponse>, TransportError> {
    if list.is_empty() {
        return Err(TransportError::Malformed {
            command: command.to_string(),
            reason: "empty response".to_string(),
        });
    }
    Ok(list)
}

/// Stored and polled daemons paired by name.
#[derive(Debug, Default)]
pub struct DaemonMatch<'a> {
    /// (stored, polled)
    pub matched: Vec<(&'a Daemon, &'a Daemon)>,
    pub added: Vec<&'a Daemon>,
    pub removed: Vec<&'a Daemon>,
}

pub fn match_daemons<'a>(stored: &'a [Daemon], polled: &'a [Daemon]) -> DaemonMatch<'a> {
    let mut result = DaemonMatch::default();
    for new in polled {
        match stored.iter().find(|old| old.name == new.name) {
            Some(old) => result.matched.push((old, new)),
            None => result.added.push(new),
        }
    }
    for old in stored {
        if !polled.iter().any(|new| new.name == old.name) {
            result.removed.push(old);
        }
    }
    result
}

/// Decides activity transitions and raises the matching events.
pub fn find_changes(app: &App, poll: Poll) -> Reconciliation {
    let Poll { daemons, errors } = poll;
    let reachable = daemons.get(DAEMON_CA).is_some_and(|ca| ca.active);
    let mut events = Vec::new();
    let mut updated = app.clone();

    if app.id.is_some() && !reachable {
        let ca_error = errors.get(DAEMON_CA).cloned().unwrap_or_default();
        for daemon in updated.daemons.iter_mut().filter(|d| d.active) {
            daemon.active = false;
            let details = errors.get(&daemon.name).unwrap_or(&ca_error).clone();
            events.push(
                Event::new(EventLevel::Error, "{daemon} is unreachable")
                    .with_details(details)
                    .with_app(app)
                    .with_daemon(daemon),
            );
        }
        if app.active {
            events.push(
                Event::new(EventLevel::Error, "{app} is unreachable")
                    .with_details(ca_error)
                    .with_app(app),
            );
        }
        updated.active = false;
        return Reconciliation {
            app: updated,
            events,
            daemons_replaced: false,
            reachable,
            errors,
        };
    }

    let polled: Vec<Daemon> = daemons.into_values().collect();
    let mut new_daemons: Vec<Daemon> = Vec::new();

    if app.id.is_some() {
        let matching = match_daemons(&app.daemons, &polled);
        for (old, new) in &matching.matched {
            if new.active != old.active {
                let (level, text, details) = if new.active {
                    (EventLevel::Info, "{daemon} is reachable now", String::new())
                } else {
                    let details = errors.get(&old.name).cloned().unwrap_or_default();
                    (EventLevel::Error, "{daemon} is unreachable", details)
                };
                events.push(
                    Event::new(level, text)
                        .with_details(details)
                        .with_app(app)
                        .with_daemon(old),
                );
            } else if new.uptime < old.uptime {
                events.push(
                    Event::new(EventLevel::Warning, "{daemon} has been restarted")
                        .with_app(app)
                        .with_daemon(old),
                );
            }

            if new.version != old.version {
                let text = format!("{{daemon}} version changed from {} to {}", old.version, new.version);
                events.push(Event::new(EventLevel::Warning, text).with_app(app).with_daemon(old));
            }
        }

        for old in &matching.removed {
            let mut kept = (*old).clone();
            if kept.active {
                kept.active = false;
                events.push(
                    Event::new(EventLevel::Error, "{daemon} is unreachable")
                        .with_details("daemon is no longer exposed by the control agent")
                        .with_app(app)
                        .with_daemon(old),
                );
            }
            new_daemons.push(kept);
        }
        new_daemons.extend(polled);
    } else {
        // Daemons that failed their very first poll are not alerted about.
        new_daemons = polled
            .into_iter()
            .map(|mut d| {
                if !d.active {
                    d.monitored = false;
                }
                d
            })
            .collect();
    }

    new_daemons.sort_by(|a, b| a.name.cmp(&b.name));
    updated.active = new_daemons.iter().all(|d| d.active);
    if let Some(ca) = new_daemons.iter().find(|d| d.is_control_agent()) {
        updated.version = ca.version.clone();
    }
    updated.daemons = new_daemons;

    Reconciliation {
        app: updated,
        events,
        daemons_replaced: true,
        reachable,
        errors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::types::{AccessPoint, AccessPointKind, Machine};
    use crate::kea::commands::fake::FakeForwarder;

    fn new_app() -> App {
        App::new(
            Machine { id: Some(1), address: "primary".to_string(), agent_port: 8080 },
            AccessPoint {
                kind: AccessPointKind::Control,
                address: "192.0.2.33".to_string(),
                port: 8000,
                use_secure_protocol: false,
                key: None,
            },
        )
    }

    fn daemon(id: i64, name: &str, active: bool, uptime: i64, version: &str) -> Daemon {
        Daemon {
            id: Some(id),
            uptime,
            version: version.to_string(),
            ..Daemon::new(name, active)
        }
    }

    fn stored_app() -> App {
        let mut app = new_app();
        app.id = Some(7);
        app.active = true;
        app.daemons = vec![
            daemon(1, "ca", true, 0, "1.8.0"),
            daemon(2, "dhcp4", true, 500, "1.8.0"),
        ];
        app
    }

    fn ok(text: &str) -> String {
        json!({ "result": 0, "text": text }).to_string()
    }

    fn ca_config() -> String {
        json!({
            "result": 0,
            "arguments": {
                "Control-agent": {
                    "control-sockets": { "dhcp4": { "socket-type": "unix", "socket-name": "/tmp/kea4" } }
                }
            }
        })
        .to_string()
    }

    fn dhcp4_config() -> String {
        json!({ "result": 0, "arguments": { "Dhcp4": { "subnet4": [] } } }).to_string()
    }

    fn status(uptime: i64, reload: i64) -> String {
        json!({ "result": 0, "arguments": { "uptime": uptime, "reload": reload } }).to_string()
    }

    /// Healthy control agent with one dhcp4 daemon reporting `uptime`.
    fn healthy(uptime: i64, version: &'static str) -> FakeForwarder {
        FakeForwarder::new(move |_, cmds, call_no| {
            if call_no == 0 {
                return Ok(vec![Ok(vec![ok("1.8.0")]), Ok(vec![ca_config()])]);
            }
            assert_eq!(cmds.len(), 3);
            Ok(vec![
                Ok(vec![ok(version)]),
                Ok(vec![status(uptime, 10)]),
                Ok(vec![dhcp4_config()]),
            ])
        })
    }

    fn reconciler(fake: FakeForwarder) -> (Reconciler, Arc<FakeForwarder>) {
        let fake = Arc::new(fake);
        (Reconciler::new(fake.clone(), Duration::from_secs(2)), fake)
    }

    #[test]
    fn test_match_daemons() {
        let stored = vec![daemon(1, "ca", true, 0, ""), daemon(2, "d2", true, 0, "")];
        let polled = vec![daemon(0, "ca", true, 0, ""), daemon(0, "dhcp4", true, 0, "")];
        let m = match_daemons(&stored, &polled);
        assert_eq!(m.matched.len(), 1);
        assert_eq!(m.matched[0].0.name, "ca");
        assert_eq!(m.added[0].name, "dhcp4");
        assert_eq!(m.removed[0].name, "d2");
    }

    #[tokio::test]
    async fn test_new_app_discovery() {
        let (reconciler, fake) = reconciler(healthy(100, "1.8.0"));
        let result = reconciler.reconcile(&new_app()).await;

        assert_eq!(fake.call_count(), 2);
        assert!(result.reachable);
        assert!(result.daemons_replaced);
        assert!(result.events.is_empty());
        assert!(result.app.active);
        assert_eq!(result.app.version, "1.8.0");

        let names: Vec<_> = result.app.daemons.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["ca", "dhcp4"]);
        let dhcp4 = result.app.daemon("dhcp4").unwrap();
        assert_eq!(dhcp4.uptime, 100);
        assert!(dhcp4.config.is_some());
        assert!(dhcp4.config_hash.is_some());
        assert!(dhcp4.reloaded_at.is_some());
    }

    #[tokio::test]
    async fn test_new_app_failing_daemon_is_not_monitored() {
        let fake = FakeForwarder::new(|_, _, call_no| {
            if call_no == 0 {
                return Ok(vec![Ok(vec![ok("1.8.0")]), Ok(vec![ca_config()])]);
            }
            let down = json!({ "result": 1, "text": "unable to forward command" }).to_string();
            Ok(vec![Ok(vec![down.clone()]), Ok(vec![down.clone()]), Ok(vec![down])])
        });
        let (reconciler, _) = reconciler(fake);
        let result = reconciler.reconcile(&new_app()).await;

        let dhcp4 = result.app.daemon("dhcp4").unwrap();
        assert!(!dhcp4.active);
        assert!(!dhcp4.monitored);
        assert!(result.app.daemon("ca").unwrap().monitored);
        assert!(!result.app.active);
        assert!(result.errors["dhcp4"].contains("unable to forward command"));
    }

    #[tokio::test]
    async fn test_restart_raises_single_event() {
        let (reconciler, _) = reconciler(healthy(10, "1.8.0"));
        let result = reconciler.reconcile(&stored_app()).await;

        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].text, "{daemon} has been restarted");
        assert_eq!(result.events[0].daemon.as_deref(), Some("dhcp4"));
        assert_eq!(result.events[0].daemon_id, Some(2));
        assert!(result.app.active);
    }

    #[tokio::test]
    async fn test_out_of_range_reload_degrades_daemon() {
        for reload in [10_000_000_000_000, i64::MAX] {
            let fake = FakeForwarder::new(move |_, _, call_no| {
                if call_no == 0 {
                    return Ok(vec![Ok(vec![ok("1.8.0")]), Ok(vec![ca_config()])]);
                }
                Ok(vec![
                    Ok(vec![ok("1.8.0")]),
                    Ok(vec![status(5, reload)]),
                    Ok(vec![dhcp4_config()]),
                ])
            });
            let (reconciler, _) = reconciler(fake);
            let result = reconciler.reconcile(&stored_app()).await;

            let dhcp4 = result.app.daemon("dhcp4").unwrap();
            assert!(!dhcp4.active);
            assert!(result.errors["dhcp4"].contains("invalid reload time"));
            assert!(result.app.daemon("ca").unwrap().active);
            assert!(!result.app.active);
        }
    }

    #[tokio::test]
    async fn test_version_change_event() {
        let (reconciler, _) = reconciler(healthy(600, "1.9.0"));
        let result = reconciler.reconcile(&stored_app()).await;

        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].text, "{daemon} version changed from 1.8.0 to 1.9.0");
    }

    #[tokio::test]
    async fn test_control_agent_unreachable() {
        let fake = FakeForwarder::new(|app, _, _| {
            Err(TransportError::Unreachable { app: app.label(), reason: "connection refused".to_string() })
        });
        let (reconciler, fake) = reconciler(fake);
        let app = stored_app();
        let result = reconciler.reconcile(&app).await;

        assert_eq!(fake.call_count(), 1);
        assert!(!result.reachable);
        assert!(!result.daemons_replaced);
        assert!(!result.app.active);
        assert_eq!(result.app.daemons.len(), app.daemons.len());
        assert!(result.app.daemons.iter().all(|d| !d.active));

        let texts: Vec<_> = result.events.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["{daemon} is unreachable", "{daemon} is unreachable", "{app} is unreachable"]);
        assert!(result.events[2].details.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_control_agent_error_result_aborts_phase_b() {
        let fake = FakeForwarder::new(|_, _, _| {
            let err = json!({ "result": 1, "text": "internal error" }).to_string();
            Ok(vec![Ok(vec![err]), Ok(vec![ca_config()])])
        });
        let (reconciler, fake) = reconciler(fake);
        let mut app = stored_app();
        app.active = false;
        let result = reconciler.reconcile(&app).await;

        assert_eq!(fake.call_count(), 1);
        assert!(!result.daemons_replaced);
        assert!(result.errors["ca"].contains("internal error"));
        // App was already inactive: no app level event.
        assert!(result.events.iter().all(|e| e.text != "{app} is unreachable"));
    }

    #[tokio::test]
    async fn test_failing_command_type_degrades_only_its_daemons() {
        let fake = FakeForwarder::new(|app, _, call_no| {
            if call_no == 0 {
                return Ok(vec![Ok(vec![ok("1.8.0")]), Ok(vec![ca_config()])]);
            }
            Ok(vec![
                Ok(vec![ok("1.8.0")]),
                Err(TransportError::Unreachable { app: app.label(), reason: "reset".to_string() }),
                Ok(vec![dhcp4_config()]),
            ])
        });
        let (reconciler, _) = reconciler(fake);
        let result = reconciler.reconcile(&stored_app()).await;

        let dhcp4 = result.app.daemon("dhcp4").unwrap();
        assert!(!dhcp4.active);
        // Data from the other command types was still taken.
        assert!(dhcp4.config.is_some());
        assert_eq!(dhcp4.uptime, 500);
        assert!(result.app.daemon("ca").unwrap().active);
        assert!(!result.app.active);
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].level, EventLevel::Error);
        assert!(result.events[0].details.contains("status-get"));
    }

    #[tokio::test]
    async fn test_daemon_reachable_again() {
        let (reconciler, _) = reconciler(healthy(600, "1.8.0"));
        let mut app = stored_app();
        app.daemons[1].active = false;
        app.active = false;
        let result = reconciler.reconcile(&app).await;

        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].level, EventLevel::Info);
        assert_eq!(result.events[0].text, "{daemon} is reachable now");
        assert!(result.app.active);
    }

    #[tokio::test]
    async fn test_unrecognized_daemon_is_ignored() {
        let fake = FakeForwarder::new(|_, _, call_no| {
            if call_no == 0 {
                return Ok(vec![Ok(vec![ok("1.8.0")]), Ok(vec![ca_config()])]);
            }
            // Two answers to a single addressed daemon: the second is attributed to nobody.
            Ok(vec![
                Ok(vec![ok("1.8.0"), ok("9.9.9")]),
                Ok(vec![status(600, 1)]),
                Ok(vec![dhcp4_config()]),
            ])
        });
        let (reconciler, _) = reconciler(fake);
        let result = reconciler.reconcile(&stored_app()).await;

        assert!(result.app.active);
        assert_eq!(result.app.daemon("dhcp4").unwrap().version, "1.8.0");
    }

    #[tokio::test]
    async fn test_vanished_daemon_is_kept_inactive() {
        let (reconciler, _) = reconciler(healthy(600, "1.8.0"));
        let mut app = stored_app();
        app.daemons.push(daemon(3, "d2", true, 50, "1.8.0"));
        let result = reconciler.reconcile(&app).await;

        let d2 = result.app.daemon("d2").unwrap();
        assert!(!d2.active);
        assert_eq!(d2.id, Some(3));
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].daemon.as_deref(), Some("d2"));
    }

    #[tokio::test]
    async fn test_timeout_is_transport_error() {
        struct Stalled;
        #[async_trait::async_trait]
        impl CommandForwarder for Stalled {
            async fn forward(&self, _: &App, _: &[Command]) -> Result<crate::kea::commands::ForwardResult, TransportError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Default::default())
            }
        }

        let reconciler = Reconciler::new(Arc::new(Stalled), Duration::from_millis(20));
        let result = reconciler.reconcile(&stored_app()).await;
        assert!(!result.reachable);
        assert!(result.errors["ca"].contains("no response within"));
    }
}
