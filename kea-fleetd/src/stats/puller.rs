//! Periodic collection of lease statistics and packet counters.

use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use serde_json::json;
use shared::protocol::{
    CMD_STATISTIC_GET, CMD_STAT_LEASE4_GET, CMD_STAT_LEASE6_GET, DAEMON_DHCP4, DAEMON_DHCP6,
    HOOK_STAT_CMDS, RESULT_EMPTY, RPS_COUNTER_DHCP4, RPS_COUNTER_DHCP6,
};
use shared::types::{App, Daemon};
use crate::kea::commands::{forward_within, Command, CommandForwarder, CommandResponse, TransportError};
use crate::store_manager::StoreHandle;
use super::lease::{decode_rows, StatLeaseArgs};
use super::rps::{decode_statistic, RpsWorker};
use super::{DaemonRps, LocalSubnetStats, PullError, StatsBatch, StatsError};

/// What a command of the batch was asked for.
enum Request {
    Leases { daemon_id: i64, daemon: String },
    Packets { daemon_id: i64, daemon: String, counter: &'static str },
}

impl Request {
    fn daemon(&self) -> &str {
        match self {
            Request::Leases { daemon, .. } | Request::Packets { daemon, .. } => daemon,
        }
    }
}

pub struct StatsPuller {
    store: StoreHandle,
    forwarder: Arc<dyn CommandForwarder>,
    timeout: Duration,
    rps: RpsWorker,
}

impl StatsPuller {
    /// Resumes rate tracking from the readings the store kept.
    pub async fn new(store: StoreHandle, forwarder: Arc<dyn CommandForwarder>, timeout: Duration) -> anyhow::Result<Self> {
        let samples = store.get_rps_samples().await?;
        Ok(Self {
            store,
            forwarder,
            timeout,
            rps: RpsWorker::with_samples(samples),
        })
    }

    /// Pulls counters from every stored app, then stores them and refreshes
    /// utilization and fleet-wide totals. Problems with single apps or
    /// daemons don't stop the pull; they are all reported at the end.
    pub async fn pull_stats(&self) -> Result<(), PullError> {
        let apps = self
            .store
            .get_all_apps()
            .await
            .map_err(|e| PullError(vec![StatsError::Store(e)]))?;

        let mut batch = StatsBatch::new(Utc::now());
        let mut errors = Vec::new();
        for app in &apps {
            self.pull_app(app, &mut batch, &mut errors).await;
        }

        tracing::debug!(
            "Pulled {} lease rows and {} packet counters from {} apps",
            batch.lease_rows.len(),
            batch.rps.len(),
            apps.len()
        );

        if let Err(e) = self.store.apply_stats(batch).await {
            errors.push(StatsError::Store(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(PullError(errors))
        }
    }

    async fn pull_app(&self, app: &App, batch: &mut StatsBatch, errors: &mut Vec<StatsError>) {
        let mut cmds = Vec::new();
        let mut requests = Vec::new();
        for daemon in &app.daemons {
            let Some((lease_cmd, counter)) = stat_commands(daemon) else { continue };
            let Some(daemon_id) = daemon.id else { continue };

            cmds.push(Command::new(lease_cmd, &[daemon.name.as_str()]));
            requests.push(Request::Leases { daemon_id, daemon: daemon.name.clone() });
            cmds.push(Command::new(CMD_STATISTIC_GET, &[daemon.name.as_str()]).with_arguments(json!({ "name": counter })));
            requests.push(Request::Packets { daemon_id, daemon: daemon.name.clone(), counter });
        }

        if cmds.is_empty() {
            return;
        }

        let mut result = match forward_within(self.forwarder.as_ref(), app, &cmds, self.timeout).await {
            Ok(result) => result,
            Err(source) => {
                errors.push(StatsError::Transport { app: app.label(), source });
                return;
            }
        };

        for (idx, (cmd, request)) in cmds.iter().zip(&requests).enumerate() {
            if let Err(e) = self.handle(app, cmd, request, result.take(idx), batch) {
                tracing::warn!("{}", e);
                errors.push(e);
            }
        }
    }

    fn handle(
        &self,
        app: &App,
        cmd: &Command,
        request: &Request,
        outcome: Result<Vec<CommandResponse>, TransportError>,
        batch: &mut StatsBatch,
    ) -> Result<(), StatsError> {
        let data_error = |reason: String| StatsError::Data {
            app: app.label(),
            daemon: request.daemon().to_string(),
            command: cmd.command.clone(),
            reason,
        };

        let responses = outcome.map_err(|source| StatsError::Transport { app: app.label(), source })?;
        let rsp = responses
            .into_iter()
            .find(|r| r.daemon == request.daemon())
            .ok_or_else(|| data_error("no response".to_string()))?;

        if rsp.result == RESULT_EMPTY {
            return Ok(());
        }
        if !rsp.is_success() {
            return Err(StatsError::Command {
                app: app.label(),
                daemon: rsp.daemon.clone(),
                command: cmd.command.clone(),
                result: rsp.result,
                text: rsp.text.clone(),
            });
        }

        match request {
            Request::Leases { daemon_id, .. } => {
                let args: Option<StatLeaseArgs> = rsp.decode_arguments().map_err(|e| data_error(e.to_string()))?;
                let Some(result_set) = args.and_then(|a| a.result_set) else {
                    return Ok(());
                };
                for row in decode_rows(&result_set).map_err(data_error)? {
                    batch.lease_rows.push(LocalSubnetStats {
                        daemon_id: *daemon_id,
                        local_subnet_id: row.local_subnet_id,
                        counters: row.counters,
                    });
                }
            }
            Request::Packets { daemon_id, counter, .. } => {
                let Some(arguments) = &rsp.arguments else {
                    return Ok(());
                };
                let stats = decode_statistic(arguments).map_err(data_error)?;
                if let Some(sample) = stats.latest(counter).map_err(data_error)? {
                    let interval = self.rps.observe(*daemon_id, sample);
                    batch.rps.push(DaemonRps { daemon_id: *daemon_id, sample, interval });
                }
            }
        }
        Ok(())
    }
}

/// Lease statistics command and packet counter of a daemon, if it has the
/// statistics hook loaded.
fn stat_commands(daemon: &Daemon) -> Option<(&'static str, &'static str)> {
    let commands = match daemon.name.as_str() {
        DAEMON_DHCP4 => (CMD_STAT_LEASE4_GET, RPS_COUNTER_DHCP4),
        DAEMON_DHCP6 => (CMD_STAT_LEASE6_GET, RPS_COUNTER_DHCP6),
        _ => return None,
    };
    daemon
        .config
        .as_ref()
        .is_some_and(|c| c.has_hook(HOOK_STAT_CMDS))
        .then_some(commands)
}
