use std::collections::BTreeMap;
use std::thread;
use anyhow::Result;
use num_bigint::BigUint;
use tokio::sync::{mpsc, oneshot, watch};
use shared::types::{App, Event, HaService, Subnet};
use crate::stats::rps::RpsSample;
use crate::stats::StatsBatch;
use crate::store::db::{DaemonRate, Store};
use crate::store::{commit, hash, stats};

/// Commands sent to the store thread
pub enum StoreCommand {
    FindApp {
        address: String,
        port: u16,
        reply: oneshot::Sender<Result<Option<App>>>,
    },
    GetApp(i64, oneshot::Sender<Result<Option<App>>>),
    GetAllApps(oneshot::Sender<Result<Vec<App>>>),
    CommitApp {
        app: Box<App>,
        events: Vec<Event>,
        reply: oneshot::Sender<Result<App>>,
    },
    ApplyStats(Box<StatsBatch>, oneshot::Sender<Result<()>>),
    GetSubnets(oneshot::Sender<Result<Vec<Subnet>>>),
    GetGlobalStats(oneshot::Sender<Result<BTreeMap<String, BigUint>>>),
    GetDaemonRates(oneshot::Sender<Result<Vec<DaemonRate>>>),
    GetRpsSamples(oneshot::Sender<Result<Vec<(i64, RpsSample)>>>),
    GetEvents(usize, oneshot::Sender<Result<Vec<Event>>>),
    GetHaServices(oneshot::Sender<Result<Vec<HaService>>>),
    Shutdown,
}

/// Handle to the store thread. All reads and writes are serialized there.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn the store thread. Committed events go to `events_tx`, the
    /// fleet hash is republished after every commit.
    pub fn spawn(mut store: Store, hash_tx: watch::Sender<String>, events_tx: flume::Sender<Event>) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        let recompute_hash = |store: &Store, hash_tx: &watch::Sender<String>| {
            if let Ok(apps) = store.get_all_apps() {
                hash_tx.send_replace(hash::fleet_hash(&apps));
            }
        };

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::FindApp { address, port, reply } => {
                        let _ = reply.send(store.find_app(&address, port));
                    }
                    StoreCommand::GetApp(id, reply) => {
                        let _ = reply.send(store.get_app(id));
                    }
                    StoreCommand::GetAllApps(reply) => {
                        let _ = reply.send(store.get_all_apps());
                    }
                    StoreCommand::CommitApp { app, events, reply } => {
                        let result = commit::commit_app(store.conn_mut(), &app, events);
                        let result = match result {
                            Ok(outcome) => {
                                // Only committed events leave the store.
                                for event in outcome.events {
                                    let _ = events_tx.send(event);
                                }
                                recompute_hash(&store, &hash_tx);
                                Ok(outcome.app)
                            }
                            Err(e) => Err(e),
                        };
                        let _ = reply.send(result);
                    }
                    StoreCommand::ApplyStats(batch, reply) => {
                        let _ = reply.send(stats::apply_stats(store.conn_mut(), &batch));
                    }
                    StoreCommand::GetSubnets(reply) => {
                        let _ = reply.send(store.get_subnets());
                    }
                    StoreCommand::GetGlobalStats(reply) => {
                        let _ = reply.send(store.get_global_stats());
                    }
                    StoreCommand::GetDaemonRates(reply) => {
                        let _ = reply.send(store.get_daemon_rates());
                    }
                    StoreCommand::GetRpsSamples(reply) => {
                        let _ = reply.send(store.get_rps_samples());
                    }
                    StoreCommand::GetEvents(limit, reply) => {
                        let _ = reply.send(store.get_events(limit));
                    }
                    StoreCommand::GetHaServices(reply) => {
                        let _ = reply.send(store.get_ha_services());
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Look up an app by its control endpoint
    pub async fn find_app(&self, address: String, port: u16) -> Result<Option<App>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::FindApp { address, port, reply }).await?;
        rx.await?
    }

    pub async fn get_app(&self, id: i64) -> Result<Option<App>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetApp(id, reply)).await?;
        rx.await?
    }

    pub async fn get_all_apps(&self) -> Result<Vec<App>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetAllApps(reply)).await?;
        rx.await?
    }

    /// Persist a reconciled app with its change events. Returns the app as
    /// stored, ids filled in.
    pub async fn commit_app(&self, app: App, events: Vec<Event>) -> Result<App> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StoreCommand::CommitApp { app: Box::new(app), events, reply })
            .await?;
        rx.await?
    }

    pub async fn apply_stats(&self, batch: StatsBatch) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::ApplyStats(Box::new(batch), reply)).await?;
        rx.await?
    }

    pub async fn get_subnets(&self) -> Result<Vec<Subnet>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetSubnets(reply)).await?;
        rx.await?
    }

    pub async fn get_global_stats(&self) -> Result<BTreeMap<String, BigUint>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetGlobalStats(reply)).await?;
        rx.await?
    }

    pub async fn get_daemon_rates(&self) -> Result<Vec<DaemonRate>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetDaemonRates(reply)).await?;
        rx.await?
    }

    pub async fn get_rps_samples(&self) -> Result<Vec<(i64, RpsSample)>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetRpsSamples(reply)).await?;
        rx.await?
    }

    /// Most recent events first
    pub async fn get_events(&self, limit: usize) -> Result<Vec<Event>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetEvents(limit, reply)).await?;
        rx.await?
    }

    pub async fn get_ha_services(&self) -> Result<Vec<HaService>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetHaServices(reply)).await?;
        rx.await?
    }

    /// Shutdown the store thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(StoreCommand::Shutdown).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::{AccessPoint, AccessPointKind, Daemon, EventLevel, Machine};

    fn test_app() -> App {
        let mut app = App::new(
            Machine { id: None, address: "host-a".to_string(), agent_port: 8080 },
            AccessPoint {
                kind: AccessPointKind::Control,
                address: "192.0.2.1".to_string(),
                port: 8000,
                use_secure_protocol: false,
                key: None,
            },
        );
        app.daemons = vec![Daemon::new("ca", true)];
        app
    }

    #[tokio::test]
    async fn test_commit_publishes_events_and_hash() {
        let (hash_tx, mut hash_rx) = watch::channel(String::new());
        let (events_tx, events_rx) = flume::unbounded();
        let store = StoreHandle::spawn(Store::open(":memory:").unwrap(), hash_tx, events_tx);

        let app = store.commit_app(test_app(), vec![]).await.unwrap();
        assert!(app.id.is_some());
        assert!(hash_rx.has_changed().unwrap());
        let first_hash = hash_rx.borrow_and_update().clone();
        assert_eq!(first_hash.len(), 64);

        let events: Vec<Event> = events_rx.drain().collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].render(), "added app kea@192.0.2.1:8000 on machine host-a");

        let found = store.find_app("192.0.2.1".to_string(), 8000).await.unwrap().unwrap();
        assert_eq!(found.id, app.id);
        assert!(store.find_app("192.0.2.1".to_string(), 8001).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_commit_emits_nothing() {
        let (hash_tx, hash_rx) = watch::channel(String::new());
        let (events_tx, events_rx) = flume::unbounded();
        let store = StoreHandle::spawn(Store::open(":memory:").unwrap(), hash_tx, events_tx);

        // Without a control access point the app can't be keyed.
        let mut app = test_app();
        app.access_points.clear();
        let event = Event::new(EventLevel::Error, "{app} is unreachable").with_app(&app);
        assert!(store.commit_app(app, vec![event]).await.is_err());

        assert!(events_rx.is_empty());
        assert!(store.get_all_apps().await.unwrap().is_empty());
        assert!(store.get_events(10).await.unwrap().is_empty());
        assert_eq!(*hash_rx.borrow(), "");
    }
}
