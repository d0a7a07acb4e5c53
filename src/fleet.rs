//! # Fleet — Client Registry and Supervisor
//!
//! Maps client name to [`ClientSession`] under a `tokio::sync::RwLock`:
//! lookups and enumeration share the lock, add/remove/clear take it
//! exclusively. [`Fleet::clear`] drains the map and releases the lock before
//! closing anything, so no session teardown ever runs under the write lock.
//!
//! [`Fleet::run`] is the supervisor: on every tick it reconnects offline
//! sessions and retrieves connected ones, all clients in parallel.

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::ClientSettings;
use crate::session::{ClientSession, SessionOptions, SessionServices};
use crate::slot::ClientData;

pub struct Fleet {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    options: SessionOptions,
    services: SessionServices,
}

impl Fleet {
    pub fn new(options: SessionOptions, services: SessionServices) -> Self {
        Fleet {
            sessions: RwLock::new(HashMap::new()),
            options,
            services,
        }
    }

    pub fn services(&self) -> &SessionServices {
        &self.services
    }

    /// Register a client. The session starts offline; the supervisor
    /// connects it on its next tick.
    pub async fn add(&self, settings: ClientSettings) -> Result<Arc<ClientSession>> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&settings.name) {
            anyhow::bail!("client '{}' is already registered", settings.name);
        }
        let name = settings.name.clone();
        let session = Arc::new(ClientSession::new(
            settings,
            self.options.clone(),
            self.services.clone(),
        ));
        sessions.insert(name, Arc::clone(&session));
        Ok(session)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().await.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn all(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Unregister and close one client, keeping its benchmarks.
    async fn detach(&self, name: &str) -> Option<Arc<ClientSession>> {
        let removed = self.sessions.write().await.remove(name);
        if let Some(session) = &removed {
            session.close().await;
        }
        removed
    }

    fn forget_benchmarks(&self, settings: &ClientSettings) {
        let dropped = self
            .services
            .benchmarks
            .remove_client(&settings.name, &settings.client_path());
        if dropped > 0 {
            debug!(client = %settings.name, benchmarks = dropped, "Dropped client benchmarks");
        }
    }

    /// Remove and close one client, dropping its slot benchmarks.
    pub async fn remove(&self, name: &str) -> Option<Arc<ClientSession>> {
        let removed = self.detach(name).await;
        if let Some(session) = &removed {
            self.forget_benchmarks(session.settings());
        }
        removed
    }

    /// Replace a client's settings. The old session is closed and a new one
    /// takes its place under the (possibly new) name. Benchmarks survive
    /// unless the client's name or address changed.
    pub async fn edit(&self, old_name: &str, settings: ClientSettings) -> Result<Arc<ClientSession>> {
        if old_name != settings.name && self.get(&settings.name).await.is_some() {
            anyhow::bail!("client '{}' is already registered", settings.name);
        }
        if let Some(old) = self.detach(old_name).await {
            let old = old.settings();
            if old.name != settings.name || old.client_path() != settings.client_path() {
                self.forget_benchmarks(old);
            }
        }
        self.add(settings).await
    }

    /// Remove every client, closing each after the registry lock is released.
    pub async fn clear(&self) {
        let drained: Vec<Arc<ClientSession>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            session.close().await;
        }
    }

    /// Every slot of every client, sorted by slot name.
    pub async fn slots(&self) -> Vec<ClientData> {
        let mut slots: Vec<ClientData> = self
            .all()
            .await
            .iter()
            .flat_map(|s| s.slots())
            .collect();
        slots.sort_by(|a, b| a.slot.cmp(&b.slot));
        slots
    }

    /// Connect offline clients and retrieve connected ones.
    pub async fn tick(&self) {
        let mut tasks = JoinSet::new();
        for session in self.all().await {
            tasks.spawn(async move {
                if session.is_connected() {
                    session.retrieve().await;
                } else if let Err(e) = session.connect().await {
                    warn!(client = %session.name(), error = %e, "Connect failed");
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Client task panicked");
            }
        }
    }

    /// Supervise until `shutdown` flips to true, then close every client.
    pub async fn run(
        &self,
        interval: Duration,
        metrics_file: Option<PathBuf>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let clients = self.len().await;
        info!(clients, interval_secs = interval.as_secs(), "Supervisor started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                    if let Some(path) = &metrics_file {
                        if let Err(e) = self.services.metrics.write_textfile(path) {
                            warn!(path = %path.display(), error = %e, "Failed to write metrics");
                        }
                    }
                    debug!("Supervisor tick finished");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Supervisor stopping");
        self.clear().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchmark::BenchmarkRepository;
    use crate::prom_metrics::Metrics;
    use crate::protein::{CachingProteinService, NullProjectDetailsService};
    use crate::repository::MemoryWorkUnitRepository;
    use crate::slot::{SlotIdentifier, SlotStatus};

    fn fleet() -> Fleet {
        let services = SessionServices {
            proteins: Arc::new(CachingProteinService::new(None)),
            project_details: Arc::new(NullProjectDetailsService),
            benchmarks: Arc::new(BenchmarkRepository::new()),
            repository: Arc::new(MemoryWorkUnitRepository::new()),
            metrics: Arc::new(Metrics::new()),
        };
        Fleet::new(SessionOptions::default(), services)
    }

    #[tokio::test]
    async fn add_get_remove() {
        let fleet = fleet();
        fleet.add(ClientSettings::new("rig", "127.0.0.1", 1)).await.unwrap();
        fleet.add(ClientSettings::new("box", "127.0.0.1", 2)).await.unwrap();
        assert_eq!(fleet.names().await, vec!["box", "rig"]);
        assert!(fleet.add(ClientSettings::new("rig", "10.0.0.1", 3)).await.is_err());

        assert!(fleet.remove("rig").await.is_some());
        assert!(fleet.get("rig").await.is_none());
        assert_eq!(fleet.len().await, 1);
    }

    #[tokio::test]
    async fn offline_sessions_report_placeholder_slot() {
        let fleet = fleet();
        fleet.add(ClientSettings::new("rig", "127.0.0.1", 1)).await.unwrap();
        let slots = fleet.slots().await;
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].status, SlotStatus::Offline);
        assert!(!slots[0].slot.has_slot());
    }

    #[tokio::test]
    async fn clear_empties_registry() {
        let fleet = fleet();
        fleet.add(ClientSettings::new("rig", "127.0.0.1", 1)).await.unwrap();
        fleet.add(ClientSettings::new("box", "127.0.0.1", 2)).await.unwrap();
        fleet.clear().await;
        assert!(fleet.is_empty().await);
        // The lock is free again.
        fleet.add(ClientSettings::new("rig", "127.0.0.1", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn edit_replaces_session() {
        let fleet = fleet();
        fleet.add(ClientSettings::new("rig", "127.0.0.1", 1)).await.unwrap();
        let edited = fleet
            .edit("rig", ClientSettings::new("rig2", "127.0.0.1", 5))
            .await
            .unwrap();
        assert_eq!(edited.settings().port, 5);
        assert_eq!(fleet.names().await, vec!["rig2"]);
    }

    #[tokio::test]
    async fn remove_drops_client_benchmarks() {
        let fleet = fleet();
        let benchmarks = Arc::clone(&fleet.services().benchmarks);
        let rig = ClientSettings::new("rig", "127.0.0.1", 1);
        let rig_path = rig.client_path();
        let box_settings = ClientSettings::new("box", "127.0.0.1", 2);
        let box_path = box_settings.client_path();
        fleet.add(rig).await.unwrap();
        fleet.add(box_settings).await.unwrap();
        benchmarks.update(&SlotIdentifier::new("rig", &rig_path, 0), 2669, [Duration::from_secs(60)]);
        benchmarks.update(&SlotIdentifier::new("box", &box_path, 0), 2669, [Duration::from_secs(60)]);

        fleet.remove("rig").await.unwrap();
        assert!(!benchmarks.contains(&SlotIdentifier::new("rig", &rig_path, 0)));
        assert!(benchmarks.contains(&SlotIdentifier::new("box", &box_path, 0)));
    }

    #[tokio::test]
    async fn edit_keeps_benchmarks_unless_identity_changes() {
        let fleet = fleet();
        let benchmarks = Arc::clone(&fleet.services().benchmarks);
        let rig = ClientSettings::new("rig", "127.0.0.1", 1);
        let slot = SlotIdentifier::new("rig", rig.client_path(), 0);
        fleet.add(rig).await.unwrap();
        benchmarks.update(&slot, 2669, [Duration::from_secs(60)]);

        let mut with_password = ClientSettings::new("rig", "127.0.0.1", 1);
        with_password.password = "secret".into();
        fleet.edit("rig", with_password).await.unwrap();
        assert!(benchmarks.contains(&slot));

        fleet
            .edit("rig", ClientSettings::new("rig", "127.0.0.1", 9))
            .await
            .unwrap();
        assert!(benchmarks.is_empty());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let fleet = Arc::new(fleet());
        let (tx, rx) = watch::channel(false);
        let runner = {
            let fleet = Arc::clone(&fleet);
            tokio::spawn(async move { fleet.run(Duration::from_secs(3600), None, rx).await })
        };
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
    }
}
