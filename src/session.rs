//! # Session — One Monitored FAH Client
//!
//! A [`ClientSession`] owns the socket to one client and everything derived
//! from it. Lifecycle:
//!
//! ```text
//! connect ─▶ auth ─▶ subscribe ─▶ read loop ─▶ store ─▶ message actions
//!                                                        │
//!                                     retrieve ◀─────────┘ (also on the fleet timer)
//!                                        │
//!                  build work units ─▶ models ─▶ benchmarks, history, counts
//! ```
//!
//! ## Message Actions
//!
//! Run in order after a message changed the store:
//!
//! | Message | Action |
//! |---------|--------|
//! | `slots` | rebuild per-slot [`ClientData`] |
//! | `info` | refresh client platform |
//! | `units`, `log-restart` | retrieve, once the store is ready |
//!
//! ## Closing
//!
//! [`ClientSession::close`] may run while a read or retrieve is in flight.
//! The read task is cancelled through a `watch` channel; a retrieve that
//! finds the session closed stops without reporting anything. Each connect
//! starts a new generation so a read task left over from an old socket can
//! never close a newer one.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::benchmark::BenchmarkRepository;
use crate::config::{ClientSettings, MonitorConfig};
use crate::connection::{is_closed_error, Connection, MessageReader};
use crate::log::LogLine;
use crate::message::{Message, MessageType};
use crate::production::{self, BonusCalculation, PpdCalculation};
use crate::prom_metrics::Metrics;
use crate::protein::{ProjectDetailsService, Protein, ProteinService};
use crate::repository::WorkUnitRepository;
use crate::runs::ClientRun;
use crate::slot::{ClientData, SlotDescription, SlotIdentifier, SlotStatus, UnitCounts};
use crate::store::MessageStore;
use crate::work_unit::{WorkUnit, WorkUnitCollectionBuilder};
use crate::work_unit_model::WorkUnitModel;
use crate::{lock_or_recover, read_or_recover, write_or_recover};

/// Tuning shared by every session, taken from the monitor config.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub heartbeat_interval: Duration,
    pub heartbeat_overdue_factor: u32,
    pub max_log_gap: usize,
    pub ppd_calculation: PpdCalculation,
    pub bonus_calculation: BonusCalculation,
    pub decimal_places: u32,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions::from_config(&MonitorConfig::default())
    }
}

impl SessionOptions {
    pub fn from_config(config: &MonitorConfig) -> Self {
        SessionOptions {
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_overdue_factor: config.heartbeat_overdue_factor,
            max_log_gap: config.max_log_gap,
            ppd_calculation: config.ppd_calculation,
            bonus_calculation: config.bonus_calculation,
            decimal_places: config.decimal_places,
        }
    }
}

/// Collaborators shared across sessions.
#[derive(Clone)]
pub struct SessionServices {
    pub proteins: Arc<dyn ProteinService>,
    pub project_details: Arc<dyn ProjectDetailsService>,
    pub benchmarks: Arc<BenchmarkRepository>,
    pub repository: Arc<dyn WorkUnitRepository>,
    pub metrics: Arc<Metrics>,
}

/// What the client reports about the machine it runs on.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientPlatform {
    pub client_version: Option<String>,
    pub operating_system: Option<String>,
    pub cpu: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageAction {
    RefreshSlots,
    RefreshPlatform,
    Retrieve,
}

fn actions_for(message_type: MessageType) -> &'static [MessageAction] {
    match message_type {
        MessageType::SlotInfo => &[MessageAction::RefreshSlots],
        MessageType::Info => &[MessageAction::RefreshPlatform],
        MessageType::UnitCollection | MessageType::LogRestart => &[MessageAction::Retrieve],
        MessageType::Heartbeat | MessageType::Options | MessageType::LogUpdate => &[],
    }
}

/// Log lines shown for a slot: the current unit's, else the slot's latest
/// run, else the whole client run.
fn slot_log_lines(
    model: Option<&WorkUnitModel>,
    run: Option<&ClientRun>,
    slot_id: u32,
    lines: &[LogLine],
) -> Vec<LogLine> {
    if let Some(unit_lines) = model.map(|m| &m.work_unit.log_lines).filter(|l| !l.is_empty()) {
        return unit_lines.clone();
    }
    let Some(run) = run else {
        return Vec::new();
    };
    match run.latest_slot_run(slot_id) {
        Some(slot_run) => slot_run.lines(lines).cloned().collect(),
        None => run.lines(lines).to_vec(),
    }
}

/// Commands sent right after connecting, in order.
pub fn subscription_commands(heartbeat_interval: Duration) -> Vec<String> {
    vec![
        "updates clear".to_string(),
        "log-updates restart".to_string(),
        format!("updates add 0 {} $heartbeat", heartbeat_interval.as_secs().max(1)),
        "updates add 1 1 $info".to_string(),
        "updates add 2 1 $(options -a)".to_string(),
        "updates add 3 1 $slot-info".to_string(),
        "queue-info".to_string(),
    ]
}

fn slot_command(verb: &str, slot_id: Option<i32>) -> String {
    match slot_id {
        Some(id) => format!("{} {}", verb, id),
        None => verb.to_string(),
    }
}

/// Resets the retrieve flag when a retrieve ends, however it ends.
struct RetrieveGuard<'a>(&'a AtomicBool);

impl Drop for RetrieveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ClientSession {
    settings: ClientSettings,
    options: SessionOptions,
    services: SessionServices,
    connection: Mutex<Option<Arc<Connection>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    generation: AtomicU64,
    store: Mutex<MessageStore>,
    slots: RwLock<Vec<ClientData>>,
    previous_units: Mutex<HashMap<i32, Vec<WorkUnit>>>,
    platform: RwLock<ClientPlatform>,
    retrieving: AtomicBool,
}

impl ClientSession {
    pub fn new(settings: ClientSettings, options: SessionOptions, services: SessionServices) -> Self {
        let offline = ClientData::offline(&settings.name, &settings.client_path());
        ClientSession {
            store: Mutex::new(MessageStore::new(options.max_log_gap)),
            settings,
            options,
            services,
            connection: Mutex::new(None),
            shutdown: Mutex::new(None),
            generation: AtomicU64::new(0),
            slots: RwLock::new(vec![offline]),
            previous_units: Mutex::new(HashMap::new()),
            platform: RwLock::new(ClientPlatform::default()),
            retrieving: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    /// Live socket state only.
    pub fn is_connected(&self) -> bool {
        lock_or_recover(&self.connection)
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    pub fn slots(&self) -> Vec<ClientData> {
        read_or_recover(&self.slots).clone()
    }

    pub fn platform(&self) -> ClientPlatform {
        read_or_recover(&self.platform).clone()
    }

    /// Open the socket, authenticate, subscribe, and start the read task.
    pub async fn connect(self: &Arc<Self>) -> anyhow::Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        // A socket that died without its read task noticing yet.
        self.close().await;
        let (connection, reader) =
            Connection::open(&self.settings.server, self.settings.port).await?;
        let connection = Arc::new(connection);

        if !self.settings.password.is_empty() {
            connection
                .send_command(&format!("auth {}", self.settings.password))
                .await?;
        }
        for command in subscription_commands(self.options.heartbeat_interval) {
            connection.send_command(&command).await?;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = watch::channel(false);
        lock_or_recover(&self.store).clear();
        *lock_or_recover(&self.connection) = Some(connection);
        *lock_or_recover(&self.shutdown) = Some(tx);
        self.services.metrics.clients_connected.inc();
        info!(client = %self.settings.name, path = %self.settings.client_path(), "Connected");

        let session = Arc::clone(self);
        tokio::spawn(async move { session.read_loop(reader, rx, generation).await });
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: MessageReader,
        mut shutdown: watch::Receiver<bool>,
        generation: u64,
    ) {
        loop {
            let next = tokio::select! {
                _ = shutdown.changed() => {
                    debug!(client = %self.settings.name, "Read loop cancelled");
                    return;
                }
                next = reader.next_message() => next,
            };
            match next {
                Ok(message) => self.handle_message(message).await,
                Err(e) if is_closed_error(&e) || *shutdown.borrow() => {
                    debug!(client = %self.settings.name, error = %e, "Connection closed");
                    break;
                }
                Err(e) => {
                    error!(client = %self.settings.name, error = %e, "Read failed");
                    break;
                }
            }
        }
        self.close_generation(generation).await;
    }

    async fn handle_message(self: &Arc<Self>, message: Message) {
        let message_type = message.message_type();
        let (changed, resync, ready) = {
            let mut store = lock_or_recover(&self.store);
            let changed = store.update_message(&message);
            (changed, store.take_resync_request(), store.is_ready())
        };
        if resync {
            self.send("log-updates restart").await;
        }
        if !changed {
            return;
        }
        self.services
            .metrics
            .record_message(&self.settings.name, message_type.as_wire());

        for action in actions_for(message_type) {
            match action {
                MessageAction::RefreshSlots => self.refresh_slots(),
                MessageAction::RefreshPlatform => self.refresh_platform(),
                MessageAction::Retrieve if ready => {
                    let session = Arc::clone(self);
                    tokio::spawn(async move { session.retrieve().await });
                }
                MessageAction::Retrieve => {}
            }
        }
    }

    /// Rebuild per-slot data from the latest slot info, keeping what the
    /// last retrieve found for slots that still exist.
    fn refresh_slots(&self) {
        let cpu = read_or_recover(&self.platform).cpu.clone();
        let entries = lock_or_recover(&self.store)
            .slots()
            .map(|s| s.to_vec())
            .unwrap_or_default();
        let client_path = self.settings.client_path();
        let mut slots = write_or_recover(&self.slots);
        let rebuilt: Vec<ClientData> = entries
            .iter()
            .filter_map(|entry| {
                let id = entry.slot_id()? as i32;
                let mut description = SlotDescription::parse(&entry.description);
                if let SlotDescription::Cpu { processor, .. } = &mut description {
                    *processor = cpu.clone();
                }
                let status = SlotStatus::parse(&entry.status);
                let mut data = slots
                    .iter()
                    .find(|d| d.slot_id() == id)
                    .cloned()
                    .unwrap_or_else(|| {
                        ClientData::new(
                            SlotIdentifier::new(&self.settings.name, &client_path, id),
                            status,
                            description.clone(),
                        )
                    });
                data.status = status;
                data.description = description;
                Some(data)
            })
            .collect();
        debug!(client = %self.settings.name, count = rebuilt.len(), "Slots refreshed");
        *slots = rebuilt;
    }

    fn refresh_platform(&self) {
        let platform = {
            let store = lock_or_recover(&self.store);
            let Some(info) = store.info() else {
                return;
            };
            ClientPlatform {
                client_version: info.client_version().map(str::to_string),
                operating_system: info.operating_system().map(str::to_string),
                cpu: info.cpu().map(str::to_string),
            }
        };
        let mut slots = write_or_recover(&self.slots);
        for data in slots.iter_mut() {
            if let SlotDescription::Cpu { processor, .. } = &mut data.description {
                *processor = platform.cpu.clone();
            }
        }
        *write_or_recover(&self.platform) = platform;
    }

    /// Rebuild work units, production and history for every slot. Skipped
    /// while another retrieve is running or the session is offline.
    pub async fn retrieve(&self) {
        if self.retrieving.swap(true, Ordering::SeqCst) {
            debug!(client = %self.settings.name, "Retrieve already in progress");
            return;
        }
        let _guard = RetrieveGuard(&self.retrieving);
        if !self.is_connected() {
            return;
        }

        let overdue = lock_or_recover(&self.store).is_heartbeat_overdue(
            Utc::now(),
            self.options.heartbeat_interval,
            self.options.heartbeat_overdue_factor,
        );
        if overdue {
            warn!(client = %self.settings.name, "Heartbeat overdue, closing");
            self.close().await;
            return;
        }

        let started = Instant::now();
        let generation = self.generation.load(Ordering::SeqCst);
        let (units, lines, runs) = {
            let store = lock_or_recover(&self.store);
            if !store.is_ready() {
                return;
            }
            (
                store.units().map(|u| u.to_vec()).unwrap_or_default(),
                store.log_lines().to_vec(),
                store.client_runs(),
            )
        };
        let run = runs.last();
        let client_path = self.settings.client_path();
        let builder = WorkUnitCollectionBuilder::new(
            &self.settings.name,
            &client_path,
            &units,
            &lines,
            run,
            Utc::now(),
        );

        let mut updated = Vec::new();
        for data in self.slots() {
            updated.push(self.process_slot(data, &builder, run, &lines).await);
        }

        {
            // Slot info may have changed while this retrieve awaited; merge
            // into whatever slots exist now.
            let mut slots = write_or_recover(&self.slots);
            if self.generation.load(Ordering::SeqCst) != generation || !self.is_connected() {
                debug!(client = %self.settings.name, "Session closed during retrieve");
                return;
            }
            for retrieved in updated.into_iter().filter(|d| d.slot.has_slot()) {
                match slots.iter_mut().find(|d| d.slot == retrieved.slot) {
                    Some(current) => current.apply_retrieved(retrieved),
                    None => debug!(slot = %retrieved.slot, "Slot removed during retrieve"),
                }
            }
        }
        let elapsed = started.elapsed();
        self.services
            .metrics
            .retrieve_seconds
            .observe(elapsed.as_secs_f64());
        info!(client = %self.settings.name, elapsed_ms = elapsed.as_millis() as u64, "Retrieve finished");
    }

    async fn process_slot(
        &self,
        mut data: ClientData,
        builder: &WorkUnitCollectionBuilder<'_>,
        run: Option<&ClientRun>,
        lines: &[LogLine],
    ) -> ClientData {
        if !data.slot.has_slot() {
            return data;
        }
        let slot_id = data.slot_id();
        let previous_units = lock_or_recover(&self.previous_units)
            .get(&slot_id)
            .cloned()
            .unwrap_or_default();
        let previous_current = data.work_unit_model.as_ref().map(|m| &m.work_unit);
        let collection = builder.build_for_slot(slot_id as u32, &data.description, previous_current);

        let mut models = Vec::with_capacity(collection.units.len());
        for unit in collection.units {
            let project = unit.key.project;
            let protein = if unit.key.is_known() {
                self.services
                    .proteins
                    .get_or_refresh(project)
                    .await
                    .unwrap_or_else(|| Protein::new(project))
            } else {
                Protein::new(project)
            };
            if unit.key.is_known() {
                let previous = previous_units
                    .iter()
                    .find(|p| p.queue_id == unit.queue_id && p.is_same_unit(&unit));
                let durations = unit.new_frame_durations(previous);
                if !durations.is_empty() {
                    let accepted = self.services.benchmarks.update(&data.slot, project, durations);
                    debug!(slot = %data.slot, project, accepted, "Benchmark updated");
                }
            }
            models.push(WorkUnitModel::new(unit, protein, &self.services.benchmarks));
        }

        for model in &models {
            match self.services.repository.update(model).await {
                Ok(0) => {}
                Ok(rows) => {
                    info!(slot = %data.slot, unit = %model.work_unit.key, result = %model.work_unit.result, "Work unit stored");
                    self.services.metrics.record_stored(&self.settings.name, rows);
                }
                Err(e) => {
                    error!(slot = %data.slot, unit = %model.work_unit.key, error = %e, "Failed to store work unit")
                }
            }
        }

        data.counts = self.unit_counts(&data.slot, run).await;
        data.work_unit_model = models
            .iter()
            .find(|m| m.work_unit.queue_id == collection.current_id)
            .cloned();
        data.project_details = match &data.work_unit_model {
            Some(m) if m.work_unit.key.is_known() => {
                self.services
                    .project_details
                    .try_get_with_refresh(m.work_unit.key.project)
                    .await
            }
            _ => None,
        };
        data.queue = lock_or_recover(&self.store)
            .units()
            .map(|units| {
                units
                    .iter()
                    .filter(|u| u.slot_id() == Some(slot_id as u32))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        data.log_lines = slot_log_lines(data.work_unit_model.as_ref(), run, slot_id as u32, lines);

        let ppd = data
            .work_unit_model
            .as_ref()
            .map(|m| m.ppd(self.options.ppd_calculation, self.options.bonus_calculation))
            .unwrap_or_default();
        self.services.metrics.set_slot_ppd(
            &self.settings.name,
            &format!("{:02}", slot_id),
            production::round_to(ppd, self.options.decimal_places),
        );

        lock_or_recover(&self.previous_units).insert(
            slot_id,
            models.into_iter().map(|m| m.work_unit).collect(),
        );
        data
    }

    async fn unit_counts(&self, slot: &SlotIdentifier, run: Option<&ClientRun>) -> UnitCounts {
        let repo = &self.services.repository;
        let since = run.and_then(|r| r.start_time);
        let count = |result: anyhow::Result<u64>| {
            result.unwrap_or_else(|e| {
                warn!(slot = %slot, error = %e, "Failed to count work units");
                0
            })
        };
        UnitCounts {
            run_completed: count(repo.count_completed(slot, since).await),
            run_failed: count(repo.count_failed(slot, since).await),
            total_completed: count(repo.count_completed(slot, None).await),
            total_failed: count(repo.count_failed(slot, None).await),
        }
    }

    async fn send(&self, command: &str) {
        let connection = lock_or_recover(&self.connection).clone();
        let Some(connection) = connection.filter(|c| c.is_connected()) else {
            return;
        };
        if let Err(e) = connection.send_command(command).await {
            if is_closed_error(&e) {
                debug!(client = %self.settings.name, error = %e, "Command dropped, connection closed");
            } else {
                warn!(client = %self.settings.name, command, error = %e, "Command failed");
            }
        }
    }

    /// Resume folding on `slot_id`, or every slot.
    pub async fn fold(&self, slot_id: Option<i32>) {
        self.send(&slot_command("unpause", slot_id)).await;
    }

    pub async fn pause(&self, slot_id: Option<i32>) {
        self.send(&slot_command("pause", slot_id)).await;
    }

    /// Finish the current unit, then pause.
    pub async fn finish(&self, slot_id: Option<i32>) {
        self.send(&slot_command("finish", slot_id)).await;
    }

    /// Close the current connection, if any.
    pub async fn close(&self) {
        let generation = self.generation.load(Ordering::SeqCst);
        self.close_generation(generation).await;
    }

    async fn close_generation(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if let Some(tx) = lock_or_recover(&self.shutdown).take() {
            let _ = tx.send(true);
        }
        let connection = lock_or_recover(&self.connection).take();
        let Some(connection) = connection else {
            return;
        };
        connection.close().await;
        self.services.metrics.clients_connected.dec();
        lock_or_recover(&self.store).clear();
        *write_or_recover(&self.slots) = vec![ClientData::offline(
            &self.settings.name,
            &self.settings.client_path(),
        )];
        info!(client = %self.settings.name, "Disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_order() {
        let commands = subscription_commands(Duration::from_secs(60));
        assert_eq!(
            commands,
            vec![
                "updates clear",
                "log-updates restart",
                "updates add 0 60 $heartbeat",
                "updates add 1 1 $info",
                "updates add 2 1 $(options -a)",
                "updates add 3 1 $slot-info",
                "queue-info",
            ]
        );
    }

    #[test]
    fn slot_commands() {
        assert_eq!(slot_command("unpause", None), "unpause");
        assert_eq!(slot_command("pause", Some(1)), "pause 1");
        assert_eq!(slot_command("finish", Some(0)), "finish 0");
    }

    #[test]
    fn slot_log_lines_fall_back_to_slot_run_then_client_run() {
        let buffer: Vec<LogLine> = [
            "*** Log Started 2020-02-07T17:00:00Z ***",
            "17:00:01:Enabled folding slot 00: READY cpu:4",
            "17:00:02:WU00:FS00:Starting",
            "17:00:03:Connecting to assign1.foldingathome.org:80",
        ]
        .iter()
        .enumerate()
        .map(|(i, l)| LogLine::parse(i, l))
        .collect();
        let runs = crate::runs::reconstruct(&buffer);
        let run = runs.last();

        let slot_lines = slot_log_lines(None, run, 0, &buffer);
        assert_eq!(slot_lines.iter().map(|l| l.index).collect::<Vec<_>>(), vec![1, 2]);

        let run_lines = slot_log_lines(None, run, 1, &buffer);
        assert_eq!(run_lines.len(), 4);

        assert!(slot_log_lines(None, None, 0, &buffer).is_empty());

        let slot = SlotIdentifier::new("rig", "10.0.0.5:36330", 0);
        let mut unit = WorkUnit::new(slot, 0, Utc::now());
        unit.log_lines = vec![buffer[2].clone()];
        let model = WorkUnitModel::new(unit, Protein::new(0), &BenchmarkRepository::new());
        let unit_lines = slot_log_lines(Some(&model), run, 0, &buffer);
        assert_eq!(unit_lines, vec![buffer[2].clone()]);
    }

    #[test]
    fn actions_follow_message_type() {
        assert_eq!(actions_for(MessageType::SlotInfo), &[MessageAction::RefreshSlots]);
        assert_eq!(actions_for(MessageType::Info), &[MessageAction::RefreshPlatform]);
        assert_eq!(actions_for(MessageType::UnitCollection), &[MessageAction::Retrieve]);
        assert_eq!(actions_for(MessageType::LogRestart), &[MessageAction::Retrieve]);
        assert!(actions_for(MessageType::LogUpdate).is_empty());
        assert!(actions_for(MessageType::Heartbeat).is_empty());
    }
}
