//! # Slot — Folding Slot Identity, Status and Per-Slot Client Data
//!
//! A FAH v7 client runs one or more folding slots (`cpu:N` or a GPU). Each
//! slot gets a [`SlotIdentifier`] that survives reconnects, so benchmarks and
//! work unit history recorded under one session line up with the next.
//!
//! [`ClientData`] is the per-slot view the session rebuilds on every slot-info
//! update and fills in on every retrieve.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::log::LogLine;
use crate::message::UnitEntry;
use crate::protein::ProjectDetails;
use crate::work_unit::NO_ID;
use crate::work_unit_model::WorkUnitModel;

/// Stable identity of a slot: owning client name, its connection path
/// (`server:port`) and the slot id. `slot_id == NO_ID` names the client as a
/// whole (used for the offline placeholder).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotIdentifier {
    pub client_name: String,
    pub client_path: String,
    pub slot_id: i32,
}

impl SlotIdentifier {
    pub fn new(client_name: impl Into<String>, client_path: impl Into<String>, slot_id: i32) -> Self {
        SlotIdentifier {
            client_name: client_name.into(),
            client_path: client_path.into(),
            slot_id,
        }
    }

    /// Parse a display name of the form `"<client> Slot NN"`. A name without
    /// the suffix identifies the client itself.
    pub fn from_name(name: &str, client_path: impl Into<String>) -> Self {
        if let Some((client, slot)) = name.rsplit_once(" Slot ") {
            if let Ok(slot_id) = slot.trim().parse::<i32>() {
                return SlotIdentifier::new(client, client_path, slot_id);
            }
        }
        SlotIdentifier::new(name, client_path, NO_ID)
    }

    pub fn has_slot(&self) -> bool {
        self.slot_id != NO_ID
    }

    /// `"<client> Slot NN"`, or just the client name for the client-wide id.
    pub fn name(&self) -> String {
        if self.has_slot() {
            format!("{} Slot {:02}", self.client_name, self.slot_id)
        } else {
            self.client_name.clone()
        }
    }
}

impl fmt::Display for SlotIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    #[default]
    Unknown,
    Paused,
    Running,
    Finishing,
    Ready,
    Stopping,
    Failed,
    Offline,
}

impl SlotStatus {
    /// Case-insensitive parse of the client's status string.
    pub fn parse(s: &str) -> SlotStatus {
        match s.trim().to_ascii_uppercase().as_str() {
            "PAUSED" => SlotStatus::Paused,
            "RUNNING" => SlotStatus::Running,
            "FINISHING" => SlotStatus::Finishing,
            "READY" => SlotStatus::Ready,
            "STOPPING" => SlotStatus::Stopping,
            "FAILED" => SlotStatus::Failed,
            "OFFLINE" => SlotStatus::Offline,
            _ => SlotStatus::Unknown,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SlotStatus::Running | SlotStatus::Finishing)
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Hardware a slot runs on, parsed from the slot-info `description`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotDescription {
    #[default]
    Unknown,
    Cpu {
        threads: Option<u32>,
        processor: Option<String>,
    },
    Gpu {
        bus: Option<u32>,
        name: String,
    },
}

impl SlotDescription {
    /// `cpu:7` → CPU with 7 threads; `gpu:0:GP104 [GeForce GTX 1080]` → GPU on
    /// bus 0 with the remainder as its name.
    pub fn parse(s: &str) -> SlotDescription {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("cpu") {
            let threads = rest.strip_prefix(':').and_then(|t| t.trim().parse().ok());
            return SlotDescription::Cpu {
                threads,
                processor: None,
            };
        }
        if let Some(rest) = s.strip_prefix("gpu") {
            let rest = rest.strip_prefix(':').unwrap_or(rest);
            let (bus, name) = match rest.split_once(':') {
                Some((bus, name)) => (bus.trim().parse().ok(), name.trim().to_string()),
                None => (None, rest.trim().to_string()),
            };
            return SlotDescription::Gpu { bus, name };
        }
        SlotDescription::Unknown
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, SlotDescription::Gpu { .. })
    }
}

/// Unit counts pulled from the work unit repository. "Run" counts are since
/// the start of the current client run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct UnitCounts {
    pub run_completed: u64,
    pub run_failed: u64,
    pub total_completed: u64,
    pub total_failed: u64,
}

/// Everything known about one slot after the latest retrieve.
#[derive(Clone, Debug)]
pub struct ClientData {
    pub slot: SlotIdentifier,
    pub status: SlotStatus,
    pub description: SlotDescription,
    pub work_unit_model: Option<WorkUnitModel>,
    pub project_details: Option<ProjectDetails>,
    pub queue: Vec<UnitEntry>,
    pub log_lines: Vec<LogLine>,
    pub counts: UnitCounts,
}

impl ClientData {
    pub fn new(slot: SlotIdentifier, status: SlotStatus, description: SlotDescription) -> Self {
        ClientData {
            slot,
            status,
            description,
            work_unit_model: None,
            project_details: None,
            queue: Vec::new(),
            log_lines: Vec::new(),
            counts: UnitCounts::default(),
        }
    }

    /// Placeholder reported while a client has no live connection.
    pub fn offline(client_name: &str, client_path: &str) -> Self {
        ClientData::new(
            SlotIdentifier::new(client_name, client_path, NO_ID),
            SlotStatus::Offline,
            SlotDescription::Unknown,
        )
    }

    pub fn slot_id(&self) -> i32 {
        self.slot.slot_id
    }

    /// Take what a retrieve computed for this slot. Status and description
    /// stay as the latest slot info left them.
    pub fn apply_retrieved(&mut self, retrieved: ClientData) {
        self.work_unit_model = retrieved.work_unit_model;
        self.project_details = retrieved.project_details;
        self.queue = retrieved.queue;
        self.log_lines = retrieved.log_lines;
        self.counts = retrieved.counts;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_name_round_trips() {
        let id = SlotIdentifier::from_name("Owner Slot 00", "Path");
        assert_eq!(id.client_name, "Owner");
        assert_eq!(id.slot_id, 0);
        assert_eq!(id.name(), "Owner Slot 00");
    }

    #[test]
    fn identifier_without_slot_suffix_is_client_wide() {
        let id = SlotIdentifier::from_name("rig", "10.0.0.2:36330");
        assert!(!id.has_slot());
        assert_eq!(id.name(), "rig");
    }

    #[test]
    fn apply_retrieved_keeps_current_status() {
        let slot = SlotIdentifier::new("rig", "10.0.0.2:36330", 0);
        let mut current = ClientData::new(slot.clone(), SlotStatus::Paused, SlotDescription::parse("cpu:8"));
        let mut retrieved = ClientData::new(slot, SlotStatus::Running, SlotDescription::parse("cpu:4"));
        retrieved.counts.total_completed = 3;
        retrieved.log_lines.push(LogLine::parse(0, "17:00:00:WU00:FS00:Starting"));

        current.apply_retrieved(retrieved);
        assert_eq!(current.status, SlotStatus::Paused);
        assert_eq!(current.description, SlotDescription::parse("cpu:8"));
        assert_eq!(current.counts.total_completed, 3);
        assert_eq!(current.log_lines.len(), 1);
    }

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!(SlotStatus::parse("RUNNING"), SlotStatus::Running);
        assert_eq!(SlotStatus::parse("paused"), SlotStatus::Paused);
        assert_eq!(SlotStatus::parse("UPDATING_CORE"), SlotStatus::Unknown);
    }

    #[test]
    fn cpu_description() {
        assert_eq!(
            SlotDescription::parse("cpu:7"),
            SlotDescription::Cpu {
                threads: Some(7),
                processor: None
            }
        );
    }

    #[test]
    fn gpu_description_keeps_name() {
        assert_eq!(
            SlotDescription::parse("gpu:0:GP104 [GeForce GTX 1080]"),
            SlotDescription::Gpu {
                bus: Some(0),
                name: "GP104 [GeForce GTX 1080]".into()
            }
        );
    }

    #[test]
    fn unknown_description() {
        assert_eq!(SlotDescription::parse("smp"), SlotDescription::Unknown);
    }

    #[test]
    fn offline_placeholder() {
        let data = ClientData::offline("rig", "host:36330");
        assert_eq!(data.status, SlotStatus::Offline);
        assert_eq!(data.slot_id(), NO_ID);
    }
}
