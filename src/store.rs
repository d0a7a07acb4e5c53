//! # Store — Latest Client State
//!
//! Per-session cache of what the client last reported: one value per
//! [`MessageType`] plus the merged log buffer. The session's read task is the
//! only writer.
//!
//! Log merge rules for a chunk declaring start index `N` against a buffer of
//! length `len`:
//!
//! - `N <= len` replaces the buffer from `N`
//! - `len < N <= len + max_log_gap` appends
//! - `N > len + max_log_gap` drops the chunk and raises a resync request
//!
//! `log-restart` always starts at 0 and chunks without a start append.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

use crate::log::LogLine;
use crate::message::{self, ClientInfo, LogChunk, Message, MessageType, Payload, SlotEntry, UnitEntry};
use crate::runs::{self, ClientRun};

pub const DEFAULT_MAX_LOG_GAP: usize = 1;

pub struct MessageStore {
    max_log_gap: usize,
    last_text: HashMap<MessageType, String>,
    info: Option<ClientInfo>,
    options: Option<BTreeMap<String, String>>,
    slots: Option<Vec<SlotEntry>>,
    units: Option<Vec<UnitEntry>>,
    log_lines: Vec<LogLine>,
    log_received: bool,
    resync_requested: bool,
    heartbeat_at: DateTime<Utc>,
}

impl Default for MessageStore {
    fn default() -> Self {
        MessageStore::new(DEFAULT_MAX_LOG_GAP)
    }
}

impl MessageStore {
    pub fn new(max_log_gap: usize) -> Self {
        MessageStore {
            max_log_gap,
            last_text: HashMap::new(),
            info: None,
            options: None,
            slots: None,
            units: None,
            log_lines: Vec::new(),
            log_received: false,
            resync_requested: false,
            heartbeat_at: Utc::now(),
        }
    }

    /// Apply one message. Returns `true` when cached state changed.
    pub fn update_message(&mut self, message: &Message) -> bool {
        let message_type = message.message_type();
        if message_type == MessageType::Heartbeat {
            self.heartbeat_at = message.identifier.received_at;
        }
        if self.last_text.get(&message_type) == Some(&message.text) {
            debug!(r#type = %message_type, "Duplicate message ignored");
            return false;
        }

        let payload = match message::decode(message) {
            Ok(p) => p,
            Err(e) => {
                warn!(r#type = %message_type, error = %e, "Dropping undecodable message");
                return false;
            }
        };

        let changed = match payload {
            Payload::Heartbeat(_) => true,
            Payload::Info(info) => {
                self.info = Some(info);
                true
            }
            Payload::Options(options) => {
                self.options = Some(options);
                true
            }
            Payload::SlotInfo(slots) => {
                self.slots = Some(slots);
                true
            }
            Payload::UnitCollection(units) => {
                self.units = Some(units);
                true
            }
            Payload::Log(chunk) => self.merge_log(chunk),
        };
        if changed {
            self.last_text.insert(message_type, message.text.clone());
        }
        changed
    }

    fn merge_log(&mut self, chunk: LogChunk) -> bool {
        let len = self.log_lines.len();
        let start = chunk.start.unwrap_or(len);
        if start > len + self.max_log_gap {
            warn!(
                start,
                len,
                max_gap = self.max_log_gap,
                "Log chunk leaves a gap; requesting restart"
            );
            self.resync_requested = true;
            return false;
        }
        // A chunk past the end but within the gap is placed at the end.
        let start = start.min(len);
        let incoming: Vec<LogLine> = chunk
            .lines
            .iter()
            .enumerate()
            .map(|(i, raw)| LogLine::parse(start + i, raw))
            .collect();
        let first = !self.log_received;
        self.log_received = true;
        if self.log_lines[start..] == incoming[..] {
            return first;
        }
        self.log_lines.truncate(start);
        self.log_lines.extend(incoming);
        true
    }

    /// Returns and clears a pending log resync request.
    pub fn take_resync_request(&mut self) -> bool {
        std::mem::take(&mut self.resync_requested)
    }

    pub fn info(&self) -> Option<&ClientInfo> {
        self.info.as_ref()
    }

    pub fn options(&self) -> Option<&BTreeMap<String, String>> {
        self.options.as_ref()
    }

    pub fn slots(&self) -> Option<&[SlotEntry]> {
        self.slots.as_deref()
    }

    pub fn units(&self) -> Option<&[UnitEntry]> {
        self.units.as_deref()
    }

    pub fn log_lines(&self) -> &[LogLine] {
        &self.log_lines
    }

    /// Slot info, units and the initial log have all arrived.
    pub fn is_ready(&self) -> bool {
        self.slots.is_some() && self.units.is_some() && self.log_received
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.heartbeat_at).to_std().unwrap_or_default()
    }

    pub fn is_heartbeat_overdue(&self, now: DateTime<Utc>, interval: Duration, factor: u32) -> bool {
        self.heartbeat_age(now) > interval * factor
    }

    pub fn client_runs(&self) -> Vec<ClientRun> {
        runs::reconstruct(&self.log_lines)
    }

    /// Forget everything. The heartbeat clock restarts.
    pub fn clear(&mut self) {
        *self = MessageStore::new(self.max_log_gap);
    }
}
