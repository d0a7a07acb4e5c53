//! # Message — FAH v7 Message Framing and Decoding
//!
//! The client command server pushes messages framed as
//!
//! ```text
//! PyON 1 units
//! [ { "id": "01", "state": "RUNNING", ... } ]
//! ---
//! ```
//!
//! [`MessageFramer`] turns the raw line stream into [`Message`]s (one per
//! header/terminator pair) and [`decode`] turns a message body into a typed
//! [`Payload`]. Bodies are PyON, a JSON superset that spells `null`, `true`
//! and `false` the Python way; [`pyon_to_json`] rewrites those tokens outside
//! string literals so `serde_json` can parse the result.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Message types the monitor subscribes to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageType {
    Heartbeat,
    Info,
    Options,
    SlotInfo,
    UnitCollection,
    LogRestart,
    LogUpdate,
}

impl MessageType {
    pub fn from_wire(name: &str) -> Option<MessageType> {
        match name {
            "heartbeat" => Some(MessageType::Heartbeat),
            "info" => Some(MessageType::Info),
            "options" => Some(MessageType::Options),
            "slots" => Some(MessageType::SlotInfo),
            "units" => Some(MessageType::UnitCollection),
            "log-restart" => Some(MessageType::LogRestart),
            "log-update" => Some(MessageType::LogUpdate),
            _ => None,
        }
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            MessageType::Heartbeat => "heartbeat",
            MessageType::Info => "info",
            MessageType::Options => "options",
            MessageType::SlotInfo => "slots",
            MessageType::UnitCollection => "units",
            MessageType::LogRestart => "log-restart",
            MessageType::LogUpdate => "log-update",
        }
    }

    pub fn is_log(&self) -> bool {
        matches!(self, MessageType::LogRestart | MessageType::LogUpdate)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MessageIdentifier {
    pub message_type: MessageType,
    pub received_at: DateTime<Utc>,
}

/// A framed message exactly as received. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub identifier: MessageIdentifier,
    pub text: String,
}

impl Message {
    pub fn new(message_type: MessageType, text: impl Into<String>) -> Self {
        Message {
            identifier: MessageIdentifier {
                message_type,
                received_at: Utc::now(),
            },
            text: text.into(),
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.identifier.message_type
    }
}

/// A complete frame whose header named a type we may or may not know.
#[derive(Debug, PartialEq)]
pub struct RawFrame {
    pub type_name: String,
    pub text: String,
}

/// Line-driven frame assembler. Lines outside a frame (the welcome banner,
/// command echoes, bare prompts) are skipped.
#[derive(Default)]
pub struct MessageFramer {
    current: Option<(String, Vec<String>)>,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its newline). Returns a frame when the line
    /// terminates one.
    pub fn push_line(&mut self, line: &str) -> Option<RawFrame> {
        let line = line.trim_end_matches('\r');
        let stripped = line.trim_start_matches("> ");

        if let Some(rest) = stripped.strip_prefix("PyON ") {
            let mut parts = rest.split_whitespace();
            let _version = parts.next();
            if let Some(type_name) = parts.next() {
                self.current = Some((type_name.to_string(), Vec::new()));
            }
            return None;
        }

        match self.current.as_mut() {
            Some(_) if stripped == "---" => {
                let (type_name, body) = self.current.take()?;
                Some(RawFrame {
                    type_name,
                    text: body.join("\n"),
                })
            }
            Some((_, body)) => {
                body.push(line.to_string());
                None
            }
            None => None,
        }
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

// ── Typed payloads ──────────────────────────────────────────────

/// Decoded body of a [`Message`], one variant per [`MessageType`].
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Heartbeat(u64),
    Info(ClientInfo),
    Options(BTreeMap<String, String>),
    SlotInfo(Vec<SlotEntry>),
    UnitCollection(Vec<UnitEntry>),
    Log(LogChunk),
}

/// The `info` message: sections of key/value pairs.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClientInfo {
    pub sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl ClientInfo {
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    pub fn client_version(&self) -> Option<&str> {
        self.get("FAH Client", "Version")
    }

    pub fn operating_system(&self) -> Option<&str> {
        self.get("System", "OS")
    }

    pub fn cpu(&self) -> Option<&str> {
        self.get("System", "CPU")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlotEntry {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub idle: bool,
}

impl SlotEntry {
    pub fn slot_id(&self) -> Option<u32> {
        self.id.trim().parse().ok()
    }
}

/// One entry of the `units` (queue-info) message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitEntry {
    pub id: String,
    pub state: String,
    pub error: String,
    pub project: u32,
    pub run: u32,
    pub clone: u32,
    pub gen: u32,
    pub core: String,
    pub unit: String,
    #[serde(rename = "percentdone")]
    pub percent_done: String,
    #[serde(rename = "totalframes")]
    pub total_frames: u32,
    #[serde(rename = "framesdone")]
    pub frames_done: u32,
    pub assigned: String,
    pub timeout: String,
    pub deadline: String,
    pub ws: String,
    pub cs: String,
    pub slot: String,
    #[serde(rename = "basecredit")]
    pub base_credit: String,
}

impl UnitEntry {
    pub fn queue_id(&self) -> Option<u32> {
        self.id.trim().parse().ok()
    }

    pub fn slot_id(&self) -> Option<u32> {
        self.slot.trim().parse().ok()
    }

    pub fn assigned_time(&self) -> Option<DateTime<Utc>> {
        crate::log::parse_fah_datetime(&self.assigned)
    }

    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("RUNNING")
    }
}

/// A piece of client log. `start` is the buffer index the first line belongs
/// at when the sender declared one; the stock client never does, so plain
/// string bodies append.
#[derive(Clone, Debug, PartialEq)]
pub struct LogChunk {
    pub start: Option<usize>,
    pub lines: Vec<String>,
}

#[derive(Deserialize)]
struct IndexedLogBody {
    start: usize,
    text: String,
}

/// Decode the body of `message` into its typed payload.
pub fn decode(message: &Message) -> Result<Payload> {
    let json = pyon_to_json(&message.text);
    let value: Value = serde_json::from_str(&json)
        .with_context(|| format!("malformed {} body", message.message_type()))?;

    let payload = match message.message_type() {
        MessageType::Heartbeat => Payload::Heartbeat(value.as_u64().unwrap_or_default()),
        MessageType::Info => Payload::Info(decode_info(&value)?),
        MessageType::Options => {
            let Value::Object(map) = value else {
                bail!("options body is not an object");
            };
            let options = map
                .into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s,
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    (k, v)
                })
                .collect();
            Payload::Options(options)
        }
        MessageType::SlotInfo => {
            Payload::SlotInfo(serde_json::from_value(value).context("malformed slots body")?)
        }
        MessageType::UnitCollection => {
            Payload::UnitCollection(serde_json::from_value(value).context("malformed units body")?)
        }
        MessageType::LogRestart | MessageType::LogUpdate => {
            let (start, text) = match value {
                Value::String(text) => (None, text),
                other @ Value::Object(_) => {
                    let body: IndexedLogBody =
                        serde_json::from_value(other).context("malformed indexed log body")?;
                    (Some(body.start), body.text)
                }
                _ => bail!("log body is neither a string nor an indexed chunk"),
            };
            let start = match (message.message_type(), start) {
                (MessageType::LogRestart, None) => Some(0),
                (_, start) => start,
            };
            Payload::Log(LogChunk {
                start,
                lines: split_log_text(&text),
            })
        }
    };
    Ok(payload)
}

fn decode_info(value: &Value) -> Result<ClientInfo> {
    let Value::Array(sections) = value else {
        bail!("info body is not a list");
    };
    let mut info = ClientInfo::default();
    for section in sections {
        let Value::Array(items) = section else {
            continue;
        };
        let Some(Value::String(name)) = items.first() else {
            continue;
        };
        let entries = info.sections.entry(name.clone()).or_default();
        for pair in &items[1..] {
            if let Value::Array(kv) = pair {
                if let (Some(Value::String(k)), Some(v)) = (kv.first(), kv.get(1)) {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    entries.insert(k.clone(), v);
                }
            }
        }
    }
    Ok(info)
}

fn split_log_text(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = text.split('\n').map(|l| l.trim_end_matches('\r').to_string()).collect();
    if lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines
}

/// Rewrite PyON literals (`None`, `True`, `False`) to JSON outside of string
/// literals. Everything else passes through untouched.
pub fn pyon_to_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;
    let mut escaped = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            continue;
        }
        if c.is_ascii_alphabetic() {
            let mut word = String::from(c);
            while let Some(&next) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' {
                    word.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            out.push_str(match word.as_str() {
                "None" => "null",
                "True" => "true",
                "False" => "false",
                other => other,
            });
            continue;
        }
        out.push(c);
    }
    out
}
