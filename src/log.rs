//! # Log — Folding@home Client Log Line Model
//!
//! Classifies raw lines of the FAH v7 client log into the handful of events
//! the reconstruction pipeline cares about. Every other line is kept verbatim
//! as [`LogLineKind::Other`] so the merged buffer stays a faithful copy of
//! what the client sent.
//!
//! ## Recognised Lines
//!
//! | Kind | Example |
//! |------|---------|
//! | `RunStarted` | `******* Log Started 2020-02-07T17:36:40Z *******` |
//! | `DateChanged` | `******* Date: 2020-02-08 *******` |
//! | `SlotEnabled` | `17:36:41:Enabled folding slot 00: READY cpu:7` |
//! | `SlotUnpaused` / `SlotPaused` / `SlotRemoved` | `17:40:00:FS00:Paused` |
//! | `WorkUnitStarting` | `17:36:42:WU01:FS00:Starting` |
//! | `WorkUnitProject` | `17:36:43:WU01:FS00:0xa7:Project: 13851 (Run 0, Clone 7891, Gen 9)` |
//! | `WorkUnitFrame` | `17:36:44:WU01:FS00:0xa7:Completed 5000 out of 500000 steps (1%)` |
//! | `WorkUnitCoreReturn` | `19:01:12:WU01:FS00:FahCore returned: FINISHED_UNIT (100 = 0x64)` |

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::work_unit::WorkUnitResult;

static RUN_STARTED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*+\s*Log Started (\S+)\s*\*+").unwrap());

static DATE_CHANGED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*+\s*Date:\s*(\d{4}-\d{2}-\d{2})\s*\*+").unwrap());

static PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{2}):(\d{2}):(\d{2}):(?:WU(\d{2}):)?(?:FS(\d{2}):)?(?:(0x[0-9a-fA-F]+):)?(.*)$",
    )
    .unwrap()
});

static SLOT_ENABLED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Enabled folding slot (\d+)").unwrap());

static PROJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Project: (\d+) \(Run (\d+), Clone (\d+), Gen (\d+)\)").unwrap()
});

static FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Completed (\d+) out of (\d+) steps\s+\((\d+)%\)").unwrap()
});

static CORE_RETURNED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"FahCore returned: (\w+)").unwrap());

/// What a log line means to the reconstruction pipeline.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum LogLineKind {
    RunStarted(DateTime<Utc>),
    /// The client writes one at midnight and after long quiet periods.
    DateChanged(NaiveDate),
    SlotEnabled,
    SlotUnpaused,
    SlotPaused,
    SlotRemoved,
    WorkUnitStarting,
    WorkUnitProject {
        project: u32,
        run: u32,
        clone: u32,
        gen: u32,
    },
    WorkUnitFrame {
        completed_steps: u64,
        total_steps: u64,
        percent: u32,
    },
    WorkUnitCoreReturn(WorkUnitResult),
    Other,
}

/// One line of the merged client log. `index` is the line's position in the
/// session's log buffer and never changes once assigned.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogLine {
    pub index: usize,
    pub raw: String,
    pub kind: LogLineKind,
    pub time: Option<NaiveTime>,
    pub slot_id: Option<u32>,
    pub queue_id: Option<u32>,
    pub core: Option<String>,
}

impl LogLine {
    pub fn parse(index: usize, raw: &str) -> LogLine {
        let raw = raw.trim_end_matches(['\r', '\n']);
        let mut line = LogLine {
            index,
            raw: raw.to_string(),
            kind: LogLineKind::Other,
            time: None,
            slot_id: None,
            queue_id: None,
            core: None,
        };

        if let Some(caps) = RUN_STARTED.captures(raw) {
            if let Some(started) = parse_fah_datetime(&caps[1]) {
                line.kind = LogLineKind::RunStarted(started);
            }
            return line;
        }

        if let Some(caps) = DATE_CHANGED.captures(raw) {
            if let Ok(date) = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d") {
                line.kind = LogLineKind::DateChanged(date);
            }
            return line;
        }

        let Some(caps) = PREFIX.captures(raw) else {
            return line;
        };
        line.time = NaiveTime::from_hms_opt(
            caps[1].parse().unwrap_or(0),
            caps[2].parse().unwrap_or(0),
            caps[3].parse().unwrap_or(0),
        );
        line.queue_id = caps.get(4).and_then(|m| m.as_str().parse().ok());
        line.slot_id = caps.get(5).and_then(|m| m.as_str().parse().ok());
        line.core = caps.get(6).map(|m| m.as_str().to_ascii_lowercase());
        let message = caps.get(7).map(|m| m.as_str()).unwrap_or_default();

        line.kind = classify(message, line.queue_id.is_some(), line.slot_id.is_some());
        if line.kind == LogLineKind::SlotEnabled {
            line.slot_id = SLOT_ENABLED
                .captures(message)
                .and_then(|c| c[1].parse().ok());
        }
        line
    }

    pub fn is_slot_start(&self) -> bool {
        matches!(
            self.kind,
            LogLineKind::SlotEnabled | LogLineKind::SlotUnpaused
        )
    }

    pub fn is_slot_stop(&self) -> bool {
        matches!(self.kind, LogLineKind::SlotPaused | LogLineKind::SlotRemoved)
    }
}

fn classify(message: &str, has_queue: bool, has_slot: bool) -> LogLineKind {
    if !has_queue && !has_slot {
        if SLOT_ENABLED.is_match(message) {
            return LogLineKind::SlotEnabled;
        }
        return LogLineKind::Other;
    }
    if has_slot && !has_queue {
        return match message.trim() {
            "Unpaused" => LogLineKind::SlotUnpaused,
            "Paused" => LogLineKind::SlotPaused,
            "Removed" => LogLineKind::SlotRemoved,
            _ => LogLineKind::Other,
        };
    }
    if message.trim() == "Starting" {
        return LogLineKind::WorkUnitStarting;
    }
    if let Some(c) = PROJECT.captures(message) {
        return LogLineKind::WorkUnitProject {
            project: c[1].parse().unwrap_or(0),
            run: c[2].parse().unwrap_or(0),
            clone: c[3].parse().unwrap_or(0),
            gen: c[4].parse().unwrap_or(0),
        };
    }
    if let Some(c) = FRAME.captures(message) {
        return LogLineKind::WorkUnitFrame {
            completed_steps: c[1].parse().unwrap_or(0),
            total_steps: c[2].parse().unwrap_or(0),
            percent: c[3].parse().unwrap_or(0),
        };
    }
    if let Some(c) = CORE_RETURNED.captures(message) {
        return LogLineKind::WorkUnitCoreReturn(WorkUnitResult::from_core_string(&c[1]));
    }
    LogLineKind::Other
}

/// Parse the date formats the FAH client emits: RFC 3339 (`2020-02-07T17:36:40Z`)
/// and the naive variant without a zone designator. Anything else (including
/// the client's `<invalid>` placeholder) yields `None`.
pub fn parse_fah_datetime(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Turns the time-of-day stamps of consecutive log lines into absolute
/// timestamps, rolling the date forward whenever the clock wraps past midnight.
/// `Date:` marker lines pin the date outright, which keeps stamps right across
/// gaps longer than a day.
pub struct LogClock {
    date: NaiveDate,
    last: Option<NaiveTime>,
}

impl LogClock {
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        LogClock {
            date: start.date_naive(),
            last: Some(start.time()),
        }
    }

    pub fn set_date(&mut self, date: NaiveDate) {
        self.date = date;
        self.last = None;
    }

    /// Feed one line: date markers move the clock, timed lines get stamped.
    pub fn observe(&mut self, line: &LogLine) -> Option<DateTime<Utc>> {
        if let LogLineKind::DateChanged(date) = line.kind {
            self.set_date(date);
            return None;
        }
        line.time.map(|t| self.stamp(t))
    }

    pub fn stamp(&mut self, time: NaiveTime) -> DateTime<Utc> {
        if let Some(last) = self.last {
            if time < last {
                self.date += Duration::days(1);
            }
        }
        self.last = Some(time);
        self.date.and_time(time).and_utc()
    }
}

/// Seconds from `earlier` to `later` on a 24h clock (wraps past midnight).
pub fn seconds_between(earlier: NaiveTime, later: NaiveTime) -> i64 {
    let diff = (later - earlier).num_seconds();
    if diff < 0 {
        diff + 86_400
    } else {
        diff
    }
}
