//! # Work Unit — Work Unit Lifecycle and Collection Builder
//!
//! Joins the client's queue snapshot (`units` message) with the lifecycle
//! recorded in the slot's latest run of the log. The log tells us what the
//! queue cannot: per-frame timestamps and how the unit ended.
//!
//! ## Segments
//!
//! Inside a slot run, each `WUqq:FSss:Starting` line opens a log segment for
//! queue id `qq`. Lines tagged with that queue id belong to the latest segment
//! for it. Segments for the same queue id and project key are merged, so a
//! unit resumed after a pause keeps a single frame history.
//!
//! ## Frames
//!
//! Frame id is the completion percentage. A frame's duration is the time
//! since frame `id - 1` (24h added across midnight); a frame whose
//! predecessor was never observed has duration zero.
//!
//! ## Carry-forward
//!
//! `build_for_slot` takes the slot's previous current unit. When a rebuilt
//! unit has the same natural key, frames and queue details the previous unit
//! had are kept. A previous unit whose result is terminating is returned
//! unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use crate::log::{seconds_between, LogClock, LogLine, LogLineKind};
use crate::message::UnitEntry;
use crate::runs::{ClientRun, SlotRun};
use crate::slot::{SlotDescription, SlotIdentifier};

/// Queue or slot id meaning "none".
pub const NO_ID: i32 = -1;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkUnitResult {
    #[default]
    Unknown,
    FinishedUnit,
    EarlyUnitEnd,
    UnstableMachine,
    Interrupted,
    BadWorkUnit,
    CoreOutdated,
    ClientCoreError,
    GpuMemtestError,
    UnknownEnum,
}

impl WorkUnitResult {
    /// Map the result string a FahCore reports on exit.
    pub fn from_core_string(s: &str) -> WorkUnitResult {
        match s.trim() {
            "FINISHED_UNIT" => WorkUnitResult::FinishedUnit,
            "EARLY_UNIT_END" => WorkUnitResult::EarlyUnitEnd,
            "UNSTABLE_MACHINE" => WorkUnitResult::UnstableMachine,
            "INTERRUPTED" => WorkUnitResult::Interrupted,
            "BAD_WORK_UNIT" => WorkUnitResult::BadWorkUnit,
            "CORE_OUTDATED" => WorkUnitResult::CoreOutdated,
            "CLIENT_CORE_ERROR" => WorkUnitResult::ClientCoreError,
            "GPU_MEMTEST_ERROR" => WorkUnitResult::GpuMemtestError,
            "UNKNOWN_ENUM" => WorkUnitResult::UnknownEnum,
            _ => WorkUnitResult::Unknown,
        }
    }

    pub fn as_core_string(&self) -> &'static str {
        match self {
            WorkUnitResult::Unknown => "UNKNOWN",
            WorkUnitResult::FinishedUnit => "FINISHED_UNIT",
            WorkUnitResult::EarlyUnitEnd => "EARLY_UNIT_END",
            WorkUnitResult::UnstableMachine => "UNSTABLE_MACHINE",
            WorkUnitResult::Interrupted => "INTERRUPTED",
            WorkUnitResult::BadWorkUnit => "BAD_WORK_UNIT",
            WorkUnitResult::CoreOutdated => "CORE_OUTDATED",
            WorkUnitResult::ClientCoreError => "CLIENT_CORE_ERROR",
            WorkUnitResult::GpuMemtestError => "GPU_MEMTEST_ERROR",
            WorkUnitResult::UnknownEnum => "UNKNOWN_ENUM",
        }
    }

    /// Results that end a unit for good. `Interrupted` does not: the client
    /// resumes the unit from its checkpoint.
    pub fn is_terminating(&self) -> bool {
        matches!(
            self,
            WorkUnitResult::FinishedUnit
                | WorkUnitResult::EarlyUnitEnd
                | WorkUnitResult::UnstableMachine
                | WorkUnitResult::BadWorkUnit
                | WorkUnitResult::ClientCoreError
        )
    }

    pub fn is_failure(&self) -> bool {
        self.is_terminating() && *self != WorkUnitResult::FinishedUnit
    }
}

impl fmt::Display for WorkUnitResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_core_string())
    }
}

/// Project/Run/Clone/Gen. Together with the download time it forms a work
/// unit's natural key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectKey {
    pub project: u32,
    pub run: u32,
    pub clone: u32,
    pub gen: u32,
}

impl ProjectKey {
    pub fn is_known(&self) -> bool {
        self.project != 0
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "P{} (R{}, C{}, G{})",
            self.project, self.run, self.clone, self.gen
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameData {
    pub id: u32,
    pub raw_frame_steps: u64,
    pub time_stamp: DateTime<Utc>,
    pub duration: Duration,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkUnit {
    pub slot: SlotIdentifier,
    pub queue_id: i32,
    pub key: ProjectKey,
    pub core: Option<String>,
    pub unit_id: Option<String>,
    /// Download time. Units without one are never persisted.
    pub assigned: Option<DateTime<Utc>>,
    pub timeout: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub result: WorkUnitResult,
    pub frames: BTreeMap<u32, FrameData>,
    pub total_frames: Option<u32>,
    pub base_credit: Option<f64>,
    pub gpu: bool,
    pub log_lines: Vec<LogLine>,
    pub retrieved_at: DateTime<Utc>,
}

impl WorkUnit {
    pub(crate) fn new(slot: SlotIdentifier, queue_id: i32, retrieved_at: DateTime<Utc>) -> Self {
        WorkUnit {
            slot,
            queue_id,
            key: ProjectKey::default(),
            core: None,
            unit_id: None,
            assigned: None,
            timeout: None,
            deadline: None,
            finished: None,
            result: WorkUnitResult::Unknown,
            frames: BTreeMap::new(),
            total_frames: None,
            base_credit: None,
            gpu: false,
            log_lines: Vec::new(),
            retrieved_at,
        }
    }

    pub fn frames_observed(&self) -> u32 {
        self.frames.len() as u32
    }

    /// Highest frame id seen so far.
    pub fn frames_complete(&self) -> u32 {
        self.frames.keys().next_back().copied().unwrap_or(0)
    }

    pub fn last_frame(&self) -> Option<&FrameData> {
        self.frames.values().next_back()
    }

    /// Same project key and download time.
    pub fn is_same_unit(&self, other: &WorkUnit) -> bool {
        self.key == other.key && (self.assigned.is_none() || other.assigned.is_none() || self.assigned == other.assigned)
    }

    pub fn has_download_time(&self) -> bool {
        self.assigned.is_some()
    }

    /// Frames in `self` that `previous` did not have, with positive durations.
    pub fn new_frame_durations(&self, previous: Option<&WorkUnit>) -> Vec<Duration> {
        self.frames
            .values()
            .filter(|f| previous.is_none_or(|p| !p.frames.contains_key(&f.id)))
            .map(|f| f.duration)
            .filter(|d| !d.is_zero())
            .collect()
    }
}

/// Units built for one slot plus the queue id of the unit currently folding.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkUnitCollection {
    pub units: Vec<WorkUnit>,
    pub current_id: i32,
}

impl Default for WorkUnitCollection {
    fn default() -> Self {
        WorkUnitCollection {
            units: Vec::new(),
            current_id: NO_ID,
        }
    }
}

impl WorkUnitCollection {

    /// Latest unit with queue id `id`.
    pub fn get(&self, id: i32) -> Option<&WorkUnit> {
        self.units.iter().rev().find(|u| u.queue_id == id)
    }

    pub fn current(&self) -> Option<&WorkUnit> {
        if self.current_id == NO_ID {
            return None;
        }
        self.get(self.current_id)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

// ── Builder ─────────────────────────────────────────────────────

#[derive(Default)]
struct Segment {
    queue_id: u32,
    key: ProjectKey,
    core: Option<String>,
    frames: Vec<(u32, u64, DateTime<Utc>)>,
    result: Option<(WorkUnitResult, DateTime<Utc>)>,
    lines: Vec<LogLine>,
}

/// Builds per-slot [`WorkUnitCollection`]s from one retrieve's worth of
/// queue and log state.
pub struct WorkUnitCollectionBuilder<'a> {
    client_name: &'a str,
    client_path: &'a str,
    units: &'a [UnitEntry],
    lines: &'a [LogLine],
    run: Option<&'a ClientRun>,
    retrieved_at: DateTime<Utc>,
}

impl<'a> WorkUnitCollectionBuilder<'a> {
    pub fn new(
        client_name: &'a str,
        client_path: &'a str,
        units: &'a [UnitEntry],
        lines: &'a [LogLine],
        run: Option<&'a ClientRun>,
        retrieved_at: DateTime<Utc>,
    ) -> Self {
        WorkUnitCollectionBuilder {
            client_name,
            client_path,
            units,
            lines,
            run,
            retrieved_at,
        }
    }

    pub fn build_for_slot(
        &self,
        slot_id: u32,
        description: &SlotDescription,
        previous: Option<&WorkUnit>,
    ) -> WorkUnitCollection {
        let slot = SlotIdentifier::new(self.client_name, self.client_path, slot_id as i32);
        let queue: Vec<&UnitEntry> = self
            .units
            .iter()
            .filter(|u| u.slot_id() == Some(slot_id))
            .collect();
        let slot_run = self.run.and_then(|r| r.latest_slot_run(slot_id));
        let segments = slot_run
            .map(|sr| self.segments(sr))
            .unwrap_or_default();

        let mut units = Vec::new();
        let mut matched = vec![false; queue.len()];
        for segment in segments {
            let mut unit = WorkUnit::new(slot.clone(), segment.queue_id as i32, self.retrieved_at);
            unit.gpu = description.is_gpu();
            let entry = queue.iter().enumerate().find(|(i, e)| {
                !matched[*i]
                    && e.queue_id() == Some(segment.queue_id)
                    && (!segment.key.is_known() || entry_key(e) == segment.key)
            });
            if let Some((i, e)) = entry {
                matched[i] = true;
                apply_entry(&mut unit, e);
            }
            apply_segment(&mut unit, segment);
            units.push(unit);
        }
        for (entry, _) in queue.iter().zip(&matched).filter(|(_, m)| !**m) {
            let Some(queue_id) = entry.queue_id() else {
                continue;
            };
            let mut unit = WorkUnit::new(slot.clone(), queue_id as i32, self.retrieved_at);
            unit.gpu = description.is_gpu();
            apply_entry(&mut unit, entry);
            units.push(unit);
        }

        if let Some(previous) = previous {
            for unit in units.iter_mut() {
                if unit.key.is_known() && unit.is_same_unit(previous) {
                    if previous.result.is_terminating() {
                        *unit = previous.clone();
                    } else {
                        carry_forward(unit, previous);
                    }
                }
            }
        }

        let current_id = queue
            .iter()
            .find(|e| e.is_running())
            .and_then(|e| e.queue_id())
            .map(|id| id as i32)
            .or_else(|| {
                units
                    .iter()
                    .rev()
                    .find(|u| !u.result.is_terminating() && !u.log_lines.is_empty())
                    .map(|u| u.queue_id)
            })
            .unwrap_or(NO_ID);

        WorkUnitCollection { units, current_id }
    }

    /// Absolute stamps for every timed line of the client run, keyed by
    /// buffer index. The whole run is walked so date markers and midnight
    /// wraps written outside the slot's lines still move the clock.
    fn stamps(&self) -> HashMap<usize, DateTime<Utc>> {
        let start = self
            .run
            .and_then(|r| r.start_time)
            .or_else(|| self.units.iter().filter_map(|u| u.assigned_time()).min())
            .unwrap_or(self.retrieved_at);
        let mut clock = LogClock::starting_at(start);
        let lines = match self.run {
            Some(run) => run.lines(self.lines),
            None => self.lines,
        };
        lines
            .iter()
            .filter_map(|line| clock.observe(line).map(|stamp| (line.index, stamp)))
            .collect()
    }

    fn segments(&self, slot_run: &SlotRun) -> Vec<Segment> {
        let stamps = self.stamps();
        let mut segments: Vec<Segment> = Vec::new();

        for line in slot_run.lines(self.lines) {
            let stamp = stamps.get(&line.index).copied();
            let Some(queue_id) = line.queue_id else {
                continue;
            };

            let index = if line.kind == LogLineKind::WorkUnitStarting {
                None
            } else {
                segments.iter().rposition(|s| s.queue_id == queue_id)
            };
            let index = match index {
                Some(i) => i,
                None => {
                    segments.push(Segment {
                        queue_id,
                        ..Segment::default()
                    });
                    segments.len() - 1
                }
            };
            let segment = &mut segments[index];
            segment.lines.push(line.clone());
            if segment.core.is_none() {
                segment.core = line.core.clone();
            }

            match &line.kind {
                LogLineKind::WorkUnitProject {
                    project,
                    run,
                    clone,
                    gen,
                } => {
                    segment.key = ProjectKey {
                        project: *project,
                        run: *run,
                        clone: *clone,
                        gen: *gen,
                    };
                }
                LogLineKind::WorkUnitFrame {
                    completed_steps,
                    percent,
                    ..
                } => {
                    // A unit that has ended takes no further progress.
                    let ended = segment.result.is_some_and(|(r, _)| r.is_terminating());
                    if let Some(stamp) = stamp.filter(|_| !ended) {
                        segment.frames.push((*percent, *completed_steps, stamp));
                    }
                }
                LogLineKind::WorkUnitCoreReturn(result) => {
                    if let Some(stamp) = stamp {
                        segment.result = Some((*result, stamp));
                    }
                }
                _ => {}
            }
        }

        merge_resumed(segments)
    }
}

/// Fold segments that resumed an earlier segment (same queue id and key)
/// into it.
fn merge_resumed(segments: Vec<Segment>) -> Vec<Segment> {
    let mut merged: Vec<Segment> = Vec::new();
    for segment in segments {
        let earlier = merged.iter_mut().rev().find(|m| {
            m.queue_id == segment.queue_id
                && m.result.is_none_or(|(r, _)| !r.is_terminating())
                && (m.key == segment.key || !segment.key.is_known())
        });
        match earlier {
            Some(m) => {
                m.lines.extend(segment.lines);
                m.frames.extend(segment.frames);
                if segment.result.is_some() {
                    m.result = segment.result;
                }
                if m.core.is_none() {
                    m.core = segment.core;
                }
            }
            None => merged.push(segment),
        }
    }
    merged
}

fn entry_key(entry: &UnitEntry) -> ProjectKey {
    ProjectKey {
        project: entry.project,
        run: entry.run,
        clone: entry.clone,
        gen: entry.gen,
    }
}

fn apply_entry(unit: &mut WorkUnit, entry: &UnitEntry) {
    unit.key = entry_key(entry);
    unit.assigned = entry.assigned_time();
    unit.timeout = crate::log::parse_fah_datetime(&entry.timeout);
    unit.deadline = crate::log::parse_fah_datetime(&entry.deadline);
    if !entry.core.is_empty() {
        unit.core = Some(entry.core.to_ascii_lowercase());
    }
    if !entry.unit.is_empty() {
        unit.unit_id = Some(entry.unit.clone());
    }
    if entry.total_frames > 0 {
        unit.total_frames = Some(entry.total_frames);
    }
    unit.base_credit = entry.base_credit.trim().parse().ok();
}

fn apply_segment(unit: &mut WorkUnit, segment: Segment) {
    if segment.key.is_known() {
        unit.key = segment.key;
    }
    if unit.core.is_none() {
        unit.core = segment.core;
    }
    for (id, steps, stamp) in segment.frames {
        insert_frame(&mut unit.frames, id, steps, stamp);
    }
    if let Some((result, stamp)) = segment.result {
        unit.result = result;
        unit.finished = Some(stamp);
    }
    unit.log_lines = segment.lines;
}

fn carry_forward(unit: &mut WorkUnit, previous: &WorkUnit) {
    for frame in previous.frames.values() {
        if !unit.frames.contains_key(&frame.id) {
            insert_frame(&mut unit.frames, frame.id, frame.raw_frame_steps, frame.time_stamp);
        }
    }
    unit.assigned = unit.assigned.or(previous.assigned);
    unit.timeout = unit.timeout.or(previous.timeout);
    unit.deadline = unit.deadline.or(previous.deadline);
    unit.unit_id = unit.unit_id.take().or_else(|| previous.unit_id.clone());
    unit.core = unit.core.take().or_else(|| previous.core.clone());
    unit.total_frames = unit.total_frames.or(previous.total_frames);
    unit.base_credit = unit.base_credit.or(previous.base_credit);
}

/// Insert a frame (first observation wins) and recompute durations of it and
/// its successor.
fn insert_frame(frames: &mut BTreeMap<u32, FrameData>, id: u32, steps: u64, stamp: DateTime<Utc>) {
    if frames.contains_key(&id) {
        return;
    }
    frames.insert(
        id,
        FrameData {
            id,
            raw_frame_steps: steps,
            time_stamp: stamp,
            duration: Duration::ZERO,
        },
    );
    for target in [id, id + 1] {
        let Some(prev_stamp) = target
            .checked_sub(1)
            .and_then(|p| frames.get(&p))
            .map(|p| p.time_stamp)
        else {
            continue;
        };
        if let Some(frame) = frames.get_mut(&target) {
            let secs = seconds_between(prev_stamp.time(), frame.time_stamp.time());
            frame.duration = Duration::from_secs(secs.max(0) as u64);
        }
    }
}
