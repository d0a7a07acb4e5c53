//! # Runs — Client Run and Slot Run Reconstruction
//!
//! Rebuilds the run timeline from the merged client log in a single forward
//! scan. A [`ClientRun`] spans from one `Log Started` marker to the next (or
//! from index 0 when the buffer begins mid-run). Inside it, every slot start
//! marker opens a fresh [`SlotRun`]; the run stays open until a stop marker,
//! the next start for the same slot, or the end of the client run.
//!
//! ## Markers
//!
//! | Event | Lines |
//! |-------|-------|
//! | run start | `*** Log Started <ts> ***` |
//! | slot start | `Enabled folding slot NN`, `FSNN:Unpaused` |
//! | slot stop | `FSNN:Paused`, `FSNN:Removed` |
//!
//! Any `FSNN`-tagged line seen while no SlotRun is open for that slot opens
//! one implicitly. Reconstruction is a pure function of the buffer, so
//! running it twice over the same lines yields the same runs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::log::{LogLine, LogLineKind};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SlotRun {
    pub slot_id: u32,
    /// Buffer index of the line that opened this run.
    pub start_index: usize,
    /// Exclusive end index.
    pub end_index: usize,
    /// True when a stop marker closed the run.
    pub stopped: bool,
    /// Buffer indices of every line attributed to this slot run.
    pub line_indices: Vec<usize>,
}

impl SlotRun {
    fn open(slot_id: u32, index: usize) -> Self {
        SlotRun {
            slot_id,
            start_index: index,
            end_index: index + 1,
            stopped: false,
            line_indices: vec![index],
        }
    }

    /// Lines of this slot run borrowed from the buffer they were built from.
    pub fn lines<'a>(&'a self, buffer: &'a [LogLine]) -> impl Iterator<Item = &'a LogLine> + 'a {
        self.line_indices.iter().filter_map(move |&i| buffer.get(i))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClientRun {
    pub start_index: usize,
    pub end_index: usize,
    /// Timestamp from the `Log Started` marker; `None` for the implicit run.
    pub start_time: Option<DateTime<Utc>>,
    pub slot_runs: Vec<SlotRun>,
}

impl ClientRun {
    fn starting(index: usize, start_time: Option<DateTime<Utc>>) -> Self {
        ClientRun {
            start_index: index,
            end_index: index,
            start_time,
            slot_runs: Vec::new(),
        }
    }

    /// The most recent slot run for `slot_id` in this client run.
    /// Every buffered line of this run, markers included.
    pub fn lines<'a>(&self, buffer: &'a [LogLine]) -> &'a [LogLine] {
        let end = self.end_index.min(buffer.len());
        buffer.get(self.start_index.min(end)..end).unwrap_or_default()
    }

    pub fn latest_slot_run(&self, slot_id: u32) -> Option<&SlotRun> {
        self.slot_runs.iter().rev().find(|r| r.slot_id == slot_id)
    }
}

/// Scan `lines` once and return every client run in buffer order.
pub fn reconstruct(lines: &[LogLine]) -> Vec<ClientRun> {
    let mut runs = Vec::new();
    let mut current: Option<ClientRun> = None;
    let mut open: HashMap<u32, usize> = HashMap::new();

    for line in lines {
        let i = line.index;

        if let LogLineKind::RunStarted(started) = line.kind {
            if let Some(run) = current.take() {
                runs.push(finish_run(run, &mut open, i));
            }
            let mut run = ClientRun::starting(i, Some(started));
            run.end_index = i + 1;
            current = Some(run);
            continue;
        }

        let run = current.get_or_insert_with(|| ClientRun::starting(0, None));
        run.end_index = i + 1;

        let Some(slot_id) = line.slot_id else {
            continue;
        };

        if line.is_slot_start() {
            if let Some(pos) = open.remove(&slot_id) {
                run.slot_runs[pos].end_index = i;
            }
            run.slot_runs.push(SlotRun::open(slot_id, i));
            open.insert(slot_id, run.slot_runs.len() - 1);
            continue;
        }

        if line.is_slot_stop() {
            if let Some(pos) = open.remove(&slot_id) {
                let slot_run = &mut run.slot_runs[pos];
                slot_run.line_indices.push(i);
                slot_run.end_index = i + 1;
                slot_run.stopped = true;
            }
            continue;
        }

        match open.get(&slot_id) {
            Some(&pos) => {
                let slot_run = &mut run.slot_runs[pos];
                slot_run.line_indices.push(i);
                slot_run.end_index = i + 1;
            }
            None => {
                run.slot_runs.push(SlotRun::open(slot_id, i));
                open.insert(slot_id, run.slot_runs.len() - 1);
            }
        }
    }

    if let Some(run) = current.take() {
        let end = run.end_index;
        runs.push(finish_run(run, &mut open, end));
    }
    runs
}

fn finish_run(mut run: ClientRun, open: &mut HashMap<u32, usize>, end: usize) -> ClientRun {
    for (_, pos) in open.drain() {
        run.slot_runs[pos].end_index = end;
    }
    run.end_index = end;
    run
}

/// Latest slot run for `slot_id` in the latest client run.
pub fn latest_slot_run(runs: &[ClientRun], slot_id: u32) -> Option<&SlotRun> {
    runs.last().and_then(|r| r.latest_slot_run(slot_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Vec<LogLine> {
        text.lines()
            .enumerate()
            .map(|(i, l)| LogLine::parse(i, l))
            .collect()
    }

    const TWO_SLOT_RUNS: &str = "\
*** Log Started 2020-02-07T17:36:40Z ***
17:36:41:Enabled folding slot 00: READY cpu:7
17:36:42:WU01:FS00:Starting
17:36:43:WU01:FS00:0xa7:Project: 13851 (Run 0, Clone 7891, Gen 9)
17:40:00:FS00:Paused
17:45:00:FS00:Unpaused
17:45:01:WU01:FS00:Starting
17:46:00:WU01:FS00:0xa7:Completed 10000 out of 500000 steps (2%)";

    #[test]
    fn pause_and_unpause_yield_two_slot_runs() {
        let lines = parse(TWO_SLOT_RUNS);
        let runs = reconstruct(&lines);
        assert_eq!(runs.len(), 1);
        let run = &runs[0];
        assert!(run.start_time.is_some());
        assert_eq!(run.slot_runs.len(), 2);
        assert_eq!(run.slot_runs[0].slot_id, 0);
        assert_eq!(run.slot_runs[0].line_indices, vec![1, 2, 3, 4]);
        assert!(run.slot_runs[0].stopped);
        assert_eq!(run.slot_runs[1].start_index, 5);
        assert_eq!(run.slot_runs[1].line_indices, vec![5, 6, 7]);
        assert!(!run.slot_runs[1].stopped);
        assert_eq!(run.slot_runs[1].end_index, 8);
    }

    #[test]
    fn lines_before_first_marker_form_implicit_run() {
        let lines = parse(
            "17:36:42:WU01:FS00:Starting\n\
             *** Log Started 2020-02-08T00:00:00Z ***\n\
             00:00:01:Enabled folding slot 00: READY cpu:7",
        );
        let runs = reconstruct(&lines);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].start_index, 0);
        assert_eq!(runs[0].start_time, None);
        assert_eq!(runs[0].end_index, 1);
        assert_eq!(runs[0].slot_runs.len(), 1);
        assert_eq!(runs[1].start_index, 1);
        assert_eq!(runs[1].slot_runs[0].start_index, 2);
    }

    #[test]
    fn new_client_run_closes_open_slot_runs() {
        let lines = parse(
            "*** Log Started 2020-02-07T17:36:40Z ***\n\
             17:36:41:Enabled folding slot 00: READY cpu:7\n\
             17:36:42:WU01:FS00:Starting\n\
             *** Log Started 2020-02-08T09:00:00Z ***\n\
             09:00:01:Enabled folding slot 00: READY cpu:7",
        );
        let runs = reconstruct(&lines);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].slot_runs[0].end_index, 3);
        assert_eq!(runs[1].slot_runs.len(), 1);
        assert_eq!(latest_slot_run(&runs, 0).map(|r| r.start_index), Some(4));
    }

    #[test]
    fn slots_are_tracked_independently() {
        let lines = parse(
            "*** Log Started 2020-02-07T17:36:40Z ***\n\
             17:36:41:Enabled folding slot 00: READY cpu:7\n\
             17:36:41:Enabled folding slot 01: READY gpu:0:GP104\n\
             17:36:42:WU00:FS01:Starting\n\
             17:36:42:WU01:FS00:Starting",
        );
        let runs = reconstruct(&lines);
        let run = &runs[0];
        assert_eq!(run.latest_slot_run(0).unwrap().line_indices, vec![1, 4]);
        assert_eq!(run.latest_slot_run(1).unwrap().line_indices, vec![2, 3]);
    }

    #[test]
    fn reconstruction_is_idempotent() {
        let lines = parse(TWO_SLOT_RUNS);
        assert_eq!(reconstruct(&lines), reconstruct(&lines));
    }

    #[test]
    fn empty_buffer_has_no_runs() {
        assert!(reconstruct(&[]).is_empty());
    }
}
