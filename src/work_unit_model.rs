//! # Work Unit Model — Production Values for One Work Unit
//!
//! Joins a [`WorkUnit`] with its [`Protein`] and the slot's benchmark to
//! answer the questions a monitor asks: time per frame, PPD, units per day,
//! ETA, expected credit, percent complete.
//!
//! When the recorded frames cannot give a frame time under the chosen
//! [`PpdCalculation`] (too few frames observed), the benchmark's average
//! frame time for this slot and project stands in.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::benchmark::{BenchmarkIdentifier, BenchmarkRepository};
use crate::production::{self, BonusCalculation, PpdCalculation};
use crate::protein::Protein;
use crate::repository::StoredWorkUnit;
use crate::work_unit::{WorkUnit, WorkUnitResult};

/// Snapshot of production values under one calculation choice.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ProductionValues {
    pub frame_time: Duration,
    pub unit_time: Duration,
    pub eta: Duration,
    pub upd: f64,
    pub ppd: f64,
    pub credit: f64,
    pub percent_complete: u32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WorkUnitModel {
    pub work_unit: WorkUnit,
    pub protein: Protein,
    pub benchmark_frame_time: Duration,
}

impl WorkUnitModel {
    pub fn new(work_unit: WorkUnit, protein: Protein, benchmarks: &BenchmarkRepository) -> Self {
        let id = BenchmarkIdentifier::new(work_unit.slot.clone(), work_unit.key.project);
        let benchmark_frame_time = benchmarks
            .get_benchmark(&id)
            .map(|b| b.average_frame_time())
            .unwrap_or_default();
        WorkUnitModel {
            work_unit,
            protein,
            benchmark_frame_time,
        }
    }

    /// Frames per unit: the queue's count, else the protein's.
    pub fn frames(&self) -> u32 {
        self.work_unit
            .total_frames
            .filter(|f| *f > 0)
            .unwrap_or(self.protein.frames)
    }

    pub fn frames_complete(&self) -> u32 {
        self.work_unit.frames_complete().min(self.frames())
    }

    pub fn percent_complete(&self) -> u32 {
        let frames = self.frames();
        if frames == 0 {
            return 0;
        }
        if self.work_unit.result == WorkUnitResult::FinishedUnit {
            return 100;
        }
        self.frames_complete() * 100 / frames
    }

    fn raw_frame_time(&self, calculation: PpdCalculation) -> Duration {
        let durations: Vec<Duration> = self
            .work_unit
            .frames
            .values()
            .map(|f| f.duration)
            .filter(|d| !d.is_zero())
            .collect();
        let average = |ds: &[Duration]| -> Duration {
            if ds.is_empty() {
                return Duration::ZERO;
            }
            let secs: u64 = ds.iter().map(|d| d.as_secs()).sum();
            Duration::from_secs(secs / ds.len() as u64)
        };
        match calculation {
            PpdCalculation::LastFrame => durations.last().copied().unwrap_or_default(),
            PpdCalculation::LastThreeFrames => {
                if durations.len() < 3 {
                    Duration::ZERO
                } else {
                    average(&durations[durations.len() - 3..])
                }
            }
            PpdCalculation::AllFrames => average(&durations),
            PpdCalculation::EffectiveRate => {
                let complete = self.frames_complete();
                match self.work_unit.assigned {
                    Some(assigned) if complete > 0 => {
                        let elapsed = elapsed_between(assigned, self.work_unit.retrieved_at);
                        Duration::from_secs(elapsed.as_secs() / complete as u64)
                    }
                    _ => Duration::ZERO,
                }
            }
        }
    }

    /// Time per frame, falling back to the benchmark average.
    pub fn frame_time(&self, calculation: PpdCalculation) -> Duration {
        let raw = self.raw_frame_time(calculation);
        if raw.is_zero() {
            self.benchmark_frame_time
        } else {
            raw
        }
    }

    pub fn eta(&self, calculation: PpdCalculation) -> Duration {
        let remaining = self.frames().saturating_sub(self.frames_complete());
        self.frame_time(calculation) * remaining
    }

    /// Elapsed time the bonus is computed from.
    pub fn unit_time(&self, calculation: PpdCalculation, bonus: BonusCalculation) -> Duration {
        match bonus {
            BonusCalculation::None => Duration::ZERO,
            BonusCalculation::FrameTime => self.frame_time(calculation) * self.frames(),
            BonusCalculation::DownloadTime => {
                let Some(assigned) = self.work_unit.assigned else {
                    return Duration::ZERO;
                };
                match self.work_unit.finished {
                    Some(finished) => elapsed_between(assigned, finished),
                    None => {
                        elapsed_between(assigned, self.work_unit.retrieved_at)
                            + self.eta(calculation)
                    }
                }
            }
        }
    }

    pub fn upd(&self, calculation: PpdCalculation) -> f64 {
        production::get_upd(self.frame_time(calculation), self.frames())
    }

    pub fn credit(&self, calculation: PpdCalculation, bonus: BonusCalculation) -> f64 {
        let p = &self.protein;
        production::get_credit(
            self.base_credit(),
            p.k_factor,
            p.preferred_days,
            p.maximum_days,
            self.unit_time(calculation, bonus),
        )
    }

    pub fn ppd(&self, calculation: PpdCalculation, bonus: BonusCalculation) -> f64 {
        let p = &self.protein;
        production::get_ppd(
            self.frame_time(calculation),
            self.frames(),
            self.base_credit(),
            p.k_factor,
            p.preferred_days,
            p.maximum_days,
            self.unit_time(calculation, bonus),
        )
    }

    /// Queue-reported base credit when the client sent one, else the protein's.
    pub fn base_credit(&self) -> f64 {
        self.work_unit
            .base_credit
            .filter(|c| *c > 0.0)
            .unwrap_or(self.protein.credit)
    }

    pub fn production(&self, calculation: PpdCalculation, bonus: BonusCalculation) -> ProductionValues {
        ProductionValues {
            frame_time: self.frame_time(calculation),
            unit_time: self.unit_time(calculation, bonus),
            eta: self.eta(calculation),
            upd: self.upd(calculation),
            ppd: self.ppd(calculation, bonus),
            credit: self.credit(calculation, bonus),
            percent_complete: self.percent_complete(),
        }
    }

    /// Work units enter history once, after they end: the project and
    /// download time must be known, a finished unit needs its finish time,
    /// and anything else must have a terminating result.
    pub fn is_eligible_for_history(&self) -> bool {
        let unit = &self.work_unit;
        if !unit.key.is_known() || unit.assigned.is_none() {
            return false;
        }
        if unit.result == WorkUnitResult::FinishedUnit {
            return unit.finished.is_some();
        }
        unit.result.is_terminating()
    }

    /// The fields history stores for this unit, or `None` when ineligible.
    pub fn to_stored(&self) -> Option<StoredWorkUnit> {
        if !self.is_eligible_for_history() {
            return None;
        }
        let unit = &self.work_unit;
        Some(StoredWorkUnit {
            client_name: unit.slot.client_name.clone(),
            client_path: unit.slot.client_path.clone(),
            slot_id: unit.slot.slot_id,
            project_id: unit.key.project,
            project_run: unit.key.run,
            project_clone: unit.key.clone,
            project_gen: unit.key.gen,
            core: unit.core.clone().unwrap_or_default(),
            frames_observed: unit.frames_observed(),
            frame_time_secs: self.raw_frame_time(PpdCalculation::AllFrames).as_secs(),
            result: unit.result,
            assigned: unit.assigned?,
            finished: unit.finished,
            work_unit_name: self.protein.work_unit_name.clone(),
            number_of_atoms: self.protein.number_of_atoms,
            base_credit: self.base_credit(),
            k_factor: self.protein.k_factor,
            preferred_days: self.protein.preferred_days,
            maximum_days: self.protein.maximum_days,
            frames: self.frames(),
        })
    }
}

fn elapsed_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or_default()
}
