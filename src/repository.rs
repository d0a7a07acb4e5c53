//! # Repository — Work Unit History
//!
//! Completed and failed work units are written once, keyed by their natural
//! key (project/run/clone/gen, download time). The key carries no client or
//! slot, so a unit seen through a second client entry or after the slot was
//! renumbered is still stored once. A second insert is a no-op reporting
//! zero rows.
//!
//! Rows store the protein parameters the unit was credited under, so PPD and
//! credit are recomputed on every fetch with whatever [`BonusCalculation`]
//! the caller passes. Changing the bonus basis applies retroactively.
//!
//! Two implementations: [`MemoryWorkUnitRepository`] here and the PostgreSQL
//! one in [`crate::db`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;

use crate::lock_or_recover;
use crate::production::{self, BonusCalculation};
use crate::slot::SlotIdentifier;
use crate::work_unit::WorkUnitResult;
use crate::work_unit_model::WorkUnitModel;
use crate::BoxFuture;

pub type RepoFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// Fields persisted for one work unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredWorkUnit {
    pub client_name: String,
    pub client_path: String,
    pub slot_id: i32,
    pub project_id: u32,
    pub project_run: u32,
    pub project_clone: u32,
    pub project_gen: u32,
    pub core: String,
    pub frames_observed: u32,
    /// Average observed frame time in seconds.
    pub frame_time_secs: u64,
    pub result: WorkUnitResult,
    pub assigned: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub work_unit_name: String,
    pub number_of_atoms: u32,
    pub base_credit: f64,
    pub k_factor: f64,
    pub preferred_days: f64,
    pub maximum_days: f64,
    pub frames: u32,
}

impl StoredWorkUnit {
    pub fn same_natural_key(&self, other: &StoredWorkUnit) -> bool {
        self.project_id == other.project_id
            && self.project_run == other.project_run
            && self.project_clone == other.project_clone
            && self.project_gen == other.project_gen
            && self.assigned == other.assigned
    }

    pub fn frame_time(&self) -> Duration {
        Duration::from_secs(self.frame_time_secs)
    }

    /// Elapsed time under `bonus`; zero means no bonus.
    pub fn unit_time(&self, bonus: BonusCalculation) -> Duration {
        match bonus {
            BonusCalculation::None => Duration::ZERO,
            BonusCalculation::FrameTime => self.frame_time() * self.frames,
            BonusCalculation::DownloadTime => self
                .finished
                .and_then(|f| (f - self.assigned).to_std().ok())
                .unwrap_or_default(),
        }
    }

    pub fn credit(&self, bonus: BonusCalculation) -> f64 {
        if self.result != WorkUnitResult::FinishedUnit {
            return 0.0;
        }
        production::get_credit(
            self.base_credit,
            self.k_factor,
            self.preferred_days,
            self.maximum_days,
            self.unit_time(bonus),
        )
    }

    pub fn ppd(&self, bonus: BonusCalculation) -> f64 {
        if self.result != WorkUnitResult::FinishedUnit {
            return 0.0;
        }
        production::get_ppd(
            self.frame_time(),
            self.frames,
            self.base_credit,
            self.k_factor,
            self.preferred_days,
            self.maximum_days,
            self.unit_time(bonus),
        )
    }

    fn in_slot(&self, slot: &SlotIdentifier) -> bool {
        self.client_path == slot.client_path && self.slot_id == slot.slot_id
    }

    fn ended_at(&self) -> DateTime<Utc> {
        self.finished.unwrap_or(self.assigned)
    }
}

/// A history row with production values computed for one bonus basis.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkUnitRow {
    pub id: i64,
    #[serde(flatten)]
    pub unit: StoredWorkUnit,
    pub ppd: f64,
    pub credit: f64,
}

impl WorkUnitRow {
    pub fn compute(id: i64, unit: StoredWorkUnit, bonus: BonusCalculation) -> Self {
        WorkUnitRow {
            id,
            ppd: unit.ppd(bonus),
            credit: unit.credit(bonus),
            unit,
        }
    }
}

/// Filters for [`WorkUnitRepository::fetch`]. Empty matches everything.
#[derive(Clone, Debug, Default)]
pub struct WorkUnitQuery {
    pub client_name: Option<String>,
    pub slot_id: Option<i32>,
    pub project_id: Option<u32>,
    pub result: Option<WorkUnitResult>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl WorkUnitQuery {
    pub fn matches(&self, unit: &StoredWorkUnit) -> bool {
        self.client_name.as_ref().is_none_or(|n| *n == unit.client_name)
            && self.slot_id.is_none_or(|s| s == unit.slot_id)
            && self.project_id.is_none_or(|p| p == unit.project_id)
            && self.result.is_none_or(|r| r == unit.result)
            && self.since.is_none_or(|s| unit.ended_at() >= s)
    }
}

pub trait WorkUnitRepository: Send + Sync {
    /// Insert the model's unit into history when eligible. Returns rows
    /// affected: 0 when ineligible or already stored.
    fn update<'a>(&'a self, model: &'a WorkUnitModel) -> RepoFuture<'a, u64>;

    /// Finished units for `slot`, optionally only those ending at or after
    /// `since`.
    fn count_completed<'a>(
        &'a self,
        slot: &'a SlotIdentifier,
        since: Option<DateTime<Utc>>,
    ) -> RepoFuture<'a, u64>;

    /// Units for `slot` that ended with a failure result.
    fn count_failed<'a>(
        &'a self,
        slot: &'a SlotIdentifier,
        since: Option<DateTime<Utc>>,
    ) -> RepoFuture<'a, u64>;

    /// Newest first.
    fn fetch<'a>(
        &'a self,
        query: &'a WorkUnitQuery,
        bonus: BonusCalculation,
    ) -> RepoFuture<'a, Vec<WorkUnitRow>>;
}

#[derive(Default)]
pub struct MemoryWorkUnitRepository {
    rows: Mutex<Vec<StoredWorkUnit>>,
}

impl MemoryWorkUnitRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn count_where(
        &self,
        slot: &SlotIdentifier,
        since: Option<DateTime<Utc>>,
        pred: impl Fn(WorkUnitResult) -> bool,
    ) -> u64 {
        lock_or_recover(&self.rows)
            .iter()
            .filter(|u| u.in_slot(slot) && pred(u.result))
            .filter(|u| since.is_none_or(|s| u.ended_at() >= s))
            .count() as u64
    }
}

impl WorkUnitRepository for MemoryWorkUnitRepository {
    fn update<'a>(&'a self, model: &'a WorkUnitModel) -> RepoFuture<'a, u64> {
        Box::pin(async move {
            let Some(stored) = model.to_stored() else {
                return Ok(0);
            };
            let mut rows = lock_or_recover(&self.rows);
            if rows.iter().any(|r| r.same_natural_key(&stored)) {
                return Ok(0);
            }
            rows.push(stored);
            Ok(1)
        })
    }

    fn count_completed<'a>(
        &'a self,
        slot: &'a SlotIdentifier,
        since: Option<DateTime<Utc>>,
    ) -> RepoFuture<'a, u64> {
        Box::pin(async move {
            Ok(self.count_where(slot, since, |r| r == WorkUnitResult::FinishedUnit))
        })
    }

    fn count_failed<'a>(
        &'a self,
        slot: &'a SlotIdentifier,
        since: Option<DateTime<Utc>>,
    ) -> RepoFuture<'a, u64> {
        Box::pin(async move { Ok(self.count_where(slot, since, |r| r.is_failure())) })
    }

    fn fetch<'a>(
        &'a self,
        query: &'a WorkUnitQuery,
        bonus: BonusCalculation,
    ) -> RepoFuture<'a, Vec<WorkUnitRow>> {
        Box::pin(async move {
            let rows = lock_or_recover(&self.rows);
            let mut out: Vec<WorkUnitRow> = rows
                .iter()
                .enumerate()
                .filter(|(_, u)| query.matches(u))
                .map(|(i, u)| WorkUnitRow::compute(i as i64 + 1, u.clone(), bonus))
                .collect();
            out.sort_by(|a, b| b.unit.ended_at().cmp(&a.unit.ended_at()).then(b.id.cmp(&a.id)));
            if let Some(limit) = query.limit {
                out.truncate(limit);
            }
            Ok(out)
        })
    }
}
