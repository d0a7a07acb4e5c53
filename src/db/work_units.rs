//! Work unit history queries: insert-once, slot counts, filtered fetch.

use super::Database;
use crate::production::BonusCalculation;
use crate::repository::{RepoFuture, StoredWorkUnit, WorkUnitQuery, WorkUnitRepository, WorkUnitRow};
use crate::slot::SlotIdentifier;
use crate::work_unit::WorkUnitResult;
use crate::work_unit_model::WorkUnitModel;
use chrono::{DateTime, Utc};

const FAILURE_RESULTS: [&str; 4] = [
    "EARLY_UNIT_END",
    "UNSTABLE_MACHINE",
    "BAD_WORK_UNIT",
    "CLIENT_CORE_ERROR",
];

/// A `wu_history` row as stored in PostgreSQL.
#[derive(Debug, sqlx::FromRow)]
pub struct WuHistoryRecord {
    pub id: i64,
    pub client_name: String,
    pub client_path: String,
    pub slot_id: i32,
    pub project_id: i32,
    pub project_run: i32,
    pub project_clone: i32,
    pub project_gen: i32,
    pub core: String,
    pub frames_observed: i32,
    pub frame_time_secs: i64,
    pub result: String,
    pub assigned: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub work_unit_name: String,
    pub number_of_atoms: i32,
    pub base_credit: f64,
    pub k_factor: f64,
    pub preferred_days: f64,
    pub maximum_days: f64,
    pub frames: i32,
}

impl WuHistoryRecord {
    fn into_row(self, bonus: BonusCalculation) -> WorkUnitRow {
        let id = self.id;
        let unit = StoredWorkUnit {
            client_name: self.client_name,
            client_path: self.client_path,
            slot_id: self.slot_id,
            project_id: self.project_id.max(0) as u32,
            project_run: self.project_run.max(0) as u32,
            project_clone: self.project_clone.max(0) as u32,
            project_gen: self.project_gen.max(0) as u32,
            core: self.core,
            frames_observed: self.frames_observed.max(0) as u32,
            frame_time_secs: self.frame_time_secs.max(0) as u64,
            result: WorkUnitResult::from_core_string(&self.result),
            assigned: self.assigned,
            finished: self.finished,
            work_unit_name: self.work_unit_name,
            number_of_atoms: self.number_of_atoms.max(0) as u32,
            base_credit: self.base_credit,
            k_factor: self.k_factor,
            preferred_days: self.preferred_days,
            maximum_days: self.maximum_days,
            frames: self.frames.max(0) as u32,
        };
        WorkUnitRow::compute(id, unit, bonus)
    }
}

impl Database {
    /// Insert one history row. Returns 0 when the natural key already exists.
    pub async fn insert_work_unit(&self, unit: &StoredWorkUnit) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "INSERT INTO wu_history (client_name, client_path, slot_id,
                project_id, project_run, project_clone, project_gen,
                core, frames_observed, frame_time_secs, result, assigned, finished,
                work_unit_name, number_of_atoms, base_credit, k_factor,
                preferred_days, maximum_days, frames)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                     $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
             ON CONFLICT (project_id, project_run, project_clone,
                          project_gen, assigned) DO NOTHING",
        )
        .bind(&unit.client_name)
        .bind(&unit.client_path)
        .bind(unit.slot_id)
        .bind(unit.project_id as i32)
        .bind(unit.project_run as i32)
        .bind(unit.project_clone as i32)
        .bind(unit.project_gen as i32)
        .bind(&unit.core)
        .bind(unit.frames_observed as i32)
        .bind(unit.frame_time_secs as i64)
        .bind(unit.result.as_core_string())
        .bind(unit.assigned)
        .bind(unit.finished)
        .bind(&unit.work_unit_name)
        .bind(unit.number_of_atoms as i32)
        .bind(unit.base_credit)
        .bind(unit.k_factor)
        .bind(unit.preferred_days)
        .bind(unit.maximum_days)
        .bind(unit.frames as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_results(
        &self,
        slot: &SlotIdentifier,
        since: Option<DateTime<Utc>>,
        results: &[&str],
    ) -> anyhow::Result<u64> {
        let results: Vec<String> = results.iter().map(|s| s.to_string()).collect();
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM wu_history
             WHERE client_path = $1 AND slot_id = $2 AND result = ANY($3)
               AND ($4::timestamptz IS NULL OR COALESCE(finished, assigned) >= $4)",
        )
        .bind(&slot.client_path)
        .bind(slot.slot_id)
        .bind(&results)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    /// Filtered history, newest first.
    pub async fn get_work_units_filtered(
        &self,
        query: &WorkUnitQuery,
        bonus: BonusCalculation,
    ) -> anyhow::Result<Vec<WorkUnitRow>> {
        let mut conditions = Vec::new();
        let mut param_idx = 1u32;

        if query.client_name.is_some() {
            conditions.push(format!("client_name = ${}", param_idx));
            param_idx += 1;
        }
        if query.slot_id.is_some() {
            conditions.push(format!("slot_id = ${}", param_idx));
            param_idx += 1;
        }
        if query.project_id.is_some() {
            conditions.push(format!("project_id = ${}", param_idx));
            param_idx += 1;
        }
        if query.result.is_some() {
            conditions.push(format!("result = ${}", param_idx));
            param_idx += 1;
        }
        if query.since.is_some() {
            conditions.push(format!("COALESCE(finished, assigned) >= ${}", param_idx));
            param_idx += 1;
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        let limit_clause = if query.limit.is_some() {
            format!(" LIMIT ${}", param_idx)
        } else {
            String::new()
        };

        let sql = format!(
            "SELECT id, client_name, client_path, slot_id, project_id, project_run,
                    project_clone, project_gen, core, frames_observed, frame_time_secs,
                    result, assigned, finished, work_unit_name, number_of_atoms,
                    base_credit, k_factor, preferred_days, maximum_days, frames
             FROM wu_history{}
             ORDER BY COALESCE(finished, assigned) DESC, id DESC{}",
            where_clause, limit_clause
        );

        let mut q = sqlx::query_as::<_, WuHistoryRecord>(&sql);
        if let Some(ref name) = query.client_name {
            q = q.bind(name);
        }
        if let Some(slot_id) = query.slot_id {
            q = q.bind(slot_id);
        }
        if let Some(project_id) = query.project_id {
            q = q.bind(project_id as i32);
        }
        if let Some(result) = query.result {
            q = q.bind(result.as_core_string());
        }
        if let Some(since) = query.since {
            q = q.bind(since);
        }
        if let Some(limit) = query.limit {
            q = q.bind(limit as i64);
        }

        let records = q.fetch_all(&self.pool).await?;
        Ok(records.into_iter().map(|r| r.into_row(bonus)).collect())
    }
}

impl WorkUnitRepository for Database {
    fn update<'a>(&'a self, model: &'a WorkUnitModel) -> RepoFuture<'a, u64> {
        Box::pin(async move {
            match model.to_stored() {
                Some(stored) => self.insert_work_unit(&stored).await,
                None => Ok(0),
            }
        })
    }

    fn count_completed<'a>(
        &'a self,
        slot: &'a SlotIdentifier,
        since: Option<DateTime<Utc>>,
    ) -> RepoFuture<'a, u64> {
        Box::pin(async move {
            self.count_results(slot, since, &[WorkUnitResult::FinishedUnit.as_core_string()])
                .await
        })
    }

    fn count_failed<'a>(
        &'a self,
        slot: &'a SlotIdentifier,
        since: Option<DateTime<Utc>>,
    ) -> RepoFuture<'a, u64> {
        Box::pin(async move { self.count_results(slot, since, &FAILURE_RESULTS).await })
    }

    fn fetch<'a>(
        &'a self,
        query: &'a WorkUnitQuery,
        bonus: BonusCalculation,
    ) -> RepoFuture<'a, Vec<WorkUnitRow>> {
        Box::pin(async move { self.get_work_units_filtered(query, bonus).await })
    }
}
