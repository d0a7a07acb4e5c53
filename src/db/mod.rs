//! # Database — PostgreSQL Work Unit History
//!
//! Async storage for work unit history via `sqlx::PgPool`.
//!
//! ## Schema
//!
//! - `wu_history`: one row per ended work unit, unique on the natural key
//!   `(project_id, project_run, project_clone, project_gen, assigned)`.
//!   Protein parameters are stored with the row so production can be
//!   recomputed under any bonus basis.
//!
//! The schema lives in `migrations/` and is applied by [`Database::migrate`].
//!
//! ## Module Structure
//!
//! - [`work_units`] — [`crate::repository::WorkUnitRepository`] for [`Database`]

mod work_units;

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

const SCHEMA: &str = include_str!("../../migrations/001_wu_history.sql");

pub struct Database {
    pool: PgPool,
}

/// Options for `database_url`. User name and password are percent-decoded
/// before they reach the server.
fn connect_options(database_url: &str) -> Result<PgConnectOptions> {
    let url = url::Url::parse(database_url)
        .with_context(|| format!("invalid database URL '{database_url}'"))?;
    let username = urlencoding::decode(url.username())?;
    let mut options = PgConnectOptions::new()
        .host(url.host_str().unwrap_or("localhost"))
        .port(url.port().unwrap_or(5432))
        .database(url.path().trim_start_matches('/'))
        .username(&username);
    if let Some(password) = url.password() {
        options = options.password(&urlencoding::decode(password)?);
    }
    Ok(options)
}

impl Database {
    /// Open a small pool against `database_url`. Nothing is queried yet.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_with(connect_options(database_url)?)
            .await?;
        Ok(Database { pool })
    }

    /// The pool, for callers that need raw SQL.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the history table and its indexes if they do not exist.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    /// Rows currently in `wu_history`. Run at startup, it also proves the
    /// schema is in place and the server answers.
    pub async fn history_rows(&self) -> Result<i64> {
        let rows = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM wu_history")
            .fetch_one(&self.pool)
            .await
            .context("work unit history is not readable")?;
        Ok(rows)
    }
}
