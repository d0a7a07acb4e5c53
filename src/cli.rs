//! # CLI Execution Functions
//!
//! Extracted from `main.rs` to keep the entry point slim. Contains the
//! execution logic for each subcommand and the composition root that wires
//! protein data, project details, benchmarks and history into the fleet.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use foldwatch::benchmark::BenchmarkRepository;
use foldwatch::config::{self, MonitorConfig};
use foldwatch::db::Database;
use foldwatch::fleet::Fleet;
use foldwatch::production::{self, BonusCalculation, PpdCalculation};
use foldwatch::prom_metrics::Metrics;
use foldwatch::protein::{
    CachingProteinService, DefaultProjectDetailsService, FileProteinSource, HttpProjectDetailsSource,
    HttpProteinSource, NullProjectDetailsService, ProjectDetailsService, ProteinSource,
};
use foldwatch::repository::{MemoryWorkUnitRepository, WorkUnitQuery, WorkUnitRepository, WorkUnitRow};
use foldwatch::session::{ClientSession, SessionOptions, SessionServices};
use foldwatch::slot::ClientData;
use foldwatch::work_unit::WorkUnitResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::{BonusArg, Cli, Commands, ControlAction};

// ── Composition Root ────────────────────────────────────────────

fn load_config(cli: &Cli) -> Result<MonitorConfig> {
    config::parse_toml_file(&cli.config)
}

async fn build_services(
    cli: &Cli,
    config: &MonitorConfig,
    benchmarks: Arc<BenchmarkRepository>,
) -> Result<SessionServices> {
    let protein_location = config.protein_source();
    let source: Arc<dyn ProteinSource> = if protein_location.starts_with("http://")
        || protein_location.starts_with("https://")
    {
        Arc::new(HttpProteinSource::new(protein_location.clone()))
    } else {
        Arc::new(FileProteinSource::new(protein_location.clone()))
    };
    let proteins = Arc::new(CachingProteinService::new(Some(source)));
    match proteins.refresh().await {
        Ok(count) => info!(count, source = %protein_location, "Proteins loaded"),
        Err(e) => warn!(source = %protein_location, error = %e, "Protein load failed, will retry on demand"),
    }

    let project_details: Arc<dyn ProjectDetailsService> = if config.project_details {
        let service = DefaultProjectDetailsService::new(Arc::new(HttpProjectDetailsSource::new(
            config.api_url.clone(),
        )));
        if let Err(e) = service.initialize_project_list().await {
            warn!(error = %e, "Project list unavailable; project details disabled until restart");
        }
        Arc::new(service)
    } else {
        Arc::new(NullProjectDetailsService)
    };

    let repository: Arc<dyn WorkUnitRepository> = match cli.database_url.as_deref() {
        Some(url) => {
            let database = Database::connect(url).await?;
            database.migrate().await?;
            let rows = database.history_rows().await?;
            info!(rows, "Work unit history in PostgreSQL");
            Arc::new(database)
        }
        None => {
            warn!("DATABASE_URL not set; work unit history kept in memory only");
            Arc::new(MemoryWorkUnitRepository::new())
        }
    };

    Ok(SessionServices {
        proteins,
        project_details,
        benchmarks,
        repository,
        metrics: Arc::new(Metrics::new()),
    })
}

// ── Monitor ─────────────────────────────────────────────────────

/// Run the fleet supervisor until Ctrl-C, or one pass with `once`.
pub fn run_monitor(cli: &Cli, once: bool, settle_secs: u64) -> Result<()> {
    let config = load_config(cli)?;
    let rt = tokio::runtime::Runtime::new()?;

    let benchmarks = Arc::new(match &config.benchmark_cache {
        Some(path) => BenchmarkRepository::load(path),
        None => BenchmarkRepository::new(),
    });

    rt.block_on(async {
        let services = build_services(cli, &config, Arc::clone(&benchmarks)).await?;
        let fleet = Arc::new(Fleet::new(SessionOptions::from_config(&config), services));
        for settings in config.enabled_clients() {
            fleet.add(settings.clone()).await?;
        }
        info!(clients = fleet.len().await, "foldwatch starting");

        if once {
            fleet.tick().await;
            tokio::time::sleep(Duration::from_secs(settle_secs)).await;
            fleet.tick().await;
            print_slots(&fleet.slots().await, config.ppd_calculation, config.bonus_calculation, config.decimal_places);
            fleet.clear().await;
        } else {
            let (tx, rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupt received, shutting down");
                    let _ = tx.send(true);
                }
            });
            fleet
                .run(config.retrieve_interval(), config.metrics_file.clone(), rx)
                .await;
        }
        Ok::<(), anyhow::Error>(())
    })?;

    if let Some(path) = &config.benchmark_cache {
        benchmarks.save(path)?;
        info!(path = %path.display(), benchmarks = benchmarks.len(), "Benchmarks saved");
    }
    Ok(())
}

fn print_slots(slots: &[ClientData], calc: PpdCalculation, bonus: BonusCalculation, places: u32) {
    println!(
        "{:<28} {:<10} {:<28} {:>5} {:>8} {:>12}",
        "Slot", "Status", "Project (R, C, G)", "Done", "TPF", "PPD"
    );
    println!("{}", "-".repeat(96));
    for data in slots {
        let (project, done, tpf, ppd) = match &data.work_unit_model {
            Some(m) => (
                m.work_unit.key.to_string(),
                format!("{}%", m.percent_complete()),
                format_duration(m.frame_time(calc)),
                production::round_to(m.ppd(calc, bonus), places).to_string(),
            ),
            None => ("-".to_string(), "-".to_string(), "-".to_string(), "-".to_string()),
        };
        println!(
            "{:<28} {:<10} {:<28} {:>5} {:>8} {:>12}",
            data.slot.name(),
            data.status.to_string(),
            project,
            done,
            tpf,
            ppd
        );
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else {
        format!("{}:{:02}", secs / 60, secs % 60)
    }
}

// ── Config Check ────────────────────────────────────────────────

pub fn run_check_config(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    println!("Config OK: {}", cli.config.display());
    println!("  Retrieve interval:  {}s", config.retrieve_interval_secs);
    println!(
        "  Heartbeat:          {}s (overdue after x{})",
        config.heartbeat_interval_secs, config.heartbeat_overdue_factor
    );
    println!("  PPD calculation:    {:?}", config.ppd_calculation);
    println!("  Bonus calculation:  {:?}", config.bonus_calculation);
    println!("  Protein source:     {}", config.protein_source());
    println!("  Clients:            {}", config.clients.len());
    for client in &config.clients {
        println!(
            "    {:<20} {}{}",
            client.name,
            client.client_path(),
            if client.disabled { " (disabled)" } else { "" }
        );
    }
    Ok(())
}

// ── History ─────────────────────────────────────────────────────

pub fn run_history(cli: &Cli) -> Result<()> {
    let Commands::History {
        client,
        slot,
        project,
        result,
        since,
        limit,
        bonus,
        json,
    } = &cli.command
    else {
        anyhow::bail!("not a history command");
    };
    let database_url = cli.database_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("DATABASE_URL is required (set via --database-url or env)")
    })?;

    let bonus = match bonus {
        Some(b) => bonus_from_arg(*b),
        None => std::fs::metadata(&cli.config)
            .ok()
            .and_then(|_| load_config(cli).ok())
            .map(|c| c.bonus_calculation)
            .unwrap_or_default(),
    };
    let query = WorkUnitQuery {
        client_name: client.clone(),
        slot_id: *slot,
        project_id: *project,
        result: result.as_deref().map(parse_result).transpose()?,
        since: since.as_deref().map(parse_since).transpose()?,
        limit: Some(*limit),
    };

    let rt = tokio::runtime::Runtime::new()?;
    let rows = rt.block_on(async {
        let database = Database::connect(database_url).await?;
        database.migrate().await?;
        database.fetch(&query, bonus).await
    })?;

    if *json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print_history(&rows);
    }
    Ok(())
}

fn bonus_from_arg(arg: BonusArg) -> BonusCalculation {
    match arg {
        BonusArg::FrameTime => BonusCalculation::FrameTime,
        BonusArg::DownloadTime => BonusCalculation::DownloadTime,
        BonusArg::None => BonusCalculation::None,
    }
}

pub(crate) fn parse_result(s: &str) -> Result<WorkUnitResult> {
    let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
    match WorkUnitResult::from_core_string(&normalized) {
        WorkUnitResult::Unknown => anyhow::bail!("unknown work unit result '{}'", s),
        r => Ok(r),
    }
}

pub(crate) fn parse_since(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .context("invalid date")?;
        return Ok(midnight.and_utc());
    }
    let parsed = DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("expected YYYY-MM-DD or RFC 3339, got '{}'", s))?;
    Ok(parsed.with_timezone(&Utc))
}

fn print_history(rows: &[WorkUnitRow]) {
    if rows.is_empty() {
        println!("No work units found");
        return;
    }
    println!(
        "{:<24} {:<26} {:<18} {:<20} {:>8} {:>10} {:>12}",
        "Slot", "Project (R, C, G)", "Result", "Finished", "TPF", "Credit", "PPD"
    );
    println!("{}", "-".repeat(124));
    for row in rows {
        let u = &row.unit;
        let slot = format!("{} Slot {:02}", u.client_name, u.slot_id);
        let key = format!(
            "P{} (R{}, C{}, G{})",
            u.project_id, u.project_run, u.project_clone, u.project_gen
        );
        let finished = u
            .finished
            .map(|f| f.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<26} {:<18} {:<20} {:>8} {:>10.0} {:>12.0}",
            slot,
            key,
            u.result.to_string(),
            finished,
            format_duration(u.frame_time()),
            row.credit,
            row.ppd
        );
    }
}

// ── Control ─────────────────────────────────────────────────────

pub fn run_control(cli: &Cli, client: &str, action: ControlAction, slot: Option<i32>) -> Result<()> {
    let config = load_config(cli)?;
    let settings = config
        .clients
        .iter()
        .find(|c| c.name == client)
        .cloned()
        .with_context(|| format!("no client named '{}' in {}", client, cli.config.display()))?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let services = SessionServices {
            proteins: Arc::new(CachingProteinService::new(None)),
            project_details: Arc::new(NullProjectDetailsService),
            benchmarks: Arc::new(BenchmarkRepository::new()),
            repository: Arc::new(MemoryWorkUnitRepository::new()),
            metrics: Arc::new(Metrics::new()),
        };
        let session = Arc::new(ClientSession::new(
            settings,
            SessionOptions::from_config(&config),
            services,
        ));
        session.connect().await?;
        match action {
            ControlAction::Fold => session.fold(slot).await,
            ControlAction::Pause => session.pause(slot).await,
            ControlAction::Finish => session.finish(slot).await,
        }
        session.close().await;
        Ok::<(), anyhow::Error>(())
    })?;
    println!("Sent {:?} to {}", action, client);
    Ok(())
}
