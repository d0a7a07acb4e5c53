//! Shared test helpers for integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, OnceCell};

use foldwatch::benchmark::BenchmarkRepository;
use foldwatch::prom_metrics::Metrics;
use foldwatch::protein::{CachingProteinService, NullProjectDetailsService, Protein};
use foldwatch::production::BonusCalculation;
use foldwatch::repository::{
    MemoryWorkUnitRepository, RepoFuture, WorkUnitQuery, WorkUnitRepository, WorkUnitRow,
};
use foldwatch::session::SessionServices;
use foldwatch::slot::SlotIdentifier;
use foldwatch::work_unit_model::WorkUnitModel;

// ── Database ────────────────────────────────────────────────────

/// Returns the test database URL from the `TEST_DATABASE_URL` environment variable.
/// Panics if the variable is not set.
pub fn test_db_url() -> String {
    std::env::var("TEST_DATABASE_URL")
        .expect("TEST_DATABASE_URL must be set for integration tests")
}

/// Returns true if the test database URL is configured.
pub fn has_test_db() -> bool {
    std::env::var("TEST_DATABASE_URL").is_ok()
}

/// One-time schema initialization.
static SCHEMA_INIT: OnceCell<()> = OnceCell::const_new();

/// Connect to the test database with an empty history table. The schema is
/// applied once per test binary.
pub async fn setup_test_db() -> foldwatch::db::Database {
    let db = foldwatch::db::Database::connect(&test_db_url())
        .await
        .expect("Failed to connect to test database");
    SCHEMA_INIT
        .get_or_init(|| async {
            db.migrate().await.unwrap();
        })
        .await;
    sqlx::raw_sql("TRUNCATE TABLE wu_history RESTART IDENTITY")
        .execute(db.pool())
        .await
        .unwrap();
    db
}

// ── Services ────────────────────────────────────────────────────

pub fn protein_2669() -> Protein {
    let mut p = Protein::new(2669);
    p.work_unit_name = "p2669_test".into();
    p.credit = 500.0;
    p.k_factor = 0.75;
    p.preferred_days = 3.0;
    p.maximum_days = 5.0;
    p.frames = 100;
    p
}

pub struct TestServices {
    pub services: SessionServices,
    pub repository: Arc<MemoryWorkUnitRepository>,
    pub benchmarks: Arc<BenchmarkRepository>,
    pub metrics: Arc<Metrics>,
}

pub fn test_services() -> TestServices {
    let repository = Arc::new(MemoryWorkUnitRepository::new());
    let benchmarks = Arc::new(BenchmarkRepository::new());
    let metrics = Arc::new(Metrics::new());
    let mut p2670 = protein_2669();
    p2670.project_number = 2670;
    let services = SessionServices {
        proteins: Arc::new(CachingProteinService::with_proteins([protein_2669(), p2670])),
        project_details: Arc::new(NullProjectDetailsService),
        benchmarks: Arc::clone(&benchmarks),
        repository: repository.clone(),
        metrics: Arc::clone(&metrics),
    };
    TestServices {
        services,
        repository,
        benchmarks,
        metrics,
    }
}

/// In-memory history whose inserts wait until [`GatedRepository::open`] is
/// called, holding a retrieve in flight.
pub struct GatedRepository {
    inner: MemoryWorkUnitRepository,
    open: watch::Sender<bool>,
    waiting: AtomicUsize,
}

impl GatedRepository {
    pub fn new() -> Self {
        GatedRepository {
            inner: MemoryWorkUnitRepository::new(),
            open: watch::channel(false).0,
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// Inserts that reached the gate so far.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

impl WorkUnitRepository for GatedRepository {
    fn update<'a>(&'a self, model: &'a WorkUnitModel) -> RepoFuture<'a, u64> {
        Box::pin(async move {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let mut open = self.open.subscribe();
            let _ = open.wait_for(|o| *o).await;
            self.inner.update(model).await
        })
    }

    fn count_completed<'a>(
        &'a self,
        slot: &'a SlotIdentifier,
        since: Option<DateTime<Utc>>,
    ) -> RepoFuture<'a, u64> {
        self.inner.count_completed(slot, since)
    }

    fn count_failed<'a>(
        &'a self,
        slot: &'a SlotIdentifier,
        since: Option<DateTime<Utc>>,
    ) -> RepoFuture<'a, u64> {
        self.inner.count_failed(slot, since)
    }

    fn fetch<'a>(
        &'a self,
        query: &'a WorkUnitQuery,
        bonus: BonusCalculation,
    ) -> RepoFuture<'a, Vec<WorkUnitRow>> {
        self.inner.fetch(query, bonus)
    }
}

// ── Mock FAH client ─────────────────────────────────────────────

/// Frame a message the way the FAH command server does.
pub fn frame(type_name: &str, body: &str) -> String {
    format!("PyON 1 {}\n{}\n---\n", type_name, body)
}

/// Quote log text as a PyON string body.
pub fn log_body(text: &str) -> String {
    serde_json::to_string(&format!("{}\n", text)).unwrap()
}

/// A single-connection stand-in for a FAH v7 client. Records every command
/// line it receives and writes whatever the test pushes.
pub struct MockFahServer {
    pub port: u16,
    commands: Arc<Mutex<Vec<String>>>,
    outgoing: mpsc::UnboundedSender<Option<String>>,
}

impl MockFahServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let commands = Arc::new(Mutex::new(Vec::new()));
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<String>>();

        let recorded = Arc::clone(&commands);
        tokio::spawn(async move {
            let Ok((sock, _)) = listener.accept().await else {
                return;
            };
            let (reader, mut writer) = sock.into_split();
            let _ = writer
                .write_all(b"Welcome to the Folding@home Client command server.\n> ")
                .await;
            tokio::spawn(async move {
                let mut lines = BufReader::new(reader).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    recorded.lock().unwrap().push(line);
                }
            });
            while let Some(Some(text)) = rx.recv().await {
                if writer.write_all(text.as_bytes()).await.is_err() {
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });

        MockFahServer {
            port,
            commands,
            outgoing: tx,
        }
    }

    pub fn send(&self, type_name: &str, body: &str) {
        let _ = self.outgoing.send(Some(frame(type_name, body)));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.outgoing.send(Some(text.to_string()));
    }

    /// Close the server's side of the socket.
    pub fn hang_up(&self) {
        let _ = self.outgoing.send(None);
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Wait until at least `n` commands arrived.
    pub async fn wait_for_commands(&self, n: usize) -> Vec<String> {
        wait_until(|| self.commands().len() >= n).await;
        self.commands()
    }
}

/// Poll `cond` every 10ms for up to 5s. Panics on timeout.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Fixture client state ────────────────────────────────────────

pub const SLOTS: &str = r#"[{"id": "00", "status": "RUNNING", "description": "cpu:4", "options": {}, "reason": "", "idle": False}]"#;

/// WU00 finished project 2669 and is waiting to upload; WU01 folds 2670.
pub const UNITS: &str = r#"[
  {"id": "00", "state": "SEND", "error": "NO_ERROR", "project": 2669, "run": 1, "clone": 2, "gen": 3,
   "core": "0xa7", "unit": "0x0001", "percentdone": "100.00%", "totalframes": 100, "framesdone": 100,
   "assigned": "2020-02-07T16:59:00Z", "timeout": "2020-02-10T16:59:00Z", "deadline": "2020-02-12T16:59:00Z",
   "ws": "1.2.3.4", "cs": "0.0.0.0", "slot": "00", "basecredit": "500"},
  {"id": "01", "state": "RUNNING", "error": "NO_ERROR", "project": 2670, "run": 0, "clone": 1, "gen": 0,
   "core": "0xa7", "unit": "0x0002", "percentdone": "1.00%", "totalframes": 100, "framesdone": 1,
   "assigned": "2020-02-07T18:00:05Z", "timeout": "2020-02-10T18:00:05Z", "deadline": "2020-02-12T18:00:05Z",
   "ws": "1.2.3.4", "cs": "0.0.0.0", "slot": "00", "basecredit": "500"}
]"#;

pub const LOG: &str = "\
*** Log Started 2020-02-07T17:00:00Z ***
17:00:01:Enabled folding slot 00: READY cpu:4
17:00:02:WU00:FS00:Starting
17:00:03:WU00:FS00:0xa7:Project: 2669 (Run 1, Clone 2, Gen 3)
17:00:04:WU00:FS00:0xa7:Completed 0 out of 100000 steps (0%)
17:05:04:WU00:FS00:0xa7:Completed 1000 out of 100000 steps (1%)
17:10:04:WU00:FS00:0xa7:Completed 2000 out of 100000 steps (2%)
17:15:04:WU00:FS00:0xa7:Completed 3000 out of 100000 steps (3%)
18:00:00:WU00:FS00:FahCore returned: FINISHED_UNIT (100 = 0x64)
18:00:06:WU01:FS00:Starting
18:00:07:WU01:FS00:0xa7:Project: 2670 (Run 0, Clone 1, Gen 0)
18:00:08:WU01:FS00:0xa7:Completed 0 out of 100000 steps (0%)
18:06:08:WU01:FS00:0xa7:Completed 1000 out of 100000 steps (1%)";
