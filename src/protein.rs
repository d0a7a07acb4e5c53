//! # Protein — Project Metadata and Project Details Services
//!
//! Two read-through caches over Folding@home project metadata:
//!
//! - [`ProteinService`] maps a project number to its [`Protein`] (base credit,
//!   k-factor, preferred/maximum days, frame count). Production values cannot
//!   be computed without it.
//! - [`ProjectDetailsService`] maps a project number to descriptive
//!   [`ProjectDetails`] (cause, manager) fetched from the FAH web API.
//!
//! Both are constructed by the composition root and handed to sessions as
//! `Arc<dyn ...>`.
//!
//! ## Project Details Refresh Policy
//!
//! | State | Action |
//! |-------|--------|
//! | last success < 24h ago | return cached |
//! | last attempt < 1h ago | return cached (or nothing) without calling the API |
//! | otherwise | fetch; on failure keep the last good value |

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use crate::{lock_or_recover, read_or_recover, write_or_recover, BoxFuture};

/// Default FAH web API root used for project details.
pub const DEFAULT_API_URL: &str = "https://api2.foldingathome.org";

const DETAILS_REFRESH_HOURS: i64 = 24;
const FAILED_REFRESH_HOURS: i64 = 1;

fn default_frames() -> u32 {
    100
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Protein {
    #[serde(alias = "id", alias = "project")]
    pub project_number: u32,
    #[serde(default)]
    pub work_unit_name: String,
    #[serde(default)]
    pub core: String,
    #[serde(default)]
    pub credit: f64,
    #[serde(default, alias = "kfactor")]
    pub k_factor: f64,
    #[serde(default = "default_frames")]
    pub frames: u32,
    #[serde(default, alias = "atoms")]
    pub number_of_atoms: u32,
    #[serde(default, alias = "timeout")]
    pub preferred_days: f64,
    #[serde(default, alias = "deadline")]
    pub maximum_days: f64,
}

impl Protein {
    pub fn new(project_number: u32) -> Self {
        Protein {
            project_number,
            work_unit_name: String::new(),
            core: String::new(),
            credit: 0.0,
            k_factor: 0.0,
            frames: default_frames(),
            number_of_atoms: 0,
            preferred_days: 0.0,
            maximum_days: 0.0,
        }
    }

    /// Enough data to compute production.
    pub fn is_valid(&self) -> bool {
        self.project_number > 0
            && self.frames > 0
            && self.preferred_days > 0.0
            && self.maximum_days > 0.0
    }
}

// ── Protein service ─────────────────────────────────────────────

pub trait ProteinService: Send + Sync {
    /// Cached protein only.
    fn get(&self, project_id: u32) -> Option<Protein>;

    /// Cached protein, refreshing the cache from the source on a miss.
    fn get_or_refresh(&self, project_id: u32) -> BoxFuture<'_, Option<Protein>>;
}

/// Where protein definitions come from.
pub trait ProteinSource: Send + Sync {
    fn fetch_all(&self) -> BoxFuture<'_, Result<Vec<Protein>>>;
}

/// JSON array of proteins fetched over HTTP.
pub struct HttpProteinSource {
    client: reqwest::Client,
    url: String,
}

impl HttpProteinSource {
    pub fn new(url: impl Into<String>) -> Self {
        HttpProteinSource {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl ProteinSource for HttpProteinSource {
    fn fetch_all(&self) -> BoxFuture<'_, Result<Vec<Protein>>> {
        Box::pin(async move {
            let proteins = self
                .client
                .get(&self.url)
                .send()
                .await?
                .error_for_status()?
                .json::<Vec<Protein>>()
                .await
                .with_context(|| format!("decoding proteins from {}", self.url))?;
            Ok(proteins)
        })
    }
}

/// JSON array of proteins read from disk.
pub struct FileProteinSource {
    path: PathBuf,
}

impl FileProteinSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileProteinSource { path: path.into() }
    }
}

impl ProteinSource for FileProteinSource {
    fn fetch_all(&self) -> BoxFuture<'_, Result<Vec<Protein>>> {
        Box::pin(async move {
            let raw = tokio::fs::read_to_string(&self.path)
                .await
                .with_context(|| format!("reading {}", self.path.display()))?;
            let proteins = serde_json::from_str(&raw)
                .with_context(|| format!("decoding {}", self.path.display()))?;
            Ok(proteins)
        })
    }
}

/// In-memory protein cache, optionally backed by a [`ProteinSource`]. Misses
/// refresh the whole cache from the source, at most once per throttle window.
pub struct CachingProteinService {
    proteins: RwLock<HashMap<u32, Protein>>,
    source: Option<Arc<dyn ProteinSource>>,
    last_attempt: Mutex<Option<DateTime<Utc>>>,
    throttle: Duration,
}

impl CachingProteinService {
    pub fn new(source: Option<Arc<dyn ProteinSource>>) -> Self {
        CachingProteinService {
            proteins: RwLock::new(HashMap::new()),
            source,
            last_attempt: Mutex::new(None),
            throttle: Duration::hours(FAILED_REFRESH_HOURS),
        }
    }

    pub fn with_proteins(proteins: impl IntoIterator<Item = Protein>) -> Self {
        let service = CachingProteinService::new(None);
        for p in proteins {
            service.insert(p);
        }
        service
    }

    pub fn insert(&self, protein: Protein) {
        write_or_recover(&self.proteins).insert(protein.project_number, protein);
    }

    pub fn len(&self) -> usize {
        read_or_recover(&self.proteins).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refresh from the source unless an attempt happened within the
    /// throttle window. Returns the number of proteins loaded.
    pub async fn refresh(&self) -> Result<usize> {
        let Some(source) = self.source.as_ref() else {
            return Ok(0);
        };
        {
            let now = Utc::now();
            let mut last = lock_or_recover(&self.last_attempt);
            if last.is_some_and(|t| now - t < self.throttle) {
                return Ok(0);
            }
            *last = Some(now);
        }
        let proteins = source.fetch_all().await?;
        let count = proteins.len();
        let mut map = write_or_recover(&self.proteins);
        for p in proteins {
            map.insert(p.project_number, p);
        }
        tracing::info!(count, "protein cache refreshed");
        Ok(count)
    }
}

impl ProteinService for CachingProteinService {
    fn get(&self, project_id: u32) -> Option<Protein> {
        read_or_recover(&self.proteins).get(&project_id).cloned()
    }

    fn get_or_refresh(&self, project_id: u32) -> BoxFuture<'_, Option<Protein>> {
        Box::pin(async move {
            if let Some(p) = self.get(project_id) {
                return Some(p);
            }
            if let Err(e) = self.refresh().await {
                tracing::warn!(project = project_id, error = %e, "protein refresh failed");
            }
            self.get(project_id)
        })
    }
}

// ── Project details ─────────────────────────────────────────────

/// Entry of the FAH project list: maps a project to its shared description.
#[derive(Clone, Debug, Deserialize)]
pub struct ProjectSummary {
    pub id: u32,
    pub description: u32,
    #[serde(default)]
    pub manager: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectDetails {
    #[serde(default)]
    pub cause: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub manager: String,
    #[serde(default)]
    pub modified: Option<String>,
    #[serde(default)]
    pub projects: String,
    #[serde(skip)]
    pub last_successful_refresh: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_attempted_refresh: Option<DateTime<Utc>>,
}

impl ProjectDetails {
    /// A real API response lists the projects sharing the description.
    pub fn is_populated(&self) -> bool {
        !self.projects.trim().is_empty()
    }
}

pub trait ProjectDetailsSource: Send + Sync {
    fn fetch_projects(&self) -> BoxFuture<'_, Result<Vec<ProjectSummary>>>;
    fn fetch_details(&self, description_id: u32) -> BoxFuture<'_, Result<ProjectDetails>>;
}

pub struct HttpProjectDetailsSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProjectDetailsSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpProjectDetailsSource {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

impl ProjectDetailsSource for HttpProjectDetailsSource {
    fn fetch_projects(&self) -> BoxFuture<'_, Result<Vec<ProjectSummary>>> {
        Box::pin(async move {
            let url = format!("{}/project", self.base_url);
            let projects = self
                .client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await
                .with_context(|| format!("decoding project list from {url}"))?;
            Ok(projects)
        })
    }

    fn fetch_details(&self, description_id: u32) -> BoxFuture<'_, Result<ProjectDetails>> {
        Box::pin(async move {
            let url = format!("{}/project/description/{}", self.base_url, description_id);
            let mut details: ProjectDetails = self
                .client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await
                .with_context(|| format!("decoding project details from {url}"))?;
            details.cause = title_case(&details.cause);
            Ok(details)
        })
    }
}

fn title_case(s: &str) -> String {
    s.split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

pub trait ProjectDetailsService: Send + Sync {
    /// Cached details only.
    fn try_get(&self, project_id: u32) -> Option<ProjectDetails>;

    /// Cached details, refreshed per the refresh policy.
    fn try_get_with_refresh(&self, project_id: u32) -> BoxFuture<'_, Option<ProjectDetails>>;
}

/// Never finds anything.
pub struct NullProjectDetailsService;

impl ProjectDetailsService for NullProjectDetailsService {
    fn try_get(&self, _project_id: u32) -> Option<ProjectDetails> {
        None
    }

    fn try_get_with_refresh(&self, _project_id: u32) -> BoxFuture<'_, Option<ProjectDetails>> {
        Box::pin(async { None })
    }
}

pub struct DefaultProjectDetailsService {
    source: Arc<dyn ProjectDetailsSource>,
    /// project id → description id
    projects: RwLock<HashMap<u32, u32>>,
    /// description id → details
    details: RwLock<HashMap<u32, ProjectDetails>>,
}

impl DefaultProjectDetailsService {
    pub fn new(source: Arc<dyn ProjectDetailsSource>) -> Self {
        DefaultProjectDetailsService {
            source,
            projects: RwLock::new(HashMap::new()),
            details: RwLock::new(HashMap::new()),
        }
    }

    /// Load the project → description mapping. Details cannot be looked up
    /// for projects missing from it.
    pub async fn initialize_project_list(&self) -> Result<usize> {
        let list = self.source.fetch_projects().await?;
        let mut projects = write_or_recover(&self.projects);
        for p in &list {
            projects.insert(p.id, p.description);
        }
        Ok(list.len())
    }

    fn description_id(&self, project_id: u32) -> Option<u32> {
        read_or_recover(&self.projects).get(&project_id).copied()
    }

    pub async fn try_get_with_refresh_at(
        &self,
        project_id: u32,
        now: DateTime<Utc>,
    ) -> Option<ProjectDetails> {
        let description_id = self.description_id(project_id)?;
        let existing = read_or_recover(&self.details).get(&description_id).cloned();
        let good = existing.clone().filter(ProjectDetails::is_populated);

        if let Some(d) = &existing {
            let fresh = d
                .last_successful_refresh
                .is_some_and(|t| now - t < Duration::hours(DETAILS_REFRESH_HOURS));
            if fresh && d.is_populated() {
                return good;
            }
            let recently_tried = d
                .last_attempted_refresh
                .is_some_and(|t| now - t < Duration::hours(FAILED_REFRESH_HOURS));
            if recently_tried {
                return good;
            }
        }

        let fetched = self.source.fetch_details(description_id).await;
        let mut details = write_or_recover(&self.details);
        match fetched {
            Ok(mut d) if d.is_populated() => {
                d.last_successful_refresh = Some(now);
                d.last_attempted_refresh = Some(now);
                details.insert(description_id, d.clone());
                Some(d)
            }
            outcome => {
                if let Err(e) = outcome {
                    tracing::warn!(project = project_id, error = %e, "project details refresh failed");
                }
                let entry = details.entry(description_id).or_default();
                entry.last_attempted_refresh = Some(now);
                good
            }
        }
    }
}

impl ProjectDetailsService for DefaultProjectDetailsService {
    fn try_get(&self, project_id: u32) -> Option<ProjectDetails> {
        let description_id = self.description_id(project_id)?;
        read_or_recover(&self.details)
            .get(&description_id)
            .filter(|d| d.is_populated())
            .cloned()
    }

    fn try_get_with_refresh(&self, project_id: u32) -> BoxFuture<'_, Option<ProjectDetails>> {
        Box::pin(self.try_get_with_refresh_at(project_id, Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeSource {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl FakeSource {
        fn new() -> Arc<Self> {
            Arc::new(FakeSource {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    impl ProjectDetailsSource for FakeSource {
        fn fetch_projects(&self) -> BoxFuture<'_, Result<Vec<ProjectSummary>>> {
            Box::pin(async {
                Ok(vec![ProjectSummary {
                    id: 13851,
                    description: 7,
                    manager: "someone".into(),
                }])
            })
        }

        fn fetch_details(&self, _description_id: u32) -> BoxFuture<'_, Result<ProjectDetails>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail.load(Ordering::SeqCst);
            Box::pin(async move {
                if fail {
                    anyhow::bail!("api down");
                }
                Ok(ProjectDetails {
                    cause: "Cancer".into(),
                    projects: "13851".into(),
                    ..ProjectDetails::default()
                })
            })
        }
    }

    impl ProteinSource for FakeSource {
        fn fetch_all(&self) -> BoxFuture<'_, Result<Vec<Protein>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail.load(Ordering::SeqCst);
            Box::pin(async move {
                if fail {
                    anyhow::bail!("api down");
                }
                let mut p = Protein::new(2669);
                p.preferred_days = 3.0;
                p.maximum_days = 5.0;
                Ok(vec![p])
            })
        }
    }

    async fn service(source: &Arc<FakeSource>) -> DefaultProjectDetailsService {
        let s = DefaultProjectDetailsService::new(source.clone());
        s.initialize_project_list().await.unwrap();
        s
    }

    #[tokio::test]
    async fn unknown_project_is_not_fetched() {
        let source = FakeSource::new();
        let s = service(&source).await;
        assert!(s.try_get_with_refresh(1).await.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fresh_details_are_served_from_cache() {
        let source = FakeSource::new();
        let s = service(&source).await;
        let t0 = Utc::now();
        assert!(s.try_get_with_refresh_at(13851, t0).await.is_some());
        assert!(s.try_get_with_refresh_at(13851, t0 + Duration::hours(23)).await.is_some());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(s.try_get(13851).unwrap().cause, "Cancer");
    }

    #[tokio::test]
    async fn stale_details_are_refreshed_after_a_day() {
        let source = FakeSource::new();
        let s = service(&source).await;
        let t0 = Utc::now();
        s.try_get_with_refresh_at(13851, t0).await;
        s.try_get_with_refresh_at(13851, t0 + Duration::hours(25)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_keeps_last_good_value_and_throttles() {
        let source = FakeSource::new();
        let s = service(&source).await;
        let t0 = Utc::now();
        s.try_get_with_refresh_at(13851, t0).await;

        source.fail.store(true, Ordering::SeqCst);
        let t1 = t0 + Duration::hours(25);
        let kept = s.try_get_with_refresh_at(13851, t1).await;
        assert_eq!(kept.map(|d| d.cause), Some("Cancer".to_string()));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        // within an hour of the failed attempt: no API call
        s.try_get_with_refresh_at(13851, t1 + Duration::minutes(30)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        s.try_get_with_refresh_at(13851, t1 + Duration::minutes(61)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn first_failure_records_attempt() {
        let source = FakeSource::new();
        source.fail.store(true, Ordering::SeqCst);
        let s = service(&source).await;
        let t0 = Utc::now();
        assert!(s.try_get_with_refresh_at(13851, t0).await.is_none());
        assert!(s.try_get_with_refresh_at(13851, t0 + Duration::minutes(5)).await.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(s.try_get(13851).is_none());
    }

    #[tokio::test]
    async fn null_service_finds_nothing() {
        assert!(NullProjectDetailsService.try_get_with_refresh(1).await.is_none());
    }

    #[tokio::test]
    async fn protein_miss_refreshes_from_source() {
        let source = FakeSource::new();
        let s = CachingProteinService::new(Some(source.clone()));
        assert!(s.get(2669).is_none());
        let p = s.get_or_refresh(2669).await.unwrap();
        assert!(p.is_valid());
        // second miss inside the throttle window does not hit the source
        assert!(s.get_or_refresh(9999).await.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn seeded_proteins_need_no_source() {
        let s = CachingProteinService::with_proteins([Protein::new(1)]);
        assert_eq!(s.get_or_refresh(1).await.map(|p| p.frames), Some(100));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn protein_json_accepts_api_field_names() {
        let p: Protein = serde_json::from_str(
            r#"{"id": 2669, "atoms": 1000, "credit": 500.0, "kfactor": 0.75, "timeout": 3, "deadline": 5}"#,
        )
        .unwrap();
        assert_eq!(p.project_number, 2669);
        assert_eq!(p.frames, 100);
        assert!(p.is_valid());
    }

    #[test]
    fn cause_is_title_cased() {
        assert_eq!(title_case("alzheimers disease"), "Alzheimers Disease");
    }
}
