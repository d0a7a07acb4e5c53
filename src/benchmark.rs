//! # Benchmark — Per-Project Frame Time History
//!
//! Keeps the most recent frame durations each slot produced for each
//! project, so PPD estimates survive restarts and can be compared across
//! slots. Shared by every client session.
//!
//! ## Ring
//!
//! A [`ProteinBenchmark`] holds up to [`MAX_FRAMES`] durations, newest first.
//! When full, the oldest is evicted. Non-positive durations are rejected. The
//! minimum is updated as durations arrive; the average is computed on read in
//! whole seconds.
//!
//! ## Concurrency
//!
//! The map of benchmarks sits behind an `RwLock`; each benchmark behind its
//! own `Mutex`, so sessions updating different projects never contend on
//! more than the map read lock.
//!
//! ## Cache File
//!
//! `save`/`load` persist the repository as JSON wrapped in an envelope with a
//! SHA-256 checksum. Writes go to a `.tmp` file which is renamed into place;
//! the previous file is kept as `.1` and used when the current one fails
//! verification.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::slot::SlotIdentifier;
use crate::{lock_or_recover, read_or_recover, write_or_recover};

/// Frame durations retained per benchmark.
pub const MAX_FRAMES: usize = 300;

/// Backup generations kept next to the cache file.
const GENERATIONS: usize = 2;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BenchmarkIdentifier {
    pub slot: SlotIdentifier,
    pub project_id: u32,
}

impl BenchmarkIdentifier {
    pub fn new(slot: SlotIdentifier, project_id: u32) -> Self {
        BenchmarkIdentifier { slot, project_id }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProteinBenchmark {
    minimum: Duration,
    frame_times: VecDeque<Duration>,
}

impl ProteinBenchmark {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame duration. Returns false (and records nothing) for a
    /// zero duration.
    pub fn set_frame_duration(&mut self, duration: Duration) -> bool {
        if duration.is_zero() {
            return false;
        }
        if self.minimum.is_zero() || duration < self.minimum {
            self.minimum = duration;
        }
        if self.frame_times.len() == MAX_FRAMES {
            self.frame_times.pop_back();
        }
        self.frame_times.push_front(duration);
        true
    }

    pub fn minimum_frame_time(&self) -> Duration {
        self.minimum
    }

    /// Mean of retained durations, truncated to whole seconds.
    pub fn average_frame_time(&self) -> Duration {
        if self.frame_times.is_empty() {
            return Duration::ZERO;
        }
        let total: u64 = self.frame_times.iter().map(|d| d.as_secs()).sum();
        Duration::from_secs(total / self.frame_times.len() as u64)
    }

    /// Newest first.
    pub fn frame_times(&self) -> impl Iterator<Item = &Duration> {
        self.frame_times.iter()
    }

    pub fn len(&self) -> usize {
        self.frame_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_times.is_empty()
    }

    /// Recompute the minimum from the retained durations.
    pub fn update_minimum_frame_time(&mut self) {
        if let Some(min) = self.frame_times.iter().min() {
            self.minimum = *min;
        }
    }
}

#[derive(Default)]
pub struct BenchmarkRepository {
    benchmarks: RwLock<HashMap<BenchmarkIdentifier, Arc<Mutex<ProteinBenchmark>>>>,
}

impl BenchmarkRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when any project has a benchmark for `slot`.
    pub fn contains(&self, slot: &SlotIdentifier) -> bool {
        read_or_recover(&self.benchmarks)
            .keys()
            .any(|id| &id.slot == slot)
    }

    pub fn get_benchmark_projects(&self, slot: &SlotIdentifier) -> Vec<u32> {
        let mut projects: Vec<u32> = read_or_recover(&self.benchmarks)
            .keys()
            .filter(|id| &id.slot == slot)
            .map(|id| id.project_id)
            .collect();
        projects.sort_unstable();
        projects
    }

    /// Snapshot of one benchmark.
    pub fn get_benchmark(&self, id: &BenchmarkIdentifier) -> Option<ProteinBenchmark> {
        let entry = read_or_recover(&self.benchmarks).get(id).cloned()?;
        let benchmark = lock_or_recover(&entry).clone();
        Some(benchmark)
    }

    /// Record `durations` for `project_id` on `slot`, creating the benchmark
    /// on first use. Returns how many durations were accepted.
    pub fn update(
        &self,
        slot: &SlotIdentifier,
        project_id: u32,
        durations: impl IntoIterator<Item = Duration>,
    ) -> usize {
        let id = BenchmarkIdentifier::new(slot.clone(), project_id);
        let existing = read_or_recover(&self.benchmarks).get(&id).cloned();
        let entry = match existing {
            Some(entry) => entry,
            None => write_or_recover(&self.benchmarks)
                .entry(id)
                .or_default()
                .clone(),
        };
        let mut benchmark = lock_or_recover(&entry);
        durations
            .into_iter()
            .filter(|d| benchmark.set_frame_duration(*d))
            .count()
    }

    /// Drop every benchmark recorded for one client. Returns how many went.
    pub fn remove_client(&self, client_name: &str, client_path: &str) -> usize {
        let mut benchmarks = write_or_recover(&self.benchmarks);
        let before = benchmarks.len();
        benchmarks.retain(|id, _| {
            id.slot.client_name != client_name || id.slot.client_path != client_path
        });
        before - benchmarks.len()
    }

    pub fn len(&self) -> usize {
        read_or_recover(&self.benchmarks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Cache file ──────────────────────────────────────────────

    fn records(&self) -> Vec<BenchmarkRecord> {
        let map = read_or_recover(&self.benchmarks);
        let mut records: Vec<BenchmarkRecord> = map
            .iter()
            .map(|(id, b)| {
                let b = lock_or_recover(b);
                BenchmarkRecord {
                    id: id.clone(),
                    minimum_secs: b.minimum.as_secs(),
                    frame_secs: b.frame_times.iter().map(|d| d.as_secs()).collect(),
                }
            })
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Write the repository to `path` atomically, rotating the previous file
    /// to `<path>.1`.
    pub fn save(&self, path: &Path) -> Result<()> {
        for gen in (1..GENERATIONS).rev() {
            let src = generation_path(path, gen - 1);
            if src.exists() {
                let _ = fs::rename(&src, generation_path(path, gen));
            }
        }

        let data = serde_json::to_value(self.records())?;
        let checksum = sha256_hex(&serde_json::to_string_pretty(&data)?);
        let json = serde_json::to_string_pretty(&CacheEnvelope { checksum, data })?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
        Ok(())
    }

    /// Load the newest cache generation that verifies. A missing file yields
    /// an empty repository.
    pub fn load(path: &Path) -> BenchmarkRepository {
        let repo = BenchmarkRepository::new();
        for gen in 0..GENERATIONS {
            let p = generation_path(path, gen);
            match load_records(&p) {
                Ok(Some(records)) => {
                    if gen > 0 {
                        tracing::warn!(path = %p.display(), "recovered benchmark cache from backup");
                    }
                    let mut map = write_or_recover(&repo.benchmarks);
                    for record in records {
                        let mut benchmark = ProteinBenchmark {
                            minimum: Duration::from_secs(record.minimum_secs),
                            frame_times: record
                                .frame_secs
                                .into_iter()
                                .take(MAX_FRAMES)
                                .map(Duration::from_secs)
                                .collect(),
                        };
                        if benchmark.minimum.is_zero() {
                            benchmark.update_minimum_frame_time();
                        }
                        map.insert(record.id, Arc::new(Mutex::new(benchmark)));
                    }
                    drop(map);
                    return repo;
                }
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "benchmark cache unreadable");
                }
            }
        }
        repo
    }
}

#[derive(Serialize, Deserialize)]
struct BenchmarkRecord {
    id: BenchmarkIdentifier,
    minimum_secs: u64,
    frame_secs: Vec<u64>,
}

#[derive(Serialize, Deserialize)]
struct CacheEnvelope {
    checksum: String,
    data: serde_json::Value,
}

fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn generation_path(base: &Path, gen: usize) -> PathBuf {
    if gen == 0 {
        base.to_path_buf()
    } else {
        let mut p = base.as_os_str().to_os_string();
        p.push(format!(".{}", gen));
        PathBuf::from(p)
    }
}

/// `Ok(None)` when the file does not exist.
fn load_records(path: &Path) -> Result<Option<Vec<BenchmarkRecord>>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    let envelope: CacheEnvelope = serde_json::from_str(&raw)?;
    let expected = sha256_hex(&serde_json::to_string_pretty(&envelope.data)?);
    if expected != envelope.checksum {
        anyhow::bail!("checksum mismatch");
    }
    Ok(Some(serde_json::from_value(envelope.data)?))
}
