//! Persistent, thread-safe state stores.
//!
//! Each store is one JSON file mutated under an exclusive lock with a
//! read-modify-write pattern, so multiple worker threads can share a store
//! handle. Writes are atomic (tmp + rename); a crash between operations
//! leaves the previous consistent snapshot on disk.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};

use crate::storage::{DataRoot, atomic_write_json, read_json};
use crate::types::{
    BatchRecord, BatchStatus, DayTimestamps, ErrorClass, FailureRecord, RecapError, Stage,
};

/// Last successfully completed date per stage. Updates obey a monotonicity
/// guard: a smaller date never overwrites a larger one, so out-of-order
/// workers cannot rewind the checkpoint.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(root: &DataRoot) -> Self {
        Self {
            path: root.checkpoints_path(),
            lock: Mutex::new(()),
        }
    }

    pub fn get(&self, stage: Stage) -> Result<Option<NaiveDate>> {
        let _g = self.lock.lock().unwrap();
        let map: BTreeMap<String, NaiveDate> = read_json(&self.path)?.unwrap_or_default();
        Ok(map.get(stage.checkpoint_key()).copied())
    }

    pub fn all(&self) -> Result<BTreeMap<String, NaiveDate>> {
        let _g = self.lock.lock().unwrap();
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    /// Returns true when the checkpoint advanced. ISO date strings compare
    /// the same way the dates do, so the on-disk form stays human-auditable.
    pub fn update(&self, stage: Stage, date: NaiveDate) -> Result<bool> {
        let _g = self.lock.lock().unwrap();
        let mut map: BTreeMap<String, NaiveDate> = read_json(&self.path)?.unwrap_or_default();
        let key = stage.checkpoint_key();
        if let Some(existing) = map.get(key)
            && *existing >= date
        {
            return Ok(false);
        }
        map.insert(key.to_string(), date);
        atomic_write_json(&self.path, &map)?;
        Ok(true)
    }
}

/// Per-date stage timestamps; defines the cascade staleness predicates.
#[derive(Debug)]
pub struct DailyStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DailyStateStore {
    pub fn new(root: &DataRoot) -> Self {
        Self {
            path: root.daily_state_path(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<BTreeMap<NaiveDate, DayTimestamps>> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    pub fn get(&self, date: NaiveDate) -> Result<Option<DayTimestamps>> {
        let _g = self.lock.lock().unwrap();
        Ok(self.load()?.get(&date).cloned())
    }

    pub fn set(&self, date: NaiveDate, stage: Stage, at: DateTime<Utc>) -> Result<()> {
        let _g = self.lock.lock().unwrap();
        let mut map = self.load()?;
        map.entry(date).or_default().set(stage, at);
        atomic_write_json(&self.path, &map)
    }

    /// A date needs fetching when it has never been fetched, or when the
    /// fetch ran on or before the target date itself (evening activity may
    /// post after a same-day fetch).
    pub fn fetch_stale(&self, date: NaiveDate) -> Result<bool> {
        let _g = self.lock.lock().unwrap();
        Ok(Self::fetch_stale_in(&self.load()?, date))
    }

    fn fetch_stale_in(map: &BTreeMap<NaiveDate, DayTimestamps>, date: NaiveDate) -> bool {
        match map.get(&date).and_then(|ts| ts.fetched_at) {
            None => true,
            Some(fetched) => fetched.date_naive() <= date,
        }
    }

    /// Cascade: re-normalize when the fetch timestamp is newer.
    pub fn normalize_stale(&self, date: NaiveDate) -> Result<bool> {
        let _g = self.lock.lock().unwrap();
        Ok(Self::downstream_stale_in(
            &self.load()?,
            date,
            Stage::Fetch,
            Stage::Normalize,
        ))
    }

    /// Cascade: re-summarize when the normalize timestamp is newer.
    pub fn summarize_stale(&self, date: NaiveDate) -> Result<bool> {
        let _g = self.lock.lock().unwrap();
        Ok(Self::downstream_stale_in(
            &self.load()?,
            date,
            Stage::Normalize,
            Stage::Summarize,
        ))
    }

    fn downstream_stale_in(
        map: &BTreeMap<NaiveDate, DayTimestamps>,
        date: NaiveDate,
        upstream: Stage,
        downstream: Stage,
    ) -> bool {
        let Some(ts) = map.get(&date) else {
            return false;
        };
        match (ts.get(upstream), ts.get(downstream)) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(up), Some(down)) => up > down,
        }
    }

    /// Subset of `dates` needing work at `stage`, evaluated against one
    /// snapshot of the file.
    pub fn stale_dates(&self, dates: &[NaiveDate], stage: Stage) -> Result<Vec<NaiveDate>> {
        let _g = self.lock.lock().unwrap();
        let map = self.load()?;
        Ok(dates
            .iter()
            .copied()
            .filter(|d| match stage {
                Stage::Fetch => Self::fetch_stale_in(&map, *d),
                Stage::Normalize => {
                    Self::downstream_stale_in(&map, *d, Stage::Fetch, Stage::Normalize)
                }
                Stage::Summarize => {
                    Self::downstream_stale_in(&map, *d, Stage::Normalize, Stage::Summarize)
                }
            })
            .collect())
    }
}

/// Permanent-vs-retryable failure ledger with attempt counts.
#[derive(Debug)]
pub struct FailedDateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FailedDateStore {
    pub fn new(root: &DataRoot) -> Self {
        Self {
            path: root.failed_dates_path(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<BTreeMap<NaiveDate, FailureRecord>> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    pub fn get(&self, date: NaiveDate) -> Result<Option<FailureRecord>> {
        let _g = self.lock.lock().unwrap();
        Ok(self.load()?.get(&date).cloned())
    }

    pub fn record_failure(&self, date: NaiveDate, phase: Stage, error: &RecapError) -> Result<()> {
        let _g = self.lock.lock().unwrap();
        let mut map = self.load()?;
        let class = error.class();
        match map.get_mut(&date) {
            Some(rec) => {
                rec.phase = phase;
                rec.last_error = error.to_string();
                rec.attempt_count += 1;
                rec.classified_as = class;
            }
            None => {
                map.insert(
                    date,
                    FailureRecord {
                        phase,
                        last_error: error.to_string(),
                        attempt_count: 1,
                        classified_as: class,
                        first_failure_at: Utc::now(),
                    },
                );
            }
        }
        atomic_write_json(&self.path, &map)
    }

    pub fn record_success(&self, date: NaiveDate, _phase: Stage) -> Result<()> {
        let _g = self.lock.lock().unwrap();
        let mut map = self.load()?;
        if map.remove(&date).is_some() {
            atomic_write_json(&self.path, &map)?;
        }
        Ok(())
    }

    /// Candidates worth attempting: no record at all, or retryable with
    /// attempts under the cap. Permanent entries are never retried.
    pub fn retryable_dates(
        &self,
        candidates: &[NaiveDate],
        max_retries: u32,
    ) -> Result<Vec<NaiveDate>> {
        let _g = self.lock.lock().unwrap();
        let map = self.load()?;
        Ok(candidates
            .iter()
            .copied()
            .filter(|d| match map.get(d) {
                None => true,
                Some(rec) => {
                    rec.classified_as == ErrorClass::Retryable && rec.attempt_count < max_retries
                }
            })
            .collect())
    }

    /// Every recorded failure, for read-only status surfaces.
    pub fn all(&self) -> Result<BTreeMap<NaiveDate, FailureRecord>> {
        let _g = self.lock.lock().unwrap();
        self.load()
    }

    /// Dates that will not self-heal: permanent, or retryable at the cap.
    pub fn exhausted_dates(&self, max_retries: u32) -> Result<Vec<(NaiveDate, FailureRecord)>> {
        let _g = self.lock.lock().unwrap();
        Ok(self
            .load()?
            .into_iter()
            .filter(|(_, rec)| {
                rec.classified_as == ErrorClass::Permanent || rec.attempt_count >= max_retries
            })
            .collect())
    }
}

/// Per-chunk search-result cache for resumable range fetches. One file per
/// chunk key (`"{since}..{until}/{kind}"`), cleared once the chunk's dates
/// all land.
#[derive(Debug)]
pub struct FetchProgressStore {
    root: DataRoot,
    lock: Mutex<()>,
}

impl FetchProgressStore {
    pub fn new(root: &DataRoot) -> Self {
        Self {
            root: root.clone(),
            lock: Mutex::new(()),
        }
    }

    pub fn chunk_key(since: NaiveDate, until: NaiveDate, kind: crate::types::FetchKind) -> String {
        format!("{since}..{until}/{kind}")
    }

    pub fn save(&self, key: &str, items: &[serde_json::Value]) -> Result<()> {
        let _g = self.lock.lock().unwrap();
        atomic_write_json(&self.root.fetch_progress_path(key), &items)
    }

    pub fn load(&self, key: &str) -> Result<Option<Vec<serde_json::Value>>> {
        let _g = self.lock.lock().unwrap();
        read_json(&self.root.fetch_progress_path(key))
    }

    pub fn clear(&self, key: &str) -> Result<()> {
        let _g = self.lock.lock().unwrap();
        let path = self.root.fetch_progress_path(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| anyhow::anyhow!("failed to remove {}: {e}", path.display()))?;
        }
        Ok(())
    }
}

/// Provider batch ids persisted for crash recovery.
#[derive(Debug)]
pub struct BatchJobStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl BatchJobStore {
    pub fn new(root: &DataRoot) -> Self {
        Self {
            path: root.batch_jobs_path(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, BatchRecord>> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    pub fn save(&self, id: &str, record: BatchRecord) -> Result<()> {
        let _g = self.lock.lock().unwrap();
        let mut map = self.load()?;
        map.insert(id.to_string(), record);
        atomic_write_json(&self.path, &map)
    }

    pub fn update_status(&self, id: &str, status: BatchStatus) -> Result<()> {
        let _g = self.lock.lock().unwrap();
        let mut map = self.load()?;
        if let Some(rec) = map.get_mut(id) {
            rec.status = status;
            atomic_write_json(&self.path, &map)?;
        }
        Ok(())
    }

    /// Jobs still worth polling; terminal entries are filtered out.
    pub fn active_jobs(&self) -> Result<BTreeMap<String, BatchRecord>> {
        let _g = self.lock.lock().unwrap();
        Ok(self
            .load()?
            .into_iter()
            .filter(|(_, rec)| !rec.status.is_terminal())
            .collect())
    }
}

/// Convenience bundle: every store rooted at the same data tree.
#[derive(Debug)]
pub struct Stores {
    pub checkpoints: CheckpointStore,
    pub daily: DailyStateStore,
    pub failed: FailedDateStore,
    pub progress: FetchProgressStore,
    pub batches: BatchJobStore,
}

impl Stores {
    pub fn new(root: &DataRoot) -> Self {
        Self {
            checkpoints: CheckpointStore::new(root),
            daily: DailyStateStore::new(root),
            failed: FailedDateStore::new(root),
            progress: FetchProgressStore::new(root),
            batches: BatchJobStore::new(root),
        }
    }
}
