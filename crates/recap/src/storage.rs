//! Canonical file layout and durable write helpers.
//!
//! The file tree under the data root is the system of record: recovery after
//! a crash is driven by which files exist and when they were last written.
//! Every write here goes through a tmp-file + rename so a torn write can
//! never corrupt a canonical file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::types::FetchKind;

/// Root of the canonical data tree (`raw/`, `normalized/`, `summaries/`,
/// `state/`). Cheap to clone; holds only the base path.
#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn day_dir(&self, top: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(top)
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
    }

    pub fn raw_day_dir(&self, date: NaiveDate) -> PathBuf {
        self.day_dir("raw", date)
    }

    pub fn raw_path(&self, date: NaiveDate, kind: FetchKind) -> PathBuf {
        self.raw_day_dir(date).join(format!("{}.json", kind.file_stem()))
    }

    pub fn normalized_day_dir(&self, date: NaiveDate) -> PathBuf {
        self.day_dir("normalized", date)
    }

    pub fn activities_path(&self, date: NaiveDate) -> PathBuf {
        self.normalized_day_dir(date).join("activities.jsonl")
    }

    pub fn stats_path(&self, date: NaiveDate) -> PathBuf {
        self.normalized_day_dir(date).join("stats.json")
    }

    pub fn daily_summary_path(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join("summaries")
            .join(format!("{:04}", date.year()))
            .join("daily")
            .join(format!("{:02}-{:02}.md", date.month(), date.day()))
    }

    /// `week` is the ISO week number, zero-padded in the filename.
    pub fn weekly_summary_path(&self, year: i32, week: u32) -> PathBuf {
        self.root
            .join("summaries")
            .join(format!("{year:04}"))
            .join("weekly")
            .join(format!("W{week:02}.md"))
    }

    pub fn monthly_summary_path(&self, year: i32, month: u32) -> PathBuf {
        self.root
            .join("summaries")
            .join(format!("{year:04}"))
            .join("monthly")
            .join(format!("{month:02}.md"))
    }

    pub fn yearly_summary_path(&self, year: i32) -> PathBuf {
        self.root
            .join("summaries")
            .join(format!("{year:04}"))
            .join("yearly.md")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn checkpoints_path(&self) -> PathBuf {
        self.state_dir().join("checkpoints.json")
    }

    pub fn daily_state_path(&self) -> PathBuf {
        self.state_dir().join("daily_state.json")
    }

    pub fn failed_dates_path(&self) -> PathBuf {
        self.state_dir().join("failed_dates.json")
    }

    pub fn batch_jobs_path(&self) -> PathBuf {
        self.state_dir().join("batch_jobs.json")
    }

    pub fn fetch_progress_dir(&self) -> PathBuf {
        self.state_dir().join("fetch_progress")
    }

    pub fn fetch_progress_path(&self, chunk_key: &str) -> PathBuf {
        self.fetch_progress_dir()
            .join(format!("{}.json", slugify(chunk_key)))
    }
}

/// Filesystem-safe rendition of a chunk key such as
/// `"2025-01-01..2025-01-31/prs"`. Runs of non-alphanumeric characters
/// collapse to a single `-`.
pub fn slugify(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut last_dash = false;
    for c in key.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// After a rename the new directory entry still needs a sync to be durable
/// across a crash. Not every platform lets a directory be opened for sync,
/// so this stays best effort.
fn sync_dir_entry(path: &Path) {
    let Some(parent) = path.parent() else {
        return;
    };
    if let Ok(handle) = fs::File::open(parent) {
        let _ = handle.sync_all();
    }
}

/// Stage-then-rename write: the full content lands in a sibling `.tmp` file
/// first, so the canonical path only ever holds a complete snapshot.
fn atomic_write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("could not create parent dir {}", parent.display()))?;
    }

    let staging = path.with_extension("tmp");
    let mut out = fs::File::create(&staging)
        .with_context(|| format!("could not stage write at {}", staging.display()))?;
    out.write_all(data)
        .with_context(|| format!("write to staging file {} failed", staging.display()))?;
    out.sync_all().ok();
    drop(out);

    fs::rename(&staging, path).with_context(|| {
        format!(
            "could not move staged write into place at {}",
            path.display()
        )
    })?;
    sync_dir_entry(path);

    Ok(())
}

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).context("failed to serialize JSON")?;
    atomic_write_bytes(path, &data)
}

pub fn atomic_write_string(path: &Path, content: &str) -> Result<()> {
    atomic_write_bytes(path, content.as_bytes())
}

/// One JSON object per line, written atomically as a whole.
pub fn atomic_write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    let mut buf = Vec::new();
    for item in items {
        serde_json::to_writer(&mut buf, item).context("failed to serialize JSONL record")?;
        buf.push(b'\n');
    }
    atomic_write_bytes(path, &buf)
}

/// Returns `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse JSON {}", path.display()))?;
    Ok(Some(value))
}

/// Returns `Ok(None)` when the file does not exist. Blank lines are skipped.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Option<Vec<T>>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut out = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: T = serde_json::from_str(line)
            .with_context(|| format!("failed to parse line {} of {}", i + 1, path.display()))?;
        out.push(value);
    }
    Ok(Some(out))
}
