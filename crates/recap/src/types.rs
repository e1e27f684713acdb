//! Domain types: raw host entities, normalized activities, daily statistics,
//! state-store records, and the error union surfaced at the crate boundary.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Deserialize a Duration from either a string (human-readable) or u64 (milliseconds)
pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {}", e))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Serialize a Duration as milliseconds (u64) so it roundtrips with deserialize_duration
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

// ---------------------------------------------------------------------------
// Pipeline vocabulary
// ---------------------------------------------------------------------------

/// The three pipeline stages, in data-flow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Normalize,
    Summarize,
}

impl Stage {
    /// Key under which this stage's checkpoint is stored.
    pub fn checkpoint_key(&self) -> &'static str {
        match self {
            Stage::Fetch => "last_fetch_date",
            Stage::Normalize => "last_normalize_date",
            Stage::Summarize => "last_summarize_date",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Normalize => "normalize",
            Stage::Summarize => "summarize",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which raw sources a fetch touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchKind {
    Prs,
    Commits,
    Issues,
}

impl FetchKind {
    pub const ALL: [FetchKind; 3] = [FetchKind::Prs, FetchKind::Commits, FetchKind::Issues];

    pub fn file_stem(&self) -> &'static str {
        match self {
            FetchKind::Prs => "prs",
            FetchKind::Commits => "commits",
            FetchKind::Issues => "issues",
        }
    }

    pub fn parse(s: &str) -> Option<FetchKind> {
        match s {
            "prs" | "pr" => Some(FetchKind::Prs),
            "commits" | "commit" => Some(FetchKind::Commits),
            "issues" | "issue" => Some(FetchKind::Issues),
            _ => None,
        }
    }
}

impl std::fmt::Display for FetchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// Optional source filter. `None` means all kinds.
pub type TypeFilter = Option<Vec<FetchKind>>;

pub fn kind_enabled(filter: &TypeFilter, kind: FetchKind) -> bool {
    match filter {
        None => true,
        Some(kinds) => kinds.contains(&kind),
    }
}

/// Per-date status row returned by every range method.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DateOutcome {
    pub date: NaiveDate,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DateOutcome {
    pub fn success(date: NaiveDate) -> Self {
        Self {
            date,
            status: OutcomeStatus::Success,
            error: None,
        }
    }

    pub fn skipped(date: NaiveDate) -> Self {
        Self {
            date,
            status: OutcomeStatus::Skipped,
            error: None,
        }
    }

    pub fn failed(date: NaiveDate, error: impl Into<String>) -> Self {
        Self {
            date,
            status: OutcomeStatus::Failed,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Skipped,
    Failed,
}

// ---------------------------------------------------------------------------
// Raw entities (written to raw/{date}/{prs,commits,issues}.json)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Added,
    Modified,
    Removed,
    Renamed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileChange {
    pub filename: String,
    pub additions: u64,
    pub deletions: u64,
    pub status: ChangeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Comment {
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Review {
    pub author: String,
    pub state: ReviewState,
    pub body: String,
    pub submitted_at: DateTime<Utc>,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
    pub api_url: String,
    /// `owner/name`.
    pub repo: String,
    /// `open` or `closed`.
    pub state: String,
    pub merged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
    pub author: String,
    pub labels: Vec<String>,
    pub body: String,
    pub files: Vec<FileChange>,
    pub comments: Vec<Comment>,
    pub reviews: Vec<Review>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Commit {
    pub sha: String,
    pub html_url: String,
    pub api_url: String,
    pub message: String,
    pub author: String,
    pub repo: String,
    pub committed_at: DateTime<Utc>,
    pub files: Vec<FileChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issue {
    pub number: u64,
    pub html_url: String,
    pub api_url: String,
    pub title: String,
    pub body: String,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    pub repo: String,
    pub labels: Vec<String>,
    pub author: String,
    pub comments: Vec<Comment>,
}

// ---------------------------------------------------------------------------
// Normalized entities (activities.jsonl + stats.json)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    PrAuthored,
    PrReviewed,
    PrCommented,
    Commit,
    IssueAuthored,
    IssueCommented,
}

impl ActivityKind {
    pub fn label(&self) -> &'static str {
        match self {
            ActivityKind::PrAuthored => "pr_authored",
            ActivityKind::PrReviewed => "pr_reviewed",
            ActivityKind::PrCommented => "pr_commented",
            ActivityKind::Commit => "commit",
            ActivityKind::IssueAuthored => "issue_authored",
            ActivityKind::IssueCommented => "issue_commented",
        }
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Bugfix,
    Feature,
    Refactor,
    Docs,
    Chore,
    Test,
    Config,
    Perf,
    Security,
    Other,
}

impl Intent {
    pub fn label(&self) -> &'static str {
        match self {
            Intent::Bugfix => "bugfix",
            Intent::Feature => "feature",
            Intent::Refactor => "refactor",
            Intent::Docs => "docs",
            Intent::Chore => "chore",
            Intent::Test => "test",
            Intent::Config => "config",
            Intent::Perf => "perf",
            Intent::Security => "security",
            Intent::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Intent> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bugfix" | "fix" => Some(Intent::Bugfix),
            "feature" | "feat" => Some(Intent::Feature),
            "refactor" => Some(Intent::Refactor),
            "docs" => Some(Intent::Docs),
            "chore" => Some(Intent::Chore),
            "test" => Some(Intent::Test),
            "config" => Some(Intent::Config),
            "perf" => Some(Intent::Perf),
            "security" => Some(Intent::Security),
            "other" => Some(Intent::Other),
            _ => None,
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// One normalized user action on a specific day.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Activity {
    pub ts: DateTime<Utc>,
    pub kind: ActivityKind,
    pub repo: String,
    /// PR or issue number; 0 for commits.
    pub number: u64,
    pub title: String,
    pub url: String,
    /// Machine-generated one-liner; never produced by a model.
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    #[serde(default)]
    pub labels: Vec<String>,
    /// Review/comment urls that support this activity.
    #[serde(default)]
    pub evidence_urls: Vec<String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub review_bodies: Vec<String>,
    #[serde(default)]
    pub comment_bodies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PrRef {
    pub url: String,
    pub title: String,
    pub repo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CommitRef {
    pub url: String,
    pub title: String,
    pub repo: String,
    pub sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IssueRef {
    pub url: String,
    pub title: String,
    pub repo: String,
}

/// Per-source statistics block. GitHub is the only populated source today;
/// the nesting leaves room for more.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SourceStats {
    pub authored_count: u64,
    pub reviewed_count: u64,
    pub commented_count: u64,
    pub commit_count: u64,
    pub issues_authored_count: u64,
    pub issues_commented_count: u64,
    /// Summed over authored PRs and commits only; reviewed/commented PRs and
    /// issues do not contribute line counts.
    pub total_additions: u64,
    pub total_deletions: u64,
    /// Sorted, distinct.
    pub repos_touched: Vec<String>,
    pub authored_prs: Vec<PrRef>,
    pub reviewed_prs: Vec<PrRef>,
    pub commits: Vec<CommitRef>,
    pub authored_issues: Vec<IssueRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub github: SourceStats,
}

// ---------------------------------------------------------------------------
// State-store records
// ---------------------------------------------------------------------------

/// Per-date stage timestamps driving cascade staleness.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct DayTimestamps {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarized_at: Option<DateTime<Utc>>,
}

impl DayTimestamps {
    pub fn get(&self, stage: Stage) -> Option<DateTime<Utc>> {
        match stage {
            Stage::Fetch => self.fetched_at,
            Stage::Normalize => self.normalized_at,
            Stage::Summarize => self.summarized_at,
        }
    }

    pub fn set(&mut self, stage: Stage, at: DateTime<Utc>) {
        match stage {
            Stage::Fetch => self.fetched_at = Some(at),
            Stage::Normalize => self.normalized_at = Some(at),
            Stage::Summarize => self.summarized_at = Some(at),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureRecord {
    pub phase: Stage,
    pub last_error: String,
    pub attempt_count: u32,
    pub classified_as: ErrorClass,
    pub first_failure_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BatchStatus::InProgress)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchRecord {
    pub provider: String,
    pub task: String,
    pub submitted_at: DateTime<Utc>,
    pub status: BatchStatus,
    pub custom_id_prefix: String,
    pub size: usize,
}

// ---------------------------------------------------------------------------
// Error union
// ---------------------------------------------------------------------------

/// Terminal failure of one host-API operation, after retries.
#[derive(Debug, Clone, Error)]
#[error("{endpoint}: {reason} (attempts={attempts})")]
pub struct FetchError {
    pub reason: String,
    pub endpoint: String,
    pub attempts: u32,
    #[source]
    pub status: Option<HttpStatus>,
    /// True when the terminal status was produced by rate limiting; a 403
    /// reached this way stays retryable.
    pub rate_limited: bool,
}

/// Newtype so the status can double as an error source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("HTTP status {0}")]
pub struct HttpStatus(pub u16);

impl FetchError {
    pub fn status_code(&self) -> Option<u16> {
        self.status.map(|s| s.0)
    }
}

#[derive(Debug, Error)]
#[error("normalize {date}: {reason}")]
pub struct NormalizeError {
    pub date: NaiveDate,
    pub reason: String,
    pub status: Option<u16>,
}

#[derive(Debug, Error)]
#[error("summarize {target}: {reason}")]
pub struct SummarizeError {
    /// What was being summarized: a date, `W{NN}`, a month, a year, or `query`.
    pub target: String,
    pub reason: String,
    pub status: Option<u16>,
}

/// Tagged union surfaced at the crate boundary. Retryable-vs-permanent is
/// inferable from the subtype and the embedded status via [`RecapError::class`].
#[derive(Debug, Error)]
pub enum RecapError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Summarize(#[from] SummarizeError),
    #[error("step {step} failed: {source}")]
    Step {
        step: Stage,
        #[source]
        source: Box<RecapError>,
    },
    #[error("storage: {0:#}")]
    Storage(anyhow::Error),
}

impl RecapError {
    pub fn step(step: Stage, source: RecapError) -> Self {
        RecapError::Step {
            step,
            source: Box::new(source),
        }
    }

    /// HTTP status embedded anywhere in the chain, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            RecapError::Fetch(e) => e.status_code(),
            RecapError::Normalize(e) => e.status,
            RecapError::Summarize(e) => e.status,
            RecapError::Step { source, .. } => source.status(),
            RecapError::Storage(_) => None,
        }
    }

    fn rate_limited(&self) -> bool {
        match self {
            RecapError::Fetch(e) => e.rate_limited,
            RecapError::Step { source, .. } => source.rate_limited(),
            _ => false,
        }
    }

    /// Permanent: 404, 422, and 403 not caused by rate limiting. Everything
    /// else (timeouts, 429, 5xx, network errors, storage) is retryable.
    pub fn class(&self) -> ErrorClass {
        match self.status() {
            Some(404) | Some(422) => ErrorClass::Permanent,
            Some(403) if !self.rate_limited() => ErrorClass::Permanent,
            _ => ErrorClass::Retryable,
        }
    }
}
