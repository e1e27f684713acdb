//! Fetcher: populates `raw/{date}/{prs,commits,issues}.json` for requested
//! dates via chunked search plus per-item enrichment.
//!
//! Range runs search once per monthly chunk per kind, buffering results in
//! the fetch-progress cache so an interrupted backfill never repeats the
//! search phase. A chunk search that fails after retries degrades to
//! day-scoped searches inside the per-date workers, which keeps failures
//! isolated to single dates.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, LazyLock, Mutex};
use std::thread;

use chrono::{Datelike, NaiveDate, Utc};
use regex::RegexSet;
use serde_json::Value;

use crate::config::RecapConfig;
use crate::host::{ClientPool, CommentPayload, FilePayload, HostClient, ReviewPayload};
use crate::report::Reporter;
use crate::state::{FetchProgressStore, Stores};
use crate::storage::{DataRoot, atomic_write_json};
use crate::types::{
    ChangeStatus, Comment, Commit, DateOutcome, FetchError, FetchKind, FileChange, Issue,
    PullRequest, RecapError, Review, ReviewState, Stage, TypeFilter, kind_enabled,
};

static NOISE_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)^LGTM!?$",
        r"^\+1$",
        r"^:shipit:$",
        r"(?i)^Ship it!?$",
    ])
    .expect("noise patterns compile")
});

/// Drops empty and pure-acknowledgement comment bodies.
pub fn is_noise_comment(body: &str) -> bool {
    let trimmed = body.trim();
    trimmed.is_empty() || NOISE_PATTERNS.is_match(trimmed)
}

/// Automation accounts by login convention.
pub fn is_bot_login(login: &str) -> bool {
    login.ends_with("[bot]") || login.ends_with("-bot")
}

/// Inclusive day sequence; empty when `since > until`.
pub fn date_range(since: NaiveDate, until: NaiveDate) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut d = since;
    while d <= until {
        out.push(d);
        match d.succ_opt() {
            Some(next) => d = next,
            None => break,
        }
    }
    out
}

/// Partition into monthly chunks clipped to the range.
pub fn month_chunks(since: NaiveDate, until: NaiveDate) -> Vec<(NaiveDate, NaiveDate)> {
    let mut out = Vec::new();
    let mut start = since;
    while start <= until {
        let month_end = last_day_of_month(start);
        let end = month_end.min(until);
        out.push((start, end));
        match end.succ_opt() {
            Some(next) => start = next,
            None => break,
        }
    }
    out
}

fn last_day_of_month(d: NaiveDate) -> NaiveDate {
    let (y, m) = (d.year(), d.month());
    let first_of_next = if m == 12 {
        NaiveDate::from_ymd_opt(y + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(y, m + 1, 1)
    };
    first_of_next
        .and_then(|f| f.pred_opt())
        .expect("valid month end")
}

// -- search item helpers ----------------------------------------------------

fn item_str<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key).and_then(Value::as_str)
}

fn item_number(item: &Value) -> Option<u64> {
    item.get("number").and_then(Value::as_u64)
}

/// `owner/name` from a REST api url such as `.../repos/owner/name/...`, or
/// from the embedded repository object on commit-search items.
fn item_repo(item: &Value) -> Option<String> {
    if let Some(url) = item_str(item, "repository_url") {
        return repo_from_api_url(url);
    }
    item.pointer("/repository/full_name")
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub(crate) fn repo_from_api_url(url: &str) -> Option<String> {
    let segments: Vec<&str> = url.split('/').filter(|s| !s.is_empty()).collect();
    let idx = segments.iter().rposition(|s| *s == "repos")?;
    let owner = segments.get(idx + 1)?;
    let name = segments.get(idx + 2)?;
    Some(format!("{owner}/{name}"))
}

fn item_day(kind: FetchKind, item: &Value) -> Option<NaiveDate> {
    let raw = match kind {
        FetchKind::Prs | FetchKind::Issues => item_str(item, "updated_at")?,
        FetchKind::Commits => item
            .pointer("/commit/committer/date")
            .and_then(Value::as_str)?,
    };
    raw.parse::<chrono::DateTime<Utc>>()
        .ok()
        .map(|dt| dt.date_naive())
}

fn dedup_key(kind: FetchKind, item: &Value) -> Option<String> {
    match kind {
        FetchKind::Commits => item_str(item, "sha").map(str::to_string),
        _ => item_str(item, "url").map(str::to_string),
    }
}

// -- payload conversion -----------------------------------------------------

fn parse_change_status(status: &str) -> ChangeStatus {
    match status {
        "added" => ChangeStatus::Added,
        "removed" => ChangeStatus::Removed,
        "renamed" => ChangeStatus::Renamed,
        _ => ChangeStatus::Modified,
    }
}

fn parse_review_state(state: &str) -> Option<ReviewState> {
    match state {
        "APPROVED" => Some(ReviewState::Approved),
        "CHANGES_REQUESTED" => Some(ReviewState::ChangesRequested),
        "COMMENTED" => Some(ReviewState::Commented),
        _ => None,
    }
}

fn convert_files(files: Vec<FilePayload>) -> Vec<FileChange> {
    files
        .into_iter()
        .map(|f| FileChange {
            filename: f.filename,
            additions: f.additions,
            deletions: f.deletions,
            status: parse_change_status(&f.status),
            patch: f.patch,
        })
        .collect()
}

/// Noise filter applied at ingestion so every downstream stage sees clean
/// data: bot authors drop from comments and reviews, acknowledgement-only
/// bodies drop from comments.
fn convert_comments(comments: Vec<CommentPayload>) -> Vec<Comment> {
    comments
        .into_iter()
        .filter_map(|c| {
            let author = c.user.map(|u| u.login)?;
            if is_bot_login(&author) {
                return None;
            }
            let body = c.body.unwrap_or_default();
            if is_noise_comment(&body) {
                return None;
            }
            Some(Comment {
                author,
                body,
                created_at: c.created_at,
                url: c.html_url,
            })
        })
        .collect()
}

fn convert_reviews(reviews: Vec<ReviewPayload>) -> Vec<Review> {
    reviews
        .into_iter()
        .filter_map(|r| {
            let author = r.user.map(|u| u.login)?;
            if is_bot_login(&author) {
                return None;
            }
            let state = parse_review_state(&r.state)?;
            Some(Review {
                author,
                state,
                body: r.body.unwrap_or_default(),
                submitted_at: r.submitted_at?,
                url: r.html_url,
            })
        })
        .collect()
}

// -- fetcher ----------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct FetchRangeOptions {
    pub types: TypeFilter,
    pub force: bool,
    pub max_workers: usize,
}

struct FailedChunk {
    kind: FetchKind,
    since: NaiveDate,
    until: NaiveDate,
}

type Buckets = BTreeMap<FetchKind, BTreeMap<NaiveDate, Vec<Value>>>;

pub struct Fetcher {
    cfg: Arc<RecapConfig>,
    root: DataRoot,
    pool: Arc<ClientPool>,
    stores: Arc<Stores>,
    reporter: Arc<dyn Reporter>,
}

impl Fetcher {
    pub fn new(
        cfg: Arc<RecapConfig>,
        root: DataRoot,
        pool: Arc<ClientPool>,
        stores: Arc<Stores>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            cfg,
            root,
            pool,
            stores,
            reporter,
        }
    }

    fn user(&self) -> &str {
        &self.cfg.host.user
    }

    fn storage(e: anyhow::Error) -> RecapError {
        RecapError::Storage(e)
    }

    /// Single-day path: search every enabled axis, enrich, filter, write the
    /// per-kind JSON files, then advance checkpoint and daily state.
    pub fn fetch(&self, date: NaiveDate, types: &TypeFilter) -> Result<Vec<PathBuf>, RecapError> {
        let client = self.pool.acquire()?;
        let mut written = Vec::new();

        if kind_enabled(types, FetchKind::Prs) {
            let items = self.search_window(&client, FetchKind::Prs, date, date)?;
            let prs = self.enrich_prs(&client, items);
            written.push(self.write_raw(date, FetchKind::Prs, &prs)?);
        }
        if kind_enabled(types, FetchKind::Commits) {
            let items = self.search_window(&client, FetchKind::Commits, date, date)?;
            let commits = self.enrich_commits(&client, items);
            written.push(self.write_raw(date, FetchKind::Commits, &commits)?);
        }
        if kind_enabled(types, FetchKind::Issues) {
            let items = self.search_window(&client, FetchKind::Issues, date, date)?;
            let issues = self.enrich_issues(&client, items);
            written.push(self.write_raw(date, FetchKind::Issues, &issues)?);
        }

        self.mark_fetched(date)?;
        self.stores
            .failed
            .record_success(date, Stage::Fetch)
            .map_err(Self::storage)?;
        Ok(written)
    }

    /// Range path: monthly-chunk searches (cached for resumability), bucket
    /// by actual day, then per-date enrichment through the worker pool.
    /// Failures are isolated per date; the returned list has one row per
    /// date in the range.
    pub fn fetch_range(
        &self,
        since: NaiveDate,
        until: NaiveDate,
        opts: &FetchRangeOptions,
    ) -> Result<Vec<DateOutcome>, RecapError> {
        let dates = date_range(since, until);
        if dates.is_empty() {
            return Ok(Vec::new());
        }

        let chunks = month_chunks(since, until);
        let mut buckets: Buckets = BTreeMap::new();
        let mut failed_chunks: Vec<FailedChunk> = Vec::new();

        {
            let client = self.pool.acquire()?;
            for (chunk_since, chunk_until) in &chunks {
                for kind in FetchKind::ALL {
                    if !kind_enabled(&opts.types, kind) {
                        continue;
                    }
                    let key = FetchProgressStore::chunk_key(*chunk_since, *chunk_until, kind);
                    let cached = self.stores.progress.load(&key).map_err(Self::storage)?;
                    let items = match cached {
                        Some(items) => {
                            self.reporter.info(&format!(
                                "chunk {key}: reusing {} cached search results",
                                items.len()
                            ));
                            items
                        }
                        None => match self.search_window(&client, kind, *chunk_since, *chunk_until)
                        {
                            Ok(items) => {
                                self.stores
                                    .progress
                                    .save(&key, &items)
                                    .map_err(Self::storage)?;
                                items
                            }
                            Err(e) => {
                                self.reporter.warn(&format!(
                                    "chunk {key}: search failed ({e}); falling back to day-scoped searches"
                                ));
                                failed_chunks.push(FailedChunk {
                                    kind,
                                    since: *chunk_since,
                                    until: *chunk_until,
                                });
                                continue;
                            }
                        },
                    };
                    let by_day = buckets.entry(kind).or_default();
                    for item in items {
                        if let Some(day) = item_day(kind, &item) {
                            by_day.entry(day).or_default().push(item);
                        }
                    }
                }
            }
        }

        // Work selection: stale dates plus retryable failed ones; `force`
        // processes everything.
        let work: Vec<NaiveDate> = if opts.force {
            dates.clone()
        } else {
            let stale = self
                .stores
                .daily
                .stale_dates(&dates, Stage::Fetch)
                .map_err(Self::storage)?;
            self.stores
                .failed
                .retryable_dates(&stale, self.cfg.fetch.max_date_retries)
                .map_err(Self::storage)?
        };
        let work_set: BTreeSet<NaiveDate> = work.iter().copied().collect();

        let outcomes: Mutex<Vec<DateOutcome>> = Mutex::new(
            dates
                .iter()
                .filter(|d| !work_set.contains(d))
                .map(|d| DateOutcome::skipped(*d))
                .collect(),
        );

        let workers = opts.max_workers.max(1);
        for batch in work.chunks(workers) {
            thread::scope(|scope| {
                for &date in batch {
                    let outcomes = &outcomes;
                    let buckets = &buckets;
                    let failed_chunks = &failed_chunks;
                    let types = &opts.types;
                    scope.spawn(move || {
                        let outcome = self.fetch_ranged_date(date, buckets, failed_chunks, types);
                        outcomes.lock().unwrap().push(outcome);
                    });
                }
            });
        }

        let mut outcomes = outcomes.into_inner().unwrap();
        outcomes.sort_by_key(|o| o.date);

        // Chunk caches are kept while any date in the chunk still failed, so
        // the next run resumes without repeating the search phase.
        for (chunk_since, chunk_until) in &chunks {
            let any_failed = outcomes.iter().any(|o| {
                o.date >= *chunk_since
                    && o.date <= *chunk_until
                    && o.status == crate::types::OutcomeStatus::Failed
            });
            if any_failed {
                continue;
            }
            for kind in FetchKind::ALL {
                if !kind_enabled(&opts.types, kind) {
                    continue;
                }
                let key = FetchProgressStore::chunk_key(*chunk_since, *chunk_until, kind);
                self.stores.progress.clear(&key).map_err(Self::storage)?;
            }
        }

        Ok(outcomes)
    }

    fn fetch_ranged_date(
        &self,
        date: NaiveDate,
        buckets: &Buckets,
        failed_chunks: &[FailedChunk],
        types: &TypeFilter,
    ) -> DateOutcome {
        let client = match self.pool.acquire() {
            Ok(c) => c,
            Err(e) => return self.fail_date(date, e.into()),
        };

        for kind in FetchKind::ALL {
            if !kind_enabled(types, kind) {
                continue;
            }

            let chunk_failed = failed_chunks
                .iter()
                .any(|fc| fc.kind == kind && date >= fc.since && date <= fc.until);
            let items: Vec<Value> = if chunk_failed {
                match self.search_window(&client, kind, date, date) {
                    Ok(items) => items
                        .into_iter()
                        .filter(|i| item_day(kind, i) == Some(date))
                        .collect(),
                    Err(e) => return self.fail_date(date, e.into()),
                }
            } else {
                buckets
                    .get(&kind)
                    .and_then(|by_day| by_day.get(&date))
                    .cloned()
                    .unwrap_or_default()
            };

            let write_result = match kind {
                FetchKind::Prs => {
                    let prs = self.enrich_prs(&client, items);
                    self.write_raw(date, kind, &prs)
                }
                FetchKind::Commits => {
                    let commits = self.enrich_commits(&client, items);
                    self.write_raw(date, kind, &commits)
                }
                FetchKind::Issues => {
                    let issues = self.enrich_issues(&client, items);
                    self.write_raw(date, kind, &issues)
                }
            };
            if let Err(e) = write_result {
                return self.fail_date(date, e);
            }
        }

        if let Err(e) = self.mark_fetched(date) {
            return self.fail_date(date, e);
        }
        if let Err(e) = self.stores.failed.record_success(date, Stage::Fetch) {
            return self.fail_date(date, Self::storage(e));
        }
        DateOutcome::success(date)
    }

    fn fail_date(&self, date: NaiveDate, error: RecapError) -> DateOutcome {
        self.reporter
            .error(&format!("fetch {date} failed: {error}"));
        if let Err(e) = self.stores.failed.record_failure(date, Stage::Fetch, &error) {
            self.reporter
                .warn(&format!("failed to record failure for {date}: {e:#}"));
        }
        DateOutcome::failed(date, error.to_string())
    }

    fn mark_fetched(&self, date: NaiveDate) -> Result<(), RecapError> {
        self.stores
            .daily
            .set(date, Stage::Fetch, Utc::now())
            .map_err(Self::storage)?;
        self.stores
            .checkpoints
            .update(Stage::Fetch, date)
            .map_err(Self::storage)?;
        Ok(())
    }

    fn write_raw<T: serde::Serialize>(
        &self,
        date: NaiveDate,
        kind: FetchKind,
        items: &[T],
    ) -> Result<PathBuf, RecapError> {
        let path = self.root.raw_path(date, kind);
        atomic_write_json(&path, &items).map_err(Self::storage)?;
        Ok(path)
    }

    /// Union-deduped search across the kind's axes for one window.
    fn search_window(
        &self,
        client: &HostClient,
        kind: FetchKind,
        since: NaiveDate,
        until: NaiveDate,
    ) -> Result<Vec<Value>, FetchError> {
        let user = self.user();
        let window = format!("{since}..{until}");
        let mut dedup: BTreeMap<String, Value> = BTreeMap::new();

        match kind {
            FetchKind::Prs => {
                let axes = [
                    format!("type:pr author:{user} updated:{window}"),
                    format!("type:pr reviewed-by:{user} updated:{window}"),
                    format!("type:pr commenter:{user} updated:{window}"),
                ];
                for (i, query) in axes.iter().enumerate() {
                    let reviewed_axis = i == 1;
                    match client.search_issues_all(query) {
                        Ok(items) => {
                            for item in items {
                                if let Some(key) = dedup_key(kind, &item) {
                                    dedup.insert(key, item);
                                }
                            }
                        }
                        // Some hosts reject `reviewed-by`. Drop the axis;
                        // review activity is still recovered downstream from
                        // the reviews attached to the other axes' PRs.
                        Err(e) if reviewed_axis && e.status_code() == Some(422) => {
                            self.reporter.warn(&format!(
                                "host rejected reviewed-by qualifier; dropping that axis ({e})"
                            ));
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            FetchKind::Commits => {
                let query = format!("author:{user} committer-date:{window}");
                for item in client.search_commits_all(&query)? {
                    if let Some(key) = dedup_key(kind, &item) {
                        dedup.insert(key, item);
                    }
                }
            }
            FetchKind::Issues => {
                let axes = [
                    format!("type:issue author:{user} updated:{window}"),
                    format!("type:issue commenter:{user} updated:{window}"),
                ];
                for query in &axes {
                    for item in client.search_issues_all(query)? {
                        if let Some(key) = dedup_key(kind, &item) {
                            dedup.insert(key, item);
                        }
                    }
                }
            }
        }

        Ok(dedup.into_values().collect())
    }

    /// PR enrichment: detail + files + comments (discussion and review) +
    /// reviews. A failing item logs and is skipped; the day survives.
    fn enrich_prs(&self, client: &HostClient, items: Vec<Value>) -> Vec<PullRequest> {
        let mut out = Vec::new();
        for item in items {
            let (Some(repo), Some(number)) = (item_repo(&item), item_number(&item)) else {
                self.reporter
                    .warn("skipping PR search item without repo/number");
                continue;
            };
            match self.enrich_pr(client, &repo, number) {
                Ok(pr) => out.push(pr),
                Err(e) => self
                    .reporter
                    .warn(&format!("skipping PR {repo}#{number}: {e}")),
            }
        }
        out.sort_by(|a, b| (&a.repo, a.number).cmp(&(&b.repo, b.number)));
        out
    }

    fn enrich_pr(
        &self,
        client: &HostClient,
        repo: &str,
        number: u64,
    ) -> Result<PullRequest, FetchError> {
        let pr = client.get_pr(repo, number)?;
        let files = client.get_pr_files(repo, number)?;
        let comments = client.get_pr_comments(repo, number)?;
        let reviews = client.get_pr_reviews(repo, number)?;

        Ok(PullRequest {
            number: pr.number,
            html_url: pr.html_url,
            api_url: pr.url,
            repo: pr.base.repo.full_name,
            state: pr.state,
            merged: pr.merged || pr.merged_at.is_some(),
            created_at: pr.created_at,
            updated_at: pr.updated_at,
            merged_at: pr.merged_at,
            author: pr.user.login,
            labels: pr.labels.into_iter().map(|l| l.name).collect(),
            body: pr.body.unwrap_or_default(),
            files: convert_files(files),
            comments: convert_comments(comments),
            reviews: convert_reviews(reviews),
        })
    }

    fn enrich_commits(&self, client: &HostClient, items: Vec<Value>) -> Vec<Commit> {
        let mut out = Vec::new();
        for item in items {
            let (Some(repo), Some(sha)) = (
                item_repo(&item),
                item_str(&item, "sha").map(str::to_string),
            ) else {
                self.reporter
                    .warn("skipping commit search item without repo/sha");
                continue;
            };
            match client.get_commit(&repo, &sha) {
                Ok(c) => out.push(Commit {
                    sha: c.sha,
                    html_url: c.html_url,
                    api_url: c.url,
                    message: c.commit.message,
                    author: c.author.map(|a| a.login).unwrap_or_default(),
                    repo: repo.clone(),
                    committed_at: c.commit.committer.date,
                    files: convert_files(c.files),
                }),
                Err(e) => self
                    .reporter
                    .warn(&format!("skipping commit {repo}@{sha}: {e}")),
            }
        }
        out.sort_by(|a, b| a.committed_at.cmp(&b.committed_at));
        out
    }

    fn enrich_issues(&self, client: &HostClient, items: Vec<Value>) -> Vec<Issue> {
        let mut out = Vec::new();
        for item in items {
            let (Some(repo), Some(number)) = (item_repo(&item), item_number(&item)) else {
                self.reporter
                    .warn("skipping issue search item without repo/number");
                continue;
            };
            let enriched = client.get_issue(&repo, number).and_then(|issue| {
                let comments = client.get_issue_comments(&repo, number)?;
                Ok(Issue {
                    number: issue.number,
                    html_url: issue.html_url,
                    api_url: issue.url,
                    title: issue.title,
                    body: issue.body.unwrap_or_default(),
                    state: issue.state,
                    created_at: issue.created_at,
                    updated_at: issue.updated_at,
                    closed_at: issue.closed_at,
                    repo: repo_from_api_url(&issue.repository_url).unwrap_or_else(|| repo.clone()),
                    labels: issue.labels.into_iter().map(|l| l.name).collect(),
                    author: issue.user.login,
                    comments: convert_comments(comments),
                })
            });
            match enriched {
                Ok(issue) => out.push(issue),
                Err(e) => self
                    .reporter
                    .warn(&format!("skipping issue {repo}#{number}: {e}")),
            }
        }
        out.sort_by(|a, b| (&a.repo, a.number).cmp(&(&b.repo, b.number)));
        out
    }

}
