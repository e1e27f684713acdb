//! Normaliser: transforms raw per-day files into an ordered activity stream
//! (`activities.jsonl`) plus a per-day statistics object (`stats.json`),
//! optionally enriched by an LLM pass that adds intent and change-summary
//! fields.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{NaiveDate, Utc};
use serde::Deserialize;

use crate::config::RecapConfig;
use crate::llm::Router;
use crate::llm::provider::BatchChatRequest;
use crate::prompts::{ENRICH_TEMPLATE, split_template};
use crate::report::Reporter;
use crate::state::Stores;
use crate::storage::{DataRoot, atomic_write_json, atomic_write_jsonl, read_json, read_jsonl};
use crate::types::{
    Activity, ActivityKind, Commit, CommitRef, DailyStats, DateOutcome, FetchKind, Intent, Issue,
    IssueRef, NormalizeError, PrRef, PullRequest, RecapError, SourceStats, Stage,
};

const BODY_SNIPPET: usize = 1000;
const PATCH_SNIPPET: usize = 600;
const DISCUSSION_SNIPPET: usize = 500;
const MAX_DISCUSSION_ITEMS: usize = 3;
const MAX_PATCHES_PER_ACTIVITY: usize = 3;
const COMMIT_TITLE_MAX: usize = 120;

pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{cut}...")
}

/// First line of a commit message, bounded for display.
fn commit_title(message: &str) -> String {
    let first = message.lines().next().unwrap_or_default();
    truncate(first, COMMIT_TITLE_MAX)
}

fn top_level_dir(filename: &str) -> &str {
    match filename.split_once('/') {
        Some((dir, _)) => dir,
        None => "(root)",
    }
}

/// Path-based hint used when the source body is empty: the distinct
/// top-level directories touched, first three, "and others" when more.
fn path_hint(files: &[String]) -> String {
    let mut seen = Vec::new();
    for f in files {
        let dir = top_level_dir(f);
        if !seen.contains(&dir) {
            seen.push(dir);
        }
    }
    let truncated = seen.len() > 3;
    let head = seen[..seen.len().min(3)].join(", ");
    if truncated {
        format!("{head} and others")
    } else {
        head
    }
}

/// Machine-generated one-liner: `"{kind}: {title} ({repo}) +A/-D"`, with the
/// path hint standing in for the title when the body gives no signal.
pub fn machine_summary(
    kind: ActivityKind,
    title: &str,
    repo: &str,
    additions: u64,
    deletions: u64,
    body: &str,
    files: &[String],
) -> String {
    if body.trim().is_empty() && !files.is_empty() {
        let hint = path_hint(files);
        return format!(
            "{kind}: {hint}: {} files changed ({repo}) +{additions}/-{deletions}",
            files.len()
        );
    }
    format!("{kind}: {title} ({repo}) +{additions}/-{deletions}")
}

fn nonempty_bodies<'a, I: Iterator<Item = &'a str>>(bodies: I) -> Vec<String> {
    bodies
        .filter(|b| !b.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Activity generation. Timestamps bind to day membership: every emitted
/// activity's timestamp falls on `date` by construction.
pub fn build_activities(
    user: &str,
    date: NaiveDate,
    prs: &[PullRequest],
    commits: &[Commit],
    issues: &[Issue],
    include_own_pr_comments: bool,
) -> Vec<Activity> {
    let mut acts: Vec<Activity> = Vec::new();

    for pr in prs {
        let files: Vec<String> = pr.files.iter().map(|f| f.filename.clone()).collect();
        let additions: u64 = pr.files.iter().map(|f| f.additions).sum();
        let deletions: u64 = pr.files.iter().map(|f| f.deletions).sum();

        let authored = pr.author == user && pr.created_at.date_naive() == date;
        if authored {
            acts.push(Activity {
                ts: pr.created_at,
                kind: ActivityKind::PrAuthored,
                repo: pr.repo.clone(),
                number: pr.number,
                title: pr.title.clone(),
                url: pr.html_url.clone(),
                summary: machine_summary(
                    ActivityKind::PrAuthored,
                    &pr.title,
                    &pr.repo,
                    additions,
                    deletions,
                    &pr.body,
                    &files,
                ),
                sha: None,
                files: files.clone(),
                additions,
                deletions,
                labels: pr.labels.clone(),
                evidence_urls: Vec::new(),
                body: pr.body.clone(),
                review_bodies: nonempty_bodies(pr.reviews.iter().map(|r| r.body.as_str())),
                comment_bodies: nonempty_bodies(pr.comments.iter().map(|c| c.body.as_str())),
                intent: None,
                change_summary: None,
            });
        } else {
            // Reviews collapse to at most one activity per PR-day; every
            // participating review url lands in evidence_urls.
            let mine: Vec<_> = pr
                .reviews
                .iter()
                .filter(|r| r.author == user && r.submitted_at.date_naive() == date)
                .collect();
            if let Some(earliest) = mine.iter().map(|r| r.submitted_at).min() {
                acts.push(Activity {
                    ts: earliest,
                    kind: ActivityKind::PrReviewed,
                    repo: pr.repo.clone(),
                    number: pr.number,
                    title: pr.title.clone(),
                    url: pr.html_url.clone(),
                    summary: machine_summary(
                        ActivityKind::PrReviewed,
                        &pr.title,
                        &pr.repo,
                        additions,
                        deletions,
                        &pr.body,
                        &files,
                    ),
                    sha: None,
                    files: files.clone(),
                    additions,
                    deletions,
                    labels: pr.labels.clone(),
                    evidence_urls: mine.iter().map(|r| r.url.clone()).collect(),
                    body: pr.body.clone(),
                    review_bodies: nonempty_bodies(mine.iter().map(|r| r.body.as_str())),
                    comment_bodies: Vec::new(),
                    intent: None,
                    change_summary: None,
                });
            }
        }

        // Comments collapse the same way. Author-on-own-PR comments are a
        // configurable policy; the default preserves the discussion trail.
        if pr.author != user || include_own_pr_comments {
            let mine: Vec<_> = pr
                .comments
                .iter()
                .filter(|c| c.author == user && c.created_at.date_naive() == date)
                .collect();
            if let Some(earliest) = mine.iter().map(|c| c.created_at).min() {
                acts.push(Activity {
                    ts: earliest,
                    kind: ActivityKind::PrCommented,
                    repo: pr.repo.clone(),
                    number: pr.number,
                    title: pr.title.clone(),
                    url: pr.html_url.clone(),
                    summary: machine_summary(
                        ActivityKind::PrCommented,
                        &pr.title,
                        &pr.repo,
                        additions,
                        deletions,
                        &pr.body,
                        &files,
                    ),
                    sha: None,
                    files: files.clone(),
                    additions,
                    deletions,
                    labels: pr.labels.clone(),
                    evidence_urls: mine.iter().map(|c| c.url.clone()).collect(),
                    body: pr.body.clone(),
                    review_bodies: Vec::new(),
                    comment_bodies: nonempty_bodies(mine.iter().map(|c| c.body.as_str())),
                    intent: None,
                    change_summary: None,
                });
            }
        }
    }

    for commit in commits {
        if commit.committed_at.date_naive() != date {
            continue;
        }
        let files: Vec<String> = commit.files.iter().map(|f| f.filename.clone()).collect();
        let additions: u64 = commit.files.iter().map(|f| f.additions).sum();
        let deletions: u64 = commit.files.iter().map(|f| f.deletions).sum();
        let title = commit_title(&commit.message);
        acts.push(Activity {
            ts: commit.committed_at,
            kind: ActivityKind::Commit,
            repo: commit.repo.clone(),
            number: 0,
            title: title.clone(),
            url: commit.html_url.clone(),
            summary: machine_summary(
                ActivityKind::Commit,
                &title,
                &commit.repo,
                additions,
                deletions,
                &commit.message,
                &files,
            ),
            sha: Some(commit.sha.clone()),
            files,
            additions,
            deletions,
            labels: Vec::new(),
            evidence_urls: Vec::new(),
            body: commit.message.clone(),
            review_bodies: Vec::new(),
            comment_bodies: Vec::new(),
            intent: None,
            change_summary: None,
        });
    }

    for issue in issues {
        if issue.author == user && issue.created_at.date_naive() == date {
            acts.push(Activity {
                ts: issue.created_at,
                kind: ActivityKind::IssueAuthored,
                repo: issue.repo.clone(),
                number: issue.number,
                title: issue.title.clone(),
                url: issue.html_url.clone(),
                summary: machine_summary(
                    ActivityKind::IssueAuthored,
                    &issue.title,
                    &issue.repo,
                    0,
                    0,
                    &issue.body,
                    &[],
                ),
                sha: None,
                files: Vec::new(),
                additions: 0,
                deletions: 0,
                labels: issue.labels.clone(),
                evidence_urls: Vec::new(),
                body: issue.body.clone(),
                review_bodies: Vec::new(),
                comment_bodies: Vec::new(),
                intent: None,
                change_summary: None,
            });
        }
        // Authoring and commenting on the same issue may both fire.
        let mine: Vec<_> = issue
            .comments
            .iter()
            .filter(|c| c.author == user && c.created_at.date_naive() == date)
            .collect();
        if let Some(earliest) = mine.iter().map(|c| c.created_at).min() {
            acts.push(Activity {
                ts: earliest,
                kind: ActivityKind::IssueCommented,
                repo: issue.repo.clone(),
                number: issue.number,
                title: issue.title.clone(),
                url: issue.html_url.clone(),
                summary: machine_summary(
                    ActivityKind::IssueCommented,
                    &issue.title,
                    &issue.repo,
                    0,
                    0,
                    &issue.body,
                    &[],
                ),
                sha: None,
                files: Vec::new(),
                additions: 0,
                deletions: 0,
                labels: issue.labels.clone(),
                evidence_urls: mine.iter().map(|c| c.url.clone()).collect(),
                body: issue.body.clone(),
                review_bodies: Vec::new(),
                comment_bodies: nonempty_bodies(mine.iter().map(|c| c.body.as_str())),
                intent: None,
                change_summary: None,
            });
        }
    }

    acts.sort_by_key(|a| a.ts);
    acts
}

/// Counts by kind; line counts sum over own work only (authored PRs and
/// commits).
pub fn build_stats(date: NaiveDate, activities: &[Activity]) -> DailyStats {
    let mut github = SourceStats::default();
    let mut repos = std::collections::BTreeSet::new();

    for act in activities {
        repos.insert(act.repo.clone());
        match act.kind {
            ActivityKind::PrAuthored => {
                github.authored_count += 1;
                github.total_additions += act.additions;
                github.total_deletions += act.deletions;
                github.authored_prs.push(PrRef {
                    url: act.url.clone(),
                    title: act.title.clone(),
                    repo: act.repo.clone(),
                });
            }
            ActivityKind::PrReviewed => {
                github.reviewed_count += 1;
                github.reviewed_prs.push(PrRef {
                    url: act.url.clone(),
                    title: act.title.clone(),
                    repo: act.repo.clone(),
                });
            }
            ActivityKind::PrCommented => github.commented_count += 1,
            ActivityKind::Commit => {
                github.commit_count += 1;
                github.total_additions += act.additions;
                github.total_deletions += act.deletions;
                github.commits.push(CommitRef {
                    url: act.url.clone(),
                    title: act.title.clone(),
                    repo: act.repo.clone(),
                    sha: act.sha.clone().unwrap_or_default(),
                });
            }
            ActivityKind::IssueAuthored => {
                github.issues_authored_count += 1;
                github.authored_issues.push(IssueRef {
                    url: act.url.clone(),
                    title: act.title.clone(),
                    repo: act.repo.clone(),
                });
            }
            ActivityKind::IssueCommented => github.issues_commented_count += 1,
        }
    }

    github.repos_touched = repos.into_iter().collect();
    DailyStats { date, github }
}

// -- LLM enrichment ---------------------------------------------------------

#[derive(Debug, Deserialize)]
struct EnrichRow {
    index: usize,
    #[serde(default)]
    change_summary: Option<String>,
    #[serde(default)]
    intent: Option<String>,
}

/// Per-activity data for the enrichment prompt: kind, title, repo, truncated
/// body, file list, a few file patches, and discussion bodies.
pub(crate) fn build_enrich_user(
    activities: &[Activity],
    prs: &[PullRequest],
    commits: &[Commit],
) -> String {
    let mut out = String::new();
    for (i, act) in activities.iter().enumerate() {
        out.push_str(&format!("### Activity {i}\n"));
        out.push_str(&format!("kind: {}\n", act.kind));
        out.push_str(&format!("title: {}\n", act.title));
        out.push_str(&format!("repo: {}\n", act.repo));
        if !act.body.trim().is_empty() {
            out.push_str(&format!("body: {}\n", truncate(&act.body, BODY_SNIPPET)));
        }
        if !act.files.is_empty() {
            out.push_str(&format!("files: {}\n", act.files.join(", ")));
        }

        let patches: Vec<(&str, &str)> = match act.kind {
            ActivityKind::Commit => commits
                .iter()
                .find(|c| Some(&c.sha) == act.sha.as_ref())
                .map(|c| {
                    c.files
                        .iter()
                        .filter_map(|f| f.patch.as_deref().map(|p| (f.filename.as_str(), p)))
                        .collect()
                })
                .unwrap_or_default(),
            _ => prs
                .iter()
                .find(|p| p.number == act.number && p.repo == act.repo)
                .map(|p| {
                    p.files
                        .iter()
                        .filter_map(|f| f.patch.as_deref().map(|p| (f.filename.as_str(), p)))
                        .collect()
                })
                .unwrap_or_default(),
        };
        for (name, patch) in patches.into_iter().take(MAX_PATCHES_PER_ACTIVITY) {
            out.push_str(&format!(
                "patch {name}:\n{}\n",
                truncate(patch, PATCH_SNIPPET)
            ));
        }

        for body in act.review_bodies.iter().take(MAX_DISCUSSION_ITEMS) {
            out.push_str(&format!("review: {}\n", truncate(body, DISCUSSION_SNIPPET)));
        }
        for body in act.comment_bodies.iter().take(MAX_DISCUSSION_ITEMS) {
            out.push_str(&format!("comment: {}\n", truncate(body, DISCUSSION_SNIPPET)));
        }
        out.push('\n');
    }
    out
}

/// Merges `[{index, change_summary, intent}]` back by index. Returns the
/// number of merged rows, or `None` when the payload is not the expected
/// JSON shape (non-fatal for callers).
pub(crate) fn merge_enrichment(activities: &mut [Activity], text: &str) -> Option<usize> {
    let trimmed = text.trim();
    // An Anthropic batch result may arrive without the prefilled bracket.
    let rows: Vec<EnrichRow> = serde_json::from_str(trimmed)
        .or_else(|_| serde_json::from_str(&format!("[{trimmed}")))
        .ok()?;

    let mut merged = 0;
    for row in rows {
        let Some(act) = activities.get_mut(row.index) else {
            continue;
        };
        if let Some(summary) = row.change_summary {
            act.change_summary = Some(summary);
        }
        act.intent = row.intent.as_deref().and_then(Intent::parse).or(act.intent);
        merged += 1;
    }
    Some(merged)
}

// -- normalizer service ------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct NormalizeRangeOptions {
    pub force: bool,
    pub enrich: bool,
    pub batch: bool,
    pub max_workers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EnrichMode {
    Off,
    Inline,
    /// Batch mode: normalize without enrichment and hand back the prompt
    /// content for a single provider batch.
    Deferred,
}

pub struct Normalizer {
    cfg: Arc<RecapConfig>,
    root: DataRoot,
    stores: Arc<Stores>,
    router: Option<Arc<Router>>,
    reporter: Arc<dyn Reporter>,
}

impl Normalizer {
    pub fn new(
        cfg: Arc<RecapConfig>,
        root: DataRoot,
        stores: Arc<Stores>,
        router: Option<Arc<Router>>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            cfg,
            root,
            stores,
            router,
            reporter,
        }
    }

    fn storage(e: anyhow::Error) -> RecapError {
        RecapError::Storage(e)
    }

    fn err(date: NaiveDate, reason: impl Into<String>) -> RecapError {
        RecapError::Normalize(NormalizeError {
            date,
            reason: reason.into(),
            status: None,
        })
    }

    /// Single-day path. Returns the written `(activities, stats)` paths.
    pub fn normalize(
        &self,
        date: NaiveDate,
        enrich: bool,
    ) -> Result<(PathBuf, PathBuf), RecapError> {
        let mode = if enrich { EnrichMode::Inline } else { EnrichMode::Off };
        self.normalize_date(date, mode)?;
        Ok((self.root.activities_path(date), self.root.stats_path(date)))
    }

    fn normalize_date(
        &self,
        date: NaiveDate,
        mode: EnrichMode,
    ) -> Result<Option<String>, RecapError> {
        let prs: Option<Vec<PullRequest>> =
            read_json(&self.root.raw_path(date, FetchKind::Prs)).map_err(Self::storage)?;
        let commits: Option<Vec<Commit>> =
            read_json(&self.root.raw_path(date, FetchKind::Commits)).map_err(Self::storage)?;
        let issues: Option<Vec<Issue>> =
            read_json(&self.root.raw_path(date, FetchKind::Issues)).map_err(Self::storage)?;

        if prs.is_none() && commits.is_none() && issues.is_none() {
            return Err(Self::err(date, "no raw files; run fetch first"));
        }
        let prs = prs.unwrap_or_default();
        let commits = commits.unwrap_or_default();
        let issues = issues.unwrap_or_default();

        let mut activities = build_activities(
            &self.cfg.host.user,
            date,
            &prs,
            &commits,
            &issues,
            self.cfg.fetch.include_own_pr_comments,
        );

        let deferred = match mode {
            EnrichMode::Off => None,
            EnrichMode::Inline => {
                if !activities.is_empty() {
                    self.enrich_inline(date, &mut activities, &prs, &commits);
                }
                None
            }
            EnrichMode::Deferred => {
                if activities.is_empty() {
                    None
                } else {
                    Some(build_enrich_user(&activities, &prs, &commits))
                }
            }
        };

        let stats = build_stats(date, &activities);
        atomic_write_jsonl(&self.root.activities_path(date), &activities)
            .map_err(Self::storage)?;
        atomic_write_json(&self.root.stats_path(date), &stats).map_err(Self::storage)?;

        self.stores
            .daily
            .set(date, Stage::Normalize, Utc::now())
            .map_err(Self::storage)?;
        self.stores
            .checkpoints
            .update(Stage::Normalize, date)
            .map_err(Self::storage)?;
        self.stores
            .failed
            .record_success(date, Stage::Normalize)
            .map_err(Self::storage)?;

        Ok(deferred)
    }

    /// Inline LLM enrichment. Any failure here is soft: activities simply
    /// lack enrichment.
    fn enrich_inline(
        &self,
        date: NaiveDate,
        activities: &mut [Activity],
        prs: &[PullRequest],
        commits: &[Commit],
    ) {
        let Some(router) = &self.router else {
            self.reporter
                .warn("enrichment requested but no LLM router is configured");
            return;
        };

        let (system, preamble) = split_template(ENRICH_TEMPLATE);
        let user = format!("{preamble}{}", build_enrich_user(activities, prs, commits));
        match router.chat(system, &user, "enrich", true, None, true) {
            Ok(text) => match merge_enrichment(activities, &text) {
                Some(merged) => self
                    .reporter
                    .info(&format!("enriched {merged} activities for {date}")),
                None => self
                    .reporter
                    .warn(&format!("enrichment for {date} returned unparseable JSON; skipped")),
            },
            Err(e) => self
                .reporter
                .warn(&format!("enrichment for {date} failed: {e}")),
        }
    }

    /// Range path with the same skip/force/retry discipline as the fetcher,
    /// keyed on normalize staleness. With `batch` set, all days normalize
    /// without enrichment first and one provider batch backfills the
    /// enrichment fields.
    pub fn normalize_range(
        &self,
        since: NaiveDate,
        until: NaiveDate,
        opts: &NormalizeRangeOptions,
    ) -> Result<Vec<DateOutcome>, RecapError> {
        let dates = crate::fetch::date_range(since, until);
        if dates.is_empty() {
            return Ok(Vec::new());
        }

        let work: Vec<NaiveDate> = if opts.force {
            dates.clone()
        } else {
            let stale = self
                .stores
                .daily
                .stale_dates(&dates, Stage::Normalize)
                .map_err(Self::storage)?;
            self.stores
                .failed
                .retryable_dates(&stale, self.cfg.fetch.max_date_retries)
                .map_err(Self::storage)?
        };
        let work_set: std::collections::BTreeSet<NaiveDate> = work.iter().copied().collect();

        let mode = match (opts.enrich, opts.batch) {
            (false, _) => EnrichMode::Off,
            (true, false) => EnrichMode::Inline,
            (true, true) => EnrichMode::Deferred,
        };

        let outcomes: Mutex<Vec<DateOutcome>> = Mutex::new(
            dates
                .iter()
                .filter(|d| !work_set.contains(d))
                .map(|d| DateOutcome::skipped(*d))
                .collect(),
        );
        let deferred: Mutex<Vec<(NaiveDate, String)>> = Mutex::new(Vec::new());

        let workers = opts.max_workers.max(1);
        for batch in work.chunks(workers) {
            thread::scope(|scope| {
                for &date in batch {
                    let outcomes = &outcomes;
                    let deferred = &deferred;
                    scope.spawn(move || match self.normalize_date(date, mode) {
                        Ok(content) => {
                            if let Some(content) = content {
                                deferred.lock().unwrap().push((date, content));
                            }
                            outcomes.lock().unwrap().push(DateOutcome::success(date));
                        }
                        Err(e) => {
                            self.reporter
                                .error(&format!("normalize {date} failed: {e}"));
                            if let Err(store_err) =
                                self.stores.failed.record_failure(date, Stage::Normalize, &e)
                            {
                                self.reporter.warn(&format!(
                                    "failed to record failure for {date}: {store_err:#}"
                                ));
                            }
                            outcomes
                                .lock()
                                .unwrap()
                                .push(DateOutcome::failed(date, e.to_string()));
                        }
                    });
                }
            });
        }

        let deferred = deferred.into_inner().unwrap();
        if mode == EnrichMode::Deferred && !deferred.is_empty() {
            self.enrich_deferred(&deferred);
        }

        let mut outcomes = outcomes.into_inner().unwrap();
        outcomes.sort_by_key(|o| o.date);
        Ok(outcomes)
    }

    /// One `enrich-{date}` request per day, one provider batch, merged back
    /// per day. Batch requests never escalate. Failures are soft: days stay
    /// normalized without enrichment.
    fn enrich_deferred(&self, deferred: &[(NaiveDate, String)]) {
        let Some(router) = &self.router else {
            self.reporter
                .warn("batch enrichment requested but no LLM router is configured");
            return;
        };

        let (system, preamble) = split_template(ENRICH_TEMPLATE);
        let requests: Vec<BatchChatRequest> = deferred
            .iter()
            .map(|(date, content)| BatchChatRequest {
                custom_id: format!("enrich-{date}"),
                system: system.to_string(),
                user: format!("{preamble}{content}"),
                json_mode: true,
                max_tokens: None,
            })
            .collect();

        let results = router
            .submit_batch(&requests, "enrich")
            .and_then(|id| router.wait_for_batch(&id, "enrich", requests.len()));
        let results = match results {
            Ok(r) => r,
            Err(e) => {
                self.reporter
                    .warn(&format!("batch enrichment failed; days stay unenriched: {e}"));
                return;
            }
        };

        for (date, _) in deferred {
            let Some(text) = results.get(&format!("enrich-{date}")) else {
                self.reporter
                    .warn(&format!("batch enrichment returned nothing for {date}"));
                continue;
            };
            if let Err(e) = self.merge_deferred_day(*date, text) {
                self.reporter
                    .warn(&format!("failed to merge batch enrichment for {date}: {e}"));
            }
        }
    }

    fn merge_deferred_day(&self, date: NaiveDate, text: &str) -> Result<(), RecapError> {
        let path = self.root.activities_path(date);
        let mut activities: Vec<Activity> = read_jsonl(&path)
            .map_err(Self::storage)?
            .ok_or_else(|| Self::err(date, "activities file vanished before merge"))?;

        match merge_enrichment(&mut activities, text) {
            Some(merged) => {
                atomic_write_jsonl(&path, &activities).map_err(Self::storage)?;
                self.stores
                    .daily
                    .set(date, Stage::Normalize, Utc::now())
                    .map_err(Self::storage)?;
                self.reporter
                    .info(&format!("merged {merged} enrichment rows for {date}"));
                Ok(())
            }
            None => {
                self.reporter
                    .warn(&format!("enrichment for {date} returned unparseable JSON; skipped"));
                Ok(())
            }
        }
    }
}
