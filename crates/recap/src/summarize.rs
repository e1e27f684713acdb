//! Summariser: renders prompt templates over the activity stream and
//! produces daily, weekly, monthly, and yearly Markdown reports, plus the
//! ad-hoc query mode over recent summaries.
//!
//! Levels above daily are driven by file mtimes: a level is stale when any
//! contributing file is newer than its output, so a re-summarized day ripples
//! upward on the next cascade run.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::SystemTime;

use chrono::{Datelike, Months, NaiveDate, Utc, Weekday};

use crate::config::RecapConfig;
use crate::llm::Router;
use crate::llm::provider::BatchChatRequest;
use crate::normalize::truncate;
use crate::prompts::{
    DAILY_TEMPLATE, MONTHLY_TEMPLATE, QUERY_TEMPLATE, WEEKLY_TEMPLATE, YEARLY_TEMPLATE,
    split_template,
};
use crate::report::Reporter;
use crate::state::Stores;
use crate::storage::{DataRoot, atomic_write_string, read_json, read_jsonl};
use crate::types::{
    Activity, DailyStats, DateOutcome, RecapError, Stage, SummarizeError,
};

const SUMMARY_SEPARATOR: &str = "\n\n---\n\n";
const BODY_SNIPPET: usize = 1000;
const DISCUSSION_SNIPPET: usize = 500;
const MAX_DISCUSSION_ITEMS: usize = 3;
const MAX_FILES_SHOWN: usize = 8;

fn mtime(path: &std::path::Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Output is stale when missing or older than any contributing input.
fn output_stale(output: &std::path::Path, inputs: &[PathBuf]) -> bool {
    let Some(out) = mtime(output) else {
        return true;
    };
    inputs
        .iter()
        .filter_map(|p| mtime(p))
        .any(|input| input > out)
}

/// One activity as a prompt block: header line plus indented detail.
fn format_activity(act: &Activity) -> String {
    let mut s = format!(
        "- [{}] {} ({}) +{}/-{}\n",
        act.kind, act.title, act.repo, act.additions, act.deletions
    );
    if let Some(intent) = act.intent {
        s.push_str(&format!("    Intent: {intent}\n"));
    }
    if let Some(summary) = &act.change_summary {
        s.push_str(&format!("    Change Summary: {summary}\n"));
    }
    if !act.files.is_empty() {
        let shown = act.files[..act.files.len().min(MAX_FILES_SHOWN)].join(", ");
        if act.files.len() > MAX_FILES_SHOWN {
            s.push_str(&format!(
                "    Files: {shown} (+{} more)\n",
                act.files.len() - MAX_FILES_SHOWN
            ));
        } else {
            s.push_str(&format!("    Files: {shown}\n"));
        }
    }
    if !act.body.trim().is_empty() {
        s.push_str(&format!("    Body: {}\n", truncate(&act.body, BODY_SNIPPET)));
    }
    for body in act.review_bodies.iter().take(MAX_DISCUSSION_ITEMS) {
        s.push_str(&format!(
            "    Review: {}\n",
            truncate(body, DISCUSSION_SNIPPET)
        ));
    }
    for body in act.comment_bodies.iter().take(MAX_DISCUSSION_ITEMS) {
        s.push_str(&format!(
            "    Comment: {}\n",
            truncate(body, DISCUSSION_SNIPPET)
        ));
    }
    s
}

fn stats_header(stats: &DailyStats) -> String {
    let g = &stats.github;
    format!(
        "Date: {}\nAuthored PRs: {} | Reviewed: {} | PR comments: {} | Commits: {} | \
Issues authored: {} | Issue comments: {}\nLines: +{}/-{}\nRepos: {}\n",
        stats.date,
        g.authored_count,
        g.reviewed_count,
        g.commented_count,
        g.commit_count,
        g.issues_authored_count,
        g.issues_commented_count,
        g.total_additions,
        g.total_deletions,
        g.repos_touched.join(", "),
    )
}

/// Dates of one ISO week, Monday through Sunday.
fn iso_week_dates(year: i32, week: u32) -> Option<Vec<NaiveDate>> {
    let monday = NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)?;
    Some(crate::fetch::date_range(
        monday,
        monday + chrono::Days::new(6),
    ))
}

fn month_dates(year: i32, month: u32) -> Vec<NaiveDate> {
    let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
        return Vec::new();
    };
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    };
    let Some(last) = next.and_then(|n| n.pred_opt()) else {
        return Vec::new();
    };
    crate::fetch::date_range(first, last)
}

/// Distinct `(iso_year, iso_week)` pairs overlapping a month, in order.
fn weeks_of_month(year: i32, month: u32) -> Vec<(i32, u32)> {
    let mut out: Vec<(i32, u32)> = Vec::new();
    for date in month_dates(year, month) {
        let iso = date.iso_week();
        let pair = (iso.year(), iso.week());
        if out.last() != Some(&pair) {
            out.push(pair);
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct SummarizeRangeOptions {
    pub force: bool,
    pub max_workers: usize,
    pub batch: bool,
}

pub struct Summarizer {
    cfg: Arc<RecapConfig>,
    root: DataRoot,
    stores: Arc<Stores>,
    router: Arc<Router>,
    reporter: Arc<dyn Reporter>,
}

impl Summarizer {
    pub fn new(
        cfg: Arc<RecapConfig>,
        root: DataRoot,
        stores: Arc<Stores>,
        router: Arc<Router>,
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

    fn err(target: impl Into<String>, reason: impl Into<String>) -> RecapError {
        RecapError::Summarize(SummarizeError {
            target: target.into(),
            reason: reason.into(),
            status: None,
        })
    }

    fn llm_err(target: impl Into<String>, e: crate::llm::LlmError) -> RecapError {
        RecapError::Summarize(SummarizeError {
            target: target.into(),
            reason: e.to_string(),
            status: e.status,
        })
    }

    /// User content for one day's summary, or `None` when the day has no
    /// activities (summarized statically without a model call).
    fn daily_user_content(&self, date: NaiveDate) -> Result<Option<String>, RecapError> {
        let activities: Vec<Activity> = read_jsonl(&self.root.activities_path(date))
            .map_err(Self::storage)?
            .ok_or_else(|| Self::err(date.to_string(), "no normalized data; run normalize first"))?;
        let stats: DailyStats = read_json(&self.root.stats_path(date))
            .map_err(Self::storage)?
            .ok_or_else(|| Self::err(date.to_string(), "stats file missing; run normalize first"))?;

        if activities.is_empty() {
            return Ok(None);
        }

        let mut content = stats_header(&stats);
        content.push('\n');
        for act in &activities {
            content.push_str(&format_activity(act));
        }
        Ok(Some(content))
    }

    /// Daily summary. Reads `activities.jsonl` + `stats.json`, renders the
    /// daily template, writes the Markdown file, then stamps daily state and
    /// checkpoint.
    pub fn daily(&self, date: NaiveDate) -> Result<PathBuf, RecapError> {
        let path = self.root.daily_summary_path(date);
        match self.daily_user_content(date)? {
            None => {
                atomic_write_string(&path, &format!("# {date}\n\nNo recorded activity.\n"))
                    .map_err(Self::storage)?;
            }
            Some(content) => {
                let (system, preamble) = split_template(DAILY_TEMPLATE);
                let markdown = self
                    .router
                    .chat(
                        system,
                        &format!("{preamble}{content}"),
                        "daily",
                        false,
                        None,
                        true,
                    )
                    .map_err(|e| Self::llm_err(date.to_string(), e))?;
                atomic_write_string(&path, &markdown).map_err(Self::storage)?;
            }
        }

        self.mark_summarized(date)?;
        Ok(path)
    }

    fn mark_summarized(&self, date: NaiveDate) -> Result<(), RecapError> {
        self.stores
            .daily
            .set(date, Stage::Summarize, Utc::now())
            .map_err(Self::storage)?;
        self.stores
            .checkpoints
            .update(Stage::Summarize, date)
            .map_err(Self::storage)?;
        self.stores
            .failed
            .record_success(date, Stage::Summarize)
            .map_err(Self::storage)?;
        Ok(())
    }

    /// Rolls existing summaries one level up: read inputs, check mtime
    /// staleness, chat, write.
    fn roll_up(
        &self,
        target: &str,
        task: &str,
        template: &str,
        inputs: &[PathBuf],
        output: PathBuf,
        force: bool,
    ) -> Result<PathBuf, RecapError> {
        let existing: Vec<PathBuf> = inputs.iter().filter(|p| p.exists()).cloned().collect();
        if existing.is_empty() {
            return Err(Self::err(
                target,
                "no lower-level summaries to roll up; run the level below first",
            ));
        }

        if !force && !output_stale(&output, &existing) {
            self.reporter
                .info(&format!("{target}: up to date, skipping"));
            return Ok(output);
        }

        let mut sections = Vec::with_capacity(existing.len());
        for path in &existing {
            let content = std::fs::read_to_string(path)
                .map_err(|e| Self::err(target, format!("failed to read {}: {e}", path.display())))?;
            sections.push(content);
        }

        let (system, preamble) = split_template(template);
        let user = format!("{preamble}{}", sections.join(SUMMARY_SEPARATOR));
        let markdown = self
            .router
            .chat(system, &user, task, false, None, true)
            .map_err(|e| Self::llm_err(target, e))?;
        atomic_write_string(&output, &markdown).map_err(Self::storage)?;
        self.reporter.info(&format!("{target}: written"));
        Ok(output)
    }

    /// Weekly summary over the ISO week's daily files.
    pub fn weekly(&self, year: i32, week: u32, force: bool) -> Result<PathBuf, RecapError> {
        let target = format!("{year}-W{week:02}");
        let dates = iso_week_dates(year, week)
            .ok_or_else(|| Self::err(&target, "invalid ISO week"))?;
        let inputs: Vec<PathBuf> = dates
            .iter()
            .map(|d| self.root.daily_summary_path(*d))
            .collect();
        self.roll_up(
            &target,
            "weekly",
            WEEKLY_TEMPLATE,
            &inputs,
            self.root.weekly_summary_path(year, week),
            force,
        )
    }

    /// Monthly summary over the weekly files overlapping the month.
    pub fn monthly(&self, year: i32, month: u32, force: bool) -> Result<PathBuf, RecapError> {
        let target = format!("{year}-{month:02}");
        let inputs: Vec<PathBuf> = weeks_of_month(year, month)
            .into_iter()
            .map(|(wy, w)| self.root.weekly_summary_path(wy, w))
            .collect();
        self.roll_up(
            &target,
            "monthly",
            MONTHLY_TEMPLATE,
            &inputs,
            self.root.monthly_summary_path(year, month),
            force,
        )
    }

    /// Yearly summary over the twelve monthly files.
    pub fn yearly(&self, year: i32, force: bool) -> Result<PathBuf, RecapError> {
        let inputs: Vec<PathBuf> = (1..=12)
            .map(|m| self.root.monthly_summary_path(year, m))
            .collect();
        self.roll_up(
            &format!("{year}"),
            "yearly",
            YEARLY_TEMPLATE,
            &inputs,
            self.root.yearly_summary_path(year),
            force,
        )
    }

    /// Ad-hoc question over recent summaries. Context preference: monthlies,
    /// then weeklies, then dailies, over the last `months_back` months.
    /// Returns the answer; nothing is written.
    pub fn query(&self, question: &str, months_back: u32) -> Result<String, RecapError> {
        let today = Utc::now().date_naive();
        let horizon = today
            .checked_sub_months(Months::new(months_back))
            .unwrap_or(today);

        let mut context: Vec<PathBuf> = Vec::new();
        for k in (0..months_back).rev() {
            if let Some(d) = today.checked_sub_months(Months::new(k)) {
                let path = self.root.monthly_summary_path(d.year(), d.month());
                if path.exists() {
                    context.push(path);
                }
            }
        }
        if context.is_empty() {
            let mut seen = Vec::new();
            for date in crate::fetch::date_range(horizon, today) {
                let iso = date.iso_week();
                let path = self.root.weekly_summary_path(iso.year(), iso.week());
                if path.exists() && !seen.contains(&path) {
                    seen.push(path);
                }
            }
            context = seen;
        }
        if context.is_empty() {
            context = crate::fetch::date_range(horizon, today)
                .into_iter()
                .map(|d| self.root.daily_summary_path(d))
                .filter(|p| p.exists())
                .collect();
        }
        if context.is_empty() {
            return Err(Self::err("query", "no summary context available"));
        }

        let mut sections = Vec::with_capacity(context.len());
        for path in &context {
            sections.push(std::fs::read_to_string(path).map_err(|e| {
                Self::err("query", format!("failed to read {}: {e}", path.display()))
            })?);
        }

        let (system, preamble) = split_template(QUERY_TEMPLATE);
        let user = format!(
            "{preamble}{}\n\nQuestion: {question}",
            sections.join(SUMMARY_SEPARATOR)
        );
        self.router
            .chat(system, &user, "query", false, None, true)
            .map_err(|e| Self::llm_err("query", e))
    }

    /// Range path with the usual skip/force/retry discipline, keyed on
    /// summarize staleness. The batch path prepares every day's prompt,
    /// submits one provider batch keyed `daily-{date}`, and distributes the
    /// responses to per-day files.
    pub fn daily_range(
        &self,
        since: NaiveDate,
        until: NaiveDate,
        opts: &SummarizeRangeOptions,
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
                .stale_dates(&dates, Stage::Summarize)
                .map_err(Self::storage)?;
            self.stores
                .failed
                .retryable_dates(&stale, self.cfg.fetch.max_date_retries)
                .map_err(Self::storage)?
        };
        let work_set: std::collections::BTreeSet<NaiveDate> = work.iter().copied().collect();

        let mut outcomes: Vec<DateOutcome> = dates
            .iter()
            .filter(|d| !work_set.contains(d))
            .map(|d| DateOutcome::skipped(*d))
            .collect();

        if opts.batch {
            outcomes.extend(self.daily_batch(&work));
        } else {
            let collected: Mutex<Vec<DateOutcome>> = Mutex::new(Vec::new());
            let workers = opts.max_workers.max(1);
            for batch in work.chunks(workers) {
                thread::scope(|scope| {
                    for &date in batch {
                        let collected = &collected;
                        scope.spawn(move || {
                            let outcome = match self.daily(date) {
                                Ok(_) => DateOutcome::success(date),
                                Err(e) => self.fail_date(date, e),
                            };
                            collected.lock().unwrap().push(outcome);
                        });
                    }
                });
            }
            outcomes.extend(collected.into_inner().unwrap());
        }

        outcomes.sort_by_key(|o| o.date);
        Ok(outcomes)
    }

    fn fail_date(&self, date: NaiveDate, error: RecapError) -> DateOutcome {
        self.reporter
            .error(&format!("summarize {date} failed: {error}"));
        if let Err(e) = self
            .stores
            .failed
            .record_failure(date, Stage::Summarize, &error)
        {
            self.reporter
                .warn(&format!("failed to record failure for {date}: {e:#}"));
        }
        DateOutcome::failed(date, error.to_string())
    }

    fn daily_batch(&self, work: &[NaiveDate]) -> Vec<DateOutcome> {
        let (system, preamble) = split_template(DAILY_TEMPLATE);
        let mut outcomes = Vec::new();
        let mut requests: Vec<BatchChatRequest> = Vec::new();
        let mut requested: Vec<NaiveDate> = Vec::new();

        for &date in work {
            match self.daily_user_content(date) {
                Ok(Some(content)) => {
                    requests.push(BatchChatRequest {
                        custom_id: format!("daily-{date}"),
                        system: system.to_string(),
                        user: format!("{preamble}{content}"),
                        json_mode: false,
                        max_tokens: None,
                    });
                    requested.push(date);
                }
                // Empty days do not need a model.
                Ok(None) => {
                    let path = self.root.daily_summary_path(date);
                    let result = atomic_write_string(
                        &path,
                        &format!("# {date}\n\nNo recorded activity.\n"),
                    )
                    .map_err(Self::storage)
                    .and_then(|_| self.mark_summarized(date));
                    outcomes.push(match result {
                        Ok(()) => DateOutcome::success(date),
                        Err(e) => self.fail_date(date, e),
                    });
                }
                Err(e) => outcomes.push(self.fail_date(date, e)),
            }
        }

        if requests.is_empty() {
            return outcomes;
        }

        let results = self
            .router
            .submit_batch(&requests, "daily")
            .and_then(|id| self.router.wait_for_batch(&id, "daily", requests.len()));
        let results = match results {
            Ok(r) => r,
            Err(e) => {
                // The whole batch failed; every requested date fails.
                for date in requested {
                    outcomes
                        .push(self.fail_date(date, Self::llm_err(date.to_string(), e.clone())));
                }
                return outcomes;
            }
        };

        for date in requested {
            let outcome = match results.get(&format!("daily-{date}")) {
                Some(markdown) => {
                    let result =
                        atomic_write_string(&self.root.daily_summary_path(date), markdown)
                            .map_err(Self::storage)
                            .and_then(|_| self.mark_summarized(date));
                    match result {
                        Ok(()) => DateOutcome::success(date),
                        Err(e) => self.fail_date(date, e),
                    }
                }
                None => self.fail_date(
                    date,
                    Self::err(date.to_string(), "batch returned no result for this day"),
                ),
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}
