//! Orchestrator: thin composer over the three stage services.
//!
//! `run_daily` executes fetch -> normalize -> summarize for one date,
//! rewrapping stage errors with their step. `run_range` delegates to the
//! services' own range methods (the per-date loop lives inside each service,
//! not here) and then drives the optional weekly/monthly/yearly cascades.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Datelike, NaiveDate};

use crate::config::{LlmConfig, PricingTable, RecapConfig};
use crate::fetch::{FetchRangeOptions, Fetcher, date_range};
use crate::host::ClientPool;
use crate::llm::Router;
use crate::normalize::{NormalizeRangeOptions, Normalizer};
use crate::report::Reporter;
use crate::state::Stores;
use crate::storage::DataRoot;
use crate::summarize::{SummarizeRangeOptions, Summarizer};
use crate::types::{DateOutcome, OutcomeStatus, RecapError, Stage, TypeFilter};

/// Option bag for `run_range`. The `types` filter is definitive: cascade
/// flags never re-enable a filtered-out kind.
#[derive(Debug, Clone, Default)]
pub struct RunRangeOptions {
    pub force: bool,
    pub types: TypeFilter,
    pub max_workers: usize,
    pub batch: bool,
    pub enrich: bool,
    pub weekly: bool,
    pub monthly: bool,
    pub yearly: bool,
}

pub struct Orchestrator {
    fetcher: Fetcher,
    normalizer: Normalizer,
    summarizer: Summarizer,
    reporter: Arc<dyn Reporter>,
}

impl Orchestrator {
    pub fn new(
        fetcher: Fetcher,
        normalizer: Normalizer,
        summarizer: Summarizer,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        Self {
            fetcher,
            normalizer,
            summarizer,
            reporter,
        }
    }

    /// Fetch -> normalize -> summarize for one date. A failing stage stops
    /// the chain; prior stage outputs stay on disk.
    pub fn run_daily(
        &self,
        date: NaiveDate,
        types: &TypeFilter,
        enrich: bool,
    ) -> Result<(), RecapError> {
        self.fetcher
            .fetch(date, types)
            .map_err(|e| RecapError::step(Stage::Fetch, e))?;
        self.normalizer
            .normalize(date, enrich)
            .map_err(|e| RecapError::step(Stage::Normalize, e))?;
        self.summarizer
            .daily(date)
            .map_err(|e| RecapError::step(Stage::Summarize, e))?;
        Ok(())
    }

    /// Range run: the three services process the range in sequence, the
    /// per-date outcomes merge (a failure in any stage marks the date
    /// failed), then cascades run when requested and the daily pipeline was
    /// clean. `--yearly` implies monthly and weekly first.
    pub fn run_range(
        &self,
        since: NaiveDate,
        until: NaiveDate,
        opts: &RunRangeOptions,
    ) -> Result<Vec<DateOutcome>, RecapError> {
        let fetch_outcomes = self.fetcher.fetch_range(
            since,
            until,
            &FetchRangeOptions {
                types: opts.types.clone(),
                force: opts.force,
                max_workers: opts.max_workers,
            },
        )?;
        let normalize_outcomes = self.normalizer.normalize_range(
            since,
            until,
            &NormalizeRangeOptions {
                force: opts.force,
                enrich: opts.enrich,
                batch: opts.batch,
                max_workers: opts.max_workers,
            },
        )?;
        let summarize_outcomes = self.summarizer.daily_range(
            since,
            until,
            &SummarizeRangeOptions {
                force: opts.force,
                max_workers: opts.max_workers,
                batch: opts.batch,
            },
        )?;

        let merged = merge_outcomes([fetch_outcomes, normalize_outcomes, summarize_outcomes]);
        let any_failed = merged
            .iter()
            .any(|o| o.status == OutcomeStatus::Failed);

        let weekly = opts.weekly || opts.monthly || opts.yearly;
        let monthly = opts.monthly || opts.yearly;
        if weekly {
            if any_failed {
                self.reporter.warn(
                    "skipping weekly/monthly/yearly cascades: the daily pipeline reported failures",
                );
            } else {
                for (year, week) in iso_weeks_in(since, until) {
                    self.summarizer
                        .weekly(year, week, opts.force)
                        .map_err(|e| RecapError::step(Stage::Summarize, e))?;
                }
                if monthly {
                    for (year, month) in months_in(since, until) {
                        self.summarizer
                            .monthly(year, month, opts.force)
                            .map_err(|e| RecapError::step(Stage::Summarize, e))?;
                    }
                }
                if opts.yearly {
                    for year in years_in(since, until) {
                        self.summarizer
                            .yearly(year, opts.force)
                            .map_err(|e| RecapError::step(Stage::Summarize, e))?;
                    }
                }
            }
        }

        Ok(merged)
    }
}

/// Per-date merge across stages: any failure dominates (first error kept),
/// then success, then skipped.
fn merge_outcomes<const N: usize>(stages: [Vec<DateOutcome>; N]) -> Vec<DateOutcome> {
    let mut merged: BTreeMap<NaiveDate, DateOutcome> = BTreeMap::new();
    for stage in stages {
        for outcome in stage {
            match merged.get(&outcome.date) {
                None => {
                    merged.insert(outcome.date, outcome);
                }
                Some(existing) => {
                    let replace = match (existing.status, outcome.status) {
                        (OutcomeStatus::Failed, _) => false,
                        (_, OutcomeStatus::Failed) => true,
                        (OutcomeStatus::Skipped, OutcomeStatus::Success) => true,
                        _ => false,
                    };
                    if replace {
                        merged.insert(outcome.date, outcome);
                    }
                }
            }
        }
    }
    merged.into_values().collect()
}

/// Distinct ISO weeks touched by the range, in order.
pub fn iso_weeks_in(since: NaiveDate, until: NaiveDate) -> Vec<(i32, u32)> {
    let mut out: Vec<(i32, u32)> = Vec::new();
    for date in date_range(since, until) {
        let iso = date.iso_week();
        let pair = (iso.year(), iso.week());
        if out.last() != Some(&pair) {
            out.push(pair);
        }
    }
    out
}

pub fn months_in(since: NaiveDate, until: NaiveDate) -> Vec<(i32, u32)> {
    let mut out: Vec<(i32, u32)> = Vec::new();
    for date in date_range(since, until) {
        let pair = (date.year(), date.month());
        if out.last() != Some(&pair) {
            out.push(pair);
        }
    }
    out
}

pub fn years_in(since: NaiveDate, until: NaiveDate) -> Vec<i32> {
    let mut out: Vec<i32> = Vec::new();
    for date in date_range(since, until) {
        if out.last() != Some(&date.year()) {
            out.push(date.year());
        }
    }
    out
}

/// Everything a front-end needs, wired from configuration. The router (and
/// with it the summarizer) is optional so fetch/normalize-only setups work
/// without provider credentials.
pub struct Services {
    pub stores: Arc<Stores>,
    pub root: DataRoot,
    pub fetcher: Fetcher,
    pub normalizer: Normalizer,
    pub summarizer: Option<Summarizer>,
    pub router: Option<Arc<Router>>,
}

impl Services {
    pub fn build(
        cfg: Arc<RecapConfig>,
        llm: Option<(&LlmConfig, PricingTable)>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self> {
        let root = DataRoot::new(cfg.data_root.clone());
        let stores = Arc::new(Stores::new(&root));
        let pool = Arc::new(ClientPool::from_config(&cfg, Arc::clone(&reporter))?);

        let router = match llm {
            Some((llm_cfg, pricing)) => Some(Arc::new(Router::from_config(
                llm_cfg,
                pricing,
                Arc::new(crate::state::BatchJobStore::new(&root)),
                Arc::clone(&reporter),
            )?)),
            None => None,
        };

        let fetcher = Fetcher::new(
            Arc::clone(&cfg),
            root.clone(),
            pool,
            Arc::clone(&stores),
            Arc::clone(&reporter),
        );
        let normalizer = Normalizer::new(
            Arc::clone(&cfg),
            root.clone(),
            Arc::clone(&stores),
            router.clone(),
            Arc::clone(&reporter),
        );
        let summarizer = router.clone().map(|router| {
            Summarizer::new(
                Arc::clone(&cfg),
                root.clone(),
                Arc::clone(&stores),
                router,
                Arc::clone(&reporter),
            )
        });

        Ok(Self {
            stores,
            root,
            fetcher,
            normalizer,
            summarizer,
            router,
        })
    }
}
