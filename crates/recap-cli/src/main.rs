use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};

use recap::config::{LlmConfig, PricingTable, RecapConfig};
use recap::engine::{
    Orchestrator, RunRangeOptions, Services, iso_weeks_in, months_in, years_in,
};
use recap::llm::Router;
use recap::report::Reporter;
use recap::state::Stores;
use recap::storage::DataRoot;
use recap::summarize::{SummarizeRangeOptions, Summarizer};
use recap::types::{DateOutcome, ErrorClass, FetchKind, OutcomeStatus, Stage, TypeFilter};

mod progress;

use progress::ConsoleReporter;

#[derive(Parser, Debug)]
#[command(name = "recap", version)]
#[command(about = "Personal activity recaps from a GitHub-compatible Enterprise host")]
struct Cli {
    /// Path to recap.toml
    #[arg(long, default_value = "recap.toml")]
    config: PathBuf,

    /// Path to providers.toml (required for enrichment, summaries, query)
    #[arg(long, default_value = "providers.toml")]
    providers: PathBuf,

    /// Path to pricing.toml (optional; missing entries cost zero)
    #[arg(long, default_value = "pricing.toml")]
    pricing: PathBuf,

    #[command(subcommand)]
    cmd: Commands,
}

/// Date selection shared by the pipeline subcommands. With no dates at all,
/// the command catches up from its stage checkpoint through today.
#[derive(Args, Debug, Clone)]
struct RangeArgs {
    /// Single date (YYYY-MM-DD)
    #[arg(long, conflicts_with_all = ["since", "until"])]
    date: Option<NaiveDate>,

    /// Range start (YYYY-MM-DD)
    #[arg(long, requires = "until")]
    since: Option<NaiveDate>,

    /// Range end (YYYY-MM-DD)
    #[arg(long, requires = "since")]
    until: Option<NaiveDate>,

    /// Re-process even when fresh
    #[arg(long)]
    force: bool,

    /// Worker threads for per-date processing
    #[arg(long)]
    workers: Option<usize>,

    /// Restrict to source kinds: prs, commits, issues (repeatable)
    #[arg(long = "type", value_name = "KIND")]
    types: Vec<String>,
}

impl RangeArgs {
    /// `(since, until)`, falling back to checkpoint-through-today catch-up.
    fn resolve(&self, stores: &Stores, stage: Stage) -> Result<(NaiveDate, NaiveDate)> {
        if let Some(date) = self.date {
            return Ok((date, date));
        }
        if let (Some(since), Some(until)) = (self.since, self.until) {
            return Ok((since, until));
        }
        let today = Utc::now().date_naive();
        let since = match stores.checkpoints.get(stage)? {
            Some(checkpoint) => checkpoint.succ_opt().unwrap_or(today).min(today),
            None => today,
        };
        Ok((since, today))
    }

    fn type_filter(&self) -> Result<TypeFilter> {
        if self.types.is_empty() {
            return Ok(None);
        }
        let mut kinds = Vec::new();
        for raw in &self.types {
            let kind = FetchKind::parse(raw)
                .with_context(|| format!("unknown type '{raw}' (expected prs, commits, issues)"))?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        Ok(Some(kinds))
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch raw activity into data/raw (catch-up when no dates given).
    Fetch {
        #[command(flatten)]
        range: RangeArgs,
    },
    /// Normalize raw files into activities.jsonl + stats.json.
    Normalize {
        #[command(flatten)]
        range: RangeArgs,

        /// Add LLM-generated intent and change-summary fields
        #[arg(long)]
        enrich: bool,

        /// Use provider batch mode for enrichment (cheaper, slower)
        #[arg(long)]
        batch: bool,
    },
    /// Write daily summaries, with optional higher-level cascades.
    Summarize {
        #[command(flatten)]
        range: RangeArgs,

        /// Use provider batch mode for daily summaries
        #[arg(long)]
        batch: bool,

        /// Also roll up weekly summaries
        #[arg(long)]
        weekly: bool,

        /// Also roll up monthly summaries (implies --weekly)
        #[arg(long)]
        monthly: bool,

        /// Also roll up the yearly summary (implies --weekly and --monthly)
        #[arg(long)]
        yearly: bool,
    },
    /// Full fetch -> normalize -> summarize pipeline.
    Run {
        #[command(flatten)]
        range: RangeArgs,

        #[arg(long)]
        enrich: bool,

        #[arg(long)]
        batch: bool,

        #[arg(long)]
        weekly: bool,

        #[arg(long)]
        monthly: bool,

        #[arg(long)]
        yearly: bool,
    },
    /// Ask a question over recent summaries.
    Query {
        question: String,

        /// How many months of summaries to use as context
        #[arg(long, default_value_t = 3)]
        months_back: u32,
    },
    /// Show checkpoints, failed dates, and dates that will not self-heal.
    Status,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[error] {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Programmatic entrypoint; the binary forwards to it.
pub fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let reporter = Arc::new(ConsoleReporter::new());

    // Status only needs the stores; no host token, no providers.
    if matches!(cli.cmd, Commands::Status) {
        let cfg = RecapConfig::load(&cli.config)?;
        return print_status(&cfg);
    }

    let cfg = Arc::new(RecapConfig::load(&cli.config)?);
    let llm_cfg = load_llm_config(&cli)?;
    let services = Services::build(
        Arc::clone(&cfg),
        llm_cfg.as_ref().map(|(l, p)| (l, p.clone())),
        reporter.clone() as Arc<dyn Reporter>,
    )?;

    let max_retries = cfg.fetch.max_date_retries;
    let default_workers = cfg.fetch.max_workers;

    let exit = match cli.cmd {
        Commands::Fetch { range } => {
            let (since, until) = range.resolve(&services.stores, Stage::Fetch)?;
            let opts = recap::fetch::FetchRangeOptions {
                types: range.type_filter()?,
                force: range.force,
                max_workers: range.workers.unwrap_or(default_workers),
            };
            reporter.start_phase(&format!("fetching {since}..{until}"));
            let outcomes = services.fetcher.fetch_range(since, until, &opts);
            reporter.finish_phase();
            finish_range(&services.stores, outcomes?, max_retries)?
        }
        Commands::Normalize {
            range,
            enrich,
            batch,
        } => {
            let (since, until) = range.resolve(&services.stores, Stage::Normalize)?;
            let opts = recap::normalize::NormalizeRangeOptions {
                force: range.force,
                enrich,
                batch,
                max_workers: range.workers.unwrap_or(default_workers),
            };
            reporter.start_phase(&format!("normalizing {since}..{until}"));
            let outcomes = services.normalizer.normalize_range(since, until, &opts);
            reporter.finish_phase();
            let code = finish_range(&services.stores, outcomes?, max_retries)?;
            print_usage(services.router.as_deref());
            code
        }
        Commands::Summarize {
            range,
            batch,
            weekly,
            monthly,
            yearly,
        } => {
            let summarizer = require_summarizer(&services, &cli.providers)?;
            let (since, until) = range.resolve(&services.stores, Stage::Summarize)?;
            let opts = SummarizeRangeOptions {
                force: range.force,
                max_workers: range.workers.unwrap_or(default_workers),
                batch,
            };
            reporter.start_phase(&format!("summarizing {since}..{until}"));
            let outcomes = summarizer.daily_range(since, until, &opts);
            reporter.finish_phase();
            let outcomes = outcomes?;

            let any_failed = outcomes.iter().any(|o| o.status == OutcomeStatus::Failed);
            if (weekly || monthly || yearly) && any_failed {
                reporter.warn("skipping weekly/monthly/yearly cascades: some dates failed");
            } else {
                cascade(summarizer, since, until, weekly, monthly, yearly, range.force)?;
            }

            let code = finish_range(&services.stores, outcomes, max_retries)?;
            print_usage(services.router.as_deref());
            code
        }
        Commands::Run {
            range,
            enrich,
            batch,
            weekly,
            monthly,
            yearly,
        } => {
            if services.summarizer.is_none() {
                bail!(
                    "the run command needs an LLM configuration; provide {}",
                    cli.providers.display()
                );
            }
            let (since, until) = range.resolve(&services.stores, Stage::Fetch)?;
            let opts = RunRangeOptions {
                force: range.force,
                types: range.type_filter()?,
                max_workers: range.workers.unwrap_or(default_workers),
                batch,
                enrich,
                weekly,
                monthly,
                yearly,
            };

            // The orchestrator consumes the stage services for the run;
            // stores and router handles stay shared.
            let Services {
                stores,
                fetcher,
                normalizer,
                summarizer,
                router,
                ..
            } = services;
            let orchestrator = Orchestrator::new(
                fetcher,
                normalizer,
                summarizer.expect("checked above"),
                reporter.clone() as Arc<dyn Reporter>,
            );

            reporter.start_phase(&format!("running pipeline {since}..{until}"));
            let outcomes = orchestrator.run_range(since, until, &opts);
            reporter.finish_phase();
            let code = finish_range(&stores, outcomes?, max_retries)?;
            print_usage(router.as_deref());
            code
        }
        Commands::Query {
            question,
            months_back,
        } => {
            let summarizer = require_summarizer(&services, &cli.providers)?;
            let answer = summarizer.query(&question, months_back)?;
            println!("{answer}");
            print_usage(services.router.as_deref());
            ExitCode::SUCCESS
        }
        Commands::Status => unreachable!("handled above"),
    };

    Ok(exit)
}

fn load_llm_config(cli: &Cli) -> Result<Option<(LlmConfig, PricingTable)>> {
    if !cli.providers.exists() {
        return Ok(None);
    }
    let llm = LlmConfig::load(&cli.providers)?;
    let pricing = if cli.pricing.exists() {
        PricingTable::load(&cli.pricing)?
    } else {
        PricingTable::default()
    };
    Ok(Some((llm, pricing)))
}

fn require_summarizer<'a>(services: &'a Services, providers_path: &Path) -> Result<&'a Summarizer> {
    services.summarizer.as_ref().with_context(|| {
        format!(
            "this command needs an LLM configuration; provide {}",
            providers_path.display()
        )
    })
}

fn cascade(
    summarizer: &Summarizer,
    since: NaiveDate,
    until: NaiveDate,
    weekly: bool,
    monthly: bool,
    yearly: bool,
    force: bool,
) -> Result<()> {
    // Yearly implies monthly implies weekly.
    let weekly = weekly || monthly || yearly;
    let monthly = monthly || yearly;

    if weekly {
        for (year, week) in iso_weeks_in(since, until) {
            summarizer.weekly(year, week, force)?;
        }
    }
    if monthly {
        for (year, month) in months_in(since, until) {
            summarizer.monthly(year, month, force)?;
        }
    }
    if yearly {
        for year in years_in(since, until) {
            summarizer.yearly(year, force)?;
        }
    }
    Ok(())
}

/// Prints the per-date table and the exhausted-date report; a failed date
/// makes the exit code non-zero while the rest of the range still ran.
fn finish_range(
    stores: &Stores,
    outcomes: Vec<DateOutcome>,
    max_retries: u32,
) -> Result<ExitCode> {
    let mut failed = 0usize;
    let mut succeeded = 0usize;
    let mut skipped = 0usize;
    for outcome in &outcomes {
        match outcome.status {
            OutcomeStatus::Success => {
                succeeded += 1;
                println!("{}  success", outcome.date);
            }
            OutcomeStatus::Skipped => {
                skipped += 1;
                println!("{}  skipped", outcome.date);
            }
            OutcomeStatus::Failed => {
                failed += 1;
                println!(
                    "{}  failed   {}",
                    outcome.date,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
    println!("{succeeded} succeeded, {skipped} skipped, {failed} failed");

    let exhausted = stores.failed.exhausted_dates(max_retries)?;
    if !exhausted.is_empty() {
        println!("\ndates that will not self-heal (fix upstream or use --force):");
        for (date, record) in exhausted {
            println!(
                "  {date}  {}  attempts={}  {}",
                match record.classified_as {
                    ErrorClass::Permanent => "permanent",
                    ErrorClass::Retryable => "retryable",
                },
                record.attempt_count,
                record.last_error
            );
        }
    }

    Ok(if failed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_usage(router: Option<&Router>) {
    let Some(router) = router else {
        return;
    };
    let report = router.usage_report();
    if report.rows.is_empty() {
        return;
    }
    println!("\nmodel usage:");
    for row in &report.rows {
        println!(
            "  {}/{}  in={} out={} cache_read={} cache_write={}  ${:.4}",
            row.provider,
            row.model,
            row.usage.input,
            row.usage.output,
            row.usage.cache_read,
            row.usage.cache_write,
            row.cost_usd
        );
    }
    println!("  total: ${:.4}", report.total_cost_usd);
}

fn print_status(cfg: &RecapConfig) -> Result<ExitCode> {
    let root = DataRoot::new(cfg.data_root.clone());
    let stores = Stores::new(&root);

    println!("checkpoints:");
    let checkpoints = stores.checkpoints.all()?;
    if checkpoints.is_empty() {
        println!("  (none)");
    }
    for (key, date) in checkpoints {
        println!("  {key}: {date}");
    }

    println!("\nfailed dates:");
    let all_failures = stores.failed.all()?;
    if all_failures.is_empty() {
        println!("  (none)");
    }
    for (date, record) in &all_failures {
        println!(
            "  {date}  phase={} attempts={} {}",
            record.phase, record.attempt_count, record.last_error
        );
    }

    let exhausted = stores.failed.exhausted_dates(cfg.fetch.max_date_retries)?;
    println!("\nexhausted (will not self-heal): {}", exhausted.len());

    let active = stores.batches.active_jobs()?;
    if !active.is_empty() {
        println!("\nactive provider batches:");
        for (id, record) in active {
            println!(
                "  {id}  task={} size={} submitted={}",
                record.task, record.size, record.submitted_at
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}
