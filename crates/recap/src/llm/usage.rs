//! Per-model token accounting and cost estimation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::provider::TokenUsage;
use crate::config::PricingTable;
use crate::report::Reporter;

/// Provider-specific cache pricing, as a fraction of base input price.
fn cache_read_factor(provider: &str) -> f64 {
    match provider {
        "anthropic" => 0.10,
        "openai" => 0.50,
        "gemini" => 0.25,
        _ => 1.0,
    }
}

fn cache_write_factor(provider: &str) -> f64 {
    match provider {
        "anthropic" => 1.25,
        _ => 1.0,
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UsageRow {
    pub provider: String,
    pub model: String,
    pub usage: TokenUsage,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct UsageReport {
    pub rows: Vec<UsageRow>,
    pub total_cost_usd: f64,
}

/// Thread-safe accumulator of per-(provider, model) token totals.
///
/// Absent pricing entries degrade to zero cost with a single warning per
/// model so a missing row never blocks a run.
pub struct UsageTracker {
    totals: Mutex<BTreeMap<(String, String), TokenUsage>>,
    pricing: PricingTable,
    warned: Mutex<BTreeSet<(String, String)>>,
    reporter: Arc<dyn Reporter>,
}

impl UsageTracker {
    pub fn new(pricing: PricingTable, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            totals: Mutex::new(BTreeMap::new()),
            pricing,
            warned: Mutex::new(BTreeSet::new()),
            reporter,
        }
    }

    pub fn record(&self, provider: &str, model: &str, usage: &TokenUsage) {
        let mut totals = self.totals.lock().unwrap();
        totals
            .entry((provider.to_string(), model.to_string()))
            .or_default()
            .add(usage);
    }

    fn cost_for(&self, provider: &str, model: &str, usage: &TokenUsage) -> f64 {
        let Some(pricing) = self.pricing.lookup(provider, model) else {
            let key = (provider.to_string(), model.to_string());
            if self.warned.lock().unwrap().insert(key) {
                self.reporter.warn(&format!(
                    "no pricing entry for {provider}/{model}; reporting zero cost"
                ));
            }
            return 0.0;
        };

        let per_million = |tokens: u64, rate: f64| tokens as f64 * rate / 1_000_000.0;
        per_million(usage.input, pricing.input)
            + per_million(usage.output, pricing.output)
            + per_million(usage.cache_read, pricing.input * cache_read_factor(provider))
            + per_million(
                usage.cache_write,
                pricing.input * cache_write_factor(provider),
            )
    }

    pub fn report(&self) -> UsageReport {
        let totals = self.totals.lock().unwrap();
        let mut rows = Vec::with_capacity(totals.len());
        let mut total = 0.0;
        for ((provider, model), usage) in totals.iter() {
            let cost = self.cost_for(provider, model, usage);
            total += cost;
            rows.push(UsageRow {
                provider: provider.clone(),
                model: model.clone(),
                usage: *usage,
                cost_usd: cost,
            });
        }
        UsageReport {
            rows,
            total_cost_usd: total,
        }
    }
}
