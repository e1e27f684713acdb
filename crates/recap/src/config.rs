//! Configuration files: `recap.toml` (host + pipeline), `providers.toml`
//! (model routing), and `pricing.toml` (cost table).
//!
//! Secrets resolve environment-first so config files can be committed without
//! tokens: `RECAP_HOST_TOKEN` overrides the host token and
//! `RECAP_<PROVIDER>_API_KEY` overrides each provider key.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::types::{deserialize_duration, serialize_duration};

fn default_data_root() -> PathBuf {
    PathBuf::from("data")
}

fn default_pool_size() -> usize {
    4
}

fn default_max_workers() -> usize {
    4
}

fn default_search_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_max_date_retries() -> u32 {
    3
}

fn default_include_own_pr_comments() -> bool {
    true
}

/// Host connection settings (`[host]` in `recap.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Base URL of the GitHub-compatible API, e.g.
    /// `https://ghe.example.com/api/v3`.
    pub base_url: String,
    /// Access token. `RECAP_HOST_TOKEN` wins over this field.
    #[serde(default)]
    pub token: String,
    /// Login whose activity is recapped.
    pub user: String,
}

impl HostConfig {
    /// Env-first token resolution.
    pub fn resolve_token(&self) -> Result<String> {
        if let Ok(tok) = env::var("RECAP_HOST_TOKEN")
            && !tok.is_empty()
        {
            return Ok(tok);
        }
        if self.token.is_empty() {
            bail!("no host token: set RECAP_HOST_TOKEN or [host].token in recap.toml");
        }
        Ok(self.token.clone())
    }
}

/// Fetch/pipeline knobs (`[fetch]` in `recap.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Number of pooled host clients for parallel enrichment.
    pub pool_size: usize,
    /// Default per-range worker count.
    pub max_workers: usize,
    /// Minimum spacing between search-endpoint calls.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub search_interval: Duration,
    /// Per-request HTTP timeout.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub request_timeout: Duration,
    /// How long a worker may wait for a pooled client.
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub acquire_timeout: Duration,
    /// Cap on re-attempts for a retryable failed date.
    pub max_date_retries: u32,
    /// Whether an author's comments on their own PR produce activity.
    pub include_own_pr_comments: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_workers: default_max_workers(),
            search_interval: default_search_interval(),
            request_timeout: default_request_timeout(),
            acquire_timeout: default_acquire_timeout(),
            max_date_retries: default_max_date_retries(),
            include_own_pr_comments: default_include_own_pr_comments(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecapConfig {
    pub host: HostConfig,
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    #[serde(default)]
    pub fetch: FetchConfig,
}

impl RecapConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let cfg: RecapConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        if cfg.host.base_url.is_empty() {
            bail!("[host].base_url must not be empty in {}", path.display());
        }
        if cfg.host.user.is_empty() {
            bail!("[host].user must not be empty in {}", path.display());
        }
        Ok(cfg)
    }
}

// ---------------------------------------------------------------------------
// Model routing (`providers.toml`)
// ---------------------------------------------------------------------------

/// Escalation strategy applied across every task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Always the base model, never escalate.
    Economy,
    /// Base model first; escalate only on structured-output or
    /// content-limit failures.
    #[default]
    Standard,
    /// Escalation model when configured, base model otherwise.
    Premium,
    /// Confidence-gated two-pass: base model self-scores, low confidence
    /// re-runs on the escalation model.
    Adaptive,
    /// Exactly the task-configured model.
    Fixed,
}

/// Per-provider credentials (`[providers.<name>]`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderSettings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ProviderSettings {
    /// `RECAP_<PROVIDER>_API_KEY` wins over the file value.
    pub fn resolve_api_key(&self, provider: &str) -> Result<String> {
        let var = format!(
            "RECAP_{}_API_KEY",
            provider.to_ascii_uppercase().replace('-', "_")
        );
        if let Ok(key) = env::var(&var)
            && !key.is_empty()
        {
            return Ok(key);
        }
        if self.api_key.is_empty() {
            bail!("no API key for provider '{provider}': set {var} or providers.toml");
        }
        Ok(self.api_key.clone())
    }
}

/// Task binding (`[tasks.<task>]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBinding {
    pub provider: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    #[serde(default)]
    pub tasks: BTreeMap<String, TaskBinding>,
}

impl LlmConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read provider config {}", path.display()))?;
        let cfg: LlmConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse provider config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Every task must reference a configured provider; fail fast otherwise.
    pub fn validate(&self) -> Result<()> {
        for (task, binding) in &self.tasks {
            if !self.providers.contains_key(&binding.provider) {
                bail!(
                    "task '{}' references provider '{}' which is not configured",
                    task,
                    binding.provider
                );
            }
        }
        Ok(())
    }

    pub fn task(&self, task: &str) -> Option<&TaskBinding> {
        self.tasks.get(task)
    }
}

// ---------------------------------------------------------------------------
// Pricing (`pricing.toml`)
// ---------------------------------------------------------------------------

/// Dollars per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

/// provider -> model -> pricing.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PricingTable {
    #[serde(flatten)]
    pub providers: BTreeMap<String, BTreeMap<String, ModelPricing>>,
}

impl PricingTable {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read pricing {}", path.display()))?;
        let table: PricingTable = toml::from_str(&content)
            .with_context(|| format!("failed to parse pricing {}", path.display()))?;
        Ok(table)
    }

    pub fn lookup(&self, provider: &str, model: &str) -> Option<ModelPricing> {
        self.providers.get(provider)?.get(model).copied()
    }
}
