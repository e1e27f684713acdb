//! Task-keyed LLM router.
//!
//! Maps a high-level task (`enrich`, `daily`, `weekly`, `monthly`, `yearly`,
//! `query`) to a provider + model + optional escalation model, then performs
//! a chat or batch-chat with uniform structured-output and prompt-caching
//! options. Records per-model token and cost usage as it goes.

pub mod provider;
pub mod usage;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use crate::config::{LlmConfig, PricingTable, Strategy, TaskBinding};
use crate::report::Reporter;
use crate::state::BatchJobStore;
use crate::types::{BatchRecord, BatchStatus};
use provider::{
    AnthropicProvider, BatchChatRequest, ChatOptions, GeminiProvider, OpenAiProvider, Provider,
};
use usage::{UsageReport, UsageTracker};

/// Confidence floor under which the adaptive strategy escalates.
const ADAPTIVE_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// Fixed envelope prompt. The task's real instructions travel in the user
/// content, which an escalation re-run sends unchanged.
const ADAPTIVE_SYSTEM: &str = "Answer the request in the user message. Respond with a single \
JSON object {\"answer\": \"<your full answer>\", \"confidence\": <0..1>} where confidence is \
your own estimate that the answer is correct and complete.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmErrorKind {
    /// Could not reach the provider at all.
    Transport,
    /// Provider answered with an error payload.
    Api,
    /// The model ran out of output budget before emitting content.
    ContentLimit,
    /// The model failed to honor the structured-output contract.
    StructuredOutput,
}

#[derive(Debug, Clone, Error)]
#[error("{provider}: {reason}")]
pub struct LlmError {
    pub provider: String,
    pub reason: String,
    pub status: Option<u16>,
    pub kind: LlmErrorKind,
}

impl LlmError {
    fn routing(reason: String) -> Self {
        Self {
            provider: "router".to_string(),
            reason,
            status: None,
            kind: LlmErrorKind::Api,
        }
    }
}

pub struct Router {
    strategy: Strategy,
    tasks: BTreeMap<String, TaskBinding>,
    providers: BTreeMap<String, Box<dyn Provider>>,
    usage: UsageTracker,
    batch_jobs: Arc<BatchJobStore>,
    reporter: Arc<dyn Reporter>,
}

impl Router {
    /// Builds every configured provider adapter up front and fails fast on an
    /// invalid configuration (unknown provider reference, generic endpoint
    /// without a base URL, missing credentials).
    pub fn from_config(
        cfg: &LlmConfig,
        pricing: PricingTable,
        batch_jobs: Arc<BatchJobStore>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self> {
        cfg.validate()?;

        let mut providers: BTreeMap<String, Box<dyn Provider>> = BTreeMap::new();
        for (name, settings) in &cfg.providers {
            let api_key = settings.resolve_api_key(name)?;
            let adapter: Box<dyn Provider> = match name.as_str() {
                "anthropic" => Box::new(
                    AnthropicProvider::new(api_key, settings.base_url.clone())
                        .map_err(|e| anyhow::anyhow!("{e}"))?,
                ),
                "gemini" => Box::new(
                    GeminiProvider::new(api_key, settings.base_url.clone())
                        .map_err(|e| anyhow::anyhow!("{e}"))?,
                ),
                "openai" => Box::new(
                    OpenAiProvider::openai(api_key, settings.base_url.clone())
                        .map_err(|e| anyhow::anyhow!("{e}"))?,
                ),
                other => {
                    let base = settings.base_url.clone().with_context(|| {
                        format!("provider '{other}' is OpenAI-compatible generic and requires base_url")
                    })?;
                    Box::new(
                        OpenAiProvider::generic(other, api_key, base)
                            .map_err(|e| anyhow::anyhow!("{e}"))?,
                    )
                }
            };
            providers.insert(name.clone(), adapter);
        }

        Ok(Self {
            strategy: cfg.strategy,
            tasks: cfg.tasks.clone(),
            providers,
            usage: UsageTracker::new(pricing, Arc::clone(&reporter)),
            batch_jobs,
            reporter,
        })
    }

    pub fn usage_report(&self) -> UsageReport {
        self.usage.report()
    }

    fn binding(&self, task: &str) -> Result<&TaskBinding, LlmError> {
        self.tasks
            .get(task)
            .ok_or_else(|| LlmError::routing(format!("no task binding for '{task}'")))
    }

    fn provider_for(&self, binding: &TaskBinding) -> &dyn Provider {
        // validate() guarantees the provider exists.
        self.providers
            .get(&binding.provider)
            .expect("task provider was validated at construction")
            .as_ref()
    }

    fn call(
        &self,
        binding: &TaskBinding,
        model: &str,
        system: &str,
        user: &str,
        opts: &ChatOptions,
    ) -> Result<String, LlmError> {
        let provider = self.provider_for(binding);
        let outcome = provider.chat(model, system, user, opts)?;
        self.usage.record(&binding.provider, model, &outcome.usage);
        Ok(outcome.text)
    }

    /// Uniform chat. `max_tokens` resolution order: explicit argument, then
    /// task config, then unset.
    pub fn chat(
        &self,
        system: &str,
        user: &str,
        task: &str,
        json_mode: bool,
        max_tokens: Option<u32>,
        cache_system_prompt: bool,
    ) -> Result<String, LlmError> {
        let binding = self.binding(task)?;
        let opts = ChatOptions {
            json_mode,
            max_tokens: max_tokens.or(binding.max_tokens),
            cache_system_prompt,
        };

        match self.strategy {
            Strategy::Economy | Strategy::Fixed => {
                self.call(binding, &binding.model, system, user, &opts)
            }
            Strategy::Premium => {
                let model = binding.escalation_model.as_deref().unwrap_or(&binding.model);
                self.call(binding, model, system, user, &opts)
            }
            Strategy::Standard => {
                match self.call(binding, &binding.model, system, user, &opts) {
                    Err(e)
                        if matches!(
                            e.kind,
                            LlmErrorKind::ContentLimit | LlmErrorKind::StructuredOutput
                        ) && binding.escalation_model.is_some() =>
                    {
                        let escalation = binding.escalation_model.as_deref().unwrap();
                        self.reporter.warn(&format!(
                            "task '{task}': {} on {}; escalating to {escalation}",
                            e.reason, binding.model
                        ));
                        self.call(binding, escalation, system, user, &opts)
                    }
                    other => other,
                }
            }
            Strategy::Adaptive => self.chat_adaptive(task, binding, system, user, &opts),
        }
    }

    /// Confidence-gated two-pass chat. The caller's system prompt is folded
    /// into the user content under a lean fixed envelope prompt; a
    /// sub-threshold confidence re-runs the same user content on the
    /// escalation model. A malformed envelope falls back to the raw first
    /// answer with no escalation.
    fn chat_adaptive(
        &self,
        task: &str,
        binding: &TaskBinding,
        system: &str,
        user: &str,
        opts: &ChatOptions,
    ) -> Result<String, LlmError> {
        let merged_user = if system.is_empty() {
            user.to_string()
        } else {
            format!("{system}\n\n{user}")
        };
        let envelope_opts = ChatOptions {
            json_mode: true,
            ..opts.clone()
        };

        let first = self.call(binding, &binding.model, ADAPTIVE_SYSTEM, &merged_user, &envelope_opts)?;
        let Some((answer, confidence)) = parse_adaptive_envelope(&first) else {
            return Ok(first);
        };
        if confidence >= ADAPTIVE_CONFIDENCE_THRESHOLD {
            return Ok(answer);
        }
        let Some(escalation) = binding.escalation_model.as_deref() else {
            return Ok(answer);
        };

        self.reporter.info(&format!(
            "task '{task}': confidence {confidence:.2} below {ADAPTIVE_CONFIDENCE_THRESHOLD}, escalating {} -> {escalation}",
            binding.model
        ));
        match self.call(binding, escalation, ADAPTIVE_SYSTEM, &merged_user, &envelope_opts) {
            Ok(second) => Ok(parse_adaptive_envelope(&second)
                .map(|(a, _)| a)
                .unwrap_or(second)),
            Err(e) => {
                self.reporter
                    .warn(&format!("task '{task}': escalation failed ({e}), keeping base answer"));
                Ok(answer)
            }
        }
    }

    // -- batch interface ----------------------------------------------------

    fn batch_provider<'a>(
        &'a self,
        binding: &TaskBinding,
    ) -> Result<&'a dyn provider::BatchProvider, LlmError> {
        self.provider_for(binding).batch().ok_or_else(|| {
            LlmError::routing(format!(
                "provider '{}' does not support batch submission",
                binding.provider
            ))
        })
    }

    /// Submits one provider batch. Batch requests never escalate; they always
    /// use the task's base model. The provider batch id is persisted so a
    /// crashed run can resume polling.
    pub fn submit_batch(
        &self,
        requests: &[BatchChatRequest],
        task: &str,
    ) -> Result<String, LlmError> {
        let binding = self.binding(task)?;
        let batch = self.batch_provider(binding)?;

        let resolved: Vec<BatchChatRequest> = requests
            .iter()
            .map(|r| BatchChatRequest {
                max_tokens: r.max_tokens.or(binding.max_tokens),
                ..r.clone()
            })
            .collect();

        let id = batch.submit(&binding.model, &resolved)?;

        let record = BatchRecord {
            provider: binding.provider.clone(),
            task: task.to_string(),
            submitted_at: Utc::now(),
            status: BatchStatus::InProgress,
            custom_id_prefix: common_prefix(requests),
            size: requests.len(),
        };
        if let Err(e) = self.batch_jobs.save(&id, record) {
            // The provider already accepted the batch; losing the local
            // record only degrades crash recovery.
            self.reporter
                .warn(&format!("failed to persist batch job {id}: {e:#}"));
        }

        self.reporter.info(&format!(
            "submitted batch {id} ({} requests) for task '{task}'",
            requests.len()
        ));
        Ok(id)
    }

    pub fn get_batch_status(&self, id: &str, task: &str) -> Result<BatchStatus, LlmError> {
        let binding = self.binding(task)?;
        let status = self.batch_provider(binding)?.status(id)?;
        if let Err(e) = self.batch_jobs.update_status(id, status) {
            self.reporter
                .warn(&format!("failed to persist batch status for {id}: {e:#}"));
        }
        Ok(status)
    }

    pub fn get_batch_results(
        &self,
        id: &str,
        task: &str,
    ) -> Result<BTreeMap<String, String>, LlmError> {
        let binding = self.binding(task)?;
        let (results, usage) = self.batch_provider(binding)?.results(id)?;
        self.usage.record(&binding.provider, &binding.model, &usage);
        Ok(results)
    }

    /// Polls until the batch reaches a terminal state. The interval ramps
    /// linearly from 5 s to 60 s across the expected duration; the timeout is
    /// `min(300 + 30 * size, 14400)` seconds.
    pub fn wait_for_batch(
        &self,
        id: &str,
        task: &str,
        size: usize,
    ) -> Result<BTreeMap<String, String>, LlmError> {
        let timeout = batch_timeout(size);
        let start = Instant::now();

        loop {
            match self.get_batch_status(id, task)? {
                BatchStatus::Completed => return self.get_batch_results(id, task),
                BatchStatus::Failed => {
                    return Err(LlmError::routing(format!("batch {id} failed")));
                }
                BatchStatus::Expired => {
                    return Err(LlmError::routing(format!("batch {id} expired")));
                }
                BatchStatus::InProgress => {}
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(LlmError::routing(format!(
                    "batch {id} did not finish within {}s",
                    timeout.as_secs()
                )));
            }
            let interval = batch_poll_interval(elapsed, timeout);
            thread::sleep(interval.min(timeout - elapsed));
        }
    }
}

fn batch_timeout(size: usize) -> Duration {
    Duration::from_secs((300 + 30 * size as u64).min(14_400))
}

fn batch_poll_interval(elapsed: Duration, timeout: Duration) -> Duration {
    let frac = (elapsed.as_secs_f64() / timeout.as_secs_f64()).clamp(0.0, 1.0);
    Duration::from_secs_f64(5.0 + (60.0 - 5.0) * frac)
}

fn common_prefix(requests: &[BatchChatRequest]) -> String {
    let Some(first) = requests.first() else {
        return String::new();
    };
    let mut prefix = first.custom_id.clone();
    for r in &requests[1..] {
        while !r.custom_id.starts_with(&prefix) {
            prefix.pop();
            if prefix.is_empty() {
                return prefix;
            }
        }
    }
    prefix
}

/// `{"answer": ..., "confidence": ...}` or nothing.
fn parse_adaptive_envelope(text: &str) -> Option<(String, f64)> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    let answer = value.get("answer")?;
    let answer = match answer.as_str() {
        Some(s) => s.to_string(),
        None => answer.to_string(),
    };
    let confidence = value.get("confidence")?.as_f64()?;
    Some((answer, confidence))
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serial_test::serial;
    use tempfile::tempdir;
    use tiny_http::{Header, Response, Server};

    use super::*;
    use crate::config::{ModelPricing, ProviderSettings};
    use crate::report::{CollectingReporter, NullReporter};
    use crate::storage::DataRoot;

    fn with_multi_server<F>(handler: F, request_count: usize) -> (String, thread::JoinHandle<()>)
    where
        F: Fn(tiny_http::Request) + Send + 'static,
    {
        let server = Server::http("127.0.0.1:0").expect("server");
        let addr = format!("http://{}", server.server_addr());
        let handle = thread::spawn(move || {
            for _ in 0..request_count {
                match server.recv_timeout(Duration::from_secs(10)) {
                    Ok(Some(req)) => handler(req),
                    _ => break,
                }
            }
        });
        (addr, handle)
    }

    fn body_json(req: &mut tiny_http::Request) -> Value {
        let mut buf = String::new();
        req.as_reader().read_to_string(&mut buf).expect("read body");
        serde_json::from_str(&buf).expect("body JSON")
    }

    fn json_response(body: String) -> Response<std::io::Cursor<Vec<u8>>> {
        Response::from_string(body).with_header(
            Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
        )
    }

    fn openai_completion(content: &str) -> String {
        serde_json::json!({
            "choices": [{"message": {"content": content}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5},
        })
        .to_string()
    }

    fn config_with(strategy: Strategy, base_url: &str, escalation: Option<&str>) -> LlmConfig {
        let mut cfg = LlmConfig {
            strategy,
            providers: BTreeMap::new(),
            tasks: BTreeMap::new(),
        };
        cfg.providers.insert(
            "openai".to_string(),
            ProviderSettings {
                api_key: "sk-test".to_string(),
                base_url: Some(base_url.to_string()),
            },
        );
        cfg.tasks.insert(
            "enrich".to_string(),
            TaskBinding {
                provider: "openai".to_string(),
                model: "cheap".to_string(),
                escalation_model: escalation.map(str::to_string),
                max_tokens: Some(1000),
            },
        );
        cfg
    }

    fn router_for(cfg: &LlmConfig, reporter: Arc<dyn Reporter>) -> (Router, tempfile::TempDir) {
        let td = tempdir().expect("tempdir");
        let root = DataRoot::new(td.path().join("data"));
        let mut pricing = PricingTable::default();
        pricing.providers.insert(
            "openai".to_string(),
            BTreeMap::from([
                (
                    "cheap".to_string(),
                    ModelPricing {
                        input: 1.0,
                        output: 2.0,
                    },
                ),
                (
                    "strong".to_string(),
                    ModelPricing {
                        input: 5.0,
                        output: 10.0,
                    },
                ),
            ]),
        );
        let router =
            Router::from_config(cfg, pricing, Arc::new(BatchJobStore::new(&root)), reporter)
                .expect("router");
        (router, td)
    }

    #[test]
    #[serial]
    fn economy_uses_base_model_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let (base, handle) = with_multi_server(
            move |mut req| {
                calls_in.fetch_add(1, Ordering::SeqCst);
                let body = body_json(&mut req);
                assert_eq!(body["model"], "cheap");
                req.respond(json_response(openai_completion("answer"))).expect("respond");
            },
            1,
        );

        let cfg = config_with(Strategy::Economy, &base, Some("strong"));
        let (router, _td) = router_for(&cfg, Arc::new(NullReporter));
        let out = router
            .chat("sys", "user", "enrich", false, None, true)
            .expect("chat");
        assert_eq!(out, "answer");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        handle.join().expect("join");
    }

    #[test]
    #[serial]
    fn premium_prefers_escalation_model() {
        let (base, handle) = with_multi_server(
            move |mut req| {
                let body = body_json(&mut req);
                assert_eq!(body["model"], "strong");
                req.respond(json_response(openai_completion("big answer"))).expect("respond");
            },
            1,
        );

        let cfg = config_with(Strategy::Premium, &base, Some("strong"));
        let (router, _td) = router_for(&cfg, Arc::new(NullReporter));
        let out = router
            .chat("sys", "user", "enrich", false, None, true)
            .expect("chat");
        assert_eq!(out, "big answer");
        handle.join().expect("join");
    }

    #[test]
    #[serial]
    fn standard_escalates_on_content_limit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let (base, handle) = with_multi_server(
            move |mut req| {
                let n = calls_in.fetch_add(1, Ordering::SeqCst);
                let body = body_json(&mut req);
                if n == 0 {
                    assert_eq!(body["model"], "cheap");
                    req.respond(json_response(
                        serde_json::json!({
                            "choices": [{"message": {"content": ""}, "finish_reason": "length"}],
                            "usage": {"prompt_tokens": 10, "completion_tokens": 0},
                        })
                        .to_string(),
                    ))
                    .expect("respond");
                } else {
                    assert_eq!(body["model"], "strong");
                    req.respond(json_response(openai_completion("full answer")))
                        .expect("respond");
                }
            },
            2,
        );

        let cfg = config_with(Strategy::Standard, &base, Some("strong"));
        let (router, _td) = router_for(&cfg, Arc::new(NullReporter));
        let out = router
            .chat("sys", "user", "enrich", false, None, true)
            .expect("chat");
        assert_eq!(out, "full answer");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        handle.join().expect("join");
    }

    #[test]
    #[serial]
    fn adaptive_escalates_below_confidence_threshold() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let (base, handle) = with_multi_server(
            move |mut req| {
                let n = calls_in.fetch_add(1, Ordering::SeqCst);
                let body = body_json(&mut req);
                // The real instructions travel in the user content; the lean
                // envelope prompt is the system turn.
                let system = body["messages"][0]["content"].as_str().unwrap();
                let user = body["messages"][1]["content"].as_str().unwrap();
                assert!(system.contains("confidence"));
                assert!(user.contains("real instructions"));
                assert!(user.contains("the data"));

                if n == 0 {
                    assert_eq!(body["model"], "cheap");
                    req.respond(json_response(openai_completion(
                        r#"{"answer": "meh", "confidence": 0.4}"#,
                    )))
                    .expect("respond");
                } else {
                    assert_eq!(body["model"], "strong");
                    req.respond(json_response(openai_completion(
                        r#"{"answer": "solid", "confidence": 0.95}"#,
                    )))
                    .expect("respond");
                }
            },
            2,
        );

        let cfg = config_with(Strategy::Adaptive, &base, Some("strong"));
        let (router, _td) = router_for(&cfg, Arc::new(NullReporter));
        let out = router
            .chat("real instructions", "the data", "enrich", false, None, true)
            .expect("chat");
        assert_eq!(out, "solid");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Both calls recorded: 2 models in the usage report.
        let report = router.usage_report();
        assert_eq!(report.rows.len(), 2);
        handle.join().expect("join");
    }

    #[test]
    #[serial]
    fn adaptive_high_confidence_answers_without_escalation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let (base, handle) = with_multi_server(
            move |req| {
                calls_in.fetch_add(1, Ordering::SeqCst);
                req.respond(json_response(openai_completion(
                    r#"{"answer": "confident", "confidence": 0.93}"#,
                )))
                .expect("respond");
            },
            1,
        );

        let cfg = config_with(Strategy::Adaptive, &base, Some("strong"));
        let (router, _td) = router_for(&cfg, Arc::new(NullReporter));
        let out = router
            .chat("sys", "user", "enrich", false, None, true)
            .expect("chat");
        assert_eq!(out, "confident");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        handle.join().expect("join");
    }

    #[test]
    #[serial]
    fn adaptive_malformed_envelope_returns_raw_text_without_escalation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let (base, handle) = with_multi_server(
            move |req| {
                calls_in.fetch_add(1, Ordering::SeqCst);
                req.respond(json_response(openai_completion("not json at all")))
                    .expect("respond");
            },
            1,
        );

        let cfg = config_with(Strategy::Adaptive, &base, Some("strong"));
        let (router, _td) = router_for(&cfg, Arc::new(NullReporter));
        let out = router
            .chat("sys", "user", "enrich", false, None, true)
            .expect("chat");
        assert_eq!(out, "not json at all");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        handle.join().expect("join");
    }

    #[test]
    #[serial]
    fn batch_against_incapable_provider_is_a_clear_error() {
        let cfg = config_with(Strategy::Standard, "http://127.0.0.1:9", None);
        let (router, _td) = router_for(&cfg, Arc::new(NullReporter));

        let err = router
            .submit_batch(
                &[BatchChatRequest {
                    custom_id: "daily-2025-02-16".to_string(),
                    system: "s".to_string(),
                    user: "u".to_string(),
                    json_mode: false,
                    max_tokens: None,
                }],
                "enrich",
            )
            .expect_err("must fail");
        assert!(err.reason.contains("does not support batch"));
    }

    #[test]
    #[serial]
    fn unknown_task_is_a_routing_error() {
        let cfg = config_with(Strategy::Standard, "http://127.0.0.1:9", None);
        let (router, _td) = router_for(&cfg, Arc::new(NullReporter));
        let err = router
            .chat("s", "u", "unmapped", false, None, true)
            .expect_err("must fail");
        assert!(err.reason.contains("no task binding"));
    }

    #[test]
    #[serial]
    fn standard_without_escalation_surfaces_the_error() {
        let (base, handle) = with_multi_server(
            move |req| {
                req.respond(json_response(
                    serde_json::json!({
                        "choices": [{"message": {"content": ""}, "finish_reason": "length"}],
                        "usage": {"prompt_tokens": 10, "completion_tokens": 0},
                    })
                    .to_string(),
                ))
                .expect("respond");
            },
            1,
        );

        let cfg = config_with(Strategy::Standard, &base, None);
        let (router, _td) = router_for(&cfg, CollectingReporter::new());
        let err = router
            .chat("s", "u", "enrich", false, None, true)
            .expect_err("must fail");
        assert_eq!(err.kind, LlmErrorKind::ContentLimit);
        handle.join().expect("join");
    }

    #[test]
    fn batch_timeout_formula() {
        assert_eq!(batch_timeout(0), Duration::from_secs(300));
        assert_eq!(batch_timeout(10), Duration::from_secs(600));
        // Capped at four hours.
        assert_eq!(batch_timeout(100_000), Duration::from_secs(14_400));
    }

    #[test]
    fn batch_poll_interval_ramps_linearly() {
        let timeout = Duration::from_secs(600);
        assert_eq!(batch_poll_interval(Duration::ZERO, timeout), Duration::from_secs(5));
        let mid = batch_poll_interval(Duration::from_secs(300), timeout);
        assert!((mid.as_secs_f64() - 32.5).abs() < 0.01);
        let end = batch_poll_interval(Duration::from_secs(600), timeout);
        assert!((end.as_secs_f64() - 60.0).abs() < 0.01);
    }

    #[test]
    fn adaptive_envelope_parsing() {
        assert_eq!(
            parse_adaptive_envelope(r#"{"answer": "x", "confidence": 0.8}"#),
            Some(("x".to_string(), 0.8))
        );
        // Non-string answers are kept as JSON text.
        let (answer, conf) =
            parse_adaptive_envelope(r#"{"answer": [1, 2], "confidence": 1.0}"#).expect("parse");
        assert_eq!(answer, "[1,2]");
        assert_eq!(conf, 1.0);
        assert!(parse_adaptive_envelope("nope").is_none());
        assert!(parse_adaptive_envelope(r#"{"answer": "x"}"#).is_none());
    }

    #[test]
    fn common_prefix_of_custom_ids() {
        let reqs: Vec<BatchChatRequest> = ["enrich-2025-02-16", "enrich-2025-02-17", "enrich-2025-03-01"]
            .iter()
            .map(|id| BatchChatRequest {
                custom_id: id.to_string(),
                system: String::new(),
                user: String::new(),
                json_mode: false,
                max_tokens: None,
            })
            .collect();
        assert_eq!(common_prefix(&reqs), "enrich-2025-0");
        assert_eq!(common_prefix(&[]), "");
    }
}
