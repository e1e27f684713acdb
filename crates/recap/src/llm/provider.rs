//! Provider adapters: one wire-format translation per provider shape.
//!
//! Every adapter maps the uniform chat contract onto its native protocol:
//! response-format field for OpenAI-shaped APIs, assistant prefill and
//! explicit cache markers for Anthropic-shaped APIs, mime-type switching for
//! Gemini-shaped APIs. The generic adapter speaks the OpenAI wire protocol
//! against a configurable base URL.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{LlmError, LlmErrorKind};
use crate::types::BatchStatus;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(180);

/// Uniform per-call options resolved by the router.
#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub json_mode: bool,
    pub max_tokens: Option<u32>,
    /// Advisory for implicit-caching providers; only Anthropic-shaped APIs
    /// need an explicit marker on the wire.
    pub cache_system_prompt: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
    }

    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_write
    }
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub usage: TokenUsage,
}

/// One request in a provider batch. `custom_id` keys the result.
#[derive(Debug, Clone)]
pub struct BatchChatRequest {
    pub custom_id: String,
    pub system: String,
    pub user: String,
    pub json_mode: bool,
    pub max_tokens: Option<u32>,
}

/// Capability set shared by every provider shape.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, LlmError>;

    /// Batch capability marker; `None` means the provider has no native
    /// asynchronous bulk completion.
    fn batch(&self) -> Option<&dyn BatchProvider> {
        None
    }
}

/// Asynchronous bulk completion, where the provider supports it.
pub trait BatchProvider: Send + Sync {
    fn submit(&self, model: &str, requests: &[BatchChatRequest]) -> Result<String, LlmError>;

    fn status(&self, id: &str) -> Result<BatchStatus, LlmError>;

    /// Per-request results keyed by `custom_id`, with usage summed over the
    /// succeeded requests.
    fn results(&self, id: &str) -> Result<(BTreeMap<String, String>, TokenUsage), LlmError>;
}

fn build_http(provider: &str) -> Result<Client, LlmError> {
    Client::builder()
        .user_agent(format!("recap/{}", env!("CARGO_PKG_VERSION")))
        .timeout(PROVIDER_TIMEOUT)
        .build()
        .map_err(|e| LlmError {
            provider: provider.to_string(),
            reason: format!("failed to build HTTP client: {e}"),
            status: None,
            kind: LlmErrorKind::Transport,
        })
}

fn send_json(
    provider: &str,
    req: reqwest::blocking::RequestBuilder,
) -> Result<Value, LlmError> {
    let (status, text) = send_text(provider, req)?;
    serde_json::from_str(&text).map_err(|e| LlmError {
        provider: provider.to_string(),
        reason: format!("invalid JSON response (status {status}): {e}"),
        status: Some(status),
        kind: LlmErrorKind::Api,
    })
}

fn send_text(
    provider: &str,
    req: reqwest::blocking::RequestBuilder,
) -> Result<(u16, String), LlmError> {
    let resp = req.send().map_err(|e| LlmError {
        provider: provider.to_string(),
        reason: format!("request failed: {e}"),
        status: None,
        kind: LlmErrorKind::Transport,
    })?;
    let status = resp.status().as_u16();
    let text = resp.text().map_err(|e| LlmError {
        provider: provider.to_string(),
        reason: format!("failed to read response body: {e}"),
        status: Some(status),
        kind: LlmErrorKind::Transport,
    })?;
    if !(200..300).contains(&status) {
        let reason = if text.len() > 300 {
            format!("API error {status}: {}...", &text[..300])
        } else {
            format!("API error {status}: {text}")
        };
        return Err(LlmError {
            provider: provider.to_string(),
            reason,
            status: Some(status),
            kind: LlmErrorKind::Api,
        });
    }
    Ok((status, text))
}

fn u64_at(value: &Value, pointer: &str) -> u64 {
    value.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// OpenAI-shaped (also the generic OpenAI-compatible endpoint)
// ---------------------------------------------------------------------------

pub struct OpenAiProvider {
    name: String,
    api_key: String,
    base_url: String,
    http: Client,
}

impl OpenAiProvider {
    pub fn openai(api_key: String, base_url: Option<String>) -> Result<Self, LlmError> {
        Ok(Self {
            http: build_http("openai")?,
            name: "openai".to_string(),
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// OpenAI wire protocol against an arbitrary endpoint; no batch support.
    pub fn generic(name: &str, api_key: String, base_url: String) -> Result<Self, LlmError> {
        Ok(Self {
            http: build_http(name)?,
            name: name.to_string(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Reasoning families bill thinking tokens against the output cap, so a
    /// low cap starves visible output; the cap is omitted for them entirely.
    pub fn is_reasoning_family(model: &str) -> bool {
        model.starts_with("gpt-5") || model.starts_with("o3") || model.starts_with("o4")
    }
}

impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, LlmError> {
        let mut body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        if opts.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        if let Some(cap) = opts.max_tokens
            && !Self::is_reasoning_family(model)
        {
            body["max_completion_tokens"] = json!(cap);
        }

        let url = format!("{}/chat/completions", self.base_url);
        let value = send_json(
            &self.name,
            self.http.post(&url).bearer_auth(&self.api_key).json(&body),
        )?;

        let text = value
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let finish = value
            .pointer("/choices/0/finish_reason")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if text.is_empty() && finish == "length" {
            return Err(LlmError {
                provider: self.name.clone(),
                reason: format!("model '{model}' hit the output token cap before any content"),
                status: None,
                kind: LlmErrorKind::ContentLimit,
            });
        }

        let prompt = u64_at(&value, "/usage/prompt_tokens");
        let cached = u64_at(&value, "/usage/prompt_tokens_details/cached_tokens");
        let usage = TokenUsage {
            input: prompt.saturating_sub(cached),
            output: u64_at(&value, "/usage/completion_tokens"),
            cache_read: cached,
            cache_write: 0,
        };

        Ok(ChatOutcome { text, usage })
    }
}

// ---------------------------------------------------------------------------
// Anthropic-shaped
// ---------------------------------------------------------------------------

/// Without a configured cap the messages API still requires one.
const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
    http: Client,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Result<Self, LlmError> {
        Ok(Self {
            http: build_http("anthropic")?,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://api.anthropic.com".to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    fn chat_params(
        model: &str,
        system: &str,
        user: &str,
        json_mode: bool,
        max_tokens: Option<u32>,
        cache_system_prompt: bool,
    ) -> Value {
        // The ephemeral marker is the only explicit caching any provider
        // needs; everywhere else the flag is advisory.
        let system_value = if cache_system_prompt {
            json!([{ "type": "text", "text": system, "cache_control": {"type": "ephemeral"} }])
        } else {
            json!(system)
        };

        let mut messages = vec![json!({"role": "user", "content": user})];
        if json_mode {
            // Prefilling the assistant turn forces the model to continue as
            // a JSON array.
            messages.push(json!({"role": "assistant", "content": "["}));
        }

        json!({
            "model": model,
            "max_tokens": max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
            "system": system_value,
            "messages": messages,
        })
    }

    fn headers(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        req.header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
    }

    fn usage_from(value: &Value) -> TokenUsage {
        TokenUsage {
            input: u64_at(value, "/usage/input_tokens"),
            output: u64_at(value, "/usage/output_tokens"),
            cache_read: u64_at(value, "/usage/cache_read_input_tokens"),
            cache_write: u64_at(value, "/usage/cache_creation_input_tokens"),
        }
    }
}

impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, LlmError> {
        let body = Self::chat_params(
            model,
            system,
            user,
            opts.json_mode,
            opts.max_tokens,
            opts.cache_system_prompt,
        );
        let url = format!("{}/v1/messages", self.base_url);
        let value = send_json("anthropic", self.headers(self.http.post(&url)).json(&body))?;

        let mut text = value
            .pointer("/content/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let stop = value
            .pointer("/stop_reason")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if text.is_empty() && stop == "max_tokens" {
            return Err(LlmError {
                provider: "anthropic".to_string(),
                reason: format!("model '{model}' hit max_tokens before any content"),
                status: None,
                kind: LlmErrorKind::ContentLimit,
            });
        }
        if opts.json_mode {
            // Re-attach the prefilled opening bracket.
            text = format!("[{text}");
        }

        Ok(ChatOutcome {
            text,
            usage: Self::usage_from(&value),
        })
    }

    fn batch(&self) -> Option<&dyn BatchProvider> {
        Some(self)
    }
}

impl BatchProvider for AnthropicProvider {
    fn submit(&self, model: &str, requests: &[BatchChatRequest]) -> Result<String, LlmError> {
        let reqs: Vec<Value> = requests
            .iter()
            .map(|r| {
                json!({
                    "custom_id": r.custom_id,
                    "params": Self::chat_params(
                        model,
                        &r.system,
                        &r.user,
                        r.json_mode,
                        r.max_tokens,
                        true,
                    ),
                })
            })
            .collect();

        let url = format!("{}/v1/messages/batches", self.base_url);
        let value = send_json(
            "anthropic",
            self.headers(self.http.post(&url))
                .json(&json!({ "requests": reqs })),
        )?;

        value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| LlmError {
                provider: "anthropic".to_string(),
                reason: "batch submission response had no id".to_string(),
                status: None,
                kind: LlmErrorKind::Api,
            })
    }

    fn status(&self, id: &str) -> Result<BatchStatus, LlmError> {
        let url = format!("{}/v1/messages/batches/{id}", self.base_url);
        let value = send_json("anthropic", self.headers(self.http.get(&url)))?;

        let processing = value
            .get("processing_status")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if processing != "ended" {
            return Ok(BatchStatus::InProgress);
        }

        let succeeded = u64_at(&value, "/request_counts/succeeded");
        let errored = u64_at(&value, "/request_counts/errored");
        let expired = u64_at(&value, "/request_counts/expired");
        if succeeded == 0 && expired > 0 {
            Ok(BatchStatus::Expired)
        } else if succeeded == 0 && errored > 0 {
            Ok(BatchStatus::Failed)
        } else {
            Ok(BatchStatus::Completed)
        }
    }

    fn results(&self, id: &str) -> Result<(BTreeMap<String, String>, TokenUsage), LlmError> {
        let url = format!("{}/v1/messages/batches/{id}/results", self.base_url);
        let (_, text) = send_text("anthropic", self.headers(self.http.get(&url)))?;

        let mut out = BTreeMap::new();
        let mut usage = TokenUsage::default();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let row: Value = serde_json::from_str(line).map_err(|e| LlmError {
                provider: "anthropic".to_string(),
                reason: format!("invalid batch results line: {e}"),
                status: None,
                kind: LlmErrorKind::Api,
            })?;
            let Some(custom_id) = row.get("custom_id").and_then(Value::as_str) else {
                continue;
            };
            if row.pointer("/result/type").and_then(Value::as_str) != Some("succeeded") {
                continue;
            }
            let answer = row
                .pointer("/result/message/content/0/text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if let Some(message) = row.pointer("/result/message") {
                usage.add(&Self::usage_from(message));
            }
            out.insert(custom_id.to_string(), answer.to_string());
        }
        Ok((out, usage))
    }
}

// ---------------------------------------------------------------------------
// Gemini-shaped
// ---------------------------------------------------------------------------

pub struct GeminiProvider {
    api_key: String,
    base_url: String,
    http: Client,
}

impl GeminiProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Result<Self, LlmError> {
        Ok(Self {
            http: build_http("gemini")?,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }
}

impl Provider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        opts: &ChatOptions,
    ) -> Result<ChatOutcome, LlmError> {
        let mut generation = serde_json::Map::new();
        if let Some(cap) = opts.max_tokens {
            generation.insert("maxOutputTokens".to_string(), json!(cap));
        }
        if opts.json_mode {
            generation.insert(
                "responseMimeType".to_string(),
                json!("application/json"),
            );
        }

        let mut body = json!({
            "system_instruction": {"parts": [{"text": system}]},
            "contents": [{"role": "user", "parts": [{"text": user}]}],
        });
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        let url = format!(
            "{}/v1beta/models/{model}:generateContent",
            self.base_url
        );
        let value = send_json(
            "gemini",
            self.http
                .post(&url)
                .query(&[("key", self.api_key.as_str())])
                .json(&body),
        )?;

        let text = value
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let finish = value
            .pointer("/candidates/0/finishReason")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if text.is_empty() && finish == "MAX_TOKENS" {
            return Err(LlmError {
                provider: "gemini".to_string(),
                reason: format!("model '{model}' hit maxOutputTokens before any content"),
                status: None,
                kind: LlmErrorKind::ContentLimit,
            });
        }

        let prompt = u64_at(&value, "/usageMetadata/promptTokenCount");
        let cached = u64_at(&value, "/usageMetadata/cachedContentTokenCount");
        let usage = TokenUsage {
            input: prompt.saturating_sub(cached),
            output: u64_at(&value, "/usageMetadata/candidatesTokenCount"),
            cache_read: cached,
            cache_write: 0,
        };

        Ok(ChatOutcome { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use tiny_http::{Header, Response, Server};

    use super::*;

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

    #[test]
    fn openai_sets_json_mode_and_token_cap() {
        let (base, handle) = with_multi_server(
            move |mut req| {
                let body = body_json(&mut req);
                assert_eq!(body["model"], "small-1");
                assert_eq!(body["response_format"]["type"], "json_object");
                assert_eq!(body["max_completion_tokens"], 500);
                req.respond(json_response(
                    json!({
                        "choices": [{"message": {"content": "[]"}, "finish_reason": "stop"}],
                        "usage": {
                            "prompt_tokens": 120,
                            "completion_tokens": 5,
                            "prompt_tokens_details": {"cached_tokens": 100},
                        },
                    })
                    .to_string(),
                ))
                .expect("respond");
            },
            1,
        );

        let p = OpenAiProvider::openai("sk".to_string(), Some(base)).expect("provider");
        let out = p
            .chat(
                "small-1",
                "sys",
                "user",
                &ChatOptions {
                    json_mode: true,
                    max_tokens: Some(500),
                    cache_system_prompt: true,
                },
            )
            .expect("chat");

        assert_eq!(out.text, "[]");
        // Cached tokens split out of the prompt count.
        assert_eq!(out.usage.input, 20);
        assert_eq!(out.usage.cache_read, 100);
        assert_eq!(out.usage.output, 5);
        handle.join().expect("join");
    }

    #[test]
    fn openai_omits_cap_for_reasoning_families() {
        assert!(OpenAiProvider::is_reasoning_family("gpt-5-large"));
        assert!(OpenAiProvider::is_reasoning_family("o3-mini"));
        assert!(OpenAiProvider::is_reasoning_family("o4"));
        assert!(!OpenAiProvider::is_reasoning_family("small-1"));

        let (base, handle) = with_multi_server(
            move |mut req| {
                let body = body_json(&mut req);
                assert!(body.get("max_completion_tokens").is_none());
                req.respond(json_response(
                    json!({
                        "choices": [{"message": {"content": "ok"}, "finish_reason": "stop"}],
                        "usage": {"prompt_tokens": 10, "completion_tokens": 2},
                    })
                    .to_string(),
                ))
                .expect("respond");
            },
            1,
        );

        let p = OpenAiProvider::openai("sk".to_string(), Some(base)).expect("provider");
        let out = p
            .chat(
                "o3-mini",
                "sys",
                "user",
                &ChatOptions {
                    json_mode: false,
                    max_tokens: Some(100),
                    cache_system_prompt: false,
                },
            )
            .expect("chat");
        assert_eq!(out.text, "ok");
        handle.join().expect("join");
    }

    #[test]
    fn openai_empty_length_finish_is_a_content_limit_error() {
        let (base, handle) = with_multi_server(
            move |req| {
                req.respond(json_response(
                    json!({
                        "choices": [{"message": {"content": ""}, "finish_reason": "length"}],
                        "usage": {"prompt_tokens": 10, "completion_tokens": 0},
                    })
                    .to_string(),
                ))
                .expect("respond");
            },
            1,
        );

        let p = OpenAiProvider::openai("sk".to_string(), Some(base)).expect("provider");
        let err = p
            .chat("small-1", "s", "u", &ChatOptions::default())
            .expect_err("must fail");
        assert_eq!(err.kind, LlmErrorKind::ContentLimit);
        handle.join().expect("join");
    }

    #[test]
    fn anthropic_prefills_json_and_marks_cache() {
        let (base, handle) = with_multi_server(
            move |mut req| {
                assert_eq!(req.url(), "/v1/messages");
                let version = req
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("anthropic-version"))
                    .map(|h| h.value.as_str().to_string());
                assert_eq!(version.as_deref(), Some("2023-06-01"));

                let body = body_json(&mut req);
                // Cache flag puts the system prompt in a block with the
                // ephemeral marker.
                assert_eq!(
                    body["system"][0]["cache_control"]["type"],
                    "ephemeral"
                );
                // JSON mode prefills the assistant turn.
                assert_eq!(body["messages"][1]["role"], "assistant");
                assert_eq!(body["messages"][1]["content"], "[");

                req.respond(json_response(
                    json!({
                        "content": [{"type": "text", "text": "{\"a\": 1}]"}],
                        "stop_reason": "end_turn",
                        "usage": {
                            "input_tokens": 40,
                            "output_tokens": 9,
                            "cache_read_input_tokens": 300,
                            "cache_creation_input_tokens": 120,
                        },
                    })
                    .to_string(),
                ))
                .expect("respond");
            },
            1,
        );

        let p = AnthropicProvider::new("sk".to_string(), Some(base)).expect("provider");
        let out = p
            .chat(
                "mid-2",
                "sys",
                "user",
                &ChatOptions {
                    json_mode: true,
                    max_tokens: Some(1000),
                    cache_system_prompt: true,
                },
            )
            .expect("chat");

        // The prefilled bracket is re-attached.
        assert_eq!(out.text, "[{\"a\": 1}]");
        assert_eq!(out.usage.cache_read, 300);
        assert_eq!(out.usage.cache_write, 120);
        handle.join().expect("join");
    }

    #[test]
    fn anthropic_plain_system_without_cache_flag() {
        let (base, handle) = with_multi_server(
            move |mut req| {
                let body = body_json(&mut req);
                assert_eq!(body["system"], "sys");
                assert_eq!(body["messages"].as_array().unwrap().len(), 1);
                // The API requires a cap even when the task sets none.
                assert_eq!(body["max_tokens"], 4096);
                req.respond(json_response(
                    json!({
                        "content": [{"type": "text", "text": "hello"}],
                        "stop_reason": "end_turn",
                        "usage": {"input_tokens": 4, "output_tokens": 2},
                    })
                    .to_string(),
                ))
                .expect("respond");
            },
            1,
        );

        let p = AnthropicProvider::new("sk".to_string(), Some(base)).expect("provider");
        let out = p
            .chat("mid-2", "sys", "user", &ChatOptions::default())
            .expect("chat");
        assert_eq!(out.text, "hello");
        handle.join().expect("join");
    }

    #[test]
    fn anthropic_batch_roundtrip() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let (base, handle) = with_multi_server(
            move |mut req| {
                let url = req.url().to_string();
                let n = calls_in.fetch_add(1, Ordering::SeqCst);
                match n {
                    0 => {
                        assert_eq!(url, "/v1/messages/batches");
                        let body = body_json(&mut req);
                        let reqs = body["requests"].as_array().unwrap();
                        assert_eq!(reqs.len(), 2);
                        assert_eq!(reqs[0]["custom_id"], "enrich-2025-02-16");
                        assert_eq!(reqs[0]["params"]["model"], "mid-2");
                        req.respond(json_response(
                            json!({"id": "batch_abc", "processing_status": "in_progress"})
                                .to_string(),
                        ))
                        .expect("respond");
                    }
                    1 => {
                        assert_eq!(url, "/v1/messages/batches/batch_abc");
                        req.respond(json_response(
                            json!({
                                "processing_status": "ended",
                                "request_counts": {"succeeded": 2, "errored": 0, "expired": 0},
                            })
                            .to_string(),
                        ))
                        .expect("respond");
                    }
                    _ => {
                        assert_eq!(url, "/v1/messages/batches/batch_abc/results");
                        let lines = [
                            json!({
                                "custom_id": "enrich-2025-02-16",
                                "result": {
                                    "type": "succeeded",
                                    "message": {
                                        "content": [{"type": "text", "text": "{\"i\": 0}]"}],
                                        "usage": {"input_tokens": 10, "output_tokens": 3},
                                    },
                                },
                            })
                            .to_string(),
                            json!({
                                "custom_id": "enrich-2025-02-17",
                                "result": {"type": "errored"},
                            })
                            .to_string(),
                        ];
                        req.respond(Response::from_string(lines.join("\n")))
                            .expect("respond");
                    }
                }
            },
            3,
        );

        let p = AnthropicProvider::new("sk".to_string(), Some(base)).expect("provider");
        let batch = p.batch().expect("capability");

        let requests = vec![
            BatchChatRequest {
                custom_id: "enrich-2025-02-16".to_string(),
                system: "sys".to_string(),
                user: "day one".to_string(),
                json_mode: true,
                max_tokens: Some(800),
            },
            BatchChatRequest {
                custom_id: "enrich-2025-02-17".to_string(),
                system: "sys".to_string(),
                user: "day two".to_string(),
                json_mode: true,
                max_tokens: Some(800),
            },
        ];

        let id = batch.submit("mid-2", &requests).expect("submit");
        assert_eq!(id, "batch_abc");
        assert_eq!(batch.status(&id).expect("status"), BatchStatus::Completed);

        let (results, usage) = batch.results(&id).expect("results");
        // Only the succeeded request lands; the errored one is absent.
        assert_eq!(results.len(), 1);
        assert_eq!(results["enrich-2025-02-16"], "{\"i\": 0}]");
        assert_eq!(usage.input, 10);
        assert_eq!(usage.output, 3);
        handle.join().expect("join");
    }

    #[test]
    fn anthropic_batch_status_maps_terminal_counts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = Arc::clone(&calls);
        let (base, handle) = with_multi_server(
            move |req| {
                let n = calls_in.fetch_add(1, Ordering::SeqCst);
                let body = match n {
                    0 => json!({"processing_status": "in_progress"}),
                    1 => json!({
                        "processing_status": "ended",
                        "request_counts": {"succeeded": 0, "errored": 3, "expired": 0},
                    }),
                    _ => json!({
                        "processing_status": "ended",
                        "request_counts": {"succeeded": 0, "errored": 0, "expired": 2},
                    }),
                };
                req.respond(json_response(body.to_string())).expect("respond");
            },
            3,
        );

        let p = AnthropicProvider::new("sk".to_string(), Some(base)).expect("provider");
        let batch = p.batch().expect("capability");
        assert_eq!(batch.status("b").expect("s"), BatchStatus::InProgress);
        assert_eq!(batch.status("b").expect("s"), BatchStatus::Failed);
        assert_eq!(batch.status("b").expect("s"), BatchStatus::Expired);
        handle.join().expect("join");
    }

    #[test]
    fn gemini_sets_mime_type_and_reads_usage_metadata() {
        let (base, handle) = with_multi_server(
            move |mut req| {
                let url = req.url().to_string();
                assert!(url.starts_with("/v1beta/models/flash-2:generateContent"));
                assert!(url.contains("key=sk-gem"));
                let body = body_json(&mut req);
                assert_eq!(
                    body["generationConfig"]["responseMimeType"],
                    "application/json"
                );
                assert_eq!(body["generationConfig"]["maxOutputTokens"], 900);
                assert_eq!(body["system_instruction"]["parts"][0]["text"], "sys");

                req.respond(json_response(
                    json!({
                        "candidates": [{
                            "content": {"parts": [{"text": "[]"}]},
                            "finishReason": "STOP",
                        }],
                        "usageMetadata": {
                            "promptTokenCount": 50,
                            "candidatesTokenCount": 4,
                            "cachedContentTokenCount": 30,
                        },
                    })
                    .to_string(),
                ))
                .expect("respond");
            },
            1,
        );

        let p = GeminiProvider::new("sk-gem".to_string(), Some(base)).expect("provider");
        let out = p
            .chat(
                "flash-2",
                "sys",
                "user",
                &ChatOptions {
                    json_mode: true,
                    max_tokens: Some(900),
                    cache_system_prompt: true,
                },
            )
            .expect("chat");

        assert_eq!(out.text, "[]");
        assert_eq!(out.usage.input, 20);
        assert_eq!(out.usage.cache_read, 30);
        handle.join().expect("join");
    }

    #[test]
    fn api_errors_carry_status_and_kind() {
        let (base, handle) = with_multi_server(
            move |req| {
                let resp = Response::from_string(r#"{"error": {"message": "overloaded"}}"#)
                    .with_status_code(tiny_http::StatusCode(529));
                req.respond(resp).expect("respond");
            },
            1,
        );

        let p = AnthropicProvider::new("sk".to_string(), Some(base)).expect("provider");
        let err = p
            .chat("mid-2", "s", "u", &ChatOptions::default())
            .expect_err("must fail");
        assert_eq!(err.status, Some(529));
        assert_eq!(err.kind, LlmErrorKind::Api);
        assert!(err.reason.contains("overloaded"));
        handle.join().expect("join");
    }

    #[test]
    fn providers_without_batch_report_no_capability() {
        let openai =
            OpenAiProvider::openai("sk".to_string(), Some("http://localhost".to_string()))
                .expect("provider");
        assert!(openai.batch().is_none());
        let gemini = GeminiProvider::new("sk".to_string(), Some("http://localhost".to_string()))
            .expect("provider");
        assert!(gemini.batch().is_none());
    }
}
