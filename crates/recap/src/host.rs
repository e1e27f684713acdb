//! Authenticated client for the GitHub-compatible Search and REST APIs.
//!
//! Owns retry policy, rate-limit accounting, search-endpoint throttling, and
//! pagination, so upstream code treats every operation as "decoded payload or
//! final [`FetchError`]". A fixed-size [`ClientPool`] hands independent
//! clients to parallel enrichment workers; all of them share one search
//! throttle so the host's search quota is respected process-wide.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::config::RecapConfig;
use crate::report::Reporter;
use crate::types::{FetchError, HttpStatus};

/// Retries after a rate-limit hit (8 attempts total).
pub const MAX_RATE_LIMIT_RETRIES: u32 = 7;
/// Retries after a 5xx or transport error (4 attempts total).
pub const MAX_SERVER_RETRIES: u32 = 3;
/// Upper bound for any computed backoff wait.
const BACKOFF_CAP: Duration = Duration::from_secs(300);
/// The host stops returning search results at this many items.
pub const SEARCH_RESULT_CEILING: usize = 1000;

const DEFAULT_ACCEPT: &str = "application/vnd.github+json";
/// Commit search is still behind a preview media type on Enterprise hosts.
const COMMIT_SEARCH_ACCEPT: &str = "application/vnd.github.cloak-preview+json";

// ---------------------------------------------------------------------------
// Search throttle
// ---------------------------------------------------------------------------

/// Spaces successive search calls across the whole client pool.
///
/// The sleep happens while holding the lock, which serializes searchers and
/// guarantees the minimum interval between any two search calls process-wide.
#[derive(Debug)]
pub struct SearchThrottle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl SearchThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    fn pace(&self) {
        let mut last = self.last.lock().unwrap();
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                thread::sleep(self.interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

// ---------------------------------------------------------------------------
// Decoded REST payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Actor {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LabelPayload {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoPayload {
    pub full_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrBase {
    pub repo: RepoPayload,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrPayload {
    pub number: u64,
    pub html_url: String,
    pub url: String,
    pub state: String,
    #[serde(default)]
    pub merged: bool,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub user: Actor,
    #[serde(default)]
    pub labels: Vec<LabelPayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    pub base: PrBase,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilePayload {
    pub filename: String,
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
    pub status: String,
    #[serde(default)]
    pub patch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommentPayload {
    #[serde(default)]
    pub user: Option<Actor>,
    #[serde(default)]
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewPayload {
    #[serde(default)]
    pub user: Option<Actor>,
    pub state: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    pub html_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitSignature {
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitInner {
    pub message: String,
    pub committer: CommitSignature,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitPayload {
    pub sha: String,
    pub html_url: String,
    pub url: String,
    pub commit: CommitInner,
    #[serde(default)]
    pub author: Option<Actor>,
    #[serde(default)]
    pub files: Vec<FilePayload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IssuePayload {
    pub number: u64,
    pub html_url: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    pub user: Actor,
    #[serde(default)]
    pub labels: Vec<LabelPayload>,
    pub repository_url: String,
}

/// One page of search results. Items stay as raw JSON so range fetches can
/// buffer them in the fetch-progress cache byte-for-byte.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchPage {
    pub total_count: u64,
    #[serde(default)]
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchEndpoint {
    Issues,
    Commits,
}

impl SearchEndpoint {
    fn path(&self) -> &'static str {
        match self {
            SearchEndpoint::Issues => "/search/issues",
            SearchEndpoint::Commits => "/search/commits",
        }
    }

    fn accept(&self) -> &'static str {
        match self {
            SearchEndpoint::Issues => DEFAULT_ACCEPT,
            SearchEndpoint::Commits => COMMIT_SEARCH_ACCEPT,
        }
    }
}

// ---------------------------------------------------------------------------
// Host client
// ---------------------------------------------------------------------------

pub struct HostClient {
    http: Client,
    base_url: String,
    token: String,
    throttle: Arc<SearchThrottle>,
    reporter: Arc<dyn Reporter>,
    backoff_base: Duration,
}

impl HostClient {
    pub fn new(
        base_url: &str,
        token: &str,
        timeout: Duration,
        throttle: Arc<SearchThrottle>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("recap/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            throttle,
            reporter,
            backoff_base: Duration::from_secs(1),
        })
    }

    /// Override the exponential backoff base (`base * 2^n`). Mostly useful
    /// to keep tests fast.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let pow = attempt.min(16);
        let delay = self.backoff_base.saturating_mul(2_u32.saturating_pow(pow));
        delay.min(BACKOFF_CAP)
    }

    /// One GET with the full retry policy. Two independent counters per
    /// logical request: rate-limit (429 / rate-limited 403) and server
    /// (5xx / transport). Other 4xx fail immediately.
    fn get_value(
        &self,
        path: &str,
        query: &[(&str, String)],
        accept: &str,
        search: bool,
    ) -> Result<Value, FetchError> {
        let url = format!("{}{}", self.base_url, path);
        let mut rate_attempts = 0u32;
        let mut server_attempts = 0u32;

        loop {
            if search {
                self.throttle.pace();
            }

            let result = self
                .http
                .get(&url)
                .query(query)
                .bearer_auth(&self.token)
                .header(reqwest::header::ACCEPT, accept)
                .send();

            let resp = match result {
                Ok(r) => r,
                Err(e) => {
                    server_attempts += 1;
                    if server_attempts > MAX_SERVER_RETRIES {
                        return Err(FetchError {
                            reason: format!("network error: {e}"),
                            endpoint: path.to_string(),
                            attempts: rate_attempts + server_attempts,
                            status: None,
                            rate_limited: false,
                        });
                    }
                    thread::sleep(jittered(self.backoff(server_attempts)));
                    continue;
                }
            };

            let status = resp.status().as_u16();

            if status == 429 || status == 403 {
                let waits = RateHeaders::capture(resp.headers());
                let body = resp.text().unwrap_or_default();
                if status == 429 || body_signals_rate_limit(&body) {
                    rate_attempts += 1;
                    if rate_attempts > MAX_RATE_LIMIT_RETRIES {
                        return Err(FetchError {
                            reason: format!("rate limit exhausted (status {status})"),
                            endpoint: path.to_string(),
                            attempts: rate_attempts + server_attempts,
                            status: Some(HttpStatus(status)),
                            rate_limited: true,
                        });
                    }
                    // Three-tier wait: Retry-After, then X-RateLimit-Reset,
                    // then exponential backoff.
                    let wait = waits
                        .retry_after
                        .or_else(|| waits.reset_wait())
                        .unwrap_or_else(|| self.backoff(rate_attempts));
                    self.reporter.warn(&format!(
                        "{path}: rate limited (status {status}), waiting {:.1}s (attempt {rate_attempts})",
                        wait.as_secs_f64()
                    ));
                    thread::sleep(jittered(wait));
                    continue;
                }
                return Err(FetchError {
                    reason: format!("forbidden: {}", snippet(&body)),
                    endpoint: path.to_string(),
                    attempts: rate_attempts + server_attempts + 1,
                    status: Some(HttpStatus(403)),
                    rate_limited: false,
                });
            }

            if status >= 500 {
                server_attempts += 1;
                if server_attempts > MAX_SERVER_RETRIES {
                    return Err(FetchError {
                        reason: format!("Server error {status}"),
                        endpoint: path.to_string(),
                        attempts: rate_attempts + server_attempts,
                        status: Some(HttpStatus(status)),
                        rate_limited: false,
                    });
                }
                thread::sleep(jittered(self.backoff(server_attempts)));
                continue;
            }

            if !(200..300).contains(&status) {
                let body = resp.text().unwrap_or_default();
                return Err(FetchError {
                    reason: format!("unexpected status {status}: {}", snippet(&body)),
                    endpoint: path.to_string(),
                    attempts: rate_attempts + server_attempts + 1,
                    status: Some(HttpStatus(status)),
                    rate_limited: false,
                });
            }

            if search {
                self.observe_search_quota(resp.headers(), path);
            }

            let attempts = rate_attempts + server_attempts + 1;
            return resp.json().map_err(|e| FetchError {
                reason: format!("failed to decode response: {e}"),
                endpoint: path.to_string(),
                attempts,
                status: None,
                rate_limited: false,
            });
        }
    }

    /// Adaptive quota awareness: under 10 remaining blocks until the reset
    /// instant, under 100 warns.
    fn observe_search_quota(&self, headers: &reqwest::header::HeaderMap, path: &str) {
        let remaining = header_u64(headers, "x-ratelimit-remaining");
        let Some(remaining) = remaining else { return };

        if remaining < 10 {
            let wait = RateHeaders::capture(headers).reset_wait();
            match wait {
                Some(wait) if wait > Duration::ZERO => {
                    self.reporter.warn(&format!(
                        "{path}: search quota nearly exhausted ({remaining} left), blocking {}s until reset",
                        wait.as_secs()
                    ));
                    thread::sleep(wait);
                }
                _ => self.reporter.warn(&format!(
                    "{path}: search quota nearly exhausted ({remaining} left)"
                )),
            }
        } else if remaining < 100 {
            self.reporter
                .warn(&format!("{path}: search quota low ({remaining} remaining)"));
        }
    }

    fn decode<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        value: Value,
    ) -> Result<T, FetchError> {
        serde_json::from_value(value).map_err(|e| FetchError {
            reason: format!("failed to decode payload: {e}"),
            endpoint: endpoint.to_string(),
            attempts: 1,
            status: None,
            rate_limited: false,
        })
    }

    fn search_page(
        &self,
        endpoint: SearchEndpoint,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<SearchPage, FetchError> {
        let path = endpoint.path();
        let value = self.get_value(
            path,
            &[
                ("q", query.to_string()),
                ("page", page.to_string()),
                ("per_page", per_page.to_string()),
            ],
            endpoint.accept(),
            true,
        )?;
        self.decode(path, value)
    }

    pub fn search_issues(
        &self,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<SearchPage, FetchError> {
        self.search_page(SearchEndpoint::Issues, query, page, per_page)
    }

    pub fn search_commits(
        &self,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<SearchPage, FetchError> {
        self.search_page(SearchEndpoint::Commits, query, page, per_page)
    }

    fn search_all(&self, endpoint: SearchEndpoint, query: &str) -> Result<Vec<Value>, FetchError> {
        let mut items: Vec<Value> = Vec::new();
        let mut page = 1;
        loop {
            let sp = self.search_page(endpoint, query, page, 100)?;
            let fetched = sp.items.len();
            items.extend(sp.items);
            if items.len() >= SEARCH_RESULT_CEILING {
                self.reporter.warn(&format!(
                    "search result set reached the host ceiling ({SEARCH_RESULT_CEILING}) for query '{query}'; narrow the date range"
                ));
                break;
            }
            if fetched < 100 {
                break;
            }
            page += 1;
        }
        Ok(items)
    }

    /// All pages of an issue/PR search, capped at the host ceiling.
    pub fn search_issues_all(&self, query: &str) -> Result<Vec<Value>, FetchError> {
        self.search_all(SearchEndpoint::Issues, query)
    }

    /// All pages of a commit search, capped at the host ceiling.
    pub fn search_commits_all(&self, query: &str) -> Result<Vec<Value>, FetchError> {
        self.search_all(SearchEndpoint::Commits, query)
    }

    /// Paginated REST list endpoint (`per_page=100` until a short page).
    fn get_list(&self, path: &str) -> Result<Vec<Value>, FetchError> {
        let mut out: Vec<Value> = Vec::new();
        let mut page = 1;
        loop {
            let value = self.get_value(
                path,
                &[
                    ("page", page.to_string()),
                    ("per_page", "100".to_string()),
                ],
                DEFAULT_ACCEPT,
                false,
            )?;
            let batch: Vec<Value> = self.decode(path, value)?;
            let fetched = batch.len();
            out.extend(batch);
            if fetched < 100 {
                break;
            }
            page += 1;
        }
        Ok(out)
    }

    pub fn get_pr(&self, repo: &str, number: u64) -> Result<PrPayload, FetchError> {
        let path = format!("/repos/{repo}/pulls/{number}");
        let value = self.get_value(&path, &[], DEFAULT_ACCEPT, false)?;
        self.decode(&path, value)
    }

    pub fn get_pr_files(&self, repo: &str, number: u64) -> Result<Vec<FilePayload>, FetchError> {
        let path = format!("/repos/{repo}/pulls/{number}/files");
        let items = self.get_list(&path)?;
        items
            .into_iter()
            .map(|v| self.decode(&path, v))
            .collect()
    }

    /// Both discussion comments and review comments, in host order.
    pub fn get_pr_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<CommentPayload>, FetchError> {
        let issue_path = format!("/repos/{repo}/issues/{number}/comments");
        let review_path = format!("/repos/{repo}/pulls/{number}/comments");

        let mut out: Vec<CommentPayload> = Vec::new();
        for path in [issue_path, review_path] {
            for v in self.get_list(&path)? {
                out.push(self.decode(&path, v)?);
            }
        }
        Ok(out)
    }

    pub fn get_pr_reviews(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<ReviewPayload>, FetchError> {
        let path = format!("/repos/{repo}/pulls/{number}/reviews");
        let items = self.get_list(&path)?;
        items
            .into_iter()
            .map(|v| self.decode(&path, v))
            .collect()
    }

    pub fn get_commit(&self, repo: &str, sha: &str) -> Result<CommitPayload, FetchError> {
        let path = format!("/repos/{repo}/commits/{sha}");
        let value = self.get_value(&path, &[], DEFAULT_ACCEPT, false)?;
        self.decode(&path, value)
    }

    pub fn get_issue(&self, repo: &str, number: u64) -> Result<IssuePayload, FetchError> {
        let path = format!("/repos/{repo}/issues/{number}");
        let value = self.get_value(&path, &[], DEFAULT_ACCEPT, false)?;
        self.decode(&path, value)
    }

    pub fn get_issue_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<CommentPayload>, FetchError> {
        let path = format!("/repos/{repo}/issues/{number}/comments");
        let items = self.get_list(&path)?;
        items
            .into_iter()
            .map(|v| self.decode(&path, v))
            .collect()
    }
}

fn body_signals_rate_limit(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("rate limit") || lower.contains("secondary rate") || lower.contains("abuse")
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() > 200 {
        format!("{}...", &trimmed[..200])
    } else {
        trimmed.to_string()
    }
}

/// Uniform random factor in [0.75, 1.25] so parallel clients desynchronize.
fn jittered(delay: Duration) -> Duration {
    let factor = 0.75 + rand::random::<f64>() * 0.5;
    Duration::from_millis((delay.as_millis() as f64 * factor).round() as u64)
}

struct RateHeaders {
    retry_after: Option<Duration>,
    reset_at: Option<u64>,
}

impl RateHeaders {
    fn capture(headers: &reqwest::header::HeaderMap) -> Self {
        Self {
            retry_after: header_u64(headers, "retry-after").map(Duration::from_secs),
            reset_at: header_u64(headers, "x-ratelimit-reset"),
        }
    }

    /// Seconds until the advertised reset instant, if any.
    fn reset_wait(&self) -> Option<Duration> {
        let reset = self.reset_at?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Some(Duration::from_secs(reset.saturating_sub(now)))
    }
}

fn header_u64(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

// ---------------------------------------------------------------------------
// Client pool
// ---------------------------------------------------------------------------

/// Fixed-size FIFO pool of host clients for parallel enrichment.
pub struct ClientPool {
    clients: Mutex<VecDeque<HostClient>>,
    available: Condvar,
    acquire_timeout: Duration,
}

impl ClientPool {
    pub fn new(clients: Vec<HostClient>, acquire_timeout: Duration) -> Self {
        Self {
            clients: Mutex::new(clients.into_iter().collect()),
            available: Condvar::new(),
            acquire_timeout,
        }
    }

    /// Build a pool from config: one shared throttle, `pool_size` clients.
    pub fn from_config(cfg: &RecapConfig, reporter: Arc<dyn Reporter>) -> Result<Self> {
        let token = cfg.host.resolve_token()?;
        let throttle = Arc::new(SearchThrottle::new(cfg.fetch.search_interval));
        let mut clients = Vec::with_capacity(cfg.fetch.pool_size.max(1));
        for _ in 0..cfg.fetch.pool_size.max(1) {
            clients.push(HostClient::new(
                &cfg.host.base_url,
                &token,
                cfg.fetch.request_timeout,
                Arc::clone(&throttle),
                Arc::clone(&reporter),
            )?);
        }
        Ok(Self::new(clients, cfg.fetch.acquire_timeout))
    }

    /// Blocking FIFO acquire. Fails with a clearly-identified error after the
    /// configured timeout so a stuck worker never deadlocks the run.
    pub fn acquire(&self) -> Result<PooledClient<'_>, FetchError> {
        let deadline = Instant::now() + self.acquire_timeout;
        let mut guard = self.clients.lock().unwrap();
        loop {
            if let Some(client) = guard.pop_front() {
                return Ok(PooledClient {
                    pool: self,
                    client: Some(client),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(FetchError {
                    reason: "host client pool acquire timed out".to_string(),
                    endpoint: "client-pool".to_string(),
                    attempts: 1,
                    status: None,
                    rate_limited: false,
                });
            }
            let (g, _res) = self
                .available
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
        }
    }

    fn release(&self, client: HostClient) {
        let mut guard = self.clients.lock().unwrap();
        guard.push_back(client);
        self.available.notify_one();
    }
}

/// RAII pool lease; the client returns to the back of the queue on drop.
pub struct PooledClient<'a> {
    pool: &'a ClientPool,
    client: Option<HostClient>,
}

impl std::ops::Deref for PooledClient<'_> {
    type Target = HostClient;

    fn deref(&self) -> &HostClient {
        self.client.as_ref().expect("client present until drop")
    }
}

impl Drop for PooledClient<'_> {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            self.pool.release(client);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tiny_http::{Header, Response, Server, StatusCode};

    use super::*;
    use crate::report::{CollectingReporter, NullReporter};

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

    fn fast_client(base: &str) -> HostClient {
        fast_client_with(base, Arc::new(NullReporter), Duration::from_millis(1))
    }

    fn fast_client_with(
        base: &str,
        reporter: Arc<dyn Reporter>,
        interval: Duration,
    ) -> HostClient {
        HostClient::new(
            base,
            "test-token",
            Duration::from_secs(5),
            Arc::new(SearchThrottle::new(interval)),
            reporter,
        )
        .expect("client")
        .with_backoff_base(Duration::from_millis(1))
    }

    fn json_response(body: &str) -> Response<std::io::Cursor<Vec<u8>>> {
        Response::from_string(body).with_header(
            Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap(),
        )
    }

    #[test]
    fn search_decodes_page_and_sends_auth() {
        let (base, handle) = with_multi_server(
            |req| {
                let url = req.url().to_string();
                assert!(url.starts_with("/search/issues?"));
                assert!(url.contains("per_page=100"));
                let auth = req
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("Authorization"))
                    .map(|h| h.value.as_str().to_string());
                assert_eq!(auth.as_deref(), Some("Bearer test-token"));
                req.respond(json_response(
                    r#"{"total_count": 1, "items": [{"number": 42}]}"#,
                ))
                .expect("respond");
            },
            1,
        );

        let cli = fast_client(&base);
        let page = cli.search_issues("type:pr author:alice", 1, 100).expect("search");
        assert_eq!(page.total_count, 1);
        assert_eq!(page.items.len(), 1);
        handle.join().expect("join");
    }

    #[test]
    fn commit_search_sends_preview_accept() {
        let (base, handle) = with_multi_server(
            |req| {
                let accept = req
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("Accept"))
                    .map(|h| h.value.as_str().to_string());
                assert_eq!(
                    accept.as_deref(),
                    Some("application/vnd.github.cloak-preview+json")
                );
                req.respond(json_response(r#"{"total_count": 0, "items": []}"#))
                    .expect("respond");
            },
            1,
        );

        let cli = fast_client(&base);
        let page = cli.search_commits("author:alice", 1, 100).expect("search");
        assert_eq!(page.total_count, 0);
        handle.join().expect("join");
    }

    #[test]
    fn server_errors_retry_then_succeed() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = Arc::clone(&hits);
        let (base, handle) = with_multi_server(
            move |req| {
                let n = hits_in.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    req.respond(Response::empty(StatusCode(500))).expect("respond");
                } else {
                    req.respond(json_response(r#"{"total_count": 0, "items": []}"#))
                        .expect("respond");
                }
            },
            3,
        );

        let cli = fast_client(&base);
        cli.search_issues("q", 1, 100).expect("eventually succeeds");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        handle.join().expect("join");
    }

    #[test]
    fn server_errors_exhaust_after_three_retries() {
        let (base, handle) = with_multi_server(
            |req| {
                req.respond(Response::empty(StatusCode(500))).expect("respond");
            },
            4,
        );

        let cli = fast_client(&base);
        let err = cli.search_issues("q", 1, 100).expect_err("must fail");
        assert_eq!(err.attempts, 4);
        assert_eq!(err.status_code(), Some(500));
        assert!(err.reason.contains("Server error 500"));
        handle.join().expect("join");
    }

    #[test]
    fn rate_limit_exhausts_at_eight_attempts() {
        let (base, handle) = with_multi_server(
            |req| {
                let resp = Response::empty(StatusCode(429)).with_header(
                    Header::from_bytes(&b"Retry-After"[..], &b"0"[..]).unwrap(),
                );
                req.respond(resp).expect("respond");
            },
            8,
        );

        let cli = fast_client(&base);
        let err = cli.search_issues("q", 1, 100).expect_err("must fail");
        assert_eq!(err.attempts, 8);
        assert_eq!(err.status_code(), Some(429));
        assert!(err.rate_limited);
        handle.join().expect("join");
    }

    #[test]
    fn rate_limited_403_retries_but_plain_403_fails_fast() {
        // First a 403 with a rate-limit body (retried), then success.
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = Arc::clone(&hits);
        let (base, handle) = with_multi_server(
            move |req| {
                let n = hits_in.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    let resp = Response::from_string(r#"{"message": "API rate limit exceeded"}"#)
                        .with_status_code(StatusCode(403))
                        .with_header(
                            Header::from_bytes(&b"Retry-After"[..], &b"0"[..]).unwrap(),
                        );
                    req.respond(resp).expect("respond");
                } else {
                    req.respond(json_response(r#"{"total_count": 0, "items": []}"#))
                        .expect("respond");
                }
            },
            2,
        );

        let cli = fast_client(&base);
        cli.search_issues("q", 1, 100).expect("recovers");
        handle.join().expect("join");

        // Plain 403 is permanent.
        let (base2, handle2) = with_multi_server(
            |req| {
                let resp = Response::from_string(r#"{"message": "Must have admin rights"}"#)
                    .with_status_code(StatusCode(403));
                req.respond(resp).expect("respond");
            },
            1,
        );
        let cli2 = fast_client(&base2);
        let err = cli2.get_pr("org/x", 1).expect_err("must fail");
        assert_eq!(err.status_code(), Some(403));
        assert!(!err.rate_limited);
        assert_eq!(err.attempts, 1);
        handle2.join().expect("join");
    }

    #[test]
    fn not_found_fails_immediately() {
        let (base, handle) = with_multi_server(
            |req| {
                req.respond(Response::empty(StatusCode(404))).expect("respond");
            },
            1,
        );

        let cli = fast_client(&base);
        let err = cli.get_pr("org/x", 9).expect_err("must fail");
        assert_eq!(err.status_code(), Some(404));
        assert_eq!(err.attempts, 1);
        handle.join().expect("join");
    }

    #[test]
    fn unprocessable_fails_immediately() {
        let (base, handle) = with_multi_server(
            |req| {
                let resp = Response::from_string(r#"{"message": "Validation Failed"}"#)
                    .with_status_code(StatusCode(422));
                req.respond(resp).expect("respond");
            },
            1,
        );

        let cli = fast_client(&base);
        let err = cli.search_issues("type:pr reviewed-by:alice", 1, 100).expect_err("must fail");
        assert_eq!(err.status_code(), Some(422));
        handle.join().expect("join");
    }

    #[test]
    fn search_calls_are_spaced_by_the_throttle() {
        let (base, handle) = with_multi_server(
            |req| {
                req.respond(json_response(r#"{"total_count": 0, "items": []}"#))
                    .expect("respond");
            },
            3,
        );

        let interval = Duration::from_millis(120);
        let cli = fast_client_with(&base, Arc::new(NullReporter), interval);

        let start = Instant::now();
        for _ in 0..3 {
            cli.search_issues("q", 1, 100).expect("search");
        }
        // Three calls mean at least two full intervals between them. A small
        // tolerance absorbs coarse timers.
        assert!(start.elapsed() >= Duration::from_millis(220), "calls were not spaced");
        handle.join().expect("join");
    }

    #[test]
    fn low_quota_emits_a_warning() {
        let (base, handle) = with_multi_server(
            |req| {
                let resp = json_response(r#"{"total_count": 0, "items": []}"#).with_header(
                    Header::from_bytes(&b"X-RateLimit-Remaining"[..], &b"42"[..]).unwrap(),
                );
                req.respond(resp).expect("respond");
            },
            1,
        );

        let reporter = CollectingReporter::new();
        let cli = fast_client_with(&base, reporter.clone(), Duration::from_millis(1));
        cli.search_issues("q", 1, 100).expect("search");

        let warnings = reporter.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("quota low"));
        handle.join().expect("join");
    }

    #[test]
    fn truncation_warns_exactly_once_per_query() {
        // Ten full pages of 100 items trip the ceiling.
        let (base, handle) = with_multi_server(
            |req| {
                let items: Vec<String> =
                    (0..100).map(|i| format!(r#"{{"number": {i}}}"#)).collect();
                let body = format!(
                    r#"{{"total_count": 5000, "items": [{}]}}"#,
                    items.join(",")
                );
                req.respond(json_response(&body)).expect("respond");
            },
            10,
        );

        let reporter = CollectingReporter::new();
        let cli = fast_client_with(&base, reporter.clone(), Duration::from_millis(1));
        let items = cli.search_issues_all("type:pr author:busy").expect("search");
        assert_eq!(items.len(), 1000);

        let truncations: Vec<_> = reporter
            .warnings()
            .into_iter()
            .filter(|w| w.contains("ceiling"))
            .collect();
        assert_eq!(truncations.len(), 1);
        assert!(truncations[0].contains("type:pr author:busy"));
        handle.join().expect("join");
    }

    #[test]
    fn rest_list_paginates_until_short_page() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in = Arc::clone(&hits);
        let (base, handle) = with_multi_server(
            move |req| {
                let n = hits_in.fetch_add(1, Ordering::SeqCst);
                let body = if n == 0 {
                    let files: Vec<String> = (0..100)
                        .map(|i| {
                            format!(
                                r#"{{"filename": "f{i}.rs", "additions": 1, "deletions": 0, "status": "modified"}}"#
                            )
                        })
                        .collect();
                    format!("[{}]", files.join(","))
                } else {
                    r#"[{"filename": "last.rs", "additions": 2, "deletions": 1, "status": "added"}]"#
                        .to_string()
                };
                req.respond(json_response(&body)).expect("respond");
            },
            2,
        );

        let cli = fast_client(&base);
        let files = cli.get_pr_files("org/x", 7).expect("files");
        assert_eq!(files.len(), 101);
        assert_eq!(files[100].filename, "last.rs");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        handle.join().expect("join");
    }

    #[test]
    fn pr_comments_merge_issue_and_review_comments() {
        let (base, handle) = with_multi_server(
            |req| {
                let url = req.url().to_string();
                let body = if url.starts_with("/repos/org/x/issues/7/comments") {
                    r#"[{"user": {"login": "bob"}, "body": "discussion", "created_at": "2025-02-16T10:00:00Z", "html_url": "https://host/c1"}]"#
                } else if url.starts_with("/repos/org/x/pulls/7/comments") {
                    r#"[{"user": {"login": "carol"}, "body": "inline nit", "created_at": "2025-02-16T11:00:00Z", "html_url": "https://host/c2"}]"#
                } else {
                    panic!("unexpected url {url}");
                };
                req.respond(json_response(body)).expect("respond");
            },
            2,
        );

        let cli = fast_client(&base);
        let comments = cli.get_pr_comments("org/x", 7).expect("comments");
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].user.as_ref().map(|u| u.login.as_str()), Some("bob"));
        assert_eq!(comments[1].user.as_ref().map(|u| u.login.as_str()), Some("carol"));
        handle.join().expect("join");
    }

    #[test]
    fn pool_hands_out_and_recycles_clients() {
        let throttle = Arc::new(SearchThrottle::new(Duration::from_millis(1)));
        let reporter: Arc<dyn Reporter> = Arc::new(NullReporter);
        let clients = (0..2)
            .map(|_| {
                HostClient::new(
                    "http://127.0.0.1:9",
                    "t",
                    Duration::from_secs(1),
                    Arc::clone(&throttle),
                    Arc::clone(&reporter),
                )
                .expect("client")
            })
            .collect();
        let pool = ClientPool::new(clients, Duration::from_millis(100));

        let a = pool.acquire().expect("first");
        let _b = pool.acquire().expect("second");
        drop(a);
        let _c = pool.acquire().expect("recycled");
    }

    #[test]
    fn pool_acquire_times_out_with_identified_error() {
        let pool = ClientPool::new(Vec::new(), Duration::from_millis(50));
        let err = pool.acquire().expect_err("empty pool must time out");
        assert_eq!(err.endpoint, "client-pool");
        assert!(err.reason.contains("timed out"));
    }

    #[test]
    fn jitter_stays_in_band() {
        for _ in 0..200 {
            let base = Duration::from_millis(1000);
            let j = jittered(base);
            assert!(j >= Duration::from_millis(750), "below band: {j:?}");
            assert!(j <= Duration::from_millis(1250), "above band: {j:?}");
        }
    }

    #[test]
    fn rate_limit_body_detection() {
        assert!(body_signals_rate_limit("API rate limit exceeded for ..."));
        assert!(body_signals_rate_limit("You have exceeded a secondary rate limit"));
        assert!(!body_signals_rate_limit("Must have admin rights to Repository."));
    }
}
