//! PDPJ API client
//!
//! Rate-limited HTTP client for the PDPJ process search API: bearer-token
//! rotation, bounded retries with exponential backoff, and a shared global
//! cooldown raised on HTTP 429 so concurrent callers back off together.

pub mod cooldown;

pub use cooldown::CooldownGate;

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{ClientError, ClientResult, CollectError, CollectResult};
use crate::search::{self, PageFetcher, PageStore, SearchLimits, SearchOutcome, SearchQuery, SearchResult};
use crate::workers::DetailFetcher;

/// Name-search runs one pagination per field, then merges.
const NAME_FIELDS: [&str; 2] = ["nomeParte", "outroNomeParte"];

/// Shared request counters (atomics; readable at any point of a run).
#[derive(Debug, Default)]
pub struct ClientStats {
    pub requests: AtomicU64,
    pub retries: AtomicU64,
    pub rate_limited: AtomicU64,
    pub errors_other: AtomicU64,
    pub pages_ok: AtomicU64,
    pub details_ok: AtomicU64,
}

/// Point-in-time copy of [`ClientStats`] for reports and events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStatsSnapshot {
    pub requests: u64,
    pub retries: u64,
    pub rate_limited: u64,
    pub errors_other: u64,
    pub pages_ok: u64,
    pub details_ok: u64,
}

impl ClientStats {
    pub fn snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            errors_other: self.errors_other.load(Ordering::Relaxed),
            pages_ok: self.pages_ok.load(Ordering::Relaxed),
            details_ok: self.details_ok.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of a by-name search (both name fields, merged and deduplicated).
#[derive(Debug, Clone, Default)]
pub struct NameSearchOutcome {
    /// Deduplicated by record id; the first-seen payload wins
    pub results: Vec<SearchResult>,
    /// Records each name field produced, before deduplication
    pub per_field: std::collections::BTreeMap<String, usize>,
}

/// The search/detail surface the orchestrator consumes.
///
/// `PdpjClient` is the production implementation; tests inject scripted
/// fakes the same way the research-source loaders are faked elsewhere.
#[async_trait]
pub trait ProcessSearchApi: Send + Sync {
    async fn search_by_document(
        &self,
        document: &str,
        limits: &SearchLimits,
        store: Option<&PageStore>,
    ) -> ClientResult<SearchOutcome>;

    async fn search_by_name(
        &self,
        name: &str,
        limits: &SearchLimits,
        store: Option<&PageStore>,
    ) -> ClientResult<NameSearchOutcome>;

    async fn fetch_detail(&self, record_id: &str, save_path: &Path)
        -> ClientResult<Option<Value>>;

    fn stats(&self) -> ClientStatsSnapshot;
}

/// Rate-limited client for the PDPJ API.
pub struct PdpjClient {
    http: reqwest::Client,
    base_url: String,
    tribunal: String,
    class_id: Option<String>,
    page_size: u32,
    tokens: Vec<String>,
    token_cursor: AtomicUsize,
    cooldown: Arc<CooldownGate>,
    stats: ClientStats,
    max_retries: u32,
    backoff_base: f64,
}

impl PdpjClient {
    /// Build a client from configuration, sharing the given cooldown gate
    /// with every other holder of it.
    pub fn from_config(cfg: &Config, cooldown: Arc<CooldownGate>) -> CollectResult<Self> {
        if cfg.tokens.is_empty() {
            return Err(CollectError::Config(
                "at least one PDPJ token is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(ClientError::Network)?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            tribunal: cfg.tribunal.clone(),
            class_id: cfg.class_id.clone(),
            page_size: cfg.page_size,
            tokens: cfg.tokens.clone(),
            token_cursor: AtomicUsize::new(0),
            cooldown,
            stats: ClientStats::default(),
            max_retries: cfg.max_retries,
            backoff_base: cfg.backoff_base,
        })
    }

    pub fn cooldown(&self) -> &Arc<CooldownGate> {
        &self.cooldown
    }

    pub fn stats_snapshot(&self) -> ClientStatsSnapshot {
        self.stats.snapshot()
    }

    fn next_token(&self) -> &str {
        let n = self.token_cursor.fetch_add(1, Ordering::Relaxed);
        &self.tokens[n % self.tokens.len()]
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        Duration::from_secs_f64(self.backoff_base * f64::powi(2.0, attempt as i32) + jitter)
    }

    /// Authenticated GET with bounded retries.
    ///
    /// 429 raises the shared cooldown for everyone and retries; 5xx and
    /// transport errors retry with exponential backoff; anything else is
    /// returned to the caller as-is (including 404s).
    pub async fn get(&self, url: &str, params: &[(String, String)]) -> ClientResult<Response> {
        let mut last: Option<ClientError> = None;

        for attempt in 0..self.max_retries {
            self.cooldown.wait_ready().await;
            self.stats.requests.fetch_add(1, Ordering::Relaxed);

            let request = self
                .http
                .get(url)
                .query(params)
                .bearer_auth(self.next_token())
                .header("Accept", "application/json");

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
                        let retry_after = resp
                            .headers()
                            .get(reqwest::header::RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .unwrap_or(30);
                        let wait = retry_after.max(10 * (u64::from(attempt) + 1));
                        warn!(wait_secs = wait, attempt, "rate limited; raising global cooldown");
                        self.cooldown.raise(Duration::from_secs(wait));
                        sleep(Duration::from_secs(wait)).await;
                        self.cooldown.lower();
                        last = Some(ClientError::RateLimited { attempt });
                        continue;
                    }
                    if status.is_server_error() {
                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        let wait = self.backoff(attempt);
                        debug!(status = status.as_u16(), attempt, wait_ms = wait.as_millis() as u64, "server error; backing off");
                        sleep(wait).await;
                        last = Some(ClientError::Transient {
                            status: status.as_u16(),
                            attempt,
                        });
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    self.stats.errors_other.fetch_add(1, Ordering::Relaxed);
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    let wait = self.backoff(attempt);
                    debug!(error = %err, attempt, wait_ms = wait.as_millis() as u64, "network error; backing off");
                    sleep(wait).await;
                    last = Some(ClientError::Network(err));
                }
            }
        }

        Err(ClientError::ExhaustedRetries {
            attempts: self.max_retries,
            source: last.map(Box::new),
        })
    }

    fn base_params(&self) -> Vec<(String, String)> {
        vec![
            ("siglaTribunal".to_string(), self.tribunal.clone()),
            ("tamanhoPagina".to_string(), self.page_size.to_string()),
        ]
    }

    async fn run_search(
        &self,
        query: SearchQuery,
        limits: &SearchLimits,
        store: Option<&PageStore>,
    ) -> ClientResult<SearchOutcome> {
        let outcome = search::run(self, &query, limits, store).await?;
        self.stats
            .pages_ok
            .fetch_add(u64::from(outcome.pages), Ordering::Relaxed);
        Ok(outcome)
    }
}

#[async_trait]
impl PageFetcher for PdpjClient {
    async fn fetch_page(
        &self,
        query: &SearchQuery,
        cursor: Option<&str>,
    ) -> ClientResult<Option<Value>> {
        let mut params = query.params.clone();
        if let Some(cursor) = cursor {
            params.push(("searchAfter".to_string(), cursor.to_string()));
        }
        let resp = self.get(&self.base_url, &params).await?;
        let status = resp.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "search page rejected; stopping pagination");
            return Ok(None);
        }
        Ok(Some(resp.json::<Value>().await?))
    }
}

#[async_trait]
impl ProcessSearchApi for PdpjClient {
    /// Paginated search by CPF/CNPJ (`cpfCnpjParte`).
    async fn search_by_document(
        &self,
        document: &str,
        limits: &SearchLimits,
        store: Option<&PageStore>,
    ) -> ClientResult<SearchOutcome> {
        let mut params = self.base_params();
        params.push(("cpfCnpjParte".to_string(), document.to_string()));
        if let Some(class_id) = &self.class_id {
            params.push(("idClasse".to_string(), class_id.clone()));
        }
        self.run_search(SearchQuery::new(params), limits, store).await
    }

    /// Paginated search across both name fields, merged and deduplicated by
    /// record id (first-seen payload wins).
    async fn search_by_name(
        &self,
        name: &str,
        limits: &SearchLimits,
        store: Option<&PageStore>,
    ) -> ClientResult<NameSearchOutcome> {
        let mut outcome = NameSearchOutcome::default();
        let mut seen = std::collections::HashSet::new();

        for field in NAME_FIELDS {
            let mut params = self.base_params();
            params.push((field.to_string(), name.to_string()));
            let field_store = store.map(|s| s.child(field));
            let field_outcome = self
                .run_search(SearchQuery::new(params), limits, field_store.as_ref())
                .await?;

            outcome
                .per_field
                .insert(field.to_string(), field_outcome.records.len());
            for result in field_outcome.records {
                if seen.insert(result.identifier.clone()) {
                    outcome.results.push(result);
                }
            }
        }
        Ok(outcome)
    }

    async fn fetch_detail(
        &self,
        record_id: &str,
        save_path: &Path,
    ) -> ClientResult<Option<Value>> {
        self.fetch_detail_at(record_id, Some(save_path)).await
    }

    fn stats(&self) -> ClientStatsSnapshot {
        self.stats.snapshot()
    }
}

impl PdpjClient {
    /// Fetch one detail record (`GET {base}/{record_id}`).
    ///
    /// An existing readable file at `save_path` is returned without a
    /// request. 404 and other non-success statuses are `Ok(None)`; a
    /// successful payload is persisted at `save_path` best-effort.
    pub async fn fetch_detail_at(
        &self,
        record_id: &str,
        save_path: Option<&Path>,
    ) -> ClientResult<Option<Value>> {
        if let Some(path) = save_path {
            if path.is_file() {
                if let Ok(raw) = fs::read_to_string(path) {
                    if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                        return Ok(Some(value));
                    }
                }
                // unreadable cached payload: fetch again
            }
        }

        let url = format!("{}/{}", self.base_url, record_id);
        let resp = self.get(&url, &[]).await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            warn!(record_id, status = status.as_u16(), "detail request rejected");
            return Ok(None);
        }

        let value: Value = resp.json().await?;
        self.stats.details_ok.fetch_add(1, Ordering::Relaxed);

        if let Some(path) = save_path {
            let persisted = path
                .parent()
                .map(fs::create_dir_all)
                .transpose()
                .and_then(|_| {
                    fs::write(path, serde_json::to_string_pretty(&value).unwrap_or_default())
                });
            if let Err(err) = persisted {
                warn!(record_id, path = %path.display(), error = %err, "failed to persist detail payload");
            }
        }
        Ok(Some(value))
    }
}

#[async_trait]
impl DetailFetcher for PdpjClient {
    async fn fetch_detail(&self, record_id: &str, save_path: &Path)
        -> ClientResult<Option<Value>> {
        self.fetch_detail_at(record_id, Some(save_path)).await
    }
}
