//! Collection orchestrator
//!
//! Processes individuals sequentially: runs the enabled search strategies
//! in a fixed order (document → branches → name), merges everything into a
//! candidate pool, classifies and caps the selection, records homonym
//! evidence, and hands the capped selection to the detail worker pool.
//!
//! A failure inside one individual is logged and counted; the run carries
//! on. Only configuration-level problems abort a run.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::{CacheStats, CacheStore};
use crate::client::{ClientStatsSnapshot, CooldownGate, PdpjClient, ProcessSearchApi};
use crate::config::Config;
use crate::documents::{branch_document, cnpj_root, document_kind, normalize_document, DocumentKind};
use crate::error::{ClientResult, CollectError, CollectResult};
use crate::homonym::{HomonymCase, HomonymLedger};
use crate::pool::CandidatePool;
use crate::priority::{
    apply_limits, classify, default_rules, BucketRule, ClassifyContext, PriorityBucket,
};
use crate::progress::{noop_sink, ProgressEvent, ProgressSink};
use crate::search::{PageStore, SearchLimits};
use crate::workers::{DetailFetcher, DetailTask, WorkerPool};

const QUEUE_CAPACITY: usize = 1024;
const DRAIN_LIMIT: Duration = Duration::from_secs(3600);
const HOMONYM_LEDGER_FILE: &str = "homonyms.json";

/// One input row: an individual or entity to collect records for.
/// Spreadsheet parsing happens upstream; the engine takes the parsed list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Individual {
    pub id: String,
    pub name: String,
    pub document: String,
}

/// Run-level counters shared with the worker pool (atomics).
#[derive(Debug, Default)]
pub struct RunStats {
    total: AtomicU64,
    processed: AtomicU64,
    records_selected: AtomicU64,
    details_ok: AtomicU64,
    details_404: AtomicU64,
    details_cached: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of [`RunStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatsSnapshot {
    pub total: u64,
    pub processed: u64,
    pub records_selected: u64,
    pub details_ok: u64,
    pub details_404: u64,
    pub details_cached: u64,
    pub errors: u64,
}

impl RunStats {
    pub fn set_total(&self, total: usize) {
        self.total.store(total as u64, Ordering::Relaxed);
    }

    pub fn inc_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_selected(&self, count: usize) {
        self.records_selected.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn inc_details_ok(&self) {
        self.details_ok.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_details_404(&self) {
        self.details_404.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_details_cached(&self) {
        self.details_cached.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_errors(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RunStatsSnapshot {
        RunStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            records_selected: self.records_selected.load(Ordering::Relaxed),
            details_ok: self.details_ok.load(Ordering::Relaxed),
            details_404: self.details_404.load(Ordering::Relaxed),
            details_cached: self.details_cached.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Everything a finished run reports, always returned regardless of
/// partial failures along the way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stats: RunStatsSnapshot,
    pub client: ClientStatsSnapshot,
    pub cache: CacheStats,
}

/// One line of `selection.json`: why a record was selected and whether its
/// detail is already on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SelectionEntry {
    origins: Vec<String>,
    bucket: PriorityBucket,
    fetched: bool,
}

fn record_file_name(record_id: &str) -> String {
    format!("{}.json", record_id.replace('/', "_"))
}

fn write_json_file(path: &Path, value: &Value) -> CollectResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    Ok(())
}

/// Orchestrates a full collection run.
pub struct Collector {
    cfg: Config,
    api: Arc<dyn ProcessSearchApi>,
    fetcher: Arc<dyn DetailFetcher>,
    cache: Arc<CacheStore>,
    stats: Arc<RunStats>,
    homonyms: HomonymLedger,
    rules: Vec<BucketRule>,
    sink: ProgressSink,
}

impl Collector {
    /// Production constructor: one rate-limited client, one cooldown gate
    /// shared between the orchestrator and every worker.
    pub fn new(cfg: Config) -> CollectResult<Self> {
        let gate = Arc::new(CooldownGate::new());
        let client = Arc::new(PdpjClient::from_config(&cfg, gate)?);
        Self::with_api(cfg, client.clone(), client)
    }

    /// Seam constructor for tests and alternative transports.
    pub fn with_api(
        cfg: Config,
        api: Arc<dyn ProcessSearchApi>,
        fetcher: Arc<dyn DetailFetcher>,
    ) -> CollectResult<Self> {
        let errors = cfg.validate();
        if !errors.is_empty() {
            return Err(CollectError::Config(errors.join("; ")));
        }
        let cache = Arc::new(CacheStore::open(&cfg.cache_dir));
        let homonyms = HomonymLedger::load(cfg.cache_dir.join(HOMONYM_LEDGER_FILE));
        Ok(Self {
            cfg,
            api,
            fetcher,
            cache,
            stats: Arc::new(RunStats::default()),
            homonyms,
            rules: default_rules(),
            sink: noop_sink(),
        })
    }

    pub fn with_progress_sink(mut self, sink: ProgressSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn homonyms(&self) -> &HomonymLedger {
        &self.homonyms
    }

    pub fn homonyms_mut(&mut self) -> &mut HomonymLedger {
        &mut self.homonyms
    }

    fn limits(&self) -> SearchLimits {
        SearchLimits {
            max_pages: self.cfg.max_pages_per_case,
            max_records: self.cfg.max_records_per_case,
            oversize_alarm: self.cfg.oversize_alarm,
        }
    }

    /// Run the full collection for the given individuals.
    pub async fn run(&mut self, individuals: &[Individual]) -> CollectResult<RunReport> {
        let started_at = Utc::now();
        fs::create_dir_all(&self.cfg.output_dir)?;
        self.stats.set_total(individuals.len());
        (self.sink)(&ProgressEvent::CollectionStart {
            total: individuals.len(),
        });
        info!(total = individuals.len(), "collection started");

        let worker_pool = if self.cfg.download_details {
            Some(WorkerPool::start(
                self.cfg.num_workers(),
                QUEUE_CAPACITY,
                Arc::clone(&self.fetcher),
                Arc::clone(&self.cache),
                Arc::clone(&self.stats),
                Arc::clone(&self.sink),
            ))
        } else {
            None
        };

        for (index, individual) in individuals.iter().enumerate() {
            if let Err(err) = self
                .process_individual(index, individual, worker_pool.as_ref())
                .await
            {
                self.stats.inc_errors();
                warn!(individual = %individual.id, error = %err, "individual failed; continuing");
            }
            self.stats.inc_processed();
        }

        if let Some(worker_pool) = worker_pool {
            if !worker_pool.drain(DRAIN_LIMIT).await {
                warn!(
                    pending = worker_pool.pending(),
                    "detail queue did not drain before the limit"
                );
            }
            worker_pool.shutdown().await;
        }

        if let Err(err) = self.homonyms.save() {
            warn!(error = %err, "failed to save homonym ledger");
        }
        self.cache.save_all()?;

        let report = RunReport {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            stats: self.stats.snapshot(),
            client: self.api.stats(),
            cache: self.cache.stats(),
        };
        (self.sink)(&ProgressEvent::CollectionEnd {
            report: report.clone(),
        });
        info!(
            processed = report.stats.processed,
            selected = report.stats.records_selected,
            errors = report.stats.errors,
            "collection finished"
        );
        Ok(report)
    }

    async fn process_individual(
        &mut self,
        index: usize,
        individual: &Individual,
        worker_pool: Option<&WorkerPool>,
    ) -> CollectResult<()> {
        let individual_id = format!("{:0>6}", individual.id.trim());
        let name = individual.name.trim().to_string();
        let document = normalize_document(&individual.document);
        let kind = document_kind(&individual.document);
        let root = match kind {
            Some(DocumentKind::Cnpj) => cnpj_root(&document),
            _ => String::new(),
        };

        (self.sink)(&ProgressEvent::IndividualStart {
            id: individual_id.clone(),
            name: name.clone(),
            index,
        });

        let dir = self.cfg.output_dir.join(&individual_id);
        fs::create_dir_all(&dir)?;

        if self.cfg.blacklist.contains(&document) || (!root.is_empty() && self.cfg.blacklist.contains(&root)) {
            info!(individual = %individual_id, "blacklisted; skipping");
            self.write_metadata(
                &dir,
                &individual_id,
                &name,
                &document,
                kind,
                json!({"status": "blacklisted"}),
                0,
                &Default::default(),
            )?;
            (self.sink)(&ProgressEvent::IndividualDone {
                id: individual_id,
                records: 0,
                index,
            });
            return Ok(());
        }

        let mut pool = CandidatePool::new();
        let mut searches = serde_json::Map::new();

        // (A) by document — canonical payloads come from here first
        if self.cfg.enable_document_search && kind.is_some() {
            match self.document_search(&document, &dir, &mut pool).await {
                Ok(summary) => {
                    searches.insert("by-document".to_string(), summary);
                }
                Err(err) => {
                    self.stats.inc_errors();
                    warn!(individual = %individual_id, error = %err, "document search failed");
                    searches.insert("by-document".to_string(), json!({"error": err.to_string()}));
                }
            }
        }

        // (B) CNPJ branches, 0002 onward (0001 is covered by the document search)
        if self.cfg.enable_branch_search && kind == Some(DocumentKind::Cnpj) && !root.is_empty() {
            let summary = self.branch_searches(&root, &dir, &mut pool).await;
            searches.insert("by-branch".to_string(), summary);
        }

        // (C) by name
        if self.cfg.enable_name_search && !name.is_empty() {
            match self
                .name_search(&individual_id, &name, &dir, &mut pool)
                .await
            {
                Ok(summary) => {
                    searches.insert("by-name".to_string(), summary);
                }
                Err(err) => {
                    self.stats.inc_errors();
                    warn!(individual = %individual_id, error = %err, "name search failed");
                    searches.insert("by-name".to_string(), json!({"error": err.to_string()}));
                }
            }
        }

        let ctx = ClassifyContext {
            subject_document: document.clone(),
            primary_class_code: self.cfg.primary_class_code,
        };
        let classified = classify(&pool, &self.rules, &ctx);
        let selection = apply_limits(
            &classified,
            self.cfg.per_category_cap,
            self.cfg.per_subject_cap,
        );
        self.stats.add_selected(selection.len());

        let mut entries: BTreeMap<String, SelectionEntry> = BTreeMap::new();
        for record_id in &selection {
            let origins = pool
                .get(record_id)
                .map(|entry| entry.origins.iter().cloned().collect())
                .unwrap_or_default();
            entries.insert(
                record_id.clone(),
                SelectionEntry {
                    origins,
                    bucket: classified.bucket_of(record_id),
                    fetched: false,
                },
            );
        }
        let selection_path = dir.join("selection.json");
        write_json_file(&selection_path, &serde_json::to_value(&entries)?)?;

        if let Some(worker_pool) = worker_pool {
            let details_dir = dir.join("details");
            fs::create_dir_all(&details_dir)?;
            for record_id in &selection {
                if self.cache.is_known_missing(record_id) {
                    self.stats.inc_details_404();
                    continue;
                }
                let save_path = details_dir.join(record_file_name(record_id));
                if save_path.is_file() {
                    self.cache.add_completed(record_id, "ok");
                    self.stats.inc_details_cached();
                    if let Some(entry) = entries.get_mut(record_id) {
                        entry.fetched = true;
                    }
                    continue;
                }
                worker_pool
                    .submit(DetailTask {
                        record_id: record_id.clone(),
                        save_path,
                        owner_document: document.clone(),
                    })
                    .await?;
            }
            // re-persist with the cache-hit flags filled in
            write_json_file(&selection_path, &serde_json::to_value(&entries)?)?;
        }

        self.write_metadata(
            &dir,
            &individual_id,
            &name,
            &document,
            kind,
            Value::Object(searches),
            selection.len(),
            &classified,
        )?;

        (self.sink)(&ProgressEvent::IndividualDone {
            id: individual_id,
            records: selection.len(),
            index,
        });
        Ok(())
    }

    async fn document_search(
        &self,
        document: &str,
        dir: &Path,
        pool: &mut CandidatePool,
    ) -> ClientResult<Value> {
        let store = PageStore::new(dir.join("by-document").join("pages"));
        let outcome = self
            .api
            .search_by_document(document, &self.limits(), Some(&store))
            .await?;
        if outcome.oversized {
            warn!(document, total = outcome.total_reported, "oversized individual");
            self.cache.add_oversized(document, outcome.total_reported);
        }
        let found = outcome.records.len();
        let summary = json!({
            "total_reported": outcome.total_reported,
            "records": found,
            "pages": outcome.pages,
            "oversized": outcome.oversized,
        });
        pool.merge(outcome.records, "by-document");
        Ok(summary)
    }

    async fn branch_searches(&self, root: &str, dir: &Path, pool: &mut CandidatePool) -> Value {
        let mut info = serde_json::Map::new();
        for n in 2..2 + u64::from(self.cfg.max_branches) {
            let branch = format!("{n:0>4}");
            let Some(branch_doc) = branch_document(root, &branch) else {
                continue;
            };
            if self.cache.is_branch_missing(&branch_doc) {
                continue;
            }
            let store = PageStore::new(dir.join("by-branch").join(&branch_doc).join("pages"));
            match self
                .api
                .search_by_document(&branch_doc, &self.limits(), Some(&store))
                .await
            {
                Ok(outcome) => {
                    let found = outcome.records.len();
                    if found == 0 {
                        self.cache.add_missing_branch(&branch_doc);
                    }
                    pool.merge(outcome.records, &format!("by-branch:{branch_doc}"));
                    info.insert(branch_doc, json!({"records": found}));
                }
                Err(err) => {
                    self.stats.inc_errors();
                    warn!(branch = %branch_doc, error = %err, "branch search failed");
                    info.insert(branch_doc, json!({"error": err.to_string()}));
                }
            }
        }
        Value::Object(info)
    }

    async fn name_search(
        &mut self,
        individual_id: &str,
        name: &str,
        dir: &Path,
        pool: &mut CandidatePool,
    ) -> ClientResult<Value> {
        let store = PageStore::new(dir.join("by-name"));
        let outcome = self
            .api
            .search_by_name(name, &self.limits(), Some(&store))
            .await?;

        let case = HomonymCase::from_search_results(name, &outcome.results);
        let case_summary = case.as_ref().map(|case| {
            json!({
                "status": case.status,
                "candidates": case.candidates.keys().cloned().collect::<Vec<_>>(),
            })
        });
        if let Some(case) = case {
            self.homonyms.record(individual_id, case);
        }

        let found = outcome.results.len();
        let summary = json!({
            "records": found,
            "per_field": outcome.per_field,
            "homonym": case_summary,
        });
        pool.merge(outcome.results, "by-name");
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn write_metadata(
        &self,
        dir: &Path,
        individual_id: &str,
        name: &str,
        document: &str,
        kind: Option<DocumentKind>,
        searches: Value,
        selected: usize,
        classified: &crate::priority::Classified,
    ) -> CollectResult<()> {
        let metadata = json!({
            "id": individual_id,
            "name": name,
            "document": document,
            "document_kind": kind,
            "searches": searches,
            "selected": selected,
            "buckets": {
                "primary-class": classified.primary.len(),
                "favorable-role": classified.favorable.len(),
                "other": classified.other.len(),
            },
            "timestamp": Utc::now(),
        });
        write_json_file(&dir.join("metadata.json"), &metadata)
    }

    /// Fetch details for an explicit record-id list, outside the search
    /// flow, with the same cache discipline. Returns the payloads found.
    pub async fn fetch_details_for(
        &self,
        record_ids: &[String],
        subdir: &str,
    ) -> CollectResult<BTreeMap<String, Value>> {
        let dir = self.cfg.output_dir.join(subdir);
        fs::create_dir_all(&dir)?;
        let mut details = BTreeMap::new();

        for raw in record_ids {
            let record_id = raw.trim();
            if record_id.is_empty() {
                continue;
            }
            if self.cache.is_known_missing(record_id) {
                self.stats.inc_details_404();
                continue;
            }
            let save_path = dir.join(record_file_name(record_id));
            match self.fetcher.fetch_detail(record_id, &save_path).await {
                Ok(Some(value)) => {
                    self.cache.add_completed(record_id, "ok");
                    self.stats.inc_details_ok();
                    details.insert(record_id.to_string(), value);
                }
                Ok(None) => {
                    self.cache.add_missing(record_id);
                    self.stats.inc_details_404();
                }
                Err(err) => {
                    warn!(record_id, error = %err, "detail fetch failed");
                    self.stats.inc_errors();
                }
            }
        }
        self.cache.save_all()?;
        Ok(details)
    }
}
