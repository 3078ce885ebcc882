//! End-to-end collection flow against scripted search/detail fakes.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use pdpj_collector::{
    ClientResult, ClientStatsSnapshot, Collector, Config, DetailFetcher, HomonymStatus,
    Individual, NameSearchOutcome, PageStore, ProcessSearchApi, ProgressEvent, SearchLimits,
    SearchOutcome, SearchResult,
};

const SUBJECT_CNPJ: &str = "12345678000195";
// first branch probed for the subject root (0002 + recomputed check digits)
const BRANCH_CNPJ: &str = "12345678000276";
const OTHER_CPF: &str = "52998224725";

fn result_from(record: Value) -> SearchResult {
    SearchResult {
        identifier: record["numeroProcesso"].as_str().unwrap().to_string(),
        record,
        page_index: 1,
    }
}

/// A record whose class code lands it in the primary bucket.
fn primary_record(id: &str) -> Value {
    json!({
        "numeroProcesso": id,
        "tramitacoes": [{
            "classe": [{"codigo": 1116}],
            "partes": [{
                "nome": "ACME LTDA",
                "polo": "PASSIVO",
                "documentosPrincipais": [{"numero": SUBJECT_CNPJ}]
            }]
        }]
    })
}

/// A record where the subject sits on the favorable (ATIVO) pole.
fn favorable_record(id: &str) -> Value {
    json!({
        "numeroProcesso": id,
        "tramitacoes": [{
            "classe": [{"codigo": 7}],
            "partes": [{
                "nome": "ACME LTDA",
                "polo": "ATIVO",
                "documentosPrincipais": [{"numero": SUBJECT_CNPJ}]
            }]
        }]
    })
}

fn other_record(id: &str) -> Value {
    json!({
        "numeroProcesso": id,
        "tramitacoes": [{"classe": [{"codigo": 7}]}]
    })
}

/// A name-search record attributable to a different person (CPF).
fn homonym_record(id: &str) -> Value {
    json!({
        "numeroProcesso": id,
        "tramitacoes": [{
            "partes": [{
                "nome": "ACME COMERCIO",
                "polo": "PASSIVO",
                "documentosPrincipais": [{"numero": OTHER_CPF}]
            }]
        }]
    })
}

/// Scripted API: per-document search outcomes, one name-search outcome,
/// per-record detail payloads. Every call is logged.
#[derive(Default)]
struct FakeApi {
    by_document: HashMap<String, Vec<Value>>,
    by_name: Vec<Value>,
    details: HashMap<String, Value>,
    document_calls: Mutex<Vec<String>>,
    name_calls: Mutex<Vec<String>>,
    detail_calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ProcessSearchApi for FakeApi {
    async fn search_by_document(
        &self,
        document: &str,
        _limits: &SearchLimits,
        _store: Option<&PageStore>,
    ) -> ClientResult<SearchOutcome> {
        self.document_calls.lock().unwrap().push(document.to_string());
        let records: Vec<SearchResult> = self
            .by_document
            .get(document)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(result_from)
            .collect();
        Ok(SearchOutcome {
            total_reported: records.len() as u64,
            pages: u32::from(!records.is_empty()),
            oversized: false,
            records,
        })
    }

    async fn search_by_name(
        &self,
        name: &str,
        _limits: &SearchLimits,
        _store: Option<&PageStore>,
    ) -> ClientResult<NameSearchOutcome> {
        self.name_calls.lock().unwrap().push(name.to_string());
        let results: Vec<SearchResult> = self.by_name.iter().cloned().map(result_from).collect();
        let mut per_field = BTreeMap::new();
        per_field.insert("nomeParte".to_string(), results.len());
        per_field.insert("outroNomeParte".to_string(), 0);
        Ok(NameSearchOutcome { results, per_field })
    }

    async fn fetch_detail(&self, record_id: &str, save_path: &Path)
        -> ClientResult<Option<Value>> {
        DetailFetcher::fetch_detail(self, record_id, save_path).await
    }

    fn stats(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot::default()
    }
}

#[async_trait]
impl DetailFetcher for FakeApi {
    async fn fetch_detail(&self, record_id: &str, save_path: &Path)
        -> ClientResult<Option<Value>> {
        self.detail_calls.lock().unwrap().push(record_id.to_string());
        let payload = self.details.get(record_id).cloned();
        if let Some(payload) = &payload {
            std::fs::create_dir_all(save_path.parent().unwrap()).unwrap();
            std::fs::write(save_path, payload.to_string()).unwrap();
        }
        Ok(payload)
    }
}

fn scripted_api() -> FakeApi {
    let mut api = FakeApi::default();
    api.by_document.insert(
        SUBJECT_CNPJ.to_string(),
        vec![
            primary_record("proc-primary"),
            favorable_record("proc-favorable"),
            other_record("proc-other"),
        ],
    );
    // branch 0002 exists in the registry but has no processes
    api.by_document.insert(BRANCH_CNPJ.to_string(), vec![]);
    api.by_name = vec![
        favorable_record("proc-favorable"),
        homonym_record("proc-homonym"),
    ];
    api.details.insert(
        "proc-primary".to_string(),
        json!({"numeroProcesso": "proc-primary", "tramitacoes": []}),
    );
    api.details.insert(
        "proc-favorable".to_string(),
        json!({"numeroProcesso": "proc-favorable", "tramitacoes": []}),
    );
    api
}

fn test_config(base: &Path) -> Config {
    Config {
        tokens: vec!["test-token".to_string()],
        download_details: true,
        per_category_cap: 1,
        per_subject_cap: 2,
        max_branches: 1,
        output_dir: base.join("outputs"),
        cache_dir: base.join("cache"),
        ..Config::default()
    }
}

fn subject() -> Individual {
    Individual {
        id: "1".to_string(),
        name: "ACME COMERCIO".to_string(),
        document: "12.345.678/0001-95".to_string(),
    }
}

#[tokio::test]
async fn test_full_collection_run() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config(dir.path());
    let api = Arc::new(scripted_api());

    let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_events = Arc::clone(&events);
    let mut collector = Collector::with_api(cfg, api.clone(), api.clone())
        .unwrap()
        .with_progress_sink(Arc::new(move |event: &ProgressEvent| {
            let tag = serde_json::to_value(event).unwrap()["event"]
                .as_str()
                .unwrap()
                .to_string();
            sink_events.lock().unwrap().push(tag);
        }));

    let report = collector.run(&[subject()]).await.unwrap();

    // selection honored the caps: first primary + first favorable
    let ind_dir = dir.path().join("outputs").join("000001");
    let selection: BTreeMap<String, Value> =
        serde_json::from_str(&std::fs::read_to_string(ind_dir.join("selection.json")).unwrap())
            .unwrap();
    let mut selected: Vec<&String> = selection.keys().collect();
    selected.sort();
    assert_eq!(selected, ["proc-favorable", "proc-primary"]);
    assert_eq!(selection["proc-primary"]["bucket"], "primary-class");
    assert_eq!(selection["proc-favorable"]["bucket"], "favorable-role");
    // provenance accumulated across strategies
    assert_eq!(
        selection["proc-favorable"]["origins"]
            .as_array()
            .unwrap()
            .len(),
        2
    );

    // the branch with zero results was marked inexistent
    assert!(collector.cache().stats().missing_branches == 1);

    // both selected details were fetched and cached
    assert!(ind_dir.join("details").join("proc-primary.json").is_file());
    assert!(ind_dir.join("details").join("proc-favorable.json").is_file());
    assert!(collector.cache().is_completed("proc-primary"));
    assert!(collector.cache().is_completed("proc-favorable"));

    // name search surfaced two distinct documents -> pending homonym case
    let case = collector.homonyms().get("000001").unwrap();
    assert_eq!(case.status, HomonymStatus::Pending);
    assert_eq!(case.candidates.len(), 2);
    assert_eq!(
        case.resolved_record_ids(),
        Some(std::collections::BTreeSet::new())
    );

    // metadata captured the per-search summaries
    let metadata: Value =
        serde_json::from_str(&std::fs::read_to_string(ind_dir.join("metadata.json")).unwrap())
            .unwrap();
    assert_eq!(metadata["document_kind"], "CNPJ");
    assert_eq!(metadata["searches"]["by-document"]["records"], 3);
    assert_eq!(metadata["searches"]["by-branch"][BRANCH_CNPJ]["records"], 0);
    assert_eq!(metadata["selected"], 2);

    assert_eq!(report.stats.processed, 1);
    assert_eq!(report.stats.records_selected, 2);
    assert_eq!(report.stats.details_ok, 2);
    assert_eq!(report.stats.errors, 0);

    let events = events.lock().unwrap();
    assert_eq!(events.first().map(String::as_str), Some("collection-start"));
    assert_eq!(events.last().map(String::as_str), Some("collection-end"));
    assert!(events.iter().any(|e| e == "individual-start"));
    assert!(events.iter().any(|e| e == "individual-done"));
    assert!(events.iter().filter(|e| *e == "detail-ok").count() == 2);
}

#[tokio::test]
async fn test_second_run_skips_missing_branch_and_reuses_details() {
    let dir = tempfile::tempdir().unwrap();

    let api = Arc::new(scripted_api());
    let mut first = Collector::with_api(test_config(dir.path()), api.clone(), api.clone()).unwrap();
    first.run(&[subject()]).await.unwrap();

    let branch_probes = |api: &FakeApi| {
        api.document_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|d| *d == BRANCH_CNPJ)
            .count()
    };
    assert_eq!(branch_probes(&api), 1);
    assert_eq!(api.detail_calls.lock().unwrap().len(), 2);

    // a fresh collector over the same cache directory
    let api2 = Arc::new(scripted_api());
    let mut second =
        Collector::with_api(test_config(dir.path()), api2.clone(), api2.clone()).unwrap();
    let report = second.run(&[subject()]).await.unwrap();

    // the inexistent branch was not probed again
    assert_eq!(branch_probes(&api2), 0);
    // details already on disk count as cache hits, no refetch
    assert_eq!(api2.detail_calls.lock().unwrap().len(), 0);
    assert_eq!(report.stats.details_cached, 2);
    assert_eq!(report.stats.details_ok, 0);

    // the cache-hit flags were persisted on the second pass
    let ind_dir = dir.path().join("outputs").join("000001");
    let selection: BTreeMap<String, Value> =
        serde_json::from_str(&std::fs::read_to_string(ind_dir.join("selection.json")).unwrap())
            .unwrap();
    assert_eq!(selection["proc-primary"]["fetched"], true);
    assert_eq!(selection["proc-favorable"]["fetched"], true);
}

#[tokio::test]
async fn test_homonym_resolution_survives_reruns() {
    let dir = tempfile::tempdir().unwrap();

    let api = Arc::new(scripted_api());
    let mut collector =
        Collector::with_api(test_config(dir.path()), api.clone(), api.clone()).unwrap();
    collector.run(&[subject()]).await.unwrap();

    // a human confirms the subject document and rejects the homonym
    let selections = BTreeMap::from([
        (SUBJECT_CNPJ.to_string(), true),
        (OTHER_CPF.to_string(), false),
    ]);
    collector
        .homonyms_mut()
        .resolve("000001", &selections)
        .unwrap();
    collector.homonyms().save().unwrap();

    // a later run must not clobber the resolution
    let api2 = Arc::new(scripted_api());
    let mut rerun =
        Collector::with_api(test_config(dir.path()), api2.clone(), api2.clone()).unwrap();
    rerun.run(&[subject()]).await.unwrap();

    let case = rerun.homonyms().get("000001").unwrap();
    assert_eq!(case.status, HomonymStatus::Resolved);
    let resolved = case.resolved_record_ids().unwrap();
    assert!(resolved.contains("proc-favorable"));
    assert!(!resolved.contains("proc-homonym"));
}

#[tokio::test]
async fn test_individual_failures_do_not_abort_the_run() {
    // an API that fails every search
    struct FailingApi;

    #[async_trait]
    impl ProcessSearchApi for FailingApi {
        async fn search_by_document(
            &self,
            _document: &str,
            _limits: &SearchLimits,
            _store: Option<&PageStore>,
        ) -> ClientResult<SearchOutcome> {
            Err(pdpj_collector::ClientError::ExhaustedRetries {
                attempts: 5,
                source: None,
            })
        }

        async fn search_by_name(
            &self,
            _name: &str,
            _limits: &SearchLimits,
            _store: Option<&PageStore>,
        ) -> ClientResult<NameSearchOutcome> {
            Err(pdpj_collector::ClientError::ExhaustedRetries {
                attempts: 5,
                source: None,
            })
        }

        async fn fetch_detail(
            &self,
            _record_id: &str,
            _save_path: &Path,
        ) -> ClientResult<Option<Value>> {
            Ok(None)
        }

        fn stats(&self) -> ClientStatsSnapshot {
            ClientStatsSnapshot::default()
        }
    }

    #[async_trait]
    impl DetailFetcher for FailingApi {
        async fn fetch_detail(
            &self,
            _record_id: &str,
            _save_path: &Path,
        ) -> ClientResult<Option<Value>> {
            Ok(None)
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(FailingApi);
    let mut collector =
        Collector::with_api(test_config(dir.path()), api.clone(), api.clone()).unwrap();

    let report = collector.run(&[subject()]).await.unwrap();

    // every search failed but the run finished and reported
    assert_eq!(report.stats.processed, 1);
    assert_eq!(report.stats.records_selected, 0);
    assert!(report.stats.errors >= 2);

    // the failed searches are visible in the metadata
    let metadata: Value = serde_json::from_str(
        &std::fs::read_to_string(
            dir.path()
                .join("outputs")
                .join("000001")
                .join("metadata.json"),
        )
        .unwrap(),
    )
    .unwrap();
    assert!(metadata["searches"]["by-document"]["error"].is_string());
    assert!(metadata["searches"]["by-name"]["error"].is_string());
}

#[tokio::test]
async fn test_blacklisted_individual_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.blacklist.insert("12345678".to_string()); // the subject's CNPJ root

    let api = Arc::new(scripted_api());
    let mut collector = Collector::with_api(cfg, api.clone(), api.clone()).unwrap();
    let report = collector.run(&[subject()]).await.unwrap();

    assert_eq!(report.stats.records_selected, 0);
    assert!(api.document_calls.lock().unwrap().is_empty());
    assert!(api.name_calls.lock().unwrap().is_empty());

    let metadata: Value = serde_json::from_str(
        &std::fs::read_to_string(
            dir.path()
                .join("outputs")
                .join("000001")
                .join("metadata.json"),
        )
        .unwrap(),
    )
    .unwrap();
    assert_eq!(metadata["searches"]["status"], "blacklisted");
}

#[tokio::test]
async fn test_fetch_details_for_explicit_list() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(scripted_api());
    let collector =
        Collector::with_api(test_config(dir.path()), api.clone(), api.clone()).unwrap();

    // pre-mark one id as known missing; it must not be fetched
    collector.cache().add_missing("proc-gone");

    let ids = vec![
        "proc-primary".to_string(),
        "proc-gone".to_string(),
        " ".to_string(),
        "proc-unknown".to_string(),
    ];
    let details = collector.fetch_details_for(&ids, "by-number").await.unwrap();

    assert_eq!(details.len(), 1);
    assert!(details.contains_key("proc-primary"));
    let calls = api.detail_calls.lock().unwrap();
    assert!(calls.contains(&"proc-primary".to_string()));
    assert!(!calls.contains(&"proc-gone".to_string()));
    // the unknown id came back 404 and is now cached as missing
    assert!(collector.cache().is_known_missing("proc-unknown"));
    assert!(dir
        .path()
        .join("outputs")
        .join("by-number")
        .join("proc-primary.json")
        .is_file());
}

#[tokio::test]
async fn test_cooldown_blocks_concurrent_callers() {
    use pdpj_collector::CooldownGate;
    use std::time::{Duration, Instant};

    // one caller hits the limit and raises the gate for everyone
    let gate = Arc::new(CooldownGate::new());
    gate.raise(Duration::from_millis(120));

    let mut join = Vec::new();
    for _ in 0..4 {
        let gate = Arc::clone(&gate);
        join.push(tokio::spawn(async move {
            let start = Instant::now();
            gate.wait_ready().await;
            start.elapsed()
        }));
    }
    for handle in join {
        // no caller proceeded while the window was active
        assert!(handle.await.unwrap() >= Duration::from_millis(110));
    }
}
