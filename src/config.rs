//! Runtime configuration
//!
//! Environment-driven and injectable: the CLI builds one from `PDPJ_*`
//! variables, a frontend can deserialize one from a request body. Defaults
//! are tuned for the PDPJ integration environment.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str =
    "https://api-processo-integracao.data-lake.pdpj.jus.br/processo-api/api/v1/processos";

/// Full configuration for a collection run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bearer tokens, rotated round-robin across requests
    pub tokens: Vec<String>,
    pub base_url: String,
    /// Court selector (`siglaTribunal` query parameter)
    pub tribunal: String,
    /// Optional `idClasse` filter applied to document searches
    pub class_id: Option<String>,
    /// Class code that puts a record in the primary priority bucket
    pub primary_class_code: i64,

    /// `tamanhoPagina` for search requests
    pub page_size: u32,
    pub max_pages_per_case: u32,
    pub max_records_per_case: usize,
    /// Reported totals above this mark the individual as oversized
    pub oversize_alarm: u64,
    /// Per-priority-bucket selection cap (0 = unlimited)
    pub per_category_cap: usize,
    /// Overall selection cap per individual (0 = unlimited)
    pub per_subject_cap: usize,
    /// CNPJ branches probed per root, starting at 0002
    pub max_branches: u32,

    pub download_details: bool,
    pub enable_document_search: bool,
    pub enable_name_search: bool,
    pub enable_branch_search: bool,
    pub workers_per_token: usize,

    pub max_retries: u32,
    pub backoff_base: f64,
    pub request_timeout_secs: u64,

    /// Documents (or CNPJ roots) never searched
    pub blacklist: HashSet<String>,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            tribunal: "TJPE".to_string(),
            class_id: Some("1116".to_string()),
            primary_class_code: 1116,
            page_size: 100,
            max_pages_per_case: 100,
            max_records_per_case: 1000,
            oversize_alarm: 5000,
            per_category_cap: 1,
            per_subject_cap: 2,
            max_branches: 1,
            download_details: false,
            enable_document_search: true,
            enable_name_search: true,
            enable_branch_search: true,
            workers_per_token: 1,
            max_retries: 5,
            backoff_base: 1.0,
            request_timeout_secs: 60,
            blacklist: HashSet::from(["9999".to_string()]),
            output_dir: PathBuf::from("outputs"),
            cache_dir: PathBuf::from("."),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes" | "sim"),
        None => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Build a configuration from `PDPJ_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            tokens: env_string("PDPJ_TOKENS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            base_url: env_string("PDPJ_BASE_URL").unwrap_or(d.base_url),
            tribunal: env_string("PDPJ_TRIBUNAL").unwrap_or(d.tribunal),
            class_id: match env_string("PDPJ_ID_CLASSE") {
                Some(v) => Some(v),
                None => d.class_id,
            },
            primary_class_code: env_parse("PDPJ_PRIMARY_CLASS_CODE", d.primary_class_code),
            page_size: env_parse("MAX_POR_PAGINA", d.page_size),
            max_pages_per_case: env_parse("MAX_PAGINAS_POR_CASO", d.max_pages_per_case),
            max_records_per_case: env_parse("MAX_PROCESSOS_TOTAIS_POR_CASO", d.max_records_per_case),
            oversize_alarm: env_parse("MAX_PROCESSOS_ALERTA_API", d.oversize_alarm),
            per_category_cap: env_parse("MAX_PROCESSOS_PER_DOC", d.per_category_cap),
            per_subject_cap: env_parse("MAX_PROCESSOS_PER_CNPJ_ROOT", d.per_subject_cap),
            max_branches: env_parse("MAX_FILIAIS", d.max_branches),
            download_details: env_bool("DOWNLOAD_DETALHES", d.download_details),
            enable_document_search: env_bool("ENABLE_BUSCA_DOCUMENTO", d.enable_document_search),
            enable_name_search: env_bool("ENABLE_BUSCA_NOME", d.enable_name_search),
            enable_branch_search: env_bool("ENABLE_BUSCA_FILIAL", d.enable_branch_search),
            workers_per_token: env_parse("WORKERS_PER_TOKEN", d.workers_per_token),
            max_retries: env_parse("PDPJ_MAX_RETRIES", d.max_retries),
            backoff_base: env_parse("PDPJ_BACKOFF_BASE", d.backoff_base),
            request_timeout_secs: env_parse("PDPJ_REQUEST_TIMEOUT", d.request_timeout_secs),
            blacklist: env_string("BLACKLIST")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(d.blacklist),
            output_dir: env_string("OUTPUT_DIR").map(PathBuf::from).unwrap_or(d.output_dir),
            cache_dir: env_string("CACHE_DIR").map(PathBuf::from).unwrap_or(d.cache_dir),
        }
    }

    /// Worker count: one per token per `workers_per_token`, capped at 8.
    pub fn num_workers(&self) -> usize {
        if self.tokens.is_empty() {
            1
        } else {
            (self.tokens.len() * self.workers_per_token).clamp(1, 8)
        }
    }

    /// Validate the configuration. Empty list means OK.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.tokens.is_empty() {
            errors.push("no PDPJ token configured".to_string());
        }
        if self.base_url.trim().is_empty() {
            errors.push("base_url is not set".to_string());
        }
        if self.max_retries == 0 {
            errors.push("max_retries must be at least 1".to_string());
        }
        if self.page_size == 0 {
            errors.push("page_size must be at least 1".to_string());
        }
        errors
    }
}
