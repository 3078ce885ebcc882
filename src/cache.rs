//! Disk-backed shared caches
//!
//! One store holds every cross-run memo the collection engine keeps: record
//! ids known to 404, CNPJ branches known not to exist, individuals whose
//! searches came back oversized, completed detail fetches, and the
//! accumulated index-rate memo filled by an external lookup.
//!
//! The in-memory representation is authoritative during a run; `save_all`
//! flushes everything to JSON files under the cache directory. All access
//! goes through one mutex per store — callers never hold it across await
//! points.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

const NOT_FOUND_FILE: &str = "not_found.json";
const MISSING_BRANCHES_FILE: &str = "missing_branches.json";
const OVERSIZED_FILE: &str = "oversized.json";
const COMPLETED_FILE: &str = "completed.json";
const RATE_MEMO_FILE: &str = "rate_memo.json";

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct HitCounters {
    not_found: u64,
    missing_branches: u64,
    completed: u64,
    rate_memo: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    not_found: HashSet<String>,
    missing_branches: HashSet<String>,
    oversized: HashMap<String, u64>,
    completed: HashMap<String, String>,
    rate_memo: HashMap<String, f64>,
    hits: HitCounters,
}

/// Cache sizes and hit counts for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub not_found: usize,
    pub missing_branches: usize,
    pub oversized: usize,
    pub completed: usize,
    pub rate_memo: usize,
    pub hits_not_found: u64,
    pub hits_missing_branches: u64,
    pub hits_completed: u64,
    pub hits_rate_memo: u64,
}

/// Thread-safe disk-backed cache store shared by the whole run.
pub struct CacheStore {
    dir: PathBuf,
    inner: Mutex<CacheInner>,
}

fn load_set(path: &Path) -> HashSet<String> {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str::<Vec<String>>(&raw)
            .map(HashSet::from_iter)
            .unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "ignoring unreadable cache file");
                HashSet::new()
            }),
        Err(_) => HashSet::new(),
    }
}

fn load_map<V: serde::de::DeserializeOwned>(path: &Path) -> HashMap<String, V> {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "ignoring unreadable cache file");
            HashMap::new()
        }),
        Err(_) => HashMap::new(),
    }
}

fn write_json(path: &Path, value: &Value) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(value).unwrap_or_default())
}

impl CacheStore {
    /// Open the store, loading whatever is already on disk (best effort).
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let inner = CacheInner {
            not_found: load_set(&dir.join(NOT_FOUND_FILE)),
            missing_branches: load_set(&dir.join(MISSING_BRANCHES_FILE)),
            oversized: load_map(&dir.join(OVERSIZED_FILE)),
            completed: load_map(&dir.join(COMPLETED_FILE)),
            rate_memo: load_map(&dir.join(RATE_MEMO_FILE)),
            hits: HitCounters::default(),
        };
        debug!(
            not_found = inner.not_found.len(),
            missing_branches = inner.missing_branches.len(),
            oversized = inner.oversized.len(),
            completed = inner.completed.len(),
            rate_memo = inner.rate_memo.len(),
            "cache store opened"
        );
        Self {
            dir,
            inner: Mutex::new(inner),
        }
    }

    // ── Record ids known to 404 ─────────────────────────────────────────

    pub fn is_known_missing(&self, record_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let hit = inner.not_found.contains(record_id);
        if hit {
            inner.hits.not_found += 1;
        }
        hit
    }

    /// A record marked missing leaves the completed map: the latest
    /// observation wins and an id lives in at most one of the two.
    pub fn add_missing(&self, record_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.completed.remove(record_id);
        inner.not_found.insert(record_id.to_string());
    }

    // ── CNPJ branches that do not exist ─────────────────────────────────

    pub fn is_branch_missing(&self, branch_document: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let hit = inner.missing_branches.contains(branch_document);
        if hit {
            inner.hits.missing_branches += 1;
        }
        hit
    }

    pub fn add_missing_branch(&self, branch_document: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.missing_branches.insert(branch_document.to_string());
    }

    // ── Oversized individuals ───────────────────────────────────────────

    pub fn is_oversized(&self, document: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.oversized.contains_key(document)
    }

    pub fn add_oversized(&self, document: &str, reported_total: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.oversized.insert(document.to_string(), reported_total);
    }

    // ── Completed detail fetches ────────────────────────────────────────

    pub fn is_completed(&self, record_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let hit = inner.completed.contains_key(record_id);
        if hit {
            inner.hits.completed += 1;
        }
        hit
    }

    pub fn status_of(&self, record_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner.completed.get(record_id).cloned()
    }

    /// A completed record leaves the 404 set (see [`Self::add_missing`]).
    pub fn add_completed(&self, record_id: &str, status: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.not_found.remove(record_id);
        inner
            .completed
            .insert(record_id.to_string(), status.to_string());
    }

    // ── Index-rate memo ─────────────────────────────────────────────────

    pub fn rate_memo(&self, period_key: &str) -> Option<f64> {
        let mut inner = self.inner.lock().unwrap();
        let value = inner.rate_memo.get(period_key).copied();
        if value.is_some() {
            inner.hits.rate_memo += 1;
        }
        value
    }

    pub fn set_rate_memo(&self, period_key: &str, rate: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.rate_memo.insert(period_key.to_string(), rate);
    }

    // ── Persistence ─────────────────────────────────────────────────────

    /// Flush every cache to disk. Sets serialize as sorted arrays so the
    /// files diff cleanly between runs.
    pub fn save_all(&self) -> io::Result<()> {
        let (not_found, missing_branches, oversized, completed, rate_memo) = {
            let inner = self.inner.lock().unwrap();
            let mut not_found: Vec<_> = inner.not_found.iter().cloned().collect();
            not_found.sort();
            let mut missing: Vec<_> = inner.missing_branches.iter().cloned().collect();
            missing.sort();
            (
                serde_json::to_value(not_found).unwrap_or_default(),
                serde_json::to_value(missing).unwrap_or_default(),
                serde_json::to_value(&inner.oversized).unwrap_or_default(),
                serde_json::to_value(&inner.completed).unwrap_or_default(),
                serde_json::to_value(&inner.rate_memo).unwrap_or_default(),
            )
        };
        write_json(&self.dir.join(NOT_FOUND_FILE), &not_found)?;
        write_json(&self.dir.join(MISSING_BRANCHES_FILE), &missing_branches)?;
        write_json(&self.dir.join(OVERSIZED_FILE), &oversized)?;
        write_json(&self.dir.join(COMPLETED_FILE), &completed)?;
        write_json(&self.dir.join(RATE_MEMO_FILE), &rate_memo)?;
        debug!(dir = %self.dir.display(), "caches saved");
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            not_found: inner.not_found.len(),
            missing_branches: inner.missing_branches.len(),
            oversized: inner.oversized.len(),
            completed: inner.completed.len(),
            rate_memo: inner.rate_memo.len(),
            hits_not_found: inner.hits.not_found,
            hits_missing_branches: inner.hits.missing_branches,
            hits_completed: inner.hits.completed,
            hits_rate_memo: inner.hits.rate_memo,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path());
        store.add_missing("0001");
        store.add_missing_branch("12345678000276");
        store.add_oversized("12345678000195", 9999);
        store.add_completed("0002", "ok");
        store.set_rate_memo("01/01/2024_31/12/2024", 11.25);
        store.save_all().unwrap();

        let reopened = CacheStore::open(dir.path());
        assert!(reopened.is_known_missing("0001"));
        assert!(reopened.is_branch_missing("12345678000276"));
        assert!(reopened.is_oversized("12345678000195"));
        assert!(reopened.is_completed("0002"));
        assert_eq!(reopened.status_of("0002").as_deref(), Some("ok"));
        assert_eq!(reopened.rate_memo("01/01/2024_31/12/2024"), Some(11.25));
        assert_eq!(reopened.rate_memo("other"), None);
    }

    #[test]
    fn test_latest_observation_wins_between_missing_and_completed() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path());

        store.add_missing("42");
        assert!(store.is_known_missing("42"));
        assert!(!store.is_completed("42"));

        // the record turned up on a later run
        store.add_completed("42", "ok");
        assert!(!store.is_known_missing("42"));
        assert!(store.is_completed("42"));

        store.add_missing("42");
        assert!(store.is_known_missing("42"));
        assert!(!store.is_completed("42"));
    }

    #[test]
    fn test_stats_count_sizes_and_hits() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path());
        store.add_missing("a");
        store.add_missing("b");
        assert!(store.is_known_missing("a"));
        assert!(!store.is_known_missing("zzz"));

        let stats = store.stats();
        assert_eq!(stats.not_found, 2);
        assert_eq!(stats.hits_not_found, 1);
        assert_eq!(stats.completed, 0);
    }

    #[test]
    fn test_corrupt_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(NOT_FOUND_FILE), "{broken").unwrap();
        let store = CacheStore::open(dir.path());
        assert!(!store.is_known_missing("anything"));
    }
}
