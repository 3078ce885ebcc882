//! Durable page snapshots
//!
//! Each fetched search page is written as `page_{n}.json` under a per-query
//! directory. On a re-run, a stored page is read back instead of re-issuing
//! the request, which makes pagination idempotent and resumable.

use std::fs;
use std::path::PathBuf;

use serde_json::Value;
use tracing::{debug, warn};

/// Disk store for raw search pages of one query.
#[derive(Debug, Clone)]
pub struct PageStore {
    dir: PathBuf,
}

impl PageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store scoped to a sub-query (e.g. one name field of a name search).
    pub fn child(&self, name: &str) -> PageStore {
        PageStore {
            dir: self.dir.join(name),
        }
    }

    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }

    fn path(&self, page_index: u32) -> PathBuf {
        self.dir.join(format!("page_{page_index}.json"))
    }

    /// Read a stored page back. Missing or unparseable files yield `None`
    /// (the page will simply be fetched again).
    pub fn load(&self, page_index: u32) -> Option<Value> {
        let path = self.path(page_index);
        let raw = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!(page = page_index, path = %path.display(), "loaded stored page");
                Some(value)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "discarding unreadable stored page");
                None
            }
        }
    }

    /// Persist a page. Failures are logged but never abort the search.
    pub fn save(&self, page_index: u32, page: &Value) {
        let path = self.path(page_index);
        let result = fs::create_dir_all(&self.dir)
            .and_then(|_| fs::write(&path, serde_json::to_string_pretty(page).unwrap_or_default()));
        if let Err(err) = result {
            warn!(path = %path.display(), error = %err, "failed to persist page");
        }
    }
}
