//! Name-ambiguity ("homonym") resolution
//!
//! A name search can surface records belonging to several distinct
//! real-world documents. Each individual whose name search produced at
//! least one distinct document gets a [`HomonymCase`] tracking which
//! documents a human has confirmed as the right person.
//!
//! The three-way contract of [`HomonymCase::resolved_record_ids`] must be
//! preserved exactly: `None` means "use everything", an empty set means
//! "skip this individual for now", and only `Pending` produces the empty
//! set. Proceeding on `Pending` would merge unrelated people's records.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::documents::extract_party_documents;
use crate::error::{CollectError, CollectResult};
use crate::search::SearchResult;

/// Lifecycle of a homonym case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HomonymStatus {
    /// Single distinct document: nothing to disambiguate (terminal)
    Unique,
    /// Awaiting human input
    Pending,
    /// Human input applied; may be reset back to pending
    Resolved,
}

/// Evidence collected for one candidate document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateGroup {
    /// Party names this document was seen with
    pub names: BTreeSet<String>,
    /// Records attributable to this document, first-seen order
    pub record_ids: Vec<String>,
    /// Null until a human resolves the case
    pub selected: Option<bool>,
}

/// Disambiguation state for one individual's name search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HomonymCase {
    pub query_name: String,
    pub candidates: BTreeMap<String, CandidateGroup>,
    pub status: HomonymStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl HomonymCase {
    /// Build a case from the records a name search produced.
    ///
    /// Returns `None` when no valid party document was found — there is
    /// nothing to disambiguate and no case is recorded.
    pub fn from_search_results(query_name: &str, results: &[SearchResult]) -> Option<Self> {
        let mut candidates: BTreeMap<String, CandidateGroup> = BTreeMap::new();
        for result in results {
            for (document, names) in extract_party_documents(&result.record) {
                let group = candidates.entry(document).or_insert_with(|| CandidateGroup {
                    names: BTreeSet::new(),
                    record_ids: Vec::new(),
                    selected: None,
                });
                group.names.extend(names);
                if !group.record_ids.iter().any(|id| id == &result.identifier) {
                    group.record_ids.push(result.identifier.clone());
                }
            }
        }
        if candidates.is_empty() {
            return None;
        }
        let status = if candidates.len() == 1 {
            HomonymStatus::Unique
        } else {
            HomonymStatus::Pending
        };
        Some(Self {
            query_name: query_name.to_string(),
            candidates,
            status,
            resolved_at: None,
        })
    }

    /// Apply a human decision: one boolean per candidate document.
    ///
    /// Only a pending case can be resolved, and the selection map must
    /// cover the candidate documents exactly — a partial or stray map is a
    /// state conflict, never silently applied.
    pub fn resolve(&mut self, selections: &BTreeMap<String, bool>) -> CollectResult<()> {
        if self.status != HomonymStatus::Pending {
            return Err(CollectError::State(format!(
                "cannot resolve case for '{}': status is {:?}, expected pending",
                self.query_name, self.status
            )));
        }
        for document in selections.keys() {
            if !self.candidates.contains_key(document) {
                return Err(CollectError::State(format!(
                    "unknown candidate document '{document}' in resolution for '{}'",
                    self.query_name
                )));
            }
        }
        for document in self.candidates.keys() {
            if !selections.contains_key(document) {
                return Err(CollectError::State(format!(
                    "resolution for '{}' is missing candidate document '{document}'",
                    self.query_name
                )));
            }
        }
        for (document, selected) in selections {
            if let Some(group) = self.candidates.get_mut(document) {
                group.selected = Some(*selected);
            }
        }
        self.status = HomonymStatus::Resolved;
        self.resolved_at = Some(Utc::now());
        Ok(())
    }

    /// Reopen a resolved case: clears every selection and the resolution
    /// timestamp. Allowed any number of times.
    pub fn reset(&mut self) -> CollectResult<()> {
        if self.status != HomonymStatus::Resolved {
            return Err(CollectError::State(format!(
                "cannot reset case for '{}': status is {:?}, expected resolved",
                self.query_name, self.status
            )));
        }
        for group in self.candidates.values_mut() {
            group.selected = None;
        }
        self.status = HomonymStatus::Pending;
        self.resolved_at = None;
        Ok(())
    }

    /// Record ids the downstream consolidation may use.
    ///
    /// `None`: no filtering needed (unique). `Some(∅)` while pending: the
    /// consumer must skip this individual entirely. After resolution: the
    /// union of record ids of the confirmed documents.
    pub fn resolved_record_ids(&self) -> Option<BTreeSet<String>> {
        match self.status {
            HomonymStatus::Unique => None,
            HomonymStatus::Pending => Some(BTreeSet::new()),
            HomonymStatus::Resolved => Some(
                self.candidates
                    .values()
                    .filter(|group| group.selected == Some(true))
                    .flat_map(|group| group.record_ids.iter().cloned())
                    .collect(),
            ),
        }
    }
}

/// Per-run map of individual id → homonym case, persisted as one JSON file
/// so the human-facing collaborator can read and write resolutions between
/// runs.
#[derive(Debug)]
pub struct HomonymLedger {
    path: PathBuf,
    cases: BTreeMap<String, HomonymCase>,
}

impl HomonymLedger {
    /// Load the ledger from disk, starting empty if absent or unreadable.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let cases = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "ignoring unreadable homonym ledger");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self { path, cases }
    }

    /// Record a case for an individual unless one already exists — an
    /// existing case may carry a human's resolution and is never clobbered.
    pub fn record(&mut self, individual_id: &str, case: HomonymCase) {
        self.cases.entry(individual_id.to_string()).or_insert(case);
    }

    pub fn get(&self, individual_id: &str) -> Option<&HomonymCase> {
        self.cases.get(individual_id)
    }

    pub fn resolve(
        &mut self,
        individual_id: &str,
        selections: &BTreeMap<String, bool>,
    ) -> CollectResult<()> {
        let case = self.cases.get_mut(individual_id).ok_or_else(|| {
            CollectError::State(format!("no homonym case for individual '{individual_id}'"))
        })?;
        case.resolve(selections)
    }

    pub fn reset(&mut self, individual_id: &str) -> CollectResult<()> {
        let case = self.cases.get_mut(individual_id).ok_or_else(|| {
            CollectError::State(format!("no homonym case for individual '{individual_id}'"))
        })?;
        case.reset()
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &HomonymCase)> {
        self.cases.iter()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(
            &self.path,
            serde_json::to_string_pretty(&self.cases).unwrap_or_default(),
        )
    }
}
