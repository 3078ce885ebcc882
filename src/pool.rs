//! Candidate pool
//!
//! Merges the results of the per-individual search strategies into one
//! structure keyed by record identifier. Origins accumulate as the same
//! record is rediscovered by different strategies; the payload from the
//! first sighting stays canonical so later strategies never partially
//! overwrite it.

use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::search::SearchResult;

/// One record with every origin that surfaced it.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateEntry {
    pub result: SearchResult,
    pub origins: BTreeSet<String>,
}

/// Insertion-ordered pool of candidate records for one individual.
#[derive(Debug, Default)]
pub struct CandidatePool {
    entries: HashMap<String, CandidateEntry>,
    order: Vec<String>,
}

impl CandidatePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert-or-update every result under the given origin tag.
    pub fn merge<I>(&mut self, results: I, origin: &str)
    where
        I: IntoIterator<Item = SearchResult>,
    {
        let Self { entries, order } = self;
        for result in results {
            let id = result.identifier.clone();
            let entry = entries.entry(id.clone()).or_insert_with(|| {
                order.push(id);
                CandidateEntry {
                    result,
                    origins: BTreeSet::new(),
                }
            });
            entry.origins.insert(origin.to_string());
        }
    }

    pub fn get(&self, identifier: &str) -> Option<&CandidateEntry> {
        self.entries.get(identifier)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Entries in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &CandidateEntry)> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| (id.as_str(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(id: &str, tag: &str) -> SearchResult {
        SearchResult {
            identifier: id.to_string(),
            record: json!({"numeroProcesso": id, "from": tag}),
            page_index: 1,
        }
    }

    #[test]
    fn test_first_payload_wins_origins_accumulate() {
        let mut pool = CandidatePool::new();
        pool.merge(vec![result("1", "doc")], "by-document");
        pool.merge(vec![result("1", "name")], "by-name");

        let entry = pool.get("1").unwrap();
        assert_eq!(entry.result.record["from"], "doc");
        assert_eq!(
            entry.origins.iter().cloned().collect::<Vec<_>>(),
            vec!["by-document", "by-name"]
        );
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_payload_precedence_is_order_dependent() {
        let mut reversed = CandidatePool::new();
        reversed.merge(vec![result("1", "name")], "by-name");
        reversed.merge(vec![result("1", "doc")], "by-document");

        let entry = reversed.get("1").unwrap();
        // same origins as the forward order, different canonical payload
        assert_eq!(entry.result.record["from"], "name");
        assert_eq!(
            entry.origins.iter().cloned().collect::<Vec<_>>(),
            vec!["by-document", "by-name"]
        );
    }

    #[test]
    fn test_iteration_preserves_first_seen_order() {
        let mut pool = CandidatePool::new();
        pool.merge(vec![result("b", "x"), result("a", "x")], "by-document");
        pool.merge(vec![result("c", "y"), result("a", "y")], "by-name");

        let ids: Vec<&str> = pool.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }
}
