//! Cursor-based pagination over the PDPJ search endpoint
//!
//! The PDPJ API paginates with a `searchAfter` cursor: page 1 carries none,
//! and each response yields the cursor for the next request — either as an
//! explicit field or derived from the sort key of the last content item.
//!
//! Fetching goes through the [`PageFetcher`] seam so the protocol logic is
//! exercised in tests with scripted fakes instead of live HTTP.

pub mod page_store;

pub use page_store::PageStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ClientResult;

/// One record surfaced by a search page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// The remote record's unique process number (`numeroProcesso`)
    pub identifier: String,
    /// Raw content item as returned by the API
    pub record: Value,
    /// 1-based page the record arrived on
    pub page_index: u32,
}

impl SearchResult {
    /// Build from a content item; items without a process number are skipped.
    pub fn from_item(item: &Value, page_index: u32) -> Option<Self> {
        let identifier = item.get("numeroProcesso")?.as_str()?.trim();
        if identifier.is_empty() {
            return None;
        }
        Some(Self {
            identifier: identifier.to_string(),
            record: item.clone(),
            page_index,
        })
    }
}

/// Fixed query parameters of one search strategy.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub params: Vec<(String, String)>,
}

impl SearchQuery {
    pub fn new(params: Vec<(String, String)>) -> Self {
        Self { params }
    }
}

/// Bounds applied to one paginated search.
#[derive(Debug, Clone, Copy)]
pub struct SearchLimits {
    pub max_pages: u32,
    pub max_records: usize,
    /// First-page totals above this flag the search as oversized
    pub oversize_alarm: u64,
}

/// Result of a full pagination run.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub records: Vec<SearchResult>,
    /// Total the API reported on the first page (or the record count if absent)
    pub total_reported: u64,
    /// Pages actually consumed (stored or fetched)
    pub pages: u32,
    pub oversized: bool,
}

/// Seam between the pagination protocol and the HTTP layer.
///
/// `Ok(None)` means the server answered with a non-retryable, non-success
/// status for this page: pagination stops quietly with whatever was
/// collected so far. Transport failures and exhausted retries are `Err`.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, query: &SearchQuery, cursor: Option<&str>)
        -> ClientResult<Option<Value>>;
}

/// Drive cursor pagination for one query until a termination condition hits:
/// empty content page, absent cursor, `max_pages`, or `max_records`
/// (the record list is truncated to exactly `max_records`).
pub async fn run(
    fetcher: &dyn PageFetcher,
    query: &SearchQuery,
    limits: &SearchLimits,
    store: Option<&PageStore>,
) -> ClientResult<SearchOutcome> {
    let mut records: Vec<SearchResult> = Vec::new();
    let mut total_reported: Option<u64> = None;
    let mut oversized = false;
    let mut cursor: Option<String> = None;
    let mut pages = 0u32;
    let mut page_index = 1u32;

    while page_index <= limits.max_pages {
        let page = match store.and_then(|s| s.load(page_index)) {
            Some(stored) => stored,
            None => match fetcher.fetch_page(query, cursor.as_deref()).await? {
                Some(fetched) => {
                    if let Some(store) = store {
                        store.save(page_index, &fetched);
                    }
                    fetched
                }
                None => break,
            },
        };

        if total_reported.is_none() {
            let total = page
                .get("totalRegistros")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            total_reported = Some(total);
            oversized = total > limits.oversize_alarm;
        }

        let content = page
            .get("content")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if content.is_empty() {
            break;
        }
        pages += 1;

        for item in &content {
            if let Some(result) = SearchResult::from_item(item, page_index) {
                records.push(result);
            }
        }
        if records.len() >= limits.max_records {
            records.truncate(limits.max_records);
            break;
        }

        cursor = extract_cursor(&page);
        if cursor.is_none() {
            break;
        }
        page_index += 1;
    }

    debug!(
        pages,
        records = records.len(),
        oversized,
        "pagination finished"
    );
    Ok(SearchOutcome {
        total_reported: total_reported.unwrap_or(records.len() as u64),
        records,
        pages,
        oversized,
    })
}

fn join_cursor(values: &[Value]) -> String {
    values
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Cursor for the next page: the response's `searchAfter`, falling back to
/// the `sort` key of the last content item.
pub fn extract_cursor(page: &Value) -> Option<String> {
    match page.get("searchAfter") {
        Some(Value::Array(values)) if !values.is_empty() => return Some(join_cursor(values)),
        Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
        _ => {}
    }
    let last = page.get("content")?.as_array()?.last()?;
    match last.get("sort") {
        Some(Value::Array(values)) if !values.is_empty() => Some(join_cursor(values)),
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}
