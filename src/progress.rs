//! Progress events
//!
//! Typed events emitted during a run for UI and logging collaborators.
//! Delivery is a plain injected callback; the engine makes no ordering
//! promise beyond emission order per task.

use std::sync::Arc;

use serde::Serialize;

use crate::collector::RunReport;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ProgressEvent {
    CollectionStart {
        total: usize,
    },
    IndividualStart {
        id: String,
        name: String,
        index: usize,
    },
    IndividualDone {
        id: String,
        records: usize,
        index: usize,
    },
    DetailOk {
        record_id: String,
    },
    CollectionEnd {
        report: RunReport,
    },
}

/// Callback every event is handed to.
pub type ProgressSink = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Sink that drops every event.
pub fn noop_sink() -> ProgressSink {
    Arc::new(|_| {})
}
