//! Priority classification and selection caps
//!
//! Candidate records are classified into priority buckets by an ordered
//! registry of named rules — first match wins — and the classified lists
//! are then truncated per category and per subject. Rules are plain
//! functions over the raw record, so a deployment can register its own
//! without touching the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::documents::normalize_document;
use crate::pool::CandidatePool;

/// Mutually exclusive priority category of a candidate record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PriorityBucket {
    /// Record's classification code matches the configured target class
    PrimaryClass,
    /// Subject appears on the favorable side of the record's parties
    FavorableRole,
    Other,
}

impl PriorityBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PrimaryClass => "primary-class",
            Self::FavorableRole => "favorable-role",
            Self::Other => "other",
        }
    }
}

/// Inputs the bucket rules evaluate against.
#[derive(Debug, Clone)]
pub struct ClassifyContext {
    /// Normalized CPF/CNPJ of the individual under collection
    pub subject_document: String,
    /// Class code that lands a record in the primary bucket
    pub primary_class_code: i64,
}

/// One named classification rule.
pub struct BucketRule {
    pub name: &'static str,
    pub bucket: PriorityBucket,
    pub applies: fn(&Value, &ClassifyContext) -> bool,
}

/// Any proceeding class code equals the configured target class.
fn matches_primary_class(record: &Value, ctx: &ClassifyContext) -> bool {
    let proceedings = record
        .get("tramitacoes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    proceedings.iter().any(|proceeding| {
        proceeding
            .get("classe")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .any(|class| class.get("codigo").and_then(Value::as_i64) == Some(ctx.primary_class_code))
    })
}

/// The subject document appears among the principal documents of a party
/// on the `ATIVO` pole.
fn subject_on_favorable_pole(record: &Value, ctx: &ClassifyContext) -> bool {
    if ctx.subject_document.is_empty() {
        return false;
    }
    let proceedings = record
        .get("tramitacoes")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for proceeding in proceedings {
        let parties = proceeding
            .get("partes")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for party in parties {
            let pole = party.get("polo").and_then(Value::as_str).unwrap_or_default();
            if !pole.eq_ignore_ascii_case("ATIVO") {
                continue;
            }
            let docs = party
                .get("documentosPrincipais")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for doc in docs {
                let number = doc.get("numero").and_then(Value::as_str).unwrap_or_default();
                if normalize_document(number) == ctx.subject_document {
                    return true;
                }
            }
        }
    }
    false
}

/// The default registry, evaluated in order. The final rule always matches.
pub fn default_rules() -> Vec<BucketRule> {
    vec![
        BucketRule {
            name: "primary-class",
            bucket: PriorityBucket::PrimaryClass,
            applies: matches_primary_class,
        },
        BucketRule {
            name: "favorable-role",
            bucket: PriorityBucket::FavorableRole,
            applies: subject_on_favorable_pole,
        },
        BucketRule {
            name: "other",
            bucket: PriorityBucket::Other,
            applies: |_, _| true,
        },
    ]
}

/// Classification result: record ids per bucket, first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classified {
    pub primary: Vec<String>,
    pub favorable: Vec<String>,
    pub other: Vec<String>,
}

impl Classified {
    pub fn bucket_of(&self, record_id: &str) -> PriorityBucket {
        if self.primary.iter().any(|id| id == record_id) {
            PriorityBucket::PrimaryClass
        } else if self.favorable.iter().any(|id| id == record_id) {
            PriorityBucket::FavorableRole
        } else {
            PriorityBucket::Other
        }
    }
}

/// Classify every pool entry with the first matching rule.
pub fn classify(pool: &CandidatePool, rules: &[BucketRule], ctx: &ClassifyContext) -> Classified {
    let mut classified = Classified::default();
    for (id, entry) in pool.iter() {
        let bucket = rules
            .iter()
            .find(|rule| (rule.applies)(&entry.result.record, ctx))
            .map(|rule| rule.bucket)
            .unwrap_or(PriorityBucket::Other);
        let list = match bucket {
            PriorityBucket::PrimaryClass => &mut classified.primary,
            PriorityBucket::FavorableRole => &mut classified.favorable,
            PriorityBucket::Other => &mut classified.other,
        };
        list.push(id.to_string());
    }
    classified
}

/// Truncate each bucket to `per_category_cap`, concatenate in bucket order,
/// then truncate the whole selection to `per_subject_cap`. A cap of zero
/// means unlimited. Deterministic and order-preserving.
pub fn apply_limits(
    classified: &Classified,
    per_category_cap: usize,
    per_subject_cap: usize,
) -> Vec<String> {
    let cap = |list: &[String]| -> Vec<String> {
        if per_category_cap > 0 {
            list.iter().take(per_category_cap).cloned().collect()
        } else {
            list.to_vec()
        }
    };

    let mut selection = cap(&classified.primary);
    selection.extend(cap(&classified.favorable));
    selection.extend(cap(&classified.other));

    if per_subject_cap > 0 {
        selection.truncate(per_subject_cap);
    }
    selection
}
