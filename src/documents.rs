//! CPF/CNPJ document handling
//!
//! Normalization, check-digit validation, CNPJ branch generation, and
//! extraction of party documents from raw process records.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a Brazilian taxpayer document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentKind {
    Cpf,
    Cnpj,
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpf => write!(f, "CPF"),
            Self::Cnpj => write!(f, "CNPJ"),
        }
    }
}

/// Normalize a raw document string to 11 (CPF) or 14 (CNPJ) digits.
///
/// Strips every non-digit, zero-pads short values, and keeps the last 14
/// digits of overlong values.
pub fn normalize_document(raw: &str) -> String {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return String::new();
    }
    if digits.len() <= 11 {
        return format!("{:0>11}", digits);
    }
    let digits = if digits.len() > 14 {
        digits[digits.len() - 14..].to_string()
    } else {
        digits
    };
    format!("{:0>14}", digits)
}

fn digit_values(s: &str) -> Option<Vec<u32>> {
    s.chars().map(|c| c.to_digit(10)).collect()
}

fn all_same(digits: &[u32]) -> bool {
    digits.windows(2).all(|w| w[0] == w[1])
}

fn check_digit(digits: &[u32], weights: &[u32]) -> u32 {
    let sum: u32 = digits.iter().zip(weights).map(|(d, w)| d * w).sum();
    let r = sum % 11;
    if r < 2 {
        0
    } else {
        11 - r
    }
}

/// Validate CPF check digits (expects any formatting; digits are extracted).
pub fn is_valid_cpf(raw: &str) -> bool {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let Some(d) = digit_values(&digits) else {
        return false;
    };
    if d.len() != 11 || all_same(&d) {
        return false;
    }
    let w1: Vec<u32> = (2..=10).rev().collect();
    let w2: Vec<u32> = (2..=11).rev().collect();
    d[9] == check_digit(&d[..9], &w1) && d[10] == check_digit(&d[..10], &w2)
}

const CNPJ_WEIGHTS: [u32; 13] = [6, 5, 4, 3, 2, 9, 8, 7, 6, 5, 4, 3, 2];

/// Validate CNPJ check digits (expects any formatting; digits are extracted).
pub fn is_valid_cnpj(raw: &str) -> bool {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let Some(d) = digit_values(&digits) else {
        return false;
    };
    if d.len() != 14 || all_same(&d) {
        return false;
    }
    d[12] == check_digit(&d[..12], &CNPJ_WEIGHTS[1..]) && d[13] == check_digit(&d[..13], &CNPJ_WEIGHTS)
}

/// Identify a document as CPF or CNPJ after normalization.
///
/// Returns `None` when the check digits do not verify.
pub fn document_kind(raw: &str) -> Option<DocumentKind> {
    let d = normalize_document(raw);
    match d.len() {
        14 if is_valid_cnpj(&d) => Some(DocumentKind::Cnpj),
        11 if is_valid_cpf(&d) => Some(DocumentKind::Cpf),
        _ => None,
    }
}

/// Root (first 8 digits) of a normalized CNPJ, empty for anything else.
pub fn cnpj_root(document: &str) -> String {
    if document.len() == 14 {
        document[..8].to_string()
    } else {
        String::new()
    }
}

/// Build a full 14-digit CNPJ from an 8-digit root and a 4-digit branch,
/// recomputing both check digits. Returns `None` on malformed input.
pub fn branch_document(root: &str, branch: &str) -> Option<String> {
    if root.len() != 8 || branch.len() != 4 {
        return None;
    }
    let base = format!("{root}{branch}");
    let d = digit_values(&base)?;
    let d1 = check_digit(&d, &CNPJ_WEIGHTS[1..]);
    let mut with_d1 = d.clone();
    with_d1.push(d1);
    let d2 = check_digit(&with_d1, &CNPJ_WEIGHTS);
    Some(format!("{base}{d1}{d2}"))
}

/// Extract the valid party documents of a raw process record.
///
/// Walks `tramitacoes[].partes[].documentosPrincipais[].numero`, keeps only
/// numbers that verify as CPF or CNPJ, and maps each normalized document to
/// the party names it was seen with. Feeds the homonym resolver.
pub fn extract_party_documents(record: &Value) -> BTreeMap<String, BTreeSet<String>> {
    let mut found: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
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
            let name = party
                .get("nome")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim();
            let docs = party
                .get("documentosPrincipais")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for doc in docs {
                let Some(number) = doc.get("numero").and_then(Value::as_str) else {
                    continue;
                };
                let normalized = normalize_document(number);
                let valid = match normalized.len() {
                    11 => is_valid_cpf(&normalized),
                    14 => is_valid_cnpj(&normalized),
                    _ => false,
                };
                if !valid {
                    continue;
                }
                let names = found.entry(normalized).or_default();
                if !name.is_empty() {
                    names.insert(name.to_string());
                }
            }
        }
    }
    found
}
