//! Deterministic job-id derivation (spec.md invariant 1):
//! `job_id = SHA-256(job_type || canonical_json(parameters))`.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Render a `serde_json::Value` with recursively sorted object keys and no
/// insignificant whitespace. `serde_json`'s `Value` already normalises
/// number formatting, so this is the entirety of the canonicalisation rule
/// in spec.md section 4.4 step 3.
pub fn canonical_json(value: &Value) -> String {
    let sorted = sort_keys(value);
    serde_json::to_string(&sorted).expect("serde_json::Value always serialises")
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), sort_keys(v)))
                .collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

/// `job_id = SHA-256(job_type ‖ canonical_json(parameters))`, lowercase hex.
pub fn derive_job_id(job_type: &str, parameters: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_type.as_bytes());
    hasher.update(canonical_json(parameters).as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A `job_id` is always 64 lowercase hex characters. Anything else reaching
/// a boundary (queue payload, path parameter) is a contract violation.
pub fn is_valid_job_id(job_id: &str) -> bool {
    job_id.len() == 64 && job_id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
