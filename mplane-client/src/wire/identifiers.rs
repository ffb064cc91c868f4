//! Content-hash identifier derivation for capabilities and measurements.
//!
//! These identifiers are correlation keys and topic-name fragments, so the
//! canonical rendering below is part of the wire contract: independently
//! computed requests and replies must agree byte-for-byte on the hash input.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Directory key of a capability, hex-encoded SHA-256.
pub type CapabilityId = String;

/// Correlation key binding a specification, its receipt, and its result
/// stream; hex-encoded SHA-256.
pub type MeasurementId = String;

/// Strips every space and newline, the shared canonicalization rule.
fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| *c != ' ' && *c != '\n').collect()
}

/// Renders one identity field in the canonical form: strings contribute
/// their raw contents, everything else compact JSON. `serde_json`'s default
/// map keeps object keys ordered, which pins the rendering of nested
/// structures regardless of insertion order.
fn canonical_fragment(value: &Value) -> String {
    let rendered = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    strip_whitespace(&rendered)
}

fn hash_fragments(fragments: &[String]) -> String {
    let mut hasher = Sha256::new();
    for fragment in fragments {
        hasher.update(fragment.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Derives the directory key of a capability. Must match what the remote
/// capability advertiser computed over the same two fields.
pub fn capability_id(endpoint: &str, capability_name: &str) -> CapabilityId {
    hash_fragments(&[
        strip_whitespace(endpoint),
        strip_whitespace(capability_name),
    ])
}

/// Derives the measurement identifier from a capability identity and the
/// caller-supplied parameters and schedule. Equal inputs always hash equal,
/// which is what lets an independently built interrupt request name the same
/// result topic as the original submission.
pub fn measurement_id(
    capability_id: &str,
    parameters: &Value,
    schedule: &str,
) -> MeasurementId {
    hash_fragments(&[
        capability_id.to_string(),
        canonical_fragment(parameters),
        strip_whitespace(schedule),
    ])
}
