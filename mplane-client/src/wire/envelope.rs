//! Message shapes and the boundary classification of inbound payloads.
//!
//! Everything a peer publishes is decoded once at the boundary into the
//! tagged [`InboundEnvelope`]; partially-typed maps never travel further into
//! the engine. Shapes that match nothing known come back as
//! [`InboundEnvelope::Unknown`] and are dropped by every caller.

use crate::wire::identifiers::{self, CapabilityId, MeasurementId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::warn;

const COMPONENT: &str = "envelope";

/// In-band marker closing a result stream.
pub const EOF_SENTINEL: &str = "EOF_results";

/// A remotely advertised, parameterizable measurement offering. Immutable
/// once received.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capability {
    /// Content hash of `(endpoint, capability_name)`, recomputable locally.
    #[serde(default)]
    pub id: CapabilityId,
    pub endpoint: String,
    pub capability_name: String,
    pub capability_kind: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub parameters_schema: Value,
}

impl Capability {
    /// Recomputes the directory key from the identity fields.
    pub fn derived_id(&self) -> CapabilityId {
        identifiers::capability_id(&self.endpoint, &self.capability_name)
    }
}

/// Distinguishes a submission from a cancellation sharing the same identity
/// fields. The single field that differs between a measurement's initial
/// request and its interrupt request.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecificationMode {
    Specification,
    Interrupt,
}

/// A concrete measurement request instantiated from a capability. Identity
/// fields stay immutable between the original submission and its interrupt.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Specification {
    pub endpoint: String,
    pub capability_name: String,
    pub capability_kind: String,
    #[serde(default)]
    pub label: String,
    pub parameters: Value,
    pub schedule: String,
    pub timestamp: String,
    pub mode: SpecificationMode,
}

impl Specification {
    /// The correlation key naming this specification's result topic,
    /// independent of [`Specification::mode`].
    pub fn measurement_id(&self) -> MeasurementId {
        let capability_id =
            identifiers::capability_id(&self.endpoint, &self.capability_name);
        identifiers::measurement_id(&capability_id, &self.parameters, &self.schedule)
    }

    /// The cancellation twin: identical in every identity-relevant field, so
    /// it yields the same measurement identifier.
    pub fn to_interrupt(&self) -> Specification {
        Specification {
            mode: SpecificationMode::Interrupt,
            ..self.clone()
        }
    }
}

/// Acknowledgment that a submitted specification or interrupt was accepted.
/// Transient; never persisted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Receipt {
    pub interrupt: bool,
}

/// One streamed batch of result values.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultBatch {
    pub values: Vec<Value>,
}

impl ResultBatch {
    pub fn is_end_of_stream(&self) -> bool {
        self.values.iter().any(|value| value == EOF_SENTINEL)
    }
}

/// Tagged view over the message shapes a peer may publish.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundEnvelope {
    CapabilitySet(HashMap<CapabilityId, Capability>),
    Receipt(Receipt),
    Result(ResultBatch),
    Unknown,
}

/// Classifies one decoded payload at the transport boundary.
pub fn classify(value: &Value) -> InboundEnvelope {
    let Some(object) = value.as_object() else {
        return InboundEnvelope::Unknown;
    };

    if object.contains_key("receipt") {
        return InboundEnvelope::Receipt(Receipt {
            interrupt: object.contains_key("interrupt"),
        });
    }

    if object.contains_key("result") {
        let Some(values) = object.get("resultValues").and_then(Value::as_array) else {
            return InboundEnvelope::Unknown;
        };
        return InboundEnvelope::Result(ResultBatch {
            values: values.clone(),
        });
    }

    match capability_set(object) {
        Some(capabilities) => InboundEnvelope::CapabilitySet(capabilities),
        None => InboundEnvelope::Unknown,
    }
}

/// A capability set is a mapping of identifier to descriptor. Malformed
/// entries are skipped; a non-empty mapping yielding nothing usable is not a
/// capability set.
fn capability_set(
    object: &serde_json::Map<String, Value>,
) -> Option<HashMap<CapabilityId, Capability>> {
    let mut capabilities = HashMap::new();
    for (key, descriptor) in object {
        match serde_json::from_value::<Capability>(descriptor.clone()) {
            Ok(capability) => {
                capabilities.insert(key.clone(), capability);
            }
            Err(error) => {
                warn!(
                    component = COMPONENT,
                    key = %key,
                    err = %error,
                    "skipping malformed capability entry"
                );
            }
        }
    }
    if capabilities.is_empty() && !object.is_empty() {
        return None;
    }
    Some(capabilities)
}
