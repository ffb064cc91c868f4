//! Parameter-schema validation seam.

use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::fmt::{Display, Formatter};

/// A parameter set rejected by a capability's declared schema.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "validation error: {}", self.message)
    }
}

impl Error for ValidationError {}

/// Validates measurement parameters against a capability's declared
/// parameter schema. The engine treats the schema language as a black box;
/// any validation library satisfying this predicate is acceptable.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, instance: &Value, schema: &Value) -> Result<(), ValidationError>;
}
