//! Records that passed access control, ready for encoding.

use octofhir_storage::StoredResource;
use serde_json::{Map, Value};

use crate::error::SerializationError;

/// A filtered, possibly projected or enriched representation of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedResource {
    pub resource_type: String,
    pub id: String,
    pub body: Value,
}

impl PreparedResource {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>, body: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            body,
        }
    }

    pub fn from_stored(record: &StoredResource) -> Self {
        Self::new(&record.resource_type, &record.id, record.resource.clone())
    }

    /// Rebuilds a resource from its cached body. Type and id come from the
    /// body; a body without them fails later, at encoding.
    pub fn from_cached(body: Value) -> Self {
        let field = |name: &str| {
            body.get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let (resource_type, id) = (field("resourceType"), field("id"));
        Self::new(resource_type, id, body)
    }

    /// Serializes the wire representation.
    ///
    /// Top-level `_`-prefixed members are backend-internal and are removed.
    ///
    /// # Errors
    ///
    /// Returns a [`SerializationError`] if the body is not a JSON object or
    /// has no string `resourceType`.
    pub fn to_wire_json(&self) -> Result<String, SerializationError> {
        let Value::Object(members) = &self.body else {
            return Err(SerializationError::new(&self.id, "resource body is not an object"));
        };
        if !members.get("resourceType").is_some_and(Value::is_string) {
            return Err(SerializationError::new(&self.id, "resource has no resourceType"));
        }
        let cleaned: Map<String, Value> = members
            .iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        serde_json::to_string(&cleaned)
            .map_err(|e| SerializationError::new(&self.id, e.to_string()))
    }
}
