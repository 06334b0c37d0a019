//! Storage types shared by cursors and the streaming pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::StorageError;

/// A FHIR resource as stored in the storage backend.
///
/// This is the raw record a [`ResourceCursor`](crate::ResourceCursor) yields.
/// `resource` may still carry backend-internal `_`-prefixed fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResource {
    /// The resource ID.
    pub id: String,
    /// The version ID of this specific version.
    pub version_id: String,
    /// The FHIR resource type (e.g., "Patient", "Observation").
    pub resource_type: String,
    /// The full resource content as JSON.
    pub resource: Value,
    /// When this version was last updated.
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl StoredResource {
    /// Creates a new `StoredResource`.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        version_id: impl Into<String>,
        resource_type: impl Into<String>,
        resource: Value,
    ) -> Self {
        Self {
            id: id.into(),
            version_id: version_id.into(),
            resource_type: resource_type.into(),
            resource,
            last_updated: OffsetDateTime::now_utc(),
        }
    }

    /// Builds a stored record from raw resource JSON, reading `resourceType`,
    /// `id` and `meta.versionId` from the body.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidResource` if the body is not an object or
    /// lacks a string `resourceType` or `id`.
    pub fn from_json(resource: Value) -> Result<Self, StorageError> {
        let resource_type = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::invalid_resource("missing resourceType"))?
            .to_string();
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::invalid_resource("missing id"))?
            .to_string();
        let version_id = resource
            .pointer("/meta/versionId")
            .and_then(Value::as_str)
            .unwrap_or("1")
            .to_string();
        Ok(Self::new(id, version_id, resource_type, resource))
    }

    /// Returns the `ResourceType/id` reference for this record.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

/// A compartment restriction, e.g. `Patient/123` for `$everything`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compartment {
    pub resource_type: String,
    pub id: String,
}

impl Compartment {
    #[must_use]
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Returns the literal reference string records point at.
    #[must_use]
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

/// A query a [`CursorProvider`](crate::CursorProvider) turns into a cursor.
///
/// Query planning beyond these few parameters belongs to the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamQuery {
    /// Resource type to search. Ignored when a compartment is set.
    pub resource_type: String,
    /// Restrict to these ids (`id=a,b,c`).
    pub ids: Vec<String>,
    /// Restrict to records in a compartment.
    pub compartment: Option<Compartment>,
    /// Page limit (`_count`).
    pub count: Option<usize>,
    /// Keyset paging: only ids greater than this (`id:above`).
    pub after_id: Option<String>,
    /// The raw query parameters, in request order.
    pub params: Vec<(String, String)>,
}

impl StreamQuery {
    /// Creates a query over every record of a type.
    #[must_use]
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Self::default()
        }
    }

    /// Parses the parameters a storage backend understands.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidQuery` if `_count` is not a non-negative integer.
    /// Unknown parameters are kept in `params` and otherwise ignored.
    pub fn from_params(
        resource_type: impl Into<String>,
        params: &[(String, String)],
    ) -> Result<Self, StorageError> {
        let mut query = Self::new(resource_type);
        for (key, value) in params {
            match key.as_str() {
                "id" | "_id" => query.ids.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from),
                ),
                "id:above" => query.after_id = Some(value.trim().to_string()),
                "_count" => {
                    let count = value.parse::<usize>().map_err(|_| {
                        StorageError::invalid_query(format!("_count must be a number: {value}"))
                    })?;
                    query.count = Some(count);
                }
                _ => {}
            }
        }
        query.params = params.to_vec();
        Ok(query)
    }

    /// Restricts the query to a compartment.
    #[must_use]
    pub fn with_compartment(mut self, compartment: Compartment) -> Self {
        self.compartment = Some(compartment);
        self
    }

    /// Sets the page limit.
    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_from_json_reads_identity() {
        let stored = StoredResource::from_json(json!({
            "resourceType": "Patient",
            "id": "p1",
            "meta": {"versionId": "3"}
        }))
        .unwrap();
        assert_eq!(stored.reference(), "Patient/p1");
        assert_eq!(stored.version_id, "3");
    }

    #[test]
    fn test_from_json_rejects_missing_id() {
        let err = StoredResource::from_json(json!({"resourceType": "Patient"})).unwrap_err();
        assert!(matches!(err, StorageError::InvalidResource { .. }));
    }

    #[test]
    fn test_query_from_params() {
        let query = StreamQuery::from_params(
            "Observation",
            &params(&[("id", "a, b"), ("_count", "10"), ("code", "x")]),
        )
        .unwrap();
        assert_eq!(query.ids, vec!["a", "b"]);
        assert_eq!(query.count, Some(10));
        assert_eq!(query.params.len(), 3);
    }

    #[test]
    fn test_query_rejects_bad_count() {
        let err = StreamQuery::from_params("Patient", &params(&[("_count", "many")])).unwrap_err();
        assert!(matches!(err, StorageError::InvalidQuery { .. }));
    }
}
