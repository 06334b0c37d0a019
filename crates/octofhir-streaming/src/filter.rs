//! Per-record access control, projection and enrichment.

use std::sync::Arc;

use async_trait::async_trait;
use octofhir_storage::StoredResource;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::FilterError;
use crate::prepared::PreparedResource;
use crate::reporter::ErrorReporter;
use crate::stage::Stage;

/// Default system of `meta.security` access tags.
pub const DEFAULT_ACCESS_TAG_SYSTEM: &str = "https://www.icanbwell.com/access";

/// Who is asking, and with which scopes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestIdentity {
    pub user: Option<String>,
    pub scopes: Vec<String>,
}

impl RequestIdentity {
    pub fn new(user: Option<String>, scopes: Vec<String>) -> Self {
        Self { user, scopes }
    }
}

/// Boolean access contract supplied by the security layer.
pub trait AccessPredicate: Send + Sync {
    fn is_allowed(&self, record: &StoredResource, identity: &RequestIdentity) -> bool;
}

/// Grants everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPredicate for AllowAll {
    fn is_allowed(&self, _record: &StoredResource, _identity: &RequestIdentity) -> bool {
        true
    }
}

/// SMART-style scope check.
///
/// A record is readable when the identity holds
/// - a `user/` or `patient/` scope for its type (or `*`) with a read action, and
/// - an `access/<code>.<read|*>` scope whose code is `*` or appears in the
///   record's `meta.security` under the access tag system.
#[derive(Debug, Clone)]
pub struct ScopeAccessPredicate {
    access_tag_system: String,
}

impl Default for ScopeAccessPredicate {
    fn default() -> Self {
        Self::new(DEFAULT_ACCESS_TAG_SYSTEM)
    }
}

impl ScopeAccessPredicate {
    pub fn new(access_tag_system: impl Into<String>) -> Self {
        Self {
            access_tag_system: access_tag_system.into(),
        }
    }

    fn access_codes<'a>(&self, record: &'a StoredResource) -> impl Iterator<Item = &'a str> {
        let system = self.access_tag_system.clone();
        record
            .resource
            .pointer("/meta/security")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(move |tag| tag.get("system").and_then(Value::as_str) == Some(system.as_str()))
            .filter_map(|tag| tag.get("code").and_then(Value::as_str))
    }
}

/// Splits `context/Target.action` into its parts.
fn parse_scope(scope: &str) -> Option<(&str, &str, &str)> {
    let (context, rest) = scope.split_once('/')?;
    let (target, action) = rest.rsplit_once('.')?;
    Some((context, target, action))
}

/// `read`, `*`, or a SMART v2 permission string that includes `r`.
fn grants_read(action: &str) -> bool {
    action == "read"
        || action == "*"
        || (!action.is_empty() && action.chars().all(|c| "cruds".contains(c)) && action.contains('r'))
}

impl AccessPredicate for ScopeAccessPredicate {
    fn is_allowed(&self, record: &StoredResource, identity: &RequestIdentity) -> bool {
        let parsed: Vec<_> = identity.scopes.iter().filter_map(|s| parse_scope(s)).collect();

        let type_granted = parsed.iter().any(|(context, target, action)| {
            matches!(*context, "user" | "patient")
                && (*target == "*" || *target == record.resource_type)
                && grants_read(action)
        });
        if !type_granted {
            return false;
        }

        let access: Vec<&str> = parsed
            .iter()
            .filter(|(context, _, action)| *context == "access" && grants_read(action))
            .map(|(_, code, _)| *code)
            .collect();
        if access.contains(&"*") {
            return true;
        }
        self.access_codes(record).any(|code| access.contains(&code))
    }
}

/// Expands accepted records into related entries.
#[async_trait]
pub trait Enricher: Send + Sync {
    /// # Errors
    ///
    /// A failure drops the records and is reported.
    async fn enrich(
        &self,
        records: Vec<PreparedResource>,
        resource_type: &str,
    ) -> Result<Vec<PreparedResource>, FilterError>;
}

/// Returns records unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEnrichment;

#[async_trait]
impl Enricher for NoEnrichment {
    async fn enrich(
        &self,
        records: Vec<PreparedResource>,
        _resource_type: &str,
    ) -> Result<Vec<PreparedResource>, FilterError> {
        Ok(records)
    }
}

/// Keeps `resourceType`, `id`, `meta` and the listed top-level elements.
pub fn project_elements(body: &Value, elements: &[String]) -> Value {
    let Value::Object(members) = body else {
        return body.clone();
    };
    let projected: Map<String, Value> = members
        .iter()
        .filter(|(key, _)| {
            matches!(key.as_str(), "resourceType" | "id" | "meta")
                || elements.iter().any(|element| element == *key)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Value::Object(projected)
}

/// Parses an `_elements=a,b` value.
pub fn parse_elements(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Drops records the identity may not see, then projects or enriches the rest.
///
/// Never fails: an enrichment error drops the record and goes to the reporter.
pub struct ResourceAccessFilter {
    predicate: Arc<dyn AccessPredicate>,
    enricher: Arc<dyn Enricher>,
    identity: RequestIdentity,
    elements: Option<Vec<String>>,
    reporter: Arc<dyn ErrorReporter>,
    token: CancellationToken,
    log_steps: bool,
}

impl ResourceAccessFilter {
    pub fn new(
        predicate: Arc<dyn AccessPredicate>,
        identity: RequestIdentity,
        reporter: Arc<dyn ErrorReporter>,
        token: CancellationToken,
    ) -> Self {
        Self {
            predicate,
            enricher: Arc::new(NoEnrichment),
            identity,
            elements: None,
            reporter,
            token,
            log_steps: false,
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = enricher;
        self
    }

    /// Projects records to these elements instead of enriching them.
    pub fn with_elements(mut self, elements: Option<Vec<String>>) -> Self {
        self.elements = elements.filter(|e| !e.is_empty());
        self
    }

    pub fn with_step_logging(mut self, enabled: bool) -> Self {
        self.log_steps = enabled;
        self
    }
}

#[async_trait]
impl Stage for ResourceAccessFilter {
    type In = StoredResource;
    type Out = PreparedResource;

    async fn process(&mut self, record: StoredResource) -> Vec<PreparedResource> {
        if self.token.is_cancelled() {
            return Vec::new();
        }
        if !self.predicate.is_allowed(&record, &self.identity) {
            tracing::debug!(reference = %record.reference(), "Record dropped by access filter");
            return Vec::new();
        }
        if self.log_steps {
            tracing::info!(reference = %record.reference(), "Record accepted by access filter");
        }

        if let Some(elements) = &self.elements {
            let body = project_elements(&record.resource, elements);
            return vec![PreparedResource::new(&record.resource_type, &record.id, body)];
        }

        let prepared = PreparedResource::from_stored(&record);
        match self.enricher.enrich(vec![prepared], &record.resource_type).await {
            Ok(enriched) => enriched,
            Err(e) => {
                self.reporter.report("filter", &e);
                Vec::new()
            }
        }
    }

    async fn flush(&mut self) -> Vec<PreparedResource> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::TracingErrorReporter;
    use serde_json::json;

    fn record(resource_type: &str, id: &str, access: &[&str]) -> StoredResource {
        let security: Vec<Value> = access
            .iter()
            .map(|code| json!({"system": DEFAULT_ACCESS_TAG_SYSTEM, "code": code}))
            .collect();
        StoredResource::new(
            id,
            "1",
            resource_type,
            json!({
                "resourceType": resource_type,
                "id": id,
                "meta": {"security": security},
                "gender": "female",
                "birthDate": "1970-01-01"
            }),
        )
    }

    fn identity(scopes: &str) -> RequestIdentity {
        RequestIdentity::new(None, scopes.split_whitespace().map(String::from).collect())
    }

    #[test]
    fn test_scope_predicate_requires_type_and_access() {
        let predicate = ScopeAccessPredicate::default();
        let patient = record("Patient", "1", &["client"]);

        assert!(predicate.is_allowed(&patient, &identity("user/*.read access/*.*")));
        assert!(predicate.is_allowed(&patient, &identity("patient/Patient.read access/client.read")));
        assert!(predicate.is_allowed(&patient, &identity("user/Patient.rs access/client.*")));
        assert!(!predicate.is_allowed(&patient, &identity("user/*.read")));
        assert!(!predicate.is_allowed(&patient, &identity("user/Observation.read access/*.*")));
        assert!(!predicate.is_allowed(&patient, &identity("user/*.write access/*.*")));
        assert!(!predicate.is_allowed(&patient, &identity("user/*.read access/other.read")));
    }

    #[test]
    fn test_projection_keeps_identity_members() {
        let body = record("Patient", "1", &[]).resource;
        let projected = project_elements(&body, &parse_elements("gender, ,"));
        assert_eq!(projected["gender"], "female");
        assert_eq!(projected["id"], "1");
        assert!(projected.get("meta").is_some());
        assert!(projected.get("birthDate").is_none());
    }

    struct FailingEnricher;

    #[async_trait]
    impl Enricher for FailingEnricher {
        async fn enrich(
            &self,
            records: Vec<PreparedResource>,
            _resource_type: &str,
        ) -> Result<Vec<PreparedResource>, FilterError> {
            Err(FilterError::Enrichment {
                reference: records[0].id.clone(),
                message: "boom".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_filter_drops_denied_and_failed_records() {
        let token = CancellationToken::new();
        let mut filter = ResourceAccessFilter::new(
            Arc::new(ScopeAccessPredicate::default()),
            identity("user/*.read access/client.read"),
            Arc::new(TracingErrorReporter),
            token.clone(),
        );
        assert_eq!(filter.process(record("Patient", "1", &["client"])).await.len(), 1);
        assert!(filter.process(record("Patient", "2", &["other"])).await.is_empty());

        let mut failing = ResourceAccessFilter::new(
            Arc::new(AllowAll),
            RequestIdentity::default(),
            Arc::new(TracingErrorReporter),
            token.clone(),
        )
        .with_enricher(Arc::new(FailingEnricher));
        assert!(failing.process(record("Patient", "3", &[])).await.is_empty());

        token.cancel();
        assert!(filter.process(record("Patient", "1", &["client"])).await.is_empty());
    }

    #[tokio::test]
    async fn test_filter_projects_when_elements_given() {
        let mut filter = ResourceAccessFilter::new(
            Arc::new(AllowAll),
            RequestIdentity::default(),
            Arc::new(TracingErrorReporter),
            CancellationToken::new(),
        )
        .with_elements(Some(vec!["id".to_string()]));
        let out = filter.process(record("Patient", "9", &[])).await;
        assert!(out[0].body.get("gender").is_none());
        assert_eq!(out[0].id, "9");
    }
}
