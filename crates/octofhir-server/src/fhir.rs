//! Streaming FHIR endpoints.
//!
//! Each request is planned up front (format, identity, cache key, whether the
//! cache may be read or written) and then driven on a background task that
//! feeds the response body. The handler returns as soon as the cursor is open,
//! so errors after that point surface inside the stream, never as a status.

use axum::{
    extract::{Path, Query, RawQuery, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use octofhir_cache::{CacheCursor, CacheKey, SequenceId, parse_scopes};
use octofhir_storage::{Compartment, ResourceCursor, StreamQuery};
use octofhir_streaming::{
    BundleMeta, CacheReplaySource, CacheWriteThrough, Encoder, IdentifierTracker,
    MetadataFactory, PipelineRunner, PreparedResource, RequestIdentity, ResourceAccessFilter,
    RunCompletion, RunReport, SourceIterator, StageExt, Tracker, WireFormat, parse_elements,
};
use tokio_util::sync::CancellationToken;

use crate::api::{ApiError, FHIR_JSON};
use crate::sink::ChannelSink;
use crate::state::AppState;

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");
pub const FHIR_USER_HEADER: &str = "x-fhir-user";
pub const FHIR_SCOPES_HEADER: &str = "x-fhir-scopes";

type Params = Vec<(String, String)>;

/// Request params that never reach the `$everything` key from the client.
const RESERVED_KEY_PARAMS: [&str; 3] = ["id", "_id", "scopes"];

/// Everything decided before the first byte is produced.
struct StreamPlan {
    operation: &'static str,
    resource_type: String,
    query: StreamQuery,
    format: WireFormat,
    identity: RequestIdentity,
    elements: Option<Vec<String>>,
    cache_key: Option<CacheKey>,
    read_cache: bool,
    write_cache: bool,
    /// Where a cache replay starts; a live run always starts from the top.
    resume: Option<CacheCursor>,
    self_url: String,
    /// Link prefix for the next page, ending where `id:above=` is appended.
    next_url: Option<String>,
}

impl StreamPlan {
    fn new(
        operation: &'static str,
        state: &AppState,
        resource_type: &str,
        query: StreamQuery,
        params: &[(String, String)],
        headers: &HeaderMap,
        self_url: String,
    ) -> Self {
        let format = WireFormat::negotiate(
            param(params, "_format"),
            header_str(headers, header::ACCEPT.as_str()),
            param(params, "_bundle").is_some_and(is_truthy),
            state.config.streaming.default_bundle,
        );
        Self {
            operation,
            resource_type: resource_type.to_string(),
            query,
            format,
            identity: identity_from_headers(headers),
            elements: param(params, "_elements").map(parse_elements),
            cache_key: None,
            read_cache: false,
            write_cache: false,
            resume: None,
            self_url,
            next_url: None,
        }
    }

    /// Enables the cache under `key` unless the request opts out or shapes
    /// its result in ways the key does not capture.
    fn with_cache(mut self, key: CacheKey, state: &AppState, params: &Params, headers: &HeaderMap) -> Self {
        let bypass = bypass_cache(params, headers)
            || self.elements.is_some()
            || self.query.count.is_some();
        if bypass {
            tracing::debug!(key = %key, "Stream cache bypassed for request");
            return self;
        }
        let config = state.stream_cache.config();
        self.read_cache = config.read_enabled;
        self.write_cache = config.write_enabled;
        self.cache_key = Some(key);
        self
    }

    fn with_resume(mut self, resume: Option<CacheCursor>) -> Self {
        self.resume = resume;
        self
    }

    fn with_next_page(mut self, base: String) -> Self {
        self.next_url = Some(base);
        self
    }

    /// Audit entries are skipped for id-only projections, which show no content.
    fn audited(&self) -> bool {
        !matches!(self.elements.as_deref(), Some([only]) if only == "id")
    }

    fn encoder(&self, tracker: Tracker, token: CancellationToken, state: &AppState) -> Encoder {
        Encoder::new(
            self.format,
            token,
            state.reporter.clone(),
            self.metadata_factory(tracker),
        )
    }

    fn metadata_factory(&self, tracker: Tracker) -> MetadataFactory<BundleMeta> {
        let self_url = self.self_url.clone();
        let next_url = self.next_url.clone();
        let limit = self.query.count;
        Box::new(move |last_id: Option<&str>, now: i64| {
            let total = tracker.len();
            let mut meta = BundleMeta::searchset(total, now).with_link("self", self_url.clone());
            if let (Some(limit), Some(last), Some(next)) = (limit, last_id, next_url.as_deref()) {
                if limit > 0 && total >= limit {
                    meta = meta.with_link("next", format!("{next}{}", urlencoding::encode(last)));
                }
            }
            meta
        })
    }
}

/// `GET /fhir/{type}`: streaming search, always live.
pub async fn search(
    State(state): State<AppState>,
    Path(resource_type): Path<String>,
    Query(params): Query<Params>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_resource_type(&resource_type)?;
    let query = StreamQuery::from_params(&resource_type, &params)?;
    let base = format!("{}/fhir/{resource_type}", state.config.base_url());
    let next = next_page_prefix(&base, &params);
    let plan = StreamPlan::new(
        "search",
        &state,
        &resource_type,
        query,
        &params,
        &headers,
        with_query(&base, raw.as_deref()),
    )
    .with_next_page(next);
    stream_response(state, plan).await
}

/// `GET /fhir/{type}/{id}/$everything`: the compartment of one resource,
/// cached as a resumable per-query log.
pub async fn everything(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    Query(params): Query<Params>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_resource_type(&resource_type)?;
    ensure_exists(&state, &resource_type, &id).await?;

    // The key carries the compartment id and the caller's scopes itself.
    let params: Params = params
        .into_iter()
        .filter(|(k, _)| !RESERVED_KEY_PARAMS.contains(&k.as_str()))
        .collect();
    let query = StreamQuery::from_params(&resource_type, &params)?
        .with_compartment(Compartment::new(&resource_type, &id));
    let identity = identity_from_headers(&headers);
    let key = CacheKey::everything(&resource_type, &everything_key_params(&params, &id, &identity));

    let self_url = with_query(
        &format!("{}/fhir/{resource_type}/{id}/$everything", state.config.base_url()),
        raw.as_deref(),
    );
    let plan = StreamPlan::new("everything", &state, &resource_type, query, &params, &headers, self_url)
        .with_cache(key, &state, &params, &headers)
        .with_resume(resume_cursor(&params)?);
    stream_response(state, plan).await
}

/// `GET /fhir/{type}/{id}/$summary`: the compartment under the caller's
/// scopes, cached under the scoped whole-bundle key.
pub async fn summary(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_resource_type(&resource_type)?;
    ensure_exists(&state, &resource_type, &id).await?;

    let query = StreamQuery::new(&resource_type).with_compartment(Compartment::new(&resource_type, &id));
    let identity = identity_from_headers(&headers);
    let key = CacheKey::scoped(&resource_type, &id, &identity.scopes, "Summary");
    let self_url = format!("{}/fhir/{resource_type}/{id}/$summary", state.config.base_url());
    let plan = StreamPlan::new("summary", &state, &resource_type, query, &params, &headers, self_url)
        .with_cache(key, &state, &params, &headers)
        .with_resume(resume_cursor(&params)?);
    stream_response(state, plan).await
}

/// `GET /fhir/{type}/{id}`: one resource through the whole-payload cache.
pub async fn read(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    Query(params): Query<Params>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_resource_type(&resource_type)?;
    let identity = identity_from_headers(&headers);
    let key = CacheKey::scoped(&resource_type, &id, &identity.scopes, "Read");
    let config = state.stream_cache.config();
    let bypass = bypass_cache(&params, &headers);

    if config.read_enabled && !bypass {
        if let Some(bytes) = state.kv_cache.get(key.as_str()).await {
            return Ok(fhir_json(bytes.to_vec(), "Hit"));
        }
    }

    let record = state
        .storage
        .read(&resource_type, &id)
        .await?
        .filter(|record| state.predicate.is_allowed(record, &identity));
    let Some(record) = record else {
        // A bypassed read may find a payload cached before the record went away.
        if config.write_enabled {
            state.kv_cache.delete(key.as_str()).await;
        }
        return Err(ApiError::not_found(format!("{resource_type}/{id}")));
    };
    let json = PreparedResource::from_stored(&record)
        .to_wire_json()
        .map_err(|e| ApiError::internal(e.to_string()))?;

    if config.write_enabled && !bypass {
        state.kv_cache.set(key.as_str(), json.clone().into_bytes(), None).await;
    }
    Ok(fhir_json(json.into_bytes(), "Miss"))
}

async fn stream_response(state: AppState, plan: StreamPlan) -> Result<Response, ApiError> {
    let hit = match &plan.cache_key {
        Some(key) if plan.read_cache => state.stream_cache.has_cached_stream(key.as_str()).await,
        _ => false,
    };
    let cursor = if hit {
        None
    } else {
        Some(state.storage.open_cursor(&plan.query).await?)
    };

    let (sink, body) = ChannelSink::channel(state.config.streaming.channel_capacity);
    let content_type = plan.format.content_type();
    tracing::debug!(
        operation = plan.operation,
        resource_type = %plan.resource_type,
        format = ?plan.format,
        cache_hit = hit,
        "Starting stream"
    );
    tokio::spawn(drive(state, plan, sink, cursor));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (X_CACHE, if hit { "Hit" } else { "Miss" }),
        ],
        body,
    )
        .into_response())
}

/// Runs the request to completion: a replay when `cursor` is `None`, falling
/// back to a live run if the replay fails before producing output.
async fn drive(
    state: AppState,
    plan: StreamPlan,
    mut sink: ChannelSink,
    cursor: Option<Box<dyn ResourceCursor>>,
) {
    let request_token = CancellationToken::new();
    let _watch = sink.watch_disconnect(request_token.clone());

    let cursor = match (cursor, &plan.cache_key) {
        (Some(cursor), _) => cursor,
        (None, Some(key)) => {
            let report = replay(&state, &plan, key, &mut sink, request_token.child_token()).await;
            let failed_early = matches!(report.completion, RunCompletion::SourceFailed(_))
                && report.chunks_sent == 0
                && !request_token.is_cancelled();
            if !failed_early {
                finish(&plan, "cache", &report);
                return;
            }
            tracing::warn!(key = %key, "Cache replay failed before output, serving from storage");
            state.stream_cache.invalidate(key.as_str()).await;
            match state.storage.open_cursor(&plan.query).await {
                Ok(cursor) => cursor,
                Err(e) => {
                    state.reporter.report("source", &e);
                    return;
                }
            }
        }
        (None, None) => return,
    };

    let report = run_live(&state, &plan, cursor, &mut sink, request_token.child_token()).await;
    drop(sink);
    finish(&plan, "live", &report);
}

async fn run_live(
    state: &AppState,
    plan: &StreamPlan,
    cursor: Box<dyn ResourceCursor>,
    sink: &mut ChannelSink,
    token: CancellationToken,
) -> RunReport {
    let log_steps = state.config.logging.log_stream_steps;
    let runner = PipelineRunner::new(token.clone(), state.reporter.clone()).with_step_logging(log_steps);

    let write_through = plan.cache_key.as_ref().filter(|_| plan.write_cache).map(|key| {
        let (stage, _writer) = CacheWriteThrough::new(
            state.stream_cache.clone(),
            key.as_str(),
            token.clone(),
            state.reporter.clone(),
        );
        stage
    });

    let pipeline = ResourceAccessFilter::new(
        state.predicate.clone(),
        plan.identity.clone(),
        state.reporter.clone(),
        token.clone(),
    )
    .with_elements(plan.elements.clone())
    .with_step_logging(log_steps)
    .then(write_through)
    .then(IdentifierTracker::new(runner.tracker(), token.clone()))
    .then(plan.encoder(runner.tracker(), token.clone(), state));

    let source = SourceIterator::new(cursor, token);
    runner.run(source, pipeline, sink).await
}

async fn replay(
    state: &AppState,
    plan: &StreamPlan,
    key: &CacheKey,
    sink: &mut ChannelSink,
    token: CancellationToken,
) -> RunReport {
    let runner = PipelineRunner::new(token.clone(), state.reporter.clone())
        .with_step_logging(state.config.logging.log_stream_steps);
    let pipeline = IdentifierTracker::new(runner.tracker(), token.clone())
        .then(plan.encoder(runner.tracker(), token.clone(), state));
    let mut source = CacheReplaySource::new(state.stream_cache.clone(), key.as_str(), token);
    if let Some(cursor) = plan.resume {
        source = source.with_cursor(cursor);
    }
    runner.run(source, pipeline, sink).await
}

fn finish(plan: &StreamPlan, source: &'static str, report: &RunReport) {
    crate::metrics::record_stream_response(
        plan.operation,
        source,
        report.completion.label(),
        report.identifiers.len(),
    );
    if plan.audited() {
        tracing::info!(
            target: "audit",
            operation = plan.operation,
            resource_type = %plan.resource_type,
            user = plan.identity.user.as_deref().unwrap_or("anonymous"),
            source,
            count = report.identifiers.len(),
            ids = ?report.identifiers,
            "Resources streamed"
        );
    }
}

async fn ensure_exists(state: &AppState, resource_type: &str, id: &str) -> Result<(), ApiError> {
    match state.storage.read(resource_type, id).await? {
        Some(_) => Ok(()),
        None => Err(ApiError::not_found(format!("{resource_type}/{id}"))),
    }
}

fn check_resource_type(resource_type: &str) -> Result<(), ApiError> {
    let valid = resource_type.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        && resource_type.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!("Invalid resource type: {resource_type}")))
    }
}

fn identity_from_headers(headers: &HeaderMap) -> RequestIdentity {
    RequestIdentity::new(
        header_str(headers, FHIR_USER_HEADER).map(String::from),
        header_str(headers, FHIR_SCOPES_HEADER)
            .map(parse_scopes)
            .unwrap_or_default(),
    )
}

/// Per-query log params: the request's own, the compartment id, and the
/// caller's scopes so callers with different access never share a log.
/// `_cursor=<millis>-<seq>`: resume a cached replay after that entry.
fn resume_cursor(params: &[(String, String)]) -> Result<Option<CacheCursor>, ApiError> {
    param(params, "_cursor")
        .map(|raw| {
            raw.parse::<SequenceId>()
                .map(CacheCursor::after)
                .map_err(|_| ApiError::bad_request(format!("Invalid _cursor: {raw}")))
        })
        .transpose()
}

fn everything_key_params(params: &Params, id: &str, identity: &RequestIdentity) -> Params {
    let mut key_params = params.clone();
    key_params.push(("id".into(), id.into()));
    let mut scopes = identity.scopes.clone();
    scopes.sort();
    scopes.dedup();
    key_params.push(("scopes".into(), scopes.join(",")));
    key_params
}

fn bypass_cache(params: &Params, headers: &HeaderMap) -> bool {
    let no_cache = header_str(headers, header::CACHE_CONTROL.as_str())
        .is_some_and(|v| v.to_ascii_lowercase().contains("no-cache"));
    no_cache || param(params, "_debug").is_some_and(is_truthy)
}

fn next_page_prefix(base: &str, params: &Params) -> String {
    let kept: Vec<String> = params
        .iter()
        .filter(|(k, _)| k != "id:above")
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect();
    if kept.is_empty() {
        format!("{base}?id:above=")
    } else {
        format!("{base}?{}&id:above=", kept.join("&"))
    }
}

fn with_query(base: &str, raw: Option<&str>) -> String {
    match raw {
        Some(q) if !q.is_empty() => format!("{base}?{q}"),
        _ => base.to_string(),
    }
}

fn fhir_json(body: Vec<u8>, cache: &'static str) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(FHIR_JSON)),
            (X_CACHE, HeaderValue::from_static(cache)),
        ],
        body,
    )
        .into_response()
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_identity_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(FHIR_USER_HEADER, HeaderValue::from_static("Practitioner/7"));
        headers.insert(
            FHIR_SCOPES_HEADER,
            HeaderValue::from_static("user/*.read  access/*.*"),
        );
        let identity = identity_from_headers(&headers);
        assert_eq!(identity.user.as_deref(), Some("Practitioner/7"));
        assert_eq!(identity.scopes, vec!["user/*.read", "access/*.*"]);
    }

    #[test]
    fn test_everything_key_includes_id_and_sorted_scopes() {
        let identity = RequestIdentity::new(None, vec!["user/*.read".into(), "access/*.*".into()]);
        let key = CacheKey::everything(
            "Patient",
            &everything_key_params(&params(&[("_format", "json"), ("type", "Observation")]), "p1", &identity),
        );
        assert_eq!(
            key.as_str(),
            "fhir:everything:Patient:id=p1&scopes=access/*.*,user/*.read&type=Observation"
        );
        assert!(CacheKey::has_id_param(key.as_str(), "p1"));

        let anonymous = CacheKey::everything(
            "Patient",
            &everything_key_params(&params(&[]), "p1", &RequestIdentity::default()),
        );
        assert_eq!(anonymous.as_str(), "fhir:everything:Patient:id=p1&scopes=");
    }

    #[test]
    fn test_resume_cursor_param() {
        assert_eq!(resume_cursor(&params(&[])).unwrap(), None);
        assert_eq!(
            resume_cursor(&params(&[("_cursor", "17-2")])).unwrap(),
            Some(CacheCursor::after(SequenceId::new(17, 2)))
        );
        assert!(resume_cursor(&params(&[("_cursor", "x-1")])).is_err());
    }

    #[test]
    fn test_bypass_rules() {
        let mut headers = HeaderMap::new();
        assert!(!bypass_cache(&params(&[]), &headers));
        assert!(bypass_cache(&params(&[("_debug", "true")]), &headers));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("No-Cache"));
        assert!(bypass_cache(&params(&[]), &headers));
    }

    #[test]
    fn test_next_page_prefix_replaces_previous_cursor() {
        let prefix = next_page_prefix(
            "http://h/fhir/Observation",
            &params(&[("_count", "2"), ("id:above", "o1"), ("code", "a b")]),
        );
        assert_eq!(prefix, "http://h/fhir/Observation?_count=2&code=a%20b&id:above=");
        assert_eq!(
            next_page_prefix("http://h/fhir/Observation", &params(&[])),
            "http://h/fhir/Observation?id:above="
        );
    }

    #[test]
    fn test_resource_type_check() {
        assert!(check_resource_type("Patient").is_ok());
        assert!(check_resource_type("patient").is_err());
        assert!(check_resource_type("Pat-ient").is_err());
        assert!(check_resource_type("").is_err());
    }
}
