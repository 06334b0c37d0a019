//! Admin cache endpoints for operators and external invalidation tooling.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::api::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct KeysQuery {
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Deserialize)]
pub struct MetadataQuery {
    pub key: String,
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub keys: Vec<String>,
}

/// `GET /admin/cache/keys?prefix=`
pub async fn list_keys(
    State(state): State<AppState>,
    Query(query): Query<KeysQuery>,
) -> Result<Json<Value>, ApiError> {
    let keys = state.stream_cache.list_keys(&query.prefix).await?;
    Ok(Json(json!({ "prefix": query.prefix, "count": keys.len(), "keys": keys })))
}

/// `GET /admin/cache/metadata?key=`
pub async fn metadata(
    State(state): State<AppState>,
    Query(query): Query<MetadataQuery>,
) -> Result<Json<Value>, ApiError> {
    let metadata = state
        .stream_cache
        .metadata(&query.key)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("cache log {}", query.key)))?;
    let mut body = serde_json::to_value(&metadata).map_err(|e| ApiError::internal(e.to_string()))?;
    body["key"] = Value::String(query.key);
    Ok(Json(body))
}

/// `DELETE /admin/cache` with `{"keys": [...]}`
pub async fn invalidate_keys(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> Json<Value> {
    let invalidated = state.stream_cache.invalidate_many(&request.keys).await;
    tracing::info!(requested = request.keys.len(), invalidated, "Cache keys invalidated");
    Json(json!({ "invalidated": invalidated }))
}

/// `DELETE /admin/cache/{type}/{id}`
pub async fn invalidate_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let invalidated = state
        .stream_cache
        .invalidate_resource(&resource_type, &id)
        .await?;
    Ok(Json(json!({ "invalidated": invalidated })))
}
