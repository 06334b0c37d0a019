use std::time::Instant;

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Preserves an incoming `x-request-id` or assigns one, and echoes it on the response.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static(REQUEST_ID_HEADER);

    let req_id_value = req
        .headers()
        .get(&header_name)
        .cloned()
        .or_else(|| HeaderValue::from_str(&Uuid::new_v4().to_string()).ok());

    if let Some(value) = &req_id_value {
        // Read by the trace span.
        req.extensions_mut().insert(value.clone());
    }

    let mut res = next.run(req).await;
    if let Some(value) = req_id_value {
        res.headers_mut().insert(header_name, value);
    }
    res
}

/// Counts requests by method and status class. Streamed bodies are timed to
/// the response head, not to the last chunk.
pub async fn http_metrics(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let started = Instant::now();
    let res = next.run(req).await;
    crate::metrics::record_http_request(method.as_str(), res.status().as_u16(), started.elapsed());
    res
}
