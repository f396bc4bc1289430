use std::time::Instant;

use axum::http::header;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

/// Stamp a JSON response with the response-shaping headers the surface promises: how long
/// the handler took, how many records it returned, the cache key it computed against
/// (mirrors the computation cache's key so clients can reason about staleness), and a
/// short public cache window. Grounded on the teacher's enrichment source
/// (`cooprefr-bettersys`'s `with_etag_headers`), generalized from ETag-based caching to the
/// plain diagnostic headers this surface needs.
pub fn with_response_headers<T: Serialize>(
    data: T,
    started_at: Instant,
    data_count: usize,
    cache_key: &str,
) -> Response {
    let mut response = Json(data).into_response();
    let headers = response.headers_mut();
    headers.insert(
        "X-Response-Time",
        format!("{}ms", started_at.elapsed().as_millis())
            .parse()
            .unwrap(),
    );
    headers.insert("X-Data-Count", data_count.to_string().parse().unwrap());
    headers.insert(
        "X-Cache-Key",
        cache_key.parse().unwrap_or_else(|_| "unknown".parse().unwrap()),
    );
    headers.insert(header::CACHE_CONTROL, "public, max-age=2".parse().unwrap());
    response
}
