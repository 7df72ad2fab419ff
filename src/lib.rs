pub mod config;
pub mod error;
pub mod fetch;
pub mod file_proxy;
pub mod hls;
pub mod live;
pub mod m3u8;
pub mod metrics;
pub mod range;
pub mod resolve;
pub mod sniff;
pub mod state;

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tracing::info;

use crate::state::{Entry, ProxyState};

pub fn create_app(state: Arc<ProxyState>) -> Router {
    let proxy_route = format!("{}/{{name}}", state.config().route.trim_end_matches('/'));

    Router::new()
        .route(&proxy_route, get(proxy_handler).head(proxy_handler))
        .route("/api/entry", post(entry_handler))
        .route("/metrics", get(metrics_handler))
        .fallback(fallback_handler)
        .with_state(state)
}

fn user_agent(headers: &HeaderMap) -> &str {
    headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>")
}

async fn fallback_handler(method: Method, uri: Uri, headers: HeaderMap) -> impl IntoResponse {
    info!(
        "HTTP 404: method={} uri={} UA=\"{}\"",
        method,
        uri,
        user_agent(&headers)
    );
    (StatusCode::NOT_FOUND, "Not found")
}

async fn proxy_handler(
    Path(name): Path<String>,
    State(state): State<Arc<ProxyState>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let range = headers
        .get(axum::http::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("<none>");
    info!(
        "HTTP proxy request: method={} name={} UA=\"{}\" Range=\"{}\"",
        method,
        name,
        user_agent(&headers),
        range
    );
    state.serve(&name, &method, &headers).await
}

async fn entry_handler(
    State(state): State<Arc<ProxyState>>,
    Json(entry): Json<Entry>,
) -> Response {
    info!(
        "HTTP entry setup: url={} referer={:?} use_proxy={}",
        entry.url, entry.referer, entry.use_proxy
    );
    match state.setup_entry(&entry).await {
        Ok(source) => Json(source).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn metrics_handler() -> Response {
    Response::builder()
        .header("Content-Type", "text/plain; version=0.0.4")
        .body(Body::from(metrics::gather_metrics()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
