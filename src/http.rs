//! REST surface: health, raw data and prefetch requests.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

use crate::error::PoolError;
use crate::prefetch::DataPrefetcher;
use crate::shutdown::ShutdownController;
use crate::store::KvBufferStore;

/// Headers browsers may read from cross-origin responses.
pub const EXPOSED_HEADERS: [&str; 2] = ["x-arns-resolved-id", "x-arns-ttl-seconds"];

const CACHE_HEADER: &str = "x-cache";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn KvBufferStore>,
    pub prefetcher: DataPrefetcher,
    pub shutdown: ShutdownController,
    pub started_at: Instant,
}

/// Build the router with every route and the CORS layer.
pub fn routes(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(EXPOSED_HEADERS.map(HeaderName::from_static));

    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/raw/{id}", get(get_raw))
        .route("/prefetch/{id}", post(queue_prefetch))
        .layer(cors)
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn healthcheck(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs_f64(),
        "date": chrono::Utc::now().to_rfc3339(),
        "shutdown": state.shutdown.state(),
        "pendingJobs": state.prefetcher.pending_count(),
        "connections": state.shutdown.registry().total(),
    }))
}

// ── Data ────────────────────────────────────────────────────────────────

async fn get_raw(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if !is_valid_id(&id) {
        return error(StatusCode::BAD_REQUEST, "Invalid id");
    }

    match state.store.get(&id).await {
        Ok(Some(bytes)) => return raw_response(bytes, "HIT"),
        Ok(None) => {}
        Err(e) => {
            warn!(id = %id, error = %e, "Store read failed");
            return error(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable");
        }
    }

    debug!(id = %id, "Cache miss, prefetching");
    if let Err(e) = state.prefetcher.prefetch(id.clone()).await {
        warn!(id = %id, error = %e, "Prefetch failed");
        let status = match e {
            PoolError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            PoolError::Job(_) | PoolError::WorkerFault(_) => StatusCode::BAD_GATEWAY,
        };
        return error(status, &e.to_string());
    }

    match state.store.get(&id).await {
        Ok(Some(bytes)) => raw_response(bytes, "MISS"),
        Ok(None) => error(StatusCode::NOT_FOUND, "Not found"),
        Err(e) => {
            warn!(id = %id, error = %e, "Store read failed after prefetch");
            error(StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable")
        }
    }
}

async fn queue_prefetch(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if !is_valid_id(&id) {
        return error(StatusCode::BAD_REQUEST, "Invalid id");
    }
    if state.shutdown.is_shutting_down() {
        return error(StatusCode::SERVICE_UNAVAILABLE, "Shutting down");
    }
    state.prefetcher.queue_prefetch(id.clone());
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "queued", "id": id })),
    )
        .into_response()
}

/// Base64url ids, as used by the upstream gateway.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn raw_response(bytes: Vec<u8>, cache: &'static str) -> Response {
    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (HeaderName::from_static(CACHE_HEADER), HeaderValue::from_static(cache)),
        ],
        bytes,
    )
        .into_response()
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
