//! Router assembly.

use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{delete, get, patch, post, put};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use callbridge_config::constants::ingestion;

use crate::handlers::{agents, analytics, calls, documents, organizations};
use crate::metrics::metrics_handler;
use crate::state::AppState;

/// Build the application router.
pub fn create_router(state: AppState, metrics_handle: PrometheusHandle) -> Router {
    let cors = build_cors_layer(
        &state.config.server.cors_origins,
        state.config.server.cors_enabled,
    );

    let api = Router::new()
        // Organizations
        .route("/organizations/create", post(organizations::create))
        .route("/organizations", get(organizations::list))
        .route("/organizations/slug/:slug", get(organizations::get_by_slug))
        .route("/organizations/:id", get(organizations::get))
        // Agents
        .route("/agents/create", post(agents::create))
        .route("/agents", get(agents::list))
        .route("/agents/validate/:id", get(agents::validate))
        .route("/agents/route-by-phone", post(agents::route_by_phone))
        .route("/agents/enhance-prompt", post(agents::enhance_prompt))
        .route("/agents/:id", get(agents::get))
        .route("/agents/:id", put(agents::update))
        .route("/agents/:id/status", patch(agents::set_status))
        .route("/agents/:id", delete(agents::delete))
        // Calls
        .route("/calls/outbound", post(calls::outbound))
        .route("/calls", get(calls::list))
        .route("/calls/:session_id", get(calls::get))
        .route("/calls/:session_id/transcript", get(calls::transcript))
        // Documents
        .route("/documents/ingest", post(documents::ingest))
        .route("/documents/:id/status", get(documents::status))
        .route("/documents/:id/chunks", get(documents::chunks))
        .route("/documents/:id/confirm", post(documents::confirm))
        .route("/documents/:id/cancel", post(documents::cancel))
        .route("/documents/:id/recover", post(documents::recover))
        .route("/documents/:id", delete(documents::delete))
        // Analytics (read-only)
        .route("/analytics/agents/:id/latency", get(analytics::latency))
        .route("/analytics/agents/:id/knowledge", get(analytics::knowledge))
        .route(
            "/analytics/agents/:id/hot-chunks",
            get(analytics::hot_chunks),
        )
        .route("/analytics/calls/active", get(analytics::active_calls))
        // Media plane webhook
        .route("/livekit/sip-dispatch", post(calls::sip_dispatch));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route(
            "/metrics",
            get(metrics_handler).with_state(metrics_handle),
        )
        .layer(DefaultBodyLimit::max(ingestion::MAX_FILE_BYTES as usize + 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Permissive for development; origin-restricted when configured.
fn build_cors_layer(origins: &[String], enabled: bool) -> CorsLayer {
    if !enabled || origins.is_empty() {
        return CorsLayer::permissive();
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "Invalid CORS origin");
                None
            }
        })
        .collect();

    if parsed.is_empty() {
        return CorsLayer::permissive();
    }
    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
}

/// `GET /health`: liveness.
async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "healthy"}))
}

/// `GET /ready`: readiness with per-dependency checks.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let checks = state.readiness().await;
    let all_ok = checks.iter().all(|(_, ok)| *ok);
    let body = json!({
        "ready": all_ok,
        "checks": checks
            .into_iter()
            .map(|(name, ok)| json!({"name": name, "ok": ok}))
            .collect::<Vec<_>>(),
    });
    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}
