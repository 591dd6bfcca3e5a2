//! Read-only analytics routes.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use callbridge_persistence::MetricType;
use callbridge_rag::{analytics, ChunksAnalytics};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    /// Window size in hours (default 24).
    #[serde(default = "default_hours")]
    pub hours: i64,
}

fn default_hours() -> i64 {
    24
}

/// `GET /api/v1/analytics/agents/:id/latency?hours=...`
pub async fn latency(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<Value>, ApiError> {
    let since = Utc::now() - Duration::hours(query.hours.clamp(1, 24 * 30));
    let aggregates = state
        .metrics
        .aggregate_window(&agent_id, MetricType::Latency, since)
        .await?;
    Ok(Json(json!({
        "agentId": agent_id,
        "windowHours": query.hours,
        "operations": aggregates,
    })))
}

/// `GET /api/v1/analytics/agents/:id/knowledge`
pub async fn knowledge(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let records = state.chunk_source.chunks_for_agent(&agent_id).await?;
    let analytics = ChunksAnalytics::compute(&records);
    Ok(Json(json!({
        "agentId": agent_id,
        "analytics": analytics,
        "cache": {
            "hitRate": state.retriever.cache_stats().hit_rate,
            "size": state.retriever.cache_stats().size,
        },
    })))
}

#[derive(Debug, Deserialize)]
pub struct HotChunksQuery {
    #[serde(default = "default_hot_limit")]
    pub limit: usize,
}

fn default_hot_limit() -> usize {
    10
}

/// `GET /api/v1/analytics/agents/:id/hot-chunks?limit=...`
pub async fn hot_chunks(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<HotChunksQuery>,
) -> Result<Json<Value>, ApiError> {
    let records = state.chunk_source.chunks_for_agent(&agent_id).await?;
    let hot = analytics::hot_chunks(&records, query.limit.clamp(1, 100));
    Ok(Json(json!({"agentId": agent_id, "chunks": hot})))
}

/// `GET /api/v1/analytics/calls/active`
pub async fn active_calls(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"activeCalls": state.orchestrator.active_count()}))
}
