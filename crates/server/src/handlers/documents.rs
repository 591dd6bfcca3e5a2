//! Document ingestion routes.

use axum::extract::{Multipart, Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct IngestQuery {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
}

/// `POST /api/v1/documents/ingest`
///
/// Multipart body: a `file` part plus `agent_id`/`organization_id`
/// fields (query parameters are accepted as a fallback).
pub async fn ingest(
    State(state): State<AppState>,
    Query(query): Query<IngestQuery>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    if state.shutdown.is_shutting_down() {
        return Err(ApiError::new(
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            "shutting down",
        ));
    }

    let mut file_name = None;
    let mut bytes = None;
    let mut agent_id = query.agent_id;
    let mut organization_id = query.organization_id;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("bad multipart body: {e}")))?
    {
        match field.name() {
            Some("file") => {
                file_name = field.file_name().map(str::to_string);
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| ApiError::bad_request(format!("file read failed: {e}")))?
                        .to_vec(),
                );
            }
            Some("agent_id") => {
                agent_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(e.to_string()))?,
                );
            }
            Some("organization_id") => {
                organization_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(e.to_string()))?,
                );
            }
            _ => {}
        }
    }
    let file_name =
        file_name.ok_or_else(|| ApiError::bad_request("multipart field 'file' is required"))?;
    let bytes = bytes.ok_or_else(|| ApiError::bad_request("file body is empty"))?;
    let agent_id = agent_id.ok_or_else(|| ApiError::bad_request("agent_id is required"))?;
    let organization_id =
        organization_id.ok_or_else(|| ApiError::bad_request("organization_id is required"))?;

    let outcome = state
        .ingestion
        .upload_document(&agent_id, &organization_id, &file_name, bytes)
        .await?;

    Ok(Json(json!({
        "sessionId": outcome.session_id,
        "stage": outcome.stage,
        "previewEnabled": outcome.preview_enabled,
        "fileName": outcome.file_name,
        "fileSize": outcome.file_size,
    })))
}

/// `GET /api/v1/documents/:id/status`
pub async fn status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state.ingestion.session_status(&session_id)?;
    Ok(Json(json!({
        "status": status.status,
        "stage": status.stage,
        "progress": status.progress,
        "chunkCount": status.chunk_count,
        "error": status.error,
    })))
}

/// `GET /api/v1/documents/:id/chunks`
pub async fn chunks(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let chunks = state.ingestion.session_chunks(&session_id)?;
    Ok(Json(json!({"chunks": chunks, "count": chunks.len()})))
}

/// `POST /api/v1/documents/:id/confirm`
pub async fn confirm(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let outcome = state.ingestion.confirm(&session_id).await?;
    Ok(Json(json!({
        "success": true,
        "chunksCreated": outcome.chunks_created,
        "ragIds": outcome.rag_ids,
    })))
}

/// `POST /api/v1/documents/:id/cancel`
pub async fn cancel(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.ingestion.cancel(&session_id).await?;
    Ok(Json(json!({"cancelled": true})))
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    #[serde(default)]
    pub reason: Option<String>,
}

/// `DELETE /api/v1/documents/:id`: soft delete with a 30-day tombstone.
pub async fn delete(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> Result<Json<Value>, ApiError> {
    let tombstone = state.retention.soft_delete(&document_id, query.reason).await?;
    Ok(Json(json!({
        "deleted": true,
        "purgeAt": tombstone.purge_at,
    })))
}

/// `POST /api/v1/documents/:id/recover`
pub async fn recover(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.retention.recover(&document_id).await?;
    Ok(Json(json!({"recovered": true})))
}
