//! Organization routes.

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use callbridge_persistence::{Organization, OrganizationStatus};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateOrganizationRequest {
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub config: Value,
}

/// `POST /api/v1/organizations/create`
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateOrganizationRequest>,
) -> Result<Json<Organization>, ApiError> {
    let slug = request.slug.trim().to_lowercase();
    if slug.is_empty() || !slug.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(ApiError::bad_request(
            "slug must be non-empty and use lowercase letters, digits and dashes",
        ));
    }

    let now = Utc::now();
    let organization = Organization {
        organization_id: Uuid::new_v4().to_string(),
        slug,
        name: request.name,
        status: OrganizationStatus::Active,
        config: request.config,
        created_at: now,
        updated_at: now,
    };
    state.organizations.create(&organization).await?;
    tracing::info!(organization_id = %organization.organization_id, slug = %organization.slug, "Organization created");
    Ok(Json(organization))
}

/// `GET /api/v1/organizations`
pub async fn list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let organizations = state.organizations.list().await?;
    Ok(Json(json!({
        "organizations": organizations,
        "count": organizations.len(),
    })))
}

/// `GET /api/v1/organizations/:id`
pub async fn get(
    State(state): State<AppState>,
    Path(organization_id): Path<String>,
) -> Result<Json<Organization>, ApiError> {
    state
        .organizations
        .get(&organization_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("organization {organization_id}")))
}

/// `GET /api/v1/organizations/slug/:slug`
pub async fn get_by_slug(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Organization>, ApiError> {
    state
        .organizations
        .get_by_slug(&slug)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("organization slug {slug}")))
}
