//! Agent routes.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use callbridge_core::normalize_phone_number;
use callbridge_llm::{Cancellation, GenerateRequest, Message, StreamEvent};
use callbridge_persistence::{AgentRecord, AgentStatus, PhoneAssignment};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub organization_id: String,
    pub display_name: String,
    #[serde(default)]
    pub persona_name: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_voice")]
    pub voice_id: String,
    pub system_prompt: String,
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default = "default_farewell")]
    pub farewell: String,
    #[serde(default)]
    pub phone: Option<PhoneAssignment>,
}

fn default_language() -> String {
    "en-US".to_string()
}

fn default_voice() -> String {
    "default".to_string()
}

fn default_farewell() -> String {
    "Thank you for calling. Goodbye!".to_string()
}

fn validate_phone(phone: &Option<PhoneAssignment>) -> Result<(), ApiError> {
    if let Some(phone) = phone {
        let joined = format!("{}{}", phone.country_code, phone.number);
        if normalize_phone_number(&joined).is_none() {
            return Err(ApiError::bad_request(format!(
                "phone {joined:?} is not E.164"
            )));
        }
    }
    Ok(())
}

/// `POST /api/v1/agents/create`
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateAgentRequest>,
) -> Result<Json<AgentRecord>, ApiError> {
    if state
        .organizations
        .get(&request.organization_id)
        .await?
        .is_none()
    {
        return Err(ApiError::not_found(format!(
            "organization {}",
            request.organization_id
        )));
    }
    validate_phone(&request.phone)?;

    let now = Utc::now();
    let agent = AgentRecord {
        agent_id: Uuid::new_v4().to_string(),
        organization_id: request.organization_id,
        persona_name: request
            .persona_name
            .unwrap_or_else(|| request.display_name.clone()),
        display_name: request.display_name,
        language: request.language,
        voice_id: request.voice_id,
        system_prompt: request.system_prompt,
        greeting: request.greeting,
        farewell: request.farewell,
        phone: request.phone,
        status: AgentStatus::Active,
        number_of_calls: 0,
        created_at: now,
        updated_at: now,
    };
    state.agents.create(&agent).await?;

    // Phone conflicts are reported, not rejected.
    let conflicts = state.agents.phone_conflicts(&agent).await?;
    if !conflicts.is_empty() {
        tracing::warn!(
            agent_id = %agent.agent_id,
            conflicts = conflicts.len(),
            "Agent created with phone conflicts"
        );
    }

    // Warm the fresh namespace off the request path.
    {
        let retriever = state.retriever.clone();
        let namespace = agent.agent_id.clone();
        tokio::spawn(async move {
            if let Err(e) = retriever.warmup_namespace(&namespace).await {
                tracing::debug!(%namespace, error = %e, "Namespace warm-up failed");
            }
        });
    }
    Ok(Json(agent))
}

#[derive(Debug, Deserialize)]
pub struct ListAgentsQuery {
    pub tenant_id: String,
}

/// `GET /api/v1/agents?tenant_id=...`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListAgentsQuery>,
) -> Result<Json<Value>, ApiError> {
    let agents = state.agents.list_by_org(&query.tenant_id).await?;
    Ok(Json(json!({"agents": agents, "count": agents.len()})))
}

/// `GET /api/v1/agents/:id`
pub async fn get(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentRecord>, ApiError> {
    state
        .agents
        .get(&agent_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("agent {agent_id}")))
}

#[derive(Debug, Deserialize)]
pub struct UpdateAgentRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub persona_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub voice_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub farewell: Option<String>,
    #[serde(default)]
    pub phone: Option<PhoneAssignment>,
}

/// `PUT /api/v1/agents/:id`
pub async fn update(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(request): Json<UpdateAgentRequest>,
) -> Result<Json<AgentRecord>, ApiError> {
    let mut agent = state
        .agents
        .get(&agent_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("agent {agent_id}")))?;

    validate_phone(&request.phone)?;
    if let Some(display_name) = request.display_name {
        agent.display_name = display_name;
    }
    if let Some(persona_name) = request.persona_name {
        agent.persona_name = persona_name;
    }
    if let Some(language) = request.language {
        agent.language = language;
    }
    if let Some(voice_id) = request.voice_id {
        agent.voice_id = voice_id;
    }
    if let Some(system_prompt) = request.system_prompt {
        agent.system_prompt = system_prompt;
    }
    if let Some(greeting) = request.greeting {
        agent.greeting = Some(greeting);
    }
    if let Some(farewell) = request.farewell {
        agent.farewell = farewell;
    }
    if request.phone.is_some() {
        agent.phone = request.phone;
    }
    agent.updated_at = Utc::now();

    state.agents.update(&agent).await?;
    Ok(Json(agent))
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: AgentStatus,
}

/// `PATCH /api/v1/agents/:id/status`
pub async fn set_status(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<Value>, ApiError> {
    state.agents.set_status(&agent_id, request.status).await?;
    Ok(Json(json!({"agent_id": agent_id, "status": request.status})))
}

/// `DELETE /api/v1/agents/:id`
///
/// Cascades: the agent's documents, chunks and vector namespace go with
/// it.
pub async fn delete(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.agents.delete(&agent_id).await?;
    state.retriever.invalidate_all_caches();
    Ok(Json(json!({"deleted": true})))
}

/// `GET /api/v1/agents/validate/:id`
///
/// Reports phone conflicts without rejecting anything.
pub async fn validate(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let agent = state
        .agents
        .get(&agent_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("agent {agent_id}")))?;

    let conflicts = state.agents.phone_conflicts(&agent).await?;
    let valid = conflicts.is_empty();
    let mut body = json!({
        "valid": valid,
        "conflictingAgents": conflicts
            .iter()
            .map(|a| json!({"agentId": a.agent_id, "displayName": a.display_name}))
            .collect::<Vec<_>>(),
    });
    if !valid {
        body["warning"] = json!(format!(
            "{} active agent(s) share this phone number",
            conflicts.len()
        ));
    }
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct RouteByPhoneRequest {
    pub country_code: String,
    pub number: String,
}

/// `POST /api/v1/agents/route-by-phone`
pub async fn route_by_phone(
    State(state): State<AppState>,
    Json(request): Json<RouteByPhoneRequest>,
) -> Result<Json<Value>, ApiError> {
    let agent = state
        .agents
        .route_by_phone(&request.country_code, &request.number)
        .await?;
    match agent {
        Some(agent) => Ok(Json(json!({"matched": true, "agent": agent}))),
        None => Ok(Json(json!({"matched": false}))),
    }
}

#[derive(Debug, Deserialize)]
pub struct EnhancePromptRequest {
    pub prompt: String,
    #[serde(default)]
    pub persona_name: Option<String>,
}

/// `POST /api/v1/agents/enhance-prompt`
///
/// Rewrites a draft system prompt into a voice-ready one via the LLM.
pub async fn enhance_prompt(
    State(state): State<AppState>,
    Json(request): Json<EnhancePromptRequest>,
) -> Result<Json<Value>, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }

    let persona = request.persona_name.unwrap_or_else(|| "the agent".into());
    let generate = GenerateRequest::new(
        "You improve system prompts for real-time voice agents. Keep the rewritten \
         prompt concise, spoken-friendly and focused on short conversational answers. \
         Reply with the improved prompt only.",
    )
    .with_message(Message::user(format!(
        "Persona: {persona}\n\nDraft prompt:\n{}",
        request.prompt
    )))
    .with_max_tokens(512);

    let mut stream = state
        .llm
        .generate_stream(generate, Cancellation::new())
        .await
        .map_err(|e| ApiError::new(axum::http::StatusCode::BAD_GATEWAY, e.to_string()))?;

    let mut enhanced = String::new();
    while let Some(event) = stream.recv().await {
        match event {
            Ok(StreamEvent::Delta(delta)) => enhanced.push_str(&delta),
            Ok(StreamEvent::Done(_)) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(ApiError::new(
                    axum::http::StatusCode::BAD_GATEWAY,
                    e.to_string(),
                ))
            }
        }
    }

    Ok(Json(json!({"enhancedPrompt": enhanced.trim()})))
}
