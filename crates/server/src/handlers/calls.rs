//! Call routes and the SIP dispatch webhook.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use callbridge_persistence::{CallSessionRecord, SessionStatus};
use callbridge_telephony::{
    classify_participant, parse_room_name, OutboundCallRequest, ParticipantInfo,
};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRequest {
    pub organization_id: String,
    pub agent_id: String,
    pub phone_number: String,
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default)]
    pub ring_timeout: Option<u64>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// `POST /api/v1/calls/outbound`
pub async fn outbound(
    State(state): State<AppState>,
    Json(request): Json<OutboundRequest>,
) -> Result<Json<Value>, ApiError> {
    let agent = state
        .agents
        .get(&request.agent_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("agent {}", request.agent_id)))?;
    if agent.organization_id != request.organization_id {
        return Err(ApiError::bad_request(
            "agent does not belong to the organization",
        ));
    }

    let result = state
        .orchestrator
        .place_outbound_call(OutboundCallRequest {
            organization_id: request.organization_id.clone(),
            agent_id: request.agent_id.clone(),
            phone_number: request.phone_number.clone(),
            room_name: request.room_name,
            ring_timeout: request.ring_timeout.map(Duration::from_secs),
            metadata: request.metadata.clone(),
        })
        .await?;

    // Session row is created at initiate; the voice session updates it.
    let session = CallSessionRecord {
        session_id: result.call_id.clone(),
        organization_id: request.organization_id,
        agent_id: Some(request.agent_id),
        room_name: result.room_name.clone(),
        participant_identity: format!("sip_out_{}", result.call_id),
        call_type: "outbound".to_string(),
        status: SessionStatus::Active,
        started_at: result.initiated_at,
        ended_at: None,
        duration_seconds: None,
        caller_phone_number: None,
        destination_phone_number: Some(request.phone_number),
        call_sid: None,
        sip_participant_id: Some(result.sip_participant_id.clone()),
        call_direction: Some("outbound".to_string()),
        is_telephony: true,
        metadata: request.metadata.unwrap_or(Value::Null),
    };
    state.call_sessions.create(&session).await?;

    Ok(Json(json!({
        "success": true,
        "callId": result.call_id,
        "roomName": result.room_name,
        "sipParticipantId": result.sip_participant_id,
        "state": result.state,
        "initiatedAt": result.initiated_at,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListCallsQuery {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// `GET /api/v1/calls?agent_id=...|tenant_id=...`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListCallsQuery>,
) -> Result<Json<Value>, ApiError> {
    let sessions = match (&query.agent_id, &query.tenant_id) {
        (Some(agent_id), _) => state.call_sessions.list_by_agent(agent_id, query.limit).await?,
        (None, Some(tenant_id)) => {
            let mut sessions = Vec::new();
            for agent in state.agents.list_by_org(tenant_id).await? {
                sessions.extend(
                    state
                        .call_sessions
                        .list_by_agent(&agent.agent_id, query.limit)
                        .await?,
                );
            }
            sessions.sort_by_key(|s| std::cmp::Reverse(s.started_at));
            sessions.truncate(query.limit);
            sessions
        }
        (None, None) => {
            return Err(ApiError::bad_request(
                "agent_id or tenant_id query parameter is required",
            ))
        }
    };
    Ok(Json(json!({"calls": sessions, "count": sessions.len()})))
}

/// `GET /api/v1/calls/:session_id`
pub async fn get(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let stored = state.call_sessions.get(&session_id).await?;
    let live = state.orchestrator.active_call(&session_id);
    match (stored, live) {
        (Some(session), live) => Ok(Json(json!({
            "session": session,
            "live": live,
        }))),
        (None, Some(live)) => Ok(Json(json!({"session": Value::Null, "live": live}))),
        (None, None) => Err(ApiError::not_found(format!("call {session_id}"))),
    }
}

/// `GET /api/v1/calls/:session_id/transcript`
pub async fn transcript(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if state.call_sessions.get(&session_id).await?.is_none() {
        return Err(ApiError::not_found(format!("call {session_id}")));
    }
    let transcript = state.call_sessions.get_transcript(&session_id).await?;
    Ok(Json(json!({
        "sessionId": session_id,
        "transcript": transcript,
        "count": transcript.len(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct SipDispatchEvent {
    pub room_name: String,
    pub participant: ParticipantInfo,
}

/// `POST /api/v1/livekit/sip-dispatch`
///
/// The media plane asks which agent owns an incoming SIP call; the
/// answer is the agent-room binding. The participant is also registered
/// as an active call.
pub async fn sip_dispatch(
    State(state): State<AppState>,
    Json(event): Json<SipDispatchEvent>,
) -> Result<Json<Value>, ApiError> {
    let classification = classify_participant(&event.participant);

    // Route by destination number when present, else by room name. The
    // two-digit country split is a heuristic; room-name routing below is
    // the authoritative fallback.
    let agent = if let Some(telephony) = &classification.telephony {
        let destination = telephony.destination_phone_number.trim_start_matches('+');
        let (country_code, number) = destination.split_at(destination.len().min(2));
        state
            .agents
            .route_by_phone(&format!("+{country_code}"), number)
            .await?
    } else {
        None
    };
    let agent = match agent {
        Some(agent) => Some(agent),
        None => match parse_room_name(&event.room_name) {
            Some((_org, agent_id)) => state.agents.get(&agent_id).await?,
            None => None,
        },
    };
    let Some(agent) = agent else {
        return Err(ApiError::not_found("no agent for this dispatch"));
    };

    // An outbound leg joining its room means the callee answered.
    if classification.call_type == callbridge_telephony::CallType::Outbound {
        if let Some(active) = state.orchestrator.find_by_room(&event.room_name) {
            state.orchestrator.on_call_answered(&active.session_id)?;
            let handles = crate::runtime::start_voice_session(
                &state,
                &active.session_id,
                classification.call_type,
                &agent,
            )
            .await?;
            state
                .voice_sessions
                .insert(active.session_id.clone(), handles);
            return Ok(Json(json!({
                "sessionId": active.session_id,
                "agentId": agent.agent_id,
                "organizationId": agent.organization_id,
                "roomName": event.room_name,
                "callType": classification.call_type.as_str(),
            })));
        }
    }

    let (session_id, classification, _latency) = state
        .orchestrator
        .handle_participant_joined(&event.room_name, &event.participant)?;

    let telephony = classification.telephony.clone();
    let session = CallSessionRecord {
        session_id: session_id.clone(),
        organization_id: agent.organization_id.clone(),
        agent_id: Some(agent.agent_id.clone()),
        room_name: event.room_name.clone(),
        participant_identity: event.participant.identity.clone(),
        call_type: classification.call_type.as_str().to_string(),
        status: SessionStatus::Active,
        started_at: Utc::now(),
        ended_at: None,
        duration_seconds: None,
        caller_phone_number: telephony.as_ref().map(|t| t.caller_phone_number.clone()),
        destination_phone_number: telephony
            .as_ref()
            .map(|t| t.destination_phone_number.clone()),
        call_sid: telephony.as_ref().map(|t| t.call_sid.clone()),
        sip_participant_id: Some(event.participant.identity.clone()),
        call_direction: telephony.as_ref().map(|t| t.call_direction.clone()),
        is_telephony: classification.is_telephony,
        metadata: Value::Null,
    };
    state.call_sessions.create(&session).await?;

    // Attach the voice session; the transport glue picks up its audio
    // channels from the registry.
    let handles = crate::runtime::start_voice_session(
        &state,
        &session_id,
        classification.call_type,
        &agent,
    )
    .await?;
    state.voice_sessions.insert(session_id.clone(), handles);

    Ok(Json(json!({
        "sessionId": session_id,
        "agentId": agent.agent_id,
        "organizationId": agent.organization_id,
        "roomName": event.room_name,
        "callType": classification.call_type.as_str(),
    })))
}
