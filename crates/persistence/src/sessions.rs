//! Call session and transcript store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use callbridge_core::{EntryKind, Speaker, TranscriptEntry};

use crate::{PersistenceError, ScyllaClient};

/// Call session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "expired" => Self::Expired,
            _ => Self::Active,
        }
    }
}

/// One call session row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSessionRecord {
    pub session_id: String,
    pub organization_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub room_name: String,
    pub participant_identity: String,
    pub call_type: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sip_participant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_direction: Option<String>,
    pub is_telephony: bool,
    #[serde(default)]
    pub metadata: Value,
}

/// Call session operations.
#[async_trait]
pub trait CallSessionStore: Send + Sync {
    async fn create(&self, session: &CallSessionRecord) -> Result<(), PersistenceError>;
    async fn get(&self, session_id: &str)
        -> Result<Option<CallSessionRecord>, PersistenceError>;
    async fn list_by_agent(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<CallSessionRecord>, PersistenceError>;

    /// Terminal update: sets ended_at and the floor-computed duration.
    async fn end_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError>;

    /// Append-only transcript write (batch at session end).
    async fn store_transcript(
        &self,
        session_id: &str,
        entries: &[TranscriptEntry],
    ) -> Result<(), PersistenceError>;

    async fn get_transcript(
        &self,
        session_id: &str,
    ) -> Result<Vec<TranscriptEntry>, PersistenceError>;
}

/// Scylla implementation.
pub struct ScyllaCallSessionStore {
    client: ScyllaClient,
}

/// Typed row; the 17-column shape outgrows the tuple impls, so both
/// directions use derives.
#[derive(scylla::FromRow, scylla::SerializeRow)]
struct SessionRow {
    session_id: String,
    organization_id: String,
    agent_id: Option<String>,
    room_name: String,
    participant_identity: String,
    call_type: String,
    status: String,
    started_at: i64,
    ended_at: Option<i64>,
    duration_seconds: Option<i64>,
    caller_phone_number: Option<String>,
    destination_phone_number: Option<String>,
    call_sid: Option<String>,
    sip_participant_id: Option<String>,
    call_direction: Option<String>,
    is_telephony: bool,
    metadata_json: Option<String>,
}

impl From<&CallSessionRecord> for SessionRow {
    fn from(record: &CallSessionRecord) -> Self {
        Self {
            session_id: record.session_id.clone(),
            organization_id: record.organization_id.clone(),
            agent_id: record.agent_id.clone(),
            room_name: record.room_name.clone(),
            participant_identity: record.participant_identity.clone(),
            call_type: record.call_type.clone(),
            status: record.status.as_str().to_string(),
            started_at: record.started_at.timestamp_millis(),
            ended_at: record.ended_at.map(|t| t.timestamp_millis()),
            duration_seconds: record.duration_seconds,
            caller_phone_number: record.caller_phone_number.clone(),
            destination_phone_number: record.destination_phone_number.clone(),
            call_sid: record.call_sid.clone(),
            sip_participant_id: record.sip_participant_id.clone(),
            call_direction: record.call_direction.clone(),
            is_telephony: record.is_telephony,
            metadata_json: serde_json::to_string(&record.metadata).ok(),
        }
    }
}

impl From<SessionRow> for CallSessionRecord {
    fn from(row: SessionRow) -> Self {
        Self {
            session_id: row.session_id,
            organization_id: row.organization_id,
            agent_id: row.agent_id,
            room_name: row.room_name,
            participant_identity: row.participant_identity,
            call_type: row.call_type,
            status: SessionStatus::parse(&row.status),
            started_at: DateTime::from_timestamp_millis(row.started_at)
                .unwrap_or_else(Utc::now),
            ended_at: row.ended_at.and_then(DateTime::from_timestamp_millis),
            duration_seconds: row.duration_seconds,
            caller_phone_number: row.caller_phone_number,
            destination_phone_number: row.destination_phone_number,
            call_sid: row.call_sid,
            sip_participant_id: row.sip_participant_id,
            call_direction: row.call_direction,
            is_telephony: row.is_telephony,
            metadata: row
                .metadata_json
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(Value::Null),
        }
    }
}

impl ScyllaCallSessionStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    const COLUMNS: &'static str = "session_id, organization_id, agent_id, room_name, \
        participant_identity, call_type, status, started_at, ended_at, duration_seconds, \
        caller_phone_number, destination_phone_number, call_sid, sip_participant_id, \
        call_direction, is_telephony, metadata_json";
}

#[async_trait]
impl CallSessionStore for ScyllaCallSessionStore {
    async fn create(&self, session: &CallSessionRecord) -> Result<(), PersistenceError> {
        let insert = format!(
            "INSERT INTO {}.call_sessions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace(),
            Self::COLUMNS
        );
        let row = SessionRow::from(session);
        self.client.session().query_unpaged(insert, &row).await?;

        if let Some(agent_id) = &session.agent_id {
            let index = format!(
                "INSERT INTO {}.sessions_by_agent (agent_id, started_at, session_id)
                 VALUES (?, ?, ?)",
                self.client.keyspace()
            );
            self.client
                .session()
                .query_unpaged(
                    index,
                    (
                        agent_id,
                        session.started_at.timestamp_millis(),
                        &session.session_id,
                    ),
                )
                .await?;
        }
        Ok(())
    }

    async fn get(
        &self,
        session_id: &str,
    ) -> Result<Option<CallSessionRecord>, PersistenceError> {
        let query = format!(
            "SELECT {} FROM {}.call_sessions WHERE session_id = ?",
            Self::COLUMNS,
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (session_id,))
            .await?;
        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                let typed: SessionRow = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                return Ok(Some(typed.into()));
            }
        }
        Ok(None)
    }

    async fn list_by_agent(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<CallSessionRecord>, PersistenceError> {
        let lookup = format!(
            "SELECT session_id FROM {}.sessions_by_agent WHERE agent_id = ? LIMIT ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(lookup, (agent_id, limit as i32))
            .await?;

        let mut sessions = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (session_id,): (String,) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                if let Some(session) = self.get(&session_id).await? {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }

    async fn end_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let Some(session) = self.get(session_id).await? else {
            return Err(PersistenceError::NotFound(session_id.to_string()));
        };
        // duration = floor((end - start) / 1000), per the session
        // invariant.
        let duration_seconds =
            (ended_at.timestamp_millis() - session.started_at.timestamp_millis()) / 1000;

        let update = format!(
            "UPDATE {}.call_sessions
             SET status = ?, ended_at = ?, duration_seconds = ?
             WHERE session_id = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(
                update,
                (
                    status.as_str(),
                    ended_at.timestamp_millis(),
                    duration_seconds,
                    session_id,
                ),
            )
            .await?;
        Ok(())
    }

    async fn store_transcript(
        &self,
        session_id: &str,
        entries: &[TranscriptEntry],
    ) -> Result<(), PersistenceError> {
        let insert = format!(
            "INSERT INTO {}.transcripts
             (session_id, seq, ts, speaker, text, kind, latency_ms, confidence, function_name)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        );
        for (seq, entry) in entries.iter().enumerate() {
            let speaker = match entry.speaker {
                Speaker::User => "user",
                Speaker::Agent => "agent",
                Speaker::System => "system",
            };
            let kind = match entry.kind {
                EntryKind::Speech => "speech",
                EntryKind::FunctionCall => "function_call",
                EntryKind::FunctionResult => "function_result",
            };
            self.client
                .session()
                .query_unpaged(
                    insert.clone(),
                    (
                        session_id,
                        seq as i32,
                        entry.timestamp.timestamp_millis(),
                        speaker,
                        &entry.text,
                        kind,
                        entry.latency_ms.map(|v| v as i64),
                        entry.confidence.map(|v| v as f64),
                        &entry.function_name,
                    ),
                )
                .await?;
        }
        Ok(())
    }

    async fn get_transcript(
        &self,
        session_id: &str,
    ) -> Result<Vec<TranscriptEntry>, PersistenceError> {
        let query = format!(
            "SELECT ts, speaker, text, kind, latency_ms, confidence, function_name
             FROM {}.transcripts WHERE session_id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (session_id,))
            .await?;

        let mut entries = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (ts, speaker, text, kind, latency_ms, confidence, function_name): (
                    i64,
                    String,
                    String,
                    String,
                    Option<i64>,
                    Option<f64>,
                    Option<String>,
                ) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                entries.push(TranscriptEntry {
                    timestamp: DateTime::from_timestamp_millis(ts).unwrap_or_else(Utc::now),
                    speaker: match speaker.as_str() {
                        "agent" => Speaker::Agent,
                        "system" => Speaker::System,
                        _ => Speaker::User,
                    },
                    text,
                    kind: match kind.as_str() {
                        "function_call" => EntryKind::FunctionCall,
                        "function_result" => EntryKind::FunctionResult,
                        _ => EntryKind::Speech,
                    },
                    latency_ms: latency_ms.map(|v| v as u64),
                    confidence: confidence.map(|v| v as f32),
                    function_name,
                });
            }
        }
        Ok(entries)
    }
}
