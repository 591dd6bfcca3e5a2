//! In-memory store implementations.
//!
//! Used when the server runs without a database (development mode) and by
//! the server tests. Same trait surface as the Scylla stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use callbridge_core::TranscriptEntry;
use callbridge_ingest::{
    ChunkDraft, DocumentRecord, IngestError, IngestStore, IngestionSession, TombstoneRecord,
};
use callbridge_integrations::IntegrationBinding;
use callbridge_rag::ChunkRecord;

use crate::{
    AgentRecord, AgentStatus, AgentStore, CallMetricRecord, CallSessionRecord, CallSessionStore,
    IntegrationStore, MetricType, MetricsStore, Organization, OrganizationStore,
    PersistenceError, SessionStatus,
};

/// In-memory organization store.
#[derive(Default)]
pub struct MemoryOrganizationStore {
    by_id: Mutex<HashMap<String, Organization>>,
}

#[async_trait]
impl OrganizationStore for MemoryOrganizationStore {
    async fn create(&self, organization: &Organization) -> Result<(), PersistenceError> {
        let mut by_id = self.by_id.lock();
        if by_id.values().any(|o| o.slug == organization.slug) {
            return Err(PersistenceError::Conflict(format!(
                "slug {} already exists",
                organization.slug
            )));
        }
        by_id.insert(organization.organization_id.clone(), organization.clone());
        Ok(())
    }

    async fn get(&self, organization_id: &str) -> Result<Option<Organization>, PersistenceError> {
        Ok(self.by_id.lock().get(organization_id).cloned())
    }

    async fn get_by_slug(&self, slug: &str) -> Result<Option<Organization>, PersistenceError> {
        Ok(self
            .by_id
            .lock()
            .values()
            .find(|o| o.slug == slug)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Organization>, PersistenceError> {
        Ok(self.by_id.lock().values().cloned().collect())
    }
}

/// In-memory agent store.
#[derive(Default)]
pub struct MemoryAgentStore {
    by_id: Mutex<HashMap<String, AgentRecord>>,
}

#[async_trait]
impl AgentStore for MemoryAgentStore {
    async fn create(&self, agent: &AgentRecord) -> Result<(), PersistenceError> {
        self.by_id
            .lock()
            .insert(agent.agent_id.clone(), agent.clone());
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>, PersistenceError> {
        Ok(self.by_id.lock().get(agent_id).cloned())
    }

    async fn list_by_org(
        &self,
        organization_id: &str,
    ) -> Result<Vec<AgentRecord>, PersistenceError> {
        Ok(self
            .by_id
            .lock()
            .values()
            .filter(|a| a.organization_id == organization_id)
            .cloned()
            .collect())
    }

    async fn update(&self, agent: &AgentRecord) -> Result<(), PersistenceError> {
        self.by_id
            .lock()
            .insert(agent.agent_id.clone(), agent.clone());
        Ok(())
    }

    async fn set_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<(), PersistenceError> {
        let mut by_id = self.by_id.lock();
        match by_id.get_mut(agent_id) {
            Some(agent) => {
                agent.status = status;
                agent.updated_at = Utc::now();
                Ok(())
            }
            None => Err(PersistenceError::NotFound(agent_id.to_string())),
        }
    }

    async fn delete(&self, agent_id: &str) -> Result<(), PersistenceError> {
        self.by_id
            .lock()
            .remove(agent_id)
            .map(|_| ())
            .ok_or_else(|| PersistenceError::NotFound(agent_id.to_string()))
    }

    async fn increment_calls(&self, agent_id: &str) -> Result<(), PersistenceError> {
        if let Some(agent) = self.by_id.lock().get_mut(agent_id) {
            agent.number_of_calls += 1;
        }
        Ok(())
    }

    async fn find_by_phone(
        &self,
        country_code: &str,
        number: &str,
    ) -> Result<Vec<AgentRecord>, PersistenceError> {
        Ok(self
            .by_id
            .lock()
            .values()
            .filter(|a| {
                a.phone
                    .as_ref()
                    .map(|p| p.country_code == country_code && p.number == number)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }
}

/// In-memory call session store.
#[derive(Default)]
pub struct MemoryCallSessionStore {
    sessions: Mutex<HashMap<String, CallSessionRecord>>,
    transcripts: Mutex<HashMap<String, Vec<TranscriptEntry>>>,
}

#[async_trait]
impl CallSessionStore for MemoryCallSessionStore {
    async fn create(&self, session: &CallSessionRecord) -> Result<(), PersistenceError> {
        self.sessions
            .lock()
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn get(
        &self,
        session_id: &str,
    ) -> Result<Option<CallSessionRecord>, PersistenceError> {
        Ok(self.sessions.lock().get(session_id).cloned())
    }

    async fn list_by_agent(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<CallSessionRecord>, PersistenceError> {
        let mut sessions: Vec<CallSessionRecord> = self
            .sessions
            .lock()
            .values()
            .filter(|s| s.agent_id.as_deref() == Some(agent_id))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.started_at));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn end_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| PersistenceError::NotFound(session_id.to_string()))?;
        session.status = status;
        session.ended_at = Some(ended_at);
        session.duration_seconds = Some(
            (ended_at.timestamp_millis() - session.started_at.timestamp_millis()) / 1000,
        );
        Ok(())
    }

    async fn store_transcript(
        &self,
        session_id: &str,
        entries: &[TranscriptEntry],
    ) -> Result<(), PersistenceError> {
        self.transcripts
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .extend(entries.iter().cloned());
        Ok(())
    }

    async fn get_transcript(
        &self,
        session_id: &str,
    ) -> Result<Vec<TranscriptEntry>, PersistenceError> {
        Ok(self
            .transcripts
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// In-memory metrics store.
#[derive(Default)]
pub struct MemoryMetricsStore {
    rows: Mutex<Vec<CallMetricRecord>>,
}

#[async_trait]
impl MetricsStore for MemoryMetricsStore {
    async fn record_batch(&self, metrics: &[CallMetricRecord]) -> Result<(), PersistenceError> {
        self.rows.lock().extend(metrics.iter().cloned());
        Ok(())
    }

    async fn query_window(
        &self,
        agent_id: &str,
        metric_type: MetricType,
        since: DateTime<Utc>,
    ) -> Result<Vec<CallMetricRecord>, PersistenceError> {
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|m| {
                m.agent_id.as_deref() == Some(agent_id)
                    && m.metric_type == metric_type
                    && m.timestamp >= since
            })
            .cloned()
            .collect())
    }
}

/// In-memory integration store.
#[derive(Default)]
pub struct MemoryIntegrationStore {
    bindings: Mutex<HashMap<String, IntegrationBinding>>,
}

#[async_trait]
impl IntegrationStore for MemoryIntegrationStore {
    async fn upsert(&self, binding: &IntegrationBinding) -> Result<(), PersistenceError> {
        self.bindings
            .lock()
            .insert(binding.integration_id.clone(), binding.clone());
        Ok(())
    }

    async fn list_by_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<IntegrationBinding>, PersistenceError> {
        Ok(self
            .bindings
            .lock()
            .values()
            .filter(|b| b.agent_id == agent_id)
            .cloned()
            .collect())
    }

    async fn delete(
        &self,
        _agent_id: &str,
        integration_id: &str,
    ) -> Result<(), PersistenceError> {
        self.bindings.lock().remove(integration_id);
        Ok(())
    }
}

/// In-memory ingest store (sessions, documents, chunks, tombstones).
#[derive(Default)]
pub struct MemoryIngestStore {
    sessions: Mutex<HashMap<String, IngestionSession>>,
    documents: Mutex<HashMap<String, DocumentRecord>>,
    chunks: Mutex<HashMap<String, Vec<(ChunkDraft, String)>>>,
    tombstones: Mutex<HashMap<String, TombstoneRecord>>,
}

impl MemoryIngestStore {
    /// Chunk rows shaped for analytics.
    pub fn chunks_for_agent(&self, agent_id: &str) -> Vec<ChunkRecord> {
        let documents = self.documents.lock();
        let chunks = self.chunks.lock();
        let mut records = Vec::new();
        for (document_id, drafts) in chunks.iter() {
            let owned = documents
                .get(document_id)
                .map(|d| d.agent_id == agent_id)
                .unwrap_or(false);
            if !owned {
                continue;
            }
            for (draft, rag_id) in drafts {
                records.push(ChunkRecord {
                    chunk_id: rag_id.clone(),
                    document_id: document_id.clone(),
                    token_count: draft.token_count,
                    content_type: draft.content_type.as_str().to_string(),
                    quality_score: draft.quality_score,
                    access_count: 0,
                    section_title: draft.section_title.clone(),
                    last_accessed_at: None,
                });
            }
        }
        records
    }
}

#[async_trait]
impl IngestStore for MemoryIngestStore {
    async fn save_session(&self, session: &IngestionSession) -> Result<(), IngestError> {
        self.sessions
            .lock()
            .insert(session.session_id.clone(), session.clone());
        Ok(())
    }

    async fn load_session(
        &self,
        session_id: &str,
    ) -> Result<Option<IngestionSession>, IngestError> {
        Ok(self.sessions.lock().get(session_id).cloned())
    }

    async fn create_document(&self, document: &DocumentRecord) -> Result<(), IngestError> {
        self.documents
            .lock()
            .insert(document.document_id.clone(), document.clone());
        Ok(())
    }

    async fn get_document(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>, IngestError> {
        Ok(self.documents.lock().get(document_id).cloned())
    }

    async fn update_document(&self, document: &DocumentRecord) -> Result<(), IngestError> {
        self.create_document(document).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), IngestError> {
        self.documents.lock().remove(document_id);
        Ok(())
    }

    async fn store_chunks(
        &self,
        document_id: &str,
        _agent_id: &str,
        chunks: &[ChunkDraft],
        rag_ids: &[String],
    ) -> Result<(), IngestError> {
        self.chunks.lock().insert(
            document_id.to_string(),
            chunks
                .iter()
                .cloned()
                .zip(rag_ids.iter().cloned())
                .collect(),
        );
        Ok(())
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<(), IngestError> {
        self.chunks.lock().remove(document_id);
        Ok(())
    }

    async fn save_tombstone(&self, tombstone: &TombstoneRecord) -> Result<(), IngestError> {
        self.tombstones
            .lock()
            .insert(tombstone.document_id.clone(), tombstone.clone());
        Ok(())
    }

    async fn load_tombstone(
        &self,
        document_id: &str,
    ) -> Result<Option<TombstoneRecord>, IngestError> {
        Ok(self.tombstones.lock().get(document_id).cloned())
    }

    async fn list_due_tombstones(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TombstoneRecord>, IngestError> {
        Ok(self
            .tombstones
            .lock()
            .values()
            .filter(|t| !t.is_purged && t.is_past_purge(now))
            .cloned()
            .collect())
    }

    async fn delete_tombstone(&self, document_id: &str) -> Result<(), IngestError> {
        self.tombstones.lock().remove(document_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn organization(slug: &str) -> Organization {
        Organization {
            organization_id: format!("org-{slug}"),
            slug: slug.to_string(),
            name: slug.to_string(),
            status: Default::default(),
            config: Value::Null,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn slug_round_trip_and_conflict() {
        let store = MemoryOrganizationStore::default();
        store.create(&organization("acme")).await.unwrap();

        // createOrg; getOrgBySlug(slug) returns the same entity.
        let fetched = store.get_by_slug("acme").await.unwrap().unwrap();
        assert_eq!(fetched.organization_id, "org-acme");

        // Duplicate slug conflicts.
        assert!(matches!(
            store.create(&organization("acme")).await,
            Err(PersistenceError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn phone_conflict_reporting() {
        let store = MemoryAgentStore::default();
        let phone = crate::PhoneAssignment {
            country_code: "+91".into(),
            number: "9876543210".into(),
            location: None,
        };
        let mut first = agent("a1");
        first.phone = Some(phone.clone());
        let mut second = agent("a2");
        second.phone = Some(phone);
        store.create(&first).await.unwrap();
        store.create(&second).await.unwrap();

        let conflicts = store.phone_conflicts(&first).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].agent_id, "a2");

        // Inactive agents do not conflict.
        store.set_status("a2", AgentStatus::Inactive).await.unwrap();
        assert!(store.phone_conflicts(&first).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn phone_routing_prefers_oldest_active() {
        let store = MemoryAgentStore::default();
        let phone = crate::PhoneAssignment {
            country_code: "+91".into(),
            number: "9876543210".into(),
            location: None,
        };
        let mut older = agent("older");
        older.phone = Some(phone.clone());
        older.created_at = Utc::now() - chrono::Duration::days(2);
        let mut newer = agent("newer");
        newer.phone = Some(phone);
        store.create(&newer).await.unwrap();
        store.create(&older).await.unwrap();

        let routed = store
            .route_by_phone("+91", "9876543210")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(routed.agent_id, "older");
    }

    #[tokio::test]
    async fn session_duration_floors_millis() {
        let store = MemoryCallSessionStore::default();
        let started_at = Utc::now();
        let session = CallSessionRecord {
            session_id: "s1".into(),
            organization_id: "o1".into(),
            agent_id: Some("a1".into()),
            room_name: "r1".into(),
            participant_identity: "p1".into(),
            call_type: "inbound".into(),
            status: SessionStatus::Active,
            started_at,
            ended_at: None,
            duration_seconds: None,
            caller_phone_number: None,
            destination_phone_number: None,
            call_sid: None,
            sip_participant_id: None,
            call_direction: None,
            is_telephony: true,
            metadata: Value::Null,
        };
        store.create(&session).await.unwrap();

        let ended_at = started_at + chrono::Duration::milliseconds(2999);
        store
            .end_session("s1", SessionStatus::Completed, ended_at)
            .await
            .unwrap();
        let stored = store.get("s1").await.unwrap().unwrap();
        assert_eq!(stored.duration_seconds, Some(2));
        assert!(stored.ended_at.unwrap() >= stored.started_at);
    }

    fn agent(id: &str) -> AgentRecord {
        AgentRecord {
            agent_id: id.to_string(),
            organization_id: "o1".into(),
            display_name: id.to_string(),
            persona_name: id.to_string(),
            language: "en-US".into(),
            voice_id: "default".into(),
            system_prompt: "Be helpful.".into(),
            greeting: None,
            farewell: "Bye".into(),
            phone: None,
            status: AgentStatus::Active,
            number_of_calls: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
