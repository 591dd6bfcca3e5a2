//! Document, chunk and ingestion-session store.
//!
//! Implements the ingestion pipeline's store port. Sessions, documents
//! and tombstones are stored as JSON payloads keyed by id (their shape
//! belongs to the ingest crate); chunks get typed columns because the
//! analytics queries read them field by field.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use callbridge_ingest::{
    ChunkDraft, DocumentRecord, IngestError, IngestStore, IngestionSession, TombstoneRecord,
};
use callbridge_rag::ChunkRecord;

use crate::{PersistenceError, ScyllaClient};

/// Scylla-backed ingest store.
pub struct ScyllaIngestStore {
    client: ScyllaClient,
}

impl ScyllaIngestStore {
    pub fn new(client: ScyllaClient) -> Self {
        Self { client }
    }

    /// Chunk rows for a namespace, shaped for analytics.
    pub async fn chunks_for_agent(
        &self,
        agent_id: &str,
    ) -> Result<Vec<ChunkRecord>, PersistenceError> {
        let lookup = format!(
            "SELECT chunk_id, document_id, chunk_index FROM {}.chunks_by_agent WHERE agent_id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(lookup, (agent_id,))
            .await?;

        let mut records = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (chunk_id, document_id, chunk_index): (String, String, i32) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                if let Some(record) = self.read_chunk(&document_id, chunk_index).await? {
                    records.push(record);
                    continue;
                }
                tracing::debug!(%chunk_id, "Chunk index entry without a chunk row");
            }
        }
        Ok(records)
    }

    async fn read_chunk(
        &self,
        document_id: &str,
        chunk_index: i32,
    ) -> Result<Option<ChunkRecord>, PersistenceError> {
        let query = format!(
            "SELECT chunk_id, token_count, section_title, content_type, quality_score,
                    access_count, last_accessed_at
             FROM {}.chunks WHERE document_id = ? AND chunk_index = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (document_id, chunk_index))
            .await?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                let (
                    chunk_id,
                    token_count,
                    section_title,
                    content_type,
                    quality_score,
                    access_count,
                    last_accessed_at,
                ): (String, i32, Option<String>, String, f64, Option<i64>, Option<i64>) = row
                    .into_typed()
                    .map_err(|e| PersistenceError::InvalidData(e.to_string()))?;
                return Ok(Some(ChunkRecord {
                    chunk_id,
                    document_id: document_id.to_string(),
                    token_count: token_count as usize,
                    content_type,
                    quality_score: quality_score as f32,
                    access_count: access_count.unwrap_or(0) as u64,
                    section_title,
                    last_accessed_at: last_accessed_at.and_then(DateTime::from_timestamp_millis),
                }));
            }
        }
        Ok(None)
    }

    /// Bump access counters for retrieved chunks.
    pub async fn record_chunk_access(
        &self,
        document_id: &str,
        chunk_index: i32,
    ) -> Result<(), PersistenceError> {
        if let Some(record) = self.read_chunk(document_id, chunk_index).await? {
            let update = format!(
                "UPDATE {}.chunks SET access_count = ?, last_accessed_at = ?
                 WHERE document_id = ? AND chunk_index = ?",
                self.client.keyspace()
            );
            self.client
                .session()
                .query_unpaged(
                    update,
                    (
                        (record.access_count + 1) as i64,
                        Utc::now().timestamp_millis(),
                        document_id,
                        chunk_index,
                    ),
                )
                .await?;
        }
        Ok(())
    }

    async fn payload_get<T: serde::de::DeserializeOwned>(
        &self,
        table: &str,
        id_column: &str,
        id: &str,
    ) -> Result<Option<T>, IngestError> {
        let query = format!(
            "SELECT payload_json FROM {}.{table} WHERE {id_column} = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, (id,))
            .await
            .map_err(|e| IngestError::Store(e.to_string()))?;

        if let Some(rows) = result.rows {
            if let Some(row) = rows.into_iter().next() {
                let (payload,): (String,) = row
                    .into_typed()
                    .map_err(|e| IngestError::Store(e.to_string()))?;
                let value =
                    serde_json::from_str(&payload).map_err(|e| IngestError::Store(e.to_string()))?;
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl IngestStore for ScyllaIngestStore {
    async fn save_session(&self, session: &IngestionSession) -> Result<(), IngestError> {
        let insert = format!(
            "INSERT INTO {}.ingestion_sessions (session_id, payload_json, stage, agent_id, created_at)
             VALUES (?, ?, ?, ?, ?)",
            self.client.keyspace()
        );
        let payload =
            serde_json::to_string(session).map_err(|e| IngestError::Store(e.to_string()))?;
        self.client
            .session()
            .query_unpaged(
                insert,
                (
                    &session.session_id,
                    payload,
                    session.stage.as_str(),
                    &session.agent_id,
                    session.created_at.timestamp_millis(),
                ),
            )
            .await
            .map_err(|e| IngestError::Store(e.to_string()))?;
        Ok(())
    }

    async fn load_session(
        &self,
        session_id: &str,
    ) -> Result<Option<IngestionSession>, IngestError> {
        self.payload_get("ingestion_sessions", "session_id", session_id)
            .await
    }

    async fn create_document(&self, document: &DocumentRecord) -> Result<(), IngestError> {
        let insert = format!(
            "INSERT INTO {}.documents (document_id, payload_json, agent_id, status, uploaded_at)
             VALUES (?, ?, ?, ?, ?)",
            self.client.keyspace()
        );
        let payload =
            serde_json::to_string(document).map_err(|e| IngestError::Store(e.to_string()))?;
        self.client
            .session()
            .query_unpaged(
                insert,
                (
                    &document.document_id,
                    payload,
                    &document.agent_id,
                    &document.status,
                    document.uploaded_at.timestamp_millis(),
                ),
            )
            .await
            .map_err(|e| IngestError::Store(e.to_string()))?;

        let index = format!(
            "INSERT INTO {}.documents_by_agent (agent_id, document_id) VALUES (?, ?)",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(index, (&document.agent_id, &document.document_id))
            .await
            .map_err(|e| IngestError::Store(e.to_string()))?;
        Ok(())
    }

    async fn get_document(
        &self,
        document_id: &str,
    ) -> Result<Option<DocumentRecord>, IngestError> {
        self.payload_get("documents", "document_id", document_id)
            .await
    }

    async fn update_document(&self, document: &DocumentRecord) -> Result<(), IngestError> {
        self.create_document(document).await
    }

    async fn delete_document(&self, document_id: &str) -> Result<(), IngestError> {
        let agent_id = self
            .get_document(document_id)
            .await?
            .map(|d| d.agent_id);

        let delete = format!(
            "DELETE FROM {}.documents WHERE document_id = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(delete, (document_id,))
            .await
            .map_err(|e| IngestError::Store(e.to_string()))?;

        if let Some(agent_id) = agent_id {
            let delete_index = format!(
                "DELETE FROM {}.documents_by_agent WHERE agent_id = ? AND document_id = ?",
                self.client.keyspace()
            );
            self.client
                .session()
                .query_unpaged(delete_index, (&agent_id, document_id))
                .await
                .map_err(|e| IngestError::Store(e.to_string()))?;
        }
        Ok(())
    }

    async fn store_chunks(
        &self,
        document_id: &str,
        agent_id: &str,
        chunks: &[ChunkDraft],
        rag_ids: &[String],
    ) -> Result<(), IngestError> {
        let insert = format!(
            "INSERT INTO {}.chunks
             (document_id, chunk_index, chunk_id, agent_id, text, token_count, page_number,
              section_title, section_path_json, content_type, quality_score, access_count,
              last_accessed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.client.keyspace()
        );
        let index = format!(
            "INSERT INTO {}.chunks_by_agent (agent_id, chunk_id, document_id, chunk_index)
             VALUES (?, ?, ?, ?)",
            self.client.keyspace()
        );

        for (chunk, rag_id) in chunks.iter().zip(rag_ids.iter()) {
            let section_path_json = serde_json::to_string(&chunk.section_path)
                .map_err(|e| IngestError::Store(e.to_string()))?;
            self.client
                .session()
                .query_unpaged(
                    insert.clone(),
                    (
                        document_id,
                        chunk.chunk_index as i32,
                        rag_id,
                        agent_id,
                        &chunk.text,
                        chunk.token_count as i32,
                        chunk.page_number.map(|p| p as i32),
                        &chunk.section_title,
                        section_path_json,
                        chunk.content_type.as_str(),
                        chunk.quality_score as f64,
                        0i64,
                        None::<i64>,
                    ),
                )
                .await
                .map_err(|e| IngestError::Store(e.to_string()))?;

            self.client
                .session()
                .query_unpaged(
                    index.clone(),
                    (agent_id, rag_id, document_id, chunk.chunk_index as i32),
                )
                .await
                .map_err(|e| IngestError::Store(e.to_string()))?;
        }
        Ok(())
    }

    async fn delete_chunks(&self, document_id: &str) -> Result<(), IngestError> {
        // Index rows first, then the partition.
        let select = format!(
            "SELECT agent_id, chunk_id FROM {}.chunks WHERE document_id = ?",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(select, (document_id,))
            .await
            .map_err(|e| IngestError::Store(e.to_string()))?;

        if let Some(rows) = result.rows {
            let delete_index = format!(
                "DELETE FROM {}.chunks_by_agent WHERE agent_id = ? AND chunk_id = ?",
                self.client.keyspace()
            );
            for row in rows {
                let (agent_id, chunk_id): (String, String) = row
                    .into_typed()
                    .map_err(|e| IngestError::Store(e.to_string()))?;
                self.client
                    .session()
                    .query_unpaged(delete_index.clone(), (&agent_id, &chunk_id))
                    .await
                    .map_err(|e| IngestError::Store(e.to_string()))?;
            }
        }

        let delete = format!(
            "DELETE FROM {}.chunks WHERE document_id = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(delete, (document_id,))
            .await
            .map_err(|e| IngestError::Store(e.to_string()))?;
        Ok(())
    }

    async fn save_tombstone(&self, tombstone: &TombstoneRecord) -> Result<(), IngestError> {
        let insert = format!(
            "INSERT INTO {}.deleted_documents (document_id, payload_json, purge_at, is_purged)
             VALUES (?, ?, ?, ?)",
            self.client.keyspace()
        );
        let payload =
            serde_json::to_string(tombstone).map_err(|e| IngestError::Store(e.to_string()))?;
        self.client
            .session()
            .query_unpaged(
                insert,
                (
                    &tombstone.document_id,
                    payload,
                    tombstone.purge_at.timestamp_millis(),
                    tombstone.is_purged,
                ),
            )
            .await
            .map_err(|e| IngestError::Store(e.to_string()))?;
        Ok(())
    }

    async fn load_tombstone(
        &self,
        document_id: &str,
    ) -> Result<Option<TombstoneRecord>, IngestError> {
        self.payload_get("deleted_documents", "document_id", document_id)
            .await
    }

    async fn list_due_tombstones(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<TombstoneRecord>, IngestError> {
        let query = format!(
            "SELECT payload_json FROM {}.deleted_documents",
            self.client.keyspace()
        );
        let result = self
            .client
            .session()
            .query_unpaged(query, &[])
            .await
            .map_err(|e| IngestError::Store(e.to_string()))?;

        let mut due = Vec::new();
        if let Some(rows) = result.rows {
            for row in rows {
                let (payload,): (String,) = row
                    .into_typed()
                    .map_err(|e| IngestError::Store(e.to_string()))?;
                let tombstone: TombstoneRecord = serde_json::from_str(&payload)
                    .map_err(|e| IngestError::Store(e.to_string()))?;
                if !tombstone.is_purged && tombstone.is_past_purge(now) {
                    due.push(tombstone);
                }
            }
        }
        Ok(due)
    }

    async fn delete_tombstone(&self, document_id: &str) -> Result<(), IngestError> {
        let delete = format!(
            "DELETE FROM {}.deleted_documents WHERE document_id = ?",
            self.client.keyspace()
        );
        self.client
            .session()
            .query_unpaged(delete, (document_id,))
            .await
            .map_err(|e| IngestError::Store(e.to_string()))?;
        Ok(())
    }
}
