//! Soft delete, recovery and retention crons.
//!
//! Deleting a document writes a tombstone with `purge_at = now + 30d` and
//! flips its vectors out of retrieval; until purge the document is fully
//! recoverable. An hourly cron purges due tombstones for real; a daily
//! cron expires ingestion sessions stuck below `completed` past their
//! TTL.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use crate::pipeline::{IngestStore, IngestionPipeline, VectorSink};
use crate::session::TombstoneRecord;
use crate::IngestError;

/// Retention and soft-delete operations.
pub struct RetentionService {
    store: Arc<dyn IngestStore>,
    vectors: Arc<dyn VectorSink>,
    pipeline: Arc<IngestionPipeline>,
}

impl RetentionService {
    pub fn new(
        store: Arc<dyn IngestStore>,
        vectors: Arc<dyn VectorSink>,
        pipeline: Arc<IngestionPipeline>,
    ) -> Self {
        Self {
            store,
            vectors,
            pipeline,
        }
    }

    /// Soft-delete a document: tombstone plus retrieval filtering. The
    /// chunks and vectors stay in place until purge.
    pub async fn soft_delete(
        &self,
        document_id: &str,
        reason: Option<String>,
    ) -> Result<TombstoneRecord, IngestError> {
        let document = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(document_id.to_string()))?;

        if let Some(existing) = self.store.load_tombstone(document_id).await? {
            // Repeat delete is a no-op.
            return Ok(existing);
        }

        let tombstone = TombstoneRecord::new(&document, reason);
        self.store.save_tombstone(&tombstone).await?;
        self.vectors
            .set_document_live(&document.agent_id, document_id, false)
            .await?;

        metrics::counter!("callbridge_documents_soft_deleted").increment(1);
        tracing::info!(
            document_id,
            purge_at = %tombstone.purge_at,
            "Document soft-deleted"
        );
        Ok(tombstone)
    }

    /// Recover a soft-deleted document before its purge deadline.
    pub async fn recover(&self, document_id: &str) -> Result<(), IngestError> {
        let tombstone = self
            .store
            .load_tombstone(document_id)
            .await?
            .ok_or_else(|| IngestError::NotFound(document_id.to_string()))?;

        if tombstone.is_purged || tombstone.is_past_purge(Utc::now()) {
            return Err(IngestError::AlreadyPurged);
        }

        self.vectors
            .set_document_live(&tombstone.agent_id, document_id, true)
            .await?;
        self.store.delete_tombstone(document_id).await?;

        tracing::info!(document_id, "Document recovered");
        Ok(())
    }

    /// Purge tombstones past their deadline. Returns how many were
    /// purged.
    pub async fn purge_due(&self) -> Result<usize, IngestError> {
        let due = self.store.list_due_tombstones(Utc::now()).await?;
        let mut purged = 0usize;

        for tombstone in due {
            let document_id = tombstone.document_id.clone();
            let rag_ids = self
                .store
                .get_document(&document_id)
                .await?
                .map(|d| d.rag_entry_ids)
                .unwrap_or_default();

            // Vectors first; a failure here leaves the tombstone due for
            // the next cron pass.
            if let Err(e) = self
                .vectors
                .remove_document(&tombstone.agent_id, &rag_ids)
                .await
            {
                tracing::warn!(document_id = %document_id, error = %e, "Vector purge failed");
                continue;
            }

            self.store.delete_chunks(&document_id).await?;
            self.store.delete_document(&document_id).await?;

            let mut purged_tombstone = tombstone;
            purged_tombstone.is_purged = true;
            self.store.save_tombstone(&purged_tombstone).await?;
            purged += 1;
            tracing::info!(document_id = %document_id, "Document purged");
        }

        if purged > 0 {
            metrics::counter!("callbridge_documents_purged").increment(purged as u64);
        }
        Ok(purged)
    }

    /// Spawn the hourly purge and daily session-cleanup loops.
    pub fn start_crons(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut purge_tick = tokio::time::interval(Duration::from_secs(3600));
            let mut session_tick = tokio::time::interval(Duration::from_secs(24 * 3600));
            // Expiry must fire promptly near the TTL boundary too.
            let mut expiry_tick = tokio::time::interval(Duration::from_secs(60));

            loop {
                tokio::select! {
                    _ = purge_tick.tick() => {
                        match self.purge_due().await {
                            Ok(count) if count > 0 => {
                                tracing::info!(count, "Hourly tombstone purge complete");
                            }
                            Ok(_) => {}
                            Err(e) => tracing::error!(error = %e, "Tombstone purge failed"),
                        }
                    }
                    _ = expiry_tick.tick() => {
                        let expired = self.pipeline.expire_due_sessions().await;
                        if expired > 0 {
                            tracing::info!(expired, "Expired ingestion sessions");
                        }
                    }
                    _ = session_tick.tick() => {
                        let swept = self.pipeline.sweep_terminal_sessions();
                        if swept > 0 {
                            tracing::info!(swept, "Swept terminal ingestion sessions");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::{ChunkerConfig, DocumentChunker};
    use crate::pipeline::testing::{InstantParser, MemoryStore, MemoryVectors};
    use crate::pipeline::PipelineOptions;
    use crate::session::DocumentRecord;
    use chrono::Duration as ChronoDuration;

    fn service() -> (Arc<MemoryStore>, Arc<MemoryVectors>, RetentionService) {
        let store = Arc::new(MemoryStore::default());
        let vectors = Arc::new(MemoryVectors::default());
        let pipeline = IngestionPipeline::new(
            Arc::new(InstantParser),
            Arc::new(DocumentChunker::new(ChunkerConfig::default())),
            store.clone(),
            vectors.clone(),
            PipelineOptions::default(),
        );
        let service = RetentionService::new(store.clone(), vectors.clone(), pipeline);
        (store, vectors, service)
    }

    fn document(id: &str) -> DocumentRecord {
        DocumentRecord {
            document_id: id.to_string(),
            agent_id: "agent-1".to_string(),
            organization_id: "org-1".to_string(),
            file_name: "guide.md".to_string(),
            file_type: "md".to_string(),
            file_size: 100,
            source_type: "upload".to_string(),
            status: "completed".to_string(),
            chunk_count: 2,
            rag_entry_ids: vec!["r1".into(), "r2".into()],
            metadata: serde_json::json!({"lang": "en"}),
            uploaded_at: Utc::now(),
            processed_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn soft_delete_then_recover_round_trip() {
        let (store, vectors, service) = service();
        store.documents.lock().insert("d1".into(), document("d1"));

        let tombstone = service.soft_delete("d1", Some("operator".into())).await.unwrap();
        assert!(!tombstone.is_purged);
        assert_eq!(vectors.live.lock().get("d1"), Some(&false));
        // Document row and chunks survive the soft delete.
        assert!(store.documents.lock().contains_key("d1"));

        service.recover("d1").await.unwrap();
        assert_eq!(vectors.live.lock().get("d1"), Some(&true));
        assert!(store.tombstones.lock().is_empty());
    }

    #[tokio::test]
    async fn recover_past_purge_fails() {
        let (store, _vectors, service) = service();
        store.documents.lock().insert("d1".into(), document("d1"));

        let mut tombstone = service.soft_delete("d1", None).await.unwrap();
        tombstone.purge_at = Utc::now() - ChronoDuration::seconds(1);
        store.tombstones.lock().insert("d1".into(), tombstone);

        assert!(matches!(
            service.recover("d1").await,
            Err(IngestError::AlreadyPurged)
        ));
    }

    #[tokio::test]
    async fn purge_removes_rows_and_marks_tombstone() {
        let (store, _vectors, service) = service();
        store.documents.lock().insert("d1".into(), document("d1"));

        let mut tombstone = service.soft_delete("d1", None).await.unwrap();
        tombstone.purge_at = Utc::now() - ChronoDuration::hours(1);
        store.tombstones.lock().insert("d1".into(), tombstone);

        let purged = service.purge_due().await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.documents.lock().is_empty());
        assert!(store.tombstones.lock().get("d1").unwrap().is_purged);

        // Recovery after purge reports AlreadyPurged.
        assert!(matches!(
            service.recover("d1").await,
            Err(IngestError::AlreadyPurged)
        ));
    }

    #[tokio::test]
    async fn repeat_soft_delete_is_a_noop() {
        let (store, _vectors, service) = service();
        store.documents.lock().insert("d1".into(), document("d1"));

        let first = service.soft_delete("d1", None).await.unwrap();
        let second = service.soft_delete("d1", None).await.unwrap();
        assert_eq!(first.purge_at, second.purge_at);
    }

    #[tokio::test]
    async fn missing_document_reports_not_found() {
        let (_store, _vectors, service) = service();
        assert!(matches!(
            service.soft_delete("ghost", None).await,
            Err(IngestError::NotFound(_))
        ));
        assert!(matches!(
            service.recover("ghost").await,
            Err(IngestError::NotFound(_))
        ));
    }

}
