//! Glue between crate seams.
//!
//! The session sink writes a finished call to the datastore; the vector
//! sink turns chunk drafts into embeddings, Qdrant points and sparse
//! index entries.

use async_trait::async_trait;
use std::sync::Arc;

use callbridge_agent::{AgentError, SessionSink};
use callbridge_core::{LatencySample, TranscriptEntry};
use callbridge_ingest::{ChunkDraft, IngestError, VectorSink};
use callbridge_persistence::{
    CallMetricRecord, CallSessionStore, MetricsStore, SessionStatus,
};
use callbridge_rag::{
    ChunkPayload, ChunkPoint, DenseSearcher, Embedder, KnowledgeRetriever, RagError, SparseDoc,
    VectorHit, VectorStore,
};

/// Flushes session results into the datastore.
pub struct StoreSessionSink {
    pub sessions: Arc<dyn CallSessionStore>,
    pub metrics: Arc<dyn MetricsStore>,
}

#[async_trait]
impl SessionSink for StoreSessionSink {
    async fn persist_transcript(
        &self,
        session_id: &str,
        entries: &[TranscriptEntry],
    ) -> Result<(), AgentError> {
        self.sessions
            .store_transcript(session_id, entries)
            .await
            .map_err(|e| AgentError::Persistence(e.to_string()))
    }

    async fn flush_latency(
        &self,
        session_id: &str,
        agent_id: &str,
        samples: &[LatencySample],
    ) -> Result<(), AgentError> {
        let rows = CallMetricRecord::from_latency_samples(session_id, agent_id, samples);
        self.metrics
            .record_batch(&rows)
            .await
            .map_err(|e| AgentError::Persistence(e.to_string()))
    }

    async fn mark_completed(
        &self,
        session_id: &str,
        _duration_seconds: i64,
    ) -> Result<(), AgentError> {
        self.sessions
            .end_session(session_id, SessionStatus::Completed, chrono::Utc::now())
            .await
            .map_err(|e| AgentError::Persistence(e.to_string()))
    }
}

/// Embeds chunks and writes them into Qdrant plus the sparse index.
pub struct RagVectorSink {
    pub embedder: Arc<dyn Embedder>,
    pub vectors: Arc<VectorStore>,
    pub retriever: Arc<KnowledgeRetriever>,
}

#[async_trait]
impl VectorSink for RagVectorSink {
    async fn index_chunks(
        &self,
        namespace: &str,
        document_id: &str,
        chunks: &[ChunkDraft],
    ) -> Result<Vec<String>, IngestError> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self
            .embedder
            .embed(&texts)
            .await
            .map_err(|e| IngestError::Transport(e.to_string()))?;

        let mut ids = Vec::with_capacity(chunks.len());
        let mut points = Vec::with_capacity(chunks.len());
        let mut sparse_docs = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.iter().zip(embeddings.into_iter()) {
            let id = uuid::Uuid::new_v4().to_string();
            ids.push(id.clone());
            points.push(ChunkPoint {
                id: id.clone(),
                vector,
                payload: ChunkPayload {
                    namespace: namespace.to_string(),
                    document_id: document_id.to_string(),
                    chunk_index: chunk.chunk_index,
                    text: chunk.text.clone(),
                    content_type: chunk.content_type.as_str().to_string(),
                    quality: chunk.quality_score,
                    section_title: chunk.section_title.clone(),
                },
            });
            sparse_docs.push(SparseDoc {
                chunk_id: id,
                text: chunk.text.clone(),
                section_title: chunk.section_title.clone(),
            });
        }

        self.vectors
            .upsert(points)
            .await
            .map_err(|e| IngestError::Transport(e.to_string()))?;
        self.retriever
            .index_sparse(namespace, "en", &sparse_docs)
            .map_err(|e| IngestError::Pipeline(e.to_string()))?;

        // New content invalidates cached search results.
        self.retriever.invalidate_all_caches();
        Ok(ids)
    }

    async fn set_document_live(
        &self,
        namespace: &str,
        document_id: &str,
        live: bool,
    ) -> Result<(), IngestError> {
        let status = if live {
            callbridge_rag::ChunkStatus::Live
        } else {
            callbridge_rag::ChunkStatus::Deleted
        };
        self.vectors
            .set_document_status(namespace, document_id, status)
            .await
            .map_err(|e| IngestError::Transport(e.to_string()))?;
        self.retriever.invalidate_all_caches();
        Ok(())
    }

    async fn remove_document(
        &self,
        namespace: &str,
        rag_ids: &[String],
    ) -> Result<(), IngestError> {
        self.vectors
            .delete(rag_ids)
            .await
            .map_err(|e| IngestError::Transport(e.to_string()))?;
        self.retriever
            .remove_sparse(namespace, rag_ids)
            .map_err(|e| IngestError::Pipeline(e.to_string()))?;
        self.retriever.invalidate_all_caches();
        Ok(())
    }
}

/// Dense searcher used in development mode (no vector service).
pub struct NullDenseSearcher;

#[async_trait]
impl DenseSearcher for NullDenseSearcher {
    async fn search_namespace(
        &self,
        _namespace: &str,
        _vector: &[f32],
        _top_k: usize,
    ) -> Result<Vec<VectorHit>, RagError> {
        Ok(Vec::new())
    }
}

/// Vector sink used in development mode: sparse index only.
pub struct SparseOnlyVectorSink {
    pub retriever: Arc<KnowledgeRetriever>,
}

#[async_trait]
impl VectorSink for SparseOnlyVectorSink {
    async fn index_chunks(
        &self,
        namespace: &str,
        _document_id: &str,
        chunks: &[ChunkDraft],
    ) -> Result<Vec<String>, IngestError> {
        let mut ids = Vec::with_capacity(chunks.len());
        let docs: Vec<SparseDoc> = chunks
            .iter()
            .map(|chunk| {
                let id = uuid::Uuid::new_v4().to_string();
                ids.push(id.clone());
                SparseDoc {
                    chunk_id: id,
                    text: chunk.text.clone(),
                    section_title: chunk.section_title.clone(),
                }
            })
            .collect();
        self.retriever
            .index_sparse(namespace, "en", &docs)
            .map_err(|e| IngestError::Pipeline(e.to_string()))?;
        self.retriever.invalidate_all_caches();
        Ok(ids)
    }

    async fn set_document_live(
        &self,
        _namespace: &str,
        _document_id: &str,
        _live: bool,
    ) -> Result<(), IngestError> {
        self.retriever.invalidate_all_caches();
        Ok(())
    }

    async fn remove_document(
        &self,
        namespace: &str,
        rag_ids: &[String],
    ) -> Result<(), IngestError> {
        self.retriever
            .remove_sparse(namespace, rag_ids)
            .map_err(|e| IngestError::Pipeline(e.to_string()))?;
        self.retriever.invalidate_all_caches();
        Ok(())
    }
}
