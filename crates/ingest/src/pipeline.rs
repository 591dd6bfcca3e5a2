//! Ingestion pipeline driver.
//!
//! Each upload creates one [`IngestionSession`] advanced by a single
//! driver task: parsing -> chunking -> preview_ready. Confirmation drives
//! the tail: confirming -> persisting -> embedding -> completed.
//! Cancellation and TTL expiry land in `cancelled` and remove preview
//! artifacts; stage failures land in `failed` with the stored error.
//!
//! Confirmation is eventually consistent: the document row is
//! created first and embeddings retried; if embedding ultimately fails
//! the document row is removed again so no partial state leaks.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use callbridge_config::constants::ingestion;

use crate::chunker::{ChunkDraft, DocumentChunker};
use crate::parser::Parser;
use crate::session::{DocumentRecord, IngestStage, IngestionSession};
use crate::IngestError;

/// Persistence port for sessions, documents, chunks and tombstones.
#[async_trait]
pub trait IngestStore: Send + Sync {
    async fn save_session(&self, session: &IngestionSession) -> Result<(), IngestError>;
    async fn load_session(&self, session_id: &str)
        -> Result<Option<IngestionSession>, IngestError>;

    async fn create_document(&self, document: &DocumentRecord) -> Result<(), IngestError>;
    async fn get_document(&self, document_id: &str)
        -> Result<Option<DocumentRecord>, IngestError>;
    async fn update_document(&self, document: &DocumentRecord) -> Result<(), IngestError>;
    async fn delete_document(&self, document_id: &str) -> Result<(), IngestError>;

    async fn store_chunks(
        &self,
        document_id: &str,
        agent_id: &str,
        chunks: &[ChunkDraft],
        rag_ids: &[String],
    ) -> Result<(), IngestError>;
    async fn delete_chunks(&self, document_id: &str) -> Result<(), IngestError>;

    async fn save_tombstone(
        &self,
        tombstone: &crate::session::TombstoneRecord,
    ) -> Result<(), IngestError>;
    async fn load_tombstone(
        &self,
        document_id: &str,
    ) -> Result<Option<crate::session::TombstoneRecord>, IngestError>;
    async fn list_due_tombstones(
        &self,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<crate::session::TombstoneRecord>, IngestError>;
    async fn delete_tombstone(&self, document_id: &str) -> Result<(), IngestError>;
}

/// Vector index port: embeds and indexes chunks under a namespace.
#[async_trait]
pub trait VectorSink: Send + Sync {
    /// Index chunks; returns one vector id per chunk, in order.
    async fn index_chunks(
        &self,
        namespace: &str,
        document_id: &str,
        chunks: &[ChunkDraft],
    ) -> Result<Vec<String>, IngestError>;

    /// Toggle retrieval visibility of a document's vectors.
    async fn set_document_live(
        &self,
        namespace: &str,
        document_id: &str,
        live: bool,
    ) -> Result<(), IngestError>;

    /// Remove a document's vectors permanently.
    async fn remove_document(
        &self,
        namespace: &str,
        rag_ids: &[String],
    ) -> Result<(), IngestError>;
}

/// Pipeline options.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub max_file_bytes: u64,
    pub preview_enabled: bool,
    /// Embedding retry attempts during confirmation.
    pub embed_retries: u32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_file_bytes: ingestion::MAX_FILE_BYTES,
            preview_enabled: true,
            embed_retries: 3,
        }
    }
}

/// Result of `upload_document`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct UploadOutcome {
    pub session_id: String,
    pub stage: IngestStage,
    pub preview_enabled: bool,
    pub file_name: String,
    pub file_size: u64,
}

/// Result of `confirm`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConfirmOutcome {
    pub rag_ids: Vec<String>,
    pub chunks_created: usize,
}

/// Poll answer for the status route.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionStatus {
    /// Coarse status: uploading | processing | completed | failed | cancelled.
    pub status: String,
    pub stage: IngestStage,
    pub progress: u8,
    pub chunk_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct SessionEntry {
    session: Mutex<IngestionSession>,
    file: Mutex<Option<Arc<Vec<u8>>>>,
    cancel_tx: watch::Sender<bool>,
}

impl SessionEntry {
    fn cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }
}

/// The ingestion pipeline.
pub struct IngestionPipeline {
    parser: Arc<dyn Parser>,
    chunker: Arc<DocumentChunker>,
    store: Arc<dyn IngestStore>,
    vectors: Arc<dyn VectorSink>,
    sessions: DashMap<String, Arc<SessionEntry>>,
    options: PipelineOptions,
    /// Back-reference for the driver tasks this pipeline spawns.
    this: Weak<IngestionPipeline>,
}

impl IngestionPipeline {
    pub fn new(
        parser: Arc<dyn Parser>,
        chunker: Arc<DocumentChunker>,
        store: Arc<dyn IngestStore>,
        vectors: Arc<dyn VectorSink>,
        options: PipelineOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            parser,
            chunker,
            store,
            vectors,
            sessions: DashMap::new(),
            options,
            this: this.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.this.upgrade().expect("pipeline outlives its drivers")
    }

    /// Validate and register an upload; the driver task takes it from
    /// there.
    pub async fn upload_document(
        &self,
        agent_id: &str,
        organization_id: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadOutcome, IngestError> {
        let size = bytes.len() as u64;
        if size > self.options.max_file_bytes {
            return Err(IngestError::FileTooLarge(size));
        }
        let extension = file_extension(file_name)?;

        let session_id = Uuid::new_v4().to_string();
        let session = IngestionSession::new(
            session_id.clone(),
            agent_id,
            organization_id,
            file_name,
            extension.clone(),
            size,
            self.options.preview_enabled,
        );
        self.store.save_session(&session).await?;

        let (cancel_tx, _) = watch::channel(false);
        let entry = Arc::new(SessionEntry {
            session: Mutex::new(session.clone()),
            file: Mutex::new(Some(Arc::new(bytes))),
            cancel_tx,
        });
        self.sessions.insert(session_id.clone(), entry);

        let pipeline = self.arc();
        let driver_id = session_id.clone();
        tokio::spawn(async move {
            pipeline.drive(&driver_id).await;
        });

        metrics::counter!("callbridge_ingest_uploads").increment(1);
        tracing::info!(
            session_id = %session_id,
            agent_id,
            file_name,
            size,
            "Ingestion session created"
        );

        Ok(UploadOutcome {
            session_id,
            stage: IngestStage::Uploading,
            preview_enabled: self.options.preview_enabled,
            file_name: file_name.to_string(),
            file_size: size,
        })
    }

    /// Driver: uploading -> parsing -> chunking -> preview_ready.
    async fn drive(&self, session_id: &str) {
        let Some(entry) = self.entry(session_id) else {
            return;
        };

        let result = self.drive_inner(&entry).await;
        match result {
            Ok(()) => {}
            Err(IngestError::Cancelled) => {
                self.mark_cancelled(&entry).await;
            }
            Err(e) => {
                self.mark_failed(&entry, &e.to_string()).await;
            }
        }

        // Preview disabled: confirmation is implicit.
        let auto_confirm = {
            let session = entry.session.lock();
            !session.preview_enabled && session.stage == IngestStage::PreviewReady
        };
        if auto_confirm {
            let id = entry.session.lock().session_id.clone();
            if let Err(e) = self.confirm(&id).await {
                tracing::error!(session_id = %id, error = %e, "Auto-confirm failed");
            }
        }
    }

    async fn drive_inner(&self, entry: &Arc<SessionEntry>) -> Result<(), IngestError> {
        let (file_name, extension, bytes) = {
            let session = entry.session.lock();
            let bytes = entry
                .file
                .lock()
                .clone()
                .ok_or_else(|| IngestError::Pipeline("file bytes missing".to_string()))?;
            (session.file_name.clone(), session.file_type.clone(), bytes)
        };

        // uploading -> parsing
        self.advance(entry, IngestStage::Parsing).await?;
        let elements = self.parser.parse(&file_name, &extension, &bytes).await?;
        if entry.cancelled() {
            return Err(IngestError::Cancelled);
        }
        if elements.is_empty() {
            return Err(IngestError::Pipeline(
                "parser produced no structured elements".to_string(),
            ));
        }

        // parsing -> chunking
        self.advance(entry, IngestStage::Chunking).await?;
        let chunks = self.chunker.chunk(elements);
        if entry.cancelled() {
            return Err(IngestError::Cancelled);
        }
        if chunks.is_empty() {
            return Err(IngestError::Pipeline(
                "chunking produced no chunks above minimum length".to_string(),
            ));
        }

        // chunking -> preview_ready, preview persisted
        {
            let mut session = entry.session.lock();
            session.chunks = chunks;
        }
        self.advance(entry, IngestStage::PreviewReady).await?;
        let (session_id, chunk_count) = {
            let session = entry.session.lock();
            (session.session_id.clone(), session.chunks.len())
        };
        tracing::info!(session_id = %session_id, chunks = chunk_count, "Preview ready");
        Ok(())
    }

    /// Confirm a previewed session. Idempotent: a second confirm returns
    /// the prior vector ids.
    pub async fn confirm(&self, session_id: &str) -> Result<ConfirmOutcome, IngestError> {
        let Some(entry) = self.entry(session_id) else {
            // Swept from memory: a completed session still answers with
            // its stored vector ids.
            let stored = self.store.load_session(session_id).await?;
            return match stored {
                Some(session) if session.stage == IngestStage::Completed => Ok(ConfirmOutcome {
                    chunks_created: session.rag_ids.len(),
                    rag_ids: session.rag_ids,
                }),
                Some(_) => Err(IngestError::AlreadyTerminal),
                None => Err(IngestError::NotFound(session_id.to_string())),
            };
        };

        // Idempotence and stage gating.
        {
            let session = entry.session.lock();
            match session.stage {
                IngestStage::Completed => {
                    return Ok(ConfirmOutcome {
                        rag_ids: session.rag_ids.clone(),
                        chunks_created: session.chunks.len(),
                    });
                }
                IngestStage::PreviewReady => {}
                IngestStage::Failed | IngestStage::Cancelled => {
                    return Err(IngestError::AlreadyTerminal);
                }
                _ => {
                    return Err(IngestError::Pipeline(format!(
                        "cannot confirm in stage {}",
                        session.stage.as_str()
                    )));
                }
            }
        }

        let result = self.confirm_inner(&entry).await;
        if let Err(ref e) = result {
            if !matches!(e, IngestError::AlreadyTerminal) {
                self.mark_failed(&entry, &e.to_string()).await;
            }
        }
        result
    }

    async fn confirm_inner(&self, entry: &Arc<SessionEntry>) -> Result<ConfirmOutcome, IngestError> {
        self.advance(entry, IngestStage::Confirming).await?;

        let (session_snapshot, chunks) = {
            let session = entry.session.lock();
            (session.clone(), session.chunks.clone())
        };

        // confirming -> persisting: document row first (eventual
        // consistency; embeddings follow).
        let mut document = DocumentRecord {
            document_id: session_snapshot.session_id.clone(),
            agent_id: session_snapshot.agent_id.clone(),
            organization_id: session_snapshot.organization_id.clone(),
            file_name: session_snapshot.file_name.clone(),
            file_type: session_snapshot.file_type.clone(),
            file_size: session_snapshot.file_size,
            source_type: "upload".to_string(),
            status: "processing".to_string(),
            chunk_count: chunks.len(),
            rag_entry_ids: Vec::new(),
            metadata: serde_json::json!({}),
            uploaded_at: session_snapshot.created_at,
            processed_at: None,
        };
        self.store.create_document(&document).await?;
        self.advance(entry, IngestStage::Persisting).await?;

        // persisting -> embedding with bounded retries.
        self.advance(entry, IngestStage::Embedding).await?;
        let rag_ids = match self.embed_with_retry(&session_snapshot, &chunks).await {
            Ok(ids) => ids,
            Err(e) => {
                // Remove the document row so no partial state leaks.
                let _ = self.store.delete_document(&document.document_id).await;
                return Err(e);
            }
        };

        self.store
            .store_chunks(
                &document.document_id,
                &session_snapshot.agent_id,
                &chunks,
                &rag_ids,
            )
            .await?;

        document.status = "completed".to_string();
        document.rag_entry_ids = rag_ids.clone();
        document.processed_at = Some(Utc::now());
        self.store.update_document(&document).await?;

        {
            let mut session = entry.session.lock();
            session.rag_ids = rag_ids.clone();
        }
        self.advance(entry, IngestStage::Completed).await?;

        metrics::counter!("callbridge_ingest_completed").increment(1);
        tracing::info!(
            document_id = %document.document_id,
            chunks = chunks.len(),
            "Ingestion completed"
        );

        Ok(ConfirmOutcome {
            chunks_created: chunks.len(),
            rag_ids,
        })
    }

    async fn embed_with_retry(
        &self,
        session: &IngestionSession,
        chunks: &[ChunkDraft],
    ) -> Result<Vec<String>, IngestError> {
        let mut backoff = Duration::from_millis(500);
        let mut attempt = 0u32;
        loop {
            match self
                .vectors
                .index_chunks(&session.agent_id, &session.session_id, chunks)
                .await
            {
                Ok(ids) => {
                    if ids.len() != chunks.len() {
                        return Err(IngestError::Pipeline(format!(
                            "vector sink returned {} ids for {} chunks",
                            ids.len(),
                            chunks.len()
                        )));
                    }
                    return Ok(ids);
                }
                Err(e) if e.is_retryable() && attempt < self.options.embed_retries => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "Embedding failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(10));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cancel a non-terminal session and remove preview artifacts.
    pub async fn cancel(&self, session_id: &str) -> Result<(), IngestError> {
        let entry = self
            .entry(session_id)
            .ok_or_else(|| IngestError::NotFound(session_id.to_string()))?;

        {
            let session = entry.session.lock();
            if session.stage.is_terminal() {
                return Err(IngestError::AlreadyTerminal);
            }
        }
        let _ = entry.cancel_tx.send(true);
        self.mark_cancelled(&entry).await;
        Ok(())
    }

    /// Status for the 1 Hz poll; served from memory, never stale beyond
    /// the driver's own write latency.
    pub fn session_status(&self, session_id: &str) -> Result<SessionStatus, IngestError> {
        let entry = self
            .entry(session_id)
            .ok_or_else(|| IngestError::NotFound(session_id.to_string()))?;
        let session = entry.session.lock();
        Ok(SessionStatus {
            status: session.stage.public_status().to_string(),
            stage: session.stage,
            progress: session.progress,
            chunk_count: session.chunks.len(),
            error: session.error.clone(),
        })
    }

    /// Preview chunks (available from `preview_ready`).
    pub fn session_chunks(&self, session_id: &str) -> Result<Vec<ChunkDraft>, IngestError> {
        let entry = self
            .entry(session_id)
            .ok_or_else(|| IngestError::NotFound(session_id.to_string()))?;
        let session = entry.session.lock();
        if matches!(
            session.stage,
            IngestStage::Uploading | IngestStage::Parsing | IngestStage::Chunking
        ) {
            return Err(IngestError::Pipeline("preview not ready yet".to_string()));
        }
        Ok(session.chunks.clone())
    }

    /// Cancel sessions past their TTL. Returns how many expired.
    pub async fn expire_due_sessions(&self) -> usize {
        let now = Utc::now();
        let due: Vec<Arc<SessionEntry>> = self
            .sessions
            .iter()
            .filter(|kv| kv.value().session.lock().is_expired(now))
            .map(|kv| kv.value().clone())
            .collect();

        for entry in &due {
            let _ = entry.cancel_tx.send(true);
            self.mark_cancelled(entry).await;
            tracing::info!(
                session_id = %entry.session.lock().session_id,
                "Ingestion session expired"
            );
        }
        due.len()
    }

    /// Drop terminal sessions from memory (they stay in the store).
    pub fn sweep_terminal_sessions(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| !entry.session.lock().stage.is_terminal());
        before - self.sessions.len()
    }

    fn entry(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(session_id).map(|kv| kv.value().clone())
    }

    async fn advance(
        &self,
        entry: &Arc<SessionEntry>,
        next: IngestStage,
    ) -> Result<(), IngestError> {
        if entry.cancelled() && !next.is_terminal() {
            return Err(IngestError::Cancelled);
        }
        let snapshot = {
            let mut session = entry.session.lock();
            if !session.advance(next) {
                return Err(IngestError::Pipeline(format!(
                    "illegal transition {} -> {}",
                    session.stage.as_str(),
                    next.as_str()
                )));
            }
            session.clone()
        };
        metrics::counter!("callbridge_ingest_stage", "stage" => next.as_str()).increment(1);
        self.store.save_session(&snapshot).await
    }

    async fn mark_failed(&self, entry: &Arc<SessionEntry>, error: &str) {
        let snapshot = {
            let mut session = entry.session.lock();
            if session.stage.is_terminal() {
                return;
            }
            session.advance(IngestStage::Failed);
            session.error = Some(error.to_string());
            session.clone()
        };
        *entry.file.lock() = None;
        if let Err(e) = self.store.save_session(&snapshot).await {
            tracing::error!(error = %e, "Failed to persist failed session");
        }
        tracing::warn!(session_id = %snapshot.session_id, error, "Ingestion failed");
    }

    async fn mark_cancelled(&self, entry: &Arc<SessionEntry>) {
        let snapshot = {
            let mut session = entry.session.lock();
            if session.stage.is_terminal() {
                return;
            }
            session.advance(IngestStage::Cancelled);
            // Cancellation removes preview artifacts.
            session.chunks.clear();
            session.clone()
        };
        *entry.file.lock() = None;
        if let Err(e) = self.store.save_session(&snapshot).await {
            tracing::error!(error = %e, "Failed to persist cancelled session");
        }
    }
}

fn file_extension(file_name: &str) -> Result<String, IngestError> {
    let extension = file_name
        .rsplit('.')
        .next()
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if file_name.contains('.') && ingestion::ACCEPTED_EXTENSIONS.contains(&extension.as_str()) {
        Ok(extension)
    } else {
        Err(IngestError::UnsupportedType(extension))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory store and vector sink for pipeline tests.

    use super::*;
    use crate::session::TombstoneRecord;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct MemoryStore {
        pub sessions: Mutex<HashMap<String, IngestionSession>>,
        pub documents: Mutex<HashMap<String, DocumentRecord>>,
        pub chunks: Mutex<HashMap<String, Vec<ChunkDraft>>>,
        pub tombstones: Mutex<HashMap<String, TombstoneRecord>>,
    }

    #[async_trait]
    impl IngestStore for MemoryStore {
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
            self.documents
                .lock()
                .insert(document.document_id.clone(), document.clone());
            Ok(())
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
            _rag_ids: &[String],
        ) -> Result<(), IngestError> {
            self.chunks
                .lock()
                .insert(document_id.to_string(), chunks.to_vec());
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
            now: chrono::DateTime<Utc>,
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

    #[derive(Default)]
    pub struct MemoryVectors {
        pub indexed: Mutex<HashMap<String, Vec<String>>>,
        pub live: Mutex<HashMap<String, bool>>,
        pub fail_attempts: Mutex<u32>,
    }

    #[async_trait]
    impl VectorSink for MemoryVectors {
        async fn index_chunks(
            &self,
            _namespace: &str,
            document_id: &str,
            chunks: &[ChunkDraft],
        ) -> Result<Vec<String>, IngestError> {
            {
                let mut remaining = self.fail_attempts.lock();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(IngestError::Transport("embedder unreachable".into()));
                }
            }
            let ids: Vec<String> = chunks
                .iter()
                .map(|c| format!("{document_id}:{}", c.chunk_index))
                .collect();
            self.indexed
                .lock()
                .insert(document_id.to_string(), ids.clone());
            self.live.lock().insert(document_id.to_string(), true);
            Ok(ids)
        }

        async fn set_document_live(
            &self,
            _namespace: &str,
            document_id: &str,
            live: bool,
        ) -> Result<(), IngestError> {
            self.live.lock().insert(document_id.to_string(), live);
            Ok(())
        }

        async fn remove_document(
            &self,
            _namespace: &str,
            _rag_ids: &[String],
        ) -> Result<(), IngestError> {
            Ok(())
        }
    }

    pub struct InstantParser;

    #[async_trait]
    impl Parser for InstantParser {
        async fn parse(
            &self,
            _file_name: &str,
            extension: &str,
            bytes: &[u8],
        ) -> Result<Vec<crate::parser::StructuredElement>, IngestError> {
            crate::parser::fallback_parse(extension, bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::chunker::ChunkerConfig;

    fn pipeline(
        store: Arc<MemoryStore>,
        vectors: Arc<MemoryVectors>,
    ) -> Arc<IngestionPipeline> {
        IngestionPipeline::new(
            Arc::new(InstantParser),
            Arc::new(DocumentChunker::new(ChunkerConfig {
                min_tokens: 1,
                ..Default::default()
            })),
            store,
            vectors,
            PipelineOptions::default(),
        )
    }

    const DOC: &[u8] =
        b"# Fees\n\nThe processing fee is one percent of the sanctioned loan amount.\n\n# Eligibility\n\nApplicants must be at least eighteen years old and hold valid identity documents.";

    async fn wait_for_stage(
        pipeline: &Arc<IngestionPipeline>,
        session_id: &str,
        stage: IngestStage,
    ) {
        for _ in 0..200 {
            if pipeline.session_status(session_id).unwrap().stage == stage {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("stage {stage:?} never reached");
    }

    #[tokio::test]
    async fn upload_to_preview_and_confirm() {
        let store = Arc::new(MemoryStore::default());
        let vectors = Arc::new(MemoryVectors::default());
        let pipeline = pipeline(store.clone(), vectors.clone());

        let outcome = pipeline
            .upload_document("agent-1", "org-1", "guide.md", DOC.to_vec())
            .await
            .unwrap();
        assert_eq!(outcome.stage, IngestStage::Uploading);

        wait_for_stage(&pipeline, &outcome.session_id, IngestStage::PreviewReady).await;
        let chunks = pipeline.session_chunks(&outcome.session_id).unwrap();
        assert!(!chunks.is_empty());

        let confirmed = pipeline.confirm(&outcome.session_id).await.unwrap();
        assert_eq!(confirmed.rag_ids.len(), confirmed.chunks_created);
        assert_eq!(
            pipeline.session_status(&outcome.session_id).unwrap().stage,
            IngestStage::Completed
        );

        // Document row exists and is completed.
        let document = store
            .documents
            .lock()
            .get(&outcome.session_id)
            .cloned()
            .unwrap();
        assert_eq!(document.status, "completed");
        assert_eq!(document.chunk_count, confirmed.chunks_created);
    }

    #[tokio::test]
    async fn confirm_is_idempotent() {
        let pipeline = pipeline(
            Arc::new(MemoryStore::default()),
            Arc::new(MemoryVectors::default()),
        );
        let outcome = pipeline
            .upload_document("agent-1", "org-1", "guide.md", DOC.to_vec())
            .await
            .unwrap();
        wait_for_stage(&pipeline, &outcome.session_id, IngestStage::PreviewReady).await;

        let first = pipeline.confirm(&outcome.session_id).await.unwrap();
        let second = pipeline.confirm(&outcome.session_id).await.unwrap();
        assert_eq!(first.rag_ids, second.rag_ids);
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected() {
        let pipeline = pipeline(
            Arc::new(MemoryStore::default()),
            Arc::new(MemoryVectors::default()),
        );
        let exactly_max = vec![0u8; ingestion::MAX_FILE_BYTES as usize];
        // Exactly 50 MiB passes validation (extension check comes later).
        let over = pipeline
            .upload_document("a", "o", "big.txt", vec![0u8; exactly_max.len() + 1])
            .await;
        assert!(matches!(over, Err(IngestError::FileTooLarge(_))));
    }

    #[tokio::test]
    async fn unsupported_extension_is_rejected() {
        let pipeline = pipeline(
            Arc::new(MemoryStore::default()),
            Arc::new(MemoryVectors::default()),
        );
        let result = pipeline
            .upload_document("a", "o", "malware.exe", b"MZ".to_vec())
            .await;
        assert!(matches!(result, Err(IngestError::UnsupportedType(_))));
    }

    #[tokio::test]
    async fn cancel_removes_preview_artifacts() {
        let pipeline = pipeline(
            Arc::new(MemoryStore::default()),
            Arc::new(MemoryVectors::default()),
        );
        let outcome = pipeline
            .upload_document("agent-1", "org-1", "guide.md", DOC.to_vec())
            .await
            .unwrap();
        wait_for_stage(&pipeline, &outcome.session_id, IngestStage::PreviewReady).await;

        pipeline.cancel(&outcome.session_id).await.unwrap();
        let status = pipeline.session_status(&outcome.session_id).unwrap();
        assert_eq!(status.stage, IngestStage::Cancelled);
        assert_eq!(status.chunk_count, 0);

        // A second cancel reports terminality.
        assert!(matches!(
            pipeline.cancel(&outcome.session_id).await,
            Err(IngestError::AlreadyTerminal)
        ));
    }

    #[tokio::test]
    async fn embedding_failure_after_retries_fails_session_and_removes_document() {
        let store = Arc::new(MemoryStore::default());
        let vectors = Arc::new(MemoryVectors::default());
        // More failures than the retry budget.
        *vectors.fail_attempts.lock() = 10;
        let pipeline = pipeline(store.clone(), vectors);

        let outcome = pipeline
            .upload_document("agent-1", "org-1", "guide.md", DOC.to_vec())
            .await
            .unwrap();
        wait_for_stage(&pipeline, &outcome.session_id, IngestStage::PreviewReady).await;

        let result = pipeline.confirm(&outcome.session_id).await;
        assert!(result.is_err());
        assert_eq!(
            pipeline.session_status(&outcome.session_id).unwrap().stage,
            IngestStage::Failed
        );
        // No leaked document row.
        assert!(store.documents.lock().is_empty());
    }

    #[tokio::test]
    async fn embedding_retries_transient_failures() {
        let store = Arc::new(MemoryStore::default());
        let vectors = Arc::new(MemoryVectors::default());
        *vectors.fail_attempts.lock() = 2;
        let pipeline = pipeline(store, vectors);

        let outcome = pipeline
            .upload_document("agent-1", "org-1", "guide.md", DOC.to_vec())
            .await
            .unwrap();
        wait_for_stage(&pipeline, &outcome.session_id, IngestStage::PreviewReady).await;
        assert!(pipeline.confirm(&outcome.session_id).await.is_ok());
    }

    #[tokio::test]
    async fn terminal_sweep_drops_finished_sessions() {
        let pipeline = pipeline(
            Arc::new(MemoryStore::default()),
            Arc::new(MemoryVectors::default()),
        );
        let outcome = pipeline
            .upload_document("agent-1", "org-1", "guide.md", DOC.to_vec())
            .await
            .unwrap();
        wait_for_stage(&pipeline, &outcome.session_id, IngestStage::PreviewReady).await;
        pipeline.cancel(&outcome.session_id).await.unwrap();

        assert_eq!(pipeline.sweep_terminal_sessions(), 1);
        assert!(matches!(
            pipeline.session_status(&outcome.session_id),
            Err(IngestError::NotFound(_))
        ));
    }
}
