//! Ingestion session and document records.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use callbridge_config::constants::ingestion;

use crate::chunker::ChunkDraft;

/// Ingestion stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Uploading,
    Parsing,
    Chunking,
    PreviewReady,
    Confirming,
    Persisting,
    Embedding,
    Completed,
    Failed,
    Cancelled,
}

impl IngestStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Parsing => "parsing",
            Self::Chunking => "chunking",
            Self::PreviewReady => "preview_ready",
            Self::Confirming => "confirming",
            Self::Persisting => "persisting",
            Self::Embedding => "embedding",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "uploading" => Self::Uploading,
            "parsing" => Self::Parsing,
            "chunking" => Self::Chunking,
            "preview_ready" => Self::PreviewReady,
            "confirming" => Self::Confirming,
            "persisting" => Self::Persisting,
            "embedding" => Self::Embedding,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "cancelled" => Self::Cancelled,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Coarse status exposed on the public API: intermediate stages all
    /// read as `processing`.
    pub fn public_status(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            _ => "processing",
        }
    }

    /// Forward transitions of the state machine. Terminal transitions
    /// (`Failed`, `Cancelled`) are allowed from any non-terminal stage.
    pub fn can_advance_to(&self, next: IngestStage) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, IngestStage::Failed | IngestStage::Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Self::Uploading, Self::Parsing)
                | (Self::Parsing, Self::Chunking)
                | (Self::Chunking, Self::PreviewReady)
                | (Self::PreviewReady, Self::Confirming)
                | (Self::Confirming, Self::Persisting)
                | (Self::Persisting, Self::Embedding)
                | (Self::Embedding, Self::Completed)
        )
    }

    /// Nominal progress value reported at this stage.
    pub fn progress(&self) -> u8 {
        match self {
            Self::Uploading => 5,
            Self::Parsing => 25,
            Self::Chunking => 45,
            Self::PreviewReady => 60,
            Self::Confirming => 70,
            Self::Persisting => 80,
            Self::Embedding => 90,
            Self::Completed => 100,
            Self::Failed | Self::Cancelled => 100,
        }
    }
}

/// One ingestion session. The session id doubles as the document id until
/// confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionSession {
    pub session_id: String,
    pub agent_id: String,
    pub organization_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub stage: IngestStage,
    pub progress: u8,
    pub preview_enabled: bool,
    /// Preview chunk snapshot, set at `PreviewReady`.
    #[serde(default)]
    pub chunks: Vec<ChunkDraft>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Vector ids created at confirmation; idempotent re-confirm returns
    /// these.
    #[serde(default)]
    pub rag_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IngestionSession {
    pub fn new(
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        organization_id: impl Into<String>,
        file_name: impl Into<String>,
        file_type: impl Into<String>,
        file_size: u64,
        preview_enabled: bool,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            organization_id: organization_id.into(),
            file_name: file_name.into(),
            file_type: file_type.into(),
            file_size,
            stage: IngestStage::Uploading,
            progress: IngestStage::Uploading.progress(),
            preview_enabled,
            chunks: Vec::new(),
            error: None,
            rag_ids: Vec::new(),
            created_at,
            expires_at: created_at
                + ChronoDuration::seconds(ingestion::SESSION_TTL_SECS as i64),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at && !self.stage.is_terminal()
    }

    /// Advance the stage, enforcing legality.
    pub fn advance(&mut self, next: IngestStage) -> bool {
        if !self.stage.can_advance_to(next) {
            return false;
        }
        self.stage = next;
        self.progress = next.progress();
        true
    }
}

/// A confirmed document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub agent_id: String,
    pub organization_id: String,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub source_type: String,
    /// processing | completed | failed
    pub status: String,
    pub chunk_count: usize,
    pub rag_entry_ids: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
    pub uploaded_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// Soft-delete tombstone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TombstoneRecord {
    pub document_id: String,
    pub agent_id: String,
    pub file_name: String,
    pub deleted_at: DateTime<Utc>,
    pub purge_at: DateTime<Utc>,
    pub is_purged: bool,
    #[serde(default)]
    pub original_metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TombstoneRecord {
    pub fn new(document: &DocumentRecord, reason: Option<String>) -> Self {
        let deleted_at = Utc::now();
        Self {
            document_id: document.document_id.clone(),
            agent_id: document.agent_id.clone(),
            file_name: document.file_name.clone(),
            deleted_at,
            purge_at: deleted_at
                + ChronoDuration::seconds(ingestion::TOMBSTONE_RETENTION_SECS as i64),
            is_purged: false,
            original_metadata: serde_json::to_value(document).unwrap_or(Value::Null),
            reason,
        }
    }

    pub fn is_past_purge(&self, now: DateTime<Utc>) -> bool {
        now > self.purge_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_transitions_follow_the_table() {
        use IngestStage::*;
        assert!(Uploading.can_advance_to(Parsing));
        assert!(Parsing.can_advance_to(Chunking));
        assert!(Chunking.can_advance_to(PreviewReady));
        assert!(PreviewReady.can_advance_to(Confirming));
        assert!(Confirming.can_advance_to(Persisting));
        assert!(Persisting.can_advance_to(Embedding));
        assert!(Embedding.can_advance_to(Completed));

        // No skipping.
        assert!(!Uploading.can_advance_to(Chunking));
        assert!(!Parsing.can_advance_to(PreviewReady));

        // Terminal transitions from any non-terminal stage.
        assert!(Parsing.can_advance_to(Failed));
        assert!(Embedding.can_advance_to(Cancelled));

        // Nothing leaves a terminal stage.
        assert!(!Completed.can_advance_to(Failed));
        assert!(!Cancelled.can_advance_to(Parsing));
    }

    #[test]
    fn public_status_maps_intermediate_stages() {
        assert_eq!(IngestStage::Parsing.public_status(), "processing");
        assert_eq!(IngestStage::Embedding.public_status(), "processing");
        assert_eq!(IngestStage::Completed.public_status(), "completed");
        assert_eq!(IngestStage::Uploading.public_status(), "uploading");
    }

    #[test]
    fn session_expiry_boundary() {
        let mut session =
            IngestionSession::new("s1", "a1", "o1", "doc.pdf", "pdf", 1024, true);
        // One second before expiry: still live.
        let just_before = session.expires_at - ChronoDuration::seconds(1);
        assert!(!session.is_expired(just_before));
        // At expiry: expired.
        assert!(session.is_expired(session.expires_at));
        // Terminal sessions never expire.
        session.stage = IngestStage::Completed;
        assert!(!session.is_expired(session.expires_at));
    }

    #[test]
    fn advance_rejects_illegal_moves() {
        let mut session =
            IngestionSession::new("s1", "a1", "o1", "doc.pdf", "pdf", 1024, true);
        assert!(session.advance(IngestStage::Parsing));
        assert!(!session.advance(IngestStage::Completed));
        assert_eq!(session.stage, IngestStage::Parsing);
    }

    #[test]
    fn tombstone_purge_boundary() {
        let document = DocumentRecord {
            document_id: "d1".into(),
            agent_id: "a1".into(),
            organization_id: "o1".into(),
            file_name: "doc.pdf".into(),
            file_type: "pdf".into(),
            file_size: 10,
            source_type: "upload".into(),
            status: "completed".into(),
            chunk_count: 1,
            rag_entry_ids: vec!["r1".into()],
            metadata: Value::Null,
            uploaded_at: Utc::now(),
            processed_at: None,
        };
        let tombstone = TombstoneRecord::new(&document, None);
        assert!(!tombstone.is_past_purge(tombstone.purge_at));
        assert!(tombstone.is_past_purge(tombstone.purge_at + ChronoDuration::seconds(1)));
    }
}
