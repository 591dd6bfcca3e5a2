//! Document ingestion pipeline.
//!
//! Upload -> parse -> chunk -> preview -> (confirm) -> persist -> embed,
//! modeled as a single state-machine value advanced by one driver task per
//! session. Every non-terminal stage either advances or times out;
//! cancellation and the 24-hour TTL land in `Cancelled`. Confirmed
//! documents can be soft-deleted (30-day tombstone) and recovered until
//! purge.

pub mod chunker;
pub mod parser;
pub mod pipeline;
pub mod retention;
pub mod session;

pub use chunker::{ChunkDraft, ChunkerConfig, ContentType, DocumentChunker};
pub use parser::{
    AnnotatedElement, DocumentParser, ElementKind, ParseServiceConfig, Parser, StructuredElement,
};
pub use pipeline::{
    ConfirmOutcome, IngestStore, IngestionPipeline, PipelineOptions, SessionStatus, UploadOutcome,
    VectorSink,
};
pub use retention::RetentionService;
pub use session::{DocumentRecord, IngestStage, IngestionSession, TombstoneRecord};

use thiserror::Error;

/// Ingestion errors.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("file exceeds the 50 MiB limit ({0} bytes)")]
    FileTooLarge(u64),

    #[error("unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session is already terminal")]
    AlreadyTerminal,

    #[error("document already purged")]
    AlreadyPurged,

    #[error("pipeline failure: {0}")]
    Pipeline(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(String),
}

impl IngestError {
    /// Only network and timeout causes are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
