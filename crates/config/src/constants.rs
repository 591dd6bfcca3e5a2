//! Centralized tunables.
//!
//! Anything two crates need to agree on lives here rather than in scattered
//! `Default` impls.

/// Turn-taking and endpointing.
pub mod endpointing {
    /// Silence before the pipeline VAD reports speech end.
    pub const MIN_SILENCE_SECS: f64 = 0.4;
    /// Speech shorter than this never opens a turn.
    pub const MIN_SPEECH_SECS: f64 = 0.1;
    /// Pipeline VAD activation threshold.
    pub const ACTIVATION_THRESHOLD: f32 = 0.5;
    /// Audio retained before the detected speech start.
    pub const PREFIX_PADDING_SECS: f64 = 0.2;
    /// Wait after speech end before committing the turn.
    pub const MIN_ENDPOINTING_DELAY_SECS: f64 = 0.4;
    /// Hard bound on the endpointing wait; force-commit at expiry.
    pub const MAX_ENDPOINTING_DELAY_SECS: f64 = 0.8;
    /// User speech must persist this long to interrupt the agent.
    pub const MIN_INTERRUPTION_SECS: f64 = 0.15;
    /// Running transcript must carry at least this many words to interrupt.
    pub const MIN_INTERRUPTION_WORDS: usize = 1;
}

/// Voice session orchestration.
pub mod session {
    /// Wait for the audio path before speaking the greeting.
    pub const AUDIO_PATH_SETTLE_SECS: u64 = 2;
    /// Maximum tool steps the LLM may take in one turn.
    pub const MAX_TOOL_STEPS: usize = 5;
}

/// Telephony defaults.
pub mod telephony {
    /// Outbound ring timeout.
    pub const RING_TIMEOUT_SECS: u64 = 30;
    /// Hard cap on call duration.
    pub const MAX_CALL_DURATION_SECS: u64 = 3600;
    /// Default concurrent call admission limit per deployment.
    pub const MAX_CONCURRENT_CALLS: usize = 50;
    /// Identity prefix that marks SIP participants.
    pub const SIP_IDENTITY_PREFIX: &str = "sip_";
}

/// Document ingestion.
pub mod ingestion {
    /// Upload size cap in bytes (50 MiB).
    pub const MAX_FILE_BYTES: u64 = 50 * 1024 * 1024;
    /// Ingestion sessions expire this long after upload.
    pub const SESSION_TTL_SECS: u64 = 24 * 3600;
    /// Soft-deleted documents are purged after this period.
    pub const TOMBSTONE_RETENTION_SECS: u64 = 30 * 24 * 3600;
    /// Per parse job poll timeout.
    pub const PARSE_POLL_TIMEOUT_SECS: u64 = 120;
    /// Parse retry schedule: attempts and backoff bounds.
    pub const PARSE_MAX_RETRIES: u32 = 3;
    pub const PARSE_BACKOFF_INITIAL_MS: u64 = 1000;
    pub const PARSE_BACKOFF_CAP_MS: u64 = 10_000;
    /// Extensions the pipeline accepts.
    pub const ACCEPTED_EXTENSIONS: &[&str] = &[
        "pdf", "docx", "doc", "txt", "md", "csv", "xlsx", "xls", "json", "html", "htm",
    ];
    /// Status poll results may be at most this stale.
    pub const STATUS_STALENESS_CAP_MS: u64 = 500;
}

/// Retrieval.
pub mod rag {
    /// Results returned by default.
    pub const DEFAULT_TOP_K: usize = 5;
    /// Base similarity threshold before intent adjustment.
    pub const BASE_MIN_SCORE: f32 = 0.35;
    /// Threshold shift for exploratory vs factual intents.
    pub const INTENT_THRESHOLD_SHIFT: f32 = 0.1;
    /// Maximum parallel query expansions.
    pub const MAX_EXPANSIONS: usize = 3;
    /// Result cache TTL.
    pub const CACHE_TTL_SECS: u64 = 300;
    /// Result cache capacity.
    pub const CACHE_CAPACITY: usize = 512;
    /// Reciprocal-rank fusion constant.
    pub const RRF_K: f32 = 60.0;
}

/// Shutdown behavior.
pub mod shutdown {
    /// Hard cap on graceful drain.
    pub const HARD_CAP_SECS: u64 = 30;
}

/// Default upstream endpoints (development).
pub mod endpoints {
    pub const QDRANT_DEFAULT: &str = "http://localhost:6334";
    pub const SCYLLA_DEFAULT: &str = "127.0.0.1:9042";
    pub const LLM_DEFAULT: &str = "http://localhost:8000/v1";
    pub const EMBEDDING_DEFAULT: &str = "http://localhost:8001";
    pub const PARSE_SERVICE_DEFAULT: &str = "http://localhost:8002";
    pub const STT_DEFAULT: &str = "ws://localhost:8100/v1/listen";
    pub const TTS_DEFAULT: &str = "ws://localhost:8101/v1/speak";
    pub const LIVEKIT_DEFAULT: &str = "http://localhost:7880";
}
