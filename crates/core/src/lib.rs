//! Core types shared across the callbridge workspace.
//!
//! Everything here is transport- and vendor-agnostic: audio frames,
//! languages, transcripts, the latency tracker, the LRU-TTL cache and the
//! bounded event broker that the orchestrators publish through.

pub mod audio;
pub mod cache;
pub mod events;
pub mod language;
pub mod latency;
pub mod phone;
pub mod transcript;

pub use audio::{AudioFrame, Channels, SampleRate};
pub use cache::{CacheStats, LruTtlCache};
pub use events::{EventBroker, PlatformEvent};
pub use language::{Language, Script};
pub use latency::{
    LatencyEvent, LatencyHandle, LatencySample, LatencyTargets, LatencyTracker, Operation,
    OperationStats,
};
pub use phone::normalize_phone_number;
pub use transcript::{EntryKind, Speaker, TranscriptEntry, TranscriptResult};

use thiserror::Error;

/// Errors produced by core components.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}
