//! Streaming voice pipeline.
//!
//! The per-session call path is assembled from the pieces in this crate:
//! a warm [`pool::ConnectionPool`] of vendor sockets, the [`vad`] running
//! locally on inbound audio, the [`stt`] and [`tts`] stream adapters, and
//! the [`turn::TurnController`] that arbitrates who is speaking.

pub mod pool;
pub mod stt;
pub mod tts;
pub mod turn;
pub mod vad;

pub use pool::{ConnectionPool, PoolConfig, PoolStats, PooledConnection, StreamFactory};
pub use stt::{SttConfig, SttEvent, SttStream, SttVadSignal, WsSttStream};
pub use tts::{
    segmenter::{SegmentKind, SentenceSegmenter, TextSegment},
    SpeechSynthesizer, TtsConfig, TtsEvent, TtsStream, WsSynthesizer,
};
pub use turn::{TurnCommand, TurnConfig, TurnController, TurnEvent, TurnState};
pub use vad::{EnergyVad, PipelineVad, VadConfig, VadState, VadTransition, VadUpdate};

use thiserror::Error;

/// Pipeline errors.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("vad error: {0}")]
    Vad(String),

    #[error("pool exhausted for {0}")]
    PoolExhausted(String),

    #[error("stream closed")]
    StreamClosed,

    #[error("not initialized: {0}")]
    NotInitialized(String),
}

impl PipelineError {
    /// Whether retrying the operation can help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::PoolExhausted(_))
    }
}
