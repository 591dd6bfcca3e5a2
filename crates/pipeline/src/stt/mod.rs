//! Streaming speech-to-text.
//!
//! The adapter opens one vendor stream per utterance-session, feeds it
//! 16-bit PCM at 16 kHz mono and emits partials, finals and the
//! transcriber's own VAD signals. Within a session all partials for an
//! utterance precede its final; when the session is torn down before a
//! final arrives, the last non-empty partial is authoritative.

mod ws;

pub use ws::WsSttStream;

use async_trait::async_trait;
use callbridge_core::{AudioFrame, Language, TranscriptResult};
use tokio::sync::mpsc;

use crate::PipelineError;

/// Speech markers reported by the transcriber itself.
///
/// These are hints for the turn controller, deliberately low-sensitivity
/// so they never double-trigger against the pipeline VAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttVadSignal {
    SpeechStart,
    SpeechEnd,
}

/// Events emitted by an STT stream.
#[derive(Debug, Clone)]
pub enum SttEvent {
    Partial { text: String, confidence: f32 },
    Final { text: String, confidence: f32 },
    VadSignal(SttVadSignal),
    /// The stream ended; no further events follow.
    Closed,
    Error(String),
}

/// STT session configuration.
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub language: Language,
    pub sample_rate: u32,
    /// Reconnect attempts on transient transport errors.
    pub max_reconnects: u32,
    /// Initial reconnect backoff; doubles with jitter.
    pub initial_backoff_ms: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8100/v1/listen".to_string(),
            api_key: String::new(),
            model: "general-streaming".to_string(),
            language: Language::default(),
            sample_rate: 16_000,
            max_reconnects: 3,
            initial_backoff_ms: 250,
        }
    }
}

/// A live transcription stream.
#[async_trait]
pub trait SttStream: Send + Sync {
    /// Push one audio frame.
    async fn send_audio(&self, frame: &AudioFrame) -> Result<(), PipelineError>;

    /// Take the event receiver. Yields `None` after the first call.
    fn take_events(&self) -> Option<mpsc::Receiver<SttEvent>>;

    /// Flush and close, returning the authoritative final transcript.
    ///
    /// When the vendor never produced a final, the last non-empty partial
    /// is promoted.
    async fn close(&self) -> Result<Option<TranscriptResult>, PipelineError>;
}

pub mod testing {
    //! Scripted STT stream used by orchestrator tests downstream.

    use super::*;
    use parking_lot::Mutex;

    pub struct ScriptedStt {
        events: Mutex<Option<mpsc::Receiver<SttEvent>>>,
        pub tx: mpsc::Sender<SttEvent>,
        last_partial: Mutex<Option<TranscriptResult>>,
    }

    impl Default for ScriptedStt {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ScriptedStt {
        pub fn new() -> Self {
            let (tx, rx) = mpsc::channel(64);
            Self {
                events: Mutex::new(Some(rx)),
                tx,
                last_partial: Mutex::new(None),
            }
        }

        pub fn set_last_partial(&self, text: &str) {
            *self.last_partial.lock() = Some(TranscriptResult::partial(text, 0.8));
        }
    }

    #[async_trait]
    impl SttStream for ScriptedStt {
        async fn send_audio(&self, _frame: &AudioFrame) -> Result<(), PipelineError> {
            Ok(())
        }

        fn take_events(&self) -> Option<mpsc::Receiver<SttEvent>> {
            self.events.lock().take()
        }

        async fn close(&self) -> Result<Option<TranscriptResult>, PipelineError> {
            Ok(self.last_partial.lock().take().map(|mut t| {
                t.is_final = true;
                t
            }))
        }
    }
}
