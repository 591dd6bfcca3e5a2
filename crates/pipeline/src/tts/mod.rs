//! Streaming text-to-speech.
//!
//! Text fragments stream in, the [`segmenter::SentenceSegmenter`] cuts
//! them at language-aware boundaries, and each segment is synthesized to
//! PCM. Short repeated phrases (greetings, confirmations) are served from
//! a phrase cache. `interrupt` discards pending audio at the next frame
//! boundary.

pub mod segmenter;
mod ws;

pub use ws::WsSynthesizer;

use async_trait::async_trait;
use callbridge_core::{Language, LruTtlCache};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::PipelineError;
use segmenter::{SentenceSegmenter, TextSegment};

/// Phrases below this byte length are phrase-cache candidates.
const PHRASE_CACHE_MAX_LEN: usize = 120;

/// TTS configuration.
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub voice_id: String,
    pub language: Language,
    /// Output sample rate of synthesized PCM.
    pub sample_rate: u32,
    pub phrase_cache_capacity: usize,
    pub phrase_cache_ttl: Duration,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            voice_id: "default".to_string(),
            language: Language::default(),
            sample_rate: 24_000,
            phrase_cache_capacity: 128,
            phrase_cache_ttl: Duration::from_secs(600),
        }
    }
}

/// Events emitted while speaking.
#[derive(Debug, Clone)]
pub enum TtsEvent {
    Started,
    /// One PCM chunk of a segment.
    Audio {
        pcm: Arc<Vec<u8>>,
        segment_text: String,
        segment_index: usize,
    },
    /// A segment finished cleanly.
    SegmentDone { segment_index: usize },
    /// The whole utterance finished.
    Complete,
    /// Playback was interrupted; pending audio was discarded.
    Interrupted { at_segment: usize },
    Error(String),
}

/// Vendor synthesis backend.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Synthesize one segment to PCM chunks.
    async fn synthesize(
        &self,
        text: &str,
        voice_id: &str,
        language: Language,
    ) -> Result<Vec<Vec<u8>>, PipelineError>;
}

/// Streaming TTS with segmentation, phrase cache and interruption.
pub struct TtsStream {
    config: TtsConfig,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    phrase_cache: Arc<LruTtlCache<String, Arc<Vec<u8>>>>,
    /// Utterance generation. `interrupt` bumps it; a speak task stops as
    /// soon as its own generation is stale, which lands on a chunk
    /// boundary.
    generation: Arc<AtomicU64>,
}

impl TtsStream {
    pub fn new(synthesizer: Arc<dyn SpeechSynthesizer>, config: TtsConfig) -> Self {
        let phrase_cache = Arc::new(LruTtlCache::new(
            config.phrase_cache_capacity,
            config.phrase_cache_ttl,
        ));
        Self {
            config,
            synthesizer,
            phrase_cache,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Synthesize fixed phrases ahead of time into the phrase cache.
    pub async fn prewarm(&self, phrases: &[String]) {
        for phrase in phrases {
            if phrase.len() > PHRASE_CACHE_MAX_LEN {
                continue;
            }
            let key = cache_key(&self.config, phrase);
            if self.phrase_cache.get(&key).is_some() {
                continue;
            }
            match self
                .synthesizer
                .synthesize(phrase, &self.config.voice_id, self.config.language)
                .await
            {
                Ok(chunks) => {
                    let joined: Vec<u8> = chunks.into_iter().flatten().collect();
                    self.phrase_cache.insert(key, Arc::new(joined));
                }
                Err(e) => {
                    tracing::warn!(error = %e, phrase = %phrase, "TTS prewarm failed");
                }
            }
        }
    }

    /// Speak a complete text. Convenience over [`TtsStream::speak_fragments`].
    pub fn say(&self, text: &str, allow_interruptions: bool) -> mpsc::Receiver<TtsEvent> {
        let (frag_tx, events) = self.speak_fragments(allow_interruptions);
        let text = text.to_string();
        tokio::spawn(async move {
            let _ = frag_tx.send(text).await;
        });
        events
    }

    /// Speak a lazy sequence of text fragments.
    ///
    /// Returns the fragment sender and the event receiver. Dropping the
    /// sender marks end-of-input and flushes the final segment.
    pub fn speak_fragments(
        &self,
        allow_interruptions: bool,
    ) -> (mpsc::Sender<String>, mpsc::Receiver<TtsEvent>) {
        let (frag_tx, frag_rx) = mpsc::channel::<String>(64);
        let (event_tx, event_rx) = mpsc::channel::<TtsEvent>(32);

        // New utterance generation.
        let my_generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let task = SpeakTask {
            synthesizer: self.synthesizer.clone(),
            phrase_cache: self.phrase_cache.clone(),
            config: self.config.clone(),
            generation: self.generation.clone(),
            my_generation,
            allow_interruptions,
        };
        tokio::spawn(task.run(frag_rx, event_tx));

        (frag_tx, event_rx)
    }

    /// Discard pending audio at the next frame boundary. Idempotent.
    pub fn interrupt(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn phrase_cache_stats(&self) -> callbridge_core::CacheStats {
        self.phrase_cache.stats()
    }
}

fn cache_key(config: &TtsConfig, phrase: &str) -> String {
    format!(
        "{}|{}|{}",
        config.voice_id,
        config.language.code(),
        phrase.trim()
    )
}

struct SpeakTask {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    phrase_cache: Arc<LruTtlCache<String, Arc<Vec<u8>>>>,
    config: TtsConfig,
    generation: Arc<AtomicU64>,
    my_generation: u64,
    allow_interruptions: bool,
}

impl SpeakTask {
    fn is_interrupted(&self) -> bool {
        self.allow_interruptions && self.generation.load(Ordering::SeqCst) != self.my_generation
    }

    async fn run(self, mut fragments: mpsc::Receiver<String>, event_tx: mpsc::Sender<TtsEvent>) {
        let _ = event_tx.send(TtsEvent::Started).await;
        let mut segmenter = SentenceSegmenter::new(self.config.language);
        let mut last_index = 0usize;

        while let Some(fragment) = fragments.recv().await {
            for segment in segmenter.push(&fragment) {
                last_index = segment.index;
                match self.speak_segment(segment, &event_tx).await {
                    SegmentOutcome::Done => {}
                    SegmentOutcome::Interrupted => {
                        let _ = event_tx
                            .send(TtsEvent::Interrupted {
                                at_segment: last_index,
                            })
                            .await;
                        return;
                    }
                    SegmentOutcome::Failed => return,
                }
            }
        }

        if let Some(segment) = segmenter.flush() {
            last_index = segment.index;
            match self.speak_segment(segment, &event_tx).await {
                SegmentOutcome::Done => {}
                SegmentOutcome::Interrupted => {
                    let _ = event_tx
                        .send(TtsEvent::Interrupted {
                            at_segment: last_index,
                        })
                        .await;
                    return;
                }
                SegmentOutcome::Failed => return,
            }
        }

        if !self.is_interrupted() {
            let _ = event_tx.send(TtsEvent::Complete).await;
        }
    }

    async fn speak_segment(
        &self,
        segment: TextSegment,
        event_tx: &mpsc::Sender<TtsEvent>,
    ) -> SegmentOutcome {
        if self.is_interrupted() {
            return SegmentOutcome::Interrupted;
        }

        let chunks = match self.resolve_audio(&segment.text).await {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::error!(error = %e, segment = %segment.text, "TTS synthesis failed");
                let _ = event_tx.send(TtsEvent::Error(e.to_string())).await;
                return SegmentOutcome::Failed;
            }
        };

        for pcm in chunks {
            // Interruption lands on a chunk boundary: audio already sent
            // stays on the wire, the rest is dropped here.
            if self.is_interrupted() {
                return SegmentOutcome::Interrupted;
            }
            if event_tx
                .send(TtsEvent::Audio {
                    pcm,
                    segment_text: segment.text.clone(),
                    segment_index: segment.index,
                })
                .await
                .is_err()
            {
                return SegmentOutcome::Failed;
            }
        }

        let _ = event_tx
            .send(TtsEvent::SegmentDone {
                segment_index: segment.index,
            })
            .await;
        SegmentOutcome::Done
    }

    /// Phrase cache first for short segments, synthesizer otherwise.
    async fn resolve_audio(&self, text: &str) -> Result<Vec<Arc<Vec<u8>>>, PipelineError> {
        let cacheable = text.len() <= PHRASE_CACHE_MAX_LEN;
        let key = cache_key(&self.config, text);

        if cacheable {
            if let Some(cached) = self.phrase_cache.get(&key) {
                return Ok(vec![cached]);
            }
        }

        let chunks = self
            .synthesizer
            .synthesize(text, &self.config.voice_id, self.config.language)
            .await?;

        if cacheable {
            let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
            self.phrase_cache.insert(key, Arc::new(joined));
        }

        Ok(chunks.into_iter().map(Arc::new).collect())
    }
}

enum SegmentOutcome {
    Done,
    Interrupted,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthesizer producing one silent chunk per 10 input bytes.
    struct SilenceSynth {
        delay: Duration,
    }

    #[async_trait]
    impl SpeechSynthesizer for SilenceSynth {
        fn sample_rate(&self) -> u32 {
            24_000
        }

        async fn synthesize(
            &self,
            text: &str,
            _voice_id: &str,
            _language: Language,
        ) -> Result<Vec<Vec<u8>>, PipelineError> {
            tokio::time::sleep(self.delay).await;
            let chunk_count = (text.len() / 10).max(1);
            Ok((0..chunk_count).map(|_| vec![0u8; 640]).collect())
        }
    }

    fn stream(delay_ms: u64) -> TtsStream {
        TtsStream::new(
            Arc::new(SilenceSynth {
                delay: Duration::from_millis(delay_ms),
            }),
            TtsConfig {
                language: Language::Hindi,
                ..Default::default()
            },
        )
    }

    async fn collect(mut rx: mpsc::Receiver<TtsEvent>) -> Vec<TtsEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn hindi_turn_speaks_in_sentence_order() {
        let tts = stream(0);
        let rx = tts.say("नमस्ते, आप कैसे हैं? मैं ठीक हूँ।", true);
        let events = collect(rx).await;

        let segments: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                TtsEvent::Audio { segment_text, .. } => Some(segment_text.as_str()),
                _ => None,
            })
            .collect();
        assert!(segments.first().unwrap().starts_with("नमस्ते"));
        assert!(segments.iter().any(|s| s.contains("ठीक")));
        assert!(matches!(events.last(), Some(TtsEvent::Complete)));

        // First segment is the question up to the boundary.
        assert_eq!(segments[0], "नमस्ते, आप कैसे हैं?");
    }

    #[tokio::test]
    async fn interrupt_discards_pending_audio() {
        let tts = stream(50);
        let (frag_tx, rx) = tts.speak_fragments(true);
        frag_tx
            .send("पहला वाक्य यहाँ पर पूरा होता है। दूसरा वाक्य यहाँ पर पूरा होता है। ".to_string())
            .await
            .unwrap();
        drop(frag_tx);

        // Let the first segment get underway, then interrupt.
        tokio::time::sleep(Duration::from_millis(20)).await;
        tts.interrupt();

        let events = collect(rx).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, TtsEvent::Interrupted { .. })));
        assert!(!events.iter().any(|e| matches!(e, TtsEvent::Complete)));
    }

    #[tokio::test]
    async fn phrase_cache_serves_repeats() {
        let tts = stream(0);
        let _ = collect(tts.say("धन्यवाद, फिर मिलेंगे।", true)).await;
        let _ = collect(tts.say("धन्यवाद, फिर मिलेंगे।", true)).await;

        let stats = tts.phrase_cache_stats();
        assert!(stats.hits >= 1, "second say should hit the cache");
    }

    #[tokio::test]
    async fn prewarm_populates_cache() {
        let tts = stream(0);
        tts.prewarm(&["नमस्ते!".to_string()]).await;
        let stats = tts.phrase_cache_stats();
        assert_eq!(stats.size, 1);
    }

    #[tokio::test]
    async fn uninterruptible_say_ignores_interrupt() {
        let tts = stream(10);
        let rx = tts.say("यह एक लम्बा पूरा वाक्य है जो बोला जाएगा।", false);
        tts.interrupt();
        let events = collect(rx).await;
        assert!(matches!(events.last(), Some(TtsEvent::Complete)));
    }
}
