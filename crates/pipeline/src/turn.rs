//! Turn controller.
//!
//! Arbitrates who is speaking using two signals: the local pipeline VAD
//! (authoritative for the state machine) and the transcriber's own speech
//! markers (timing hints, low sensitivity). Endpointing waits
//! `min_endpointing_delay` after speech end before committing the turn,
//! bounded by `max_endpointing_delay` which force-commits. With preemptive
//! generation the LLM request starts at endpointing begin and is cancelled
//! if a new partial arrives before commit.
//!
//! The controller never touches the TTS or LLM directly: it emits
//! [`TurnCommand`]s that the session orchestrator routes over channels.

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use callbridge_config::constants::endpointing;

use crate::stt::SttVadSignal;
use crate::vad::{VadTransition, VadUpdate};

/// Turn-taking states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    Listening,
    Thinking,
    Speaking,
    Interrupted,
    Terminated,
}

/// Commands for the session orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnCommand {
    /// Start an LLM request for the transcript so far.
    StartGeneration { transcript: String, preemptive: bool },
    /// Cancel the in-flight LLM request. Fire-and-forget, idempotent.
    CancelGeneration,
    /// The user's turn is final; `transcript` is authoritative.
    CommitTurn { transcript: String, forced: bool },
    /// Stop TTS playback at the next frame boundary.
    InterruptPlayback,
}

/// State-change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnEvent {
    pub from: TurnState,
    pub to: TurnState,
}

/// Controller tuning.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub min_endpointing_delay: Duration,
    pub max_endpointing_delay: Duration,
    pub min_interruption_duration: Duration,
    pub min_interruption_words: usize,
    pub preemptive_generation: bool,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            min_endpointing_delay: Duration::from_secs_f64(
                endpointing::MIN_ENDPOINTING_DELAY_SECS,
            ),
            max_endpointing_delay: Duration::from_secs_f64(
                endpointing::MAX_ENDPOINTING_DELAY_SECS,
            ),
            min_interruption_duration: Duration::from_secs_f64(
                endpointing::MIN_INTERRUPTION_SECS,
            ),
            min_interruption_words: endpointing::MIN_INTERRUPTION_WORDS,
            preemptive_generation: true,
        }
    }
}

struct Inner {
    state: TurnState,
    /// Transcript of the utterance being listened to.
    transcript: String,
    /// Final transcript received from STT for this utterance, if any.
    has_final: bool,
    /// When endpointing began (pipeline VAD speech end).
    endpointing_since: Option<Instant>,
    /// A preemptive generation is in flight for this endpointing window.
    preemptive_started: bool,
    /// The turn has been committed; ignore further endpointing.
    committed: bool,
    /// The reply finished playing before the commit matured.
    tts_completed_early: bool,
    /// Interruption bookkeeping while Speaking.
    interrupt_transcript: String,
    /// Handshake flags for Interrupted -> Listening.
    tts_drained: bool,
    generation_cancelled: bool,
}

impl Inner {
    fn reset_utterance(&mut self) {
        self.transcript.clear();
        self.has_final = false;
        self.endpointing_since = None;
        self.preemptive_started = false;
        self.committed = false;
        self.tts_completed_early = false;
    }
}

/// Dual-VAD turn controller.
pub struct TurnController {
    config: TurnConfig,
    inner: Mutex<Inner>,
    event_tx: broadcast::Sender<TurnEvent>,
}

impl TurnController {
    pub fn new(config: TurnConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        Self {
            config,
            inner: Mutex::new(Inner {
                state: TurnState::Idle,
                transcript: String::new(),
                has_final: false,
                endpointing_since: None,
                preemptive_started: false,
                committed: false,
                tts_completed_early: false,
                interrupt_transcript: String::new(),
                tts_drained: false,
                generation_cancelled: false,
            }),
            event_tx,
        }
    }

    pub fn state(&self) -> TurnState {
        self.inner.lock().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.event_tx.subscribe()
    }

    /// Session start or greeting complete: begin listening.
    pub fn begin_listening(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, TurnState::Idle | TurnState::Speaking) {
            self.transition(&mut inner, TurnState::Listening);
            inner.reset_utterance();
        }
    }

    /// Pipeline VAD update for one audio frame.
    pub fn on_vad(&self, update: &VadUpdate, now: Instant) -> Vec<TurnCommand> {
        let mut inner = self.inner.lock();
        let mut commands = Vec::new();

        match inner.state {
            TurnState::Listening => {
                if update.transition == Some(VadTransition::SpeechEnded) {
                    // Endpointing window opens.
                    inner.endpointing_since = Some(now);
                    if self.config.preemptive_generation
                        && !inner.preemptive_started
                        && !inner.transcript.is_empty()
                    {
                        inner.preemptive_started = true;
                        commands.push(TurnCommand::StartGeneration {
                            transcript: inner.transcript.clone(),
                            preemptive: true,
                        });
                        self.transition(&mut inner, TurnState::Thinking);
                    }
                }
            }
            TurnState::Thinking if !inner.committed => {
                // Speech resuming during the endpointing window aborts the
                // pending commit; handled on the next partial (text is the
                // gate, not bare VAD noise).
            }
            TurnState::Speaking => {
                if update.state.is_speech()
                    && Duration::from_millis(update.speech_ms)
                        >= self.config.min_interruption_duration
                    && inner.interrupt_transcript.split_whitespace().count()
                        >= self.config.min_interruption_words
                {
                    commands.push(TurnCommand::InterruptPlayback);
                    commands.push(TurnCommand::CancelGeneration);
                    inner.tts_drained = false;
                    inner.generation_cancelled = false;
                    metrics::counter!("callbridge_barge_ins").increment(1);
                    self.transition(&mut inner, TurnState::Interrupted);
                }
            }
            _ => {}
        }

        commands
    }

    /// Transcriber speech markers; timing hints only.
    pub fn on_stt_vad(&self, signal: SttVadSignal, now: Instant) {
        // Low sensitivity: only tighten an already-open endpointing window.
        if signal == SttVadSignal::SpeechEnd {
            let mut inner = self.inner.lock();
            if inner.endpointing_since.is_none()
                && inner.state == TurnState::Listening
                && !inner.transcript.is_empty()
            {
                tracing::trace!("Transcriber speech-end hint opened endpointing");
                inner.endpointing_since = Some(now);
            }
        }
    }

    /// STT partial for the current utterance.
    pub fn on_partial(&self, text: &str, _now: Instant) -> Vec<TurnCommand> {
        let mut inner = self.inner.lock();
        let mut commands = Vec::new();

        match inner.state {
            TurnState::Listening => {
                inner.transcript = text.to_string();
                // New speech closes any open endpointing window.
                inner.endpointing_since = None;
            }
            TurnState::Thinking if !inner.committed => {
                // User kept talking: cancel the preemptive request.
                if inner.preemptive_started {
                    commands.push(TurnCommand::CancelGeneration);
                    inner.preemptive_started = false;
                }
                inner.transcript = text.to_string();
                inner.endpointing_since = None;
                self.transition(&mut inner, TurnState::Listening);
            }
            TurnState::Speaking | TurnState::Interrupted => {
                inner.interrupt_transcript = text.to_string();
            }
            _ => {}
        }

        commands
    }

    /// STT final for the current utterance.
    pub fn on_final(&self, text: &str, now: Instant) -> Vec<TurnCommand> {
        let mut inner = self.inner.lock();
        if !text.is_empty() {
            inner.transcript = text.to_string();
        }
        inner.has_final = true;

        // A final plus an elapsed minimum delay commits immediately.
        if let Some(since) = inner.endpointing_since {
            if !inner.committed
                && matches!(
                    inner.state,
                    TurnState::Listening | TurnState::Thinking | TurnState::Speaking
                )
                && now.duration_since(since) >= self.config.min_endpointing_delay
            {
                return self.commit(&mut inner, false);
            }
        }
        Vec::new()
    }

    /// Periodic driver tick; commits when the endpointing window matures.
    pub fn tick(&self, now: Instant) -> Vec<TurnCommand> {
        let mut inner = self.inner.lock();
        if inner.committed
            || !matches!(
                inner.state,
                TurnState::Listening | TurnState::Thinking | TurnState::Speaking
            )
        {
            return Vec::new();
        }
        let Some(since) = inner.endpointing_since else {
            return Vec::new();
        };
        let elapsed = now.duration_since(since);

        if elapsed >= self.config.max_endpointing_delay {
            // Bound reached: commit with whatever we have.
            return self.commit(&mut inner, true);
        }
        if elapsed >= self.config.min_endpointing_delay
            && (inner.has_final || !inner.transcript.is_empty())
        {
            return self.commit(&mut inner, false);
        }
        Vec::new()
    }

    /// First TTS audio chunk of the reply went out.
    pub fn on_tts_started(&self) {
        let mut inner = self.inner.lock();
        if inner.state == TurnState::Thinking {
            inner.interrupt_transcript.clear();
            self.transition(&mut inner, TurnState::Speaking);
        }
    }

    /// TTS finished the utterance and silence follows.
    ///
    /// A fast preemptive reply can finish playing before the endpointing
    /// commit matures; in that case the utterance stays pending so the
    /// commit still fires, and the commit closes the turn.
    pub fn on_tts_complete(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            TurnState::Speaking | TurnState::Thinking if !inner.committed => {
                inner.tts_completed_early = true;
            }
            TurnState::Speaking | TurnState::Thinking => {
                self.transition(&mut inner, TurnState::Listening);
                inner.reset_utterance();
            }
            _ => {}
        }
    }

    /// TTS acknowledged the interrupt and drained pending audio.
    pub fn on_tts_drained(&self) {
        let mut inner = self.inner.lock();
        inner.tts_drained = true;
        self.maybe_leave_interrupted(&mut inner);
    }

    /// LLM acknowledged cancellation (or had nothing in flight).
    pub fn on_generation_cancelled(&self) {
        let mut inner = self.inner.lock();
        inner.generation_cancelled = true;
        self.maybe_leave_interrupted(&mut inner);
    }

    /// Abandon the current turn after an upstream failure and return to
    /// listening. No-op outside `Thinking`/`Speaking`.
    pub fn abort_turn(&self) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, TurnState::Thinking | TurnState::Speaking) {
            self.transition(&mut inner, TurnState::Listening);
            inner.reset_utterance();
        }
    }

    /// Session close: terminal from any state.
    pub fn terminate(&self) {
        let mut inner = self.inner.lock();
        if inner.state != TurnState::Terminated {
            self.transition(&mut inner, TurnState::Terminated);
        }
    }

    fn maybe_leave_interrupted(&self, inner: &mut Inner) {
        if inner.state == TurnState::Interrupted
            && inner.tts_drained
            && inner.generation_cancelled
        {
            self.transition(inner, TurnState::Listening);
            inner.reset_utterance();
            // The words spoken over the agent seed the next utterance.
            inner.transcript = std::mem::take(&mut inner.interrupt_transcript);
        }
    }

    fn commit(&self, inner: &mut Inner, forced: bool) -> Vec<TurnCommand> {
        inner.committed = true;
        inner.endpointing_since = None;
        let transcript = inner.transcript.clone();

        let mut commands = Vec::new();
        if !inner.preemptive_started {
            commands.push(TurnCommand::StartGeneration {
                transcript: transcript.clone(),
                preemptive: false,
            });
        }
        commands.push(TurnCommand::CommitTurn { transcript, forced });
        if inner.tts_completed_early {
            // The reply already played end to end; the turn closes here.
            self.transition(inner, TurnState::Listening);
            inner.reset_utterance();
        } else if inner.state == TurnState::Listening {
            // Commit only ever moves listening forward; a turn already
            // speaking stays where it is.
            self.transition(inner, TurnState::Thinking);
        }
        commands
    }

    fn transition(&self, inner: &mut Inner, to: TurnState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        tracing::debug!(?from, ?to, "Turn state");
        let _ = self.event_tx.send(TurnEvent { from, to });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::VadState;

    fn speech_end_update() -> VadUpdate {
        VadUpdate {
            state: VadState::Silence,
            probability: 0.0,
            transition: Some(VadTransition::SpeechEnded),
            speech_ms: 0,
            silence_ms: 400,
        }
    }

    fn speech_update(speech_ms: u64) -> VadUpdate {
        VadUpdate {
            state: VadState::Speech,
            probability: 0.9,
            transition: None,
            speech_ms,
            silence_ms: 0,
        }
    }

    fn listening_controller(config: TurnConfig) -> TurnController {
        let controller = TurnController::new(config);
        controller.begin_listening();
        controller
    }

    #[test]
    fn preemptive_generation_starts_on_endpointing_begin() {
        let controller = listening_controller(TurnConfig::default());
        let now = Instant::now();

        controller.on_partial("what are the rates", now);
        let commands = controller.on_vad(&speech_end_update(), now);

        assert!(commands.iter().any(|c| matches!(
            c,
            TurnCommand::StartGeneration {
                preemptive: true,
                ..
            }
        )));
        assert_eq!(controller.state(), TurnState::Thinking);
    }

    #[test]
    fn new_partial_cancels_preemptive_request() {
        let controller = listening_controller(TurnConfig::default());
        let now = Instant::now();

        controller.on_partial("what are", now);
        controller.on_vad(&speech_end_update(), now);
        let commands = controller.on_partial("what are the charges", now);

        assert!(commands.contains(&TurnCommand::CancelGeneration));
        assert_eq!(controller.state(), TurnState::Listening);
    }

    #[test]
    fn commit_after_min_delay_with_transcript() {
        let controller = listening_controller(TurnConfig::default());
        let start = Instant::now();

        controller.on_partial("hello there", start);
        controller.on_vad(&speech_end_update(), start);

        // Just before the minimum: nothing.
        let commands = controller.tick(start + Duration::from_millis(399));
        assert!(commands.is_empty());

        let commands = controller.tick(start + Duration::from_millis(400));
        assert!(commands.iter().any(|c| matches!(
            c,
            TurnCommand::CommitTurn { forced: false, .. }
        )));
    }

    #[test]
    fn max_delay_force_commits_without_transcript() {
        let config = TurnConfig {
            preemptive_generation: false,
            ..Default::default()
        };
        let controller = listening_controller(config);
        let start = Instant::now();

        // Speech ended but no partial ever arrived.
        controller.on_vad(&speech_end_update(), start);

        assert!(controller.tick(start + Duration::from_millis(500)).is_empty());

        let commands = controller.tick(start + Duration::from_millis(800));
        assert!(commands.iter().any(|c| matches!(
            c,
            TurnCommand::CommitTurn { forced: true, .. }
        )));
        // Non-preemptive path also starts generation at commit.
        assert!(commands.iter().any(|c| matches!(
            c,
            TurnCommand::StartGeneration {
                preemptive: false,
                ..
            }
        )));
    }

    #[test]
    fn interruption_thresholds_are_exact() {
        let controller = listening_controller(TurnConfig::default());
        let now = Instant::now();

        // Drive to Speaking.
        controller.on_partial("question", now);
        controller.on_vad(&speech_end_update(), now);
        controller.tick(now + Duration::from_millis(400));
        controller.on_tts_started();
        assert_eq!(controller.state(), TurnState::Speaking);

        // One word transcribed while the agent speaks.
        controller.on_partial("wait", now);

        // 149 ms of speech: no interrupt.
        let commands = controller.on_vad(&speech_update(149), now);
        assert!(commands.is_empty());
        assert_eq!(controller.state(), TurnState::Speaking);

        // 150 ms: interrupt fires.
        let commands = controller.on_vad(&speech_update(150), now);
        assert!(commands.contains(&TurnCommand::InterruptPlayback));
        assert!(commands.contains(&TurnCommand::CancelGeneration));
        assert_eq!(controller.state(), TurnState::Interrupted);
    }

    #[test]
    fn interruption_requires_a_word() {
        let controller = listening_controller(TurnConfig::default());
        let now = Instant::now();

        controller.on_partial("question", now);
        controller.on_vad(&speech_end_update(), now);
        controller.tick(now + Duration::from_millis(400));
        controller.on_tts_started();

        // Long speech but no transcribed word: background noise.
        let commands = controller.on_vad(&speech_update(500), now);
        assert!(commands.is_empty());
        assert_eq!(controller.state(), TurnState::Speaking);
    }

    #[test]
    fn interrupted_returns_to_listening_after_both_acks() {
        let controller = listening_controller(TurnConfig::default());
        let now = Instant::now();

        controller.on_partial("question", now);
        controller.on_vad(&speech_end_update(), now);
        controller.tick(now + Duration::from_millis(400));
        controller.on_tts_started();
        controller.on_partial("wait", now);
        controller.on_vad(&speech_update(200), now);
        assert_eq!(controller.state(), TurnState::Interrupted);

        controller.on_tts_drained();
        assert_eq!(controller.state(), TurnState::Interrupted);
        controller.on_generation_cancelled();
        assert_eq!(controller.state(), TurnState::Listening);
    }

    #[test]
    fn tts_complete_returns_to_listening() {
        let controller = listening_controller(TurnConfig::default());
        let now = Instant::now();

        controller.on_partial("question", now);
        controller.on_vad(&speech_end_update(), now);
        controller.tick(now + Duration::from_millis(400));
        controller.on_tts_started();
        controller.on_tts_complete();
        assert_eq!(controller.state(), TurnState::Listening);
    }

    #[test]
    fn terminate_from_any_state() {
        let controller = listening_controller(TurnConfig::default());
        controller.terminate();
        assert_eq!(controller.state(), TurnState::Terminated);
    }

    #[test]
    fn fast_reply_finishing_before_commit_still_commits() {
        let controller = listening_controller(TurnConfig::default());
        let now = Instant::now();

        controller.on_partial("quick question", now);
        controller.on_vad(&speech_end_update(), now);
        controller.on_tts_started();
        assert_eq!(controller.state(), TurnState::Speaking);

        // The whole reply plays out before the endpointing window
        // matures.
        controller.on_tts_complete();
        assert_eq!(controller.state(), TurnState::Speaking);

        let commands = controller.tick(now + Duration::from_millis(400));
        assert!(commands
            .iter()
            .any(|c| matches!(c, TurnCommand::CommitTurn { .. })));
        // The commit closes the already-played turn.
        assert_eq!(controller.state(), TurnState::Listening);
    }

    #[test]
    fn abort_recovers_a_stuck_turn() {
        let controller = listening_controller(TurnConfig::default());
        let now = Instant::now();

        controller.on_partial("question", now);
        controller.on_vad(&speech_end_update(), now);
        controller.tick(now + Duration::from_millis(400));
        assert_eq!(controller.state(), TurnState::Thinking);

        controller.abort_turn();
        assert_eq!(controller.state(), TurnState::Listening);

        // Outside thinking/speaking it is a no-op.
        controller.abort_turn();
        assert_eq!(controller.state(), TurnState::Listening);
    }

    #[test]
    fn final_commits_once_min_delay_elapsed() {
        let controller = listening_controller(TurnConfig::default());
        let start = Instant::now();

        controller.on_partial("how do i apply", start);
        controller.on_vad(&speech_end_update(), start);
        let commands =
            controller.on_final("how do i apply", start + Duration::from_millis(450));
        assert!(commands.iter().any(|c| matches!(
            c,
            TurnCommand::CommitTurn { forced: false, .. }
        )));
    }
}
