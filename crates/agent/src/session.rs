//! The voice session.
//!
//! One session per live call. The session task owns the turn controller
//! and is the single writer of the transcript and the outbound audio
//! channel; STT, TTS and the LLM communicate with it over bounded
//! channels only.
//!
//! Lifecycle: `on_enter` registers the call with the integration
//! dispatcher, waits for the audio path to settle, then speaks the
//! greeting (the segmenter cuts it at the first sentence boundary so the
//! caller hears speech early). `on_exit` logs a summary, flushes latency
//! samples, persists the transcript, dispatches `call_ended` and marks
//! the session completed.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};

use callbridge_config::constants::session as session_constants;
use callbridge_core::{
    AudioFrame, Language, LatencySample, LatencyTargets, LatencyTracker, Operation,
    OperationStats, Speaker, TranscriptEntry,
};
use callbridge_llm::Role;
use callbridge_integrations::{Dispatcher, IntegrationBinding};
use callbridge_llm::{
    Cancellation, ChatBackend, FinishReason, GenerateRequest, Message, StreamEvent, ToolCall,
};
use callbridge_pipeline::{
    PipelineVad, SttEvent, SttStream, TtsEvent, TtsStream, TurnCommand, TurnConfig,
    TurnController,
};

use crate::tools::{ToolContext, ToolRegistry};
use crate::AgentError;

/// Per-agent configuration loaded from the datastore.
#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub agent_id: String,
    pub organization_id: String,
    pub display_name: String,
    pub persona_name: String,
    pub language: Language,
    pub voice_id: String,
    pub system_prompt: String,
    /// Overrides the call-type default greeting when set.
    pub greeting: Option<String>,
    pub farewell: String,
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct VoiceSessionConfig {
    pub turn: TurnConfig,
    pub max_tool_steps: usize,
    /// Wait for the audio path before the greeting.
    pub audio_settle: Duration,
    pub latency_targets: LatencyTargets,
}

impl Default for VoiceSessionConfig {
    fn default() -> Self {
        Self {
            turn: TurnConfig::default(),
            max_tool_steps: session_constants::MAX_TOOL_STEPS,
            audio_settle: Duration::from_secs(session_constants::AUDIO_PATH_SETTLE_SECS),
            latency_targets: LatencyTargets::default(),
        }
    }
}

/// Where the session flushes its results at exit.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn persist_transcript(
        &self,
        session_id: &str,
        entries: &[TranscriptEntry],
    ) -> Result<(), AgentError>;

    async fn flush_latency(
        &self,
        session_id: &str,
        agent_id: &str,
        samples: &[LatencySample],
    ) -> Result<(), AgentError>;

    async fn mark_completed(
        &self,
        session_id: &str,
        duration_seconds: i64,
    ) -> Result<(), AgentError>;
}

/// Observable session events.
#[derive(Debug, Clone)]
pub enum VoiceSessionEvent {
    Greeted,
    UserTurn { text: String },
    AgentTurn { text: String },
    ToolCalled { name: String },
    Interrupted,
    Ended { reason: String },
}

/// Exit summary.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: String,
    pub turns: usize,
    pub duration_seconds: i64,
    pub latency: Vec<OperationStats>,
}

/// One live voice session.
pub struct VoiceSession {
    session_id: String,
    call_type: String,
    profile: AgentProfile,
    config: VoiceSessionConfig,

    vad: Arc<PipelineVad>,
    stt: Arc<dyn SttStream>,
    tts: Arc<TtsStream>,
    llm: Arc<dyn ChatBackend>,
    turn: Arc<TurnController>,
    latency: Arc<LatencyTracker>,
    tools: Arc<ToolRegistry>,
    dispatcher: Arc<Dispatcher>,
    bindings: Vec<IntegrationBinding>,
    sink: Arc<dyn SessionSink>,

    /// Outbound PCM to the transport. Single writer: this session.
    audio_out: mpsc::Sender<Arc<Vec<u8>>>,
    transcript: Mutex<Vec<TranscriptEntry>>,
    history: Mutex<Vec<Message>>,
    event_tx: broadcast::Sender<VoiceSessionEvent>,
    /// Last inbound audio frame; STT event latencies measure from here.
    last_audio_at: Mutex<Instant>,
}

/// State of the in-flight LLM/TTS machinery for one turn.
struct TurnMachinery {
    llm_rx: Option<mpsc::Receiver<Result<StreamEvent, callbridge_llm::LlmError>>>,
    frag_tx: Option<mpsc::Sender<String>>,
    tts_rx: Option<mpsc::Receiver<TtsEvent>>,
    cancellation: Option<Cancellation>,
    tool_steps: usize,
    /// Set at commit; consumed by the first TTS audio byte (e2e_turn).
    speech_end_at: Option<Instant>,
    ttft_handle: Option<callbridge_core::LatencyHandle>,
    llm_total_handle: Option<callbridge_core::LatencyHandle>,
    ttfb_handle: Option<callbridge_core::LatencyHandle>,
    first_audio_sent: bool,
    response_text: String,
}

impl TurnMachinery {
    fn idle() -> Self {
        Self {
            llm_rx: None,
            frag_tx: None,
            tts_rx: None,
            cancellation: None,
            tool_steps: 0,
            speech_end_at: None,
            ttft_handle: None,
            llm_total_handle: None,
            ttfb_handle: None,
            first_audio_sent: false,
            response_text: String::new(),
        }
    }
}

impl VoiceSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        call_type: impl Into<String>,
        profile: AgentProfile,
        config: VoiceSessionConfig,
        vad: Arc<PipelineVad>,
        stt: Arc<dyn SttStream>,
        tts: Arc<TtsStream>,
        llm: Arc<dyn ChatBackend>,
        tools: Arc<ToolRegistry>,
        dispatcher: Arc<Dispatcher>,
        bindings: Vec<IntegrationBinding>,
        sink: Arc<dyn SessionSink>,
        audio_out: mpsc::Sender<Arc<Vec<u8>>>,
    ) -> Self {
        let session_id = session_id.into();
        let latency = Arc::new(LatencyTracker::new(
            session_id.clone(),
            config.latency_targets.clone(),
        ));
        let turn = Arc::new(TurnController::new(config.turn.clone()));
        let (event_tx, _) = broadcast::channel(64);
        let history = vec![Message::system(&profile.system_prompt)];

        Self {
            session_id,
            call_type: call_type.into(),
            profile,
            config,
            vad,
            stt,
            tts,
            llm,
            turn,
            latency,
            tools,
            dispatcher,
            bindings,
            sink,
            audio_out,
            transcript: Mutex::new(Vec::new()),
            history: Mutex::new(history),
            event_tx,
            last_audio_at: Mutex::new(Instant::now()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceSessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn latency_tracker(&self) -> Arc<LatencyTracker> {
        self.latency.clone()
    }

    fn emit(&self, event: VoiceSessionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn append_transcript(&self, entry: TranscriptEntry) {
        self.transcript.lock().push(entry);
    }

    /// Run the session to completion.
    ///
    /// `audio_rx` carries caller audio frames; `end_rx` flips when a tool
    /// or the transport asks to end; `shutdown_rx` flips on process
    /// shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut audio_rx: mpsc::Receiver<AudioFrame>,
        mut end_rx: watch::Receiver<bool>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<SessionSummary, AgentError> {
        let started_at = Instant::now();
        self.on_enter().await?;

        let mut stt_rx = self
            .stt
            .take_events()
            .ok_or_else(|| AgentError::Session("STT events already taken".to_string()))?;
        let mut machinery = TurnMachinery::idle();
        let mut tick = tokio::time::interval(Duration::from_millis(50));
        let mut end_reason = "caller_disconnected".to_string();
        let mut turns = 0usize;

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        end_reason = "shutdown".to_string();
                        break;
                    }
                }

                changed = end_rx.changed() => {
                    if changed.is_err() || *end_rx.borrow() {
                        end_reason = "agent_ended".to_string();
                        break;
                    }
                }

                frame = audio_rx.recv() => {
                    match frame {
                        Some(mut frame) => {
                            *self.last_audio_at.lock() = Instant::now();
                            let update = match self.vad.process(&mut frame) {
                                Ok(update) => update,
                                Err(e) => {
                                    tracing::warn!(error = %e, "VAD error, frame skipped");
                                    continue;
                                }
                            };
                            if let Err(e) = self.stt.send_audio(&frame).await {
                                // A dead transcriber ends this call; the
                                // process carries on.
                                tracing::error!(error = %e, "STT transport failed");
                                end_reason = "transport_failure".to_string();
                                break;
                            }
                            let commands = self.turn.on_vad(&update, Instant::now());
                            self.handle_commands(commands, &mut machinery, &mut turns).await?;
                        }
                        None => {
                            end_reason = "caller_disconnected".to_string();
                            break;
                        }
                    }
                }

                event = stt_rx.recv() => {
                    match event {
                        Some(event) => {
                            let commands = self.handle_stt_event(event);
                            self.handle_commands(commands, &mut machinery, &mut turns).await?;
                        }
                        None => {
                            end_reason = "transcriber_closed".to_string();
                            break;
                        }
                    }
                }

                event = recv_opt(&mut machinery.llm_rx) => {
                    match event {
                        Some(event) => {
                            self.handle_llm_event(event, &mut machinery).await?;
                        }
                        None => {
                            machinery.llm_rx = None;
                        }
                    }
                }

                event = recv_opt(&mut machinery.tts_rx) => {
                    match event {
                        Some(event) => self.handle_tts_event(event, &mut machinery).await,
                        None => {
                            // Closed without Complete/Interrupted: the
                            // synthesis task died. Recover to listening.
                            machinery.tts_rx = None;
                            self.turn.abort_turn();
                        }
                    }
                }

                _ = tick.tick() => {
                    let commands = self.turn.tick(Instant::now());
                    self.handle_commands(commands, &mut machinery, &mut turns).await?;
                }
            }
        }

        // Cancel anything in flight before the farewell.
        if let Some(cancellation) = &machinery.cancellation {
            cancellation.cancel();
        }
        self.speak_farewell(&end_reason).await;
        self.turn.terminate();

        let duration_seconds = started_at.elapsed().as_secs() as i64;
        let summary = self.on_exit(turns, duration_seconds, &end_reason).await?;
        Ok(summary)
    }

    /// Register the call, settle the audio path, speak the greeting.
    async fn on_enter(&self) -> Result<(), AgentError> {
        self.dispatcher.on_call_started(
            &self.session_id,
            Some(self.profile.agent_id.clone()),
            &self.profile.organization_id,
            &self.call_type,
        );

        tokio::time::sleep(self.config.audio_settle).await;

        let greeting = self
            .profile
            .greeting
            .clone()
            .unwrap_or_else(|| "Hello! How can I help you today?".to_string());

        let mut ttfb = Some(self.latency.start(Operation::TtsTtfb));
        let mut events = self.tts.say(&greeting, true);
        while let Some(event) = events.recv().await {
            match event {
                TtsEvent::Audio { pcm, .. } => {
                    if let Some(handle) = ttfb.take() {
                        self.latency.end(handle);
                    }
                    break_or_send(&self.audio_out, pcm).await;
                }
                TtsEvent::Complete | TtsEvent::Interrupted { .. } => break,
                TtsEvent::Error(e) => {
                    tracing::warn!(error = %e, "Greeting synthesis failed");
                    break;
                }
                _ => {}
            }
        }

        self.append_transcript(TranscriptEntry::speech(Speaker::Agent, &greeting));
        self.record_dispatcher_line(TranscriptEntry::speech(Speaker::Agent, &greeting));
        self.emit(VoiceSessionEvent::Greeted);
        // Greeting complete: idle -> listening.
        self.turn.begin_listening();
        Ok(())
    }

    /// Summary, metric flush, transcript persist, integration fan-out.
    async fn on_exit(
        &self,
        turns: usize,
        duration_seconds: i64,
        end_reason: &str,
    ) -> Result<SessionSummary, AgentError> {
        let latency_stats = self.latency.session_stats();
        tracing::info!(
            session_id = %self.session_id,
            agent_id = %self.profile.agent_id,
            turns,
            duration_seconds,
            end_reason,
            "Session summary"
        );
        for stats in &latency_stats {
            tracing::info!(
                session_id = %self.session_id,
                operation = stats.operation.as_str(),
                count = stats.count,
                avg_ms = stats.avg_ms,
                p95_ms = stats.p95_ms,
                exceeded = stats.exceeded_count,
                "Latency"
            );
        }

        let samples = self.latency.drain();
        if let Err(e) = self
            .sink
            .flush_latency(&self.session_id, &self.profile.agent_id, &samples)
            .await
        {
            tracing::error!(error = %e, "Latency flush failed");
        }

        let transcript = self.transcript.lock().clone();
        if let Err(e) = self
            .sink
            .persist_transcript(&self.session_id, &transcript)
            .await
        {
            tracing::error!(error = %e, "Transcript persist failed");
        }

        match self
            .dispatcher
            .dispatch_call_ended(&self.session_id, &self.bindings)
            .await
        {
            Ok(outcomes) => {
                for outcome in outcomes.iter().filter(|o| !o.success) {
                    tracing::warn!(
                        integration = %outcome.integration_id,
                        error = ?outcome.error,
                        "Integration dispatch failed"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "Integration dispatch skipped"),
        }

        if let Err(e) = self
            .sink
            .mark_completed(&self.session_id, duration_seconds)
            .await
        {
            tracing::error!(error = %e, "Completion mark failed");
        }

        self.emit(VoiceSessionEvent::Ended {
            reason: end_reason.to_string(),
        });

        Ok(SessionSummary {
            session_id: self.session_id.clone(),
            turns,
            duration_seconds,
            latency: latency_stats,
        })
    }

    fn handle_stt_event(&self, event: SttEvent) -> Vec<TurnCommand> {
        let now = Instant::now();
        match event {
            SttEvent::Partial { text, .. } => {
                self.latency
                    .mark(Operation::SttPartial, self.last_audio_at.lock().elapsed());
                self.turn.on_partial(&text, now)
            }
            SttEvent::Final { text, .. } => {
                self.latency
                    .mark(Operation::SttFinal, self.last_audio_at.lock().elapsed());
                self.turn.on_final(&text, now)
            }
            SttEvent::VadSignal(signal) => {
                self.turn.on_stt_vad(signal, now);
                Vec::new()
            }
            SttEvent::Error(e) => {
                tracing::warn!(error = %e, "STT stream error");
                Vec::new()
            }
            SttEvent::Closed => Vec::new(),
        }
    }

    async fn handle_commands(
        &self,
        commands: Vec<TurnCommand>,
        machinery: &mut TurnMachinery,
        turns: &mut usize,
    ) -> Result<(), AgentError> {
        for command in commands {
            match command {
                TurnCommand::StartGeneration { transcript, .. } => {
                    self.start_generation(&transcript, machinery).await?;
                }
                TurnCommand::CancelGeneration => {
                    if let Some(cancellation) = machinery.cancellation.take() {
                        cancellation.cancel();
                    }
                    machinery.llm_rx = None;
                    machinery.frag_tx = None;
                    // A cancelled preemptive round leaves its user message
                    // at the top of the history; the next round re-adds
                    // the fuller transcript.
                    {
                        let mut history = self.history.lock();
                        if matches!(history.last(), Some(m) if m.role == Role::User) {
                            history.pop();
                        }
                    }
                    self.turn.on_generation_cancelled();
                }
                TurnCommand::CommitTurn { transcript, forced } => {
                    machinery.speech_end_at = Some(Instant::now());
                    *turns += 1;
                    metrics::counter!("callbridge_turns").increment(1);
                    if !transcript.is_empty() {
                        self.append_transcript(TranscriptEntry::speech(
                            Speaker::User,
                            &transcript,
                        ));
                        self.record_dispatcher_line(TranscriptEntry::speech(
                            Speaker::User,
                            &transcript,
                        ));
                        self.emit(VoiceSessionEvent::UserTurn { text: transcript });
                    } else if forced {
                        tracing::debug!("Forced commit with empty transcript");
                    }
                }
                TurnCommand::InterruptPlayback => {
                    self.tts.interrupt();
                    self.emit(VoiceSessionEvent::Interrupted);
                }
            }
        }
        Ok(())
    }

    /// Kick off one LLM round for the user's transcript.
    async fn start_generation(
        &self,
        user_text: &str,
        machinery: &mut TurnMachinery,
    ) -> Result<(), AgentError> {
        // A fresh turn supersedes any stale machinery.
        if let Some(cancellation) = machinery.cancellation.take() {
            cancellation.cancel();
        }
        *machinery = TurnMachinery::idle();

        {
            let mut history = self.history.lock();
            history.push(Message::user(user_text));
        }

        let cancellation = Cancellation::new();
        let request = self.build_request(true);
        machinery.ttft_handle = Some(self.latency.start(Operation::LlmTtft));
        machinery.llm_total_handle = Some(self.latency.start(Operation::LlmTotal));

        let llm_rx = self
            .llm
            .generate_stream(request, cancellation.clone())
            .await?;
        machinery.llm_rx = Some(llm_rx);
        machinery.cancellation = Some(cancellation);

        // TTS consumes fragments as the model produces them.
        let (frag_tx, tts_rx) = self.tts.speak_fragments(true);
        machinery.ttfb_handle = Some(self.latency.start(Operation::TtsTtfb));
        machinery.frag_tx = Some(frag_tx);
        machinery.tts_rx = Some(tts_rx);
        Ok(())
    }

    fn build_request(&self, with_tools: bool) -> GenerateRequest {
        let history = self.history.lock().clone();
        let mut request = GenerateRequest::new(&self.profile.system_prompt);
        request.messages = history;
        if with_tools && !self.tools.is_empty() {
            request = request.with_tools(self.tools.definitions());
        }
        request
    }

    async fn handle_llm_event(
        &self,
        event: Result<StreamEvent, callbridge_llm::LlmError>,
        machinery: &mut TurnMachinery,
    ) -> Result<(), AgentError> {
        match event {
            Ok(StreamEvent::Delta(delta)) => {
                if let Some(handle) = machinery.ttft_handle.take() {
                    self.latency.end(handle);
                }
                machinery.response_text.push_str(&delta);
                if let Some(frag_tx) = &machinery.frag_tx {
                    if frag_tx.send(delta).await.is_err() {
                        tracing::debug!("TTS fragment channel closed mid-turn");
                    }
                }
            }
            Ok(StreamEvent::ToolCalls(calls)) => {
                self.run_tool_calls(calls, machinery).await?;
            }
            Ok(StreamEvent::Done(reason)) => {
                machinery.llm_rx = None;
                if let Some(handle) = machinery.llm_total_handle.take() {
                    self.latency.end(handle);
                }
                match reason {
                    FinishReason::Cancelled => {
                        machinery.frag_tx = None;
                        self.turn.on_generation_cancelled();
                    }
                    FinishReason::ToolCalls => {
                        // The follow-up round is already running (or the
                        // budget stopped it); keep the fragment channel.
                    }
                    _ => {
                        // Close the fragment channel: TTS flushes the tail.
                        machinery.frag_tx = None;
                        if !machinery.response_text.is_empty() {
                            let text = machinery.response_text.clone();
                            self.history.lock().push(Message::assistant(&text));
                            self.append_transcript(TranscriptEntry::speech(
                                Speaker::Agent,
                                &text,
                            ));
                            self.record_dispatcher_line(TranscriptEntry::speech(
                                Speaker::Agent,
                                &text,
                            ));
                            self.emit(VoiceSessionEvent::AgentTurn { text });
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "LLM stream error");
                machinery.llm_rx = None;
                machinery.frag_tx = None;
                self.turn.on_generation_cancelled();
                // A committed turn with a dead model would otherwise park
                // the controller in thinking.
                self.turn.abort_turn();
            }
        }
        Ok(())
    }

    /// Execute tool calls and start the follow-up LLM round.
    async fn run_tool_calls(
        &self,
        calls: Vec<ToolCall>,
        machinery: &mut TurnMachinery,
    ) -> Result<(), AgentError> {
        let context = ToolContext {
            session_id: self.session_id.clone(),
            agent_id: self.profile.agent_id.clone(),
            organization_id: self.profile.organization_id.clone(),
        };

        self.history
            .lock()
            .push(Message::assistant_tool_calls(calls.clone()));

        for call in &calls {
            machinery.tool_steps += 1;
            let arguments = call.parsed_arguments();
            self.append_transcript(
                TranscriptEntry::function_call(&call.name, &call.arguments),
            );
            self.emit(VoiceSessionEvent::ToolCalled {
                name: call.name.clone(),
            });

            let handle = self.latency.start(Operation::ToolCall);
            let result: Value = match self.tools.get(&call.name) {
                Some(tool) => match tool.invoke(&context, arguments.clone()).await {
                    Ok(result) => result,
                    Err(e) => serde_json::json!({"error": e.to_string()}),
                },
                None => serde_json::json!({"error": format!("unknown tool {}", call.name)}),
            };
            self.latency.end(handle);

            let result_text =
                serde_json::to_string(&result).unwrap_or_else(|_| "{}".to_string());
            self.append_transcript(TranscriptEntry::function_result(
                &call.name,
                &result_text,
            ));
            self.dispatcher.on_function_called(
                &self.session_id,
                &call.name,
                arguments,
                result.clone(),
            );
            self.history
                .lock()
                .push(Message::tool_result(&call.id, &result_text));
        }

        // Next round; past the step budget the model must answer in text.
        let with_tools = machinery.tool_steps < self.config.max_tool_steps;
        if !with_tools {
            tracing::debug!(
                steps = machinery.tool_steps,
                "Tool step budget reached, forcing text answer"
            );
        }
        let cancellation = machinery
            .cancellation
            .clone()
            .unwrap_or_default();
        let request = self.build_request(with_tools);
        let llm_rx = self
            .llm
            .generate_stream(request, cancellation)
            .await?;
        machinery.llm_rx = Some(llm_rx);
        Ok(())
    }

    async fn handle_tts_event(&self, event: TtsEvent, machinery: &mut TurnMachinery) {
        match event {
            TtsEvent::Audio { pcm, .. } => {
                if !machinery.first_audio_sent {
                    machinery.first_audio_sent = true;
                    if let Some(handle) = machinery.ttfb_handle.take() {
                        self.latency.end(handle);
                    }
                    if let Some(speech_end) = machinery.speech_end_at.take() {
                        self.latency.mark(Operation::E2eTurn, speech_end.elapsed());
                    }
                    // First audio byte: thinking -> speaking.
                    self.turn.on_tts_started();
                }
                break_or_send(&self.audio_out, pcm).await;
            }
            TtsEvent::Complete => {
                machinery.tts_rx = None;
                self.turn.on_tts_complete();
            }
            TtsEvent::Interrupted { .. } => {
                machinery.tts_rx = None;
                self.turn.on_tts_drained();
            }
            TtsEvent::Error(e) => {
                tracing::warn!(error = %e, "TTS error mid-turn");
            }
            _ => {}
        }
    }

    /// Best-effort farewell; never blocks shutdown for long.
    async fn speak_farewell(&self, end_reason: &str) {
        if end_reason == "caller_disconnected" {
            return;
        }
        let farewell = self.profile.farewell.clone();
        if farewell.trim().is_empty() {
            return;
        }
        let mut events = self.tts.say(&farewell, false);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = tokio::time::sleep_until(deadline) => None,
            };
            match event {
                Some(TtsEvent::Audio { pcm, .. }) => {
                    break_or_send(&self.audio_out, pcm).await;
                }
                Some(TtsEvent::Complete) | None => break,
                Some(TtsEvent::Error(_)) => break,
                _ => {}
            }
        }
        self.append_transcript(TranscriptEntry::speech(Speaker::Agent, &farewell));
        self.record_dispatcher_line(TranscriptEntry::speech(Speaker::Agent, &farewell));
    }

    fn record_dispatcher_line(&self, entry: TranscriptEntry) {
        self.dispatcher
            .add_transcript_message(&self.session_id, entry);
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn break_or_send(audio_out: &mpsc::Sender<Arc<Vec<u8>>>, pcm: Arc<Vec<u8>>) {
    if audio_out.send(pcm).await.is_err() {
        tracing::debug!("Audio output channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_core::EntryKind;
    use callbridge_integrations::{DispatcherConfig, WebhookPlugin};
    use callbridge_llm::LlmError;
    use callbridge_pipeline::stt::testing::ScriptedStt;
    use callbridge_pipeline::{SpeechSynthesizer, TtsConfig, VadConfig};
    use serde_json::json;

    struct SilenceSynth;

    #[async_trait]
    impl SpeechSynthesizer for SilenceSynth {
        fn sample_rate(&self) -> u32 {
            24_000
        }

        async fn synthesize(
            &self,
            _text: &str,
            _voice_id: &str,
            _language: Language,
        ) -> Result<Vec<Vec<u8>>, callbridge_pipeline::PipelineError> {
            Ok(vec![vec![0u8; 320]])
        }
    }

    /// Scripted backend: first round returns a tool call, second a text
    /// answer.
    struct ScriptedLlm {
        rounds: Mutex<usize>,
        tool_round: bool,
    }

    #[async_trait]
    impl ChatBackend for ScriptedLlm {
        async fn generate_stream(
            &self,
            _request: GenerateRequest,
            _cancellation: Cancellation,
        ) -> Result<mpsc::Receiver<Result<StreamEvent, LlmError>>, LlmError> {
            let round = {
                let mut rounds = self.rounds.lock();
                *rounds += 1;
                *rounds
            };
            let (tx, rx) = mpsc::channel(16);
            let tool_round = self.tool_round;
            tokio::spawn(async move {
                if tool_round && round == 1 {
                    let _ = tx
                        .send(Ok(StreamEvent::ToolCalls(vec![ToolCall {
                            id: "c1".into(),
                            name: "end_call".into(),
                            arguments: r#"{"reason":"done"}"#.into(),
                        }])))
                        .await;
                    let _ = tx.send(Ok(StreamEvent::Done(FinishReason::ToolCalls))).await;
                } else {
                    let _ = tx
                        .send(Ok(StreamEvent::Delta("Happy to help. ".into())))
                        .await;
                    let _ = tx
                        .send(Ok(StreamEvent::Delta("Anything else?".into())))
                        .await;
                    let _ = tx.send(Ok(StreamEvent::Done(FinishReason::Stop))).await;
                }
            });
            Ok(rx)
        }

        async fn is_available(&self) -> bool {
            true
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    struct NullSink;

    #[async_trait]
    impl SessionSink for NullSink {
        async fn persist_transcript(
            &self,
            _session_id: &str,
            _entries: &[TranscriptEntry],
        ) -> Result<(), AgentError> {
            Ok(())
        }

        async fn flush_latency(
            &self,
            _session_id: &str,
            _agent_id: &str,
            _samples: &[LatencySample],
        ) -> Result<(), AgentError> {
            Ok(())
        }

        async fn mark_completed(
            &self,
            _session_id: &str,
            _duration_seconds: i64,
        ) -> Result<(), AgentError> {
            Ok(())
        }
    }

    fn profile() -> AgentProfile {
        AgentProfile {
            agent_id: "a1".into(),
            organization_id: "o1".into(),
            display_name: "Asha".into(),
            persona_name: "Asha".into(),
            language: Language::English,
            voice_id: "default".into(),
            system_prompt: "Be brief.".into(),
            greeting: Some("Hello! Thanks for calling us today.".into()),
            farewell: "Goodbye, take care!".into(),
        }
    }

    struct Harness {
        session: Arc<VoiceSession>,
        stt: Arc<ScriptedStt>,
        audio_tx: mpsc::Sender<AudioFrame>,
        audio_rx: Option<mpsc::Receiver<AudioFrame>>,
        audio_out_rx: mpsc::Receiver<Arc<Vec<u8>>>,
        end_tx: watch::Sender<bool>,
        shutdown_tx: watch::Sender<bool>,
        end_rx: watch::Receiver<bool>,
        shutdown_rx: watch::Receiver<bool>,
    }

    fn harness(tool_round: bool) -> Harness {
        let stt = Arc::new(ScriptedStt::new());
        let tts = Arc::new(TtsStream::new(
            Arc::new(SilenceSynth),
            TtsConfig::default(),
        ));
        let llm = Arc::new(ScriptedLlm {
            rounds: Mutex::new(0),
            tool_round,
        });
        let dispatcher = Arc::new(
            callbridge_integrations::Dispatcher::new(DispatcherConfig::default())
                .register(Arc::new(WebhookPlugin::new())),
        );
        let (end_call, end_rx_tool) = crate::tools::EndCallTool::new();
        let tools = Arc::new(ToolRegistry::new().register(Arc::new(end_call)));

        let (audio_tx, audio_rx) = mpsc::channel(64);
        let (audio_out_tx, audio_out_rx) = mpsc::channel(256);
        let (end_tx, end_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let config = VoiceSessionConfig {
            audio_settle: Duration::from_millis(10),
            ..Default::default()
        };
        let session = Arc::new(VoiceSession::new(
            "s1",
            "inbound",
            profile(),
            config,
            Arc::new(PipelineVad::auto(None, VadConfig::default())),
            stt.clone(),
            tts,
            llm,
            tools,
            dispatcher,
            Vec::new(),
            Arc::new(NullSink),
            audio_out_tx,
        ));

        // Wire the tool's end signal into the session end channel.
        let end_tx_clone = end_tx.clone();
        let mut end_rx_tool = end_rx_tool;
        tokio::spawn(async move {
            if end_rx_tool.changed().await.is_ok() && *end_rx_tool.borrow() {
                let _ = end_tx_clone.send(true);
            }
        });

        Harness {
            session,
            stt,
            audio_tx,
            audio_rx: Some(audio_rx),
            audio_out_rx,
            end_tx,
            shutdown_tx,
            end_rx,
            shutdown_rx,
        }
    }

    #[tokio::test]
    async fn greeting_is_spoken_then_session_listens() {
        let mut h = harness(false);
        let audio_rx = h.audio_rx.take().unwrap();
        let mut events = h.session.subscribe();

        let session = h.session.clone();
        let run = tokio::spawn(session.run(audio_rx, h.end_rx.clone(), h.shutdown_rx.clone()));

        // Greeting audio reaches the transport.
        let first_audio = tokio::time::timeout(Duration::from_secs(2), h.audio_out_rx.recv())
            .await
            .expect("greeting audio")
            .expect("channel open");
        assert!(!first_audio.is_empty());

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, VoiceSessionEvent::Greeted));

        // End the session; the summary carries the greeting turn count 0.
        let _ = h.end_tx.send(true);
        let summary = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.session_id, "s1");
        assert_eq!(summary.turns, 0);
    }

    #[tokio::test]
    async fn user_turn_produces_agent_reply() {
        let mut h = harness(false);
        let audio_rx = h.audio_rx.take().unwrap();
        let mut events = h.session.subscribe();

        let session = h.session.clone();
        let run = tokio::spawn(session.run(audio_rx, h.end_rx.clone(), h.shutdown_rx.clone()));

        // Wait for the greeting to finish.
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, VoiceSessionEvent::Greeted) {
                break;
            }
        }

        // Scripted user utterance: partial then final.
        h.stt
            .tx
            .send(SttEvent::Partial {
                text: "what are your charges".into(),
                confidence: 0.8,
            })
            .await
            .unwrap();
        h.stt
            .tx
            .send(SttEvent::Final {
                text: "what are your charges".into(),
                confidence: 0.9,
            })
            .await
            .unwrap();

        // Silence frames drive the VAD to speech-end... the scripted STT
        // path commits via endpointing tick after the final arrives.
        // Feed loud then silent audio to walk the pipeline VAD.
        for seq in 0..15u64 {
            let samples: Vec<f32> = (0..320).map(|i| (i as f32 * 0.3).sin() * 0.5).collect();
            let frame = AudioFrame::new(
                samples,
                callbridge_core::SampleRate::Hz16000,
                callbridge_core::Channels::Mono,
                seq,
            );
            h.audio_tx.send(frame).await.unwrap();
        }
        for seq in 15..60u64 {
            let frame = AudioFrame::new(
                vec![0.0; 320],
                callbridge_core::SampleRate::Hz16000,
                callbridge_core::Channels::Mono,
                seq,
            );
            h.audio_tx.send(frame).await.unwrap();
        }

        // Agent reply arrives.
        let mut saw_reply = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(VoiceSessionEvent::AgentTurn { text })) => {
                    assert!(text.contains("Happy to help"));
                    saw_reply = true;
                    break;
                }
                Ok(Ok(_)) => continue,
                _ => break,
            }
        }
        assert!(saw_reply, "expected an agent reply");

        let _ = h.end_tx.send(true);
        let summary = tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(summary.turns >= 1);
    }

    #[tokio::test]
    async fn tool_call_round_trips_to_end_call() {
        let mut h = harness(true);
        let audio_rx = h.audio_rx.take().unwrap();
        let mut events = h.session.subscribe();

        let session = h.session.clone();
        let run = tokio::spawn(session.run(audio_rx, h.end_rx.clone(), h.shutdown_rx.clone()));

        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if matches!(event, VoiceSessionEvent::Greeted) {
                break;
            }
        }

        h.stt
            .tx
            .send(SttEvent::Partial {
                text: "goodbye".into(),
                confidence: 0.9,
            })
            .await
            .unwrap();
        h.stt
            .tx
            .send(SttEvent::Final {
                text: "goodbye".into(),
                confidence: 0.9,
            })
            .await
            .unwrap();
        for seq in 0..15u64 {
            let samples: Vec<f32> = (0..320).map(|i| (i as f32 * 0.3).sin() * 0.5).collect();
            h.audio_tx
                .send(AudioFrame::new(
                    samples,
                    callbridge_core::SampleRate::Hz16000,
                    callbridge_core::Channels::Mono,
                    seq,
                ))
                .await
                .unwrap();
        }
        for seq in 15..60u64 {
            h.audio_tx
                .send(AudioFrame::new(
                    vec![0.0; 320],
                    callbridge_core::SampleRate::Hz16000,
                    callbridge_core::Channels::Mono,
                    seq,
                ))
                .await
                .unwrap();
        }

        // The scripted model calls end_call, which ends the session.
        let summary = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("session should end after end_call")
            .unwrap()
            .unwrap();
        assert!(summary.turns >= 1);

        // end_call left its function_call/result pair in the transcript.
        let transcript = h.session.transcript.lock().clone();
        assert!(transcript
            .iter()
            .any(|t| t.kind == EntryKind::FunctionCall
                && t.function_name.as_deref() == Some("end_call")));
        assert!(transcript
            .iter()
            .any(|t| t.kind == EntryKind::FunctionResult));

        // Transcript timestamps are non-decreasing.
        for pair in transcript.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
        let _ = h.shutdown_tx.send(true);
    }
}
