//! Voice session runtime.
//!
//! Builds a live [`VoiceSession`] for an answered call: resolves the
//! agent profile, opens the vendor STT stream, wires TTS/LLM/tools and
//! spawns the session task. The transport integration feeds caller audio
//! in and drains synthesized PCM out through the returned channels.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use callbridge_agent::{
    AgentProfile, EndCallTool, KnowledgeSearchTool, ToolRegistry, VoiceSession,
    VoiceSessionConfig,
};
use callbridge_config::Settings;
use callbridge_core::{AudioFrame, Language};
use callbridge_llm::{OpenAiBackend, OpenAiConfig};
use callbridge_pipeline::{
    PipelineVad, SttConfig, TtsConfig, TtsStream, VadConfig, WsSttStream, WsSynthesizer,
};
use callbridge_persistence::AgentRecord;
use callbridge_telephony::{greeting_for, CallType};

use crate::state::AppState;
use crate::ApiError;

/// Channels handed to the transport integration.
pub struct SessionHandles {
    pub session_id: String,
    /// Caller audio in (16-bit PCM frames at 16 kHz mono).
    pub audio_in: mpsc::Sender<AudioFrame>,
    /// Synthesized PCM out. Taken once by the transport glue.
    pub audio_out: parking_lot::Mutex<Option<mpsc::Receiver<Arc<Vec<u8>>>>>,
    /// Flip to end the session from the transport side.
    pub end: watch::Sender<bool>,
}

/// Build the agent profile from its stored record and call type.
pub fn profile_from_record(agent: &AgentRecord, call_type: CallType) -> AgentProfile {
    let language = Language::from_locale(&agent.language).unwrap_or_default();
    AgentProfile {
        agent_id: agent.agent_id.clone(),
        organization_id: agent.organization_id.clone(),
        display_name: agent.display_name.clone(),
        persona_name: agent.persona_name.clone(),
        language,
        voice_id: agent.voice_id.clone(),
        system_prompt: agent.system_prompt.clone(),
        greeting: Some(greeting_for(call_type, agent.greeting.as_deref())),
        farewell: agent.farewell.clone(),
    }
}

/// Start a voice session for an answered call.
pub async fn start_voice_session(
    state: &AppState,
    session_id: &str,
    call_type: CallType,
    agent: &AgentRecord,
) -> Result<SessionHandles, ApiError> {
    let settings: &Settings = &state.config;
    let profile = profile_from_record(agent, call_type);

    // STT stream for this session's language.
    let stt_config = SttConfig {
        endpoint: settings.stt.endpoint.clone(),
        api_key: settings.stt.api_key.clone(),
        model: settings.stt.model.clone(),
        language: profile.language,
        ..Default::default()
    };
    let stt = WsSttStream::connect(stt_config)
        .await
        .map_err(|e| ApiError::internal(format!("STT connect failed: {e}")))?;

    // Pooled TTS synthesizer.
    let synthesizer = Arc::new(WsSynthesizer::new(
        settings.tts.endpoint.clone(),
        settings.tts.api_key.clone(),
        settings.tts.sample_rate,
        callbridge_pipeline::PoolConfig {
            max_size: settings.tts.pool_size,
            ..Default::default()
        },
    ));
    let tts = Arc::new(TtsStream::new(
        synthesizer,
        TtsConfig {
            voice_id: profile.voice_id.clone(),
            language: profile.language,
            sample_rate: settings.tts.sample_rate,
            phrase_cache_capacity: settings.tts.phrase_cache_capacity,
            ..Default::default()
        },
    ));

    let llm = Arc::new(OpenAiBackend::new(OpenAiConfig {
        endpoint: settings.llm.endpoint.clone(),
        api_key: settings.llm.api_key.clone(),
        model: settings.llm.model.clone(),
        timeout: std::time::Duration::from_secs(settings.llm.timeout_secs),
        ..Default::default()
    }));

    let (end_call, end_signal) = EndCallTool::new();
    let tools = Arc::new(
        ToolRegistry::new()
            .register(Arc::new(KnowledgeSearchTool::new(state.retriever.clone())))
            .register(Arc::new(end_call)),
    );

    let bindings = state
        .integration_store
        .list_by_agent(&agent.agent_id)
        .await?;

    let sink = Arc::new(crate::adapters::StoreSessionSink {
        sessions: state.call_sessions.clone(),
        metrics: state.metrics.clone(),
    });

    let vad = Arc::new(PipelineVad::auto(
        Some(std::path::Path::new("models/vad/silero_vad.onnx")),
        VadConfig::default(),
    ));

    let (audio_in_tx, audio_in_rx) = mpsc::channel::<AudioFrame>(64);
    let (audio_out_tx, audio_out_rx) = mpsc::channel(32);
    let (end_tx, end_rx) = watch::channel(false);

    // Tool-initiated hangup folds into the same end channel.
    {
        let end_tx = end_tx.clone();
        let mut end_signal = end_signal;
        tokio::spawn(async move {
            if end_signal.changed().await.is_ok() && *end_signal.borrow() {
                let _ = end_tx.send(true);
            }
        });
    }

    let session = Arc::new(VoiceSession::new(
        session_id,
        call_type.as_str(),
        profile,
        VoiceSessionConfig::default(),
        vad,
        Arc::new(stt),
        tts,
        llm,
        tools,
        state.dispatcher.clone(),
        bindings,
        sink,
        audio_out_tx,
    ));

    let shutdown_rx = state.shutdown.subscribe();
    let summary = tokio::spawn(session.run(audio_in_rx, end_rx.clone(), shutdown_rx));

    if let Err(e) = state.agents.increment_calls(&agent.agent_id).await {
        tracing::warn!(error = %e, "Call counter bump failed");
    }

    // End watcher: release the active-call slot and the registry entry
    // once the session task returns.
    {
        let orchestrator = state.orchestrator.clone();
        let registry = state.voice_sessions.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            match summary.await {
                Ok(Ok(summary)) => {
                    tracing::info!(
                        session_id = %summary.session_id,
                        turns = summary.turns,
                        "Voice session finished"
                    );
                }
                Ok(Err(e)) => {
                    tracing::error!(session_id = %session_id, error = %e, "Voice session failed");
                    orchestrator.on_call_failed(&session_id, &e.to_string());
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "Voice session panicked");
                }
            }
            let _ = orchestrator.on_call_ended(&session_id).await;
            registry.remove(&session_id);
        });
    }

    let handles = SessionHandles {
        session_id: session_id.to_string(),
        audio_in: audio_in_tx,
        audio_out: parking_lot::Mutex::new(Some(audio_out_rx)),
        end: end_tx,
    };
    Ok(handles)
}
