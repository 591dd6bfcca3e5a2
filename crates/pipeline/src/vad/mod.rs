//! Pipeline voice activity detection.
//!
//! The turn controller runs on this local VAD; the transcriber's own
//! speech markers arrive separately as hints. The neural detector (Silero
//! over ONNX Runtime) is used when the model file is present and the
//! `onnx` feature is enabled; otherwise an energy-based detector stands in.

#[cfg(feature = "onnx")]
mod silero;
#[cfg(feature = "onnx")]
pub use silero::SileroVad;

use callbridge_config::constants::endpointing;
use callbridge_core::AudioFrame;
use parking_lot::Mutex;

use crate::PipelineError;

/// Detector state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VadState {
    #[default]
    Silence,
    /// Speech observed but not yet confirmed by `min_speech`.
    SpeechStart,
    Speech,
    /// Silence observed but not yet confirmed by `min_silence`.
    SpeechEnd,
}

impl VadState {
    pub fn is_speech(&self) -> bool {
        matches!(self, Self::SpeechStart | Self::Speech)
    }
}

/// One VAD evaluation of a frame.
#[derive(Debug, Clone, Copy)]
pub struct VadUpdate {
    pub state: VadState,
    pub probability: f32,
    /// Confirmed transition this frame, if any.
    pub transition: Option<VadTransition>,
    /// Accumulated speech duration in the current utterance (ms).
    pub speech_ms: u64,
    /// Accumulated trailing silence (ms).
    pub silence_ms: u64,
}

/// Confirmed transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadTransition {
    SpeechStarted,
    SpeechEnded,
}

/// VAD tuning.
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Activation probability threshold.
    pub activation_threshold: f32,
    /// Speech must persist this long to confirm a start.
    pub min_speech_ms: u64,
    /// Silence must persist this long to confirm an end.
    pub min_silence_ms: u64,
    /// Audio retained before the detected start (consumed by STT framing).
    pub prefix_padding_ms: u64,
    /// Energy floor below which frames are silence without inference.
    pub energy_floor_db: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            activation_threshold: endpointing::ACTIVATION_THRESHOLD,
            min_speech_ms: (endpointing::MIN_SPEECH_SECS * 1000.0) as u64,
            min_silence_ms: (endpointing::MIN_SILENCE_SECS * 1000.0) as u64,
            prefix_padding_ms: (endpointing::PREFIX_PADDING_SECS * 1000.0) as u64,
            energy_floor_db: -50.0,
        }
    }
}

struct DetectorState {
    state: VadState,
    speech_ms: u64,
    silence_ms: u64,
}

/// Shared state-machine logic over a per-frame speech probability.
pub(crate) struct VadCore {
    config: VadConfig,
    state: Mutex<DetectorState>,
}

impl VadCore {
    fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: Mutex::new(DetectorState {
                state: VadState::Silence,
                speech_ms: 0,
                silence_ms: 0,
            }),
        }
    }

    fn advance(&self, probability: f32, frame_ms: u64) -> VadUpdate {
        let is_speech = probability >= self.config.activation_threshold;
        let mut s = self.state.lock();
        let mut transition = None;

        match (s.state, is_speech) {
            (VadState::Silence, true) => {
                s.state = VadState::SpeechStart;
                s.speech_ms = frame_ms;
                s.silence_ms = 0;
            }
            (VadState::SpeechStart, true) => {
                s.speech_ms += frame_ms;
                if s.speech_ms >= self.config.min_speech_ms {
                    s.state = VadState::Speech;
                    transition = Some(VadTransition::SpeechStarted);
                }
            }
            (VadState::SpeechStart, false) => {
                s.state = VadState::Silence;
                s.speech_ms = 0;
            }
            (VadState::Speech, true) => {
                s.speech_ms += frame_ms;
                s.silence_ms = 0;
            }
            (VadState::Speech, false) => {
                s.state = VadState::SpeechEnd;
                s.silence_ms = frame_ms;
            }
            (VadState::SpeechEnd, true) => {
                s.state = VadState::Speech;
                s.speech_ms += frame_ms;
                s.silence_ms = 0;
            }
            (VadState::SpeechEnd, false) => {
                s.silence_ms += frame_ms;
                if s.silence_ms >= self.config.min_silence_ms {
                    s.state = VadState::Silence;
                    s.speech_ms = 0;
                    transition = Some(VadTransition::SpeechEnded);
                }
            }
            (VadState::Silence, false) => {}
        }

        VadUpdate {
            state: s.state,
            probability,
            transition,
            speech_ms: s.speech_ms,
            silence_ms: s.silence_ms,
        }
    }

    fn reset(&self) {
        let mut s = self.state.lock();
        s.state = VadState::Silence;
        s.speech_ms = 0;
        s.silence_ms = 0;
    }

    fn state(&self) -> VadState {
        self.state.lock().state
    }
}

/// Energy-based detector used when no neural model is available.
pub struct EnergyVad {
    core: VadCore,
    energy_floor_db: f32,
}

impl EnergyVad {
    pub fn new(config: VadConfig) -> Self {
        let energy_floor_db = config.energy_floor_db;
        Self {
            core: VadCore::new(config),
            energy_floor_db,
        }
    }

    fn probability(&self, frame: &AudioFrame) -> f32 {
        let threshold_db = self.energy_floor_db + 10.0;
        if frame.energy_db <= threshold_db {
            0.0
        } else {
            ((frame.energy_db - threshold_db) / 30.0).clamp(0.0, 1.0)
        }
    }
}

/// The pipeline VAD the turn controller consumes.
pub enum PipelineVad {
    #[cfg(feature = "onnx")]
    Silero(SileroVad),
    Energy(EnergyVad),
}

impl PipelineVad {
    /// Load Silero from `model_path` when possible, else energy fallback.
    pub fn auto(model_path: Option<&std::path::Path>, config: VadConfig) -> Self {
        #[cfg(feature = "onnx")]
        if let Some(path) = model_path {
            if path.exists() {
                match SileroVad::load(path, config.clone()) {
                    Ok(vad) => {
                        tracing::info!(model = %path.display(), "Pipeline VAD: Silero");
                        return Self::Silero(vad);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Silero load failed, using energy VAD");
                    }
                }
            }
        }
        #[cfg(not(feature = "onnx"))]
        let _ = model_path;
        tracing::info!("Pipeline VAD: energy-based");
        Self::Energy(EnergyVad::new(config))
    }

    /// Evaluate one audio frame.
    pub fn process(&self, frame: &mut AudioFrame) -> Result<VadUpdate, PipelineError> {
        let frame_ms = frame.duration_ms() as u64;
        match self {
            #[cfg(feature = "onnx")]
            Self::Silero(vad) => vad.process(frame),
            Self::Energy(vad) => {
                // Frames below the floor are silence without further work.
                let probability = if frame.energy_db < vad.energy_floor_db {
                    0.0
                } else {
                    vad.probability(frame)
                };
                frame.vad_probability = Some(probability);
                Ok(vad.core.advance(probability, frame_ms))
            }
        }
    }

    pub fn reset(&self) {
        match self {
            #[cfg(feature = "onnx")]
            Self::Silero(vad) => vad.reset(),
            Self::Energy(vad) => vad.core.reset(),
        }
    }

    pub fn state(&self) -> VadState {
        match self {
            #[cfg(feature = "onnx")]
            Self::Silero(vad) => vad.state(),
            Self::Energy(vad) => vad.core.state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callbridge_core::{Channels, SampleRate};

    fn loud_frame(seq: u64) -> AudioFrame {
        let samples: Vec<f32> = (0..320).map(|i| (i as f32 * 0.3).sin() * 0.5).collect();
        AudioFrame::new(samples, SampleRate::Hz16000, Channels::Mono, seq)
    }

    fn silent_frame(seq: u64) -> AudioFrame {
        AudioFrame::new(vec![0.0; 320], SampleRate::Hz16000, Channels::Mono, seq)
    }

    #[test]
    fn confirms_speech_after_min_duration() {
        let vad = PipelineVad::auto(None, VadConfig::default());
        let mut started = false;
        for seq in 0..20 {
            let mut frame = loud_frame(seq);
            let update = vad.process(&mut frame).unwrap();
            if update.transition == Some(VadTransition::SpeechStarted) {
                // 100ms min speech at 20ms frames = 5 frames.
                assert!(update.speech_ms >= 100);
                started = true;
                break;
            }
        }
        assert!(started);
    }

    #[test]
    fn confirms_end_after_min_silence() {
        let vad = PipelineVad::auto(None, VadConfig::default());
        for seq in 0..10 {
            let mut frame = loud_frame(seq);
            vad.process(&mut frame).unwrap();
        }
        assert!(vad.state().is_speech());

        let mut ended = false;
        for seq in 10..60 {
            let mut frame = silent_frame(seq);
            let update = vad.process(&mut frame).unwrap();
            if update.transition == Some(VadTransition::SpeechEnded) {
                assert!(update.silence_ms >= 400);
                ended = true;
                break;
            }
        }
        assert!(ended);
        assert_eq!(vad.state(), VadState::Silence);
    }

    #[test]
    fn brief_blip_does_not_open_speech() {
        let vad = PipelineVad::auto(None, VadConfig::default());
        let mut frame = loud_frame(0);
        let update = vad.process(&mut frame).unwrap();
        // One 20ms frame is below the 100ms confirmation window.
        assert!(update.transition.is_none());
        let mut frame = silent_frame(1);
        let update = vad.process(&mut frame).unwrap();
        assert_eq!(update.state, VadState::Silence);
    }

    #[test]
    fn reset_returns_to_silence() {
        let vad = PipelineVad::auto(None, VadConfig::default());
        for seq in 0..10 {
            let mut frame = loud_frame(seq);
            vad.process(&mut frame).unwrap();
        }
        vad.reset();
        assert_eq!(vad.state(), VadState::Silence);
    }
}
