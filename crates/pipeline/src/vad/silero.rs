//! Silero VAD over ONNX Runtime.
//!
//! Stateful LSTM inference on raw 16 kHz waveform, 512-sample chunks.
//! Incoming frames are buffered to chunk size; the shared [`VadCore`]
//! state machine confirms starts and ends.

use ndarray::Array2;
use ort::{session::builder::GraphOptimizationLevel, session::Session, value::Tensor};
use parking_lot::Mutex;
use std::path::Path;

use callbridge_core::AudioFrame;

use super::{VadConfig, VadCore, VadState, VadUpdate};
use crate::PipelineError;

const CHUNK_SIZE: usize = 512;
const SAMPLE_RATE: u32 = 16_000;

struct LstmState {
    /// Hidden state [2, 64].
    h: Array2<f32>,
    /// Cell state [2, 64].
    c: Array2<f32>,
    buffer: Vec<f32>,
}

/// Silero VAD v5.
pub struct SileroVad {
    session: Mutex<Session>,
    core: VadCore,
    lstm: Mutex<LstmState>,
    energy_floor_db: f32,
}

impl SileroVad {
    /// Load the model from `silero_vad.onnx`.
    pub fn load(model_path: impl AsRef<Path>, config: VadConfig) -> Result<Self, PipelineError> {
        let session = Session::builder()
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .with_intra_threads(1)
            .map_err(|e| PipelineError::Model(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        let energy_floor_db = config.energy_floor_db;
        Ok(Self {
            session: Mutex::new(session),
            core: VadCore::new(config),
            lstm: Mutex::new(LstmState {
                h: Array2::zeros((2, 64)),
                c: Array2::zeros((2, 64)),
                buffer: Vec::with_capacity(CHUNK_SIZE),
            }),
            energy_floor_db,
        })
    }

    /// Evaluate one audio frame.
    pub fn process(&self, frame: &mut AudioFrame) -> Result<VadUpdate, PipelineError> {
        let frame_ms = frame.duration_ms() as u64;

        // Obvious silence skips inference entirely.
        if frame.energy_db < self.energy_floor_db {
            frame.vad_probability = Some(0.0);
            return Ok(self.core.advance(0.0, frame_ms));
        }

        let mut lstm = self.lstm.lock();
        lstm.buffer.extend_from_slice(&frame.samples);

        if lstm.buffer.len() < CHUNK_SIZE {
            // Not enough for a chunk yet; report current state unchanged.
            let probability = frame.vad_probability.unwrap_or(0.0);
            return Ok(self.core.advance(probability, 0));
        }

        let chunk: Vec<f32> = lstm.buffer.drain(..CHUNK_SIZE).collect();
        let probability = self.infer(&mut lstm, &chunk)?;
        frame.vad_probability = Some(probability);
        Ok(self.core.advance(probability, frame_ms))
    }

    /// Run one chunk through the model, carrying LSTM state forward.
    fn infer(&self, lstm: &mut LstmState, chunk: &[f32]) -> Result<f32, PipelineError> {
        let input = Array2::from_shape_vec((1, chunk.len()), chunk.to_vec())
            .map_err(|e| PipelineError::Vad(e.to_string()))?;
        let sr = ndarray::arr1(&[SAMPLE_RATE as i64]);

        let input_tensor =
            Tensor::from_array(input).map_err(|e| PipelineError::Model(e.to_string()))?;
        let sr_tensor = Tensor::from_array(sr).map_err(|e| PipelineError::Model(e.to_string()))?;
        let h_tensor = Tensor::from_array(lstm.h.clone())
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        let c_tensor = Tensor::from_array(lstm.c.clone())
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![
                "input" => input_tensor,
                "sr" => sr_tensor,
                "h" => h_tensor,
                "c" => c_tensor,
            ])
            .map_err(|e| PipelineError::Model(e.to_string()))?;

        let (_, speech_data) = outputs
            .get("output")
            .ok_or_else(|| PipelineError::Model("missing output tensor".to_string()))?
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::Model(e.to_string()))?;
        let probability = speech_data.first().copied().unwrap_or(0.0);

        for (name, target) in [("hn", &mut lstm.h), ("cn", &mut lstm.c)] {
            if let Some(out) = outputs.get(name) {
                let (shape, data) = out
                    .try_extract_tensor::<f32>()
                    .map_err(|e| PipelineError::Model(e.to_string()))?;
                let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
                if dims.len() == 2 && data.len() == dims[0] * dims[1] {
                    let view = ndarray::ArrayView2::from_shape((dims[0], dims[1]), data)
                        .map_err(|e| PipelineError::Model(e.to_string()))?;
                    target.assign(&view);
                }
            }
        }

        Ok(probability)
    }

    pub fn reset(&self) {
        self.core.reset();
        let mut lstm = self.lstm.lock();
        lstm.h.fill(0.0);
        lstm.c.fill(0.0);
        lstm.buffer.clear();
    }

    pub fn state(&self) -> VadState {
        self.core.state()
    }
}
