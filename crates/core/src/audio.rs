//! Audio frame types.
//!
//! The live path moves 16-bit PCM at 16 kHz mono between the transport, the
//! VAD and the STT stream. Frames carry their energy so downstream stages
//! can gate on obviously silent audio without re-scanning samples.

use serde::{Deserialize, Serialize};

/// Supported sample rates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRate {
    Hz8000,
    Hz16000,
    Hz24000,
    Hz48000,
}

impl SampleRate {
    pub fn as_hz(&self) -> u32 {
        match self {
            Self::Hz8000 => 8000,
            Self::Hz16000 => 16000,
            Self::Hz24000 => 24000,
            Self::Hz48000 => 48000,
        }
    }
}

/// Channel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Channels {
    Mono,
    Stereo,
}

/// A frame of PCM audio.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Samples normalized to [-1.0, 1.0].
    pub samples: Vec<f32>,
    pub sample_rate: SampleRate,
    pub channels: Channels,
    /// Monotonic frame sequence within a session.
    pub sequence: u64,
    /// RMS energy in dBFS, computed at construction.
    pub energy_db: f32,
    /// Speech probability assigned by the VAD, if it has run.
    pub vad_probability: Option<f32>,
}

impl AudioFrame {
    pub fn new(
        samples: Vec<f32>,
        sample_rate: SampleRate,
        channels: Channels,
        sequence: u64,
    ) -> Self {
        let energy_db = rms_db(&samples);
        Self {
            samples,
            sample_rate,
            channels,
            sequence,
            energy_db,
            vad_probability: None,
        }
    }

    /// Build a frame from raw 16-bit little-endian PCM bytes.
    pub fn from_pcm16(bytes: &[u8], sample_rate: SampleRate, sequence: u64) -> Self {
        let samples: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
            .collect();
        Self::new(samples, sample_rate, Channels::Mono, sequence)
    }

    /// Serialize back to 16-bit little-endian PCM.
    pub fn to_pcm16(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Frame duration in milliseconds.
    pub fn duration_ms(&self) -> u32 {
        if self.samples.is_empty() {
            return 0;
        }
        (self.samples.len() as u64 * 1000 / self.sample_rate.as_hz() as u64) as u32
    }
}

/// RMS energy of a sample buffer in dBFS.
pub fn rms_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return -100.0;
    }
    let mean_sq: f32 = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    10.0 * mean_sq.max(1e-10).log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_round_trip() {
        let bytes: Vec<u8> = [0i16, 1000, -1000, i16::MAX, i16::MIN + 1]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let frame = AudioFrame::from_pcm16(&bytes, SampleRate::Hz16000, 0);
        assert_eq!(frame.samples.len(), 5);
        let back = frame.to_pcm16();
        assert_eq!(back.len(), bytes.len());
    }

    #[test]
    fn silence_has_floor_energy() {
        let frame = AudioFrame::new(vec![0.0; 320], SampleRate::Hz16000, Channels::Mono, 0);
        assert!(frame.energy_db <= -90.0);
    }

    #[test]
    fn duration() {
        let frame = AudioFrame::new(vec![0.0; 320], SampleRate::Hz16000, Channels::Mono, 0);
        assert_eq!(frame.duration_ms(), 20);
    }
}
