// ── Audio engine ──
//
// Holds one decoded alarm sample and loops it through a gain stage.
// No networking, no coordination: start/stop/gain primitives only.
// The output backend pulls frames through `SampleEngine::fill_interleaved`.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tracing::debug;

use crate::error::CoreError;

/// Primitive audio output driven by the alarm coordinator.
pub trait AudioEngine: Send + Sync + 'static {
    /// The sample is decoded and playback can start.
    fn is_ready(&self) -> bool;

    /// Start looping playback. Idempotent while already playing.
    fn start(&self) -> Result<(), CoreError>;

    /// Stop playback. Idempotent.
    fn stop(&self);

    /// Set output gain; clamped to `[0, 1]`.
    fn set_gain(&self, gain: f32);

    fn is_playing(&self) -> bool;
}

/// Clamp a requested volume into `[0, 1]`, mapping NaN to silence.
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

// ── SampleEngine ─────────────────────────────────────────────────────

/// Loops a mono `f32` sample.
pub struct SampleEngine {
    sample: Box<[f32]>,
    playback: Mutex<Playback>,
}

#[derive(Debug)]
struct Playback {
    playing: bool,
    cursor: usize,
    gain: f32,
}

impl SampleEngine {
    /// Decode raw little-endian `f32` PCM.
    pub fn from_f32le(mut raw: Bytes) -> Result<Self, CoreError> {
        if raw.is_empty() || raw.len() % 4 != 0 {
            return Err(CoreError::AudioNotReady {
                reason: format!("expected a non-empty multiple of 4 bytes, got {}", raw.len()),
            });
        }
        let mut sample = Vec::with_capacity(raw.len() / 4);
        while raw.has_remaining() {
            sample.push(raw.get_f32_le());
        }
        debug!(frames = sample.len(), "decoded alarm sample");
        Ok(Self::from_samples(sample))
    }

    /// Read and decode a raw `f32le` PCM file.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read(path).map_err(|source| CoreError::Storage {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_f32le(Bytes::from(raw))
    }

    /// A two-tone siren, used when no sample file is configured.
    #[allow(
        clippy::as_conversions,
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    pub fn siren(sample_rate: u32, period: Duration) -> Self {
        let rate = f64::from(sample_rate);
        let frames = (rate * period.as_secs_f64()).round() as usize;
        let half = frames / 2;
        let sample = (0..frames)
            .map(|i| {
                let freq = if i < half { 960.0 } else { 770.0 };
                let t = i as f64 / rate;
                ((std::f64::consts::TAU * freq * t).sin() * 0.9) as f32
            })
            .collect();
        Self::from_samples(sample)
    }

    /// An engine with nothing decoded; `start` fails.
    pub fn empty() -> Self {
        Self::from_samples(Vec::new())
    }

    fn from_samples(sample: Vec<f32>) -> Self {
        Self {
            sample: sample.into_boxed_slice(),
            playback: Mutex::new(Playback {
                playing: false,
                cursor: 0,
                gain: 1.0,
            }),
        }
    }

    pub fn frames(&self) -> usize {
        self.sample.len()
    }

    pub fn gain(&self) -> f32 {
        self.playback().gain
    }

    /// Write the next `out.len()` frames. Silence while stopped.
    pub fn fill(&self, out: &mut [f32]) {
        self.fill_interleaved(out, 1);
    }

    /// Write interleaved frames for a `channels`-wide device, the same
    /// value on every channel. A trailing partial frame is still filled.
    pub fn fill_interleaved(&self, out: &mut [f32], channels: usize) {
        let mut playback = self.playback();
        if !playback.playing || self.sample.is_empty() {
            out.fill(0.0);
            return;
        }
        for frame in out.chunks_mut(channels.max(1)) {
            frame.fill(self.sample[playback.cursor] * playback.gain);
            playback.cursor = (playback.cursor + 1) % self.sample.len();
        }
    }

    fn playback(&self) -> MutexGuard<'_, Playback> {
        self.playback.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AudioEngine for SampleEngine {
    fn is_ready(&self) -> bool {
        !self.sample.is_empty()
    }

    fn start(&self) -> Result<(), CoreError> {
        if self.sample.is_empty() {
            return Err(CoreError::AudioNotReady {
                reason: "no alarm sample decoded".into(),
            });
        }
        let mut playback = self.playback();
        if !playback.playing {
            playback.playing = true;
            playback.cursor = 0;
        }
        Ok(())
    }

    fn stop(&self) {
        self.playback().playing = false;
    }

    fn set_gain(&self, gain: f32) {
        self.playback().gain = clamp_volume(gain);
    }

    fn is_playing(&self) -> bool {
        self.playback().playing
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn pcm(values: &[f32]) -> Bytes {
        values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<u8>>().into()
    }

    #[test]
    fn decodes_and_loops_with_gain() {
        let engine = SampleEngine::from_f32le(pcm(&[0.5, -0.5, 1.0])).unwrap();
        assert_eq!(engine.frames(), 3);
        engine.set_gain(0.5);
        engine.start().unwrap();

        let mut out = [0.0_f32; 5];
        engine.fill(&mut out);
        assert_eq!(out, [0.25, -0.25, 0.5, 0.25, -0.25]);
    }

    #[test]
    fn stereo_frames_repeat_each_value() {
        let engine = SampleEngine::from_f32le(pcm(&[0.5, -1.0])).unwrap();
        engine.start().unwrap();

        let mut out = [0.0_f32; 6];
        engine.fill_interleaved(&mut out, 2);
        assert_eq!(out, [0.5, 0.5, -1.0, -1.0, 0.5, 0.5]);

        // Zero channels is treated as mono.
        let mut mono = [0.0_f32; 2];
        engine.fill_interleaved(&mut mono, 0);
        assert_eq!(mono, [-1.0, 0.5]);
    }

    #[test]
    fn stopped_engine_outputs_silence() {
        let engine = SampleEngine::from_f32le(pcm(&[1.0, 1.0])).unwrap();
        let mut out = [9.0_f32; 4];
        engine.fill(&mut out);
        assert_eq!(out, [0.0; 4]);

        engine.start().unwrap();
        engine.stop();
        assert!(!engine.is_playing());
        engine.fill(&mut out);
        assert_eq!(out, [0.0; 4]);
    }

    #[test]
    fn rejects_truncated_pcm() {
        let err = SampleEngine::from_f32le(Bytes::from_static(&[0, 0, 128])).err().unwrap();
        assert!(matches!(err, CoreError::AudioNotReady { .. }));
    }

    #[test]
    fn empty_engine_cannot_start() {
        let engine = SampleEngine::empty();
        assert!(!engine.is_ready());
        assert!(engine.start().is_err());
        assert!(!engine.is_playing());
    }

    #[test]
    fn gain_is_clamped() {
        let engine = SampleEngine::siren(8_000, Duration::from_millis(500));
        assert_eq!(engine.frames(), 4_000);
        engine.set_gain(3.0);
        assert_eq!(engine.gain(), 1.0);
        engine.set_gain(f32::NAN);
        assert_eq!(engine.gain(), 0.0);
    }
}
