use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{MusicSyncError, Result};

/// RMS level treated as full energy.
const REFERENCE_RMS: f32 = 0.5;
const ATTACK: f32 = 0.6;
const RELEASE: f32 = 0.1;

/// Features extracted from a single PCM block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisFrame {
    pub rms: f32,
    /// Normalised [0, 1] spectral centroid where 1.0 corresponds to the
    /// Nyquist frequency of the analysed block.
    pub spectral_centroid: f32,
    /// Smoothed [0, 1] loudness estimate after this block.
    pub energy: f32,
}

/// Block analyser for hosts that can hand over raw audio.
///
/// It complements the per-track features from the host with a live loudness
/// estimate; the coordinator prefers it for the "recent energy" term when
/// blocks are flowing.
pub struct LiveAnalysis {
    sample_rate: u32,
    smoothed_energy: f32,
    latest: Option<AnalysisFrame>,
    blocks: u64,
    fft_planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl LiveAnalysis {
    /// Creates a new analyser using the default 48 kHz sample rate.
    pub fn new() -> Self {
        Self::with_sample_rate(48_000)
    }

    pub fn with_sample_rate(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            smoothed_energy: 0.0,
            latest: None,
            blocks: 0,
            fft_planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Forgets everything heard so far, e.g. on track change.
    pub fn reset(&mut self) {
        self.smoothed_energy = 0.0;
        self.latest = None;
        self.blocks = 0;
    }

    /// Number of blocks processed since the last reset.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn latest_frame(&self) -> Option<&AnalysisFrame> {
        self.latest.as_ref()
    }

    /// Smoothed energy, or `None` until the first block arrives.
    pub fn recent_energy(&self) -> Option<f32> {
        self.latest.map(|frame| frame.energy)
    }

    /// Consumes audio samples and updates the tracked features.
    pub fn process_block(&mut self, samples: &[f32]) -> Result<AnalysisFrame> {
        if samples.len() < 2 {
            return Err(MusicSyncError::msg(
                "analysis requires blocks with at least two samples",
            ));
        }

        let rms = compute_rms(samples);
        let centroid_hz = self.compute_spectral_centroid(samples)?;
        let nyquist = (self.sample_rate as f32).max(1.0) * 0.5;
        let spectral_centroid = (centroid_hz / nyquist).clamp(0.0, 1.0);

        let target = (rms / REFERENCE_RMS).clamp(0.0, 1.0);
        let rate = if target > self.smoothed_energy {
            ATTACK
        } else {
            RELEASE
        };
        self.smoothed_energy += (target - self.smoothed_energy) * rate;

        let frame = AnalysisFrame {
            rms,
            spectral_centroid,
            energy: self.smoothed_energy,
        };
        self.latest = Some(frame);
        self.blocks += 1;
        Ok(frame)
    }

    fn compute_spectral_centroid(&mut self, samples: &[f32]) -> Result<f32> {
        let len = samples.len();
        let sample_rate = self.sample_rate as f32;
        let fft = self.prepare_fft(len);

        for (index, value) in samples.iter().enumerate() {
            fft.input[index] = *value * hann_value(index, len);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .map_err(|err| MusicSyncError::msg(format!("fft failed: {err}")))?;

        let mut magnitude_sum = 0.0;
        let mut weighted_sum = 0.0;
        let bin_hz = sample_rate / len as f32;

        for (i, bin) in fft.spectrum.iter().enumerate() {
            let magnitude = bin.norm();
            magnitude_sum += magnitude;
            weighted_sum += magnitude * (i as f32 * bin_hz);
        }

        if magnitude_sum <= f32::EPSILON {
            Ok(0.0)
        } else {
            Ok(weighted_sum / magnitude_sum)
        }
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        let planner = &mut self.fft_planner;
        let resources = self.fft.get_or_insert_with(|| FftResources::plan(planner, size));
        if resources.size != size {
            *resources = FftResources::plan(planner, size);
        }
        resources
    }
}

impl Default for LiveAnalysis {
    fn default() -> Self {
        Self::new()
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn plan(planner: &mut RealFftPlanner<f32>, size: usize) -> Self {
        let plan = planner.plan_fft_forward(size);
        Self {
            size,
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    }
}

impl fmt::Debug for LiveAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveAnalysis")
            .field("sample_rate", &self.sample_rate)
            .field("smoothed_energy", &self.smoothed_energy)
            .field("blocks", &self.blocks)
            .finish()
    }
}

fn compute_rms(samples: &[f32]) -> f32 {
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}
