//! Tempo derivation and beat prediction.
//!
//! The scheduler never listens to audio; it predicts beats from the track's
//! tempo features and the moment playback started, so it keeps running when
//! the host API is slow or gone.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{config::BeatConfig, features::AudioFeatures};

const HIGH_DANCE_MULTIPLIER: f32 = 1.0;
const MEDIUM_DANCE_MULTIPLIER: f32 = 0.75;
const LOW_DANCE_MULTIPLIER: f32 = 0.5;

/// How the effective tempo was derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TempoMethod {
    HighDance,
    LowDance,
    MediumDance,
    /// No features available, fallback tempo used as-is.
    Basic,
}

/// Tempo after danceability and energy adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnhancedTempo {
    pub base_bpm: f32,
    pub effective_bpm: f32,
    pub method: TempoMethod,
    /// Danceability multiplier.
    pub multiplier: f32,
    pub energy_multiplier: f32,
}

impl EnhancedTempo {
    pub fn from_features(features: &AudioFeatures, config: &BeatConfig) -> Self {
        let base_bpm = if features.tempo_bpm.is_finite() && features.tempo_bpm > 0.0 {
            features.tempo_bpm
        } else {
            config.fallback_bpm
        };

        let (method, multiplier) = if features.danceability >= config.high_dance_threshold {
            (TempoMethod::HighDance, HIGH_DANCE_MULTIPLIER)
        } else if features.danceability <= config.low_dance_threshold {
            (TempoMethod::LowDance, LOW_DANCE_MULTIPLIER)
        } else {
            (TempoMethod::MediumDance, MEDIUM_DANCE_MULTIPLIER)
        };

        let energy_multiplier = 0.8 + features.energy.clamp(0.0, 1.0) * 0.6;
        let effective_bpm = (base_bpm * multiplier * energy_multiplier)
            .clamp(config.min_bpm, config.max_bpm)
            .round();

        Self {
            base_bpm,
            effective_bpm,
            method,
            multiplier,
            energy_multiplier,
        }
    }

    pub fn fallback(config: &BeatConfig) -> Self {
        Self {
            base_bpm: config.fallback_bpm,
            effective_bpm: config.fallback_bpm.clamp(config.min_bpm, config.max_bpm).round(),
            method: TempoMethod::Basic,
            multiplier: 1.0,
            energy_multiplier: 1.0,
        }
    }

    pub fn interval_ms(&self) -> f64 {
        60_000.0 / self.effective_bpm as f64
    }
}

/// Prediction state. `next_beat_timestamp >= last_beat_timestamp + interval_ms`
/// holds after every call into [`BeatScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatState {
    pub last_beat_timestamp: f64,
    pub next_beat_timestamp: f64,
    pub interval_ms: f64,
    pub confidence: f32,
    pub active: bool,
}

impl BeatState {
    fn anchored(last: f64, interval_ms: f64, confidence: f32) -> Self {
        Self {
            last_beat_timestamp: last,
            next_beat_timestamp: last + interval_ms,
            interval_ms,
            confidence,
            active: true,
        }
    }
}

/// Emitted once per predicted beat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    pub beat_index: u64,
    pub intensity: f32,
    pub bpm: f32,
    pub timestamp_ms: f64,
}

#[derive(Debug)]
pub struct BeatScheduler {
    config: BeatConfig,
    tempo: EnhancedTempo,
    state: BeatState,
    energy: f32,
    valence: f32,
    beat_index: u64,
    track_start_ms: f64,
    /// When the current features arrived, `None` while on fallback.
    features_at_ms: Option<f64>,
    stale_after_ms: f64,
}

impl BeatScheduler {
    pub fn new(config: BeatConfig) -> Self {
        let tempo = EnhancedTempo::fallback(&config);
        let stale_after_ms = config.default_stale_after_ms;
        Self {
            state: BeatState {
                active: false,
                ..BeatState::anchored(0.0, tempo.interval_ms(), 0.0)
            },
            config,
            tempo,
            energy: 0.5,
            valence: 0.5,
            beat_index: 0,
            track_start_ms: 0.0,
            features_at_ms: None,
            stale_after_ms,
        }
    }

    pub fn tempo(&self) -> &EnhancedTempo {
        &self.tempo
    }

    pub fn state(&self) -> &BeatState {
        &self.state
    }

    /// Energy of the current track, 0.5 while unknown.
    pub fn energy(&self) -> f32 {
        self.energy
    }

    pub fn valence(&self) -> f32 {
        self.valence
    }

    pub fn config(&self) -> &BeatConfig {
        &self.config
    }

    /// Playback position implied by the current grid.
    pub fn track_position_ms(&self, now_ms: f64) -> f64 {
        (now_ms - self.track_start_ms).max(0.0)
    }

    /// Replaces the fallback tempo, e.g. after a preference change. Only
    /// affects the running grid while no features are loaded.
    pub fn set_fallback_bpm(&mut self, bpm: f32, now_ms: f64) {
        self.config.fallback_bpm = bpm;
        if self.features_at_ms.is_none() {
            self.tempo = EnhancedTempo::fallback(&self.config);
            self.retime(now_ms);
        }
    }

    /// Starts a new track on the fallback tempo. Features, once fetched, are
    /// applied with [`Self::apply_features`].
    pub fn start_track(&mut self, track_start_ms: f64, duration_ms: Option<f64>) {
        self.tempo = EnhancedTempo::fallback(&self.config);
        self.energy = 0.5;
        self.valence = 0.5;
        self.beat_index = 0;
        self.track_start_ms = track_start_ms;
        self.features_at_ms = None;
        self.stale_after_ms = duration_ms
            .filter(|d| *d > 0.0)
            .unwrap_or(self.config.default_stale_after_ms);
        self.state = BeatState::anchored(track_start_ms, self.tempo.interval_ms(), 0.0);
    }

    /// Switches to the tempo derived from freshly fetched features, keeping
    /// the grid anchored at the last beat.
    pub fn apply_features(&mut self, features: &AudioFeatures, now_ms: f64) {
        self.tempo = EnhancedTempo::from_features(features, &self.config);
        self.energy = features.energy;
        self.valence = features.valence;
        self.features_at_ms = Some(now_ms);
        if features.duration_ms > 0.0 {
            self.stale_after_ms = features.duration_ms;
        }
        self.retime(now_ms);
        self.state.confidence = 1.0;

        debug!(
            track_id = %features.track_id,
            effective_bpm = self.tempo.effective_bpm,
            method = ?self.tempo.method,
            "tempo updated"
        );
    }

    /// Drops to the fallback tempo with zero confidence. Scheduling continues.
    pub fn use_fallback(&mut self, now_ms: f64) {
        self.tempo = EnhancedTempo::fallback(&self.config);
        self.features_at_ms = None;
        self.retime(now_ms);
        self.state.confidence = 0.0;
    }

    /// Realigns the grid to a playback position, e.g. after a seek.
    pub fn seek(&mut self, position_ms: f64, now_ms: f64) {
        self.track_start_ms = now_ms - position_ms.max(0.0);
        let interval = self.tempo.interval_ms();
        let beats = ((now_ms - self.track_start_ms) / interval).floor().max(0.0);
        self.beat_index = beats as u64;
        let confidence = self.state.confidence;
        self.state = BeatState::anchored(self.track_start_ms + beats * interval, interval, confidence);
    }

    pub fn stop(&mut self) {
        self.state.active = false;
    }

    /// Advances prediction to `now_ms`, returning a beat if one was due.
    ///
    /// Beats missed during a stall are skipped rather than replayed; only the
    /// latest one is reported.
    pub fn tick(&mut self, now_ms: f64) -> Option<BeatEvent> {
        self.decay_confidence(now_ms);

        if !self.state.active || now_ms < self.state.next_beat_timestamp {
            return None;
        }

        let interval = self.state.interval_ms;
        let missed = ((now_ms - self.state.next_beat_timestamp) / interval).floor();
        let beat_at = self.state.next_beat_timestamp + missed * interval;
        self.beat_index += 1 + missed as u64;
        self.state.last_beat_timestamp = beat_at;
        self.state.next_beat_timestamp = beat_at + interval;

        Some(BeatEvent {
            beat_index: self.beat_index,
            intensity: self.beat_intensity(),
            bpm: self.tempo.effective_bpm,
            timestamp_ms: beat_at,
        })
    }

    /// Fractional position within the current beat interval, in [0, 1).
    pub fn phase(&self, now_ms: f64) -> f32 {
        if !self.state.active {
            return 0.0;
        }
        let elapsed = now_ms - self.state.last_beat_timestamp;
        (elapsed / self.state.interval_ms).rem_euclid(1.0) as f32
    }

    fn beat_intensity(&self) -> f32 {
        let base = 0.5 + self.energy.clamp(0.0, 1.0) * 0.5;
        base * (0.5 + 0.5 * self.state.confidence)
    }

    fn retime(&mut self, now_ms: f64) {
        let interval = self.tempo.interval_ms();
        let last = self.state.last_beat_timestamp;
        let mut next = last + interval;
        if next <= now_ms {
            next += ((now_ms - next) / interval).floor() * interval + interval;
        }
        let last = next - interval;
        self.state.interval_ms = interval;
        self.state.last_beat_timestamp = last;
        self.state.next_beat_timestamp = next;
    }

    fn decay_confidence(&mut self, now_ms: f64) {
        let Some(received) = self.features_at_ms else {
            return;
        };
        let overdue = now_ms - received - self.stale_after_ms;
        if overdue > 0.0 {
            let remaining = 1.0 - overdue / self.stale_after_ms;
            self.state.confidence = remaining.clamp(0.0, 1.0) as f32;
        }
    }
}
