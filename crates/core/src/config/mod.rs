use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{color::Rgb, host::PreferenceStore, MusicSyncError, Result};

/// Upper bound for per-frame time budgets; a frame never lasts a second.
const MAX_BUDGET_MS: f32 = 1_000.0;

/// Top-level configuration structure for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheConfig,
    pub beat: BeatConfig,
    pub color: ColorConfig,
    pub coordinator: CoordinatorConfig,
    pub batcher: BatcherConfig,
}

impl EngineConfig {
    /// Parses a (possibly partial) JSON document. Missing sections keep their
    /// defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Rejects settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.color.base_palette.is_none() {
            return Err(MusicSyncError::config("no base palette configured"));
        }
        if self.cache.capacity == 0 {
            return Err(MusicSyncError::config("feature cache capacity must be non-zero"));
        }
        if self.cache.max_attempts == 0 {
            return Err(MusicSyncError::config("fetch attempts must be non-zero"));
        }
        let beat = &self.beat;
        if beat.min_bpm <= 0.0 || beat.max_bpm < beat.min_bpm {
            return Err(MusicSyncError::config(format!(
                "bpm bounds [{}, {}] are not a valid range",
                beat.min_bpm, beat.max_bpm
            )));
        }
        if beat.low_dance_threshold >= beat.high_dance_threshold {
            return Err(MusicSyncError::config(
                "low-dance threshold must sit below the high-dance threshold",
            ));
        }
        let coordinator = &self.coordinator;
        if coordinator.kelvin_min >= coordinator.kelvin_max {
            return Err(MusicSyncError::config("colour temperature range is empty"));
        }
        if coordinator.target_frame_ms <= 0.0
            || coordinator.critical_frame_ms < coordinator.target_frame_ms
        {
            return Err(MusicSyncError::config(
                "critical frame time must be at least the target frame time",
            ));
        }
        let budgets = [
            ("participant_time_slice_ms", coordinator.participant_time_slice_ms),
            ("frame_budget_ms", self.batcher.frame_budget_ms),
        ];
        for (name, value) in budgets {
            if !(value.is_finite() && value > 0.0 && value <= MAX_BUDGET_MS) {
                return Err(MusicSyncError::config(format!(
                    "{name} = {value} must lie in (0, {MAX_BUDGET_MS}] ms"
                )));
            }
        }
        if self.batcher.max_queued_batches == 0 {
            return Err(MusicSyncError::config("batcher queue bound must be non-zero"));
        }
        Ok(())
    }

    /// Folds user preferences over the loaded configuration.
    pub fn apply_preferences(&mut self, prefs: &Preferences) {
        if let Some(intensity) = prefs.harmonic_intensity {
            self.color.harmonic_intensity = intensity.clamp(0.0, 1.0);
        }
        if let Some(quality) = prefs.quality_override {
            self.coordinator.quality_override = quality.map(|q| q.clamp(0.0, 1.0));
        }
        if let Some(bpm) = prefs.fallback_bpm {
            self.beat.fallback_bpm = bpm.clamp(self.beat.min_bpm, self.beat.max_bpm);
        }
    }
}

/// Audio feature cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub capacity: usize,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5 * 60 * 1000,
            capacity: 100,
            max_attempts: 10,
            retry_delay_ms: 200,
        }
    }
}

/// Tempo derivation and beat prediction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeatConfig {
    pub fallback_bpm: f32,
    pub min_bpm: f32,
    pub max_bpm: f32,
    pub high_dance_threshold: f32,
    pub low_dance_threshold: f32,
    /// Staleness window used when the track duration is unknown.
    pub default_stale_after_ms: f64,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            fallback_bpm: 120.0,
            min_bpm: 40.0,
            max_bpm: 200.0,
            high_dance_threshold: 0.7,
            low_dance_threshold: 0.3,
            default_stale_after_ms: 240_000.0,
        }
    }
}

/// The fixed theme palette every extracted colour is blended against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasePalette {
    pub primary: Rgb,
    pub secondary: Rgb,
    pub accent: Rgb,
    pub shadow: Rgb,
    pub highlight: Rgb,
}

impl Default for BasePalette {
    fn default() -> Self {
        Self {
            primary: Rgb::new(0xcb, 0xa6, 0xf7),
            secondary: Rgb::new(0x89, 0xb4, 0xfa),
            accent: Rgb::new(0xf5, 0xc2, 0xe7),
            shadow: Rgb::new(0x11, 0x11, 0x1b),
            highlight: Rgb::new(0xf5, 0xe0, 0xdc),
        }
    }
}

/// Colour harmonisation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColorConfig {
    pub base_palette: Option<BasePalette>,
    /// Blend weight towards the extracted colour, 0 keeps the base palette.
    pub harmonic_intensity: f32,
    /// Fraction of the primary's lightness kept for the shadow.
    pub shadow_lightness_factor: f32,
    pub shadow_chroma_factor: f32,
    /// How far the highlight moves from the primary's lightness towards
    /// `highlight_lightness_ceiling`.
    pub highlight_lift: f32,
    pub highlight_lightness_ceiling: f32,
    pub highlight_chroma_factor: f32,
    /// Used when extraction produced no usable sample.
    pub safe_default: Rgb,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            base_palette: Some(BasePalette::default()),
            harmonic_intensity: 0.5,
            shadow_lightness_factor: 0.5,
            shadow_chroma_factor: 0.8,
            highlight_lift: 0.6,
            highlight_lightness_ceiling: 0.95,
            highlight_chroma_factor: 0.9,
            safe_default: Rgb::new(0x7f, 0x84, 0x9c),
        }
    }
}

/// Visual state evolution and quality scaling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub target_frame_ms: f32,
    pub critical_frame_ms: f32,
    pub quality_step_down: f32,
    pub severe_quality_step_down: f32,
    pub quality_recovery_step: f32,
    pub kelvin_min: f32,
    pub kelvin_max: f32,
    pub participant_time_slice_ms: f32,
    pub performance_window: usize,
    /// Pins the quality level and bypasses scaling when set.
    pub quality_override: Option<f32>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            target_frame_ms: 16.7,
            critical_frame_ms: 33.3,
            quality_step_down: 0.05,
            severe_quality_step_down: 0.1,
            quality_recovery_step: 0.01,
            kelvin_min: 1_000.0,
            kelvin_max: 20_000.0,
            participant_time_slice_ms: 2.0,
            performance_window: 30,
            quality_override: None,
        }
    }
}

/// Output variable batching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    pub frame_budget_ms: f32,
    /// Upper bound on variables written per flush; critical batches ignore it.
    pub max_writes_per_flush: usize,
    pub max_retries: u32,
    pub early_flush_on_critical: bool,
    /// Numeric values closer than this to the last applied value are skipped.
    pub number_epsilon: f32,
    /// Flushes a batch may be deferred for before it is written regardless of
    /// the frame budget.
    pub max_deferrals: u32,
    /// Queue bound; beyond it the oldest lowest-priority batch is dropped.
    pub max_queued_batches: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            frame_budget_ms: 4.0,
            max_writes_per_flush: 256,
            max_retries: 3,
            early_flush_on_critical: true,
            number_epsilon: 1e-4,
            max_deferrals: 4,
            max_queued_batches: 64,
        }
    }
}

/// User-tunable settings read from the host's preference store.
///
/// Each field is `None` when the store holds no (valid) value for it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preferences {
    pub harmonic_intensity: Option<f32>,
    /// `Some(None)` clears a previously set override.
    pub quality_override: Option<Option<f32>>,
    pub fallback_bpm: Option<f32>,
}

impl Preferences {
    pub const HARMONIC_INTENSITY: &'static str = "harmonicIntensity";
    pub const QUALITY_OVERRIDE: &'static str = "qualityOverride";
    pub const FALLBACK_BPM: &'static str = "fallbackBpm";

    pub fn from_store(store: &dyn PreferenceStore) -> Self {
        let number = |key: &str| {
            store
                .get(key)
                .and_then(|value| value.as_f64())
                .map(|v| v as f32)
        };

        let quality_override = store.get(Self::QUALITY_OVERRIDE).map(|value| {
            value.as_f64().map(|v| v as f32)
        });

        Self {
            harmonic_intensity: number(Self::HARMONIC_INTENSITY),
            quality_override,
            fallback_bpm: number(Self::FALLBACK_BPM),
        }
    }
}
