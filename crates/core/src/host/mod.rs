//! Interfaces to the collaborators the engine does not own: the host player,
//! album-art colour extraction, performance monitoring and the preference
//! store.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{color::ColorSample, MusicSyncError, Result};

/// Error reported by a host collaborator. Carries only a message, the engine
/// never inspects host error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HostError(pub String);

impl HostError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Raw audio-feature lookup on the host player.
///
/// The payload is untyped on purpose; [`crate::features::AudioFeatures::from_host`]
/// is the only place it is interpreted.
#[async_trait]
pub trait HostPlayerApi: Send + Sync {
    async fn audio_features(&self, track_id: &str) -> std::result::Result<Value, HostError>;
}

/// Album-art analysis returning a handful of named colours.
#[async_trait]
pub trait ColorExtractor: Send + Sync {
    async fn extract(&self, art_url: &str) -> std::result::Result<Vec<ColorSample>, HostError>;
}

/// Metadata for the track the host just started playing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: String,
    pub art_url: Option<String>,
    pub duration_ms: Option<f64>,
}

impl TrackInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            art_url: None,
            duration_ms: None,
        }
    }

    pub fn with_art(mut self, url: impl Into<String>) -> Self {
        self.art_url = Some(url.into());
        self
    }

    pub fn with_duration(mut self, duration_ms: f64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Periodic reading from the host's performance monitor.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub frame_time_ms: f32,
    pub estimated_fps: f32,
    pub memory_mb: f32,
    pub cpu_percent: f32,
}

impl PerformanceSample {
    /// Sample with only the frame time filled in, fps derived from it.
    pub fn from_frame_time(frame_time_ms: f32) -> Self {
        Self {
            frame_time_ms,
            estimated_fps: if frame_time_ms > 0.0 {
                1000.0 / frame_time_ms
            } else {
                0.0
            },
            ..Default::default()
        }
    }
}

/// Events raised by the host between ticks. They are queued and applied at the
/// start of the next tick, never in the middle of one.
#[derive(Debug, Clone)]
pub enum HostEvent {
    TrackChanged { track: TrackInfo, started_at_ms: f64 },
    /// Playback position report, used to realign the beat grid after seeks.
    PlaybackPosition { position_ms: f64, at_ms: f64 },
    Performance(PerformanceSample),
    PreferencesChanged,
    /// Mono PCM block for live energy analysis.
    AudioBlock(Vec<f32>),
}

/// Simple key/value settings storage owned by the host.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value);
}

/// In-memory [`PreferenceStore`], optionally seeded from a JSON object.
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferenceStore {
    values: HashMap<String, Value>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(json)? {
            Value::Object(map) => Ok(Self {
                values: map.into_iter().collect(),
            }),
            _ => Err(MusicSyncError::msg("preferences must be a JSON object")),
        }
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }
}
