//! Core library for the Music Sync engine.
//!
//! Every animation frame the engine decides which colour and intensity values
//! should currently be shown, scales them to what the device can afford and
//! writes only the values that changed. Each module owns one subsystem: beat
//! prediction from per-track audio features, perceptual palette blending,
//! the shared visual-state coordinator and the output-variable batcher, tied
//! together by the tick loop in [`engine`].

pub mod analysis;
pub mod beat;
pub mod color;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod features;
pub mod host;
pub mod mapping;
pub mod output;
pub mod render;
pub mod scene;

pub use analysis::{AnalysisFrame, LiveAnalysis};
pub use beat::{BeatEvent, BeatScheduler, BeatState, EnhancedTempo, TempoMethod};
pub use color::{ColorHarmonyEngine, ColorRole, ColorSample, HarmonizedPalette, PaletteColor, Rgb};
pub use config::{BasePalette, EngineConfig, Preferences};
pub use coordinator::{
    ParticipantPhase, StateDelta, StateReader, VisualEffectState, VisualEffectsCoordinator,
    VisualParticipant,
};
pub use diagnostics::{DiagnosticEvent, DiagnosticsHub};
pub use engine::{SyncEngine, TickReport};
pub use error::{FetchError, MusicSyncError, Result};
pub use features::{AudioFeatureCache, AudioFeatures, CacheStats};
pub use host::{
    ColorExtractor, HostError, HostEvent, HostPlayerApi, MemoryPreferenceStore, PerformanceSample,
    PreferenceStore, TrackInfo,
};
pub use mapping::{MappingDescriptor, OutputMapper, StateField};
pub use output::{
    BatcherStats, FlushReport, OutputSurface, OutputValue, OutputVariableBatch,
    OutputVariableBatcher, Priority,
};
pub use render::RecordingSurface;
pub use scene::{SceneDescriptor, SceneKind, SceneParticipant};
