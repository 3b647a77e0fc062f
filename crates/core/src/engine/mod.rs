//! The per-frame tick loop.
//!
//! Host events are queued and applied at the start of the next tick. Network
//! work runs on spawned tasks that report back over a channel tagged with the
//! track generation they were started for; results from an older generation
//! are dropped. Within a tick the order is fixed: host events, completed
//! async work, beat scheduling, palette, coordinator evolution, output flush.

use std::{collections::VecDeque, fmt, sync::Arc};

use tokio::{
    runtime::Handle,
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    analysis::LiveAnalysis,
    beat::{BeatEvent, BeatScheduler},
    color::{ColorHarmonyEngine, ColorSample, HarmonizedPalette},
    config::{EngineConfig, Preferences},
    coordinator::{TickInputs, VisualEffectState, VisualEffectsCoordinator, VisualParticipant},
    diagnostics::{DiagnosticEvent, DiagnosticsHub},
    error::FetchError,
    features::{AudioFeatureCache, AudioFeatures},
    host::{ColorExtractor, HostError, HostEvent, HostPlayerApi, PreferenceStore, TrackInfo},
    mapping::OutputMapper,
    output::{BatcherStats, FlushReport, OutputSurface, OutputVariableBatcher, Priority},
    MusicSyncError, Result,
};

/// Position reports further than this from the predicted grid trigger a seek.
const SEEK_THRESHOLD_MS: f64 = 250.0;

enum AsyncOutcome {
    Features(std::result::Result<AudioFeatures, FetchError>),
    Colors(std::result::Result<Vec<ColorSample>, HostError>),
}

struct AsyncResult {
    generation: u64,
    outcome: AsyncOutcome,
}

/// What happened during one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub generation: u64,
    pub state_version: u64,
    pub beat: Option<BeatEvent>,
    pub palette_updated: bool,
    /// Async results discarded because they belonged to an older track.
    pub stale_discarded: usize,
    pub faulted: Vec<String>,
    pub flush: FlushReport,
}

pub struct SyncEngine {
    config: EngineConfig,
    runtime: Handle,
    cache: AudioFeatureCache,
    extractor: Arc<dyn ColorExtractor>,
    beat: BeatScheduler,
    colors: ColorHarmonyEngine,
    coordinator: VisualEffectsCoordinator,
    batcher: OutputVariableBatcher,
    mapper: OutputMapper,
    analysis: LiveAnalysis,
    diagnostics: DiagnosticsHub,
    preferences: Option<Box<dyn PreferenceStore>>,
    events: VecDeque<HostEvent>,
    generation: u64,
    current_track: Option<TrackInfo>,
    results_tx: mpsc::UnboundedSender<AsyncResult>,
    results_rx: mpsc::UnboundedReceiver<AsyncResult>,
    extraction: Option<JoinHandle<()>>,
    /// The first palette of a track is flushed out of band.
    palette_is_new_track: bool,
    ticks: u64,
}

impl SyncEngine {
    /// Builds the engine. Must be called from within a tokio runtime, which is
    /// used for every fetch the engine starts.
    pub fn new(
        config: EngineConfig,
        host: Arc<dyn HostPlayerApi>,
        extractor: Arc<dyn ColorExtractor>,
        surface: Box<dyn OutputSurface>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| MusicSyncError::msg("SyncEngine must be created inside a tokio runtime"))?;

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Ok(Self {
            cache: AudioFeatureCache::new(host, config.cache.clone()),
            beat: BeatScheduler::new(config.beat.clone()),
            colors: ColorHarmonyEngine::new(config.color.clone())?,
            coordinator: VisualEffectsCoordinator::new(config.coordinator.clone()),
            batcher: OutputVariableBatcher::new(surface, config.batcher.clone()),
            mapper: OutputMapper::default(),
            analysis: LiveAnalysis::new(),
            diagnostics: DiagnosticsHub::new(),
            preferences: None,
            events: VecDeque::new(),
            generation: 0,
            current_track: None,
            results_tx,
            results_rx,
            extraction: None,
            palette_is_new_track: false,
            ticks: 0,
            runtime,
            extractor,
            config,
        })
    }

    /// Attaches the host's preference store and applies it right away.
    pub fn with_preferences(mut self, store: Box<dyn PreferenceStore>) -> Self {
        self.preferences = Some(store);
        self.reload_preferences(0.0);
        self
    }

    pub fn with_mapper(mut self, mapper: OutputMapper) -> Self {
        self.mapper = mapper;
        self
    }

    /// Queues a host event for the next tick.
    pub fn push_event(&mut self, event: HostEvent) {
        self.events.push_back(event);
    }

    pub fn register_participant(&mut self, participant: Box<dyn VisualParticipant>) -> Result<()> {
        self.coordinator.register(participant)
    }

    pub fn unregister_participant(&mut self, name: &str) -> Result<()> {
        self.coordinator.unregister(name)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DiagnosticEvent> {
        self.diagnostics.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current_track(&self) -> Option<&TrackInfo> {
        self.current_track.as_ref()
    }

    pub fn state(&self) -> Arc<VisualEffectState> {
        self.coordinator.snapshot()
    }

    pub fn palette(&self) -> Arc<HarmonizedPalette> {
        self.colors.current()
    }

    pub fn beat(&self) -> &BeatScheduler {
        &self.beat
    }

    pub fn cache(&self) -> &AudioFeatureCache {
        &self.cache
    }

    pub fn coordinator(&self) -> &VisualEffectsCoordinator {
        &self.coordinator
    }

    pub fn batcher_stats(&self) -> BatcherStats {
        self.batcher.stats()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs one frame. `now_ms` is the host's animation-frame timestamp.
    pub fn tick(&mut self, now_ms: f64) -> TickReport {
        self.ticks += 1;

        while let Some(event) = self.events.pop_front() {
            self.apply_event(event, now_ms);
        }

        let mut stale_discarded = 0;
        let mut samples = None;
        while let Ok(result) = self.results_rx.try_recv() {
            if result.generation != self.generation {
                stale_discarded += 1;
                debug!(result_generation = result.generation, generation = self.generation, "discarding stale async result");
                continue;
            }
            match result.outcome {
                AsyncOutcome::Features(Ok(features)) => self.beat.apply_features(&features, now_ms),
                AsyncOutcome::Features(Err(err)) => {
                    warn!(error = %err, "audio features unavailable, using fallback tempo");
                    self.beat.use_fallback(now_ms);
                }
                AsyncOutcome::Colors(Ok(found)) => samples = Some(found),
                AsyncOutcome::Colors(Err(err)) => {
                    warn!(error = %err, "colour extraction failed, using base palette");
                    samples = Some(Vec::new());
                }
            }
        }

        let beat = self.beat.tick(now_ms);
        if let Some(event) = beat {
            self.diagnostics.emit(DiagnosticEvent::BeatDetected(event));
            self.batcher.propose(self.mapper.beat_batch(&event));
        }

        let palette_updated = samples.is_some();
        if let Some(samples) = samples {
            self.publish_palette(&samples);
        }

        let palette = self.colors.current();
        let energy = self
            .analysis
            .recent_energy()
            .unwrap_or_else(|| self.beat.energy());
        let inputs = TickInputs {
            beat: self.beat.state(),
            tempo: self.beat.tempo(),
            palette: &palette,
            energy,
            valence: self.beat.valence(),
        };
        let evolution = self.coordinator.evolve(&inputs);
        if let Some(change) = evolution.quality_change {
            debug!(previous = change.previous, current = change.current, "quality level changed");
            self.diagnostics.emit(DiagnosticEvent::QualityLevelChanged {
                previous: change.previous,
                current: change.current,
                frame_time_ms: change.frame_time_ms,
            });
        }

        let state = self.coordinator.snapshot();
        let phase = self.beat.phase(now_ms);
        self.batcher.propose(self.mapper.state_batch(&state, phase));
        let flush = self.batcher.flush();
        self.diagnostics.emit(DiagnosticEvent::FlushCompleted(flush));

        TickReport {
            tick: self.ticks,
            generation: self.generation,
            state_version: evolution.version,
            beat,
            palette_updated,
            stale_discarded,
            faulted: evolution.faulted,
            flush,
        }
    }

    /// Stops beat prediction and cancels outstanding extraction.
    pub fn stop(&mut self) {
        self.beat.stop();
        if let Some(task) = self.extraction.take() {
            task.abort();
        }
    }

    fn apply_event(&mut self, event: HostEvent, now_ms: f64) {
        match event {
            HostEvent::TrackChanged {
                track,
                started_at_ms,
            } => self.start_track(track, started_at_ms, now_ms),
            HostEvent::PlaybackPosition { position_ms, at_ms } => {
                let drift = (self.beat.track_position_ms(at_ms) - position_ms).abs();
                if drift > SEEK_THRESHOLD_MS {
                    debug!(position_ms, drift, "realigning beat grid");
                    self.beat.seek(position_ms, at_ms);
                }
            }
            HostEvent::Performance(sample) => self.coordinator.record_performance(sample),
            HostEvent::PreferencesChanged => self.reload_preferences(now_ms),
            HostEvent::AudioBlock(samples) => {
                if let Err(err) = self.analysis.process_block(&samples) {
                    debug!(error = %err, "ignoring audio block");
                }
            }
        }
    }

    fn start_track(&mut self, track: TrackInfo, started_at_ms: f64, now_ms: f64) {
        self.generation += 1;
        let generation = self.generation;
        info!(track_id = %track.id, generation, "track changed");

        if let Some(task) = self.extraction.take() {
            task.abort();
        }
        self.beat.start_track(started_at_ms, track.duration_ms);
        self.analysis.reset();
        self.palette_is_new_track = true;

        match self.cache.get(&track.id) {
            Ok(features) => self.beat.apply_features(&features, now_ms),
            Err(_) => {
                let cache = self.cache.clone();
                let tx = self.results_tx.clone();
                let track_id = track.id.clone();
                // Fetches are left to finish after a track change so the
                // cache still fills; the generation check drops the result.
                self.runtime.spawn(async move {
                    let outcome = AsyncOutcome::Features(cache.fetch(&track_id).await);
                    let _ = tx.send(AsyncResult { generation, outcome });
                });
            }
        }

        match track.art_url.clone() {
            Some(url) => {
                let extractor = Arc::clone(&self.extractor);
                let tx = self.results_tx.clone();
                self.extraction = Some(self.runtime.spawn(async move {
                    let outcome = AsyncOutcome::Colors(extractor.extract(&url).await);
                    let _ = tx.send(AsyncResult { generation, outcome });
                }));
            }
            None => self.publish_palette(&[]),
        }

        self.current_track = Some(track);
    }

    fn publish_palette(&mut self, samples: &[ColorSample]) {
        let palette = self.colors.publish(samples);
        let priority = if self.palette_is_new_track {
            Priority::Critical
        } else {
            Priority::Background
        };
        self.palette_is_new_track = false;

        self.diagnostics.emit(DiagnosticEvent::PaletteUpdated {
            generation: self.generation,
            palette: Arc::clone(&palette),
        });
        if let Some(report) = self.batcher.propose(self.mapper.palette_batch(&palette, priority)) {
            self.diagnostics.emit(DiagnosticEvent::FlushCompleted(report));
        }
    }

    fn reload_preferences(&mut self, now_ms: f64) {
        let Some(store) = self.preferences.as_deref() else {
            return;
        };
        let prefs = Preferences::from_store(store);
        self.config.apply_preferences(&prefs);

        self.colors.set_intensity(self.config.color.harmonic_intensity);
        if prefs.quality_override.is_some() {
            self.coordinator
                .set_quality_override(self.config.coordinator.quality_override);
        }
        if prefs.fallback_bpm.is_some() {
            self.beat.set_fallback_bpm(self.config.beat.fallback_bpm, now_ms);
        }
        debug!(?prefs, "preferences applied");
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("generation", &self.generation)
            .field("ticks", &self.ticks)
            .field("track", &self.current_track.as_ref().map(|t| &t.id))
            .field("queued_events", &self.events.len())
            .field("coordinator", &self.coordinator)
            .field("batcher", &self.batcher)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::{
        color::{ColorRole, Rgb},
        features::tests::{payload, FlakyHost},
        host::MemoryPreferenceStore,
        render::RecordingSurface,
    };

    struct StaticColors;

    #[async_trait]
    impl ColorExtractor for StaticColors {
        async fn extract(&self, _art_url: &str) -> std::result::Result<Vec<ColorSample>, HostError> {
            Ok(vec![ColorSample::new(ColorRole::Vibrant, Rgb::new(220, 40, 60))])
        }
    }

    fn engine(host: Arc<dyn HostPlayerApi>) -> (SyncEngine, RecordingSurface) {
        let surface = RecordingSurface::new();
        let engine = SyncEngine::new(
            EngineConfig::default(),
            host,
            Arc::new(StaticColors),
            Box::new(surface.clone()),
        )
        .unwrap();
        (engine, surface)
    }

    fn track(id: &str) -> TrackInfo {
        TrackInfo::new(id).with_art(format!("art://{id}"))
    }

    #[test]
    fn requires_a_runtime() {
        let result = SyncEngine::new(
            EngineConfig::default(),
            Arc::new(FlakyHost::new(0, Value::Null)),
            Arc::new(StaticColors),
            Box::new(RecordingSurface::new()),
        );
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn applies_features_and_palette_on_later_tick() {
        let (mut engine, surface) = engine(Arc::new(FlakyHost::new(0, payload())));
        engine.push_event(HostEvent::TrackChanged {
            track: track("a"),
            started_at_ms: 0.0,
        });

        let first = engine.tick(0.0);
        assert_eq!(first.generation, 1);
        assert_eq!(engine.beat().tempo().effective_bpm, 120.0);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let second = engine.tick(16.0);
        assert!(second.palette_updated);
        assert_eq!(engine.beat().tempo().effective_bpm, 77.0);
        assert!(engine.palette().blended);
        assert!(surface.value("--sn-color-primary").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_results_are_discarded() {
        let (mut engine, _surface) = engine(Arc::new(FlakyHost::new(0, payload())));
        engine.push_event(HostEvent::TrackChanged {
            track: track("old"),
            started_at_ms: 0.0,
        });
        engine.tick(0.0);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        engine.push_event(HostEvent::TrackChanged {
            track: TrackInfo::new("new"),
            started_at_ms: 50.0,
        });
        let report = engine.tick(50.0);

        assert_eq!(report.generation, 2);
        assert!(report.stale_discarded >= 1);
        assert_eq!(engine.beat().tempo().effective_bpm, 120.0);
        assert!(!engine.palette().blended);
    }

    #[tokio::test]
    async fn cached_features_apply_immediately() {
        let (mut engine, _surface) = engine(Arc::new(FlakyHost::new(0, payload())));
        engine
            .cache()
            .insert(AudioFeatures::from_host("cached", &payload()).unwrap())
            .unwrap();

        engine.push_event(HostEvent::TrackChanged {
            track: TrackInfo::new("cached"),
            started_at_ms: 0.0,
        });
        engine.tick(0.0);
        assert_eq!(engine.beat().tempo().effective_bpm, 77.0);
        assert_eq!(engine.beat().state().confidence, 1.0);
    }

    #[tokio::test]
    async fn preference_changes_apply_on_next_tick() {
        let store = MemoryPreferenceStore::from_json(r#"{ "qualityOverride": 0.3 }"#).unwrap();
        let (engine, _surface) = engine(Arc::new(FlakyHost::new(0, payload())));
        let mut engine = engine.with_preferences(Box::new(store));

        engine.tick(0.0);
        assert_eq!(engine.state().quality_level, 0.3);

        engine.push_event(HostEvent::PreferencesChanged);
        engine.tick(16.0);
        assert_eq!(engine.state().quality_level, 0.3);
    }

    #[tokio::test]
    async fn seeks_when_position_drifts() {
        let (mut engine, _surface) = engine(Arc::new(FlakyHost::new(0, payload())));
        engine.push_event(HostEvent::TrackChanged {
            track: TrackInfo::new("t"),
            started_at_ms: 0.0,
        });
        engine.tick(0.0);

        engine.push_event(HostEvent::PlaybackPosition {
            position_ms: 30_000.0,
            at_ms: 1_000.0,
        });
        engine.tick(1_000.0);
        assert!((engine.beat().track_position_ms(1_000.0) - 30_000.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn audio_blocks_feed_recent_energy() {
        let (mut engine, _surface) = engine(Arc::new(FlakyHost::new(0, payload())));
        engine.push_event(HostEvent::AudioBlock(vec![0.0; 256]));
        engine.tick(0.0);
        assert_eq!(engine.state().energy_level, 0.0);
    }
}
