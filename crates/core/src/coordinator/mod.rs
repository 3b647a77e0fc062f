//! Shared visual state: one owner, many contributors.
//!
//! The coordinator is the only writer of [`VisualEffectState`]. Everyone else
//! reads published snapshots through a [`StateReader`] or proposes a
//! [`StateDelta`] when asked during [`VisualEffectsCoordinator::evolve`].

use std::{
    collections::VecDeque,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    beat::{BeatState, EnhancedTempo},
    color::HarmonizedPalette,
    config::CoordinatorConfig,
    host::PerformanceSample,
    MusicSyncError, Result,
};

/// Weight given to the coordinator's own targets when averaging with
/// participant contributions.
const CORE_WEIGHT: f32 = 1.0;

/// The coordinated visual state. Published whole; never mutated after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisualEffectState {
    pub music_intensity: f32,
    pub energy_level: f32,
    pub color_temperature_kelvin: f32,
    pub fluid_intensity: f32,
    /// Pulses per second, follows the effective tempo.
    pub pulse_rate: f32,
    pub transition_fluidity: f32,
    pub quality_level: f32,
    pub version: u64,
}

impl Default for VisualEffectState {
    fn default() -> Self {
        Self {
            music_intensity: 0.0,
            energy_level: 0.5,
            color_temperature_kelvin: 6_500.0,
            fluid_intensity: 0.5,
            pulse_rate: 2.0,
            transition_fluidity: 0.5,
            quality_level: 1.0,
            version: 0,
        }
    }
}

/// Partial state proposed by a participant. `None` fields abstain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDelta {
    pub music_intensity: Option<f32>,
    pub energy_level: Option<f32>,
    pub color_temperature_kelvin: Option<f32>,
    pub fluid_intensity: Option<f32>,
    pub pulse_rate: Option<f32>,
    pub transition_fluidity: Option<f32>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Read-only view on the published state. Holds a weak reference, so it
/// stops yielding snapshots once the coordinator is gone.
#[derive(Debug, Clone)]
pub struct StateReader {
    published: Weak<ArcSwap<VisualEffectState>>,
}

impl StateReader {
    pub fn snapshot(&self) -> Option<Arc<VisualEffectState>> {
        self.published.upgrade().map(|cell| cell.load_full())
    }
}

/// A visual system that contributes to the shared state.
pub trait VisualParticipant: Send {
    /// Stable, unique registry key.
    fn name(&self) -> &str;

    /// Weight of this participant's fields in the per-tick average.
    fn weight(&self) -> f32 {
        1.0
    }

    /// Called once on registration with a handle for reading snapshots.
    fn attach(&mut self, _reader: StateReader) {}

    /// Proposes changes relative to the previous snapshot.
    fn contribute(&mut self, previous: &VisualEffectState) -> Result<StateDelta>;

    /// One-way notification after each publish.
    fn on_state_updated(&mut self, _state: &VisualEffectState) {}

    /// Called when the participant leaves the registry.
    fn detach(&mut self) {}
}

/// Registry lifecycle. Entries that are gone are simply absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantPhase {
    Registered,
    Active,
    Unregistering,
}

struct Registration {
    participant: Box<dyn VisualParticipant>,
    name: String,
    phase: ParticipantPhase,
    faults: u64,
}

/// Read-only inputs gathered before evolution.
#[derive(Debug, Clone, Copy)]
pub struct TickInputs<'a> {
    pub beat: &'a BeatState,
    pub tempo: &'a EnhancedTempo,
    pub palette: &'a HarmonizedPalette,
    /// Most recent energy estimate, live analysis when available.
    pub energy: f32,
    pub valence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityChange {
    pub previous: f32,
    pub current: f32,
    pub frame_time_ms: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvolutionReport {
    pub version: u64,
    pub contributors: usize,
    /// Names of participants whose contribution was discarded this tick.
    pub faulted: Vec<String>,
    pub quality_change: Option<QualityChange>,
}

pub struct VisualEffectsCoordinator {
    config: CoordinatorConfig,
    published: Arc<ArcSwap<VisualEffectState>>,
    participants: Vec<Registration>,
    performance: VecDeque<PerformanceSample>,
    /// Set by `record_performance`, cleared once the quality step used it.
    fresh_sample: bool,
}

impl VisualEffectsCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        let initial = VisualEffectState {
            quality_level: config.quality_override.unwrap_or(1.0),
            ..VisualEffectState::default()
        };
        Self {
            config,
            published: Arc::new(ArcSwap::from_pointee(initial)),
            participants: Vec::new(),
            performance: VecDeque::new(),
            fresh_sample: false,
        }
    }

    /// Latest published state.
    pub fn snapshot(&self) -> Arc<VisualEffectState> {
        self.published.load_full()
    }

    pub fn reader(&self) -> StateReader {
        StateReader {
            published: Arc::downgrade(&self.published),
        }
    }

    pub fn register(&mut self, mut participant: Box<dyn VisualParticipant>) -> Result<()> {
        let name = participant.name().trim().to_string();
        if name.is_empty() {
            return Err(MusicSyncError::msg("participants need a non-empty name"));
        }
        if self.participants.iter().any(|entry| entry.name == name) {
            return Err(MusicSyncError::DuplicateParticipant(name));
        }

        participant.attach(self.reader());
        info!(participant = %name, "participant registered");
        self.participants.push(Registration {
            participant,
            name,
            phase: ParticipantPhase::Registered,
            faults: 0,
        });
        Ok(())
    }

    /// Marks a participant for removal. It stops contributing immediately and
    /// is detached at the start of the next evolution.
    pub fn unregister(&mut self, name: &str) -> Result<()> {
        let entry = self
            .participants
            .iter_mut()
            .find(|entry| entry.name == name && entry.phase != ParticipantPhase::Unregistering)
            .ok_or_else(|| MusicSyncError::UnknownParticipant(name.to_string()))?;
        entry.phase = ParticipantPhase::Unregistering;
        Ok(())
    }

    pub fn phase(&self, name: &str) -> Option<ParticipantPhase> {
        self.participants
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.phase)
    }

    pub fn participant_names(&self) -> Vec<&str> {
        self.participants
            .iter()
            .filter(|entry| entry.phase != ParticipantPhase::Unregistering)
            .map(|entry| entry.name.as_str())
            .collect()
    }

    /// Total discarded contributions for `name` since registration.
    pub fn fault_count(&self, name: &str) -> Option<u64> {
        self.participants
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.faults)
    }

    pub fn record_performance(&mut self, sample: PerformanceSample) {
        self.performance.push_back(sample);
        while self.performance.len() > self.config.performance_window.max(1) {
            self.performance.pop_front();
        }
        self.fresh_sample = true;
    }

    pub fn average_frame_time_ms(&self) -> Option<f32> {
        if self.performance.is_empty() {
            return None;
        }
        let sum: f32 = self.performance.iter().map(|s| s.frame_time_ms).sum();
        Some(sum / self.performance.len() as f32)
    }

    pub fn set_quality_override(&mut self, quality: Option<f32>) {
        self.config.quality_override = quality.map(|q| q.clamp(0.0, 1.0));
    }

    /// Runs one evolution step and publishes the result. Always publishes,
    /// whatever the participants do.
    pub fn evolve(&mut self, inputs: &TickInputs<'_>) -> EvolutionReport {
        self.purge_unregistered();

        let previous = self.snapshot();
        let target = self.targets(inputs);

        let mut merge = WeightedMerge::new(&target);
        let mut faulted = Vec::new();
        let slice = Duration::try_from_secs_f32(self.config.participant_time_slice_ms.max(0.0) / 1000.0)
            .unwrap_or(Duration::MAX);

        for entry in &mut self.participants {
            if entry.phase == ParticipantPhase::Registered {
                entry.phase = ParticipantPhase::Active;
            }

            let started = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| entry.participant.contribute(&previous)));
            let elapsed = started.elapsed();

            let delta = match outcome {
                Ok(Ok(delta)) if elapsed <= slice => delta,
                Ok(Ok(_)) => {
                    debug!(participant = %entry.name, elapsed_us = elapsed.as_micros() as u64, "contribution over time slice, dropped for this tick");
                    entry.faults += 1;
                    faulted.push(entry.name.clone());
                    continue;
                }
                Ok(Err(err)) => {
                    warn!(participant = %entry.name, error = %err, "participant contribution failed");
                    entry.faults += 1;
                    faulted.push(entry.name.clone());
                    continue;
                }
                Err(_) => {
                    warn!(participant = %entry.name, "participant panicked while contributing");
                    entry.faults += 1;
                    faulted.push(entry.name.clone());
                    continue;
                }
            };

            merge.add(&delta, entry.participant.weight());
        }

        let contributors = merge.contributors;
        let mut next = merge.finish();

        let previous_quality = previous.quality_level;
        let quality = self.next_quality(previous_quality);
        next.quality_level = quality;
        next.fluid_intensity *= quality;
        next.transition_fluidity *= quality;
        next.version = previous.version + 1;

        let quality_change = ((quality - previous_quality).abs() > f32::EPSILON).then(|| QualityChange {
            previous: previous_quality,
            current: quality,
            frame_time_ms: self.performance.back().map(|s| s.frame_time_ms).unwrap_or(0.0),
        });

        let published = Arc::new(next);
        self.published.store(Arc::clone(&published));

        for entry in &mut self.participants {
            let participant = &mut entry.participant;
            if catch_unwind(AssertUnwindSafe(|| participant.on_state_updated(&published))).is_err() {
                warn!(participant = %entry.name, "participant panicked on state update");
            }
        }

        EvolutionReport {
            version: published.version,
            contributors,
            faulted,
            quality_change,
        }
    }

    fn purge_unregistered(&mut self) {
        let mut index = 0;
        while index < self.participants.len() {
            if self.participants[index].phase == ParticipantPhase::Unregistering {
                let mut entry = self.participants.remove(index);
                entry.participant.detach();
                info!(participant = %entry.name, "participant unregistered");
            } else {
                index += 1;
            }
        }
    }

    /// Raw targets before participants and quality scaling.
    fn targets(&self, inputs: &TickInputs<'_>) -> VisualEffectState {
        let energy = inputs.energy.clamp(0.0, 1.0);
        let valence = inputs.valence.clamp(0.0, 1.0);

        let warmth = 0.6 * valence + 0.4 * inputs.palette.warmth();
        let (min_k, max_k) = (self.config.kelvin_min, self.config.kelvin_max);
        let kelvin = (max_k - warmth * (max_k - min_k)).clamp(min_k, max_k);

        VisualEffectState {
            music_intensity: inputs.beat.confidence.clamp(0.0, 1.0) * energy,
            energy_level: energy,
            color_temperature_kelvin: kelvin,
            fluid_intensity: (0.3 + 0.5 * energy + 0.2 * valence).clamp(0.0, 1.0),
            pulse_rate: inputs.tempo.effective_bpm / 60.0,
            transition_fluidity: (1.0 - 0.5 * energy).clamp(0.0, 1.0),
            quality_level: 1.0,
            version: 0,
        }
    }

    /// Steps quality towards what the latest frame time allows. Each sample
    /// moves quality once; without a new sample the level holds. Drops are
    /// immediate, recovery moves by a small bounded step.
    fn next_quality(&mut self, current: f32) -> f32 {
        if let Some(fixed) = self.config.quality_override {
            return fixed.clamp(0.0, 1.0);
        }
        if !std::mem::take(&mut self.fresh_sample) {
            return current;
        }
        let Some(sample) = self.performance.back() else {
            return current;
        };

        let frame_time = sample.frame_time_ms;
        let next = if frame_time > self.config.critical_frame_ms {
            current - self.config.severe_quality_step_down
        } else if frame_time > self.config.target_frame_ms {
            current - self.config.quality_step_down
        } else {
            current + self.config.quality_recovery_step
        };
        next.clamp(0.0, 1.0)
    }
}

impl fmt::Debug for VisualEffectsCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VisualEffectsCoordinator")
            .field("config", &self.config)
            .field("participants", &self.participant_names())
            .field("version", &self.snapshot().version)
            .finish()
    }
}

/// Per-field weighted average of the core target and participant deltas.
struct WeightedMerge {
    sums: [f32; 6],
    weights: [f32; 6],
    contributors: usize,
}

impl WeightedMerge {
    fn new(target: &VisualEffectState) -> Self {
        let fields = [
            target.music_intensity,
            target.energy_level,
            target.color_temperature_kelvin,
            target.fluid_intensity,
            target.pulse_rate,
            target.transition_fluidity,
        ];
        Self {
            sums: fields.map(|value| value * CORE_WEIGHT),
            weights: [CORE_WEIGHT; 6],
            contributors: 0,
        }
    }

    fn add(&mut self, delta: &StateDelta, weight: f32) {
        if !(weight.is_finite() && weight > 0.0) {
            return;
        }
        let fields = [
            delta.music_intensity,
            delta.energy_level,
            delta.color_temperature_kelvin,
            delta.fluid_intensity,
            delta.pulse_rate,
            delta.transition_fluidity,
        ];
        for (i, value) in fields.into_iter().enumerate() {
            if let Some(value) = value.filter(|v| v.is_finite()) {
                self.sums[i] += value * weight;
                self.weights[i] += weight;
            }
        }
        self.contributors += 1;
    }

    fn finish(self) -> VisualEffectState {
        let avg = |i: usize| self.sums[i] / self.weights[i];
        VisualEffectState {
            music_intensity: avg(0).clamp(0.0, 1.0),
            energy_level: avg(1).clamp(0.0, 1.0),
            color_temperature_kelvin: avg(2),
            fluid_intensity: avg(3).clamp(0.0, 1.0),
            pulse_rate: avg(4).max(0.0),
            transition_fluidity: avg(5).clamp(0.0, 1.0),
            quality_level: 1.0,
            version: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        beat::{BeatScheduler, EnhancedTempo},
        config::{BasePalette, BeatConfig},
    };

    struct Fixed {
        name: String,
        delta: StateDelta,
        updates: Arc<std::sync::atomic::AtomicU64>,
    }

    impl Fixed {
        fn new(name: &str, delta: StateDelta) -> Self {
            Self {
                name: name.to_string(),
                delta,
                updates: Arc::default(),
            }
        }
    }

    impl VisualParticipant for Fixed {
        fn name(&self) -> &str {
            &self.name
        }

        fn contribute(&mut self, _previous: &VisualEffectState) -> Result<StateDelta> {
            Ok(self.delta)
        }

        fn on_state_updated(&mut self, _state: &VisualEffectState) {
            self.updates.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    struct Failing;

    impl VisualParticipant for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn contribute(&mut self, _previous: &VisualEffectState) -> Result<StateDelta> {
            Err(MusicSyncError::ParticipantFault {
                name: "failing".into(),
                reason: "shader not ready".into(),
            })
        }
    }

    struct Panicking;

    impl VisualParticipant for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        fn contribute(&mut self, _previous: &VisualEffectState) -> Result<StateDelta> {
            panic!("boom")
        }
    }

    struct Slow;

    impl VisualParticipant for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn contribute(&mut self, _previous: &VisualEffectState) -> Result<StateDelta> {
            std::thread::sleep(Duration::from_millis(10));
            Ok(StateDelta {
                music_intensity: Some(1.0),
                ..Default::default()
            })
        }
    }

    struct Fixture {
        beat: BeatState,
        tempo: EnhancedTempo,
        palette: HarmonizedPalette,
    }

    impl Fixture {
        fn new() -> Self {
            let config = BeatConfig::default();
            let mut scheduler = BeatScheduler::new(config.clone());
            scheduler.start_track(0.0, None);
            Self {
                beat: *scheduler.state(),
                tempo: EnhancedTempo::fallback(&config),
                palette: HarmonizedPalette::from_base(&BasePalette::default()),
            }
        }

        fn inputs(&self) -> TickInputs<'_> {
            TickInputs {
                beat: &self.beat,
                tempo: &self.tempo,
                palette: &self.palette,
                energy: 0.8,
                valence: 0.5,
            }
        }
    }

    fn coordinator() -> VisualEffectsCoordinator {
        VisualEffectsCoordinator::new(CoordinatorConfig::default())
    }

    #[test]
    fn version_increments_by_one_per_tick() {
        let fixture = Fixture::new();
        let mut coordinator = coordinator();
        coordinator
            .register(Box::new(Fixed::new("a", StateDelta::default())))
            .unwrap();

        for expected in 1..=10_000u64 {
            let report = coordinator.evolve(&fixture.inputs());
            assert_eq!(report.version, expected);
            assert_eq!(coordinator.snapshot().version, expected);
        }
    }

    #[test]
    fn rejects_duplicate_and_empty_names() {
        let mut coordinator = coordinator();
        coordinator
            .register(Box::new(Fixed::new("fluid", StateDelta::default())))
            .unwrap();
        let err = coordinator
            .register(Box::new(Fixed::new("fluid", StateDelta::default())))
            .unwrap_err();
        assert!(matches!(err, MusicSyncError::DuplicateParticipant(name) if name == "fluid"));
        assert!(coordinator
            .register(Box::new(Fixed::new("  ", StateDelta::default())))
            .is_err());
    }

    #[test]
    fn failing_participants_are_isolated() {
        let fixture = Fixture::new();
        let mut coordinator = coordinator();
        coordinator.register(Box::new(Failing)).unwrap();
        coordinator.register(Box::new(Panicking)).unwrap();
        coordinator
            .register(Box::new(Fixed::new(
                "steady",
                StateDelta {
                    pulse_rate: Some(4.0),
                    ..Default::default()
                },
            )))
            .unwrap();

        let report = coordinator.evolve(&fixture.inputs());
        assert_eq!(report.version, 1);
        assert_eq!(report.contributors, 1);
        assert_eq!(report.faulted, vec!["failing".to_string(), "panicking".to_string()]);

        // core target 2.0 Hz (120 bpm) averaged with 4.0
        assert!((coordinator.snapshot().pulse_rate - 3.0).abs() < 1e-5);
        assert_eq!(coordinator.fault_count("failing"), Some(1));
        assert_eq!(coordinator.phase("failing"), Some(ParticipantPhase::Active));
    }

    #[test]
    fn slow_participants_are_dropped_for_the_tick_only() {
        let fixture = Fixture::new();
        let mut coordinator = coordinator();
        coordinator.register(Box::new(Slow)).unwrap();

        let report = coordinator.evolve(&fixture.inputs());
        assert_eq!(report.faulted, vec!["slow".to_string()]);
        assert_eq!(coordinator.participant_names(), vec!["slow"]);
    }

    #[test]
    fn unbounded_time_slice_does_not_panic() {
        let fixture = Fixture::new();
        let mut coordinator = VisualEffectsCoordinator::new(CoordinatorConfig {
            participant_time_slice_ms: 1e30,
            ..CoordinatorConfig::default()
        });
        coordinator
            .register(Box::new(Fixed::new("p", StateDelta::default())))
            .unwrap();

        let report = coordinator.evolve(&fixture.inputs());
        assert!(report.faulted.is_empty());
        assert_eq!(report.version, 1);
    }

    #[test]
    fn contributions_are_weighted_averages() {
        let fixture = Fixture::new();
        let mut coordinator = coordinator();
        coordinator
            .register(Box::new(Fixed::new(
                "calm",
                StateDelta {
                    energy_level: Some(0.2),
                    ..Default::default()
                },
            )))
            .unwrap();

        coordinator.evolve(&fixture.inputs());
        // (0.8 + 0.2) / 2
        assert!((coordinator.snapshot().energy_level - 0.5).abs() < 1e-5);
    }

    #[test]
    fn lifecycle_moves_through_phases() {
        let fixture = Fixture::new();
        let mut coordinator = coordinator();
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let mut participant = Fixed::new("p", StateDelta::default());
        participant.updates = Arc::clone(&counter);
        coordinator.register(Box::new(participant)).unwrap();
        assert_eq!(coordinator.phase("p"), Some(ParticipantPhase::Registered));

        coordinator.evolve(&fixture.inputs());
        assert_eq!(coordinator.phase("p"), Some(ParticipantPhase::Active));
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);

        coordinator.unregister("p").unwrap();
        assert_eq!(coordinator.phase("p"), Some(ParticipantPhase::Unregistering));
        assert!(coordinator.participant_names().is_empty());

        coordinator.evolve(&fixture.inputs());
        assert_eq!(coordinator.phase("p"), None);
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(matches!(
            coordinator.unregister("p"),
            Err(MusicSyncError::UnknownParticipant(_))
        ));
    }

    #[test]
    fn quality_drops_under_sustained_load_and_recovers_slowly() {
        let fixture = Fixture::new();
        let mut coordinator = coordinator();

        let mut last = coordinator.snapshot().quality_level;
        for _ in 0..5 {
            coordinator.record_performance(PerformanceSample::from_frame_time(40.0));
            coordinator.evolve(&fixture.inputs());
            let quality = coordinator.snapshot().quality_level;
            assert!(quality < last);
            assert!(quality >= 0.0);
            last = quality;
        }

        for _ in 0..50 {
            coordinator.record_performance(PerformanceSample::from_frame_time(40.0));
            coordinator.evolve(&fixture.inputs());
        }
        assert_eq!(coordinator.snapshot().quality_level, 0.0);

        coordinator.record_performance(PerformanceSample::from_frame_time(10.0));
        let report = coordinator.evolve(&fixture.inputs());
        let change = report.quality_change.unwrap();
        assert!(change.current > 0.0 && change.current <= 0.011);
    }

    #[test]
    fn moderate_overrun_steps_down_gently() {
        let fixture = Fixture::new();
        let mut coordinator = coordinator();
        coordinator.record_performance(PerformanceSample::from_frame_time(20.0));
        coordinator.evolve(&fixture.inputs());
        assert!((coordinator.snapshot().quality_level - 0.95).abs() < 1e-5);
    }

    #[test]
    fn single_spike_is_applied_once() {
        let fixture = Fixture::new();
        let mut coordinator = coordinator();
        coordinator.record_performance(PerformanceSample::from_frame_time(40.0));

        let first = coordinator.evolve(&fixture.inputs());
        assert!(first.quality_change.is_some());
        for _ in 0..12 {
            let report = coordinator.evolve(&fixture.inputs());
            assert!(report.quality_change.is_none());
        }
        assert!((coordinator.snapshot().quality_level - 0.9).abs() < 1e-5);

        coordinator.record_performance(PerformanceSample::from_frame_time(10.0));
        coordinator.evolve(&fixture.inputs());
        coordinator.evolve(&fixture.inputs());
        assert!((coordinator.snapshot().quality_level - 0.91).abs() < 1e-5);
    }

    #[test]
    fn quality_dampens_fluidity() {
        let fixture = Fixture::new();
        let mut coordinator = coordinator();
        coordinator.evolve(&fixture.inputs());
        let healthy = coordinator.snapshot().fluid_intensity;

        coordinator.set_quality_override(Some(0.5));
        coordinator.evolve(&fixture.inputs());
        let state = coordinator.snapshot();
        assert_eq!(state.quality_level, 0.5);
        assert!((state.fluid_intensity - healthy * 0.5).abs() < 1e-5);
    }

    #[test]
    fn warmer_inputs_lower_colour_temperature() {
        let fixture = Fixture::new();
        let mut coordinator = coordinator();

        let mut inputs = fixture.inputs();
        inputs.valence = 0.0;
        coordinator.evolve(&inputs);
        let sad = coordinator.snapshot().color_temperature_kelvin;

        inputs.valence = 1.0;
        coordinator.evolve(&inputs);
        let happy = coordinator.snapshot().color_temperature_kelvin;

        assert!(happy < sad);
        assert!((1_000.0..=20_000.0).contains(&happy));
    }

    #[test]
    fn reader_is_weak() {
        let coordinator = coordinator();
        let reader = coordinator.reader();
        assert!(reader.snapshot().is_some());
        drop(coordinator);
        assert!(reader.snapshot().is_none());
    }

    #[test]
    fn averages_frame_time_over_window() {
        let mut coordinator = VisualEffectsCoordinator::new(CoordinatorConfig {
            performance_window: 2,
            ..CoordinatorConfig::default()
        });
        assert_eq!(coordinator.average_frame_time_ms(), None);
        for ms in [10.0, 20.0, 30.0] {
            coordinator.record_performance(PerformanceSample::from_frame_time(ms));
        }
        assert_eq!(coordinator.average_frame_time_ms(), Some(25.0));
    }
}
