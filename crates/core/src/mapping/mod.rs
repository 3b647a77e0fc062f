use serde::{Deserialize, Serialize};

use crate::{
    beat::BeatEvent,
    color::HarmonizedPalette,
    coordinator::VisualEffectState,
    output::{OutputVariableBatch, Priority},
};

pub const BEAT_PHASE: &str = "--sn-beat-phase";
pub const BEAT_INTENSITY: &str = "--sn-beat-intensity";
pub const BEAT_BPM: &str = "--sn-beat-bpm";

/// Field of [`VisualEffectState`] that can be routed to an output variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    MusicIntensity,
    EnergyLevel,
    ColorTemperature,
    FluidIntensity,
    PulseRate,
    TransitionFluidity,
    QualityLevel,
}

impl StateField {
    pub fn read(self, state: &VisualEffectState) -> f32 {
        match self {
            Self::MusicIntensity => state.music_intensity,
            Self::EnergyLevel => state.energy_level,
            Self::ColorTemperature => state.color_temperature_kelvin,
            Self::FluidIntensity => state.fluid_intensity,
            Self::PulseRate => state.pulse_rate,
            Self::TransitionFluidity => state.transition_fluidity,
            Self::QualityLevel => state.quality_level,
        }
    }
}

/// Describes how a state field should be routed to an output variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingDescriptor {
    pub source: StateField,
    pub target: String,
    pub gain: f32,
}

impl MappingDescriptor {
    pub fn new(source: StateField, target: impl Into<String>) -> Self {
        Self {
            source,
            target: target.into(),
            gain: 1.0,
        }
    }
}

/// Turns published state, palette and beats into output batches.
#[derive(Debug, Clone)]
pub struct OutputMapper {
    descriptors: Vec<MappingDescriptor>,
}

impl Default for OutputMapper {
    fn default() -> Self {
        Self::new(vec![
            MappingDescriptor::new(StateField::MusicIntensity, "--sn-music-intensity"),
            MappingDescriptor::new(StateField::EnergyLevel, "--sn-energy-level"),
            MappingDescriptor::new(StateField::ColorTemperature, "--sn-color-temperature"),
            MappingDescriptor::new(StateField::FluidIntensity, "--sn-fluid-intensity"),
            MappingDescriptor::new(StateField::PulseRate, "--sn-pulse-rate"),
            MappingDescriptor::new(StateField::TransitionFluidity, "--sn-transition-fluidity"),
            MappingDescriptor::new(StateField::QualityLevel, "--sn-quality-level"),
        ])
    }
}

impl OutputMapper {
    pub fn new(descriptors: Vec<MappingDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn descriptors(&self) -> &[MappingDescriptor] {
        &self.descriptors
    }

    /// Continuous state values, proposed every tick.
    pub fn state_batch(&self, state: &VisualEffectState, beat_phase: f32) -> OutputVariableBatch {
        let mut batch = OutputVariableBatch::new("coordinator", Priority::Normal, "state evolution");
        for descriptor in &self.descriptors {
            batch.set(
                descriptor.target.clone(),
                descriptor.source.read(state) * descriptor.gain,
            );
        }
        batch.set(BEAT_PHASE, beat_phase);
        batch
    }

    /// Palette colours. Use [`Priority::Critical`] for the first palette of a
    /// new track so it lands without waiting for the next frame.
    pub fn palette_batch(&self, palette: &HarmonizedPalette, priority: Priority) -> OutputVariableBatch {
        OutputVariableBatch::new("color-harmony", priority, "palette update")
            .with("--sn-color-primary", palette.primary.rgb)
            .with("--sn-color-secondary", palette.secondary.rgb)
            .with("--sn-color-accent", palette.accent.rgb)
            .with("--sn-color-shadow", palette.shadow.rgb)
            .with("--sn-color-highlight", palette.highlight.rgb)
    }

    pub fn beat_batch(&self, beat: &BeatEvent) -> OutputVariableBatch {
        OutputVariableBatch::new("beat-scheduler", Priority::High, "beat")
            .with(BEAT_INTENSITY, beat.intensity)
            .with(BEAT_BPM, beat.bpm)
    }
}
