use serde::{Deserialize, Serialize};

use crate::{
    coordinator::{StateDelta, StateReader, VisualEffectState, VisualParticipant},
    Result,
};

const NEUTRAL_KELVIN: f32 = 6_500.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SceneKind {
    /// Flowing background gradients; wants smooth transitions.
    Fluid,
    /// Beat-synchronised glow; emphasises intensity on strong tracks.
    Pulse,
    /// Slow colour wash; pulls colour temperature towards neutral.
    Aurora,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneDescriptor {
    pub name: String,
    pub kind: SceneKind,
    pub weight: f32,
}

impl SceneDescriptor {
    pub fn new(name: impl Into<String>, kind: SceneKind) -> Self {
        Self {
            name: name.into(),
            kind,
            weight: 1.0,
        }
    }

    /// The trio the app registers by default.
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::new("fluid-gradient", SceneKind::Fluid),
            Self::new("beat-pulse", SceneKind::Pulse),
            Self {
                weight: 0.5,
                ..Self::new("aurora-wash", SceneKind::Aurora)
            },
        ]
    }
}

/// Built-in participant wrapping one visual scene.
#[derive(Debug)]
pub struct SceneParticipant {
    pub descriptor: SceneDescriptor,
    pub intensity: f32,
    pub motion: f32,
    pub seen_version: u64,
    reader: Option<StateReader>,
}

impl SceneParticipant {
    pub fn new(descriptor: SceneDescriptor) -> Self {
        Self {
            descriptor,
            intensity: 0.0,
            motion: 0.0,
            seen_version: 0,
            reader: None,
        }
    }

    /// Whether the coordinator this scene was attached to still exists.
    pub fn is_attached(&self) -> bool {
        self.reader
            .as_ref()
            .is_some_and(|reader| reader.snapshot().is_some())
    }
}

impl VisualParticipant for SceneParticipant {
    fn name(&self) -> &str {
        &self.descriptor.name
    }

    fn weight(&self) -> f32 {
        self.descriptor.weight
    }

    fn attach(&mut self, reader: StateReader) {
        if let Some(state) = reader.snapshot() {
            self.seen_version = state.version;
        }
        self.reader = Some(reader);
    }

    fn contribute(&mut self, previous: &VisualEffectState) -> Result<StateDelta> {
        let delta = match self.descriptor.kind {
            SceneKind::Fluid => StateDelta {
                fluid_intensity: Some((0.2 + 0.8 * previous.energy_level).clamp(0.0, 1.0)),
                transition_fluidity: Some((previous.transition_fluidity + 0.1).min(1.0)),
                ..StateDelta::default()
            },
            SceneKind::Pulse => StateDelta {
                music_intensity: Some((previous.music_intensity * 1.2).min(1.0)),
                pulse_rate: Some(previous.pulse_rate),
                ..StateDelta::default()
            },
            SceneKind::Aurora => StateDelta {
                color_temperature_kelvin: Some(
                    previous.color_temperature_kelvin * 0.9 + NEUTRAL_KELVIN * 0.1,
                ),
                ..StateDelta::default()
            },
        };
        Ok(delta)
    }

    fn on_state_updated(&mut self, state: &VisualEffectState) {
        self.seen_version = state.version;
        self.intensity = state.music_intensity;
        self.motion = match self.descriptor.kind {
            SceneKind::Fluid => state.fluid_intensity,
            SceneKind::Pulse => state.pulse_rate,
            SceneKind::Aurora => state.transition_fluidity,
        };
    }

    fn detach(&mut self) {
        self.reader = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::CoordinatorConfig, coordinator::VisualEffectsCoordinator};

    #[test]
    fn each_kind_contributes_its_own_fields() {
        let previous = VisualEffectState::default();

        let mut fluid = SceneParticipant::new(SceneDescriptor::new("f", SceneKind::Fluid));
        let delta = fluid.contribute(&previous).unwrap();
        assert!(delta.fluid_intensity.is_some());
        assert!(delta.music_intensity.is_none());

        let mut aurora = SceneParticipant::new(SceneDescriptor::new("a", SceneKind::Aurora));
        let delta = aurora.contribute(&previous).unwrap();
        assert_eq!(delta.color_temperature_kelvin, Some(6_500.0));
    }

    #[test]
    fn tracks_coordinator_through_weak_reader() {
        let mut coordinator = VisualEffectsCoordinator::new(CoordinatorConfig::default());
        let mut scene = SceneParticipant::new(SceneDescriptor::new("p", SceneKind::Pulse));
        scene.attach(coordinator.reader());
        assert!(scene.is_attached());

        for descriptor in SceneDescriptor::defaults() {
            coordinator
                .register(Box::new(SceneParticipant::new(descriptor)))
                .unwrap();
        }
        assert_eq!(coordinator.participant_names().len(), 3);

        drop(coordinator);
        assert!(!scene.is_attached());
    }

    #[test]
    fn follows_published_state() {
        let mut scene = SceneParticipant::new(SceneDescriptor::new("p", SceneKind::Pulse));
        let state = VisualEffectState {
            version: 7,
            music_intensity: 0.4,
            ..VisualEffectState::default()
        };
        scene.on_state_updated(&state);
        assert_eq!(scene.seen_version, 7);
        assert_eq!(scene.intensity, 0.4);
        assert_eq!(scene.motion, state.pulse_rate);
    }
}
