//! Health events for whatever observability layer the host attaches.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{beat::BeatEvent, color::HarmonizedPalette, output::FlushReport};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum DiagnosticEvent {
    BeatDetected(BeatEvent),
    PaletteUpdated {
        generation: u64,
        palette: Arc<HarmonizedPalette>,
    },
    QualityLevelChanged {
        previous: f32,
        current: f32,
        frame_time_ms: f32,
    },
    FlushCompleted(FlushReport),
}

/// Fan-out of [`DiagnosticEvent`]s. Emitting never fails; events are simply
/// lost when nobody listens or a subscriber lags behind.
#[derive(Debug, Clone)]
pub struct DiagnosticsHub {
    tx: broadcast::Sender<DiagnosticEvent>,
}

impl Default for DiagnosticsHub {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl DiagnosticsHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: DiagnosticEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let hub = DiagnosticsHub::new();
        hub.emit(DiagnosticEvent::QualityLevelChanged {
            previous: 1.0,
            current: 0.9,
            frame_time_ms: 40.0,
        });
    }

    #[test]
    fn subscribers_receive_events() {
        let hub = DiagnosticsHub::new();
        let mut rx = hub.subscribe();
        hub.emit(DiagnosticEvent::BeatDetected(BeatEvent {
            beat_index: 3,
            intensity: 0.8,
            bpm: 120.0,
            timestamp_ms: 1_500.0,
        }));

        match rx.try_recv().unwrap() {
            DiagnosticEvent::BeatDetected(beat) => assert_eq!(beat.beat_index, 3),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
