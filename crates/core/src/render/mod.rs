use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    output::{OutputSurface, OutputValue},
    MusicSyncError, Result,
};

#[derive(Debug, Default)]
struct SurfaceState {
    values: BTreeMap<String, OutputValue>,
    write_calls: u64,
    variables_written: u64,
    fail_writes: bool,
}

/// In-memory render surface. Keeps the latest value of every variable so a
/// renderer (or a test) can read the table back.
///
/// Clones share the same table, which lets the owner of a batcher keep a
/// handle for inspection after handing the surface over.
#[derive(Debug, Clone, Default)]
pub struct RecordingSurface {
    shared: Arc<Mutex<SurfaceState>>,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, name: &str) -> Option<OutputValue> {
        self.lock().ok().and_then(|state| state.values.get(name).cloned())
    }

    /// Copy of the full variable table.
    pub fn snapshot(&self) -> BTreeMap<String, OutputValue> {
        self.lock()
            .map(|state| state.values.clone())
            .unwrap_or_default()
    }

    pub fn write_calls(&self) -> u64 {
        self.lock().map(|state| state.write_calls).unwrap_or(0)
    }

    pub fn variables_written(&self) -> u64 {
        self.lock().map(|state| state.variables_written).unwrap_or(0)
    }

    /// Makes every following write fail until switched off again.
    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut state) = self.lock() {
            state.fail_writes = fail;
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, SurfaceState>> {
        self.shared
            .lock()
            .map_err(|_| MusicSyncError::msg("render surface has been poisoned"))
    }
}

impl OutputSurface for RecordingSurface {
    fn apply(&mut self, writes: &[(String, OutputValue)]) -> Result<()> {
        let mut state = self.lock()?;
        if state.fail_writes {
            return Err(MusicSyncError::SurfaceWrite(
                "surface rejected the write".to_string(),
            ));
        }

        state.write_calls += 1;
        state.variables_written += writes.len() as u64;
        for (name, value) in writes {
            state.values.insert(name.clone(), value.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_latest_values() {
        let mut surface = RecordingSurface::new();
        let reader = surface.clone();

        surface
            .apply(&[("--x".to_string(), OutputValue::Number(1.0))])
            .unwrap();
        surface
            .apply(&[("--x".to_string(), OutputValue::Number(2.0))])
            .unwrap();

        assert_eq!(reader.value("--x"), Some(OutputValue::Number(2.0)));
        assert_eq!(reader.write_calls(), 2);
        assert_eq!(reader.variables_written(), 2);
    }

    #[test]
    fn injected_failures_leave_table_untouched() {
        let mut surface = RecordingSurface::new();
        surface.fail_writes(true);
        let err = surface
            .apply(&[("--x".to_string(), OutputValue::Number(1.0))])
            .unwrap_err();
        assert!(matches!(err, MusicSyncError::SurfaceWrite(_)));
        assert!(surface.snapshot().is_empty());
    }
}
