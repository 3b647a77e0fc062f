//! Per-track audio features fetched from the host player, with retries,
//! in-flight deduplication and a TTL + LRU bounded cache.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    config::CacheConfig,
    error::FetchError,
    host::HostPlayerApi,
    MusicSyncError, Result,
};

/// Audio features of a single track. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFeatures {
    pub track_id: String,
    pub tempo_bpm: f32,
    pub energy: f32,
    pub danceability: f32,
    pub valence: f32,
    pub duration_ms: f64,
}

impl AudioFeatures {
    /// Validates a raw host payload.
    ///
    /// `tempo`, `energy`, `danceability` and `valence` are required; the unit
    /// interval fields must lie in [0, 1] and the tempo must be positive.
    /// `duration_ms` defaults to zero when absent.
    pub fn from_host(track_id: &str, payload: &Value) -> std::result::Result<Self, FetchError> {
        let invalid = |reason: String| FetchError::InvalidResponse {
            track_id: track_id.to_string(),
            reason,
        };

        let object = payload
            .as_object()
            .ok_or_else(|| invalid("payload is not an object".to_string()))?;

        let number = |key: &str| -> std::result::Result<f64, FetchError> {
            object
                .get(key)
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite())
                .ok_or_else(|| invalid(format!("missing or non-numeric `{key}`")))
        };
        let unit = |key: &str| -> std::result::Result<f32, FetchError> {
            let value = number(key)?;
            if (0.0..=1.0).contains(&value) {
                Ok(value as f32)
            } else {
                Err(invalid(format!("`{key}` = {value} is outside [0, 1]")))
            }
        };

        let tempo = number("tempo")?;
        if tempo <= 0.0 {
            return Err(invalid(format!("tempo {tempo} is not positive")));
        }

        Ok(Self {
            track_id: track_id.to_string(),
            tempo_bpm: tempo as f32,
            energy: unit("energy")?,
            danceability: unit("danceability")?,
            valence: unit("valence")?,
            duration_ms: object
                .get("duration_ms")
                .and_then(Value::as_f64)
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(0.0),
        })
    }
}

type FetchResult = std::result::Result<AudioFeatures, FetchError>;
type InFlight = Shared<BoxFuture<'static, FetchResult>>;

/// Counters describing cache behaviour since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    /// Network lookups actually started (deduplicated requests count once).
    pub fetches: u64,
}

struct CacheEntry {
    features: AudioFeatures,
    inserted_at: Instant,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Least recently used at the front.
    recency: VecDeque<String>,
    in_flight: HashMap<String, InFlight>,
    stats: CacheStats,
}

impl CacheState {
    fn touch(&mut self, track_id: &str) {
        if let Some(pos) = self.recency.iter().position(|id| id == track_id) {
            self.recency.remove(pos);
        }
        self.recency.push_back(track_id.to_string());
    }

    fn remove(&mut self, track_id: &str) -> bool {
        if let Some(pos) = self.recency.iter().position(|id| id == track_id) {
            self.recency.remove(pos);
        }
        self.entries.remove(track_id).is_some()
    }
}

/// Cache of [`AudioFeatures`] keyed by track id.
///
/// Entries expire `ttl` after insertion regardless of how often they are
/// read, and the least recently used entry is evicted once `capacity` is
/// reached. Cloning yields another handle onto the same cache.
#[derive(Clone)]
pub struct AudioFeatureCache {
    api: Arc<dyn HostPlayerApi>,
    config: CacheConfig,
    state: Arc<Mutex<CacheState>>,
}

impl AudioFeatureCache {
    pub fn new(api: Arc<dyn HostPlayerApi>, config: CacheConfig) -> Self {
        Self {
            api,
            config,
            state: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_millis(self.config.ttl_ms)
    }

    /// Returns the cached features for `track_id`, or `NotFound` when absent
    /// or expired. Refreshes the entry's recency on a hit.
    pub fn get(&self, track_id: &str) -> Result<AudioFeatures> {
        let ttl = self.ttl();
        let mut state = self.lock()?;

        let expired = match state.entries.get(track_id) {
            Some(entry) => entry.inserted_at.elapsed() >= ttl,
            None => {
                state.stats.misses += 1;
                return Err(MusicSyncError::NotFound(track_id.to_string()));
            }
        };

        if expired {
            state.remove(track_id);
            state.stats.expirations += 1;
            state.stats.misses += 1;
            return Err(MusicSyncError::NotFound(track_id.to_string()));
        }

        state.stats.hits += 1;
        state.touch(track_id);
        match state.entries.get(track_id) {
            Some(entry) => Ok(entry.features.clone()),
            None => Err(MusicSyncError::NotFound(track_id.to_string())),
        }
    }

    /// Returns cached features or fetches them from the host.
    ///
    /// Concurrent calls for the same track share one underlying request.
    /// Callers should treat any error as "use the fallback tempo".
    pub async fn fetch(&self, track_id: &str) -> FetchResult {
        if let Ok(features) = self.get(track_id) {
            return Ok(features);
        }

        let shared = {
            let mut state = match self.lock() {
                Ok(state) => state,
                Err(err) => {
                    return Err(FetchError::FetchFailed {
                        track_id: track_id.to_string(),
                        attempts: 0,
                        last_error: err.to_string(),
                    })
                }
            };

            match state.in_flight.get(track_id) {
                Some(existing) => {
                    debug!(track_id, "joining in-flight feature request");
                    existing.clone()
                }
                None => {
                    state.stats.fetches += 1;
                    let future = fetch_with_retry(
                        Arc::clone(&self.api),
                        track_id.to_string(),
                        self.config.max_attempts,
                        Duration::from_millis(self.config.retry_delay_ms),
                    )
                    .boxed()
                    .shared();
                    state.in_flight.insert(track_id.to_string(), future.clone());
                    future
                }
            }
        };

        let result = shared.await;

        if let Ok(mut state) = self.lock() {
            state.in_flight.remove(track_id);
            if let Ok(features) = &result {
                if !state.entries.contains_key(track_id) {
                    self.insert_locked(&mut state, features.clone());
                }
            }
        }

        result
    }

    /// Inserts features directly, e.g. when restoring from a host-side cache.
    pub fn insert(&self, features: AudioFeatures) -> Result<()> {
        let mut state = self.lock()?;
        self.insert_locked(&mut state, features);
        Ok(())
    }

    fn insert_locked(&self, state: &mut CacheState, features: AudioFeatures) {
        let track_id = features.track_id.clone();
        state.remove(&track_id);

        while state.entries.len() >= self.config.capacity {
            let Some(oldest) = state.recency.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
            state.stats.evictions += 1;
            debug!(track_id = %oldest, "evicted least recently used features");
        }

        state.entries.insert(
            track_id.clone(),
            CacheEntry {
                features,
                inserted_at: Instant::now(),
            },
        );
        state.recency.push_back(track_id);
    }

    /// Drops the entry for `track_id`. Returns whether one existed.
    pub fn invalidate(&self, track_id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        Ok(state.remove(track_id))
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.entries.clear();
        state.recency.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().map(|state| state.stats).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| MusicSyncError::msg("feature cache has been poisoned"))
    }
}

impl fmt::Debug for AudioFeatureCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioFeatureCache")
            .field("config", &self.config)
            .field("entries", &self.len())
            .finish()
    }
}

async fn fetch_with_retry(
    api: Arc<dyn HostPlayerApi>,
    track_id: String,
    max_attempts: u32,
    delay: Duration,
) -> FetchResult {
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=max_attempts {
        match api.audio_features(&track_id).await {
            // An object with missing or out-of-range fields will not improve
            // on retry, so it is reported straight away.
            Ok(payload) if payload.is_object() => {
                return AudioFeatures::from_host(&track_id, &payload);
            }
            Ok(payload) => {
                warn!(track_id = %track_id, attempt, max_attempts, kind = json_kind(&payload), "malformed audio feature payload");
                last_error = format!("expected a JSON object, got {}", json_kind(&payload));
            }
            Err(err) => {
                warn!(track_id = %track_id, attempt, max_attempts, error = %err, "audio feature lookup failed");
                last_error = err.to_string();
            }
        }

        if attempt < max_attempts {
            tokio::time::sleep(delay).await;
        }
    }

    Err(FetchError::FetchFailed {
        track_id,
        attempts: max_attempts,
        last_error,
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
