/// Result alias that carries the custom [`MusicSyncError`] type.
pub type Result<T> = std::result::Result<T, MusicSyncError>;

/// Common error type for the core crate.
///
/// Almost every variant has a defined fallback at the call site; only
/// [`MusicSyncError::Config`] is expected to stop the engine, and only at
/// startup.
#[derive(Debug, thiserror::Error)]
pub enum MusicSyncError {
    /// Free-form message for conditions that do not warrant their own variant.
    #[error("{0}")]
    Message(String),
    /// No cached entry exists for the requested track.
    #[error("no cached audio features for track `{0}`")]
    NotFound(String),
    /// Host lookups kept failing until the retry budget ran out.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// A participant with the same name is already registered.
    #[error("participant `{0}` is already registered")]
    DuplicateParticipant(String),
    /// No participant with this name is registered.
    #[error("participant `{0}` is not registered")]
    UnknownParticipant(String),
    /// A participant failed while producing its contribution.
    #[error("participant `{name}` failed: {reason}")]
    ParticipantFault { name: String, reason: String },
    /// The output surface rejected a write.
    #[error("output surface write failed: {0}")]
    SurfaceWrite(String),
    /// Configuration that cannot be recovered from.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Wrapper around JSON (de)serialisation errors.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl MusicSyncError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Shorthand for a configuration error.
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Self::Config(msg.into())
    }
}

impl From<&str> for MusicSyncError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for MusicSyncError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

/// Failure modes of an audio feature lookup.
///
/// Cloneable so a single in-flight request can hand the same outcome to every
/// caller waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The host API stayed unavailable for every attempt.
    #[error("fetching features for `{track_id}` failed after {attempts} attempts: {last_error}")]
    FetchFailed {
        track_id: String,
        attempts: u32,
        last_error: String,
    },
    /// The host answered, but required fields were missing or out of range.
    #[error("invalid audio features for `{track_id}`: {reason}")]
    InvalidResponse { track_id: String, reason: String },
}

impl FetchError {
    pub fn track_id(&self) -> &str {
        match self {
            Self::FetchFailed { track_id, .. } | Self::InvalidResponse { track_id, .. } => track_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_errors_convert_into_crate_error() {
        let err: MusicSyncError = FetchError::InvalidResponse {
            track_id: "abc".into(),
            reason: "missing tempo".into(),
        }
        .into();

        let text = err.to_string();
        assert!(text.contains("abc"));
        assert!(text.contains("missing tempo"));
    }

    #[test]
    fn exposes_track_id_for_both_variants() {
        let failed = FetchError::FetchFailed {
            track_id: "t1".into(),
            attempts: 10,
            last_error: "timeout".into(),
        };
        assert_eq!(failed.track_id(), "t1");
    }
}
