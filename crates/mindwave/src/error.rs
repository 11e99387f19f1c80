//! # Error Types
//!
//! Semantic error types for the ThinkGear client and the session
//! orchestrator. Every variant carries enough context to diagnose the
//! problem without digging through logs.
//!
//! ## Categories
//!
//! | Category | Variants | Surfaced how |
//! |----------|----------|--------------|
//! | Connection | `ConnectionFailed`, `ConnectionLost`, `NotConnected`, `Timeout`, `RetriesExhausted` | Retried inside [`Connector::start`](crate::Connector::start), reported as `false` |
//! | Protocol | `ProtocolError` | Frame dropped and logged |
//! | Configuration | `ConfigError` | Returned at construction |
//! | State | `SessionAlreadyActive`, `SessionStillActive`, `SessionFinished`, `SessionNotRun`, `NothingToSave` | Returned immediately, no side effects |

use thiserror::Error;

/// Convenient Result alias for MindWave operations.
pub type MindwaveResult<T> = std::result::Result<T, MindwaveError>;

/// All errors that can occur when talking to the ThinkGear Connector or
/// running a session.
#[derive(Error, Debug)]
pub enum MindwaveError {
    // ─── Connection ─────────────────────────────────────────────────
    /// Failed to open a TCP connection to the ThinkGear Connector.
    #[error(
        "Failed to connect to ThinkGear Connector at {addr}: {reason}. Is the ThinkGear Connector running?"
    )]
    ConnectionFailed { addr: String, reason: String },

    /// The socket was closed or failed after the headset was streaming.
    #[error("Connection to ThinkGear Connector lost: {reason}")]
    ConnectionLost { reason: String },

    /// An operation needed an open connection but there is none.
    #[error("Not connected to ThinkGear Connector")]
    NotConnected,

    /// A connection attempt did not produce headset data in time.
    #[error("No headset data within {millis}ms. Is the headset powered on and paired?")]
    Timeout { millis: u64 },

    /// All connection attempts have been exhausted.
    #[error("Connection failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: Box<MindwaveError>,
    },

    // ─── Protocol ───────────────────────────────────────────────────
    /// Received a malformed frame from the ThinkGear Connector.
    #[error("Protocol error: {reason}")]
    ProtocolError { reason: String },

    // ─── Config ─────────────────────────────────────────────────────
    /// Invalid session configuration or configuration file.
    #[error("Configuration error: {reason}")]
    ConfigError { reason: String },

    // ─── Session state ──────────────────────────────────────────────
    /// `start()` was called on a session that is already running.
    #[error("Session is already active")]
    SessionAlreadyActive,

    /// `save()` was called while the session is still running.
    #[error("Session is still active. Stop it or wait for it to finish before saving.")]
    SessionStillActive,

    /// `start()` was called on a session that already ran to completion.
    #[error("Session already finished. Create a new session to record again.")]
    SessionFinished,

    /// `save()` was called on a session that was never started.
    #[error("Session was never started")]
    SessionNotRun,

    /// `save()` was called but no samples were recorded.
    #[error("Session recorded no samples, nothing to save")]
    NothingToSave,

    // ─── I/O ────────────────────────────────────────────────────────
    /// Socket, filesystem, or persistence I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MindwaveError {
    /// Returns `true` if this error is transient and a connection attempt
    /// can be repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MindwaveError::ConnectionFailed { .. }
                | MindwaveError::ConnectionLost { .. }
                | MindwaveError::Timeout { .. }
                | MindwaveError::Io(_)
        )
    }

    /// Returns `true` if this error indicates the connection is dead.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MindwaveError::ConnectionFailed { .. }
                | MindwaveError::ConnectionLost { .. }
                | MindwaveError::NotConnected
                | MindwaveError::RetriesExhausted { .. }
        )
    }

    /// Returns `true` for configuration mistakes.
    pub fn is_config_error(&self) -> bool {
        matches!(self, MindwaveError::ConfigError { .. })
    }

    /// Returns `true` if the error comes from calling a session operation
    /// in the wrong state.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            MindwaveError::SessionAlreadyActive
                | MindwaveError::SessionStillActive
                | MindwaveError::SessionFinished
                | MindwaveError::SessionNotRun
                | MindwaveError::NothingToSave
        )
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        MindwaveError::ConfigError {
            reason: reason.into(),
        }
    }
}

// ─── From impls for external error types ────────────────────────────────

#[cfg(feature = "config-toml")]
impl From<toml::de::Error> for MindwaveError {
    fn from(err: toml::de::Error) -> Self {
        MindwaveError::ConfigError {
            reason: err.to_string(),
        }
    }
}
