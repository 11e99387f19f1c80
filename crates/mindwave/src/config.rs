//! # Configuration
//!
//! [`MindwaveConfig`] holds everything needed to reach the ThinkGear
//! Connector and, optionally, the default session settings.
//!
//! ## Loading Priority
//!
//! Configuration is loaded from the first source that provides a value:
//!
//! 1. Explicit struct fields (programmatic construction)
//! 2. TOML config file at an explicit path
//! 3. File named by the `MINDWAVE_CONFIG` environment variable
//! 4. `./mindwave.toml` in the current directory
//! 5. `~/.config/mindwave/mindwave.toml`
//! 6. Built-in defaults
//!
//! `MINDWAVE_HOST` and `MINDWAVE_PORT` always override the connector
//! address, even when loading from a file.
//!
//! ## Example file
//!
//! ```toml
//! [connector]
//! host = "127.0.0.1"
//! port = 13854
//! enable_raw_output = false
//! attempts = 5
//! attempt_timeout_ms = 10000
//!
//! [connector.retry]
//! base_delay_ms = 500
//! max_delay_ms = 4000
//!
//! [session]
//! user_name = "subject-01"
//! classes = ["left", "right"]
//! n_trials = 20
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MindwaveError, MindwaveResult};
use crate::protocol::constants::{DEFAULT_HOST, DEFAULT_MAX_FRAME_BYTES, DEFAULT_PORT};
use crate::session::SessionSettings;

/// Default number of connection attempts made by callers that do not pick one.
const DEFAULT_ATTEMPTS: u32 = 3;

/// Default time one attempt may take before it is abandoned, in milliseconds.
const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 15_000;

/// Default delay before the second attempt, in milliseconds.
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Default cap for the delay between attempts, in milliseconds.
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 8_000;

/// Top-level configuration.
///
/// # Examples
///
/// ```
/// use mindwave::config::MindwaveConfig;
///
/// let config = MindwaveConfig::default();
/// assert_eq!(config.connector.addr(), "127.0.0.1:13854");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MindwaveConfig {
    /// How to reach the ThinkGear Connector.
    #[serde(default)]
    pub connector: ConnectorConfig,

    /// Default session settings, if the file defines any.
    #[serde(default)]
    pub session: Option<SessionSettings>,
}

/// Connection settings for the ThinkGear Connector socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Host the ThinkGear Connector listens on.
    #[serde(default = "default_host")]
    pub host: String,

    /// TCP port the ThinkGear Connector listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Ask for raw EEG samples (512 frames per second).
    #[serde(default = "default_true")]
    pub enable_raw_output: bool,

    /// Frames longer than this are dropped as malformed.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Suggested attempt count for [`Connector::start`](crate::Connector::start).
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Suggested per-attempt timeout for [`Connector::start`](crate::Connector::start).
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,

    /// Backoff between failed attempts.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_retry_base_delay")]
    pub base_delay_ms: u64,

    /// Maximum delay between attempts, in milliseconds.
    #[serde(default = "default_retry_max_delay")]
    pub max_delay_ms: u64,
}

// ─── Defaults ───────────────────────────────────────────────────────────

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_attempts() -> u32 {
    DEFAULT_ATTEMPTS
}

fn default_attempt_timeout_ms() -> u64 {
    DEFAULT_ATTEMPT_TIMEOUT_MS
}

fn default_retry_base_delay() -> u64 {
    DEFAULT_RETRY_BASE_DELAY_MS
}

fn default_retry_max_delay() -> u64 {
    DEFAULT_RETRY_MAX_DELAY_MS
}

// ─── Default impls ──────────────────────────────────────────────────────

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
            enable_raw_output: true,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            attempts: DEFAULT_ATTEMPTS,
            attempt_timeout_ms: DEFAULT_ATTEMPT_TIMEOUT_MS,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

// ─── ConnectorConfig impl ───────────────────────────────────────────────

impl ConnectorConfig {
    /// Config pointing at `host:port`, everything else default.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// `host:port` string used for dialing and logging.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Per-attempt timeout as a [`Duration`].
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl RetryConfig {
    /// No delay at all between attempts.
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Delay before the first retry.
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Backoff cap.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

// ─── MindwaveConfig impl ────────────────────────────────────────────────

impl MindwaveConfig {
    /// Defaults with environment variable overrides applied.
    ///
    /// Optional: `MINDWAVE_HOST`, `MINDWAVE_PORT`
    ///
    /// # Errors
    /// Returns [`MindwaveError::ConfigError`] if `MINDWAVE_PORT` is not a
    /// valid port number.
    pub fn from_env() -> MindwaveResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load config from a TOML file, with environment variable overrides.
    ///
    /// # Errors
    /// Returns [`MindwaveError::ConfigError`] if the file cannot be read or
    /// parsed, or if the session section is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> MindwaveResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MindwaveError::config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let mut config = parse_toml(&contents)?;
        if let Some(session) = &config.session {
            session.validate()?;
        }
        config.apply_env_overrides()?;

        tracing::debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Discover and load config from the standard search path:
    ///
    /// 1. Explicit path (if `Some`)
    /// 2. `MINDWAVE_CONFIG` environment variable
    /// 3. `./mindwave.toml`
    /// 4. `~/.config/mindwave/mindwave.toml`
    ///
    /// Falls back to defaults plus environment overrides if no file is found.
    ///
    /// # Errors
    /// Returns any error from [`from_file`](Self::from_file) or
    /// [`from_env`](Self::from_env).
    pub fn discover(explicit_path: Option<&Path>) -> MindwaveResult<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var("MINDWAVE_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        let local_path = PathBuf::from("mindwave.toml");
        if local_path.exists() {
            return Self::from_file(&local_path);
        }

        if let Some(user_path) = dirs_config_path() {
            if user_path.exists() {
                return Self::from_file(&user_path);
            }
        }

        Self::from_env()
    }

    fn apply_env_overrides(&mut self) -> MindwaveResult<()> {
        if let Ok(host) = std::env::var("MINDWAVE_HOST") {
            self.connector.host = host;
        }
        if let Ok(port) = std::env::var("MINDWAVE_PORT") {
            self.connector.port = port.parse().map_err(|_| {
                MindwaveError::config(format!("MINDWAVE_PORT '{port}' is not a valid port"))
            })?;
        }
        Ok(())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

#[cfg(feature = "config-toml")]
fn parse_toml(contents: &str) -> MindwaveResult<MindwaveConfig> {
    Ok(toml::from_str(contents)?)
}

#[cfg(not(feature = "config-toml"))]
fn parse_toml(_contents: &str) -> MindwaveResult<MindwaveConfig> {
    Err(MindwaveError::config(
        "TOML config files need the `config-toml` feature",
    ))
}

/// Platform-appropriate config file path.
fn dirs_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .ok()
            .map(|dir| PathBuf::from(dir).join("mindwave").join("mindwave.toml"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(|dir| {
            PathBuf::from(dir)
                .join(".config")
                .join("mindwave")
                .join("mindwave.toml")
        })
    }
}
