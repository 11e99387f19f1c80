//! Session configuration: validated [`SessionConfig`] and its file form
//! [`SessionSettings`].

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MindwaveError, MindwaveResult};

/// Most trials one session may plan (classes × repetitions).
pub const MAX_TOTAL_TRIALS: usize = 10_000;

/// Longest any single phase (or the motor jitter) may last.
pub const MAX_PHASE_DURATION: Duration = Duration::from_secs(60 * 60);

/// How the trials of a session are ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialOrder {
    /// All trials of the first class, then all of the second, ...
    Sequential,
    /// One trial per class in turn: `A B A B ...`
    Interleaved,
    /// Random order from a seeded shuffle.
    #[default]
    Shuffled,
}

impl fmt::Display for TrialOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TrialOrder::Sequential => "sequential",
            TrialOrder::Interleaved => "interleaved",
            TrialOrder::Shuffled => "shuffled",
        })
    }
}

/// Length of every timed step of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseDurations {
    /// Pause after `SessionStart`, `TrialStart` and `TrialEnd`.
    pub transition: Duration,
    pub rest: Duration,
    pub ready: Duration,
    pub cue: Duration,
    /// Base length of the motor phase.
    pub motor: Duration,
    /// Upper bound of the random time added to each motor phase.
    pub motor_jitter: Duration,
}

impl Default for PhaseDurations {
    fn default() -> Self {
        Self {
            transition: Duration::from_secs(1),
            rest: Duration::from_secs(2),
            ready: Duration::from_secs(1),
            cue: Duration::from_millis(1500),
            motor: Duration::from_secs(4),
            motor_jitter: Duration::ZERO,
        }
    }
}

impl PhaseDurations {
    fn validate(&self) -> MindwaveResult<()> {
        for (name, value) in [
            ("transition", self.transition),
            ("rest", self.rest),
            ("ready", self.ready),
            ("cue", self.cue),
            ("motor", self.motor),
        ] {
            if value.is_zero() {
                return Err(MindwaveError::config(format!(
                    "{name} duration must be positive"
                )));
            }
        }
        for (name, value) in [
            ("transition", self.transition),
            ("rest", self.rest),
            ("ready", self.ready),
            ("cue", self.cue),
            ("motor", self.motor),
            ("motor_jitter", self.motor_jitter),
        ] {
            if value > MAX_PHASE_DURATION {
                return Err(MindwaveError::config(format!(
                    "{name} duration {}s exceeds the {}s limit",
                    value.as_secs(),
                    MAX_PHASE_DURATION.as_secs()
                )));
            }
        }
        Ok(())
    }
}

/// Immutable, validated session parameters.
///
/// Built with [`SessionConfig::builder`]; construction fails with
/// [`MindwaveError::ConfigError`] on invalid input.
///
/// ```
/// use mindwave::session::{SessionConfig, TrialOrder};
///
/// let config = SessionConfig::builder("subject-01")
///     .classes(["left", "right"])
///     .n_trials(10)
///     .trial_order(TrialOrder::Interleaved)
///     .build()
///     .unwrap();
/// assert_eq!(config.total_trials(), 20);
///
/// assert!(SessionConfig::builder("x").classes(["a", "a"]).build().is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    user_name: String,
    user_age: Option<u32>,
    user_gender: Option<String>,
    classes: Vec<String>,
    n_trials: u32,
    capture_blinks: bool,
    durations: PhaseDurations,
    trial_order: TrialOrder,
    seed: Option<u64>,
}

impl SessionConfig {
    /// Start building a config for `user_name`.
    ///
    /// Defaults: one class named `"default"`, one trial per class, blinks
    /// not captured, [`PhaseDurations::default`], shuffled order, random
    /// seed.
    pub fn builder(user_name: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: SessionConfig {
                user_name: user_name.into(),
                user_age: None,
                user_gender: None,
                classes: vec!["default".to_string()],
                n_trials: 1,
                capture_blinks: false,
                durations: PhaseDurations::default(),
                trial_order: TrialOrder::default(),
                seed: None,
            },
        }
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn user_age(&self) -> Option<u32> {
        self.user_age
    }

    pub fn user_gender(&self) -> Option<&str> {
        self.user_gender.as_deref()
    }

    /// Class labels, in configured order.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Trials per class.
    pub fn n_trials(&self) -> u32 {
        self.n_trials
    }

    /// Number of trials in the whole session.
    pub fn total_trials(&self) -> usize {
        self.classes.len() * self.n_trials as usize
    }

    pub fn capture_blinks(&self) -> bool {
        self.capture_blinks
    }

    pub fn durations(&self) -> &PhaseDurations {
        &self.durations
    }

    pub fn trial_order(&self) -> TrialOrder {
        self.trial_order
    }

    /// Fixed seed, if one was configured.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    fn validate(&self) -> MindwaveResult<()> {
        if self.classes.is_empty() {
            return Err(MindwaveError::config("at least one class is required"));
        }
        let mut seen = HashSet::new();
        for class in &self.classes {
            if class.trim().is_empty() {
                return Err(MindwaveError::config("class labels must not be blank"));
            }
            if !seen.insert(class.as_str()) {
                return Err(MindwaveError::config(format!(
                    "class label '{class}' is listed twice"
                )));
            }
        }
        if self.n_trials == 0 {
            return Err(MindwaveError::config("n_trials must be at least 1"));
        }
        let total = usize::try_from(self.n_trials)
            .ok()
            .and_then(|n| n.checked_mul(self.classes.len()));
        if total.is_none_or(|total| total > MAX_TOTAL_TRIALS) {
            return Err(MindwaveError::config(format!(
                "{} classes x {} trials exceeds the {MAX_TOTAL_TRIALS} trial limit",
                self.classes.len(),
                self.n_trials
            )));
        }
        self.durations.validate()
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone)]
#[must_use]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn user_age(mut self, age: u32) -> Self {
        self.config.user_age = Some(age);
        self
    }

    pub fn user_gender(mut self, gender: impl Into<String>) -> Self {
        self.config.user_gender = Some(gender.into());
        self
    }

    pub fn classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.classes = classes.into_iter().map(Into::into).collect();
        self
    }

    pub fn n_trials(mut self, n_trials: u32) -> Self {
        self.config.n_trials = n_trials;
        self
    }

    pub fn capture_blinks(mut self, capture: bool) -> Self {
        self.config.capture_blinks = capture;
        self
    }

    pub fn durations(mut self, durations: PhaseDurations) -> Self {
        self.config.durations = durations;
        self
    }

    pub fn trial_order(mut self, order: TrialOrder) -> Self {
        self.config.trial_order = order;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    /// Returns [`MindwaveError::ConfigError`] when there are no classes, a
    /// class label is blank or repeated, `n_trials` is zero or the plan
    /// exceeds [`MAX_TOTAL_TRIALS`], or a phase duration (other than
    /// `motor_jitter`) is zero or longer than [`MAX_PHASE_DURATION`].
    pub fn build(self) -> MindwaveResult<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ─── File form ──────────────────────────────────────────────────────────

/// `[session]` table of `mindwave.toml`. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub user_name: String,
    #[serde(default)]
    pub user_age: Option<u32>,
    #[serde(default)]
    pub user_gender: Option<String>,
    #[serde(default = "default_classes")]
    pub classes: Vec<String>,
    #[serde(default = "default_n_trials")]
    pub n_trials: u32,
    #[serde(default)]
    pub capture_blinks: bool,
    #[serde(default = "default_transition_ms")]
    pub transition_ms: u64,
    #[serde(default = "default_rest_ms")]
    pub rest_ms: u64,
    #[serde(default = "default_ready_ms")]
    pub ready_ms: u64,
    #[serde(default = "default_cue_ms")]
    pub cue_ms: u64,
    #[serde(default = "default_motor_ms")]
    pub motor_ms: u64,
    #[serde(default)]
    pub motor_jitter_ms: u64,
    #[serde(default)]
    pub trial_order: TrialOrder,
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_classes() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_n_trials() -> u32 {
    1
}

fn default_transition_ms() -> u64 {
    1_000
}

fn default_rest_ms() -> u64 {
    2_000
}

fn default_ready_ms() -> u64 {
    1_000
}

fn default_cue_ms() -> u64 {
    1_500
}

fn default_motor_ms() -> u64 {
    4_000
}

impl SessionSettings {
    /// Settings with the given user and every other field at its default.
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            user_age: None,
            user_gender: None,
            classes: default_classes(),
            n_trials: default_n_trials(),
            capture_blinks: false,
            transition_ms: default_transition_ms(),
            rest_ms: default_rest_ms(),
            ready_ms: default_ready_ms(),
            cue_ms: default_cue_ms(),
            motor_ms: default_motor_ms(),
            motor_jitter_ms: 0,
            trial_order: TrialOrder::default(),
            seed: None,
        }
    }

    /// Convert into a validated [`SessionConfig`].
    ///
    /// # Errors
    /// Same as [`SessionConfigBuilder::build`].
    pub fn into_config(self) -> MindwaveResult<SessionConfig> {
        let durations = PhaseDurations {
            transition: Duration::from_millis(self.transition_ms),
            rest: Duration::from_millis(self.rest_ms),
            ready: Duration::from_millis(self.ready_ms),
            cue: Duration::from_millis(self.cue_ms),
            motor: Duration::from_millis(self.motor_ms),
            motor_jitter: Duration::from_millis(self.motor_jitter_ms),
        };
        let mut builder = SessionConfig::builder(self.user_name)
            .classes(self.classes)
            .n_trials(self.n_trials)
            .capture_blinks(self.capture_blinks)
            .durations(durations)
            .trial_order(self.trial_order);
        if let Some(age) = self.user_age {
            builder = builder.user_age(age);
        }
        if let Some(gender) = self.user_gender {
            builder = builder.user_gender(gender);
        }
        if let Some(seed) = self.seed {
            builder = builder.seed(seed);
        }
        builder.build()
    }

    /// Check the settings without consuming them.
    ///
    /// # Errors
    /// Same as [`SessionConfigBuilder::build`].
    pub fn validate(&self) -> MindwaveResult<()> {
        self.clone().into_config().map(|_| ())
    }
}
