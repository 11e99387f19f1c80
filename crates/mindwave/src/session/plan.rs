//! Trial plan and step schedule.
//!
//! Everything random about a session (trial order and motor jitter) is
//! drawn here, up front, from one seeded [`StdRng`]. The same config and
//! seed always produce the same schedule.

use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::{Rng, seq::SliceRandom};
use serde::{Deserialize, Serialize};

use super::config::{SessionConfig, TrialOrder};
use super::SessionSignal;

/// One trial: a position in the session and the class it asks for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Trial {
    /// Zero-based position in the session.
    pub index: usize,
    pub class_label: String,
}

/// One timed step of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Step {
    pub signal: SessionSignal,
    /// Index into the trial plan for steps inside a trial.
    pub trial: Option<usize>,
    /// Time until the next step starts. Zero for `SessionEnd`.
    pub duration: Duration,
}

/// Trial plan plus the full step schedule.
#[derive(Debug, Clone)]
pub(crate) struct Schedule {
    pub trials: Vec<Trial>,
    pub steps: Vec<Step>,
}

impl Schedule {
    pub fn build(config: &SessionConfig, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let trials = plan_trials(config, &mut rng);
        let steps = schedule_steps(config, &trials, &mut rng);
        Self { trials, steps }
    }
}

/// `n_trials` repetitions of every class, ordered per the config.
fn plan_trials(config: &SessionConfig, rng: &mut StdRng) -> Vec<Trial> {
    let classes = config.classes();
    let reps = config.n_trials() as usize;

    let mut labels: Vec<&str> = match config.trial_order() {
        TrialOrder::Sequential => classes
            .iter()
            .flat_map(|class| std::iter::repeat_n(class.as_str(), reps))
            .collect(),
        TrialOrder::Interleaved | TrialOrder::Shuffled => (0..reps)
            .flat_map(|_| classes.iter().map(String::as_str))
            .collect(),
    };
    if config.trial_order() == TrialOrder::Shuffled {
        labels.shuffle(rng);
    }

    labels
        .into_iter()
        .enumerate()
        .map(|(index, label)| Trial {
            index,
            class_label: label.to_string(),
        })
        .collect()
}

fn schedule_steps(config: &SessionConfig, trials: &[Trial], rng: &mut StdRng) -> Vec<Step> {
    let d = config.durations();
    let jitter_ms = u64::try_from(d.motor_jitter.as_millis()).unwrap_or(u64::MAX);

    let mut steps = Vec::with_capacity(trials.len() * 6 + 2);
    steps.push(Step {
        signal: SessionSignal::SessionStart,
        trial: None,
        duration: d.transition,
    });

    for trial in trials {
        let motor = if jitter_ms == 0 {
            d.motor
        } else {
            d.motor + Duration::from_millis(rng.random_range(0..=jitter_ms))
        };
        for (signal, duration) in [
            (SessionSignal::TrialStart, d.transition),
            (SessionSignal::Rest, d.rest),
            (SessionSignal::Ready, d.ready),
            (SessionSignal::Cue, d.cue),
            (SessionSignal::Motor, motor),
            (SessionSignal::TrialEnd, d.transition),
        ] {
            steps.push(Step {
                signal,
                trial: Some(trial.index),
                duration,
            });
        }
    }

    steps.push(Step {
        signal: SessionSignal::SessionEnd,
        trial: None,
        duration: Duration::ZERO,
    });
    steps
}
