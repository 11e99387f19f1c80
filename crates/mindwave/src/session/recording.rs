//! Session output: the [`Recording`] and its flat [`SampleRow`] form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::plan::Trial;
use super::{SessionEvent, TrialPhase};
use crate::headset::{BandPowers, Reading};

/// Where a sample was captured: which trial, which class, which phase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrialTag {
    pub trial_index: usize,
    pub class_label: String,
    pub phase: TrialPhase,
}

/// A reading as the session recorded it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedSample {
    pub reading: Reading,
    /// `None` only for blink-only readings captured between phases.
    pub tag: Option<TrialTag>,
    /// Normalized signal quality last reported before this reading.
    pub signal_quality: f32,
}

/// Everything one session run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    /// Samples in arrival order.
    pub samples: Vec<RecordedSample>,
    /// Every session event published, in order.
    pub events: Vec<SessionEvent>,
    /// The trial plan that ran (or was cut short).
    pub trials: Vec<Trial>,
    /// Seed the plan was drawn from. Reuse it to replay the same plan.
    pub seed: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// `true` when the run was ended by `stop()`.
    pub aborted: bool,
}

impl Recording {
    pub(crate) fn new(trials: Vec<Trial>, seed: u64) -> Self {
        let now = Utc::now();
        Self {
            samples: Vec::new(),
            events: Vec::new(),
            trials,
            seed,
            started_at: now,
            ended_at: now,
            aborted: false,
        }
    }

    /// Number of recorded samples.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples captured during trial `index`.
    pub fn trial_samples(&self, index: usize) -> impl Iterator<Item = &RecordedSample> {
        self.samples
            .iter()
            .filter(move |s| s.tag.as_ref().is_some_and(|t| t.trial_index == index))
    }

    /// One flat row per sample, in arrival order.
    pub fn rows(&self) -> Vec<SampleRow> {
        self.samples.iter().map(SampleRow::from).collect()
    }
}

/// Flat row handed to a [`SampleStore`](super::SampleStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRow {
    pub trial_index: Option<usize>,
    pub class_label: Option<String>,
    pub phase: Option<TrialPhase>,
    pub attention: Option<u8>,
    pub meditation: Option<u8>,
    pub blink_strength: Option<u8>,
    pub raw_sample: Option<i32>,
    pub signal_quality: f32,
    pub timestamp: DateTime<Utc>,
    pub band_powers: Option<BandPowers>,
}

impl From<&RecordedSample> for SampleRow {
    fn from(sample: &RecordedSample) -> Self {
        let reading = &sample.reading;
        Self {
            trial_index: sample.tag.as_ref().map(|t| t.trial_index),
            class_label: sample.tag.as_ref().map(|t| t.class_label.clone()),
            phase: sample.tag.as_ref().map(|t| t.phase),
            attention: reading.attention,
            meditation: reading.meditation,
            blink_strength: reading.blink_strength,
            raw_sample: reading.raw_sample,
            signal_quality: sample.signal_quality,
            timestamp: reading.timestamp,
            band_powers: reading.band_powers,
        }
    }
}
