//! # Sessions
//!
//! A [`Session`] runs a timed trial protocol against a live
//! [`Connector`] and records every reading it sees, tagged with the trial
//! and phase it arrived in.
//!
//! ```text
//! SessionStart ─► TrialStart ─► Rest ─► Ready ─► Cue ─► Motor ─► TrialEnd ─┐
//!                     ▲                                                     │
//!                     └──────────────── more trials ◄───────────────────────┤
//!                                                                           ▼
//!                                                                      SessionEnd
//! ```
//!
//! ## Concurrency
//!
//! The session subscribes to the connector at construction. Its handlers
//! only push into a queue, and only while the session is active. A single
//! actor task owns the phase, the timer and the sample buffer; it selects
//! over (in priority order) a stop request, the queue, and the next
//! deadline. A late timer can therefore never fire after `stop()`, and
//! readings queued before the stop are still recorded.
//!
//! ## Example
//!
//! ```no_run
//! use std::time::Duration;
//! use mindwave::{Connector, Session, SessionConfig};
//! use mindwave::config::ConnectorConfig;
//! use mindwave::session::SessionDir;
//!
//! # async fn demo() -> mindwave::MindwaveResult<()> {
//! let connector = Connector::new(ConnectorConfig::default());
//! connector.start(3, Duration::from_secs(15)).await;
//!
//! let config = SessionConfig::builder("subject-01")
//!     .classes(["left", "right"])
//!     .n_trials(5)
//!     .build()?;
//! let mut session = Session::new(&connector, config);
//! let _log = session.on_signal(|event| println!("{event}"));
//!
//! session.start()?;
//! session.finished().await?;
//! let mut store = SessionDir::create_for_user("sessions", "subject-01")?;
//! let rows = session.save(&mut store).await?;
//! println!("saved {rows} samples");
//! # Ok(())
//! # }
//! ```

mod config;
mod plan;
mod recording;
mod store;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

pub use config::{
    MAX_PHASE_DURATION, MAX_TOTAL_TRIALS, PhaseDurations, SessionConfig, SessionConfigBuilder,
    SessionSettings, TrialOrder,
};
pub use plan::Trial;
pub use recording::{RecordedSample, Recording, SampleRow, TrialTag};
pub use store::{
    CSV_HEADER, CsvStore, EVENTS_CSV_HEADER, MemoryStore, SampleStore, SessionDir, SessionInfo,
};

use crate::connector::Connector;
use crate::error::{MindwaveError, MindwaveResult};
use crate::events::{BusEvent, EventBus, Subscription};
use crate::headset::Reading;
use crate::streams::EventStream;
use plan::{Schedule, Step};

// ─── Signals & events ───────────────────────────────────────────────────

/// Step of the session protocol. Also the routing kind of [`SessionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionSignal {
    SessionStart,
    TrialStart,
    Rest,
    Ready,
    Cue,
    Motor,
    TrialEnd,
    SessionEnd,
}

impl SessionSignal {
    /// The recording phase this signal opens, if any.
    pub fn phase(self) -> Option<TrialPhase> {
        match self {
            SessionSignal::Rest => Some(TrialPhase::Rest),
            SessionSignal::Ready => Some(TrialPhase::Ready),
            SessionSignal::Cue => Some(TrialPhase::Cue),
            SessionSignal::Motor => Some(TrialPhase::Motor),
            SessionSignal::SessionStart
            | SessionSignal::TrialStart
            | SessionSignal::TrialEnd
            | SessionSignal::SessionEnd => None,
        }
    }
}

impl fmt::Display for SessionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionSignal::SessionStart => "session_start",
            SessionSignal::TrialStart => "trial_start",
            SessionSignal::Rest => "rest",
            SessionSignal::Ready => "ready",
            SessionSignal::Cue => "cue",
            SessionSignal::Motor => "motor",
            SessionSignal::TrialEnd => "trial_end",
            SessionSignal::SessionEnd => "session_end",
        };
        f.write_str(name)
    }
}

/// Phase of a trial during which samples are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrialPhase {
    Rest,
    Ready,
    Cue,
    Motor,
}

impl fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrialPhase::Rest => "rest",
            TrialPhase::Ready => "ready",
            TrialPhase::Cue => "cue",
            TrialPhase::Motor => "motor",
        };
        f.write_str(name)
    }
}

/// Published on the session bus at every step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub signal: SessionSignal,
    /// The trial this step belongs to, from `TrialStart` to `TrialEnd`.
    pub trial: Option<Trial>,
    /// Set on the `SessionEnd` that follows `stop()`.
    pub aborted: bool,
    pub timestamp: DateTime<Utc>,
}

impl BusEvent for SessionEvent {
    type Kind = SessionSignal;

    fn kind(&self) -> SessionSignal {
        self.signal
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.signal)?;
        if let Some(trial) = &self.trial {
            write!(f, " trial={} class={}", trial.index, trial.class_label)?;
        }
        if self.aborted {
            f.write_str(" (aborted)")?;
        }
        Ok(())
    }
}

// ─── Session ────────────────────────────────────────────────────────────

/// Input forwarded from connector handlers to the actor.
#[derive(Debug)]
enum Input {
    Reading(Reading),
    Quality(f32),
}

enum RunState {
    Idle,
    Running(JoinHandle<Recording>),
    Finished(Recording),
}

/// Cloneable handle that stops a running session.
///
/// Non-blocking, so it is safe to use from inside event handlers.
#[derive(Clone, Debug)]
pub struct StopHandle {
    active: Arc<AtomicBool>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Ask the actor to end the session. No-op when the session is not
    /// active.
    pub fn stop(&self) {
        if self.active.load(Ordering::SeqCst) {
            self.stop_tx.send_replace(true);
        }
    }
}

/// Timed trial session over a [`Connector`]'s reading stream.
///
/// A session runs once. Create a new one for the next run.
pub struct Session {
    config: Arc<SessionConfig>,
    bus: EventBus<SessionEvent>,
    seed: u64,
    trials: Vec<Trial>,
    steps: Option<Vec<Step>>,
    stop: StopHandle,
    inbox: Option<mpsc::UnboundedReceiver<Input>>,
    connector_subscriptions: Vec<Subscription>,
    run: RunState,
}

impl Session {
    /// Prepare a session on `connector`. Subscribes to readings and signal
    /// quality right away; nothing is recorded until [`start`](Self::start).
    ///
    /// When the config has no seed, one is drawn here and logged.
    pub fn new(connector: &Connector, config: SessionConfig) -> Self {
        let seed = config.seed().unwrap_or_else(|| {
            let seed = rand::random::<u64>();
            tracing::info!(seed, "Drew random session seed");
            seed
        });
        let Schedule { trials, steps } = Schedule::build(&config, seed);

        let active = Arc::new(AtomicBool::new(false));
        let (stop_tx, _) = watch::channel(false);
        let (inbox_tx, inbox) = mpsc::unbounded_channel();

        let data_tx = inbox_tx.clone();
        let data_active = Arc::clone(&active);
        let data = connector.on_data(move |reading| {
            if data_active.load(Ordering::SeqCst) {
                let _ = data_tx.send(Input::Reading(reading.clone()));
            }
        });
        let quality_active = Arc::clone(&active);
        let quality = connector.on_signal_quality_change(move |q| {
            if quality_active.load(Ordering::SeqCst) {
                let _ = inbox_tx.send(Input::Quality(q));
            }
        });

        Self {
            config: Arc::new(config),
            bus: EventBus::new(),
            seed,
            trials,
            steps: Some(steps),
            stop: StopHandle {
                active,
                stop_tx: Arc::new(stop_tx),
            },
            inbox: Some(inbox),
            connector_subscriptions: vec![data, quality],
            run: RunState::Idle,
        }
    }

    /// The validated configuration this session runs with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Seed of the trial plan and motor jitter.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// The trial plan, in run order.
    pub fn trials(&self) -> &[Trial] {
        &self.trials
    }

    /// Begin the run on a background task.
    ///
    /// # Errors
    /// [`MindwaveError::SessionAlreadyActive`] while running and
    /// [`MindwaveError::SessionFinished`] after a completed run.
    pub fn start(&mut self) -> MindwaveResult<()> {
        match &self.run {
            RunState::Idle => {}
            RunState::Running(_) if self.is_active() => {
                return Err(MindwaveError::SessionAlreadyActive);
            }
            RunState::Running(_) | RunState::Finished(_) => {
                return Err(MindwaveError::SessionFinished);
            }
        }
        let (Some(steps), Some(inbox)) = (self.steps.take(), self.inbox.take()) else {
            return Err(MindwaveError::SessionFinished);
        };

        // Only sends made after this point count as stop requests.
        let stop_rx = self.stop.stop_tx.subscribe();
        self.stop.active.store(true, Ordering::SeqCst);

        tracing::info!(
            user = self.config.user_name(),
            trials = self.trials.len(),
            seed = self.seed,
            "Session started"
        );

        let actor = Actor {
            config: Arc::clone(&self.config),
            bus: self.bus.clone(),
            active: Arc::clone(&self.stop.active),
            recording: Recording::new(self.trials.clone(), self.seed),
            trials: self.trials.clone(),
            tag: None,
            current_trial: None,
            quality: 0.0,
        };
        self.run = RunState::Running(tokio::spawn(actor.run(steps, inbox, stop_rx)));
        Ok(())
    }

    /// End the run early. The actor publishes `SessionEnd` with
    /// `aborted: true` and skips the pending `TrialEnd`. No-op when not
    /// active; never blocks.
    pub fn stop(&self) {
        self.stop.stop();
    }

    /// Handle for stopping the session from elsewhere, e.g. a signal
    /// handler.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// `true` from a successful `start()` until `SessionEnd` is published.
    pub fn is_active(&self) -> bool {
        self.stop.active.load(Ordering::SeqCst)
    }

    /// `true` once a run has ended, whether or not it was collected yet.
    pub fn is_finished(&self) -> bool {
        match &self.run {
            RunState::Idle => false,
            RunState::Running(task) => task.is_finished(),
            RunState::Finished(_) => true,
        }
    }

    /// Wait for the run to end and return what it recorded.
    ///
    /// # Errors
    /// [`MindwaveError::SessionNotRun`] if the session was never started.
    pub async fn finished(&mut self) -> MindwaveResult<&Recording> {
        if let RunState::Running(task) = &mut self.run {
            let recording = match task.await {
                Ok(recording) => recording,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => return Err(MindwaveError::SessionNotRun),
            };
            self.run = RunState::Finished(recording);
        }
        match &self.run {
            RunState::Finished(recording) => Ok(recording),
            RunState::Idle | RunState::Running(_) => Err(MindwaveError::SessionNotRun),
        }
    }

    /// The recording, once the run has been collected with
    /// [`finished`](Self::finished) or [`save`](Self::save).
    pub fn recording(&self) -> Option<&Recording> {
        match &self.run {
            RunState::Finished(recording) => Some(recording),
            RunState::Idle | RunState::Running(_) => None,
        }
    }

    /// Hand the recorded samples, the event log and the [`SessionInfo`]
    /// to `store`.
    ///
    /// Returns the number of rows persisted, one per sample.
    ///
    /// # Errors
    /// [`MindwaveError::SessionStillActive`] while running,
    /// [`MindwaveError::SessionNotRun`] before any run,
    /// [`MindwaveError::NothingToSave`] when no sample was recorded, or the
    /// store's own error.
    pub async fn save<S>(&mut self, store: &mut S) -> MindwaveResult<usize>
    where
        S: SampleStore + ?Sized,
    {
        if self.is_active() {
            return Err(MindwaveError::SessionStillActive);
        }
        self.finished().await?;
        let Some(recording) = self.recording() else {
            return Err(MindwaveError::SessionNotRun);
        };
        if recording.is_empty() {
            return Err(MindwaveError::NothingToSave);
        }

        let written = store.append(&recording.rows())?;
        store.append_events(&recording.events)?;
        store.write_info(&SessionInfo::new(&self.config, recording))?;
        tracing::info!(rows = written, events = recording.events.len(), "Session saved");
        Ok(written)
    }

    /// Called for every session event.
    pub fn on_signal<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe_all(handler)
    }

    /// Stream of session events. Dropping the stream unsubscribes it.
    pub fn signals(&self) -> EventStream<SessionEvent> {
        EventStream::new(&self.bus, None, |event: &SessionEvent| Some(event.clone()))
    }

    /// The session event bus, for per-signal subscriptions.
    pub fn bus(&self) -> &EventBus<SessionEvent> {
        &self.bus
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for subscription in &self.connector_subscriptions {
            subscription.detach();
        }
        if let RunState::Running(task) = &self.run {
            task.abort();
        }
        self.stop.active.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.config.user_name())
            .field("seed", &self.seed)
            .field("active", &self.is_active())
            .field("finished", &self.is_finished())
            .finish_non_exhaustive()
    }
}

// ─── Actor ──────────────────────────────────────────────────────────────

struct Actor {
    config: Arc<SessionConfig>,
    bus: EventBus<SessionEvent>,
    active: Arc<AtomicBool>,
    trials: Vec<Trial>,
    recording: Recording,
    tag: Option<TrialTag>,
    current_trial: Option<usize>,
    quality: f32,
}

impl Actor {
    async fn run(
        mut self,
        steps: Vec<Step>,
        mut inbox: mpsc::UnboundedReceiver<Input>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> Recording {
        self.recording.started_at = Utc::now();
        let mut steps = steps.into_iter();
        let mut deadline = Instant::now();

        loop {
            tokio::select! {
                biased;

                Ok(()) = stop_rx.changed() => {
                    tracing::info!("Session stopped early");
                    // Inputs queued before the stop still belong to the
                    // current phase.
                    while let Ok(input) = inbox.try_recv() {
                        self.observe(input);
                    }
                    self.finish(true);
                    break;
                }
                Some(input) = inbox.recv() => self.observe(input),
                () = sleep_until(deadline) => {
                    let Some(step) = steps.next() else {
                        self.finish(false);
                        break;
                    };
                    if step.signal == SessionSignal::SessionEnd {
                        self.finish(false);
                        break;
                    }
                    self.enter(&step);
                    deadline += step.duration;
                }
            }
        }

        self.recording
    }

    fn enter(&mut self, step: &Step) {
        self.current_trial = step.trial;
        self.tag = match (step.signal.phase(), step.trial) {
            (Some(phase), Some(index)) => Some(TrialTag {
                trial_index: index,
                class_label: self.trials[index].class_label.clone(),
                phase,
            }),
            _ => None,
        };
        self.publish(step.signal, false);
    }

    fn finish(&mut self, aborted: bool) {
        self.tag = None;
        self.current_trial = None;
        self.recording.aborted = aborted;
        self.recording.ended_at = Utc::now();
        self.publish(SessionSignal::SessionEnd, aborted);
        self.active.store(false, Ordering::SeqCst);
        tracing::info!(
            samples = self.recording.len(),
            aborted,
            "Session ended"
        );
    }

    fn publish(&mut self, signal: SessionSignal, aborted: bool) {
        let event = SessionEvent {
            signal,
            trial: self.current_trial.map(|index| self.trials[index].clone()),
            aborted,
            timestamp: Utc::now(),
        };
        match &event.trial {
            Some(trial) => tracing::info!(
                signal = %signal,
                trial = trial.index,
                class = %trial.class_label,
                "Session signal"
            ),
            None => tracing::info!(signal = %signal, aborted, "Session signal"),
        }
        self.recording.events.push(event.clone());
        self.bus.publish(&event);
    }

    fn observe(&mut self, input: Input) {
        let reading = match input {
            Input::Quality(quality) => {
                self.quality = quality;
                return;
            }
            Input::Reading(reading) => reading,
        };

        let blink_only = reading.is_blink_only();
        if blink_only && !self.config.capture_blinks() {
            return;
        }
        if self.tag.is_none() && !blink_only {
            return;
        }
        self.recording.samples.push(RecordedSample {
            reading,
            tag: self.tag.clone(),
            signal_quality: self.quality,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectorConfig;
    use crate::headset::HeadsetEventKind;

    fn connector() -> Connector {
        Connector::new(ConnectorConfig::new("127.0.0.1", 1))
    }

    #[test]
    fn test_signal_phases() {
        assert_eq!(SessionSignal::Rest.phase(), Some(TrialPhase::Rest));
        assert_eq!(SessionSignal::Motor.phase(), Some(TrialPhase::Motor));
        assert_eq!(SessionSignal::TrialEnd.phase(), None);
        assert!(TrialPhase::Rest < TrialPhase::Ready);
        assert!(TrialPhase::Cue < TrialPhase::Motor);
    }

    #[test]
    fn test_event_display() {
        let event = SessionEvent {
            signal: SessionSignal::Cue,
            trial: Some(Trial {
                index: 2,
                class_label: "left".into(),
            }),
            aborted: false,
            timestamp: Utc::now(),
        };
        assert_eq!(event.to_string(), "cue trial=2 class=left");
    }

    #[tokio::test]
    async fn test_new_subscribes_and_drop_detaches() {
        let connector = connector();
        let session = Session::new(
            &connector,
            SessionConfig::builder("u").seed(5).build().unwrap(),
        );
        assert_eq!(connector.bus().handler_count(HeadsetEventKind::Data), 1);
        assert_eq!(
            connector.bus().handler_count(HeadsetEventKind::SignalQuality),
            1
        );
        assert_eq!(session.seed(), 5);
        assert!(!session.is_active());

        drop(session);
        assert!(connector.bus().is_empty());
    }

    #[tokio::test]
    async fn test_save_before_start_is_not_run() {
        let connector = connector();
        let mut session = Session::new(&connector, SessionConfig::builder("u").build().unwrap());
        let err = session.save(&mut MemoryStore::new()).await.unwrap_err();
        assert!(matches!(err, MindwaveError::SessionNotRun));
        // stop() when idle is a no-op.
        session.stop();
        assert!(!session.is_active());
    }
}
