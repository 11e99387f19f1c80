//! # Automatic Reconnection
//!
//! [`Connector`] never reconnects on its own. [`AutoReconnect`] is an
//! optional layer that watches for [`ConnectionState::ConnectionLost`] and
//! re-runs [`Connector::start`] in rounds with exponential backoff between
//! them.
//!
//! ## Usage
//!
//! ```no_run
//! use mindwave::config::ConnectorConfig;
//! use mindwave::reconnect::{AutoReconnect, ReconnectPolicy};
//! use mindwave::Connector;
//!
//! # async fn demo() {
//! let config = ConnectorConfig::default();
//! let connector = Connector::new(config.clone());
//! let reconnect = AutoReconnect::spawn(&connector, ReconnectPolicy::from_config(&config));
//!
//! let mut events = reconnect.event_receiver();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         println!("reconnect: {event:?}");
//!     }
//! });
//!
//! connector.start(config.attempts, config.attempt_timeout()).await;
//! # }
//! ```
//!
//! ## Behavior
//!
//! On connection loss, `AutoReconnect`:
//! 1. Emits `ReconnectEvent::Lost`
//! 2. Emits `ReconnectEvent::Reconnecting { round }` and calls
//!    `start(tries_per_round, attempt_timeout)`
//! 3. On success emits `ReconnectEvent::Reconnected { round }`
//! 4. Otherwise backs off and tries the next round, emitting
//!    `ReconnectEvent::ReconnectFailed` once `max_rounds` is spent
//!
//! An explicit [`Connector::stop`] moves the connector to
//! [`ConnectionState::Disconnected`], which is not treated as a loss.
//! Subscriptions on the connector survive reconnection because the event
//! bus belongs to the connector, not to the socket.

use std::fmt;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::config::ConnectorConfig;
use crate::connector::Connector;
use crate::events::Subscription;
use crate::headset::ConnectionState;
use crate::retry::RetryPolicy;

/// Default number of reconnect rounds before giving up.
const DEFAULT_MAX_ROUNDS: u32 = 5;

/// Lifecycle notifications from [`AutoReconnect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectEvent {
    /// The connector reported a lost connection.
    Lost,

    /// A reconnect round is starting.
    Reconnecting { round: u32 },

    /// The headset streams again.
    Reconnected { round: u32 },

    /// Every round failed. Nothing more happens until the next loss.
    ReconnectFailed { rounds: u32 },
}

/// How hard [`AutoReconnect`] tries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Rounds per loss; `0` means keep trying forever.
    pub max_rounds: u32,

    /// `n_tries` passed to [`Connector::start`] each round.
    pub tries_per_round: u32,

    /// `timeout` passed to [`Connector::start`] each round.
    pub attempt_timeout: Duration,

    /// Backoff between rounds.
    pub backoff: RetryPolicy,
}

impl ReconnectPolicy {
    /// Derive a policy from the connector settings: the configured attempts
    /// and timeout per round, the configured backoff between rounds.
    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self {
            max_rounds: DEFAULT_MAX_ROUNDS,
            tries_per_round: config.attempts,
            attempt_timeout: config.attempt_timeout(),
            backoff: RetryPolicy::from_config(DEFAULT_MAX_ROUNDS, &config.retry),
        }
    }

    /// Same policy with a different round budget.
    #[must_use]
    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds;
        self.backoff.max_attempts = max_rounds;
        self
    }
}

/// Background task that restarts a [`Connector`] after connection loss.
///
/// The task holds a handle to the connector, keeping it alive until the
/// `AutoReconnect` is dropped or [`shutdown`](Self::shutdown) is called.
pub struct AutoReconnect {
    task: JoinHandle<()>,
    subscription: Subscription,
    event_tx: broadcast::Sender<ReconnectEvent>,
}

impl AutoReconnect {
    /// Start watching `connector`.
    pub fn spawn(connector: &Connector, policy: ReconnectPolicy) -> Self {
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let subscription = connector.on_status_change(move |state| {
            if state == ConnectionState::ConnectionLost {
                let _ = lost_tx.send(());
            }
        });

        let (event_tx, _) = broadcast::channel(64);
        let task = tokio::spawn(run(
            connector.clone(),
            policy,
            lost_rx,
            event_tx.clone(),
        ));

        Self {
            task,
            subscription,
            event_tx,
        }
    }

    /// Subscribe to reconnect lifecycle events.
    pub fn event_receiver(&self) -> broadcast::Receiver<ReconnectEvent> {
        self.event_tx.subscribe()
    }

    /// Stop watching. An in-flight round is abandoned.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl Drop for AutoReconnect {
    fn drop(&mut self) {
        self.subscription.detach();
        self.task.abort();
    }
}

impl fmt::Debug for AutoReconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoReconnect")
            .field("subscription", &self.subscription)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

async fn run(
    connector: Connector,
    policy: ReconnectPolicy,
    mut lost_rx: mpsc::UnboundedReceiver<()>,
    event_tx: broadcast::Sender<ReconnectEvent>,
) {
    while lost_rx.recv().await.is_some() {
        // Losses reported while we were already reconnecting are covered by
        // this round.
        while lost_rx.try_recv().is_ok() {}

        let _ = event_tx.send(ReconnectEvent::Lost);
        tracing::info!("Connection lost; reconnecting");

        let mut round = 1;
        loop {
            if connector.state() == ConnectionState::Connected {
                break;
            }
            let _ = event_tx.send(ReconnectEvent::Reconnecting { round });
            tracing::info!(round, max_rounds = policy.max_rounds, "Reconnect round");

            if connector
                .start(policy.tries_per_round, policy.attempt_timeout)
                .await
            {
                let _ = event_tx.send(ReconnectEvent::Reconnected { round });
                tracing::info!(round, "Reconnected");
                break;
            }

            if policy.max_rounds != 0 && round >= policy.max_rounds {
                let _ = event_tx.send(ReconnectEvent::ReconnectFailed { rounds: round });
                tracing::warn!(rounds = round, "Reconnect rounds exhausted");
                break;
            }

            round += 1;
            tokio::time::sleep(policy.backoff.delay_before(round)).await;
        }
    }
}
