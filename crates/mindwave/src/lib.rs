//! # mindwave
//!
//! A Rust client for NeuroSky MindWave headsets via the
//! [ThinkGear Connector](https://developer.neurosky.com/docs/doku.php?id=thinkgear_connector_tgc),
//! plus a timed trial [`Session`] for collecting labeled EEG data.
//!
//! The ThinkGear Connector is a local service that pairs with the headset
//! over Bluetooth and serves processed readings (eSense attention and
//! meditation, band powers, blinks, raw samples, signal quality) as JSON
//! frames on a TCP socket, `127.0.0.1:13854` by default.
//!
//! ## Quick Start
//!
//! ```no_run
//! use mindwave::{Connector, MindwaveConfig, Session, SessionConfig};
//! use mindwave::session::CsvStore;
//!
//! #[tokio::main]
//! async fn main() -> mindwave::MindwaveResult<()> {
//!     // Load config from environment or mindwave.toml
//!     let config = MindwaveConfig::discover(None)?;
//!     let connector = Connector::new(config.connector.clone());
//!
//!     let _quality = connector.on_signal_quality_change(|q| println!("signal: {q}%"));
//!     if !connector
//!         .start(config.connector.attempts, config.connector.attempt_timeout())
//!         .await
//!     {
//!         eprintln!("headset not found");
//!         return Ok(());
//!     }
//!
//!     let session_config = SessionConfig::builder("subject-01")
//!         .classes(["left", "right"])
//!         .n_trials(10)
//!         .build()?;
//!     let mut session = Session::new(&connector, session_config);
//!     let _signals = session.on_signal(|event| println!("{event}"));
//!
//!     session.start()?;
//!     session.finished().await?;
//!     session.save(&mut CsvStore::create("data.csv")?).await?;
//!
//!     connector.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Layers
//!
//! | Layer | Type | Owns | Publishes |
//! |-------|------|------|-----------|
//! | Transport | [`Connector`] | TCP socket, read loop, connection state | [`HeadsetEvent`] |
//! | Experiment | [`Session`] | trial plan, phase timer, samples | [`SessionEvent`] |
//! | Plumbing | [`EventBus`] | handler registry | whatever it carries |
//!
//! Reconnection is caller-driven; [`reconnect::AutoReconnect`] adds an
//! optional policy on top of the connector.
//!
//! ## Configuration
//!
//! See [`MindwaveConfig`] for the full configuration reference. The
//! connector address can be overridden with environment variables:
//!
//! ```bash
//! export MINDWAVE_HOST="127.0.0.1"
//! export MINDWAVE_PORT="13854"
//! ```

pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod headset;
pub mod protocol;
pub mod reconnect;
pub mod retry;
pub mod session;
pub mod streams;

// ─── Public re-exports ──────────────────────────────────────────────────

pub use config::MindwaveConfig;
pub use connector::Connector;
pub use error::{MindwaveError, MindwaveResult};
pub use events::{BusEvent, DispatchReport, EventBus, Subscription};
pub use headset::{ConnectionState, DeviceStatus, HeadsetEvent, Reading};
pub use session::{Session, SessionConfig, SessionEvent, SessionSignal, TrialPhase};
pub use streams::EventStream;
