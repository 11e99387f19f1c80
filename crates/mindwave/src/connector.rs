//! # ThinkGear Connector Client
//!
//! [`Connector`] owns the TCP socket to the ThinkGear Connector, runs the
//! connection attempts, and publishes everything it parses on a typed
//! [`EventBus`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Connector                          │
//! │                                                          │
//! │  start() ── attempt 1..n ──► TcpStream::connect          │
//! │                │              write control payload      │
//! │                │              spawn read loop ───┐       │
//! │                └─ wait for first data frame ◄────┤       │
//! │                                                  │       │
//! │  read loop (spawned task):                       │       │
//! │    bytes ─► FrameDecoder ─► parse_frame ─┬─► Data + Blink │
//! │                                          ├─► SignalQuality│
//! │                                          ├─► DeviceStatus │
//! │                                          └─► Status       │
//! │                                                          │
//! │  EventBus<HeadsetEvent> ◄── on_data(), readings(), ...   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Connection lifecycle
//!
//! Reaching the ThinkGear Connector is not enough: the connection only
//! counts once the headset itself streams a data frame. Until then the
//! state stays [`ConnectionState::Connecting`].
//!
//! After the headset was connected, a closed socket, a read error, or a
//! `status` frame (the connector went back to scanning) moves the state to
//! [`ConnectionState::ConnectionLost`] and ends the read loop. Nothing
//! reconnects automatically; call [`Connector::start`] again or wrap the
//! connector in [`AutoReconnect`](crate::reconnect::AutoReconnect).

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::config::ConnectorConfig;
use crate::error::{MindwaveError, MindwaveResult};
use crate::events::{EventBus, Subscription};
use crate::headset::{
    ConnectionState, DeviceStatus, HeadsetEvent, HeadsetEventKind, Reading,
    normalize_signal_quality,
};
use crate::protocol::constants::READ_CHUNK_BYTES;
use crate::protocol::{ControlPayload, FrameDecoder, OutputFormat, ParsedFrame, parse_frame};
use crate::retry::{RetryPolicy, with_retry};
use crate::streams::EventStream;

/// Client for the ThinkGear Connector.
///
/// Cloning a `Connector` yields another handle to the same connection and
/// event bus. The read loop is aborted when the last handle is dropped.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use mindwave::{Connector, config::ConnectorConfig};
///
/// # async fn demo() {
/// let connector = Connector::new(ConnectorConfig::default());
/// let _quality = connector.on_signal_quality_change(|q| println!("signal {q}%"));
///
/// if connector.start(3, Duration::from_secs(15)).await {
///     println!("streaming, quality {}%", connector.signal_quality());
/// }
/// connector.stop().await;
/// # }
/// ```
#[derive(Clone)]
pub struct Connector {
    handle: Arc<Handle>,
}

/// Last handle; aborts the read loop when dropped.
struct Handle {
    shared: Arc<Shared>,
}

/// State shared between the public handle and the read loop.
struct Shared {
    config: ConnectorConfig,
    bus: EventBus<HeadsetEvent>,
    link: Mutex<Link>,
    /// Serializes `start()` calls.
    start_gate: tokio::sync::Mutex<()>,
}

struct Link {
    state: ConnectionState,
    /// Bumped for every new socket and on `stop()`. A read loop whose
    /// generation is stale must not touch state or publish.
    generation: u64,
    /// Bumped on `stop()` so in-flight `start()` calls give up.
    stop_epoch: u64,
    /// Last published normalized signal quality.
    quality: f32,
    reader: Option<JoinHandle<()>>,
}

impl Connector {
    /// Create a connector. No I/O happens until [`start`](Self::start).
    pub fn new(config: ConnectorConfig) -> Self {
        let shared = Shared {
            config,
            bus: EventBus::new(),
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                generation: 0,
                stop_epoch: 0,
                quality: 0.0,
                reader: None,
            }),
            start_gate: tokio::sync::Mutex::new(()),
        };
        Self {
            handle: Arc::new(Handle {
                shared: Arc::new(shared),
            }),
        }
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.handle.shared
    }

    /// The configuration this connector dials with.
    pub fn config(&self) -> &ConnectorConfig {
        &self.shared().config
    }

    /// Connect to the ThinkGear Connector and wait for the headset to stream.
    ///
    /// Makes up to `n_tries` attempts. Each attempt opens the socket, sends
    /// the control payload and waits for the first data frame, all within
    /// `timeout`. An attempt that reached the connector but saw no headset
    /// data publishes [`HeadsetEvent::Timeout`]. Failed attempts are spaced
    /// by the configured exponential backoff, so the worst-case wall time is
    /// `n_tries × timeout` plus the backoff delays.
    ///
    /// Returns `true` once the headset streams (immediately if it already
    /// is) and `false` when every attempt failed, `n_tries` is zero, or
    /// [`stop`](Self::stop) was called meanwhile. Failures are logged, not
    /// returned.
    pub async fn start(&self, n_tries: u32, timeout: Duration) -> bool {
        let shared = self.shared();
        let _gate = shared.start_gate.lock().await;

        let epoch = {
            let link = shared.lock_link();
            if link.state == ConnectionState::Connected {
                return true;
            }
            link.stop_epoch
        };
        if n_tries == 0 {
            tracing::warn!("start() called with zero attempts; not connecting");
            return false;
        }

        shared.set_state(None, ConnectionState::Connecting);

        let policy = RetryPolicy::from_config(n_tries, &shared.config.retry);
        let result = with_retry(&policy, |attempt| {
            let shared = Arc::clone(shared);
            async move {
                if shared.lock_link().stop_epoch != epoch {
                    return Err(MindwaveError::NotConnected);
                }
                shared.attempt(attempt, timeout).await
            }
        })
        .await;

        match result {
            Ok(()) => {
                tracing::info!(addr = %shared.config.addr(), "Headset connected");
                true
            }
            Err(e) => {
                tracing::warn!(addr = %shared.config.addr(), error = %e, "Could not connect to headset");
                if shared.lock_link().state != ConnectionState::Connected {
                    shared.set_state(None, ConnectionState::Disconnected);
                }
                false
            }
        }
    }

    /// Close the socket and go back to [`ConnectionState::Disconnected`].
    ///
    /// Also makes an in-flight [`start`](Self::start) give up after its
    /// current attempt. Calling `stop` repeatedly is harmless.
    pub async fn stop(&self) {
        let shared = self.shared();
        let reader = {
            let mut link = shared.lock_link();
            link.generation += 1;
            link.stop_epoch += 1;
            link.reader.take()
        };
        if let Some(reader) = reader {
            reader.abort();
            // Only a cancellation error is possible here.
            let _ = reader.await;
            tracing::info!("Disconnected from ThinkGear Connector");
        }
        shared.set_state(None, ConnectionState::Disconnected);
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared().lock_link().state
    }

    /// `true` while the headset is streaming.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Last normalized signal quality (0–100, 100 best). `0.0` until the
    /// first quality report.
    pub fn signal_quality(&self) -> f32 {
        self.shared().lock_link().quality
    }

    /// The event bus every headset event is published on.
    pub fn bus(&self) -> &EventBus<HeadsetEvent> {
        &self.shared().bus
    }

    // ─── Subscriptions ──────────────────────────────────────────────────

    /// Called for every parsed data frame.
    pub fn on_data<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Reading) + Send + Sync + 'static,
    {
        self.bus().subscribe(HeadsetEventKind::Data, move |event| {
            if let HeadsetEvent::Data(reading) = event {
                handler(reading);
            }
        })
    }

    /// Called with the new state on every connection state change.
    pub fn on_status_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.bus().subscribe(HeadsetEventKind::Status, move |event| {
            if let HeadsetEvent::Status(state) = event {
                handler(*state);
            }
        })
    }

    /// Called with the normalized quality whenever it changes.
    pub fn on_signal_quality_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(f32) + Send + Sync + 'static,
    {
        self.bus().subscribe(HeadsetEventKind::SignalQuality, move |event| {
            if let HeadsetEvent::SignalQuality(quality) = event {
                handler(*quality);
            }
        })
    }

    /// Called with strength and receive time for every blink.
    pub fn on_blink<F>(&self, handler: F) -> Subscription
    where
        F: Fn(u8, DateTime<Utc>) + Send + Sync + 'static,
    {
        self.bus().subscribe(HeadsetEventKind::Blink, move |event| {
            if let HeadsetEvent::Blink {
                strength,
                timestamp,
            } = event
            {
                handler(*strength, *timestamp);
            }
        })
    }

    /// Called for every `status` frame from the ThinkGear Connector.
    pub fn on_device_status<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&DeviceStatus) + Send + Sync + 'static,
    {
        self.bus().subscribe(HeadsetEventKind::DeviceStatus, move |event| {
            if let HeadsetEvent::DeviceStatus(status) = event {
                handler(status);
            }
        })
    }

    /// Called with the attempt number when an attempt times out waiting for
    /// headset data.
    pub fn on_timeout<F>(&self, handler: F) -> Subscription
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.bus().subscribe(HeadsetEventKind::Timeout, move |event| {
            if let HeadsetEvent::Timeout { attempt } = event {
                handler(*attempt);
            }
        })
    }

    /// Stream of readings. Dropping the stream unsubscribes it.
    pub fn readings(&self) -> EventStream<Reading> {
        EventStream::new(self.bus(), Some(HeadsetEventKind::Data), |event| {
            match event {
                HeadsetEvent::Data(reading) => Some(reading.clone()),
                _ => None,
            }
        })
    }

    /// Stream of connection state changes.
    pub fn status_changes(&self) -> EventStream<ConnectionState> {
        EventStream::new(self.bus(), Some(HeadsetEventKind::Status), |event| {
            match event {
                HeadsetEvent::Status(state) => Some(*state),
                _ => None,
            }
        })
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("addr", &self.shared().config.addr())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        let mut link = self.shared.lock_link();
        link.generation += 1;
        if let Some(reader) = link.reader.take() {
            reader.abort();
        }
    }
}

// ─── Shared state ───────────────────────────────────────────────────────

impl Shared {
    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_link().generation == generation
    }

    /// Move to `state` and publish the change. With `Some(generation)` the
    /// change only applies if that read loop is still the current one.
    fn set_state(&self, generation: Option<u64>, state: ConnectionState) -> bool {
        {
            let mut link = self.lock_link();
            if generation.is_some_and(|g| g != link.generation) {
                return false;
            }
            if link.state == state {
                return true;
            }
            link.state = state;
        }
        tracing::debug!(%state, "Connection state changed");
        self.bus.publish(&HeadsetEvent::Status(state));
        true
    }

    fn update_quality(&self, generation: u64, poor_signal_level: u8) {
        let quality = normalize_signal_quality(poor_signal_level);
        {
            let mut link = self.lock_link();
            if link.generation != generation {
                return;
            }
            // Normalized values are multiples of 0.5.
            if (link.quality - quality).abs() < f32::EPSILON {
                return;
            }
            link.quality = quality;
        }
        tracing::debug!(quality, poor_signal_level, "Signal quality changed");
        self.bus.publish(&HeadsetEvent::SignalQuality(quality));
    }

    /// One connection attempt, bounded by `timeout`.
    async fn attempt(self: Arc<Self>, attempt: u32, timeout: Duration) -> MindwaveResult<()> {
        let addr = self.config.addr();
        let deadline = Instant::now() + timeout;
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        tracing::info!(attempt, addr = %addr, "Connecting to ThinkGear Connector");

        let stream = match time::timeout_at(deadline, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(MindwaveError::ConnectionFailed {
                    addr,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(MindwaveError::ConnectionFailed {
                    addr,
                    reason: format!("TCP connect did not complete within {millis}ms"),
                });
            }
        };

        let payload = ControlPayload {
            enable_raw_output: self.config.enable_raw_output,
            format: OutputFormat::Json,
        }
        .to_bytes()?;
        let (reader, mut writer) = stream.into_split();
        time::timeout_at(deadline, writer.write_all(&payload))
            .await
            .map_err(|_| MindwaveError::Timeout { millis })??;

        let generation = {
            let mut link = self.lock_link();
            link.generation += 1;
            link.generation
        };
        let (first_data_tx, mut first_data_rx) = oneshot::channel();
        let reader_task = tokio::spawn(read_loop(
            Arc::clone(&self),
            reader,
            writer,
            first_data_tx,
            generation,
        ));

        let waited = time::timeout_at(deadline, &mut first_data_rx).await;

        // The read loop flips the state to Connected under the same lock, so
        // this decides the race between first data and the deadline.
        {
            let mut link = self.lock_link();
            if link.generation == generation && link.state == ConnectionState::Connected {
                link.reader = Some(reader_task);
                return Ok(());
            }
            if link.generation == generation {
                link.generation += 1;
            }
        }
        reader_task.abort();

        match waited {
            Err(_) => {
                tracing::warn!(attempt, timeout_ms = millis, "No headset data before timeout");
                self.bus.publish(&HeadsetEvent::Timeout { attempt });
                Err(MindwaveError::Timeout { millis })
            }
            Ok(_) => Err(MindwaveError::ConnectionFailed {
                addr,
                reason: "connection closed before any headset data".into(),
            }),
        }
    }

    /// Publish everything one frame carries. Returns a reason when the
    /// headset is gone and the read loop should end.
    fn handle_frame(
        &self,
        generation: u64,
        frame: ParsedFrame,
        first_data: &mut Option<oneshot::Sender<()>>,
    ) -> Option<String> {
        if let Some(level) = frame.poor_signal_level {
            self.update_quality(generation, level);
        }

        if let Some(status) = frame.status {
            if !self.is_current(generation) {
                return Some("superseded".into());
            }
            tracing::debug!(?status, "Device status");
            let was_connected = self.lock_link().state == ConnectionState::Connected;
            self.bus.publish(&HeadsetEvent::DeviceStatus(status.clone()));
            if was_connected {
                return Some(format!("headset reported {status:?}"));
            }
        }

        if let Some(reading) = frame.reading {
            if let Some(tx) = first_data.take() {
                if !self.set_state(Some(generation), ConnectionState::Connected) {
                    return Some("superseded".into());
                }
                let _ = tx.send(());
            } else if !self.is_current(generation) {
                return Some("superseded".into());
            }

            let blink = reading.blink_strength.map(|strength| HeadsetEvent::Blink {
                strength,
                timestamp: reading.timestamp,
            });
            self.bus.publish(&HeadsetEvent::Data(reading));
            if let Some(blink) = blink {
                self.bus.publish(&blink);
            }
        }

        None
    }

    fn connection_lost(&self, generation: u64, reason: &str) {
        {
            let mut link = self.lock_link();
            if link.generation != generation || link.state != ConnectionState::Connected {
                return;
            }
            link.state = ConnectionState::ConnectionLost;
            link.generation += 1;
            // This task is the reader; it is finishing on its own.
            drop(link.reader.take());
        }
        tracing::warn!(reason, "Connection to headset lost");
        self.bus
            .publish(&HeadsetEvent::Status(ConnectionState::ConnectionLost));
    }
}

/// Read, split, parse, publish. Ends on EOF, read error or headset loss.
async fn read_loop(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    // Held so the socket stays fully open while reading.
    _writer: OwnedWriteHalf,
    first_data: oneshot::Sender<()>,
    generation: u64,
) {
    let mut decoder = FrameDecoder::new(shared.config.max_frame_bytes);
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    let mut first_data = Some(first_data);

    let reason = 'read: loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break 'read "connection closed by ThinkGear Connector".to_string(),
            Ok(n) => n,
            Err(e) => break 'read format!("read error: {e}"),
        };
        decoder.extend(&chunk[..n]);

        while let Some(frame) = decoder.next_frame() {
            let parsed = frame.and_then(|bytes| parse_frame(&bytes, Utc::now()));
            match parsed {
                Ok(frame) => {
                    if let Some(reason) = shared.handle_frame(generation, frame, &mut first_data) {
                        break 'read reason;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Dropping malformed frame"),
            }
        }
    };

    tracing::debug!(generation, reason = %reason, "Read loop exiting");
    shared.connection_lost(generation, &reason);
}
