//! # Headset Readings & Events
//!
//! Typed values produced by the [`Connector`](crate::Connector) from the
//! ThinkGear Connector stream, and the [`HeadsetEvent`] enum published on
//! its [`EventBus`](crate::events::EventBus).
//!
//! ## Signal quality
//!
//! The ThinkGear Connector reports `poorSignalLevel` in the range 0–200,
//! where 0 is perfect contact and 200 means the sensor is off the head.
//! This crate exposes the inverted, normalized value:
//!
//! ```
//! use mindwave::headset::normalize_signal_quality;
//!
//! assert_eq!(normalize_signal_quality(0), 100.0);
//! assert_eq!(normalize_signal_quality(200), 0.0);
//! assert_eq!(normalize_signal_quality(26), 87.0);
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::BusEvent;

/// Worst `poorSignalLevel` value reported by the ThinkGear Connector.
pub const MAX_POOR_SIGNAL_LEVEL: u8 = 200;

/// Map a raw `poorSignalLevel` (0 best – 200 off-head) to a 0–100 quality
/// percentage (100 best). Values above 200 are clamped.
pub fn normalize_signal_quality(poor_signal_level: u8) -> f32 {
    let level = poor_signal_level.min(MAX_POOR_SIGNAL_LEVEL);
    f32::from(MAX_POOR_SIGNAL_LEVEL - level) / 2.0
}

/// EEG band powers as reported in the `eegPower` object.
///
/// Values are unitless ASIC power readings; they are only meaningful
/// relative to each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BandPowers {
    pub delta: u32,
    pub theta: u32,
    pub low_alpha: u32,
    pub high_alpha: u32,
    pub low_beta: u32,
    pub high_beta: u32,
    pub low_gamma: u32,
    pub high_gamma: u32,
}

/// One parsed data frame from the headset stream.
///
/// Every field the frame did not carry is `None`. Zero is a valid
/// reading, so missing values are never defaulted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// eSense attention score (0–100).
    pub attention: Option<u8>,
    /// eSense meditation score (0–100).
    pub meditation: Option<u8>,
    /// Blink strength (0–255).
    pub blink_strength: Option<u8>,
    /// One raw EEG sample.
    pub raw_sample: Option<i32>,
    /// Band powers, when the frame carried `eegPower`.
    pub band_powers: Option<BandPowers>,
    /// Time the frame was received by this client.
    pub timestamp: DateTime<Utc>,
}

impl Reading {
    /// A reading with no values, stamped now.
    pub fn empty() -> Self {
        Self {
            attention: None,
            meditation: None,
            blink_strength: None,
            raw_sample: None,
            band_powers: None,
            timestamp: Utc::now(),
        }
    }

    /// `true` when the only value carried is a blink strength.
    ///
    /// The ThinkGear Connector sends blinks as their own frames.
    pub fn is_blink_only(&self) -> bool {
        self.blink_strength.is_some()
            && self.attention.is_none()
            && self.meditation.is_none()
            && self.raw_sample.is_none()
            && self.band_powers.is_none()
    }

    /// `true` when no value at all is present.
    pub fn is_empty(&self) -> bool {
        self.attention.is_none()
            && self.meditation.is_none()
            && self.blink_strength.is_none()
            && self.raw_sample.is_none()
            && self.band_powers.is_none()
    }
}

/// Lifecycle of the connection to the headset, as seen by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No socket, no attempt in flight.
    Disconnected,
    /// `start()` is running connection attempts.
    Connecting,
    /// The headset is streaming data.
    Connected,
    /// The stream stopped after the headset had been connected.
    ConnectionLost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ConnectionLost => "connection lost",
        };
        f.write_str(name)
    }
}

/// Device status reported by the ThinkGear Connector in `status` frames.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceStatus {
    /// Searching for the headset over Bluetooth.
    Scanning,
    /// Not connected to a headset and not searching.
    Idle,
    /// Scanning has stopped.
    NotScanning,
    /// A status string this crate does not know.
    Unknown(String),
}

impl DeviceStatus {
    /// Parse the `status` field of a ThinkGear Connector frame.
    pub fn from_wire(status: &str) -> Self {
        match status {
            "scanning" => DeviceStatus::Scanning,
            "idle" => DeviceStatus::Idle,
            "notscanning" => DeviceStatus::NotScanning,
            other => DeviceStatus::Unknown(other.to_string()),
        }
    }
}

/// Event published by the [`Connector`](crate::Connector).
#[derive(Debug, Clone, PartialEq)]
pub enum HeadsetEvent {
    /// A data frame was parsed.
    Data(Reading),
    /// A blink was detected (strength 0–255).
    Blink {
        strength: u8,
        timestamp: DateTime<Utc>,
    },
    /// The connection state changed.
    Status(ConnectionState),
    /// The normalized signal quality changed (0–100, 100 best).
    SignalQuality(f32),
    /// The ThinkGear Connector reported a device status.
    DeviceStatus(DeviceStatus),
    /// A connection attempt reached the connector but no headset data
    /// arrived in time.
    Timeout { attempt: u32 },
}

/// Routing key for [`HeadsetEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeadsetEventKind {
    Data,
    Blink,
    Status,
    SignalQuality,
    DeviceStatus,
    Timeout,
}

impl BusEvent for HeadsetEvent {
    type Kind = HeadsetEventKind;

    fn kind(&self) -> HeadsetEventKind {
        match self {
            HeadsetEvent::Data(_) => HeadsetEventKind::Data,
            HeadsetEvent::Blink { .. } => HeadsetEventKind::Blink,
            HeadsetEvent::Status(_) => HeadsetEventKind::Status,
            HeadsetEvent::SignalQuality(_) => HeadsetEventKind::SignalQuality,
            HeadsetEvent::DeviceStatus(_) => HeadsetEventKind::DeviceStatus,
            HeadsetEvent::Timeout { .. } => HeadsetEventKind::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_signal_quality_bounds() {
        assert_eq!(normalize_signal_quality(0), 100.0);
        assert_eq!(normalize_signal_quality(200), 0.0);
        assert_eq!(normalize_signal_quality(255), 0.0);
        assert_eq!(normalize_signal_quality(51), 74.5);
    }

    #[test]
    fn test_blink_only_detection() {
        let mut reading = Reading::empty();
        assert!(reading.is_empty());
        assert!(!reading.is_blink_only());

        reading.blink_strength = Some(80);
        assert!(reading.is_blink_only());

        reading.attention = Some(0);
        assert!(!reading.is_blink_only());
        assert!(!reading.is_empty());
    }

    #[test]
    fn test_device_status_from_wire() {
        assert_eq!(DeviceStatus::from_wire("scanning"), DeviceStatus::Scanning);
        assert_eq!(DeviceStatus::from_wire("idle"), DeviceStatus::Idle);
        assert_eq!(
            DeviceStatus::from_wire("notscanning"),
            DeviceStatus::NotScanning
        );
        assert_eq!(
            DeviceStatus::from_wire("pairing"),
            DeviceStatus::Unknown("pairing".into())
        );
    }

    #[test]
    fn test_event_kinds() {
        assert_eq!(
            HeadsetEvent::Data(Reading::empty()).kind(),
            HeadsetEventKind::Data
        );
        assert_eq!(
            HeadsetEvent::Status(ConnectionState::Connected).kind(),
            HeadsetEventKind::Status
        );
        assert_eq!(
            HeadsetEvent::SignalQuality(50.0).kind(),
            HeadsetEventKind::SignalQuality
        );
        assert_eq!(
            HeadsetEvent::Timeout { attempt: 1 }.kind(),
            HeadsetEventKind::Timeout
        );
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::ConnectionLost.to_string(), "connection lost");
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }
}
