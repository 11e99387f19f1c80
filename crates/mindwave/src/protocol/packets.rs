//! Control payload and inbound frame types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MindwaveError, MindwaveResult};
use crate::headset::{BandPowers, DeviceStatus, Reading};

/// Highest valid eSense score.
const MAX_ESENSE: u8 = 100;

/// Output format requested from the ThinkGear Connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OutputFormat {
    /// JSON text frames. The only format this crate parses.
    #[default]
    Json,
}

/// Payload written right after the socket opens to configure the stream.
#[derive(Debug, Clone, Serialize)]
pub struct ControlPayload {
    /// Ask for one `rawEeg` frame per raw sample (512 Hz).
    #[serde(rename = "enableRawOutput")]
    pub enable_raw_output: bool,

    /// Stream encoding.
    pub format: OutputFormat,
}

impl ControlPayload {
    /// JSON bytes ready to be written to the socket.
    ///
    /// # Errors
    /// Returns [`MindwaveError::Json`] if serialization fails.
    pub fn to_bytes(&self) -> MindwaveResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Deserialize)]
struct ESense {
    attention: Option<u8>,
    meditation: Option<u8>,
}

/// Every field the client understands. Unknown fields are ignored;
/// `mentalEffort` and `familiarity` fall in that bucket.
#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "eSense")]
    e_sense: Option<ESense>,
    #[serde(rename = "eegPower")]
    eeg_power: Option<BandPowers>,
    #[serde(rename = "blinkStrength")]
    blink_strength: Option<u8>,
    #[serde(rename = "rawEeg")]
    raw_eeg: Option<i32>,
    #[serde(rename = "poorSignalLevel")]
    poor_signal_level: Option<u8>,
    status: Option<String>,
}

/// The useful content of one inbound frame.
///
/// A single frame may carry several parts at once: the once-per-second
/// eSense frame also carries `eegPower` and `poorSignalLevel`, and status
/// frames usually report `poorSignalLevel: 200`.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFrame {
    /// Present when the frame had any of `eSense`, `eegPower`,
    /// `blinkStrength` or `rawEeg`.
    pub reading: Option<Reading>,
    /// Present for `status` frames.
    pub status: Option<DeviceStatus>,
    /// Raw `poorSignalLevel`, 0–200.
    pub poor_signal_level: Option<u8>,
}

impl ParsedFrame {
    /// `true` when the frame carried nothing this client uses.
    pub fn is_empty(&self) -> bool {
        self.reading.is_none() && self.status.is_none() && self.poor_signal_level.is_none()
    }
}

/// Parse one frame (without its delimiter).
///
/// # Errors
/// Returns [`MindwaveError::ProtocolError`] for invalid UTF-8, invalid
/// JSON, values outside their documented range, or a non-object frame.
pub fn parse_frame(bytes: &[u8], received_at: DateTime<Utc>) -> MindwaveResult<ParsedFrame> {
    let text = std::str::from_utf8(bytes).map_err(|e| MindwaveError::ProtocolError {
        reason: format!("frame is not valid UTF-8: {e}"),
    })?;
    let wire: WireFrame =
        serde_json::from_str(text.trim()).map_err(|e| MindwaveError::ProtocolError {
            reason: format!("invalid frame {text:?}: {e}"),
        })?;

    let (attention, meditation) = match wire.e_sense {
        Some(e_sense) => (
            check_esense("attention", e_sense.attention)?,
            check_esense("meditation", e_sense.meditation)?,
        ),
        None => (None, None),
    };

    let has_data = attention.is_some()
        || meditation.is_some()
        || wire.eeg_power.is_some()
        || wire.blink_strength.is_some()
        || wire.raw_eeg.is_some();

    let reading = has_data.then(|| Reading {
        attention,
        meditation,
        blink_strength: wire.blink_strength,
        raw_sample: wire.raw_eeg,
        band_powers: wire.eeg_power,
        timestamp: received_at,
    });

    Ok(ParsedFrame {
        reading,
        status: wire.status.as_deref().map(DeviceStatus::from_wire),
        poor_signal_level: wire.poor_signal_level,
    })
}

fn check_esense(field: &str, value: Option<u8>) -> MindwaveResult<Option<u8>> {
    match value {
        Some(v) if v > MAX_ESENSE => Err(MindwaveError::ProtocolError {
            reason: format!("{field} {v} is outside 0-{MAX_ESENSE}"),
        }),
        other => Ok(other),
    }
}
