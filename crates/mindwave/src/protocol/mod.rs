//! ThinkGear Connector wire protocol.
//!
//! The ThinkGear Connector (TGC) is a local service that talks to the
//! headset over Bluetooth and serves its output as JSON text frames on a
//! TCP socket (port 13854 by default).
//!
//! - [`constants`]: default address, wire field names, limits.
//! - [`frame`]: splitting the byte stream into frames.
//! - [`packets`]: the control payload and inbound frame parsing.

pub mod constants;
pub mod frame;
pub mod packets;

pub use frame::FrameDecoder;
pub use packets::{ControlPayload, OutputFormat, ParsedFrame, parse_frame};
