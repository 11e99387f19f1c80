//! Protocol constants for the ThinkGear Connector socket.

/// Host the ThinkGear Connector listens on.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Port the ThinkGear Connector listens on.
pub const DEFAULT_PORT: u16 = 13854;

/// Frames longer than this are discarded as malformed.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024;

/// Size of each socket read.
pub const READ_CHUNK_BYTES: usize = 4096;
