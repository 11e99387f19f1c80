//! Frame splitting for the ThinkGear Connector byte stream.
//!
//! The connector terminates each JSON frame with `\r`. Some builds (and
//! most test fixtures) use `\n` or `\r\n`; all three are accepted and empty
//! frames are skipped.

use crate::error::{MindwaveError, MindwaveResult};

/// Incremental splitter that turns socket reads into complete frames.
///
/// ```
/// use mindwave::protocol::FrameDecoder;
///
/// let mut decoder = FrameDecoder::new(1024);
/// decoder.extend(b"{\"rawEeg\": 12}\r{\"raw");
/// assert_eq!(decoder.next_frame().unwrap().unwrap(), b"{\"rawEeg\": 12}");
/// assert!(decoder.next_frame().is_none());
///
/// decoder.extend(b"Eeg\": 13}\r\n");
/// assert_eq!(decoder.next_frame().unwrap().unwrap(), b"{\"rawEeg\": 13}");
/// ```
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_bytes: usize,
    /// Set after an oversized frame was reported; bytes are dropped until
    /// the next delimiter.
    discarding: bool,
}

impl FrameDecoder {
    /// Create a decoder that rejects frames longer than `max_frame_bytes`.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_bytes: max_frame_bytes.max(1),
            discarding: false,
        }
    }

    /// Append bytes read from the socket.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame.
    ///
    /// Returns `None` when more bytes are needed, and
    /// `Some(Err(ProtocolError))` once for every frame that exceeded the
    /// size limit.
    pub fn next_frame(&mut self) -> Option<MindwaveResult<Vec<u8>>> {
        loop {
            let Some(pos) = self.buf.iter().position(|b| matches!(b, b'\r' | b'\n')) else {
                if self.buf.len() > self.max_frame_bytes {
                    let dropped = self.buf.len();
                    self.buf.clear();
                    if !self.discarding {
                        self.discarding = true;
                        return Some(Err(oversized(dropped, self.max_frame_bytes)));
                    }
                }
                return None;
            };

            let mut frame: Vec<u8> = self.buf.drain(..=pos).collect();
            frame.pop();

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if frame.is_empty() {
                continue;
            }
            if frame.len() > self.max_frame_bytes {
                return Some(Err(oversized(frame.len(), self.max_frame_bytes)));
            }
            return Some(Ok(frame));
        }
    }
}

fn oversized(len: usize, max: usize) -> MindwaveError {
    MindwaveError::ProtocolError {
        reason: format!("frame of {len} bytes exceeds the {max} byte limit"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut FrameDecoder) -> Vec<MindwaveResult<Vec<u8>>> {
        std::iter::from_fn(|| decoder.next_frame()).collect()
    }

    #[test]
    fn test_mixed_delimiters_and_blank_frames() {
        let mut decoder = FrameDecoder::new(64);
        decoder.extend(b"a\rb\nc\r\n\r\r");
        let frames: Vec<Vec<u8>> = drain(&mut decoder)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(frames, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_waits_for_delimiter() {
        let mut decoder = FrameDecoder::new(64);
        decoder.extend(b"{\"rawEeg\":");
        assert!(decoder.next_frame().is_none());
        assert_eq!(decoder.buffered(), 10);
        decoder.extend(b" 5}\r");
        assert_eq!(decoder.next_frame().unwrap().unwrap(), b"{\"rawEeg\": 5}");
    }

    #[test]
    fn test_oversized_frame_is_reported_once_and_skipped() {
        let mut decoder = FrameDecoder::new(8);
        decoder.extend(b"0123456789");
        let first = decoder.next_frame().unwrap();
        assert!(matches!(first, Err(MindwaveError::ProtocolError { .. })));

        // Remainder of the oversized frame is dropped silently.
        decoder.extend(b"abcdef\rok\r");
        assert_eq!(decoder.next_frame().unwrap().unwrap(), b"ok");
        assert!(decoder.next_frame().is_none());
    }

    #[test]
    fn test_oversized_complete_frame_is_rejected() {
        let mut decoder = FrameDecoder::new(4);
        decoder.extend(b"toolong\rfine\r");
        let results = drain(&mut decoder);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap(), b"fine");
    }
}
