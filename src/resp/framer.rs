//! Byte-level line/raw framer (C1, §4.1).
//!
//! The codec (`resp::codec`) owns one [`Framer`] per connection and feeds it
//! whatever bytes arrive off the socket. The framer itself never touches
//! RESP semantics: it only knows how to find `\r\n`-terminated lines, or how
//! to carve out a fixed number of trailing bytes once the codec has told it
//! how long the next bulk payload is.

use bytes::{Buf, BytesMut};

use crate::error::RedisError;
use crate::resp::value::invalid_response;

/// Maximum number of bytes the framer will buffer while searching for a line
/// terminator before declaring the connection unrecoverable (§4.1). 64 KiB
/// comfortably exceeds any legitimate RESP status/error/length line.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// `scanned` is how many leading bytes of the buffer have already been
    /// checked for `\r\n` and found clean; the next search starts there
    /// instead of byte 0.
    Line { scanned: usize },
    /// Counted-byte mode; `remaining` bytes (already includes the trailing
    /// `\r\n`) must be forwarded before returning to `Line`.
    Raw { remaining: usize },
}

/// One complete frame produced by the framer.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A line with the trailing `\r\n` stripped.
    Line(Vec<u8>),
    /// Exactly the number of bytes requested via [`Framer::set_line_mode`]
    /// (the caller is responsible for stripping the trailing `\r\n` back off
    /// when interpreting this as bulk payload).
    Raw(Vec<u8>),
}

pub struct Framer {
    mode: Mode,
}

impl Default for Framer {
    fn default() -> Self {
        Framer { mode: Mode::Line { scanned: 0 } }
    }
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switches into raw (counted-byte) mode for `extra_bytes` bytes. The
    /// caller passes `bulk_len + 2` per §4.1 so the trailing `\r\n` is
    /// consumed along with the payload.
    pub fn set_line_mode(&mut self, extra_bytes: usize) {
        self.mode = Mode::Raw { remaining: extra_bytes };
    }

    pub fn clear_line_buffer(&mut self) {
        self.mode = Mode::Line { scanned: 0 };
    }

    /// Attempts to pull one frame out of `buf`. Returns `Ok(None)` when more
    /// bytes are needed. Re-entrant: repeated calls against the same buffer
    /// (as more bytes arrive) resume exactly where the previous call left
    /// off, without re-scanning already-rejected prefixes.
    pub fn next_frame(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, RedisError> {
        match self.mode {
            Mode::Line { scanned } => self.next_line(buf, scanned),
            Mode::Raw { remaining } => self.next_raw(buf, remaining),
        }
    }

    fn next_line(&mut self, buf: &mut BytesMut, scanned: usize) -> Result<Option<Frame>, RedisError> {
        match find_crlf(buf, scanned) {
            Some(pos) => {
                let line = buf.split_to(pos).to_vec();
                buf.advance(2); // consume the \r\n
                self.mode = Mode::Line { scanned: 0 };
                Ok(Some(Frame::Line(line)))
            }
            None => {
                if buf.len() > MAX_LINE_LENGTH {
                    return Err(invalid_response(format!(
                        "line exceeded {MAX_LINE_LENGTH} bytes without a terminator"
                    )));
                }
                // Nothing up to `buf.len() - 1` could start a `\r\n` (the
                // last byte might still be the `\r` half once more bytes
                // arrive), so the next call can safely resume there.
                self.mode = Mode::Line { scanned: buf.len().saturating_sub(1) };
                Ok(None)
            }
        }
    }

    fn next_raw(&mut self, buf: &mut BytesMut, remaining: usize) -> Result<Option<Frame>, RedisError> {
        if buf.len() < remaining {
            return Ok(None);
        }
        let chunk = buf.split_to(remaining).to_vec();
        self.mode = Mode::Line { scanned: 0 };
        Ok(Some(Frame::Raw(chunk)))
    }
}

fn find_crlf(buf: &BytesMut, scanned: usize) -> Option<usize> {
    let start = scanned.min(buf.len());
    buf[start..].windows(2).position(|w| w == b"\r\n").map(|pos| start + pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_mode_emits_on_crlf() {
        let mut f = Framer::new();
        let mut buf = BytesMut::from(&b"+OK\r\n"[..]);
        let frame = f.next_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Line(b"+OK".to_vec()));
        assert!(buf.is_empty());
    }

    #[test]
    fn line_mode_waits_for_more_bytes() {
        let mut f = Framer::new();
        let mut buf = BytesMut::from(&b"+OK"[..]);
        assert!(f.next_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\r\n");
        let frame = f.next_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Line(b"+OK".to_vec()));
    }

    #[test]
    fn raw_mode_waits_for_full_count_across_chunks() {
        let mut f = Framer::new();
        f.set_line_mode(7); // "hello" + \r\n
        let mut buf = BytesMut::from(&b"hel"[..]);
        assert!(f.next_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"lo\r\n");
        let frame = f.next_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Raw(b"hello\r\n".to_vec()));
    }

    #[test]
    fn raw_mode_reverts_to_line_mode_and_reinjects_residual() {
        let mut f = Framer::new();
        f.set_line_mode(2); // ask for only "ok", leaving "\r\n+PONG\r\n" behind
        let mut buf = BytesMut::from(&b"ok\r\n+PONG\r\n"[..]);
        let frame = f.next_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Raw(b"ok".to_vec()));
        // the leftover CRLF is now seen as an (empty) line in line mode
        let frame = f.next_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Line(Vec::new()));
        let frame = f.next_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Line(b"+PONG".to_vec()));
    }

    #[test]
    fn line_mode_does_not_rescan_bytes_already_found_clean() {
        let mut f = Framer::new();
        let mut buf = BytesMut::from(&b"hello"[..]);
        assert!(f.next_frame(&mut buf).unwrap().is_none());
        match f.mode {
            Mode::Line { scanned } => assert_eq!(scanned, buf.len() - 1),
            Mode::Raw { .. } => panic!("expected line mode"),
        }
        buf.extend_from_slice(b" world\r\n");
        let frame = f.next_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::Line(b"hello world".to_vec()));
    }

    #[test]
    fn oversized_line_without_terminator_is_fatal() {
        let mut f = Framer::new();
        let mut buf = BytesMut::from(vec![b'a'; MAX_LINE_LENGTH + 1].as_slice());
        let err = f.next_frame(&mut buf).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidResponse);
    }
}
