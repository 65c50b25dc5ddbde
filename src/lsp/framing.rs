//! `Content-Length` framing for the language-server wire protocol.
//!
//! The decoder accumulates raw bytes and alternates between header mode
//! (scan for `\r\n\r\n`, parse `Content-Length: N`) and body mode (wait for
//! exactly N bytes). Chunk boundaries are arbitrary: a frame may arrive
//! byte-by-byte or many frames may land in one read.

use tracing::warn;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

enum DecodeState {
    Header,
    Body(usize),
}

pub struct FrameDecoder {
    buf: Vec<u8>,
    state: DecodeState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: DecodeState::Header,
        }
    }

    /// Feed raw bytes from the wire.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete message body, if one is buffered. Call in a loop until
    /// `None` after each `push`.
    pub fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    let end = find(&self.buf, HEADER_TERMINATOR)?;
                    let header = String::from_utf8_lossy(&self.buf[..end]).into_owned();
                    self.buf.drain(..end + HEADER_TERMINATOR.len());
                    match content_length(&header) {
                        Some(len) => self.state = DecodeState::Body(len),
                        None => {
                            // A header block without a length cannot be
                            // framed; skip it and resynchronize on the next
                            // one.
                            warn!("dropping unframeable header block: {header:?}");
                        }
                    }
                }
                DecodeState::Body(len) => {
                    if self.buf.len() < len {
                        return None;
                    }
                    let body: Vec<u8> = self.buf.drain(..len).collect();
                    self.state = DecodeState::Header;
                    return Some(body);
                }
            }
        }
    }
}

/// Frame a JSON message for writing to the server's stdin.
pub fn encode(body: &serde_json::Value) -> Vec<u8> {
    let body = serde_json::to_vec(body).expect("JSON value serializes");
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(&body);
    frame
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn content_length(header: &str) -> Option<usize> {
    header.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}
