//! Wire-level plumbing: push-frame reassembly and chunk decoding.

use serde_json::Value;
use tracing::trace;

/// Reassembles newline-delimited JSON push frames from arbitrary transport
/// chunk boundaries.
///
/// The server promises that every frame is a complete JSON object on its own
/// line, but the HTTP body stream may split or coalesce frames across chunks.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one transport chunk and extract every frame it completes, in
    /// arrival order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop(); // trailing \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                trace!("skipping empty stream line");
                continue;
            }
            frames.push(String::from_utf8_lossy(&line).into_owned());
        }
        frames
    }
}

/// Parses a raw chunk as JSON, or returns `None` if it is unparseable.
pub(crate) fn parse_json_or_none(raw: &str) -> Option<Value> {
    serde_json::from_str(raw).ok()
}
