use bytes::Bytes;
use serde::Serialize;

use crate::chat::ChatCompletionChunk;

pub const DONE_MARKER: &str = "[DONE]";

const INITIAL_LINE_CAPACITY: usize = 64 * 1024;
const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("stream line exceeds {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
}

/// Splits an upstream byte stream into lines.
///
/// Upstream deltas can carry very long single lines (tool payloads, base64),
/// so the buffer starts large and is only rejected past `max_line` bytes.
#[derive(Debug)]
pub struct LineSplitter {
    buffer: Vec<u8>,
    max_line: usize,
}

impl Default for LineSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(INITIAL_LINE_CAPACITY.min(max_line)),
            max_line,
        }
    }

    /// Feeds a chunk and returns every line it completed, blank lines included.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, LineTooLong> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.buffer.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];
            if self.buffer.len() > self.max_line {
                return Err(LineTooLong {
                    limit: self.max_line,
                });
            }
            lines.push(self.take_line());
        }
        self.buffer.extend_from_slice(rest);
        if self.buffer.len() > self.max_line {
            return Err(LineTooLong {
                limit: self.max_line,
            });
        }
        Ok(lines)
    }

    /// Returns the unterminated tail, if any, once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        Some(self.take_line())
    }

    fn take_line(&mut self) -> String {
        if self.buffer.last() == Some(&b'\r') {
            self.buffer.pop();
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        line
    }
}

/// One classified upstream stream line.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamLine {
    /// `data: [DONE]`
    Done,
    /// `data: <chunk json>`
    Chunk(Box<ChatCompletionChunk>),
    /// Comments, `event:` lines and payloads that are not chunks.
    Other,
}

pub fn parse_stream_line(line: &str) -> StreamLine {
    let Some(payload) = line.strip_prefix("data:") else {
        return StreamLine::Other;
    };
    let payload = payload.trim();
    if payload == DONE_MARKER {
        return StreamLine::Done;
    }
    match serde_json::from_str::<ChatCompletionChunk>(payload) {
        Ok(chunk) => StreamLine::Chunk(Box::new(chunk)),
        Err(_) => StreamLine::Other,
    }
}

pub fn encode_data<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    let json = serde_json::to_string(value)?;
    Ok(Bytes::from(format!("data: {json}\n\n")))
}

/// Re-frames an upstream line as one SSE event, adding `data: ` when missing.
pub fn encode_raw_line(line: &str) -> Bytes {
    if line.starts_with("data:") || line.starts_with(':') {
        Bytes::from(format!("{line}\n\n"))
    } else {
        Bytes::from(format!("data: {line}\n\n"))
    }
}

/// Writes an upstream line exactly as received, plus the frame terminator.
pub fn encode_verbatim_line(line: &str) -> Bytes {
    Bytes::from(format!("{line}\n\n"))
}

pub fn encode_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}
