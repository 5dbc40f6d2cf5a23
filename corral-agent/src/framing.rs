// ABOUTME: Marker-delimited framing of ContainerOutput records on an unstructured text stream.
// ABOUTME: Encoder writes start marker, JSON line, end marker; decoder buffers across chunk boundaries.

use crate::protocol::ContainerOutput;

pub const OUTPUT_START_MARKER: &str = "---OUTPUT-START---";
pub const OUTPUT_END_MARKER: &str = "---OUTPUT-END---";

/// A record after a start marker that could not be decoded.
/// Only that record is lost; decoding continues with the next line.
#[derive(Debug, thiserror::Error)]
#[error("malformed output record: {source}")]
pub struct FrameError {
    /// The offending payload line
    pub line: String,
    #[source]
    pub source: serde_json::Error,
}

/// Encode one record as three lines: start marker, JSON payload, end marker
pub fn encode(record: &ContainerOutput) -> Result<String, serde_json::Error> {
    let json = serde_json::to_string(record)?;
    Ok(format!("{OUTPUT_START_MARKER}\n{json}\n{OUTPUT_END_MARKER}\n"))
}

/// Incremental decoder for framed output.
///
/// Feed arbitrary chunks with [`FrameDecoder::push`]; unrelated log lines
/// before, between, and after records are ignored. A record whose start
/// marker arrives in one chunk and payload in a later one is still decoded.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: String,
    awaiting_payload: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a chunk and return every record completed by it, in stream order
    pub fn push(&mut self, chunk: &str) -> Vec<Result<ContainerOutput, FrameError>> {
        self.buffer.push_str(chunk);
        let mut records = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line: String = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }

            if let Some(record) = self.take_line(line) {
                records.push(record);
            }
        }

        records
    }

    /// Push one already-split line (no trailing newline)
    pub fn push_line(&mut self, line: &str) -> Option<Result<ContainerOutput, FrameError>> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        self.take_line(line.to_string())
    }

    /// Bytes received after the last complete line
    pub fn leftover(&self) -> &str {
        &self.buffer
    }

    /// True when a start marker was seen but its payload line has not arrived
    pub fn is_mid_record(&self) -> bool {
        self.awaiting_payload
    }

    /// Account for a line the caller dropped unread.
    /// Returns true if it was a record payload, which is then lost.
    pub fn discard_line(&mut self) -> bool {
        std::mem::take(&mut self.awaiting_payload)
    }

    fn take_line(&mut self, line: String) -> Option<Result<ContainerOutput, FrameError>> {
        if self.awaiting_payload {
            self.awaiting_payload = false;
            return Some(
                serde_json::from_str::<ContainerOutput>(line.trim())
                    .map_err(|source| FrameError { line, source }),
            );
        }

        if line.trim() == OUTPUT_START_MARKER {
            self.awaiting_payload = true;
        }
        None
    }
}
