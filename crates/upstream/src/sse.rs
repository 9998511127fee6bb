//! `text/event-stream` line framing
//!
//! Network reads split lines arbitrarily, including inside multi-byte UTF-8
//! sequences, so bytes are buffered until a full line is available and only
//! then decoded. Only `data:` fields matter to the upstream protocol; event
//! names, ids and comments are skipped.

use crate::error::{Result, UpstreamError};

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    /// Framing error found after payloads that were already returned
    failed: Option<UpstreamError>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes, returning the `data:` payloads of every completed line.
    ///
    /// Payloads before a malformed line are still returned; the error is
    /// reported by the next `push` or `finish`.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>> {
        if let Some(err) = self.failed.take() {
            return Err(err);
        }
        self.buf.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            match decode_line(&line[..line.len() - 1]) {
                Ok(Some(payload)) => payloads.push(payload),
                Ok(None) => {}
                Err(e) if payloads.is_empty() => return Err(e),
                Err(e) => {
                    self.failed = Some(e);
                    self.buf.clear();
                    break;
                }
            }
        }
        Ok(payloads)
    }

    /// Flush a trailing line the upstream did not terminate.
    pub fn finish(&mut self) -> Result<Option<String>> {
        if let Some(err) = self.failed.take() {
            return Err(err);
        }
        let line = std::mem::take(&mut self.buf);
        decode_line(&line)
    }
}

fn decode_line(line: &[u8]) -> Result<Option<String>> {
    let line = std::str::from_utf8(line)
        .map_err(|e| UpstreamError::Malformed(format!("invalid UTF-8 in event stream: {e}")))?;
    let line = line.trim();
    Ok(line
        .strip_prefix("data:")
        .map(|payload| payload.trim().to_string())
        .filter(|payload| !payload.is_empty()))
}
