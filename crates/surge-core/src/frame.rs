//! Incremental decoder for newline-delimited JSON and SSE `data: ` frames.

use serde_json::Value;

/// Accumulates raw byte chunks and yields complete JSON records.
///
/// Chunks arrive in order; the trailing partial line is held in the buffer
/// until the newline that completes it shows up in a later chunk. The
/// decoded sequence is invariant under re-chunking of the same bytes.
/// Tied to one stream instance; not restartable.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one chunk and return every record completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buf.extend_from_slice(chunk);
        let mut records = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(value) = decode_line(&line[..line.len() - 1]) {
                records.push(value);
            }
        }
        records
    }

    /// Flush a trailing line that never got its newline. Call once, at
    /// end of stream.
    pub fn finish(&mut self) -> Vec<Value> {
        let line = std::mem::take(&mut self.buf);
        decode_line(&line).into_iter().collect()
    }
}

fn decode_line(raw: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(raw);
    let mut line = text.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(rest) = line.strip_prefix("data: ") {
        line = rest.trim();
    }
    // End-of-stream sentinel, not a parse target.
    if line == "[DONE]" {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(value) => Some(value),
        Err(e) => {
            // A malformed line must not fail an otherwise-valid run.
            tracing::warn!(target: "frame", "dropping malformed frame: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_sentinel_yields_nothing() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"data: [DONE]\n").is_empty());
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn prefix_is_stripped_before_parsing() {
        let mut decoder = FrameDecoder::new();
        let records = decoder.push(b"data: {\"type\":\"status\",\"message\":\"hi\"}\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["message"], "hi");
    }

    #[test]
    fn malformed_line_is_dropped_not_fatal() {
        let mut decoder = FrameDecoder::new();
        let records = decoder.push(b"{not json}\n{\"ok\":1}\n");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["ok"], 1);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(b"{\"done\":true}").is_empty());
        let records = decoder.finish();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["done"], true);
    }
}
