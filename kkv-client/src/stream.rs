//! Incremental newline-delimited JSON decoding.
//!
//! Response bodies arrive in chunks whose boundaries have nothing to do with
//! record boundaries. [`StreamingReader`] buffers bytes until a `\n` shows up,
//! then decodes everything before it as one record. Splitting on raw bytes
//! keeps multi-byte UTF-8 sequences that straddle chunks intact.

use bytes::{Buf, BytesMut};
use futures_util::{Stream, StreamExt};
use kkv_core::config::DEFAULT_MAX_RECORD_BYTES;
use kkv_core::{KkvError, KkvResult, Value};
use tracing::{debug, warn};

/// Outcome of consuming a value stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Records decoded and handed to the callback.
    pub records: u64,
    /// Lines skipped because they were not valid JSON.
    pub malformed: u64,
}

#[derive(Debug)]
pub struct StreamingReader {
    buffer: BytesMut,
    /// Bytes at the front of `buffer` already known to contain no newline.
    scanned: usize,
    lines: u64,
    summary: StreamSummary,
    max_line_bytes: usize,
    /// Dropping the rest of an oversized line until its newline shows up.
    discarding: bool,
}

impl Default for StreamingReader {
    fn default() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_RECORD_BYTES)
    }
}

impl StreamingReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reader that rejects lines longer than `max_line_bytes` as malformed.
    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            scanned: 0,
            lines: 0,
            summary: StreamSummary::default(),
            max_line_bytes: max_line_bytes.max(1),
            discarding: false,
        }
    }

    pub fn summary(&self) -> StreamSummary {
        self.summary
    }

    /// Bytes received but not yet terminated by a newline.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and emit every record it completes.
    pub fn push<F>(&mut self, chunk: &[u8], on_record: &mut F)
    where
        F: FnMut(Value),
    {
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer[self.scanned..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|rel| self.scanned + rel)
        {
            let mut line = self.buffer.split_to(pos + 1);
            self.scanned = 0;
            if self.discarding {
                self.discarding = false;
                continue;
            }
            line.truncate(pos);
            if line.len() > self.max_line_bytes {
                self.reject_oversized(line.len());
                continue;
            }
            self.decode_line(&line, on_record);
        }

        // No newline left in the buffer: never let a partial line outgrow the limit.
        if self.discarding {
            self.buffer.clear();
        } else if self.buffer.len() > self.max_line_bytes {
            self.reject_oversized(self.buffer.len());
            self.buffer.clear();
            self.discarding = true;
        }
        self.scanned = self.buffer.len();
    }

    /// Flush whatever is left after the source ended.
    ///
    /// A non-blank unterminated tail is decoded as a final record.
    pub fn finish<F>(mut self, on_record: &mut F) -> StreamSummary
    where
        F: FnMut(Value),
    {
        if !self.discarding && !self.buffer.is_empty() {
            let tail = self.buffer.split();
            debug!(bytes = tail.len(), "Decoding unterminated stream tail");
            self.decode_line(&tail, on_record);
        }
        self.summary
    }

    fn decode_line<F>(&mut self, raw: &[u8], on_record: &mut F)
    where
        F: FnMut(Value),
    {
        self.lines += 1;
        let line = trim_ascii(raw);
        if line.is_empty() {
            return;
        }

        match serde_json::from_slice::<Value>(line) {
            Ok(record) => {
                self.summary.records += 1;
                on_record(record);
            }
            Err(e) => {
                self.summary.malformed += 1;
                let err = KkvError::MalformedRecord {
                    line: self.lines,
                    reason: e.to_string(),
                };
                warn!(error = %err, bytes = line.len(), "Skipping malformed stream record");
            }
        }
    }

    fn reject_oversized(&mut self, seen: usize) {
        self.lines += 1;
        self.summary.malformed += 1;
        let err = KkvError::MalformedRecord {
            line: self.lines,
            reason: format!("record exceeds {} bytes", self.max_line_bytes),
        };
        warn!(error = %err, bytes = seen, "Skipping oversized stream record");
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

/// Consume `source` to the end, calling `on_record` once per decoded record.
///
/// Malformed lines are logged and skipped. A transport error from the source
/// stops processing and is returned; records emitted before it stay emitted.
pub async fn stream_body<S, B, F>(source: S, on_record: F) -> KkvResult<StreamSummary>
where
    S: Stream<Item = KkvResult<B>>,
    B: Buf,
    F: FnMut(Value),
{
    stream_body_with(StreamingReader::new(), source, on_record).await
}

/// Like [`stream_body`], decoding with a caller-configured reader.
pub async fn stream_body_with<S, B, F>(
    mut reader: StreamingReader,
    source: S,
    mut on_record: F,
) -> KkvResult<StreamSummary>
where
    S: Stream<Item = KkvResult<B>>,
    B: Buf,
    F: FnMut(Value),
{
    let mut source = std::pin::pin!(source);

    while let Some(chunk) = source.next().await {
        let mut chunk = chunk?;
        while chunk.has_remaining() {
            let len = chunk.chunk().len();
            reader.push(chunk.chunk(), &mut on_record);
            chunk.advance(len);
        }
    }

    Ok(reader.finish(&mut on_record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;
    use serde_json::json;

    fn collect(chunks: &[&str]) -> (Vec<Value>, StreamSummary) {
        let mut reader = StreamingReader::new();
        let mut out = Vec::new();
        for chunk in chunks {
            reader.push(chunk.as_bytes(), &mut |v| out.push(v));
        }
        let summary = reader.finish(&mut |v| out.push(v));
        (out, summary)
    }

    #[test]
    fn test_record_split_across_chunks() {
        let second = json!({ "foo": "bar2" }).to_string();
        let first_part = format!("{}\n", json!({ "foo": "bar" }));
        let tail = format!("{}\n", &second[4..]);
        let (records, summary) = collect(&[&first_part, &second[..4], &tail]);

        assert_eq!(records, vec![json!({ "foo": "bar" }), json!({ "foo": "bar2" })]);
        assert_eq!(summary.records, 2);
        assert_eq!(summary.malformed, 0);
    }

    #[test]
    fn test_many_records_in_one_chunk() {
        let (records, _) = collect(&["{\"a\":1}\n{\"a\":2}\n{\"a\":3}\n"]);
        assert_eq!(records.len(), 3);
        assert_eq!(records[2], json!({ "a": 3 }));
    }

    #[test]
    fn test_record_split_over_more_than_two_chunks() {
        let mut reader = StreamingReader::new();
        let mut out = Vec::new();
        for piece in ["{\"lo", "ng\":", "\"value", "\"}"] {
            reader.push(piece.as_bytes(), &mut |v| out.push(v));
            assert!(out.is_empty());
        }
        reader.push(b"\n", &mut |v| out.push(v));
        assert_eq!(out, vec![json!({ "long": "value" })]);
        assert_eq!(reader.pending_len(), 0);
    }

    #[test]
    fn test_malformed_line_does_not_stop_stream() {
        let (records, summary) = collect(&["{\"ok\":1}\n{broken\n", "{\"ok\":2}\n"]);
        assert_eq!(records, vec![json!({ "ok": 1 }), json!({ "ok": 2 })]);
        assert_eq!(summary.malformed, 1);
    }

    #[test]
    fn test_blank_and_crlf_lines() {
        let (records, summary) = collect(&["\n{\"a\":1}\r\n\r\n"]);
        assert_eq!(records, vec![json!({ "a": 1 })]);
        assert_eq!(summary, StreamSummary { records: 1, malformed: 0 });
    }

    #[test]
    fn test_unterminated_tail_is_decoded() {
        let (records, _) = collect(&["{\"a\":1}\n{\"a\":", "2}"]);
        assert_eq!(records, vec![json!({ "a": 1 }), json!({ "a": 2 })]);
    }

    #[test]
    fn test_multibyte_char_split_between_chunks() {
        let encoded = "{\"name\":\"Zoë\"}\n".as_bytes().to_vec();
        let split = encoded.iter().position(|b| *b == 0xC3).expect("has multibyte") + 1;
        let mut reader = StreamingReader::new();
        let mut out = Vec::new();
        reader.push(&encoded[..split], &mut |v| out.push(v));
        reader.push(&encoded[split..], &mut |v| out.push(v));
        assert_eq!(out, vec![json!({ "name": "Zoë" })]);
    }

    #[test]
    fn test_oversized_line_is_skipped() {
        let mut reader = StreamingReader::with_max_line_bytes(16);
        let mut out = Vec::new();
        reader.push(b"{\"a\":1}\n{\"big\":\"", &mut |v| out.push(v));
        reader.push(b"xxxxxxxxxxxxxxxxxxxx", &mut |v| out.push(v));
        assert!(reader.pending_len() <= 16);
        reader.push(b"xxxx\"}\n{\"a\":2}\n", &mut |v| out.push(v));
        let summary = reader.finish(&mut |v| out.push(v));

        assert_eq!(out, vec![json!({ "a": 1 }), json!({ "a": 2 })]);
        assert_eq!(summary, StreamSummary { records: 2, malformed: 1 });
    }

    #[test]
    fn test_oversized_complete_line_in_one_chunk() {
        let mut reader = StreamingReader::with_max_line_bytes(10);
        let mut out = Vec::new();
        reader.push(b"{\"long\":\"value\"}\n{\"a\":1}\n", &mut |v| out.push(v));
        let summary = reader.finish(&mut |v| out.push(v));

        assert_eq!(out, vec![json!({ "a": 1 })]);
        assert_eq!(summary.malformed, 1);
    }

    #[test]
    fn test_oversized_tail_is_dropped() {
        let mut reader = StreamingReader::with_max_line_bytes(4);
        let mut out = Vec::new();
        reader.push(b"1\n123456789", &mut |v| out.push(v));
        let summary = reader.finish(&mut |v| out.push(v));

        assert_eq!(out, vec![json!(1)]);
        assert_eq!(summary, StreamSummary { records: 1, malformed: 1 });
    }

    #[tokio::test]
    async fn test_stream_body_empty() {
        let source = stream::iter(Vec::<KkvResult<Bytes>>::new());
        let mut calls = 0;
        let summary = stream_body(source, |_| calls += 1)
            .await
            .expect("empty stream completes");
        assert_eq!(calls, 0);
        assert_eq!(summary, StreamSummary::default());
    }

    #[tokio::test]
    async fn test_stream_body_propagates_transport_error() {
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"{\"a\":1}\n")),
            Err(KkvError::transport("stream", "connection reset")),
            Ok(Bytes::from_static(b"{\"a\":2}\n")),
        ]);
        let mut seen = Vec::new();
        let err = stream_body(source, |v| seen.push(v)).await.unwrap_err();
        assert!(matches!(err, KkvError::Transport { .. }));
        assert_eq!(seen, vec![json!({ "a": 1 })]);
    }
}
