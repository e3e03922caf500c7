//! Incremental server-sent event decoder.

use serde_json::Value;

/// One dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseRecord {
    /// `event:` field, `None` for plain messages
    pub event: Option<String>,
    pub data: String,
}

impl SseRecord {
    pub fn is_keepalive(&self) -> bool {
        self.event.as_deref() == Some("keepalive")
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(&self.data).ok()
    }

    /// The `status` field of the JSON payload.
    pub fn status(&self) -> Option<String> {
        self.json()?
            .get("status")?
            .as_str()
            .map(str::to_string)
    }
}

/// Accumulates bytes and yields complete records. Chunk boundaries may fall
/// anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseRecord> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(record) = self.dispatch() {
                    out.push(record);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        out
    }

    fn dispatch(&mut self) -> Option<SseRecord> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseRecord { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_split_across_chunks() {
        let mut dec = SseDecoder::new();
        assert!(dec.feed(b"event: snap").is_empty());
        assert!(dec.feed(b"shot\ndata: {\"status\":").is_empty());
        let records = dec.feed(b"\"running\"}\n\ndata: {}\n\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event.as_deref(), Some("snapshot"));
        assert_eq!(records[0].status().as_deref(), Some("running"));
        assert_eq!(records[1].event, None);
    }

    #[test]
    fn test_comments_and_crlf() {
        let mut dec = SseDecoder::new();
        let records = dec.feed(b": hello\r\nevent: keepalive\r\ndata: {\"type\":\"keepalive\"}\r\n\r\n");
        assert_eq!(records.len(), 1);
        assert!(records[0].is_keepalive());
    }

    #[test]
    fn test_multiline_data_is_joined() {
        let mut dec = SseDecoder::new();
        let records = dec.feed(b"data: a\ndata: b\n\n");
        assert_eq!(records[0].data, "a\nb");
        assert_eq!(records[0].json(), None);
    }

    #[test]
    fn test_event_without_data_is_dropped() {
        let mut dec = SseDecoder::new();
        assert!(dec.feed(b"event: snapshot\n\n").is_empty());
        let records = dec.feed(b"data: 1\n\n");
        assert_eq!(records[0].event, None);
    }
}
