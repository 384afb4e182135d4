//! Incremental decoding of the sidecar's `text/event-stream` responses.

use crate::error::{Result, SidecarError};
use futures::{Stream, StreamExt};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: Value,
}

impl SseEvent {
    /// `done`/`error` end a stream; with `frames`, so do `frame` events whose
    /// payload `type` is `done` or `error`.
    pub fn is_terminal(&self, frames: bool) -> bool {
        match self.event.as_str() {
            "done" | "error" => true,
            "frame" if frames => matches!(
                self.data.get("type").and_then(Value::as_str),
                Some("done" | "error")
            ),
            _ => false,
        }
    }
}

/// Splits a byte stream into SSE blocks.
///
/// UTF-8 sequences may straddle chunks; `\r\n` and lone `\r` become `\n`.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending_bytes: Vec<u8>,
    pending_cr: bool,
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns every block completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let text = self.decode_utf8(chunk);
        self.normalize_into_buffer(&text);

        let mut events = Vec::new();
        while let Some(idx) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..idx + 2).collect();
            if let Some(event) = decode_block(&block[..idx]) {
                events.push(event);
            }
        }
        events
    }

    fn decode_utf8(&mut self, chunk: &[u8]) -> String {
        self.pending_bytes.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending_bytes) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending_bytes.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending_bytes[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending_bytes.drain(..valid + bad);
                        }
                        None => {
                            // incomplete sequence at the end, wait for more bytes
                            self.pending_bytes.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn normalize_into_buffer(&mut self, text: &str) {
        for ch in text.chars() {
            if self.pending_cr {
                self.pending_cr = false;
                self.buffer.push('\n');
                if ch == '\n' {
                    continue;
                }
            }
            if ch == '\r' {
                self.pending_cr = true;
            } else {
                self.buffer.push(ch);
            }
        }
    }
}

/// Event name and joined `data:` text of one block.
pub fn parse_block(block: &str) -> (String, String) {
    let mut event_name = "message".to_string();
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.split('\n') {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            let name = rest.trim();
            event_name = if name.is_empty() {
                "message".to_string()
            } else {
                name.to_string()
            };
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }

    (event_name, data_lines.join("\n"))
}

/// JSON when it parses, `{"message": raw}` otherwise, `{}` when empty.
pub fn parse_payload(data_text: &str) -> Value {
    if data_text.is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_str(data_text).unwrap_or_else(|_| json!({ "message": data_text }))
}

/// `None` for whitespace-only blocks.
pub fn decode_block(block: &str) -> Option<SseEvent> {
    if block.trim().is_empty() {
        return None;
    }
    let (event, data_text) = parse_block(block);
    Some(SseEvent {
        event,
        data: parse_payload(&data_text),
    })
}

/// Decoded events of a streaming response body, in wire order.
pub fn event_stream(response: reqwest::Response) -> impl Stream<Item = Result<SseEvent>> {
    async_stream::stream! {
        let mut decoder = SseDecoder::new();
        let mut bytes = response.bytes_stream();
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in decoder.push(&chunk) {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    yield Err(SidecarError::Sidecar(format!("Stream error: {}", e)));
                    break;
                }
            }
        }
    }
}
