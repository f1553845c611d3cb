//! Server-sent-event framing shared by every streaming dialect. Parsing is
//! blank-line delimited: `event:`/`data:` lines accumulate until an empty
//! line closes out one event.

use bytes::Bytes;

#[derive(Debug, Clone, Default)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.finish_event(&mut events);
                continue;
            }

            if line.starts_with(':') {
                continue;
            }

            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
                continue;
            }
            if line == "event" {
                self.event = None;
                continue;
            }

            if let Some(value) = line.strip_prefix("data:") {
                let value = value.trim_start();
                self.data_lines.push(value.to_string());
                continue;
            }
            if line == "data" {
                self.data_lines.push(String::new());
                continue;
            }
        }

        events
    }

    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            if let Some(value) = line.strip_prefix("event:") {
                let value = value.trim_start();
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            } else if let Some(value) = line.strip_prefix("data:") {
                let value = value.trim_start();
                self.data_lines.push(value.to_string());
            }
        }
        self.finish_event(&mut events);
        events
    }

    /// Bytes still held in the internal buffer, not yet closed out by a
    /// blank line. Lets a caller reconstruct the `(accumulated, chunk) ->
    /// (new accumulated, events)` cursor contract on top of this parser
    /// without reaching into private state.
    pub fn take_remainder(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        let data = self.data_lines.join("\n");
        events.push(SseEvent {
            event: self.event.take(),
            data,
        });
        self.data_lines.clear();
    }
}

/// One step of the cursor-based streaming contract: feed previously
/// unconsumed bytes plus a freshly arrived chunk in, get back the new
/// unconsumed tail plus every event that closed out along the way.
pub fn decode_step(accumulated: Vec<u8>, chunk: &[u8]) -> (Vec<u8>, Vec<SseEvent>) {
    let mut text = String::from_utf8_lossy(&accumulated).into_owned();
    text.push_str(&String::from_utf8_lossy(chunk));

    let mut parser = SseParser::new();
    let events = parser.push_str(&text);
    let remainder = parser.take_remainder();
    (remainder.into_bytes(), events)
}

/// Encodes a single outbound event as wire bytes, `data:`-only unless a
/// named event type is supplied.
pub fn encode_event(event: Option<&str>, data: &str) -> Vec<u8> {
    let mut out = String::new();
    if let Some(name) = event {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_step_splits_on_blank_line() {
        let (remainder, events) = decode_step(Vec::new(), b"data: {\"a\":1}\n\ndata: {\"a");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, r#"{"a":1}"#);
        assert_eq!(remainder, b"data: {\"a");
    }

    #[test]
    fn decode_step_resumes_from_remainder() {
        let (remainder, events) = decode_step(Vec::new(), b"data: {\"a");
        assert!(events.is_empty());
        let (remainder, events) = decode_step(remainder, b":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, r#"{"a":1}"#);
        assert!(remainder.is_empty());
    }

    #[test]
    fn encode_event_round_trips_through_decode() {
        let wire = encode_event(Some("message_stop"), r#"{"type":"message_stop"}"#);
        let (_, events) = decode_step(Vec::new(), &wire);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_stop"));
    }
}
