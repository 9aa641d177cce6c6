//! `text/event-stream` decoding for realtime database subscriptions

use crate::{Error, Result};
use serde::Deserialize;
use serde_json::Value;

/// One dispatched server-sent event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerEvent {
    pub event: String,
    pub data: String,
}

/// Incremental decoder; chunks may split lines and UTF-8 sequences anywhere
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
    pending: ServerEvent,
    has_data: bool,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every event it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ServerEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.handle_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn handle_line(&mut self, line: &str) -> Option<ServerEvent> {
        if line.is_empty() {
            let event = std::mem::take(&mut self.pending);
            let had_data = std::mem::replace(&mut self.has_data, false);
            return (had_data || !event.event.is_empty()).then_some(event);
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.pending.event = value.to_string(),
            "data" => {
                if self.has_data {
                    self.pending.data.push('\n');
                }
                self.pending.data.push_str(value);
                self.has_data = true;
            }
            _ => {}
        }
        None
    }
}

/// Realtime database stream events
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Replace the value at `path` (relative to the subscribed location)
    Put { path: String, data: Value },
    /// Merge children into the value at `path`
    Patch { path: String, data: Value },
    KeepAlive,
    /// Server revoked read permission; the stream ends
    Cancel,
    /// Credential expired; the stream ends
    AuthRevoked,
}

#[derive(Deserialize)]
struct Payload {
    path: String,
    data: Value,
}

impl StreamEvent {
    /// Interpret a decoded event; unknown event names yield `None`
    pub fn parse(event: &ServerEvent) -> Result<Option<Self>> {
        let parsed = match event.event.as_str() {
            "put" | "patch" => {
                let payload: Payload = serde_json::from_str(&event.data)
                    .map_err(|e| Error::protocol(format!("bad {} payload: {}", event.event, e)))?;
                if event.event == "put" {
                    StreamEvent::Put {
                        path: payload.path,
                        data: payload.data,
                    }
                } else {
                    StreamEvent::Patch {
                        path: payload.path,
                        data: payload.data,
                    }
                }
            }
            "keep-alive" => StreamEvent::KeepAlive,
            "cancel" => StreamEvent::Cancel,
            "auth_revoked" => StreamEvent::AuthRevoked,
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }

    /// New value of a subscribed counter, if this event replaces it
    ///
    /// Counters are scalars, so only a `put` at the root changes them; a
    /// `null` root means the counter was never written and reads as zero.
    pub fn counter_value(&self) -> Result<Option<u64>> {
        match self {
            StreamEvent::Put { path, data } if path == "/" => match data {
                Value::Null => Ok(Some(0)),
                other => other
                    .as_u64()
                    .map(Some)
                    .ok_or_else(|| Error::protocol(format!("counter is not a non-negative integer: {other}"))),
            },
            _ => Ok(None),
        }
    }

    /// Event name as it appears on the wire
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Put { .. } => "put",
            StreamEvent::Patch { .. } => "patch",
            StreamEvent::KeepAlive => "keep-alive",
            StreamEvent::Cancel => "cancel",
            StreamEvent::AuthRevoked => "auth_revoked",
        }
    }

    pub fn ends_stream(&self) -> bool {
        matches!(self, StreamEvent::Cancel | StreamEvent::AuthRevoked)
    }
}
