//! Incremental server-sent events parser
//!
//! Feeds raw body chunks from a `text/event-stream` response and yields
//! complete events. Lines end in `\n` (a trailing `\r` is stripped); a blank
//! line dispatches the pending event.

use bytes::{Buf, BytesMut};
use std::time::Duration;
use tracing::warn;

/// Reconnect delay used until the server announces one
pub const DEFAULT_RETRY: Duration = Duration::from_millis(3000);

/// Longest line, and largest pending event, the parser will hold
pub const MAX_EVENT_LEN: usize = 1024 * 1024;

/// One dispatched event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Event type, `message` unless the server named it
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

impl SseEvent {
    pub fn is_message(&self) -> bool {
        self.event == "message"
    }
}

/// Stateful parser; keep one per stream connection
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
    data_len: usize,
    /// The pending event outgrew the limit and will be dropped
    oversized: bool,
    last_id: Option<String>,
    retry: Option<Duration>,
    /// Dropping the rest of an oversized line
    skipping: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Server-requested reconnect delay, if any was sent
    pub fn retry(&self) -> Option<Duration> {
        self.retry
    }

    /// Last event id seen on this stream
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    /// Consume a chunk, returning every event it completes
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(pos);
            self.buffer.advance(1);

            if std::mem::take(&mut self.skipping) || line.len() > MAX_EVENT_LEN {
                continue;
            }

            let line = String::from_utf8_lossy(&line);
            let line = line.strip_suffix('\r').unwrap_or(&line);
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }

        if self.buffer.len() > MAX_EVENT_LEN {
            warn!("Discarding event stream line over {} bytes", MAX_EVENT_LEN);
            self.buffer.clear();
            self.skipping = true;
            self.reset_event();
        }
        events
    }

    fn reset_event(&mut self) {
        self.event = None;
        self.data.clear();
        self.data_len = 0;
        self.oversized = false;
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" if !self.oversized => {
                self.data_len += value.len() + 1;
                if self.data_len > MAX_EVENT_LEN {
                    warn!("Discarding event stream event over {} bytes", MAX_EVENT_LEN);
                    self.data.clear();
                    self.oversized = true;
                } else {
                    self.data.push(value.to_string());
                }
            }
            "id" if !value.contains('\0') => self.last_id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        self.data_len = 0;
        self.oversized = false;
        if self.data.is_empty() {
            return None;
        }

        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "message".to_string()),
            data,
            id: self.last_id.clone(),
        })
    }
}
