//! Bench Events
//!
//! Everything the operator sees goes through one [`EventSink`]: status
//! lines, payloads written to the peer, and payloads received from it.
//! Any number of observers can [`subscribe`](EventSink::subscribe); with
//! nobody listening, events are dropped.

use std::fmt;

use tokio::sync::broadcast;
use tracing::{info, warn};

/// Default broadcast channel capacity.
///
/// Slow subscribers lag and miss events past this many.
const BROADCAST_CHANNEL_CAPACITY: usize = 1024;

/// Prefix marking an inbound payload that is not valid JSON
pub const MALFORMED_PREFIX: &str = "<malformed JSON>: ";

/// Observable bench activity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BenchEvent {
    /// Operator-facing status line
    Status(String),
    /// JSON payload written to the peer
    Sent(String),
    /// Valid JSON payload received from the peer
    Received(String),
    /// Inbound payload that failed UTF-8 or JSON decoding (lossy text)
    Malformed(String),
}

impl BenchEvent {
    /// Text of a received event as the operator sees it
    ///
    /// `None` for status and sent events.
    #[must_use]
    pub fn received_text(&self) -> Option<String> {
        match self {
            Self::Received(text) => Some(text.clone()),
            Self::Malformed(text) => Some(format!("{MALFORMED_PREFIX}{text}")),
            Self::Status(_) | Self::Sent(_) => None,
        }
    }
}

impl fmt::Display for BenchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(text) => write!(f, "[status] {text}"),
            Self::Sent(json) => write!(f, "[sent] {json}"),
            Self::Received(json) => write!(f, "[received] {json}"),
            Self::Malformed(text) => write!(f, "[received] {MALFORMED_PREFIX}{text}"),
        }
    }
}

/// Classify an inbound frame payload
///
/// Valid UTF-8 that parses as JSON is `Received`; anything else is
/// `Malformed`, carrying the lossy text.
#[must_use]
pub fn classify_payload(payload: &[u8]) -> BenchEvent {
    match std::str::from_utf8(payload) {
        Ok(text) if serde_json::from_str::<serde_json::Value>(text).is_ok() => {
            BenchEvent::Received(text.to_string())
        }
        Ok(text) => BenchEvent::Malformed(text.to_string()),
        Err(_) => BenchEvent::Malformed(String::from_utf8_lossy(payload).into_owned()),
    }
}

/// Fan-out sink for [`BenchEvent`]s
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<BenchEvent>,
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink {
    /// Create a sink with no subscribers
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Receive every event published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BenchEvent> {
        self.tx.subscribe()
    }

    /// Publish an event
    pub fn emit(&self, event: BenchEvent) {
        // Err only means nobody is subscribed.
        let _ = self.tx.send(event);
    }

    /// Publish a status line
    pub fn status(&self, text: impl Into<String>) {
        let text = text.into();
        info!(status = %text, "Status");
        self.emit(BenchEvent::Status(text));
    }

    /// Publish a sent payload
    pub fn sent(&self, json: impl Into<String>) {
        self.emit(BenchEvent::Sent(json.into()));
    }

    /// Classify and publish an inbound payload, returning the event
    pub fn received_payload(&self, payload: &[u8]) -> BenchEvent {
        let event = classify_payload(payload);
        if let BenchEvent::Malformed(text) = &event {
            warn!(payload = %text, "Malformed JSON from peer");
        }
        self.emit(event.clone());
        event
    }
}
