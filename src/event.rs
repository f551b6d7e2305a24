//! Structured attacker-interaction events.
//!
//! Connectors and scripts describe what happened on a connection as an
//! [`Event`]: a category/type pair plus addresses and free-form custom
//! fields (`ssh.username`, `scripter.message`, ...). Events are handed to an
//! [`EventSink`], which must never block the caller.
//!
//! ```ignore
//! events.send(
//!     Event::new("generic", "session-start")
//!         .source(peer)
//!         .destination(local)
//!         .custom("generic.connector", "echo"),
//! );
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// One recorded interaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Broad source of the event (`generic`, `scripter`, `ssh`, ...).
    pub category: String,
    /// What happened within the category.
    #[serde(rename = "type")]
    pub kind: String,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Remote peer address, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SocketAddr>,
    /// Local address the peer connected to, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<SocketAddr>,
    /// Free-form fields.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom: BTreeMap<String, serde_json::Value>,
    /// Raw bytes observed on the wire, lossily decoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(category: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            kind: kind.into(),
            timestamp: Utc::now(),
            source: None,
            destination: None,
            custom: BTreeMap::new(),
            payload: None,
        }
    }

    /// Set the remote peer address.
    pub fn source(mut self, addr: SocketAddr) -> Self {
        self.source = Some(addr);
        self
    }

    /// Set the local address.
    pub fn destination(mut self, addr: SocketAddr) -> Self {
        self.destination = Some(addr);
        self
    }

    /// Add a custom field.
    pub fn custom(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.custom.insert(key.into(), value.into());
        self
    }

    /// Attach observed payload bytes.
    pub fn payload(mut self, bytes: &[u8]) -> Self {
        self.payload = Some(String::from_utf8_lossy(bytes).into_owned());
        self
    }
}

/// Destination for events. Implementations must not block.
pub trait EventSink: Send + Sync + std::fmt::Debug {
    /// Deliver one event (fire and forget).
    fn send(&self, event: Event);
}

/// Shared handle to an event sink.
pub type SharedEventSink = Arc<dyn EventSink>;

impl EventSink for UnboundedSender<Event> {
    fn send(&self, event: Event) {
        if UnboundedSender::send(self, event).is_err() {
            log::debug!("Event receiver dropped, discarding event");
        }
    }
}

/// Writes every event as one JSON line to the log at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn send(&self, event: Event) {
        match serde_json::to_string(&event) {
            Ok(line) => log::info!(target: "events", "{}", line),
            Err(e) => log::warn!("Failed to serialize event: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_fields() {
        let peer: SocketAddr = "10.0.0.1:4444".parse().unwrap();
        let event = Event::new("ssh", "password-authentication")
            .source(peer)
            .custom("ssh.username", "root")
            .payload(b"hunter2");

        assert_eq!(event.category, "ssh");
        assert_eq!(event.kind, "password-authentication");
        assert_eq!(event.source, Some(peer));
        assert_eq!(event.custom["ssh.username"], "root");
        assert_eq!(event.payload.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_serializes_type_field() {
        let json = serde_json::to_value(Event::new("generic", "session-start")).unwrap();
        assert_eq!(json["type"], "session-start");
        assert!(json.get("custom").is_none());
        assert!(json.get("source").is_none());
    }

    #[tokio::test]
    async fn test_channel_sink_delivers() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink: SharedEventSink = Arc::new(tx);

        sink.send(Event::new("scripter", "reload"));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.kind, "reload");
    }

    #[test]
    fn test_channel_sink_tolerates_closed_receiver() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
        drop(rx);
        EventSink::send(&tx, Event::new("scripter", "reload"));
    }
}
