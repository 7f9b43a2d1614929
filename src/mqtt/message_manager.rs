use bytes::Bytes;
use chrono::{DateTime, Local};
use std::fmt;

const PREVIEW_LEN: usize = 32;

/// A message delivered by the broker on one of the session's subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub received_at: DateTime<Local>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }

    /// Payload as text, with invalid UTF-8 replaced
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

impl fmt::Display for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = self.text();
        let preview: String = text.chars().take(PREVIEW_LEN).collect();
        write!(f, "{} - {}: {}", self.received_at, self.topic, preview)
    }
}

/// A message queued for the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        OutboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Work handed from a session handle to the task that owns the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionRequest {
    Subscribe(String),
    Publish(OutboundMessage),
    Disconnect,
}
