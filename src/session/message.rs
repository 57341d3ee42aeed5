use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use uuid::Uuid;

/// Delivery semantics of a published message.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// No acknowledgement from the broker
    #[default]
    Direct,
    /// Acknowledged, persistent delivery
    Persistent,
}

/// Identifies one in-flight operation so its acknowledgement can be routed
/// back to the caller waiting on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey(Uuid);

impl CorrelationKey {
    pub fn new() -> Self {
        CorrelationKey(Uuid::new_v4())
    }
}

impl Default for CorrelationKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    destination: String,
    payload: Vec<u8>,
    delivery_mode: DeliveryMode,
    correlation_key: Option<CorrelationKey>,
    timestamp: NaiveDateTime,
}

impl Message {
    pub fn direct(destination: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Message {
            destination: destination.into(),
            payload: payload.into(),
            delivery_mode: DeliveryMode::Direct,
            correlation_key: None,
            timestamp: chrono::Local::now().naive_local(),
        }
    }

    pub fn persistent(
        destination: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        correlation_key: CorrelationKey,
    ) -> Self {
        Message {
            delivery_mode: DeliveryMode::Persistent,
            correlation_key: Some(correlation_key),
            ..Message::direct(destination, payload)
        }
    }

    pub fn with_delivery_mode(mut self, delivery_mode: DeliveryMode) -> Self {
        self.delivery_mode = delivery_mode;
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        self.correlation_key
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }

    pub fn render(&self) -> String {
        format!(
            "{}: {}\n{}",
            self.timestamp,
            self.destination,
            self.payload_text()
        )
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = self.payload_text();
        let preview: String = text.chars().take(10).collect();
        write!(f, "{} - {}", self.timestamp, preview)
    }
}
