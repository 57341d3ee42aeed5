//! # Broker Transports
//!
//! The client wrapper never talks to a broker directly. It hands requests to
//! a [`Transport`] and waits for the matching [`SessionEvent`] on the event
//! channel passed to [`Transport::connect`].
//!
//! ```text
//! transport/
//! ├── memory.rs  - in-process broker, used by tests and local tooling
//! └── mqtt.rs    - rumqttc-backed transport for real brokers
//! ```
//!
//! Transport calls return as soon as the request is handed off. Whether the
//! broker accepted it arrives later as an event carrying the same
//! correlation key.

pub mod memory;
pub mod mqtt;

use async_trait::async_trait;
use thiserror::Error;

use crate::session::{CorrelationKey, EventSender, Message, SessionProperties};

pub use memory::{BrokerPolicy, MemoryBroker, MemoryTransport};
pub use mqtt::MqttTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport has no open session")]
    NotConnected,

    #[error("Transport already has an open session")]
    AlreadyConnected,

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error("Broker client error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Starts opening a session. The outcome is reported as
    /// [`SessionEvent::UpNotice`](crate::session::SessionEvent::UpNotice) or
    /// [`SessionEvent::ConnectFailed`](crate::session::SessionEvent::ConnectFailed).
    async fn connect(
        &self,
        properties: SessionProperties,
        events: EventSender,
    ) -> Result<(), TransportError>;

    /// Starts closing the session; completion is reported as `Disconnected`.
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn subscribe(&self, filter: &str, key: CorrelationKey) -> Result<(), TransportError>;

    async fn unsubscribe(&self, filter: &str, key: CorrelationKey) -> Result<(), TransportError>;

    /// Publishes a message. Persistent messages are answered with
    /// `Acknowledged` or `Rejected` for their correlation key.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Binds a consumer to `queue`, creating the queue if missing.
    async fn bind_queue(&self, queue: &str, key: CorrelationKey) -> Result<(), TransportError>;

    async fn unbind_queue(&self, queue: &str) -> Result<(), TransportError>;

    async fn add_queue_subscription(
        &self,
        queue: &str,
        filter: &str,
        key: CorrelationKey,
    ) -> Result<(), TransportError>;

    async fn remove_queue_subscription(
        &self,
        queue: &str,
        filter: &str,
        key: CorrelationKey,
    ) -> Result<(), TransportError>;

    /// Acknowledges a queue delivery so the broker can discard it.
    async fn ack(&self, queue: &str, delivery_id: u64) -> Result<(), TransportError>;
}
