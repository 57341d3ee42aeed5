//! # Session Model
//!
//! Types shared between the client wrapper and the transports: messages,
//! correlation keys, connection properties and the events a transport
//! reports back while a session is open.

pub mod message;
pub mod url;

pub use message::{CorrelationKey, DeliveryMode, Message};
pub use url::{BrokerUrl, Scheme};

use std::time::Duration;
use tokio::sync::mpsc;

/// Everything a transport needs to open a session.
#[derive(Clone, Debug)]
pub struct SessionProperties {
    pub url: BrokerUrl,
    pub vpn_name: String,
    pub username: String,
    pub password: String,
    pub client_name: String,
    /// Connection attempts before `ConnectFailed` is reported
    pub connect_retries: u32,
    pub keep_alive: Duration,
}

/// Notifications emitted by a transport for an open session.
///
/// Acknowledgement events carry the [`CorrelationKey`] of the operation they
/// answer; events for unknown keys are ignored by the client.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    UpNotice,
    ConnectFailed(String),
    Reconnecting(String),
    Disconnected,
    SubscriptionOk(CorrelationKey),
    SubscriptionError {
        key: CorrelationKey,
        reason: String,
    },
    Acknowledged(CorrelationKey),
    Rejected {
        key: CorrelationKey,
        reason: String,
    },
    Message(Message),
    QueueMessage {
        queue: String,
        delivery_id: u64,
        message: Message,
    },
    ConsumerUp {
        key: CorrelationKey,
        queue: String,
    },
    ConsumerBindFailed {
        key: CorrelationKey,
        queue: String,
        reason: String,
    },
    ConsumerDown {
        queue: String,
    },
}

pub type EventSender = mpsc::UnboundedSender<SessionEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Generates a client name for sessions that do not configure one.
pub fn generate_client_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("rates-{}", &id[..12])
}
