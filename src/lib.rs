//! Async wrapper around a publish/subscribe broker session, with the rates
//! subscription manager service built on top of it.

pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod session;
pub mod store;
pub mod submanager;
pub mod topic;
pub mod transport;

pub use client::{AsyncClient, ClientSettings, MessageCallback, RequestEnvelope};
pub use config::Config;
pub use error::{ClientError, ConnectionError, PublishError, SubscriptionError};
pub use session::{DeliveryMode, Message};
pub use store::{ConnectionStatus, StatusStore};
pub use submanager::{SubManRequest, SubManResponse, SubscriptionManager};
pub use transport::{MemoryBroker, MqttTransport, Transport};
