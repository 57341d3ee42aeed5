//! Error types for the client wrapper.

use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by [`crate::client::AsyncClient`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Session could not be established, or is not established
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Subscribe or unsubscribe was refused
    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    /// Guaranteed publish was refused
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    /// No acknowledgement arrived in time
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Request/reply exchange failed
    #[error("Request error: {0}")]
    Request(String),

    /// Queue consumer operation failed
    #[error("Consumer error: {0}")]
    Consumer(String),
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("HostUrl must be a ws://, wss://, tcp://, mqtt://, ssl:// or mqtts:// endpoint, got {0}")]
    InvalidUrl(String),

    #[error("Not connected to the message router")]
    NotConnected,

    #[error("Connection failed: {0}")]
    Failed(String),

    #[error("Session closed before the operation completed")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Already subscribed to {0}")]
    AlreadySubscribed(String),

    #[error("Not subscribed to {0}")]
    NotSubscribed(String),

    #[error("Subscription to {topic} rejected: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Publish to {topic} rejected: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl ClientError {
    pub fn not_connected() -> Self {
        ClientError::Connection(ConnectionError::NotConnected)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }
}
