//! # Subscription Manager
//!
//! Service side of the subscription request exchange. Traders send a
//! [`SubManRequest`] wrapped in a [`RequestEnvelope`]; the service answers on
//! the envelope's reply topic with the filters the trader may subscribe to.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{AsyncClient, MessageCallback, RequestEnvelope};
use crate::config::SubManagerConfig;
use crate::error::ClientError;
use crate::session::Message;

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubManRequest {
    pub username: String,
    pub client_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct SubManResponse {
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Error)]
pub enum SubManError {
    #[error("Request is not a valid envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    #[error("Malformed subscription request: {0}")]
    Request(#[source] serde_json::Error),

    #[error("Failed to encode response: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to send reply: {0}")]
    Reply(#[from] ClientError),
}

pub struct SubscriptionManager {
    client: AsyncClient,
    config: SubManagerConfig,
}

impl SubscriptionManager {
    pub fn new(client: AsyncClient, config: SubManagerConfig) -> Self {
        SubscriptionManager { client, config }
    }

    pub fn request_topic(&self) -> &str {
        &self.config.request_topic
    }

    pub fn build_response(&self, request: &SubManRequest) -> SubManResponse {
        debug!(
            "Granting {} filters to {}",
            self.config.grants.len(),
            request.username
        );
        SubManResponse {
            subscriptions: self.config.grants.clone(),
        }
    }

    /// Answers one request message.
    pub async fn handle(&self, message: &Message) -> Result<SubManResponse, SubManError> {
        let envelope = RequestEnvelope::from_message(message).map_err(SubManError::Envelope)?;
        let request: SubManRequest =
            serde_json::from_str(&envelope.payload).map_err(SubManError::Request)?;

        info!(
            "Subscription request from {} ({}) on {}",
            request.username,
            request.client_name,
            message.destination()
        );

        let response = self.build_response(&request);
        let body = serde_json::to_vec(&response).map_err(SubManError::Encode)?;
        self.client.send_reply(&envelope, body).await?;
        Ok(response)
    }

    /// Subscribes to the request topic and serves requests on a background
    /// task until `shutdown` is cancelled.
    pub async fn start(self, shutdown: CancellationToken) -> Result<JoinHandle<()>, ClientError> {
        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        let forward: MessageCallback = Arc::new(move |msg: &Message| {
            let _ = tx.send(msg.clone());
        });

        self.client
            .subscribe(&self.config.request_topic, forward)
            .await?;
        info!(
            "Subscription manager listening on {}",
            self.config.request_topic
        );

        Ok(tokio::spawn(self.serve(rx, shutdown)))
    }

    /// Serves requests until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ClientError> {
        self.start(shutdown)
            .await?
            .await
            .map_err(|e| ClientError::Request(format!("Subscription manager task failed: {}", e)))
    }

    async fn serve(self, mut requests: mpsc::UnboundedReceiver<Message>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = requests.recv() => {
                    let Some(message) = received else { break };
                    if let Err(e) = self.handle(&message).await {
                        warn!("Dropping request on {}: {}", message.destination(), e);
                    }
                }
            }
        }

        info!("Subscription manager stopping");
        if let Err(e) = self.client.unsubscribe(&self.config.request_topic).await {
            debug!("Request subscription not released: {}", e);
        }
    }
}
