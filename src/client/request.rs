//! Request/reply framing.
//!
//! A request is published as a JSON envelope naming the inbox topic the
//! requester listens on. Responders answer with a direct message to that
//! topic.

use serde::{Deserialize, Serialize};

use crate::session::{CorrelationKey, Message};

pub const INBOX_PREFIX: &str = "_inbox";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    pub reply_to: String,
    pub payload: String,
}

impl RequestEnvelope {
    pub fn new(reply_to: impl Into<String>, payload: impl Into<String>) -> Self {
        RequestEnvelope {
            reply_to: reply_to.into(),
            payload: payload.into(),
        }
    }

    pub fn from_message(message: &Message) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(message.payload())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Reply topic for one request issued by `client_name`.
pub fn inbox_topic(client_name: &str, request: &CorrelationKey) -> String {
    format!("{}/{}/{}", INBOX_PREFIX, client_name, request)
}

pub fn is_inbox(topic: &str) -> bool {
    topic
        .strip_prefix(INBOX_PREFIX)
        .is_some_and(|rest| rest.starts_with('/'))
}
