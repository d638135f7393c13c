//! Application messages exchanged between agents

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::address::AgentAddress;
use crate::ids::MessageId;

/// A message addressed to an agent by its [`AgentAddress`].
///
/// The payload is opaque to the kernel. An empty payload is a valid message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: Option<AgentAddress>,
    pub receiver: AgentAddress,
    pub payload: Vec<u8>,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    pub fn new(receiver: AgentAddress, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: MessageId::generate(),
            sender: None,
            receiver,
            payload: payload.into(),
            sent_at: Utc::now(),
        }
    }

    /// Build a message whose payload is the JSON encoding of `value`.
    pub fn json<T: Serialize>(receiver: AgentAddress, value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(receiver, serde_json::to_vec(value)?))
    }

    pub fn with_sender(mut self, sender: AgentAddress) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Decode a JSON payload.
    pub fn decode_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
