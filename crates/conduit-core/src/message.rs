//! Transport units: messages and their correlated replies.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BusError, Outcome, WireError};
use crate::topic::TopicKey;

fn default_acknowledge() -> bool {
    true
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

// =============================================================================
// Message
// =============================================================================

/// A message travelling over a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique id, used to correlate the reply.
    pub id: Uuid,
    /// Destination topic.
    pub topic: TopicKey,
    /// Arbitrary payload.
    #[serde(default)]
    pub payload: Value,
    /// Id of the message or event this one was forked from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// Creation time in milliseconds since the epoch.
    pub timestamp: i64,
    /// Whether the sender waits for a reply.
    #[serde(default = "default_acknowledge")]
    pub acknowledge: bool,
    /// Carried result, when a message doubles as a response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Carried error, when a message doubles as a response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Message {
    /// Creates an acknowledging message with a fresh id.
    pub fn new(topic: TopicKey, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic,
            payload,
            parent_id: None,
            timestamp: now_millis(),
            acknowledge: true,
            result: None,
            error: None,
        }
    }

    /// Sets the parent id.
    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    /// Marks this message as fire-and-forget.
    pub fn without_ack(mut self) -> Self {
        self.acknowledge = false;
        self
    }

    /// Derives a child message.
    ///
    /// The child has a new id and timestamp and points at this message
    /// through `parent_id`. Topic, payload and acknowledge are copied unless
    /// overridden.
    pub fn fork(&self, overrides: MessageOverrides) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: overrides.topic.unwrap_or_else(|| self.topic.clone()),
            payload: overrides.payload.unwrap_or_else(|| self.payload.clone()),
            parent_id: Some(self.id),
            timestamp: now_millis(),
            acknowledge: overrides.acknowledge.unwrap_or(self.acknowledge),
            result: None,
            error: None,
        }
    }

    /// Copies every field, id included, and applies the overrides.
    pub fn clone_with(&self, overrides: MessageOverrides) -> Self {
        let mut copy = self.clone();
        if let Some(topic) = overrides.topic {
            copy.topic = topic;
        }
        if let Some(payload) = overrides.payload {
            copy.payload = payload;
        }
        if let Some(acknowledge) = overrides.acknowledge {
            copy.acknowledge = acknowledge;
        }
        copy
    }
}

/// Field overrides for [`Message::fork`] and [`Message::clone_with`].
#[derive(Debug, Clone, Default)]
pub struct MessageOverrides {
    topic: Option<TopicKey>,
    payload: Option<Value>,
    acknowledge: Option<bool>,
}

impl MessageOverrides {
    /// Empty overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the topic.
    pub fn topic(mut self, topic: TopicKey) -> Self {
        self.topic = Some(topic);
        self
    }

    /// Overrides the payload.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Overrides the acknowledge flag.
    pub fn acknowledge(mut self, acknowledge: bool) -> Self {
        self.acknowledge = Some(acknowledge);
        self
    }
}

// =============================================================================
// Reply
// =============================================================================

/// The correlated answer to an acknowledging [`Message`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// Id of the message being answered.
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Reply {
    /// A successful reply.
    pub fn ok(id: Uuid, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    /// A failed reply.
    pub fn err(id: Uuid, error: &BusError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error.to_wire()),
        }
    }

    /// Builds a reply out of a handler outcome.
    pub fn from_outcome(id: Uuid, outcome: &Outcome) -> Self {
        match outcome {
            Ok(value) => Self::ok(id, value.clone()),
            Err(err) => Self::err(id, err),
        }
    }

    /// Turns the reply back into an outcome; a missing result is `null`.
    pub fn into_outcome(self) -> Outcome {
        match self.error {
            Some(wire) => Err(BusError::Remote(wire)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
