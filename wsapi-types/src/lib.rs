//! Shared types for wsapi
//!
//! This crate provides the wire messages exchanged between a client
//! multiplexer and a server session, along with the identifier types
//! used to correlate them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Per-connection correlation id, assigned monotonically by the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl CorrelationId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for CorrelationId {
    fn from(id: u64) -> Self {
        CorrelationId(id)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Server-side identifier of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Message sent from a client to the server, discriminated by `action`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum ClientMessage {
    /// Subscribe to a live query
    #[serde(rename = "get")]
    Get {
        id: CorrelationId,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Invoke a mutator; answered by exactly one reply
    #[serde(rename = "set")]
    Set {
        id: CorrelationId,
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },

    /// Release one subscription
    #[serde(rename = "kill")]
    Kill { id: CorrelationId },

    /// Release every subscription of the connection
    #[serde(rename = "reset")]
    Reset,

    /// Release every subscription and close the relay sub-channel
    #[serde(rename = "killAll")]
    KillAll,
}

impl ClientMessage {
    /// Correlation id carried by the message, if any
    pub fn id(&self) -> Option<CorrelationId> {
        match self {
            ClientMessage::Get { id, .. }
            | ClientMessage::Set { id, .. }
            | ClientMessage::Kill { id } => Some(*id),
            ClientMessage::Reset | ClientMessage::KillAll => None,
        }
    }

    /// The `action` discriminator as it appears on the wire
    pub fn action(&self) -> &'static str {
        match self {
            ClientMessage::Get { .. } => "get",
            ClientMessage::Set { .. } => "set",
            ClientMessage::Kill { .. } => "kill",
            ClientMessage::Reset => "reset",
            ClientMessage::KillAll => "killAll",
        }
    }
}

/// Payload of a server reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyBody {
    /// A computed value
    #[serde(rename = "return")]
    Return(Value),

    /// The call was rejected or failed
    #[serde(rename = "error")]
    Error(String),
}

/// Message sent from the server to a client: `{id, return}` or `{id, error}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub id: CorrelationId,
    #[serde(flatten)]
    pub body: ReplyBody,
}

impl ServerMessage {
    pub fn value(id: CorrelationId, value: Value) -> Self {
        Self {
            id,
            body: ReplyBody::Return(value),
        }
    }

    pub fn error(id: CorrelationId, message: impl Into<String>) -> Self {
        Self {
            id,
            body: ReplyBody::Error(message.into()),
        }
    }

    /// The returned value, if this is not an error reply
    pub fn returned(&self) -> Option<&Value> {
        match &self.body {
            ReplyBody::Return(v) => Some(v),
            ReplyBody::Error(_) => None,
        }
    }
}
