use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Identifier tying one outbound request to its response messages
///
/// Generated fresh for every send, so it is never reused within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Backend-independent response event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    /// Incremental or final textual content
    Chunk(String),
    /// Terminal, no more content
    Final,
    /// Backend explicitly chose not to respond
    Empty,
}

impl ResponseEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResponseEvent::Final | ResponseEvent::Empty)
    }
}

/// Out-of-band tool execution notice; never spoken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolNotification {
    pub tool: String,
    pub args: Value,
}

/// Output of a response reassembler for one raw inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Response {
        correlation: CorrelationId,
        event: ResponseEvent,
    },
    Tool {
        correlation: Option<CorrelationId>,
        notification: ToolNotification,
    },
}

impl Normalized {
    pub fn response(correlation: CorrelationId, event: ResponseEvent) -> Self {
        Normalized::Response { correlation, event }
    }
}

/// Raw traffic forwarded by a transport's background reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame or one stdout line
    Message(String),
    /// Channel closed; no more messages will follow
    Closed(String),
}
