//! Chat stream wire protocol.
//!
//! Every frame is one JSON object with a `type` discriminator. On the HTTP
//! transport each frame is written as a server-sent event (`data: <json>`
//! followed by a blank line).

use serde::{Deserialize, Serialize};

use crate::types::{ConversationId, UsageStats};

/// One event on a chat stream.
///
/// Order within a stream: at most one `ConversationStarted` (always first),
/// any number of `Chunk`s, at most one `Usage`, then exactly one of `Done` or
/// `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "conversationId")]
    ConversationStarted {
        #[serde(rename = "conversationId")]
        conversation_id: ConversationId,
    },

    #[serde(rename = "chunk")]
    Chunk { content: String },

    #[serde(rename = "usage")]
    Usage(UsageStats),

    #[serde(rename = "error")]
    Error { message: String },

    #[serde(rename = "done")]
    Done,
}

impl StreamEvent {
    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done | StreamEvent::Error { .. })
    }

    /// The wire `type` value.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::ConversationStarted { .. } => "conversationId",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Usage(_) => "usage",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done => "done",
        }
    }
}
