use std::fmt;

use serde::{Deserialize, Serialize};

/// Key used for requests that name no agent. Bypasses the session cache.
pub const DEFAULT_AGENT_KEY: &str = "default";

/// Inbound chat request, as posted to either stream endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_attachments: Vec<ImageRef>,
}

impl ChatRequest {
    /// Create a text-only request that starts a new conversation.
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            conversation_id: None,
            image_attachments: Vec::new(),
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<ConversationId>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<ImageRef>) -> Self {
        self.image_attachments.push(image.into());
        self
    }
}

/// Opaque handle to an upstream conversation thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConversationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ConversationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Reference to an image: a `data:` URI or an http(s) URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ImageRef {
    fn from(reference: &str) -> Self {
        Self(reference.to_string())
    }
}

impl From<String> for ImageRef {
    fn from(reference: String) -> Self {
        Self(reference)
    }
}

/// Token accounting for one completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    #[serde(rename = "duration")]
    pub duration_ms: f64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Which runtime client a request should be served by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AgentTarget {
    /// The statically configured default client.
    Default,
    /// A named agent, resolved through the session cache.
    Named(String),
}

impl AgentTarget {
    /// Map an optional path segment to a target. The sentinel key and blank
    /// ids resolve to the default binding.
    pub fn from_agent_id(agent_id: Option<&str>) -> Self {
        match agent_id.map(str::trim) {
            None | Some("") => AgentTarget::Default,
            Some(id) if id == DEFAULT_AGENT_KEY => AgentTarget::Default,
            Some(id) => AgentTarget::Named(id.to_string()),
        }
    }

    pub fn key(&self) -> &str {
        match self {
            AgentTarget::Default => DEFAULT_AGENT_KEY,
            AgentTarget::Named(id) => id,
        }
    }
}
