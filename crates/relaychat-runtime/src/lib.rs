//! Upstream agent runtime abstraction.
//!
//! The gateway talks to the conversational-agent backend only through the
//! [`AgentRuntimeClient`] trait: create a conversation, stream a response as
//! text chunks, and read the usage of the run that just finished. Clients for
//! named agents are built by an [`AgentClientFactory`].

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use relaychat_core::types::{ConversationId, ImageRef, UsageStats};

pub mod error;
pub mod http;
pub mod sse;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::RuntimeError;
pub use http::{HttpAgentClient, HttpClientFactory};

/// Incremental text fragments of one agent response.
pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// One user turn sent to an existing conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    pub conversation_id: ConversationId,
    pub message: String,
    pub images: Vec<ImageRef>,
}

/// Agent metadata as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// A live client bound to one upstream agent.
#[async_trait]
pub trait AgentRuntimeClient: Send + Sync {
    /// Identifier of the agent this client is bound to.
    fn agent_id(&self) -> &str;

    /// Start a new conversation. `seed` is the first user message.
    async fn create_conversation(&self, seed: &str) -> anyhow::Result<ConversationId>;

    /// Post a user turn and stream the agent's reply.
    async fn stream_response(&self, turn: &TurnRequest) -> anyhow::Result<ChunkStream>;

    /// Usage of the most recent completed run in a conversation, if the
    /// runtime reported any.
    async fn last_run_usage(
        &self,
        conversation_id: &ConversationId,
    ) -> anyhow::Result<Option<UsageStats>>;

    /// Ask the runtime to stop the active run in a conversation. Best effort.
    async fn cancel_run(&self, _conversation_id: &ConversationId) -> anyhow::Result<()> {
        Ok(())
    }

    /// Metadata for the bound agent.
    async fn describe(&self) -> anyhow::Result<AgentInfo>;

    /// Metadata for every agent visible to this client's credentials.
    async fn list_agents(&self) -> anyhow::Result<Vec<AgentInfo>>;

    /// Release resources held by the client.
    async fn close(&self) {}
}

/// Builds clients for named agents. Construction may call the runtime.
#[async_trait]
pub trait AgentClientFactory: Send + Sync {
    async fn connect(&self, agent_id: &str) -> anyhow::Result<Arc<dyn AgentRuntimeClient>>;
}
