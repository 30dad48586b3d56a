//! Scripted in-memory runtime for tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use relaychat_core::types::{ConversationId, UsageStats};

use crate::error::RuntimeError;
use crate::{AgentClientFactory, AgentInfo, AgentRuntimeClient, ChunkStream, TurnRequest};

/// What a [`ScriptedClient`] does for each call.
#[derive(Debug, Clone)]
pub struct Script {
    pub conversation_id: String,
    pub chunks: Vec<String>,
    pub usage: Option<UsageStats>,
    /// Fail conversation creation with this error.
    pub create_error: Option<RuntimeError>,
    /// Fail `stream_response` before any chunk.
    pub stream_error: Option<RuntimeError>,
    /// Yield this error after `chunks` are exhausted.
    pub fail_after_chunks: Option<RuntimeError>,
    /// Never end the stream after `chunks` are exhausted.
    pub hang_after_chunks: bool,
    /// Fail the usage lookup with this error.
    pub usage_error: Option<RuntimeError>,
    pub chunk_delay: Option<Duration>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            conversation_id: "thread_scripted".into(),
            chunks: vec!["Hello".into(), ", world".into()],
            usage: Some(UsageStats {
                duration_ms: 42.0,
                prompt_tokens: 7,
                completion_tokens: 2,
                total_tokens: 9,
            }),
            create_error: None,
            stream_error: None,
            fail_after_chunks: None,
            hang_after_chunks: false,
            usage_error: None,
            chunk_delay: None,
        }
    }
}

/// A runtime client that replays a [`Script`] and records what it was asked.
pub struct ScriptedClient {
    agent_id: String,
    script: Script,
    pub conversations_created: AtomicUsize,
    pub cancel_requests: AtomicUsize,
    pub usage_requests: AtomicUsize,
    pub closed: AtomicBool,
    turns: Mutex<Vec<TurnRequest>>,
}

impl ScriptedClient {
    pub fn new(agent_id: &str, script: Script) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            script,
            conversations_created: AtomicUsize::new(0),
            cancel_requests: AtomicUsize::new(0),
            usage_requests: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            turns: Mutex::new(Vec::new()),
        }
    }

    /// Turns received so far, in order.
    pub fn turns(&self) -> Vec<TurnRequest> {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentRuntimeClient for ScriptedClient {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn create_conversation(&self, _seed: &str) -> anyhow::Result<ConversationId> {
        if let Some(ref e) = self.script.create_error {
            return Err(e.clone().into());
        }
        self.conversations_created.fetch_add(1, Ordering::SeqCst);
        Ok(ConversationId::new(self.script.conversation_id.clone()))
    }

    async fn stream_response(&self, turn: &TurnRequest) -> anyhow::Result<ChunkStream> {
        self.turns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(turn.clone());

        if let Some(ref e) = self.script.stream_error {
            return Err(e.clone().into());
        }

        let delay = self.script.chunk_delay;
        let chunks = futures::stream::iter(self.script.chunks.clone()).then(move |chunk| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok::<_, anyhow::Error>(chunk)
        });

        let tail: ChunkStream = match (&self.script.fail_after_chunks, self.script.hang_after_chunks) {
            (Some(e), _) => {
                let failure: anyhow::Result<String> = Err(e.clone().into());
                Box::pin(futures::stream::once(futures::future::ready(failure)))
            }
            (None, true) => Box::pin(futures::stream::pending::<anyhow::Result<String>>()),
            (None, false) => Box::pin(futures::stream::empty::<anyhow::Result<String>>()),
        };

        Ok(Box::pin(chunks.chain(tail)))
    }

    async fn last_run_usage(
        &self,
        _conversation_id: &ConversationId,
    ) -> anyhow::Result<Option<UsageStats>> {
        self.usage_requests.fetch_add(1, Ordering::SeqCst);
        if let Some(ref e) = self.script.usage_error {
            return Err(e.clone().into());
        }
        Ok(self.script.usage)
    }

    async fn cancel_run(&self, _conversation_id: &ConversationId) -> anyhow::Result<()> {
        self.cancel_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn describe(&self) -> anyhow::Result<AgentInfo> {
        Ok(AgentInfo {
            id: self.agent_id.clone(),
            name: Some(format!("Scripted {}", self.agent_id)),
            description: None,
            model: Some("scripted-model".into()),
            instructions: None,
        })
    }

    async fn list_agents(&self) -> anyhow::Result<Vec<AgentInfo>> {
        Ok(vec![self.describe().await?])
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Factory that counts constructions and can fail the first few.
pub struct ScriptedFactory {
    script: Script,
    pub constructions: AtomicUsize,
    failures_remaining: AtomicUsize,
    failure: RuntimeError,
    delay: Duration,
    built: Mutex<Vec<Arc<ScriptedClient>>>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            constructions: AtomicUsize::new(0),
            failures_remaining: AtomicUsize::new(0),
            failure: RuntimeError::Unauthorized {
                status: 401,
                message: "invalid api key".into(),
            },
            delay: Duration::ZERO,
            built: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long inside every construction.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next `count` constructions with `error`.
    pub fn failing(self, count: usize, error: RuntimeError) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        Self {
            failure: error,
            ..self
        }
    }

    pub fn construction_count(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    /// Every client this factory has built.
    pub fn built(&self) -> Vec<Arc<ScriptedClient>> {
        self.built
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AgentClientFactory for ScriptedFactory {
    async fn connect(&self, agent_id: &str) -> anyhow::Result<Arc<dyn AgentRuntimeClient>> {
        self.constructions.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(self.failure.clone().into());
        }

        let client = Arc::new(ScriptedClient::new(agent_id, self.script.clone()));
        self.built
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(client.clone());
        Ok(client)
    }
}
