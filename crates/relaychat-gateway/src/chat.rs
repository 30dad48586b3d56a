//! One chat request, end to end.
//!
//! ```text
//! Init -> SessionResolved -> ConversationResolved -> Streaming -> Completed | Failed
//! ```
//!
//! Failures before the first frame can be answered with a plain problem
//! response (see [`ChatStreamGateway::prepare`]); anything later becomes a
//! single in-stream `error` frame. Cancellation and client disconnects end the
//! stream silently and ask the runtime to stop the run.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relaychat_core::config::ChatConfig;
use relaychat_core::error::FailureKind;
use relaychat_core::protocol::StreamEvent;
use relaychat_core::types::{AgentTarget, ChatRequest, ConversationId};
use relaychat_core::validate::validate_request;
use relaychat_runtime::{AgentRuntimeClient, TurnRequest};

use crate::framer::{FramerError, StreamFramer};
use crate::problem::{ErrorTranslator, ProblemDetails};
use crate::session_cache::AgentSessionCache;

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed { chunks: usize },
    Failed { kind: FailureKind, chunks: usize },
    Cancelled { chunks: usize },
    Disconnected { chunks: usize },
}

impl StreamOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamOutcome::Completed { .. } => "completed",
            StreamOutcome::Failed { .. } => "failed",
            StreamOutcome::Cancelled { .. } => "cancelled",
            StreamOutcome::Disconnected { .. } => "disconnected",
        }
    }

    pub fn chunks(&self) -> usize {
        match *self {
            StreamOutcome::Completed { chunks }
            | StreamOutcome::Failed { chunks, .. }
            | StreamOutcome::Cancelled { chunks }
            | StreamOutcome::Disconnected { chunks } => chunks,
        }
    }
}

/// A validated request bound to the client that will serve it.
pub struct PreparedChat {
    client: Arc<dyn AgentRuntimeClient>,
    request: ChatRequest,
}

impl PreparedChat {
    pub fn agent_id(&self) -> &str {
        self.client.agent_id()
    }
}

enum Abort {
    Failed(anyhow::Error),
    Cancelled,
    Disconnected,
}

impl From<FramerError> for Abort {
    fn from(_: FramerError) -> Self {
        Abort::Disconnected
    }
}

#[derive(Default)]
struct Progress {
    conversation_id: Option<ConversationId>,
    run_requested: bool,
    chunks: usize,
}

impl Progress {
    fn conversation(&self) -> &str {
        self.conversation_id.as_ref().map_or("-", |c| c.as_str())
    }
}

pub struct ChatStreamGateway {
    sessions: Arc<AgentSessionCache>,
    default_client: Arc<dyn AgentRuntimeClient>,
    limits: ChatConfig,
    translator: ErrorTranslator,
}

impl ChatStreamGateway {
    pub fn new(
        sessions: Arc<AgentSessionCache>,
        default_client: Arc<dyn AgentRuntimeClient>,
        limits: ChatConfig,
        translator: ErrorTranslator,
    ) -> Self {
        Self {
            sessions,
            default_client,
            limits,
            translator,
        }
    }

    pub fn sessions(&self) -> &Arc<AgentSessionCache> {
        &self.sessions
    }

    pub fn default_client(&self) -> &Arc<dyn AgentRuntimeClient> {
        &self.default_client
    }

    pub fn translator(&self) -> ErrorTranslator {
        self.translator
    }

    /// The default binding, or the cached session for a named agent.
    pub async fn resolve(&self, target: &AgentTarget) -> anyhow::Result<Arc<dyn AgentRuntimeClient>> {
        match target {
            AgentTarget::Default => Ok(self.default_client.clone()),
            AgentTarget::Named(agent_id) => Ok(self.sessions.get_or_create(agent_id).await?),
        }
    }

    /// Validate the request and resolve its client. Nothing is written to
    /// the stream, so the caller may still answer with a plain error.
    pub async fn prepare(&self, target: AgentTarget, request: ChatRequest) -> anyhow::Result<PreparedChat> {
        validate_request(&request, &self.limits)?;
        let client = self.resolve(&target).await?;
        Ok(PreparedChat { client, request })
    }

    /// [`prepare`](Self::prepare) then [`run`](Self::run), reporting every
    /// failure in-stream.
    pub async fn stream_chat(
        &self,
        target: AgentTarget,
        request: ChatRequest,
        framer: &mut StreamFramer,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let agent_key = target.key().to_string();
        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamOutcome::Cancelled { chunks: 0 },
            _ = framer.disconnected() => return StreamOutcome::Disconnected { chunks: 0 },
            prepared = self.prepare(target, request) => prepared,
        };
        match prepared {
            Ok(prepared) => self.run(prepared, framer, cancel).await,
            Err(e) => self.fail(framer, &e, &agent_key, &Progress::default()).await,
        }
    }

    /// Drive a prepared request to completion, failure or cancellation.
    pub async fn run(
        &self,
        prepared: PreparedChat,
        framer: &mut StreamFramer,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let agent_id = prepared.agent_id().to_string();
        let mut progress = Progress::default();
        debug!(agent_id = %agent_id, "Chat stream started");

        #[cfg(feature = "metrics")]
        crate::metrics::record_stream_start();

        let outcome = match self.drive(&prepared, framer, cancel, &mut progress).await {
            Ok(()) => {
                info!(
                    agent_id = %agent_id,
                    conversation_id = progress.conversation(),
                    chunks = progress.chunks,
                    outcome = "completed",
                    "Chat stream completed"
                );
                StreamOutcome::Completed {
                    chunks: progress.chunks,
                }
            }
            Err(Abort::Failed(e)) => self.fail(framer, &e, &agent_id, &progress).await,
            Err(Abort::Cancelled) => {
                let outcome = StreamOutcome::Cancelled {
                    chunks: progress.chunks,
                };
                self.abandon(&prepared.client, &progress, outcome).await;
                outcome
            }
            Err(Abort::Disconnected) => {
                let outcome = StreamOutcome::Disconnected {
                    chunks: progress.chunks,
                };
                self.abandon(&prepared.client, &progress, outcome).await;
                outcome
            }
        };

        #[cfg(feature = "metrics")]
        crate::metrics::record_stream_end(outcome.as_str());

        outcome
    }

    async fn drive(
        &self,
        prepared: &PreparedChat,
        framer: &mut StreamFramer,
        cancel: &CancellationToken,
        progress: &mut Progress,
    ) -> Result<(), Abort> {
        let client = &prepared.client;
        let request = &prepared.request;

        let conversation_id = match &request.conversation_id {
            Some(existing) => existing.clone(),
            None => {
                let created = guarded(cancel, framer, client.create_conversation(&request.message)).await?;
                emit(
                    framer,
                    cancel,
                    StreamEvent::ConversationStarted {
                        conversation_id: created.clone(),
                    },
                )
                .await?;
                created
            }
        };
        progress.conversation_id = Some(conversation_id.clone());

        let turn = TurnRequest {
            conversation_id: conversation_id.clone(),
            message: request.message.clone(),
            images: request.image_attachments.clone(),
        };
        progress.run_requested = true;
        let mut chunks = guarded(cancel, framer, client.stream_response(&turn)).await?;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Abort::Cancelled),
                _ = framer.disconnected() => return Err(Abort::Disconnected),
                next = chunks.next() => next,
            };
            match next {
                Some(Ok(content)) => {
                    if content.is_empty() {
                        continue;
                    }
                    emit(framer, cancel, StreamEvent::Chunk { content }).await?;
                    progress.chunks += 1;
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_chunk();
                }
                Some(Err(e)) => return Err(Abort::Failed(e)),
                None => break,
            }
        }
        drop(chunks);

        // Usage is optional; a failed lookup must not turn a finished answer into an error.
        match guarded(cancel, framer, client.last_run_usage(&conversation_id)).await {
            Ok(Some(usage)) => emit(framer, cancel, StreamEvent::Usage(usage)).await?,
            Ok(None) => {}
            Err(Abort::Failed(e)) => {
                warn!(
                    agent_id = client.agent_id(),
                    conversation_id = %conversation_id,
                    error = %format!("{e:#}"),
                    "Usage lookup failed, completing without usage"
                );
            }
            Err(abort) => return Err(abort),
        }

        emit(framer, cancel, StreamEvent::Done).await
    }

    /// Log a failure and translate it for the caller.
    pub fn report(&self, err: &anyhow::Error, agent_id: &str) -> (FailureKind, ProblemDetails) {
        self.report_with(err, agent_id, &Progress::default())
    }

    fn report_with(
        &self,
        err: &anyhow::Error,
        agent_id: &str,
        progress: &Progress,
    ) -> (FailureKind, ProblemDetails) {
        let kind = ErrorTranslator::classify(err.as_ref());
        let detail = format!("{err:#}");

        match kind {
            FailureKind::ClientInput => info!(
                agent_id,
                outcome = "failed",
                kind = kind.as_str(),
                error = %detail,
                "Chat request rejected"
            ),
            FailureKind::UpstreamTransient => warn!(
                agent_id,
                conversation_id = progress.conversation(),
                chunks = progress.chunks,
                outcome = "failed",
                kind = kind.as_str(),
                error = %detail,
                "Chat stream failed"
            ),
            FailureKind::UpstreamAuth | FailureKind::Unclassified => error!(
                agent_id,
                conversation_id = progress.conversation(),
                chunks = progress.chunks,
                outcome = "failed",
                kind = kind.as_str(),
                error = %detail,
                "Chat stream failed"
            ),
        }

        #[cfg(feature = "metrics")]
        crate::metrics::record_error(kind.as_str());

        (kind, self.translator.translate(err.as_ref()))
    }

    /// Report the failure and write the single `error` frame.
    async fn fail(
        &self,
        framer: &mut StreamFramer,
        err: &anyhow::Error,
        agent_id: &str,
        progress: &Progress,
    ) -> StreamOutcome {
        let (kind, problem) = self.report_with(err, agent_id, progress);

        let frame = StreamEvent::Error {
            message: problem.stream_message(),
        };
        if framer.emit(frame).await.is_err() {
            debug!(agent_id, "Client gone before the error frame was written");
        }

        StreamOutcome::Failed {
            kind,
            chunks: progress.chunks,
        }
    }

    /// Silent end of a cancelled or disconnected stream. Usage is not fetched.
    async fn abandon(&self, client: &Arc<dyn AgentRuntimeClient>, progress: &Progress, outcome: StreamOutcome) {
        debug!(
            agent_id = client.agent_id(),
            conversation_id = progress.conversation(),
            chunks = progress.chunks,
            outcome = outcome.as_str(),
            "Chat stream ended early"
        );

        if !progress.run_requested {
            return;
        }
        if let Some(conversation_id) = &progress.conversation_id {
            if let Err(e) = client.cancel_run(conversation_id).await {
                debug!(
                    agent_id = client.agent_id(),
                    conversation_id = %conversation_id,
                    error = %e,
                    "Run cancellation request failed"
                );
            }
        }
    }
}

/// Await upstream work unless the request is cancelled or the client leaves first.
async fn guarded<T>(
    cancel: &CancellationToken,
    framer: &StreamFramer,
    work: impl Future<Output = anyhow::Result<T>>,
) -> Result<T, Abort> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Abort::Cancelled),
        _ = framer.disconnected() => Err(Abort::Disconnected),
        result = work => result.map_err(Abort::Failed),
    }
}

async fn emit(framer: &mut StreamFramer, cancel: &CancellationToken, event: StreamEvent) -> Result<(), Abort> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Abort::Cancelled),
        sent = framer.emit(event) => sent.map_err(Abort::from),
    }
}
