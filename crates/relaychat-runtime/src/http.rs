//! HTTP adapter for assistants-style agent runtimes.
//!
//! Conversations map to threads, responses to streamed runs:
//!
//! - `POST /threads` creates a conversation
//! - `POST /threads/{id}/messages` + `POST /threads/{id}/runs` (`stream: true`)
//!   produce the chunk stream
//! - `thread.run.completed` carries the usage recorded for `last_run_usage`

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace, warn};

use relaychat_core::config::RuntimeConfig;
use relaychat_core::types::{ConversationId, UsageStats};

use crate::error::RuntimeError;
use crate::sse::{SseEvent, parse_sse_stream};
use crate::{AgentClientFactory, AgentInfo, AgentRuntimeClient, ChunkStream, TurnRequest};

/// Conversation titles are cut to this many characters.
const TITLE_MAX_CHARS: usize = 64;

/// Connection settings shared by every client built from one config.
#[derive(Debug)]
struct Transport {
    endpoint: String,
    api_key: String,
    api_version: Option<String>,
    /// Whole-request limit for unary calls. Streamed runs are bounded only
    /// by the per-read idle timeout set on the client.
    timeout: Duration,
    client: reqwest::Client,
}

impl Transport {
    fn from_config(config: &RuntimeConfig, timeout: Duration) -> Result<Self, RuntimeError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .ok_or_else(|| RuntimeError::Configuration("runtime.endpoint is not set".into()))?
            .trim_end_matches('/')
            .to_string();

        let api_key = config
            .resolve_api_key()
            .ok_or_else(|| RuntimeError::Configuration("runtime API key is not set".into()))?;

        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| RuntimeError::Configuration(e.to_string()))?;

        Ok(Self {
            endpoint,
            api_key,
            api_version: config.api_version.clone(),
            timeout,
            client,
        })
    }

    /// A unary request, bounded by the request timeout end to end.
    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.streaming_request(method, path).timeout(self.timeout)
    }

    /// A request whose body may stay open as long as data keeps arriving.
    fn streaming_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.endpoint))
            .header("authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json");
        if let Some(ref version) = self.api_version {
            builder = builder.query(&[("api-version", version.as_str())]);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, RuntimeError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RuntimeError::from_status(status.as_u16(), error_message(&body)))
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, RuntimeError> {
        let response = self.send(self.request(reqwest::Method::GET, path)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| RuntimeError::Protocol(e.to_string()))
    }
}

/// Pull a human-readable message out of an error body.
fn error_message(body: &str) -> String {
    #[derive(Deserialize)]
    struct ErrorBody {
        error: ErrorDetail,
    }
    #[derive(Deserialize)]
    struct ErrorDetail {
        message: String,
    }

    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => body.chars().take(512).collect(),
    }
}

// --- Runtime wire types ---

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ThreadObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    id: String,
    #[serde(default)]
    usage: Option<RunUsage>,
    #[serde(default)]
    started_at: Option<i64>,
    #[serde(default)]
    completed_at: Option<i64>,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct RunUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct RunError {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: DeltaBody,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaBody {
    #[serde(default)]
    content: Vec<DeltaContent>,
}

#[derive(Debug, Deserialize)]
struct DeltaContent {
    #[serde(default)]
    text: Option<DeltaText>,
}

#[derive(Debug, Deserialize)]
struct DeltaText {
    #[serde(default)]
    value: String,
}

impl RunUsage {
    fn into_stats(self, duration_ms: f64) -> UsageStats {
        UsageStats {
            duration_ms,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            total_tokens: self.total_tokens,
        }
    }
}

/// Per-conversation run bookkeeping.
#[derive(Debug, Default)]
struct RunState {
    active_run: Option<String>,
    last_usage: Option<UsageStats>,
}

type RunTable = Arc<Mutex<HashMap<ConversationId, RunState>>>;

/// A client bound to one agent on an assistants-style runtime.
pub struct HttpAgentClient {
    agent_id: String,
    transport: Arc<Transport>,
    runs: RunTable,
}

impl HttpAgentClient {
    /// Build a client from config. Performs no network I/O.
    pub fn new(config: &RuntimeConfig, agent_id: &str, timeout: Duration) -> anyhow::Result<Self> {
        let transport = Transport::from_config(config, timeout)?;
        Ok(Self::with_transport(Arc::new(transport), agent_id))
    }

    fn with_transport(transport: Arc<Transport>, agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            transport,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn with_runs<R>(&self, f: impl FnOnce(&mut HashMap<ConversationId, RunState>) -> R) -> R {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut runs)
    }

    async fn post_message(&self, turn: &TurnRequest) -> Result<(), RuntimeError> {
        let mut content = vec![json!({ "type": "text", "text": turn.message })];
        for image in &turn.images {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": image.as_str() },
            }));
        }

        let path = format!("/threads/{}/messages", turn.conversation_id);
        let body = json!({ "role": "user", "content": content });
        self.transport
            .send(self.transport.request(reqwest::Method::POST, &path).json(&body))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AgentRuntimeClient for HttpAgentClient {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn create_conversation(&self, seed: &str) -> anyhow::Result<ConversationId> {
        let title: String = seed.chars().take(TITLE_MAX_CHARS).collect();
        let body = json!({ "metadata": { "title": title, "agent_id": self.agent_id } });

        let response = self
            .transport
            .send(self.transport.request(reqwest::Method::POST, "/threads").json(&body))
            .await?;
        let thread: ThreadObject = response
            .json()
            .await
            .map_err(|e| RuntimeError::Protocol(e.to_string()))?;

        debug!(agent_id = %self.agent_id, conversation_id = %thread.id, "Created conversation");
        Ok(ConversationId::new(thread.id))
    }

    async fn stream_response(&self, turn: &TurnRequest) -> anyhow::Result<ChunkStream> {
        self.post_message(turn).await?;

        let path = format!("/threads/{}/runs", turn.conversation_id);
        let body = json!({ "assistant_id": self.agent_id, "stream": true });
        let response = self
            .transport
            .send(
                self.transport
                    .streaming_request(reqwest::Method::POST, &path)
                    .header("accept", "text/event-stream")
                    .json(&body),
            )
            .await?;

        debug!(agent_id = %self.agent_id, conversation_id = %turn.conversation_id, "Streaming run");

        let state = RunStreamState {
            sse: Box::pin(parse_sse_stream(response)),
            runs: self.runs.clone(),
            conversation_id: turn.conversation_id.clone(),
            started: Instant::now(),
            finished: false,
        };

        let chunks = futures::stream::unfold(state, |mut state| async move {
            if state.finished {
                return None;
            }
            loop {
                let event = match state.sse.next().await {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        state.finish();
                        return Some((Err(anyhow::Error::new(e)), state));
                    }
                    None => {
                        state.finish();
                        return None;
                    }
                };

                match state.handle(event) {
                    RunStep::Chunk(text) => return Some((Ok(text), state)),
                    RunStep::Continue => continue,
                    RunStep::End => {
                        state.finish();
                        return None;
                    }
                    RunStep::Fail(e) => {
                        state.finish();
                        return Some((Err(anyhow::Error::new(e)), state));
                    }
                }
            }
        });

        Ok(Box::pin(chunks))
    }

    async fn last_run_usage(
        &self,
        conversation_id: &ConversationId,
    ) -> anyhow::Result<Option<UsageStats>> {
        // Recorded usage is handed out once; the entry goes with it unless a
        // newer run is already active in the conversation.
        let recorded = self.with_runs(|runs| {
            let run = runs.get_mut(conversation_id)?;
            let usage = run.last_usage.take();
            if run.active_run.is_none() {
                runs.remove(conversation_id);
            }
            usage
        });
        if recorded.is_some() {
            return Ok(recorded);
        }

        let path = format!("/threads/{conversation_id}/runs?limit=1&order=desc");
        let latest: ListResponse<RunObject> = self.transport.get_json(&path).await?;
        let usage = latest.data.into_iter().next().and_then(|run| {
            let duration_ms = match (run.started_at, run.completed_at) {
                (Some(start), Some(end)) if end >= start => ((end - start) * 1000) as f64,
                _ => 0.0,
            };
            run.usage.map(|u| u.into_stats(duration_ms))
        });
        Ok(usage)
    }

    async fn cancel_run(&self, conversation_id: &ConversationId) -> anyhow::Result<()> {
        let run_id = self.with_runs(|runs| {
            let run = runs.get_mut(conversation_id)?;
            let run_id = run.active_run.take();
            if run.last_usage.is_none() {
                runs.remove(conversation_id);
            }
            run_id
        });
        let Some(run_id) = run_id else {
            return Ok(());
        };

        let path = format!("/threads/{conversation_id}/runs/{run_id}/cancel");
        self.transport
            .send(self.transport.request(reqwest::Method::POST, &path))
            .await?;
        debug!(%conversation_id, %run_id, "Cancelled run");
        Ok(())
    }

    async fn describe(&self) -> anyhow::Result<AgentInfo> {
        let info = self
            .transport
            .get_json(&format!("/assistants/{}", self.agent_id))
            .await?;
        Ok(info)
    }

    async fn list_agents(&self) -> anyhow::Result<Vec<AgentInfo>> {
        let list: ListResponse<AgentInfo> = self.transport.get_json("/assistants").await?;
        Ok(list.data)
    }

    async fn close(&self) {
        let dropped = self.with_runs(|runs| {
            let count = runs.len();
            runs.clear();
            count
        });
        debug!(agent_id = %self.agent_id, dropped, "Closed runtime client");
    }
}

enum RunStep {
    Chunk(String),
    Continue,
    End,
    Fail(RuntimeError),
}

struct RunStreamState {
    sse: std::pin::Pin<Box<dyn futures::Stream<Item = Result<SseEvent, RuntimeError>> + Send>>,
    runs: RunTable,
    conversation_id: ConversationId,
    started: Instant,
    finished: bool,
}

impl RunStreamState {
    fn update(&self, f: impl FnOnce(&mut RunState)) {
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        f(runs.entry(self.conversation_id.clone()).or_default());
    }

    /// Clear the active run. An entry left with no usage to report is dropped.
    fn finish(&mut self) {
        self.finished = true;
        let mut runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        let empty = match runs.get_mut(&self.conversation_id) {
            Some(run) => {
                run.active_run = None;
                run.last_usage.is_none()
            }
            None => false,
        };
        if empty {
            runs.remove(&self.conversation_id);
        }
    }

    fn handle(&mut self, event: SseEvent) -> RunStep {
        let data = event.data.trim();
        if data == "[DONE]" {
            return RunStep::End;
        }

        match event.event.as_deref().unwrap_or("") {
            "thread.run.created" => {
                match serde_json::from_str::<RunObject>(data) {
                    Ok(run) => {
                        // A new run replaces whatever usage the last one left behind.
                        self.update(|state| {
                            state.active_run = Some(run.id);
                            state.last_usage = None;
                        });
                    }
                    Err(e) => trace!(%e, data, "Unparseable run.created payload"),
                }
                RunStep::Continue
            }
            "thread.message.delta" => match serde_json::from_str::<MessageDelta>(data) {
                Ok(delta) => {
                    let text: String = delta
                        .delta
                        .content
                        .into_iter()
                        .filter_map(|c| c.text.map(|t| t.value))
                        .collect();
                    if text.is_empty() {
                        RunStep::Continue
                    } else {
                        RunStep::Chunk(text)
                    }
                }
                Err(e) => RunStep::Fail(RuntimeError::Protocol(format!(
                    "bad message delta: {e}"
                ))),
            },
            "thread.run.completed" => {
                let duration_ms = self.started.elapsed().as_secs_f64() * 1000.0;
                match serde_json::from_str::<RunObject>(data) {
                    Ok(run) => {
                        let usage = run.usage.map(|u| u.into_stats(duration_ms));
                        self.update(|state| state.last_usage = usage);
                    }
                    Err(e) => warn!(%e, "Unparseable run.completed payload"),
                }
                RunStep::End
            }
            "thread.run.failed" | "thread.run.expired" => {
                let (code, message) = serde_json::from_str::<RunObject>(data)
                    .ok()
                    .and_then(|run| run.last_error)
                    .map(|err| {
                        (
                            err.code,
                            err.message.unwrap_or_else(|| "run did not complete".into()),
                        )
                    })
                    .unwrap_or((None, "run did not complete".into()));
                RunStep::Fail(RuntimeError::RunFailed { code, message })
            }
            "thread.run.cancelled" | "done" => RunStep::End,
            "error" => RunStep::Fail(RuntimeError::RunFailed {
                code: None,
                message: error_message(data),
            }),
            other => {
                trace!(event = other, "Ignoring runtime event");
                RunStep::Continue
            }
        }
    }
}

/// Builds [`HttpAgentClient`]s for named agents, verifying each agent exists.
pub struct HttpClientFactory {
    transport: Arc<Transport>,
}

impl HttpClientFactory {
    pub fn new(config: &RuntimeConfig, timeout: Duration) -> anyhow::Result<Self> {
        Ok(Self {
            transport: Arc::new(Transport::from_config(config, timeout)?),
        })
    }

    /// A client for the default agent sharing this factory's connection pool.
    /// Skips the existence check.
    pub fn bind(&self, agent_id: &str) -> HttpAgentClient {
        HttpAgentClient::with_transport(self.transport.clone(), agent_id)
    }
}

#[async_trait]
impl AgentClientFactory for HttpClientFactory {
    async fn connect(&self, agent_id: &str) -> anyhow::Result<Arc<dyn AgentRuntimeClient>> {
        let client = self.bind(agent_id);
        match client.describe().await {
            Ok(info) => {
                debug!(agent_id, name = ?info.name, "Agent session initialised");
                Ok(Arc::new(client))
            }
            Err(e) => match e.downcast_ref::<RuntimeError>() {
                Some(RuntimeError::Rejected { status: 404, .. }) => Err(RuntimeError::Configuration(
                    format!("agent '{agent_id}' does not exist"),
                )
                .into()),
                _ => Err(e),
            },
        }
    }
}
