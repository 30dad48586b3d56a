//! Axum HTTP server.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router, middleware};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use relaychat_core::types::{AgentTarget, ChatRequest};

use crate::auth::{Principal, require_auth};
use crate::framer;
use crate::problem::ProblemDetails;
use crate::state::GatewayState;

/// Caller-supplied deadline for a stream, in milliseconds.
pub const DEADLINE_HEADER: &str = "x-request-timeout-ms";

/// Build the gateway router.
pub fn router(state: Arc<GatewayState>) -> Router {
    let protected = Router::new()
        .route("/chat/stream", post(chat_stream))
        .route("/agents", get(list_agents))
        .route("/agents/{agent_id}", get(get_agent))
        .route("/agents/{agent_id}/chat/stream", post(agent_chat_stream))
        .route("/agents/{agent_id}/session", axum::routing::delete(release_session))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let app = Router::new().route("/health", get(health_handler));
    #[cfg(feature = "metrics")]
    let app = app.route("/metrics", get(metrics_handler));

    app.merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn start_gateway(state: Arc<GatewayState>) -> anyhow::Result<()> {
    let addr = format!(
        "{}:{}",
        state.config.gateway_bind(),
        state.config.gateway_port()
    );
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Gateway listening on {addr}");

    serve(listener, state, shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` resolves, then cancel
/// in-flight streams and release every cached agent session.
pub async fn serve(
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if let Some(ttl) = state.config.session_idle_ttl_secs() {
        let interval = state.config.session_sweep_interval_secs().max(1);
        info!(ttl_secs = ttl, interval_secs = interval, "Idle session eviction enabled");
        let _sweeper = state.sessions().spawn_sweeper(
            Duration::from_secs(ttl),
            Duration::from_secs(interval),
            state.shutdown.clone(),
        );
    }

    let stop = state.shutdown.clone();
    let result = axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(async move {
            shutdown.await;
            stop.cancel();
        })
        .await;

    state.shutdown.cancel();
    let released = state.sessions().release_all().await;
    info!(released, "Gateway stopped");

    result.context("gateway server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions().len(),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
    }))
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => ProblemDetails::not_found("metrics recorder is not installed").into_response(),
    }
}

async fn chat_stream(
    State(state): State<Arc<GatewayState>>,
    Extension(principal): Extension<Principal>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    open_stream(state, AgentTarget::Default, principal, &headers, body).await
}

async fn agent_chat_stream(
    State(state): State<Arc<GatewayState>>,
    Extension(principal): Extension<Principal>,
    Path(agent_id): Path<String>,
    headers: HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let target = AgentTarget::from_agent_id(Some(&agent_id));
    open_stream(state, target, principal, &headers, body).await
}

/// Prepare the request, then hand the stream to a background task and return
/// the SSE response. Failures before that point are answered as problems.
async fn open_stream(
    state: Arc<GatewayState>,
    target: AgentTarget,
    principal: Principal,
    headers: &HeaderMap,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request_id = Uuid::new_v4();
    let span = info_span!(
        "chat_stream",
        %request_id,
        agent = target.key(),
        principal = %principal.subject,
    );

    let Json(request) = match body {
        Ok(body) => body,
        Err(rejection) => {
            debug!(parent: &span, error = %rejection.body_text(), "Malformed chat request body");
            return ProblemDetails::new(rejection.status(), "Invalid request", rejection.body_text())
                .with_extension("requestId", request_id.to_string())
                .into_response();
        }
    };

    let cancel = state.shutdown.child_token();
    if let Some(deadline) = request_deadline(headers) {
        spawn_deadline(cancel.clone(), deadline);
    }

    let gateway = state.gateway.clone();
    let agent_key = target.key().to_string();
    let prepared = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return ProblemDetails::new(
                StatusCode::GATEWAY_TIMEOUT,
                "Deadline exceeded",
                "The request deadline elapsed before the stream opened.",
            )
            .with_extension("requestId", request_id.to_string())
            .into_response();
        }
        prepared = gateway.prepare(target, request).instrument(span.clone()) => prepared,
    };
    let prepared = match prepared {
        Ok(prepared) => prepared,
        Err(e) => {
            let (_, problem) = span.in_scope(|| gateway.report(&e, &agent_key));
            cancel.cancel();
            return problem
                .with_extension("requestId", request_id.to_string())
                .into_response();
        }
    };

    let (mut stream_framer, rx) = framer::channel();
    tokio::spawn(
        async move {
            let outcome = gateway.run(prepared, &mut stream_framer, &cancel).await;
            // Stops the deadline timer.
            cancel.cancel();
            debug!(
                outcome = outcome.as_str(),
                chunks = outcome.chunks(),
                events = stream_framer.emitted(),
                "Chat stream closed"
            );
        }
        .instrument(span),
    );

    let keep_alive = Duration::from_secs(state.config.keep_alive_secs().max(1));
    let sse = Sse::new(framer::sse_stream(rx)).keep_alive(KeepAlive::new().interval(keep_alive));
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
        .into_response()
}

fn request_deadline(headers: &HeaderMap) -> Option<Duration> {
    let millis: u64 = headers.get(DEADLINE_HEADER)?.to_str().ok()?.trim().parse().ok()?;
    (millis > 0).then(|| Duration::from_millis(millis))
}

fn spawn_deadline(cancel: CancellationToken, after: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(after) => {
                debug!(deadline_ms = after.as_millis() as u64, "Request deadline elapsed");
                cancel.cancel();
            }
        }
    });
}

async fn list_agents(State(state): State<Arc<GatewayState>>) -> Response {
    let client = state.gateway.default_client();
    match client.list_agents().await {
        Ok(agents) => Json(json!({ "agents": agents })).into_response(),
        Err(e) => state.gateway.report(&e, client.agent_id()).1.into_response(),
    }
}

/// Describe through a live session when one exists, otherwise search the
/// runtime's listing. Never constructs a session.
async fn get_agent(
    State(state): State<Arc<GatewayState>>,
    Path(agent_id): Path<String>,
) -> Response {
    let client = match AgentTarget::from_agent_id(Some(&agent_id)) {
        AgentTarget::Default => Some(state.gateway.default_client().clone()),
        AgentTarget::Named(id) => state.sessions().peek(&id),
    };

    let result = match client {
        Some(client) => client.describe().await.map(Some),
        None => state
            .gateway
            .default_client()
            .list_agents()
            .await
            .map(|agents| agents.into_iter().find(|a| a.id == agent_id)),
    };

    match result {
        Ok(Some(info)) => Json(info).into_response(),
        Ok(None) => ProblemDetails::not_found(format!("agent '{agent_id}' does not exist"))
            .with_extension("agentId", agent_id)
            .into_response(),
        Err(e) => state.gateway.report(&e, &agent_id).1.into_response(),
    }
}

async fn release_session(
    State(state): State<Arc<GatewayState>>,
    Extension(principal): Extension<Principal>,
    Path(agent_id): Path<String>,
) -> impl IntoResponse {
    let released = state.sessions().release(&agent_id).await;
    info!(agent_id = %agent_id, released, principal = %principal.subject, "Session release requested");
    Json(json!({ "agentId": agent_id, "released": released }))
}
