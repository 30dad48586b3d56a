//! Gateway integration tests: start a real gateway and stream over HTTP.
//!
//! Run with: `cargo test -p relaychat-gateway --test integration`

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::extract::Path;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use relaychat_core::config::Config;
use relaychat_gateway::GatewayState;
use relaychat_runtime::RuntimeError;
use relaychat_runtime::testing::{Script, ScriptedClient, ScriptedFactory};

struct TestGateway {
    port: u16,
    state: Arc<GatewayState>,
    factory: Arc<ScriptedFactory>,
    default: Arc<ScriptedClient>,
    stop: CancellationToken,
    server: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl TestGateway {
    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{path}", self.port)
    }
}

async fn serve_state(state: Arc<GatewayState>) -> (u16, CancellationToken, tokio::task::JoinHandle<anyhow::Result<()>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let stop = CancellationToken::new();
    let signal = stop.clone();
    let server = tokio::spawn(relaychat_gateway::serve(listener, state, async move {
        signal.cancelled().await
    }));
    (port, stop, server)
}

/// Start a gateway backed by the scripted runtime.
async fn start_test_gateway(config: Value, script: Script) -> TestGateway {
    let config: Config = serde_json::from_value(config).unwrap();
    let factory = Arc::new(ScriptedFactory::new(script.clone()));
    let default = Arc::new(ScriptedClient::new("default-agent", script));
    let state = Arc::new(
        GatewayState::new(Arc::new(config), factory.clone(), default.clone()).unwrap(),
    );
    let (port, stop, server) = serve_state(state.clone()).await;

    TestGateway {
        port,
        state,
        factory,
        default,
        stop,
        server,
    }
}

/// Decode the `data:` payload of every server-sent event in a body.
fn frames(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

fn frame_types(frames: &[Value]) -> Vec<&str> {
    frames.iter().map(|f| f["type"].as_str().unwrap()).collect()
}

async fn post_chat(url: String, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(url)
        .json(&body)
        .send()
        .await
        .expect("Chat request failed")
}

#[tokio::test]
async fn test_health_endpoint() {
    let gw = start_test_gateway(json!({}), Script::default()).await;

    let resp = reqwest::get(gw.url("/health"))
        .await
        .expect("Health request failed");

    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["sessions"], 0);
}

#[tokio::test]
async fn test_default_stream_sequence_and_headers() {
    let gw = start_test_gateway(json!({}), Script::default()).await;

    let resp = post_chat(gw.url("/chat/stream"), json!({ "message": "hello" })).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let headers = resp.headers().clone();
    assert!(
        headers[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
    assert_eq!(headers["x-accel-buffering"], "no");

    let body = resp.text().await.unwrap();
    assert!(body.contains("\n\n"));
    let frames = frames(&body);
    assert_eq!(
        frame_types(&frames),
        vec!["conversationId", "chunk", "chunk", "usage", "done"]
    );
    assert_eq!(frames[0]["conversationId"], "thread_scripted");
    assert_eq!(frames[1]["content"], "Hello");
    assert_eq!(frames[3]["duration"], 42.0);
    assert_eq!(frames[3]["promptTokens"], 7);
    assert_eq!(frames[3]["completionTokens"], 2);
    assert_eq!(frames[3]["totalTokens"], 9);
    assert_eq!(gw.factory.construction_count(), 0);
}

#[tokio::test]
async fn test_continued_conversation_has_no_conversation_frame() {
    let gw = start_test_gateway(json!({}), Script::default()).await;

    let resp = post_chat(
        gw.url("/chat/stream"),
        json!({ "message": "more", "conversationId": "thread_earlier" }),
    )
    .await;
    let frames = frames(&resp.text().await.unwrap());
    assert_eq!(frame_types(&frames), vec!["chunk", "chunk", "usage", "done"]);
    assert_eq!(gw.default.turns()[0].conversation_id.as_str(), "thread_earlier");
}

#[tokio::test]
async fn test_concurrent_agent_streams_share_one_session() {
    let gw = start_test_gateway(json!({}), Script::default()).await;

    let requests = (0..6).map(|i| {
        post_chat(
            gw.url("/agents/agent-x/chat/stream"),
            json!({ "message": format!("hi {i}") }),
        )
    });
    for resp in futures::future::join_all(requests).await {
        let frames = frames(&resp.text().await.unwrap());
        assert_eq!(frame_types(&frames).last(), Some(&"done"));
    }

    assert_eq!(gw.factory.construction_count(), 1);
    assert_eq!(gw.factory.built()[0].turns().len(), 6);
    assert!(gw.state.sessions().contains("agent-x"));
}

#[tokio::test]
async fn test_sentinel_agent_id_uses_default_binding() {
    let gw = start_test_gateway(json!({}), Script::default()).await;

    let resp = post_chat(gw.url("/agents/default/chat/stream"), json!({ "message": "hi" })).await;
    resp.text().await.unwrap();
    assert_eq!(gw.factory.construction_count(), 0);
    assert_eq!(gw.default.turns().len(), 1);
}

#[tokio::test]
async fn test_invalid_image_returns_problem() {
    let gw = start_test_gateway(json!({}), Script::default()).await;

    let resp = post_chat(
        gw.url("/chat/stream"),
        json!({ "message": "look", "imageAttachments": ["not-a-valid-ref"] }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        resp.headers()[header::CONTENT_TYPE],
        "application/problem+json"
    );
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], 400);
    assert_eq!(body["kind"], "client_input");
    assert!(body["detail"].as_str().unwrap().contains("data: URI"));
    assert_eq!(gw.default.conversations_created.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_mid_stream_failure_ends_with_error_frame() {
    let gw = start_test_gateway(
        json!({}),
        Script {
            fail_after_chunks: Some(RuntimeError::Timeout),
            ..Script::default()
        },
    )
    .await;

    let resp = post_chat(gw.url("/chat/stream"), json!({ "message": "hello" })).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let frames = frames(&resp.text().await.unwrap());
    assert_eq!(
        frame_types(&frames),
        vec!["conversationId", "chunk", "chunk", "error"]
    );
    assert_eq!(
        frames[3]["message"],
        "The agent service is temporarily unavailable. Please retry."
    );
}

#[tokio::test]
async fn test_development_profile_exposes_detail() {
    let gw = start_test_gateway(
        json!({ "profile": "development" }),
        Script {
            stream_error: Some(RuntimeError::Unauthorized {
                status: 401,
                message: "key expired".into(),
            }),
            ..Script::default()
        },
    )
    .await;

    let resp = post_chat(gw.url("/chat/stream"), json!({ "message": "hello" })).await;
    let frames = frames(&resp.text().await.unwrap());
    assert_eq!(frame_types(&frames), vec!["conversationId", "error"]);
    assert!(frames[1]["message"].as_str().unwrap().contains("key expired"));
}

#[tokio::test]
async fn test_deadline_cancels_silently() {
    let gw = start_test_gateway(
        json!({}),
        Script {
            hang_after_chunks: true,
            ..Script::default()
        },
    )
    .await;

    let resp = reqwest::Client::new()
        .post(gw.url("/chat/stream"))
        .header("x-request-timeout-ms", "300")
        .json(&json!({ "message": "hello" }))
        .send()
        .await
        .unwrap();
    let frames = frames(&resp.text().await.unwrap());

    assert_eq!(frame_types(&frames), vec!["conversationId", "chunk", "chunk"]);
    assert_eq!(gw.default.cancel_requests.load(Ordering::SeqCst), 1);
    assert_eq!(gw.default.usage_requests.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_token_auth() {
    let gw = start_test_gateway(
        json!({ "gateway": { "auth": { "mode": "token", "token": "letmein" } } }),
        Script::default(),
    )
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .post(gw.url("/chat/stream"))
        .json(&json!({ "message": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = client
        .post(gw.url("/chat/stream"))
        .bearer_auth("letmein")
        .json(&json!({ "message": "hello" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(frame_types(&frames(&resp.text().await.unwrap())).last(), Some(&"done"));
}

#[tokio::test]
async fn test_release_session_endpoint() {
    let gw = start_test_gateway(json!({}), Script::default()).await;

    post_chat(gw.url("/agents/agent-x/chat/stream"), json!({ "message": "hi" }))
        .await
        .text()
        .await
        .unwrap();
    assert!(gw.state.sessions().contains("agent-x"));

    let client = reqwest::Client::new();
    let body: Value = client
        .delete(gw.url("/agents/agent-x/session"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["released"], true);
    assert!(gw.factory.built()[0].is_closed());

    let body: Value = client
        .delete(gw.url("/agents/agent-x/session"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["released"], false);
}

#[tokio::test]
async fn test_shutdown_releases_sessions() {
    let gw = start_test_gateway(json!({}), Script::default()).await;

    post_chat(gw.url("/agents/agent-y/chat/stream"), json!({ "message": "hi" }))
        .await
        .text()
        .await
        .unwrap();

    gw.stop.cancel();
    tokio::time::timeout(Duration::from_secs(5), gw.server)
        .await
        .expect("server did not stop")
        .unwrap()
        .unwrap();

    assert!(gw.state.sessions().is_empty());
    assert!(gw.factory.built()[0].is_closed());
}

// --- End to end through the HTTP runtime adapter ---

const RUN_STREAM: &str = "event: thread.run.created\n\
data: {\"id\":\"run_1\",\"object\":\"thread.run\"}\n\
\n\
event: thread.message.delta\n\
data: {\"id\":\"msg_1\",\"delta\":{\"content\":[{\"index\":0,\"type\":\"text\",\"text\":{\"value\":\"Hel\"}}]}}\n\
\n\
event: thread.message.delta\n\
data: {\"id\":\"msg_1\",\"delta\":{\"content\":[{\"index\":0,\"type\":\"text\",\"text\":{\"value\":\"lo\"}}]}}\n\
\n\
event: thread.run.completed\n\
data: {\"id\":\"run_1\",\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n\
\n\
event: done\n\
data: [DONE]\n\
\n";

#[derive(Default)]
struct MockRuntime {
    threads_created: AtomicUsize,
    unauthorized: AtomicUsize,
    /// Stream runs slowly: one delta per interval.
    trickle: Option<Duration>,
}

/// A run that sends five deltas `interval` apart before completing.
fn trickled_run(interval: Duration) -> impl futures::Stream<Item = Result<String, Infallible>> {
    let mut frames = vec!["event: thread.run.created\ndata: {\"id\":\"run_slow\"}\n\n".to_string()];
    for i in 0..5 {
        frames.push(format!(
            "event: thread.message.delta\ndata: {{\"delta\":{{\"content\":[{{\"text\":{{\"value\":\"part{i} \"}}}}]}}}}\n\n"
        ));
    }
    frames.push(
        "event: thread.run.completed\ndata: {\"id\":\"run_slow\",\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":5,\"total_tokens\":8}}\n\nevent: done\ndata: [DONE]\n\n"
            .to_string(),
    );

    futures::stream::iter(frames.into_iter().enumerate()).then(move |(i, frame)| async move {
        if i > 0 {
            tokio::time::sleep(interval).await;
        }
        Ok(frame)
    })
}

fn authorized(mock: &MockRuntime, headers: &HeaderMap) -> bool {
    let ok = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        == Some("Bearer test-key");
    if !ok {
        mock.unauthorized.fetch_add(1, Ordering::SeqCst);
    }
    ok
}

async fn start_mock_runtime(trickle: Option<Duration>) -> (String, Arc<MockRuntime>) {
    let mock = Arc::new(MockRuntime {
        trickle,
        ..Default::default()
    });

    let assistants = {
        let mock = mock.clone();
        move |headers: HeaderMap| async move {
            if !authorized(&mock, &headers) {
                return StatusCode::UNAUTHORIZED.into_response();
            }
            axum::Json(json!({ "data": [{ "id": "asst_1", "name": "Helper", "model": "gpt-test" }] }))
                .into_response()
        }
    };
    let assistant = {
        let mock = mock.clone();
        move |Path(id): Path<String>, headers: HeaderMap| async move {
            if !authorized(&mock, &headers) {
                return StatusCode::UNAUTHORIZED.into_response();
            }
            if id == "asst_1" || id == "asst_2" {
                axum::Json(json!({ "id": id, "name": "Helper" })).into_response()
            } else {
                (
                    StatusCode::NOT_FOUND,
                    axum::Json(json!({ "error": { "message": "No assistant found" } })),
                )
                    .into_response()
            }
        }
    };
    let threads = {
        let mock = mock.clone();
        move || async move {
            mock.threads_created.fetch_add(1, Ordering::SeqCst);
            axum::Json(json!({ "id": "thread_mock" }))
        }
    };

    let runs = {
        let mock = mock.clone();
        move || async move {
            let body = match mock.trickle {
                Some(interval) => Body::from_stream(trickled_run(interval)),
                None => Body::from(RUN_STREAM),
            };
            ([(header::CONTENT_TYPE, "text/event-stream")], body)
        }
    };

    let app = axum::Router::new()
        .route("/v1/assistants", get(assistants))
        .route("/v1/assistants/{id}", get(assistant))
        .route("/v1/threads", post(threads))
        .route(
            "/v1/threads/{thread_id}/messages",
            post(|| async { axum::Json(json!({ "id": "msg_1" })) }),
        )
        .route("/v1/threads/{thread_id}/runs", post(runs));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    (format!("http://127.0.0.1:{port}/v1"), mock)
}

async fn start_http_gateway() -> (u16, Arc<MockRuntime>, Arc<GatewayState>) {
    start_http_gateway_with(None, 10).await
}

async fn start_http_gateway_with(
    trickle: Option<Duration>,
    timeout_secs: u64,
) -> (u16, Arc<MockRuntime>, Arc<GatewayState>) {
    let (endpoint, mock) = start_mock_runtime(trickle).await;
    let config: Config = serde_json::from_value(json!({
        "runtime": {
            "endpoint": endpoint,
            "api_key": "test-key",
            "default_agent_id": "asst_1",
            "request_timeout_secs": timeout_secs
        }
    }))
    .unwrap();
    let state = Arc::new(GatewayState::from_config(Arc::new(config)).unwrap());
    let (port, _stop, _server) = serve_state(state.clone()).await;
    (port, mock, state)
}

#[tokio::test]
async fn test_http_runtime_end_to_end() {
    let (port, mock, _state) = start_http_gateway().await;

    let resp = post_chat(
        format!("http://127.0.0.1:{port}/chat/stream"),
        json!({ "message": "hello" }),
    )
    .await;
    let frames = frames(&resp.text().await.unwrap());

    assert_eq!(
        frame_types(&frames),
        vec!["conversationId", "chunk", "chunk", "usage", "done"]
    );
    assert_eq!(frames[0]["conversationId"], "thread_mock");
    assert_eq!(frames[1]["content"], "Hel");
    assert_eq!(frames[2]["content"], "lo");
    assert_eq!(frames[3]["promptTokens"], 5);
    assert_eq!(frames[3]["totalTokens"], 7);
    assert!(frames[3]["duration"].as_f64().unwrap() >= 0.0);
    assert_eq!(mock.threads_created.load(Ordering::SeqCst), 1);
    assert_eq!(mock.unauthorized.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_http_runtime_slow_stream_outlives_request_timeout() {
    // Deltas arrive 400ms apart for 2s; the request timeout is 1s.
    let (port, _mock, _state) = start_http_gateway_with(Some(Duration::from_millis(400)), 1).await;

    let resp = post_chat(
        format!("http://127.0.0.1:{port}/chat/stream"),
        json!({ "message": "take your time" }),
    )
    .await;
    let frames = frames(&resp.text().await.unwrap());

    assert_eq!(
        frame_types(&frames),
        vec!["conversationId", "chunk", "chunk", "chunk", "chunk", "chunk", "usage", "done"]
    );
    assert_eq!(frames[5]["content"], "part4 ");
    assert_eq!(frames[6]["totalTokens"], 8);
}

#[tokio::test]
async fn test_http_runtime_unknown_agent_is_redacted_problem() {
    let (port, _mock, state) = start_http_gateway().await;

    let resp = post_chat(
        format!("http://127.0.0.1:{port}/agents/asst_missing/chat/stream"),
        json!({ "message": "hello" }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["kind"], "upstream_auth");
    assert!(!body["detail"].as_str().unwrap().contains("asst_missing"));
    assert!(!state.sessions().contains("asst_missing"));

    let resp = post_chat(
        format!("http://127.0.0.1:{port}/agents/asst_2/chat/stream"),
        json!({ "message": "hello" }),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    resp.text().await.unwrap();
    assert!(state.sessions().contains("asst_2"));
}

#[tokio::test]
async fn test_http_runtime_agent_listing() {
    let (port, _mock, _state) = start_http_gateway().await;

    let body: Value = reqwest::get(format!("http://127.0.0.1:{port}/agents"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["agents"][0]["id"], "asst_1");
    assert_eq!(body["agents"][0]["model"], "gpt-test");

    let body: Value = reqwest::get(format!("http://127.0.0.1:{port}/agents/asst_1"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["name"], "Helper");

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/agents/nope"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
