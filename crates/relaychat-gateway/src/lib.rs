//! Streaming chat gateway.
//!
//! Accepts chat requests over HTTP, resolves the runtime client for the
//! addressed agent (the configured default, or a cached per-agent session),
//! and relays the agent's reply to the caller as server-sent events.

pub mod auth;
pub mod chat;
pub mod framer;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod problem;
pub mod server;
pub mod session_cache;
pub mod state;

pub use chat::{ChatStreamGateway, PreparedChat, StreamOutcome};
pub use framer::StreamFramer;
pub use problem::{ErrorTranslator, ProblemDetails};
pub use server::{router, serve, start_gateway};
pub use session_cache::{AgentSessionCache, SessionInitError};
pub use state::GatewayState;
