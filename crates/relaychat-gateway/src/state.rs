//! Gateway shared state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use relaychat_core::config::Config;
use relaychat_runtime::{AgentClientFactory, AgentRuntimeClient, HttpClientFactory};

use crate::auth::AuthPolicy;
use crate::chat::ChatStreamGateway;
use crate::problem::ErrorTranslator;
use crate::session_cache::AgentSessionCache;

/// Shared gateway state accessible from all handlers.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub gateway: Arc<ChatStreamGateway>,
    pub auth: AuthPolicy,
    pub started_at: Instant,
    /// Cancelled when the server begins shutting down; every stream's token
    /// is a child of it.
    pub shutdown: CancellationToken,
    #[cfg(feature = "metrics")]
    pub metrics: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl GatewayState {
    /// Assemble state from an explicit factory and default client.
    pub fn new(
        config: Arc<Config>,
        factory: Arc<dyn AgentClientFactory>,
        default_client: Arc<dyn AgentRuntimeClient>,
    ) -> anyhow::Result<Self> {
        let auth = AuthPolicy::from_config(&config)?;
        let sessions = Arc::new(AgentSessionCache::new(factory));
        let gateway = ChatStreamGateway::new(
            sessions,
            default_client,
            config.chat_limits(),
            ErrorTranslator::new(config.profile),
        );

        Ok(Self {
            config,
            gateway: Arc::new(gateway),
            auth,
            started_at: Instant::now(),
            shutdown: CancellationToken::new(),
            #[cfg(feature = "metrics")]
            metrics: None,
        })
    }

    /// Build state that talks to the runtime configured in `config`.
    pub fn from_config(config: Arc<Config>) -> anyhow::Result<Self> {
        let runtime = config.runtime();
        let timeout = Duration::from_secs(config.runtime_timeout_secs());
        let factory = HttpClientFactory::new(&runtime, timeout)?;

        let default_agent_id = runtime
            .default_agent_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .context("runtime.default_agent_id is not set")?;
        let default_client = Arc::new(factory.bind(default_agent_id));

        Self::new(config, Arc::new(factory), default_client)
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn sessions(&self) -> &Arc<AgentSessionCache> {
        self.gateway.sessions()
    }
}
