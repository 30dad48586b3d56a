//! Per-agent runtime client cache with single-flight construction.
//!
//! Each agent id maps to one shared construction future. The first caller for
//! a key inserts it under the shard lock; every concurrent caller awaits the
//! same future and receives the same client (or the same error). A failed
//! construction is removed so the next caller retries.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relaychat_runtime::{AgentClientFactory, AgentRuntimeClient};

/// Construction of an agent session failed. Cloned to every waiter.
#[derive(Debug, Clone)]
pub struct SessionInitError {
    agent_id: String,
    source: Arc<anyhow::Error>,
}

impl SessionInitError {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl std::fmt::Display for SessionInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to initialise session for agent '{}'", self.agent_id)
    }
}

impl std::error::Error for SessionInitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        let inner: &(dyn std::error::Error + 'static) = (*self.source).as_ref();
        Some(inner)
    }
}

type ClientResult = Result<Arc<dyn AgentRuntimeClient>, SessionInitError>;

struct SessionEntry {
    client: Shared<BoxFuture<'static, ClientResult>>,
    /// Milliseconds since the cache epoch.
    last_used: AtomicU64,
}

impl SessionEntry {
    fn ready(&self) -> Option<&Arc<dyn AgentRuntimeClient>> {
        match self.client.peek() {
            Some(Ok(client)) => Some(client),
            _ => None,
        }
    }
}

/// Keyed store of live runtime clients, one per agent id.
pub struct AgentSessionCache {
    factory: Arc<dyn AgentClientFactory>,
    entries: DashMap<String, Arc<SessionEntry>>,
    epoch: Instant,
}

impl AgentSessionCache {
    pub fn new(factory: Arc<dyn AgentClientFactory>) -> Self {
        Self {
            factory,
            entries: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    /// Return the client for `agent_id`, constructing it if absent.
    ///
    /// Concurrent callers for the same key share one construction. On failure
    /// every waiter receives the error and the entry is dropped.
    pub async fn get_or_create(&self, agent_id: &str) -> ClientResult {
        // The read guard must be gone before `insert_pending` locks the shard.
        let existing = self.entries.get(agent_id).map(|e| e.value().clone());
        let entry = match existing {
            Some(entry) => entry,
            None => self.insert_pending(agent_id),
        };
        entry.last_used.store(self.now_ms(), Ordering::Relaxed);

        match entry.client.clone().await {
            Ok(client) => Ok(client),
            Err(e) => {
                // Only drop the entry we awaited; a retry may already have replaced it.
                let removed = self
                    .entries
                    .remove_if(agent_id, |_, current| Arc::ptr_eq(current, &entry))
                    .is_some();
                if removed {
                    warn!(agent_id, error = %e.source, "Agent session construction failed");
                    self.record_size();
                }
                Err(e)
            }
        }
    }

    fn insert_pending(&self, agent_id: &str) -> Arc<SessionEntry> {
        match self.entries.entry(agent_id.to_string()) {
            Entry::Occupied(occupied) => occupied.get().clone(),
            Entry::Vacant(vacant) => {
                let factory = self.factory.clone();
                let id = agent_id.to_string();
                let construction = async move {
                    debug!(agent_id = %id, "Constructing agent session");
                    match factory.connect(&id).await {
                        Ok(client) => {
                            info!(agent_id = %id, "Agent session ready");
                            #[cfg(feature = "metrics")]
                            crate::metrics::record_session_created();
                            Ok(client)
                        }
                        Err(e) => Err(SessionInitError {
                            agent_id: id,
                            source: Arc::new(e),
                        }),
                    }
                }
                .boxed()
                .shared();

                let entry = Arc::new(SessionEntry {
                    client: construction,
                    last_used: AtomicU64::new(self.now_ms()),
                });
                vacant.insert(entry.clone());
                self.record_size();
                entry
            }
        }
    }

    /// Remove and dispose the session for `agent_id`. Returns whether an
    /// entry existed; releasing an unknown key is a no-op.
    ///
    /// Requests already holding the client keep using it. A construction still
    /// in flight completes for its waiters but is no longer cached, and its
    /// client is closed as soon as it is ready.
    pub async fn release(&self, agent_id: &str) -> bool {
        let Some((_, entry)) = self.entries.remove(agent_id) else {
            return false;
        };
        self.record_size();
        match entry.ready() {
            Some(client) => client.close().await,
            None => {
                let construction = entry.client.clone();
                let id = agent_id.to_string();
                tokio::spawn(async move {
                    if let Ok(client) = construction.await {
                        client.close().await;
                        debug!(agent_id = %id, "Closed session released during construction");
                    }
                });
            }
        }
        info!(agent_id, "Agent session released");
        true
    }

    /// Release every cached session. Used at shutdown.
    pub async fn release_all(&self) -> usize {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut released = 0;
        for key in keys {
            if self.release(&key).await {
                released += 1;
            }
        }
        released
    }

    /// Dispose ready sessions unused for at least `ttl`. Pending
    /// constructions are never evicted.
    pub async fn evict_idle(&self, ttl: Duration) -> usize {
        let now = self.now_ms();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let is_idle = |entry: &SessionEntry| {
            entry.ready().is_some()
                && now.saturating_sub(entry.last_used.load(Ordering::Relaxed)) >= ttl_ms
        };

        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|e| is_idle(e.value().as_ref()))
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = 0;
        for key in candidates {
            // Re-check under the shard lock; the entry may have been used since.
            if let Some((_, entry)) = self.entries.remove_if(&key, |_, e| is_idle(e.as_ref())) {
                if let Some(client) = entry.ready() {
                    client.close().await;
                }
                debug!(agent_id = %key, "Evicted idle agent session");
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.record_size();
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        ttl: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = cache.evict_idle(ttl).await;
                        if evicted > 0 {
                            info!(evicted, remaining = cache.len(), "Idle agent sessions evicted");
                        }
                    }
                }
            }
        })
    }

    /// Number of cached entries, pending constructions included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.entries.contains_key(agent_id)
    }

    /// The ready client for `agent_id`, without constructing one.
    pub fn peek(&self, agent_id: &str) -> Option<Arc<dyn AgentRuntimeClient>> {
        self.entries.get(agent_id).and_then(|e| e.ready().cloned())
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn record_size(&self) {
        #[cfg(feature = "metrics")]
        crate::metrics::set_sessions_cached(self.entries.len());
    }
}
