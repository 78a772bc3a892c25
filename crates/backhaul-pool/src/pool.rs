//! The agent pool supervisor.
//!
//! One background task reconciles the set of live agents against what the
//! tracker allows and what cluster policy wants: it acquires a lease,
//! decides whether an agent is actually required, dials, and paces every
//! iteration with a linear backoff. Agent state changes arrive on an event
//! channel and are processed during every wait so they never queue behind a
//! slow iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::agent::{Agent, AgentConfig, AgentError, AgentState, StateCallback};
use crate::backoff::{BackoffConfig, LinearBackoff};
use crate::session::{
    AddrResolver, ConfigFetchError, NetworkingConfigSource, PeeringMode, ResolveError,
    ServerHandler, SessionDialer,
};
use crate::store::AgentStore;
use crate::track::{Lease, Tracker};

/// Construction-time failures. Everything after `start()` is handled with
/// backoff instead of being surfaced.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter {
        name: &'static str,
        reason: &'static str,
    },

    #[error("agent pool already started")]
    AlreadyStarted,
}

/// Configuration for [`AgentPool`].
pub struct AgentPoolConfig {
    /// Name of the cluster the proxies belong to. Logging and principal
    /// matching only.
    pub cluster: String,
    /// Identity this host presents when authenticating.
    pub host_id: String,
    pub resolver: Arc<dyn AddrResolver>,
    pub dialer: Arc<dyn SessionDialer>,
    pub server_handler: Arc<dyn ServerHandler>,
    pub networking: Arc<dyn NetworkingConfigSource>,
    /// Bonded agents to maintain when proxy peering is enabled.
    pub connection_count: usize,
    pub backoff: BackoffConfig,
    pub state_callback: Option<StateCallback>,
}

impl AgentPoolConfig {
    pub fn new(
        cluster: impl Into<String>,
        host_id: impl Into<String>,
        resolver: Arc<dyn AddrResolver>,
        dialer: Arc<dyn SessionDialer>,
        server_handler: Arc<dyn ServerHandler>,
        networking: Arc<dyn NetworkingConfigSource>,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            host_id: host_id.into(),
            resolver,
            dialer,
            server_handler,
            networking,
            connection_count: 1,
            backoff: BackoffConfig::default(),
            state_callback: None,
        }
    }

    pub fn with_connection_count(mut self, count: usize) -> Self {
        self.connection_count = count;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_state_callback(mut self, callback: StateCallback) -> Self {
        self.state_callback = Some(callback);
        self
    }

    fn validate(&self) -> Result<(), PoolError> {
        if self.cluster.is_empty() {
            return Err(PoolError::MissingParameter("cluster"));
        }
        if self.host_id.is_empty() {
            return Err(PoolError::MissingParameter("host_id"));
        }
        if self.connection_count == 0 {
            return Err(PoolError::InvalidParameter {
                name: "connection_count",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

/// Maintains the pool of reverse-tunnel agents.
pub struct AgentPool {
    config: AgentPoolConfig,
    tracker: Tracker,
    active: AgentStore<Agent>,
    events_tx: mpsc::Sender<Arc<Agent>>,
    events_rx: Mutex<Option<mpsc::Receiver<Arc<Agent>>>>,
    connected: watch::Sender<Vec<String>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    peering_enabled: AtomicBool,
}

/// Anything that can fail a single supervisor iteration.
#[derive(Debug, Error)]
enum IterationError {
    #[error("agent pool cancelled")]
    Cancelled,

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Config(#[from] ConfigFetchError),

    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl AgentPool {
    pub fn new(config: AgentPoolConfig) -> Result<Arc<Self>, PoolError> {
        config.validate()?;
        let tracker = Tracker::new(config.cluster.clone());
        let (events_tx, events_rx) = mpsc::channel(32);
        let (connected, _) = watch::channel(Vec::new());
        Ok(Arc::new(Self {
            config,
            tracker,
            active: AgentStore::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            connected,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            peering_enabled: AtomicBool::new(false),
        }))
    }

    /// Launches the supervisor in the background.
    pub fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        let mut events = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .ok_or(PoolError::AlreadyStarted)?;

        info!(
            cluster = %self.config.cluster,
            host_id = %self.config.host_id,
            "starting agent pool"
        );

        let pool = Arc::clone(self);
        self.tasks.spawn(async move {
            let mut backoff = LinearBackoff::new(pool.config.backoff.clone());
            pool.supervise(&mut events, &mut backoff).await;
            info!(cluster = %pool.config.cluster, "agent pool stopped");
            pool.cancel.cancel();
        });
        Ok(())
    }

    /// Number of agents currently held by the pool.
    pub fn count(&self) -> usize {
        self.active.len()
    }

    /// Proxy ids the pool is currently bonded to. Empty unless proxy peering
    /// is enabled.
    pub fn connected_proxies(&self) -> Vec<String> {
        self.connected.borrow().clone()
    }

    /// Watches [`Self::connected_proxies`] for changes.
    pub fn watch_connected_proxies(&self) -> watch::Receiver<Vec<String>> {
        self.connected.subscribe()
    }

    /// Cancels everything and waits until all tasks have exited and all
    /// sessions are closed. Never fails.
    pub async fn stop(&self) {
        debug!(cluster = %self.config.cluster, "stopping agent pool");
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.active.clear();
        self.connected.send_replace(Vec::new());
    }

    /// Blocks until the pool has fully wound down.
    pub async fn wait(&self) {
        self.cancel.cancelled().await;
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn supervise(
        &self,
        events: &mut mpsc::Receiver<Arc<Agent>>,
        backoff: &mut LinearBackoff,
    ) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            if let Err(err) = self.handle_iteration(events).await {
                match err {
                    IterationError::Cancelled => {
                        debug!("agent pool iteration cancelled")
                    }
                    err => debug!(error = %err, "agent pool iteration failed"),
                }
            }
            // Advanced on every iteration, success or not; the auto-reset
            // forgives it once the pool has been quiet for a while.
            backoff.inc();
            self.wait_for_backoff(events, backoff).await;
        }
    }

    /// One pass: obtain a lease, wait until policy wants an agent, then dial
    /// and register it. The lease travels into the agent on success and is
    /// dropped (released) on any failure.
    async fn handle_iteration(
        &self,
        events: &mut mpsc::Receiver<Arc<Agent>>,
    ) -> Result<(), IterationError> {
        let lease = self.wait_for_lease(events).await?;
        self.process_events(events).await?;

        let agent = self.new_agent(lease).await?;
        agent.start().await?;

        self.active.add(Arc::clone(&agent));
        self.update_connected_proxies();
        debug!(agent_id = agent.id(), active = self.active.len(), "agent added");
        Ok(())
    }

    /// Processes events while waiting for the tracker to allow an agent.
    async fn wait_for_lease(
        &self,
        events: &mut mpsc::Receiver<Arc<Agent>>,
    ) -> Result<Lease, IterationError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(IterationError::Cancelled),
                lease = self.tracker.acquire() => return Ok(lease),
                event = events.recv() => {
                    if let Some(agent) = event {
                        self.handle_event(agent);
                    }
                }
            }
        }
    }

    /// Drains queued events, then blocks until an agent is actually
    /// required, still processing events while parked.
    async fn process_events(
        &self,
        events: &mut mpsc::Receiver<Arc<Agent>>,
    ) -> Result<(), IterationError> {
        while let Ok(agent) = events.try_recv() {
            self.handle_event(agent);
        }
        if self.cancel.is_cancelled() {
            return Err(IterationError::Cancelled);
        }
        if self.is_agent_required().await {
            return Ok(());
        }

        debug!("agent not required, holding lease until policy changes");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(IterationError::Cancelled),
                event = events.recv() => {
                    if let Some(agent) = event {
                        self.handle_event(agent);
                    }
                    if self.is_agent_required().await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Re-reads cluster policy and decides whether this lease should become
    /// an agent. In peering mode the pool also prunes agents beyond the
    /// configured connection count, oldest first.
    async fn is_agent_required(&self) -> bool {
        let enabled = match self.config.networking.networking_config().await {
            Ok(config) => config.proxy_peering == PeeringMode::Enabled,
            Err(err) => {
                warn!(error = %err, "failed to refresh cluster networking config");
                false
            }
        };
        if self.peering_enabled.swap(enabled, Ordering::SeqCst) != enabled {
            debug!(proxy_peering = enabled, "proxy peering mode changed");
            self.update_connected_proxies();
        }

        if !enabled {
            return true;
        }

        self.disconnect_surplus();
        self.active.len() < self.config.connection_count
    }

    fn disconnect_surplus(&self) {
        let surplus = self.active.pop_while_over(self.config.connection_count);
        if surplus.is_empty() {
            return;
        }
        for agent in surplus {
            debug!(agent_id = agent.id(), "disconnecting surplus agent");
            agent.stop();
        }
        self.update_connected_proxies();
    }

    async fn new_agent(&self, lease: Lease) -> Result<Arc<Agent>, IterationError> {
        let networking = self.config.networking.networking_config().await?;
        let addr = self.config.resolver.resolve().await?;
        debug!(addr = %addr, lease = lease.id(), "creating agent");

        Ok(Agent::new(AgentConfig {
            addr,
            keepalive_interval: networking.keepalive_interval,
            dialer: Arc::clone(&self.config.dialer),
            handler: Arc::clone(&self.config.server_handler),
            tracker: self.tracker.clone(),
            lease,
            events: self.events_tx.clone(),
            state_callback: self.config.state_callback.clone(),
            cancel: self.cancel.child_token(),
            tasks: self.tasks.clone(),
        }))
    }

    /// Processes one agent event. Closed agents leave the store; everything
    /// else is informational.
    fn handle_event(&self, agent: Arc<Agent>) {
        if agent.state() == AgentState::Closed && self.active.remove(&agent) {
            self.update_connected_proxies();
        }
        debug!(active = self.active.len(), "processed agent event");
    }

    fn update_connected_proxies(&self) {
        let ids = if self.peering_enabled.load(Ordering::SeqCst) {
            self.active
                .snapshot()
                .iter()
                .filter_map(|agent| agent.proxy_id())
                .collect()
        } else {
            Vec::new()
        };
        debug!(proxies = ?ids, "updating connected proxies");
        self.connected.send_replace(ids);
    }

    /// Processes events while the backoff delay elapses.
    async fn wait_for_backoff(
        &self,
        events: &mut mpsc::Receiver<Arc<Agent>>,
        backoff: &LinearBackoff,
    ) {
        let sleep = tokio::time::sleep(backoff.delay());
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = &mut sleep => return,
                event = events.recv() => {
                    if let Some(agent) = event {
                        self.handle_event(agent);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::addr::TunnelAddr;
    use crate::session::{
        DialError, NetworkingConfig, ProxySession, TunnelConn,
    };

    struct NoResolver;

    #[async_trait]
    impl AddrResolver for NoResolver {
        async fn resolve(&self) -> Result<TunnelAddr, ResolveError> {
            Err(ResolveError("unconfigured".into()))
        }
    }

    struct NoDialer;

    #[async_trait]
    impl SessionDialer for NoDialer {
        async fn dial(&self, _addr: &TunnelAddr) -> Result<Box<dyn ProxySession>, DialError> {
            Err(DialError::Auth("unconfigured".into()))
        }
    }

    struct NoHandler;

    #[async_trait]
    impl ServerHandler for NoHandler {
        async fn handle_connection(&self, _conn: TunnelConn) {}
    }

    struct StaticNetworking;

    #[async_trait]
    impl NetworkingConfigSource for StaticNetworking {
        async fn networking_config(&self) -> Result<NetworkingConfig, ConfigFetchError> {
            Ok(NetworkingConfig::default())
        }
    }

    fn config() -> AgentPoolConfig {
        AgentPoolConfig::new(
            "test-cluster",
            "node-1",
            Arc::new(NoResolver),
            Arc::new(NoDialer),
            Arc::new(NoHandler),
            Arc::new(StaticNetworking),
        )
    }

    #[test]
    fn new_rejects_empty_cluster() {
        let mut cfg = config();
        cfg.cluster = String::new();
        assert!(matches!(
            AgentPool::new(cfg),
            Err(PoolError::MissingParameter("cluster"))
        ));
    }

    #[test]
    fn new_rejects_empty_host_id() {
        let mut cfg = config();
        cfg.host_id = String::new();
        assert!(matches!(
            AgentPool::new(cfg),
            Err(PoolError::MissingParameter("host_id"))
        ));
    }

    #[test]
    fn new_rejects_zero_connection_count() {
        let cfg = config().with_connection_count(0);
        assert!(matches!(
            AgentPool::new(cfg),
            Err(PoolError::InvalidParameter { .. })
        ));
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let pool = AgentPool::new(config()).unwrap();
        pool.start().unwrap();
        assert!(matches!(pool.start(), Err(PoolError::AlreadyStarted)));
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_before_start_is_clean() {
        let pool = AgentPool::new(config()).unwrap();
        pool.stop().await;
        assert_eq!(pool.count(), 0);
    }
}
