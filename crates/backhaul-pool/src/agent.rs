//! One supervised outbound session.
//!
//! An agent dials a proxy, claims its lease with the proxy id learned from
//! the validated principals, then services the session until it dies:
//! keepalives on the cluster interval, inbound channels handed to the server
//! handler, proxy gossip folded into the tracker. State changes flow to the
//! pool over a channel; the agent never holds a pool reference.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::addr::TunnelAddr;
use crate::session::{
    proxy_id_from_principals, DialError, GlobalRequest, ProxyGossip, ProxySession, ServerHandler,
    SessionDialer, SessionEvent, PROXY_GOSSIP_REQUEST,
};
use crate::track::{Lease, Tracker};

static NEXT_AGENT_ID: AtomicU64 = AtomicU64::new(1);

/// Agent lifecycle states. Transitions are strictly one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Connecting,
    Connected,
    Closed,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentState::Connecting => f.write_str("connecting"),
            AgentState::Connected => f.write_str("connected"),
            AgentState::Closed => f.write_str("closed"),
        }
    }
}

/// Observer invoked on every agent state transition. Test hook.
pub type StateCallback = Arc<dyn Fn(&Agent) + Send + Sync>;

#[derive(Debug, Error)]
pub(crate) enum AgentError {
    #[error(transparent)]
    Dial(#[from] DialError),

    #[error("proxy {0} is already claimed by another agent")]
    ProxyClaimed(String),

    #[error("agent cancelled before connecting")]
    Cancelled,
}

pub(crate) struct AgentConfig {
    pub addr: TunnelAddr,
    pub keepalive_interval: Duration,
    pub dialer: Arc<dyn SessionDialer>,
    pub handler: Arc<dyn ServerHandler>,
    pub tracker: Tracker,
    pub lease: Lease,
    pub events: mpsc::Sender<Arc<Agent>>,
    pub state_callback: Option<StateCallback>,
    pub cancel: CancellationToken,
    pub tasks: TaskTracker,
}

pub struct Agent {
    id: u64,
    addr: TunnelAddr,
    keepalive_interval: Duration,
    dialer: Arc<dyn SessionDialer>,
    handler: Arc<dyn ServerHandler>,
    tracker: Tracker,
    lease: Mutex<Option<Lease>>,
    events: mpsc::Sender<Arc<Agent>>,
    state_callback: Option<StateCallback>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    state: Mutex<AgentState>,
    proxy_id: OnceLock<String>,
}

impl Agent {
    pub(crate) fn new(config: AgentConfig) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed),
            addr: config.addr,
            keepalive_interval: config.keepalive_interval,
            dialer: config.dialer,
            handler: config.handler,
            tracker: config.tracker,
            lease: Mutex::new(Some(config.lease)),
            events: config.events,
            state_callback: config.state_callback,
            cancel: config.cancel,
            tasks: config.tasks,
            state: Mutex::new(AgentState::Connecting),
            proxy_id: OnceLock::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().unwrap()
    }

    /// Proxy id this agent is bonded to. Set before the first `Connected`
    /// callback, never changed afterwards.
    pub fn proxy_id(&self) -> Option<String> {
        self.proxy_id.get().cloned()
    }

    /// Dials and authenticates, claims the lease, then hands the session to
    /// a background service task. An error here means no task was spawned
    /// and the lease is free again.
    pub(crate) async fn start(self: &Arc<Self>) -> Result<(), AgentError> {
        self.transition(AgentState::Connecting);

        let dialed = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            result = self.dialer.dial(&self.addr) => result.map_err(AgentError::Dial),
        };
        let mut session = match dialed {
            Ok(session) => session,
            Err(err) => {
                self.fail();
                return Err(err);
            }
        };

        if let Some(proxy_id) = proxy_id_from_principals(session.principals()) {
            let claimed = {
                let lease = self.lease.lock().unwrap();
                lease.as_ref().is_some_and(|l| l.claim(&proxy_id))
            };
            if !claimed {
                session.close().await;
                self.fail();
                return Err(AgentError::ProxyClaimed(proxy_id));
            }
            let _ = self.proxy_id.set(proxy_id);
        }

        self.transition(AgentState::Connected);
        info!(
            agent_id = self.id,
            addr = %self.addr,
            proxy = self.proxy_id().as_deref().unwrap_or("unknown"),
            "agent connected"
        );

        let agent = Arc::clone(self);
        self.tasks.spawn(async move { agent.run(session).await });
        Ok(())
    }

    /// Asks the agent to shut down. Used to prune surplus agents; pool-wide
    /// cancellation reaches the agent through its parent token.
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    async fn run(self: Arc<Self>, mut session: Box<dyn ProxySession>) {
        self.emit().await;

        let mut keepalive = tokio::time::interval(self.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        keepalive.tick().await;

        let reason = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break "cancelled",
                _ = keepalive.tick() => {
                    if let Err(err) = session.keepalive().await {
                        warn!(agent_id = self.id, error = %err, "keepalive failed");
                        break "keepalive failed";
                    }
                }
                event = session.next_event() => match event {
                    Ok(SessionEvent::ChannelOpened(conn)) => {
                        debug!(agent_id = self.id, "inbound tunnel channel");
                        let handler = Arc::clone(&self.handler);
                        let cancel = self.cancel.clone();
                        self.tasks.spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = handler.handle_connection(conn) => {}
                            }
                        });
                    }
                    Ok(SessionEvent::GlobalRequest(request)) => {
                        self.handle_global_request(request);
                    }
                    Err(err) => {
                        debug!(agent_id = self.id, error = %err, "session ended");
                        break "session error";
                    }
                }
            }
        };

        session.close().await;
        self.release_lease();
        self.transition(AgentState::Closed);
        info!(agent_id = self.id, reason, "agent closed");
        self.emit().await;
    }

    fn handle_global_request(&self, request: GlobalRequest) {
        if request.kind != PROXY_GOSSIP_REQUEST {
            debug!(agent_id = self.id, kind = %request.kind, "refusing global request");
            request.reply(false);
            return;
        }

        match serde_json::from_slice::<ProxyGossip>(&request.payload) {
            Ok(gossip) => {
                debug!(
                    agent_id = self.id,
                    proxies = ?gossip.proxies,
                    "received proxy gossip"
                );
                self.tracker.track_proxies(gossip.proxies);
                request.reply(true);
            }
            Err(err) => {
                warn!(agent_id = self.id, error = %err, "malformed proxy gossip");
                request.reply(false);
            }
        }
    }

    /// Failure before the service task ever ran: close out the state machine
    /// and free the lease. The pool sees the error synchronously, so no
    /// event is queued.
    fn fail(&self) {
        self.release_lease();
        self.transition(AgentState::Closed);
    }

    fn release_lease(&self) {
        if let Some(lease) = self.lease.lock().unwrap().take() {
            lease.release();
        }
    }

    fn transition(&self, next: AgentState) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == AgentState::Closed {
                return;
            }
            *state = next;
        }
        if let Some(callback) = &self.state_callback {
            callback(self);
        }
    }

    /// Queues this agent on the pool's event channel. Never blocks a
    /// shutting-down pool: cancellation wins the race.
    async fn emit(self: &Arc<Self>) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.events.send(Arc::clone(self)) => {}
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{} ({})", self.id, self.addr)
    }
}
