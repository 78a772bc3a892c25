//! Trait seams between the pool and its collaborators.
//!
//! The pool core never touches a concrete transport. A [`SessionDialer`]
//! produces authenticated [`ProxySession`]s, sessions surface inbound channel
//! opens and global requests as [`SessionEvent`]s, and accepted channels are
//! handed to a [`ServerHandler`]. Production implementations live in the
//! `backhaul-ssh` crate; tests supply mocks.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;

use crate::addr::TunnelAddr;

/// A byte stream delivered over a tunnel session.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

/// Boxed tunnel stream as handed to a [`ServerHandler`].
pub type TunnelConn = Box<dyn TunnelStream>;

/// Global request type a proxy uses to announce its peers.
pub const PROXY_GOSSIP_REQUEST: &str = "cluster-proxies";

/// Payload of a [`PROXY_GOSSIP_REQUEST`] global request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyGossip {
    pub proxies: Vec<String>,
}

/// A global request received on a session.
///
/// `reply` is present when the sender asked for an acknowledgement; dropping
/// it without sending counts as a refusal.
pub struct GlobalRequest {
    pub kind: String,
    pub payload: Vec<u8>,
    pub reply: Option<oneshot::Sender<bool>>,
}

impl GlobalRequest {
    pub(crate) fn reply(mut self, accepted: bool) {
        if let Some(tx) = self.reply.take() {
            let _ = tx.send(accepted);
        }
    }
}

/// Something the remote side initiated on an established session.
pub enum SessionEvent {
    /// The proxy opened a channel to deliver a connection back to us.
    ChannelOpened(TunnelConn),
    /// The proxy sent a session-wide request.
    GlobalRequest(GlobalRequest),
}

/// Mid-session transport failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session closed by peer")]
    Closed,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("keepalive failed: {0}")]
    Keepalive(String),
}

/// An authenticated full-duplex session to one proxy.
///
/// Created exclusively by a [`SessionDialer`]; owned by exactly one agent.
/// `principals` are the identity strings validated during the handshake and
/// are fixed for the lifetime of the session.
#[async_trait]
pub trait ProxySession: Send {
    fn principals(&self) -> &[String];

    /// Next remote-initiated event. Errors are terminal for the session.
    async fn next_event(&mut self) -> Result<SessionEvent, SessionError>;

    /// Liveness check driven by the agent's keepalive clock.
    async fn keepalive(&mut self) -> Result<(), SessionError>;

    async fn close(&mut self);
}

/// Per-dial failure classification.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("failed to dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("host key verification failed: {0}")]
    HostKey(String),

    #[error("dial cancelled")]
    Cancelled,
}

/// One-shot procedure producing an authenticated session to one address.
#[async_trait]
pub trait SessionDialer: Send + Sync {
    async fn dial(&self, addr: &TunnelAddr) -> Result<Box<dyn ProxySession>, DialError>;
}

/// Sink for connections delivered back through a tunnel.
///
/// `handle_connection` owns the connection for as long as it is in use.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    async fn handle_connection(&self, conn: TunnelConn);
}

#[derive(Debug, Error)]
#[error("failed to resolve proxy address: {0}")]
pub struct ResolveError(pub String);

/// Returns the current address agents should dial.
#[async_trait]
pub trait AddrResolver: Send + Sync {
    async fn resolve(&self) -> Result<TunnelAddr, ResolveError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeeringMode {
    Enabled,
    Disabled,
}

/// Cluster networking settings the pool re-reads while running.
#[derive(Debug, Clone)]
pub struct NetworkingConfig {
    pub proxy_peering: PeeringMode,
    pub keepalive_interval: Duration,
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        Self {
            proxy_peering: PeeringMode::Disabled,
            keepalive_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to read cluster networking config: {0}")]
pub struct ConfigFetchError(pub String);

/// Source of [`NetworkingConfig`], typically a cache in front of the cluster
/// control plane. Read per pool iteration and per agent construction.
#[async_trait]
pub trait NetworkingConfigSource: Send + Sync {
    async fn networking_config(&self) -> Result<NetworkingConfig, ConfigFetchError>;
}

/// Extracts the proxy id from validated principals.
///
/// Proxies encode their identity as the principal `<proxy-id>.<cluster-name>`;
/// the first dot-segment of the first such principal is the id.
pub fn proxy_id_from_principals(principals: &[String]) -> Option<String> {
    let first = principals.first()?;
    let (id, rest) = first.split_once('.')?;
    if id.is_empty() || rest.is_empty() {
        return None;
    }
    Some(id.to_string())
}
