//! Reverse-tunnel agent pool.
//!
//! A leaf host behind a restrictive network keeps outbound SSH sessions
//! open to the cluster's proxies; the proxies use those sessions to deliver
//! connections back to local services. This crate is the supervision core:
//!
//! - [`AgentPool`] decides how many sessions to hold open, creates agents,
//!   reacts to their state changes and paces reconnects with backoff.
//! - [`Tracker`] issues connection slots based on how many distinct proxies
//!   have been discovered and which of them are already bonded.
//! - [`Agent`] owns one session: connect, claim, keepalive, serve, close.
//! - [`handler_listener`] adapts inbound tunnel channels to an
//!   `accept`-style listener so a generic server can serve them.
//!
//! The wire protocol is pluggable through the [`SessionDialer`] and
//! [`ProxySession`] traits; the production SSH implementation lives in the
//! `backhaul-ssh` crate.

mod addr;
mod agent;
mod backoff;
mod listener;
mod pool;
mod session;
mod store;
mod track;

pub use addr::{AddrError, TunnelAddr};
pub use agent::{Agent, AgentState, StateCallback};
pub use backoff::BackoffConfig;
pub use listener::{
    handler_listener, HandlerListener, ReverseTunnelAddr, REVERSE_TUNNEL_NETWORK,
};
pub use pool::{AgentPool, AgentPoolConfig, PoolError};
pub use session::{
    proxy_id_from_principals, AddrResolver, ConfigFetchError, DialError, GlobalRequest,
    NetworkingConfig, NetworkingConfigSource, PeeringMode, ProxyGossip, ProxySession,
    ResolveError, ServerHandler, SessionDialer, SessionError, SessionEvent, TunnelConn,
    TunnelStream, PROXY_GOSSIP_REQUEST,
};
pub use track::{Lease, Tracker};
