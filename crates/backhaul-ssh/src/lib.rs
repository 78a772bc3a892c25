//! SSH transport for the reverse-tunnel agent pool.
//!
//! Implements the `backhaul-pool` dialer seam with russh: probe the proxy
//! for TLS routing, connect (optionally through an HTTP proxy and a TLS
//! wrap), validate the proxy's host certificate against the cluster's
//! authorities, authenticate, and expose the session's inbound channels as
//! pool events.

mod dialer;
mod handler;
mod routing;
mod session;
mod verify;

pub use dialer::{AuthStrategy, PublicKeyAuth, SshDialer};
pub use handler::{ReverseHandler, SshClientError};
pub use routing::{
    ProbeError, RoutingAdvert, RoutingProbe, REVERSE_TUNNEL_ALPN, WELL_KNOWN_PATH,
};
pub use session::SshSession;
pub use verify::{AuthorityError, HostAuthorities, HostCertVerifier, HostKeyError};
