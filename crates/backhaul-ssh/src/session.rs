//! [`ProxySession`] implementation backed by a russh client handle.

use async_trait::async_trait;
use russh::client::Handle;
use russh::Disconnect;
use tokio::sync::mpsc;
use tracing::debug;

use backhaul_pool::{ProxySession, SessionError, SessionEvent};

use crate::handler::ReverseHandler;

/// An authenticated SSH session to one proxy.
///
/// Wire-level keepalives run inside the russh transport on the configured
/// interval; [`ProxySession::keepalive`] reports whether the transport has
/// given up on the peer.
pub struct SshSession {
    handle: Handle<ReverseHandler>,
    principals: Vec<String>,
    events: mpsc::Receiver<SessionEvent>,
}

impl SshSession {
    pub(crate) fn new(
        handle: Handle<ReverseHandler>,
        principals: Vec<String>,
        events: mpsc::Receiver<SessionEvent>,
    ) -> Self {
        Self {
            handle,
            principals,
            events,
        }
    }
}

#[async_trait]
impl ProxySession for SshSession {
    fn principals(&self) -> &[String] {
        &self.principals
    }

    async fn next_event(&mut self) -> Result<SessionEvent, SessionError> {
        // The sender side lives in the connection handler; it goes away when
        // the transport dies.
        self.events.recv().await.ok_or(SessionError::Closed)
    }

    async fn keepalive(&mut self) -> Result<(), SessionError> {
        if self.handle.is_closed() {
            return Err(SessionError::Keepalive("ssh transport closed".into()));
        }
        Ok(())
    }

    async fn close(&mut self) {
        debug!("disconnecting ssh session");
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "agent closing", "")
            .await;
    }
}
