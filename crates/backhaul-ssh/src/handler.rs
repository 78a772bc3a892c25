//! russh client handler for tunnel sessions.

use std::sync::{Arc, Mutex};

use russh::client::{self, Msg};
use russh::Channel;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use backhaul_pool::{SessionEvent, TunnelConn};
use russh::keys::PublicKey;

use crate::verify::{certificate_from_key, HostCertVerifier, HostKeyError};

#[derive(Debug, Error)]
pub enum SshClientError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    HostKey(#[from] HostKeyError),
}

/// Client-side handler: validates the proxy's host certificate and turns
/// server-opened channels into session events.
pub struct ReverseHandler {
    verifier: HostCertVerifier,
    /// Principals captured during host key verification, read by the dialer
    /// once the handshake completes.
    principals: Arc<Mutex<Vec<String>>>,
    events: mpsc::Sender<SessionEvent>,
}

impl ReverseHandler {
    pub(crate) fn new(
        verifier: HostCertVerifier,
        principals: Arc<Mutex<Vec<String>>>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            verifier,
            principals,
            events,
        }
    }
}

impl client::Handler for ReverseHandler {
    type Error = SshClientError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let cert =
            certificate_from_key(server_public_key).ok_or(HostKeyError::CertificateRequired)?;
        let principals = self.verifier.verify(&cert).await?;
        *self.principals.lock().unwrap() = principals;
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            origin = %format!("{originator_address}:{originator_port}"),
            target = %format!("{connected_address}:{connected_port}"),
            "proxy opened a tunnel channel"
        );
        let conn: TunnelConn = Box::new(channel.into_stream());
        if self
            .events
            .send(SessionEvent::ChannelOpened(conn))
            .await
            .is_err()
        {
            debug!("session event receiver gone, dropping channel");
        }
        Ok(())
    }
}
