//! The SSH dialer: one-shot procedure from address to authenticated session.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use backhaul_pool::{DialError, ProxySession, SessionDialer, TunnelAddr};

use crate::handler::{ReverseHandler, SshClientError};
use crate::routing::{tls_connector, RoutingProbe};
use crate::session::SshSession;
use crate::verify::{HostAuthorities, HostCertVerifier};

/// One way of authenticating to a proxy. Strategies are tried in order
/// until one of them yields an authenticated session.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn authenticate(
        &self,
        handle: &mut Handle<ReverseHandler>,
        username: &str,
    ) -> Result<bool, SshClientError>;
}

/// Public key authentication with the host's keypair.
pub struct PublicKeyAuth {
    key: PrivateKeyWithHashAlg,
}

impl PublicKeyAuth {
    pub fn new(key: PrivateKey) -> Self {
        // RSA keys must use SHA-512 signatures; other algorithms sign with
        // their native scheme.
        let hash_alg = if key.algorithm().is_rsa() {
            Some(HashAlg::Sha512)
        } else {
            None
        };
        Self {
            key: PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
        }
    }
}

#[async_trait]
impl AuthStrategy for PublicKeyAuth {
    async fn authenticate(
        &self,
        handle: &mut Handle<ReverseHandler>,
        username: &str,
    ) -> Result<bool, SshClientError> {
        let result = handle
            .authenticate_publickey(username, self.key.clone())
            .await?;
        Ok(result.success())
    }
}

#[derive(Debug, Error)]
enum AttemptError {
    #[error("{0}")]
    Dial(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    HostKey(String),
}

/// Dials proxies over SSH, optionally wrapped in TLS when the proxy
/// advertises TLS routing.
pub struct SshDialer {
    username: String,
    auth: Vec<Arc<dyn AuthStrategy>>,
    authorities: Arc<dyn HostAuthorities>,
    connect_timeout: Duration,
    keepalive_interval: Duration,
    probe: RoutingProbe,
}

impl SshDialer {
    pub fn new(username: impl Into<String>, authorities: Arc<dyn HostAuthorities>) -> Self {
        Self {
            username: username.into(),
            auth: Vec::new(),
            authorities,
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(60),
            probe: RoutingProbe::new(),
        }
    }

    /// Appends an authentication strategy.
    pub fn with_auth(mut self, strategy: Arc<dyn AuthStrategy>) -> Self {
        self.auth.push(strategy);
        self
    }

    /// Convenience for the common public-key setup.
    pub fn with_host_key(self, key: PrivateKey) -> Self {
        self.with_auth(Arc::new(PublicKeyAuth::new(key)))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Interval for the transport-level keepalive.
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_probe(mut self, probe: RoutingProbe) -> Self {
        self.probe = probe;
        self
    }

    async fn try_dial(
        &self,
        addr: &TunnelAddr,
        tls_routing: bool,
        strategy: &dyn AuthStrategy,
    ) -> Result<SshSession, AttemptError> {
        let stream = open_transport(addr)
            .await
            .map_err(|e| AttemptError::Dial(e.to_string()))?;

        let config = Arc::new(client::Config {
            keepalive_interval: Some(self.keepalive_interval),
            keepalive_max: 3,
            ..Default::default()
        });

        let (events_tx, events_rx) = mpsc::channel(32);
        let principals = Arc::new(Mutex::new(Vec::new()));
        let handler = ReverseHandler::new(
            HostCertVerifier::new(Arc::clone(&self.authorities)),
            Arc::clone(&principals),
            events_tx,
        );

        let connected = if tls_routing {
            debug!(addr = %addr, "wrapping ssh in tls routing");
            let server_name = rustls::pki_types::ServerName::try_from(addr.host().to_string())
                .map_err(|e| AttemptError::Dial(e.to_string()))?;
            let tls = tls_connector(Some(crate::routing::REVERSE_TUNNEL_ALPN))
                .connect(server_name, stream)
                .await
                .map_err(|e| AttemptError::Dial(e.to_string()))?;
            client::connect_stream(config, tls, handler).await
        } else {
            client::connect_stream(config, stream, handler).await
        };

        let mut handle = connected.map_err(|e| match e {
            SshClientError::HostKey(err) => AttemptError::HostKey(err.to_string()),
            SshClientError::Ssh(err) => AttemptError::Dial(err.to_string()),
        })?;

        let authenticated = strategy
            .authenticate(&mut handle, &self.username)
            .await
            .map_err(|e| AttemptError::Auth(e.to_string()))?;
        if !authenticated {
            return Err(AttemptError::Auth(
                "authentication rejected by proxy".into(),
            ));
        }

        let principals = principals.lock().unwrap().clone();
        debug!(addr = %addr, ?principals, "ssh session established");
        Ok(SshSession::new(handle, principals, events_rx))
    }
}

#[async_trait]
impl SessionDialer for SshDialer {
    async fn dial(&self, addr: &TunnelAddr) -> Result<Box<dyn ProxySession>, DialError> {
        if self.auth.is_empty() {
            return Err(DialError::Auth("no authentication strategies".into()));
        }

        let advert = self.probe.probe(addr).await;

        let mut last = AttemptError::Auth("no authentication strategies".into());
        for strategy in &self.auth {
            // One deadline covers transport, handshake and authentication.
            let attempt = timeout(
                self.connect_timeout,
                self.try_dial(addr, advert.tls_routing_enabled, strategy.as_ref()),
            )
            .await
            .unwrap_or_else(|_| Err(AttemptError::Dial("dial timed out".into())));

            match attempt {
                Ok(session) => return Ok(Box::new(session)),
                Err(err) => {
                    debug!(addr = %addr, error = %err, "dial attempt failed");
                    last = err;
                }
            }
        }

        // All strategies failed; report the last cause with its class.
        Err(match last {
            AttemptError::HostKey(reason) => DialError::HostKey(reason),
            AttemptError::Dial(reason) => DialError::Dial {
                addr: addr.to_string(),
                reason,
            },
            AttemptError::Auth(reason) => {
                DialError::Auth(format!("all auth methods failed: {reason}"))
            }
        })
    }
}

/// Opens the TCP transport, honoring HTTP proxy environment variables.
async fn open_transport(addr: &TunnelAddr) -> io::Result<TcpStream> {
    match proxy_from_env() {
        Some(proxy) => {
            debug!(proxy = %proxy, target = %addr, "dialing through http proxy");
            connect_via_proxy(&proxy, addr).await
        }
        None => TcpStream::connect((addr.host(), addr.port())).await,
    }
}

fn proxy_from_env() -> Option<TunnelAddr> {
    ["HTTPS_PROXY", "https_proxy", "HTTP_PROXY", "http_proxy"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.is_empty())
        .and_then(|value| value.parse().ok())
}

/// Issues an HTTP CONNECT through `proxy` and hands back the raw stream.
async fn connect_via_proxy(proxy: &TunnelAddr, target: &TunnelAddr) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect((proxy.host(), proxy.port())).await?;
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await?;

    // Read the response head byte-wise so nothing past the blank line is
    // consumed from the tunneled stream.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 4096 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized proxy response",
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed during connect",
            ));
        }
        head.push(byte[0]);
    }

    let status = String::from_utf8_lossy(&head);
    let status_line = status.lines().next().unwrap_or_default();
    if !status_line.contains(" 200") {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!("proxy refused connect: {status_line}"),
        ));
    }
    Ok(stream)
}
