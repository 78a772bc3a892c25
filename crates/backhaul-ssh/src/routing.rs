//! Pre-dial routing discovery.
//!
//! Proxies that multiplex SSH behind their web port advertise it through a
//! small JSON document at a well-known path. The probe is a single
//! unauthenticated GET, tried over HTTPS and then plain HTTP; any failure
//! just means "dial plain SSH". The fetch is a hand-rolled HTTP/1.1 exchange
//! so the dialer does not drag in an HTTP client.

use std::sync::{Arc, Once};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use backhaul_pool::TunnelAddr;

/// Well-known path serving the routing advertisement.
pub const WELL_KNOWN_PATH: &str = "/.well-known/backhaul";

/// ALPN protocol name for tunnel traffic wrapped in TLS.
pub const REVERSE_TUNNEL_ALPN: &[u8] = b"backhaul-reversetunnel";

/// Routing advertisement returned by a proxy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingAdvert {
    /// SSH must be wrapped in TLS with [`REVERSE_TUNNEL_ALPN`].
    #[serde(default)]
    pub tls_routing_enabled: bool,
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to connect: {0}")]
    ConnectionFailed(String),

    #[error("failed to fetch routing advertisement: {0}")]
    FetchFailed(String),

    #[error("invalid routing advertisement: {0}")]
    InvalidResponse(String),

    #[error("timed out fetching routing advertisement")]
    Timeout,
}

/// Fetches [`RoutingAdvert`]s ahead of each dial.
#[derive(Debug, Clone)]
pub struct RoutingProbe {
    timeout: Duration,
}

impl RoutingProbe {
    pub fn new() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probes `addr`. Failures are normal for proxies without a web front
    /// and select the plain-SSH strategy.
    pub async fn probe(&self, addr: &TunnelAddr) -> RoutingAdvert {
        match self.fetch(addr, true).await {
            Ok(advert) => return advert,
            Err(err) => debug!(addr = %addr, error = %err, "https routing probe failed"),
        }
        match self.fetch(addr, false).await {
            Ok(advert) => return advert,
            Err(err) => debug!(addr = %addr, error = %err, "http routing probe failed"),
        }
        debug!(addr = %addr, "routing discovery failed, assuming plain ssh");
        RoutingAdvert::default()
    }

    async fn fetch(&self, addr: &TunnelAddr, tls: bool) -> Result<RoutingAdvert, ProbeError> {
        timeout(self.timeout, self.fetch_inner(addr, tls))
            .await
            .map_err(|_| ProbeError::Timeout)?
    }

    async fn fetch_inner(&self, addr: &TunnelAddr, tls: bool) -> Result<RoutingAdvert, ProbeError> {
        let stream = TcpStream::connect((addr.host(), addr.port()))
            .await
            .map_err(|e| ProbeError::ConnectionFailed(e.to_string()))?;

        if tls {
            let connector = tls_connector(None);
            let server_name = rustls::pki_types::ServerName::try_from(addr.host().to_string())
                .map_err(|e| ProbeError::ConnectionFailed(e.to_string()))?;
            let stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ProbeError::ConnectionFailed(e.to_string()))?;
            http_get(stream, addr.host()).await
        } else {
            http_get(stream, addr.host()).await
        }
    }
}

impl Default for RoutingProbe {
    fn default() -> Self {
        Self::new()
    }
}

async fn http_get<S>(stream: S, host: &str) -> Result<RoutingAdvert, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);

    let request = format!(
        "GET {WELL_KNOWN_PATH} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\nAccept: application/json\r\n\r\n"
    );
    write_half
        .write_all(request.as_bytes())
        .await
        .map_err(|e| ProbeError::FetchFailed(e.to_string()))?;

    let mut reader = BufReader::new(read_half);
    let mut status = String::new();
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| ProbeError::FetchFailed(e.to_string()))?;
        if n == 0 || line == "\r\n" {
            break;
        }
        if status.is_empty() {
            status = line.trim_end().to_string();
        } else if let Some(value) = line
            .to_ascii_lowercase()
            .strip_prefix("content-length:")
            .map(str::trim)
        {
            content_length = value.parse().ok();
        }
    }

    if !status.starts_with("HTTP/1.1 200") && !status.starts_with("HTTP/1.0 200") {
        if status.is_empty() {
            return Err(ProbeError::FetchFailed("no response".to_string()));
        }
        return Err(ProbeError::FetchFailed(format!(
            "unexpected status: {status}"
        )));
    }

    let body = match content_length {
        Some(len) => {
            let mut buf = vec![0u8; len];
            reader
                .read_exact(&mut buf)
                .await
                .map_err(|e| ProbeError::FetchFailed(e.to_string()))?;
            buf
        }
        None => {
            let mut buf = Vec::new();
            reader
                .read_to_end(&mut buf)
                .await
                .map_err(|e| ProbeError::FetchFailed(e.to_string()))?;
            buf
        }
    };

    serde_json::from_slice(&body).map_err(|e| ProbeError::InvalidResponse(e.to_string()))
}

/// TLS connector trusting the system roots, optionally pinned to an ALPN
/// protocol.
pub(crate) fn tls_connector(alpn: Option<&[u8]>) -> tokio_rustls::TlsConnector {
    ensure_crypto_provider();

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    if let Some(protocol) = alpn {
        config.alpn_protocols = vec![protocol.to_vec()];
    }

    tokio_rustls::TlsConnector::from(Arc::new(config))
}

static CRYPTO_PROVIDER_INIT: Once = Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            // Another component installed one first.
        }
    });
}
