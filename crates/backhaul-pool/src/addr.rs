//! Proxy address type shared by the resolver, dialer and pool.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors produced when parsing a tunnel address
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddrError {
    #[error("invalid tunnel address '{0}': expected host:port")]
    MissingPort(String),

    #[error("invalid port '{port}' in tunnel address '{addr}'")]
    InvalidPort { addr: String, port: String },

    #[error("empty host in tunnel address '{0}'")]
    EmptyHost(String),
}

/// Network address of a proxy endpoint.
///
/// Displays as `host:port`; IPv6 hosts are bracketed so the string round-trips
/// through the parser.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelAddr {
    host: String,
    port: u16,
}

impl TunnelAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for TunnelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for TunnelAddr {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Tolerate a scheme prefix so resolver-supplied URLs keep working.
        let trimmed = s
            .trim_start_matches("tcp://")
            .trim_start_matches("ssh://")
            .trim_start_matches("https://")
            .trim_start_matches("http://");

        let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
            let (host, rest) = rest
                .split_once(']')
                .ok_or_else(|| AddrError::MissingPort(s.to_string()))?;
            let port = rest
                .strip_prefix(':')
                .ok_or_else(|| AddrError::MissingPort(s.to_string()))?;
            (host, port)
        } else {
            trimmed
                .rsplit_once(':')
                .ok_or_else(|| AddrError::MissingPort(s.to_string()))?
        };

        if host.is_empty() {
            return Err(AddrError::EmptyHost(s.to_string()));
        }

        let port = port.parse::<u16>().map_err(|_| AddrError::InvalidPort {
            addr: s.to_string(),
            port: port.to_string(),
        })?;

        Ok(Self::new(host, port))
    }
}
