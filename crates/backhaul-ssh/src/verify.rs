//! Host certificate verification.
//!
//! Proxies present host certificates rather than bare keys. Verification
//! fetches the trusted authority set at check time, so rotated authorities
//! take effect on the next dial without rebuilding the dialer. The
//! certificate's principals are captured here because they only exist on
//! certificates and must stay tied to the key that was actually validated.

use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::ssh_key::certificate::CertType;
use russh::keys::{Certificate, HashAlg, PublicKey};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
#[error("failed to load host certificate authorities: {0}")]
pub struct AuthorityError(pub String);

/// Supplies the host certificate authorities currently trusted by the
/// cluster. Only public material is ever requested.
#[async_trait]
pub trait HostAuthorities: Send + Sync {
    async fn host_certificate_authorities(&self) -> Result<Vec<PublicKey>, AuthorityError>;
}

#[derive(Debug, Error)]
pub enum HostKeyError {
    #[error(transparent)]
    Authority(#[from] AuthorityError),

    #[error("proxy presented a plain host key, a host certificate is required")]
    CertificateRequired,

    #[error("certificate is a {0} certificate, not a host certificate")]
    WrongCertType(String),

    #[error("host certificate rejected: {0}")]
    Rejected(String),
}

/// Validates proxy host certificates against the trusted authority set.
pub struct HostCertVerifier {
    authorities: Arc<dyn HostAuthorities>,
}

impl HostCertVerifier {
    pub fn new(authorities: Arc<dyn HostAuthorities>) -> Self {
        Self { authorities }
    }

    /// Checks that `cert` is a host certificate, currently valid and signed
    /// by a trusted authority, and returns its principals.
    pub async fn verify(&self, cert: &Certificate) -> Result<Vec<String>, HostKeyError> {
        if cert.cert_type() != CertType::Host {
            return Err(HostKeyError::WrongCertType(format!(
                "{:?}",
                cert.cert_type()
            )));
        }

        let authorities = self.authorities.host_certificate_authorities().await?;
        let fingerprints: Vec<_> = authorities
            .iter()
            .map(|ca| ca.fingerprint(HashAlg::Sha256))
            .collect();

        cert.validate(fingerprints.iter())
            .map_err(|e| HostKeyError::Rejected(e.to_string()))?;

        let principals = cert.valid_principals().to_vec();
        debug!(?principals, "host certificate validated");
        Ok(principals)
    }
}

/// Reinterprets a handshake-level public key as an OpenSSH certificate.
pub(crate) fn certificate_from_key(key: &PublicKey) -> Option<Certificate> {
    let encoded = key.to_openssh().ok()?;
    Certificate::from_openssh(&encoded).ok()
}
