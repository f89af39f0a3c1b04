//! Certificate authority client
//!
//! The engine talks to the ACME side through [`CertificateAuthority`]. The
//! production implementation is [`CertbotClient`], which shells out to
//! Certbot and reads PEM material from its `live/` directory.

mod certbot;

pub use certbot::{read_live_dir, CertbotClient, CertbotSettings};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use certsync_common::{CertName, DomainGroup};

use crate::error::AuthorityError;

/// A certificate currently known to the authority client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedCertificate {
    /// Canonical certificate name (`--cert-name`)
    pub name: CertName,
    /// Hostnames covered by the certificate
    pub domains: Vec<String>,
}

/// Operations the reconciliation engine needs from an ACME client.
///
/// Implementations report failures as [`AuthorityError`] values and never
/// panic; a failed request for one name must not affect requests for others.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Request (or re-request) a certificate covering `group`, named after
    /// its canonical name. Overwrites an existing certificate of that name.
    async fn request_certificate(&self, group: &DomainGroup) -> Result<(), AuthorityError>;

    /// Remove a certificate.
    ///
    /// Returns [`AuthorityError::NotFound`] when the certificate is already
    /// absent, which callers treat as success worth auditing.
    async fn remove_certificate(&self, name: &CertName) -> Result<(), AuthorityError>;

    /// List certificates with the hostnames they cover.
    ///
    /// An empty list is a valid inventory.
    async fn list_certificates(&self) -> Result<Vec<IssuedCertificate>, AuthorityError>;

    /// List canonical names of known certificates.
    async fn list_certificate_names(&self) -> Result<Vec<CertName>, AuthorityError> {
        Ok(self
            .list_certificates()
            .await?
            .into_iter()
            .map(|cert| cert.name)
            .collect())
    }

    /// Read the certificate chain followed by the private key.
    ///
    /// Returns `None` when no material exists for `name`.
    async fn read_certificate_data(&self, name: &CertName)
        -> Result<Option<Vec<u8>>, AuthorityError>;
}
