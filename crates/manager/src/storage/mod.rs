//! Certificate storage backends
//!
//! Storage holds one PEM bundle (certificate chain followed by private key)
//! per canonical certificate name. It is how issued material reaches
//! consumers such as load balancers.
//!
//! - [`ConsulCertificateStorage`]: keys under a Consul KV prefix
//! - [`DirectoryCertificateStorage`]: one `<name>.pem` file per certificate
//! - [`MemoryCertificateStorage`]: process-local map, for dry runs and tests

mod consul;
mod directory;
mod memory;

pub use consul::ConsulCertificateStorage;
pub use directory::DirectoryCertificateStorage;
pub use memory::MemoryCertificateStorage;

use async_trait::async_trait;

use certsync_common::CertName;

use crate::error::StorageError;

/// Keyed store for certificate material.
///
/// Only per-key atomicity is required. certsync is the sole writer of its
/// keys, so last-write-wins is fine.
#[async_trait]
pub trait CertificateStorage: Send + Sync {
    /// Store `data` under `name`, replacing any previous value
    async fn put(&self, name: &CertName, data: &[u8]) -> Result<(), StorageError>;

    /// Delete the entry for `name`. Deleting a missing entry succeeds.
    async fn delete(&self, name: &CertName) -> Result<(), StorageError>;

    /// Whether an entry exists for `name`
    async fn exists(&self, name: &CertName) -> Result<bool, StorageError>;

    /// Read the entry for `name`
    async fn get(&self, name: &CertName) -> Result<Option<Vec<u8>>, StorageError>;

    /// Names of all stored entries, sorted
    async fn list_names(&self) -> Result<Vec<CertName>, StorageError>;
}
