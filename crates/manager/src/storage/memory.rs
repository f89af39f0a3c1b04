//! In-memory certificate storage.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use certsync_common::CertName;

use super::CertificateStorage;
use crate::error::StorageError;

/// Certificate storage kept in a process-local map
#[derive(Debug, Default)]
pub struct MemoryCertificateStorage {
    entries: RwLock<BTreeMap<CertName, Vec<u8>>>,
}

impl MemoryCertificateStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names currently stored, in order
    pub fn names(&self) -> Vec<CertName> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl CertificateStorage for MemoryCertificateStorage {
    async fn put(&self, name: &CertName, data: &[u8]) -> Result<(), StorageError> {
        trace!(cert_name = %name, bytes = data.len(), "Storing certificate in memory");
        self.entries.write().insert(name.clone(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, name: &CertName) -> Result<(), StorageError> {
        self.entries.write().remove(name);
        Ok(())
    }

    async fn exists(&self, name: &CertName) -> Result<bool, StorageError> {
        Ok(self.entries.read().contains_key(name))
    }

    async fn get(&self, name: &CertName) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.read().get(name).cloned())
    }

    async fn list_names(&self) -> Result<Vec<CertName>, StorageError> {
        Ok(self.names())
    }
}
