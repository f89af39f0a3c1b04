//! Wiring from configuration to collaborators

use std::sync::Arc;

use tracing::info;

use certsync_config::{CertsyncConfig, SourceConfig, StorageConfig};

use crate::authority::CertificateAuthority;
use crate::consul::ConsulClient;
use crate::error::SetupError;
use crate::metrics::TextfileExporter;
use crate::reconcile::Reconciler;
use crate::scheduler::PassScheduler;
use crate::source::{ConsulDomainSource, DomainSource, FileDomainSource};
use crate::storage::{CertificateStorage, ConsulCertificateStorage, DirectoryCertificateStorage};

/// Source and storage selected by the configuration
pub struct Components {
    pub source: Arc<dyn DomainSource>,
    pub storage: Arc<dyn CertificateStorage>,
}

impl Components {
    pub fn from_config(config: &CertsyncConfig) -> Result<Self, SetupError> {
        let source: Arc<dyn DomainSource> = match &config.source {
            SourceConfig::File { path } => Arc::new(FileDomainSource::new(path)),
            SourceConfig::Consul => Arc::new(ConsulDomainSource::new(
                ConsulClient::new(&config.consul)?,
                config.consul.instances_prefix.clone(),
            )),
        };
        let storage = storage_from_config(config)?;

        info!(
            source = config.source.kind(),
            storage = config.storage.kind(),
            "Configured domain source and certificate storage"
        );
        Ok(Self { source, storage })
    }

    /// Build the reconciler around an authority client
    pub fn reconciler(
        &self,
        config: &CertsyncConfig,
        authority: Arc<dyn CertificateAuthority>,
    ) -> Reconciler {
        Reconciler::new(authority, self.source.clone(), self.storage.clone())
            .with_additional_domains(config.reconcile.additional_domains.clone())
            .with_max_concurrency(config.reconcile.max_concurrency)
            .with_dry_run(config.reconcile.dry_run)
            .with_prune_orphans(config.reconcile.prune_orphans)
    }
}

/// Build the configured storage backend
pub fn storage_from_config(
    config: &CertsyncConfig,
) -> Result<Arc<dyn CertificateStorage>, SetupError> {
    Ok(match &config.storage {
        StorageConfig::Directory { path } => Arc::new(DirectoryCertificateStorage::new(path)?),
        StorageConfig::Consul => Arc::new(ConsulCertificateStorage::new(
            ConsulClient::new(&config.consul)?,
            config.consul.certs_prefix.clone(),
        )),
    })
}

/// Build the pass scheduler, with the metrics textfile when configured
pub fn scheduler_from_config(
    config: &CertsyncConfig,
    reconciler: Reconciler,
) -> Result<PassScheduler, SetupError> {
    let scheduler = PassScheduler::new(Arc::new(reconciler));
    Ok(match &config.metrics.textfile {
        Some(path) => scheduler.with_exporter(TextfileExporter::new(path)?),
        None => scheduler,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_file_source_and_directory_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = CertsyncConfig::default();
        config.source = SourceConfig::File {
            path: dir.path().join("domains.toml"),
        };
        config.storage = StorageConfig::Directory {
            path: dir.path().join("certs"),
        };

        Components::from_config(&config).unwrap();
        assert!(dir.path().join("certs").is_dir());
    }

    #[test]
    fn test_consul_defaults() {
        let config = CertsyncConfig::default();
        Components::from_config(&config).unwrap();
        storage_from_config(&config).unwrap();
    }

    #[test]
    fn test_unwritable_storage_dir_is_error() {
        let mut config = CertsyncConfig::default();
        config.storage = StorageConfig::Directory {
            path: PathBuf::from("/proc/certsync/certs"),
        };
        assert!(matches!(
            storage_from_config(&config),
            Err(SetupError::Storage(_))
        ));
    }
}
