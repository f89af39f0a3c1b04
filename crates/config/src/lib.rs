//! Operator configuration for certsync.
//!
//! Configuration is read from an optional TOML file and then overlaid with
//! command-line flags by the binary. Every section has defaults, so an empty
//! file (or no file at all) plus `--contact-email` is a complete config.
//!
//! # Example
//!
//! ```toml
//! [acme]
//! contact_email = "ops@example.com"
//! staging = true
//!
//! [consul]
//! address = "http://127.0.0.1:8500"
//! instances_prefix = "ocim/instances"
//! certs_prefix = "certs"
//!
//! [source]
//! kind = "consul"
//!
//! [storage]
//! kind = "directory"
//! path = "/var/lib/certsync/certs"
//!
//! [reconcile]
//! additional_domains = [["status.example.com", "www.status.example.com"]]
//! max_concurrency = 4
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use validator::Validate;

use certsync_common::DomainGroup;

mod error;

pub use error::ConfigError;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct CertsyncConfig {
    /// Certbot settings
    #[validate(nested)]
    pub acme: AcmeConfig,

    /// Consul connection shared by the Consul source and storage
    #[validate(nested)]
    pub consul: ConsulConfig,

    /// Where desired domain groups come from
    pub source: SourceConfig,

    /// Where issued certificate material is stored
    pub storage: StorageConfig,

    /// Reconciliation behaviour
    #[validate(nested)]
    pub reconcile: ReconcileConfig,

    /// Pass summary export
    pub metrics: MetricsConfig,

    /// Log output
    pub logging: LoggingConfig,
}

impl CertsyncConfig {
    /// Load configuration from a TOML file.
    ///
    /// The result is not validated; call [`CertsyncConfig::validate_all`]
    /// after applying command-line overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: Some(path.to_path_buf()),
                source,
            },
            other => other,
        })?;

        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse { path: None, source })
    }

    /// Run field validation and cross-field checks.
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()?;

        if let SourceConfig::File { path } = &self.source {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::MissingPath { section: "source" });
            }
        }
        if let StorageConfig::Directory { path } = &self.storage {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::MissingPath { section: "storage" });
            }
        }

        debug!(
            source = self.source.kind(),
            storage = self.storage.kind(),
            additional_domains = self.reconcile.additional_domains.len(),
            max_concurrency = self.reconcile.max_concurrency,
            "Configuration validated"
        );
        Ok(())
    }

    /// Whether any part of the configuration talks to Consul
    pub fn uses_consul(&self) -> bool {
        matches!(self.source, SourceConfig::Consul) || matches!(self.storage, StorageConfig::Consul)
    }
}

// ============================================================================
// Certbot
// ============================================================================

/// Certbot invocation settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct AcmeConfig {
    /// Contact email registered with the ACME account
    #[validate(email(message = "acme.contact_email must be a valid email address"))]
    pub contact_email: String,

    /// Use the Let's Encrypt staging environment
    pub staging: bool,

    /// Webroot served for HTTP-01 challenges
    pub webroot_path: PathBuf,

    /// Certbot configuration directory (contains `live/`)
    pub config_dir: PathBuf,

    /// Certbot executable
    #[validate(length(min = 1, message = "acme.certbot_path must not be empty"))]
    pub certbot_path: String,

    /// Command run by Certbot after each issuance or renewal.
    ///
    /// Defaults to `<this binary> deploy-hook` when unset.
    pub deploy_hook: Option<String>,

    /// Upper bound on a single Certbot invocation
    #[validate(range(min = 1, message = "acme.request_timeout_secs must be at least 1"))]
    pub request_timeout_secs: u64,
}

impl AcmeConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Certbot's `live/` directory
    pub fn live_dir(&self) -> PathBuf {
        self.config_dir.join("live")
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            contact_email: String::new(),
            staging: false,
            webroot_path: PathBuf::from("/var/www/certbot"),
            config_dir: PathBuf::from("/etc/letsencrypt"),
            certbot_path: "certbot".to_string(),
            deploy_hook: None,
            request_timeout_secs: 600,
        }
    }
}

// ============================================================================
// Consul
// ============================================================================

/// Consul HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct ConsulConfig {
    /// Consul HTTP API address
    #[validate(url(message = "consul.address must be a URL"))]
    pub address: String,

    /// ACL token sent as `X-Consul-Token`
    pub token: Option<String>,

    /// KV prefix holding one JSON document per instance
    #[validate(length(min = 1, message = "consul.instances_prefix must not be empty"))]
    pub instances_prefix: String,

    /// KV prefix under which certificate PEM bundles are stored
    #[validate(length(min = 1, message = "consul.certs_prefix must not be empty"))]
    pub certs_prefix: String,

    /// Per-request timeout
    #[validate(range(min = 1, message = "consul.timeout_secs must be at least 1"))]
    pub timeout_secs: u64,
}

impl ConsulConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            address: "http://127.0.0.1:8500".to_string(),
            token: None,
            instances_prefix: "ocim/instances".to_string(),
            certs_prefix: "certs".to_string(),
            timeout_secs: 10,
        }
    }
}

// ============================================================================
// Backends
// ============================================================================

/// Domain configuration source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum SourceConfig {
    /// Instance documents under `consul.instances_prefix`
    #[default]
    Consul,
    /// TOML file of `[[group]]` tables
    File { path: PathBuf },
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Consul => "consul",
            Self::File { .. } => "file",
        }
    }
}

/// Certificate storage backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum StorageConfig {
    /// Keys under `consul.certs_prefix`
    #[default]
    Consul,
    /// One `<name>.pem` file per certificate
    Directory { path: PathBuf },
}

impl StorageConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Consul => "consul",
            Self::Directory { .. } => "directory",
        }
    }
}

// ============================================================================
// Reconciliation
// ============================================================================

/// Reconciliation settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileConfig {
    /// Domain groups that are always desired and never removed
    pub additional_domains: Vec<DomainGroup>,

    /// Maximum number of Certbot operations in flight
    #[validate(range(min = 1, max = 64, message = "reconcile.max_concurrency must be 1..=64"))]
    pub max_concurrency: usize,

    /// Log the plan without acting on it
    pub dry_run: bool,

    /// Delete stored copies that have no certificate behind them and are
    /// not desired
    pub prune_orphans: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            additional_domains: Vec::new(),
            max_concurrency: 1,
            dry_run: false,
            prune_orphans: true,
        }
    }
}

// ============================================================================
// Observability
// ============================================================================

/// Pass summary export
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    /// Prometheus textfile written after each pass
    pub textfile: Option<PathBuf>,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> CertsyncConfig {
        let mut config = CertsyncConfig::default();
        config.acme.contact_email = "ops@example.com".to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = CertsyncConfig::default();
        assert_eq!(config.consul.instances_prefix, "ocim/instances");
        assert_eq!(config.consul.certs_prefix, "certs");
        assert_eq!(config.acme.webroot_path, PathBuf::from("/var/www/certbot"));
        assert_eq!(config.acme.live_dir(), PathBuf::from("/etc/letsencrypt/live"));
        assert_eq!(config.reconcile.max_concurrency, 1);
        assert!(config.reconcile.prune_orphans);
        assert_eq!(config.source, SourceConfig::Consul);
        assert!(config.uses_consul());
    }

    #[test]
    fn test_missing_email_is_invalid() {
        let config = CertsyncConfig::default();
        let err = config.validate_all().unwrap_err();
        assert!(err.to_string().contains("contact_email"));
    }

    #[test]
    fn test_valid_config_passes() {
        valid_config().validate_all().unwrap();
    }

    #[test]
    fn test_concurrency_bounds() {
        let mut config = valid_config();
        config.reconcile.max_concurrency = 0;
        assert!(config.validate_all().is_err());

        config.reconcile.max_concurrency = 65;
        assert!(config.validate_all().is_err());
    }

    #[test]
    fn test_bad_consul_address() {
        let mut config = valid_config();
        config.consul.address = "not a url".to_string();
        assert!(config.validate_all().is_err());
    }

    #[test]
    fn test_parse_full_toml() {
        let config = CertsyncConfig::from_toml(
            r#"
            [acme]
            contact_email = "ops@example.com"
            staging = true

            [source]
            kind = "file"
            path = "/etc/certsync/domains.toml"

            [storage]
            kind = "directory"
            path = "/var/lib/certsync"

            [reconcile]
            additional_domains = [["Status.example.com", "www.status.example.com"]]
            max_concurrency = 4

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert!(config.acme.staging);
        assert_eq!(
            config.source,
            SourceConfig::File {
                path: PathBuf::from("/etc/certsync/domains.toml")
            }
        );
        assert_eq!(config.storage.kind(), "directory");
        assert!(!config.uses_consul());
        assert_eq!(config.reconcile.additional_domains.len(), 1);
        assert_eq!(
            config.reconcile.additional_domains[0]
                .canonical_name()
                .as_str(),
            "status.example.com"
        );
        assert_eq!(config.logging.format, LogFormat::Json);
        config.validate_all().unwrap();
    }

    #[test]
    fn test_empty_additional_group_rejected() {
        let result = CertsyncConfig::from_toml(
            r#"
            [reconcile]
            additional_domains = [[]]
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = CertsyncConfig::from_toml(
            r#"
            [acme]
            contact_mail = "typo@example.com"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[acme]\ncontact_email = \"ops@example.com\"").unwrap();

        let config = CertsyncConfig::from_file(file.path()).unwrap();
        assert_eq!(config.acme.contact_email, "ops@example.com");
    }

    #[test]
    fn test_from_missing_file() {
        let err = CertsyncConfig::from_file("/nonexistent/certsync.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
