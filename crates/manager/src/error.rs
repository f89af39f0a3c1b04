//! Error types for certsync collaborators and the reconciliation engine.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use certsync_common::{CertName, DomainError};

/// Errors from the certificate authority client (Certbot).
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// The Certbot executable could not be started.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Certbot did not finish within the configured budget.
    #[error("certbot {command} timed out after {timeout:?}")]
    Timeout {
        command: &'static str,
        timeout: Duration,
    },

    /// Certbot exited with a non-zero status.
    #[error("certbot {command} exited with {}: {stderr}", .status.map(|c| format!("status {}", c)).unwrap_or_else(|| "a signal".to_string()))]
    CommandFailed {
        command: &'static str,
        status: Option<i32>,
        stderr: String,
    },

    /// Certbot does not know the certificate.
    #[error("certificate {0} not found")]
    NotFound(CertName),

    /// Reading certificate material from the live directory failed.
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the domain configuration source.
///
/// Any of these aborts the reconciliation pass: an unreadable source must
/// never be mistaken for an empty one.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("consul: {0}")]
    Consul(#[from] ConsulError),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("instance document {key} is not valid JSON: {source}")]
    InvalidDocument {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("instance document {key} has a malformed domains field")]
    MalformedDomains { key: String },
}

/// Errors from certificate storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("consul: {0}")]
    Consul(#[from] ConsulError),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid storage key {0:?}")]
    InvalidKey(String),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Errors from the Consul KV HTTP API.
#[derive(Debug, Error)]
pub enum ConsulError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("write to {key} was rejected")]
    WriteRejected { key: String },

    #[error("value of {key} is not valid base64: {source}")]
    Decode {
        key: String,
        #[source]
        source: base64::DecodeError,
    },
}

/// Pass-fatal errors.
///
/// Per-certificate failures never surface here; they are recorded in the
/// [`PassSummary`](crate::reconcile::PassSummary).
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("cannot determine desired state: {0}")]
    Source(#[from] SourceError),

    #[error("cannot list certificates known to certbot: {0}")]
    Inventory(#[source] AuthorityError),
}

/// Errors from the Certbot deploy hook.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("lineage path {} has no certificate name", .0.display())]
    InvalidLineage(PathBuf),

    #[error("lineage name is not a valid domain: {0}")]
    InvalidName(#[from] DomainError),

    #[error(transparent)]
    Authority(#[from] AuthorityError),

    #[error("no certificate material found in {}", .0.display())]
    MissingMaterial(PathBuf),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors from the Prometheus textfile exporter.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors while wiring collaborators from configuration.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("cannot create consul client: {0}")]
    Consul(#[from] ConsulError),

    #[error("cannot open certificate storage: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),
}
