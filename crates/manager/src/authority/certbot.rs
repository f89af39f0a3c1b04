//! Certbot subprocess client
//!
//! Drives the `certbot` CLI:
//!
//! - `certbot certonly --webroot ... --cert-name <name> --domain ...` to request
//! - `certbot delete --cert-name <name>` to remove
//! - `certbot certificates` to list
//!
//! Issued material is read from `<config_dir>/live/<name>/{fullchain,privkey}.pem`.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, error, info, trace, warn};

use certsync_common::{CertName, DomainGroup};
use certsync_config::AcmeConfig;

use super::{CertificateAuthority, IssuedCertificate};
use crate::error::AuthorityError;

/// Longest stderr excerpt kept in an error
const MAX_DIAGNOSTIC_LEN: usize = 2048;

/// Marker Certbot prints when deleting an unknown certificate
const NOT_FOUND_MARKER: &str = "No certificate found with name";

/// Resolved Certbot settings
#[derive(Debug, Clone)]
pub struct CertbotSettings {
    pub certbot_path: String,
    pub contact_email: String,
    pub webroot_path: PathBuf,
    pub config_dir: PathBuf,
    /// One subdirectory of issued material per certificate
    pub live_dir: PathBuf,
    pub deploy_hook: String,
    pub staging: bool,
    pub timeout: Duration,
    /// Extra environment for Certbot and, through it, the deploy hook
    pub env: Vec<(String, String)>,
}

impl CertbotSettings {
    /// Build settings from the `[acme]` section and a resolved deploy hook
    pub fn from_config(config: &AcmeConfig, deploy_hook: String) -> Self {
        Self {
            certbot_path: config.certbot_path.clone(),
            contact_email: config.contact_email.clone(),
            webroot_path: config.webroot_path.clone(),
            config_dir: config.config_dir.clone(),
            live_dir: config.live_dir(),
            deploy_hook,
            staging: config.staging,
            timeout: config.request_timeout(),
            env: Vec::new(),
        }
    }
}

/// Certificate authority client backed by the Certbot CLI
#[derive(Debug)]
pub struct CertbotClient {
    settings: CertbotSettings,
}

impl CertbotClient {
    pub fn new(settings: CertbotSettings) -> Self {
        debug!(
            certbot = %settings.certbot_path,
            config_dir = %settings.config_dir.display(),
            staging = settings.staging,
            timeout_secs = settings.timeout.as_secs(),
            "Created certbot client"
        );
        Self { settings }
    }

    pub fn settings(&self) -> &CertbotSettings {
        &self.settings
    }

    /// Arguments for `certbot certonly`
    fn request_args(&self, group: &DomainGroup) -> Vec<OsString> {
        let s = &self.settings;
        let mut args: Vec<OsString> = vec![
            "certonly".into(),
            "--email".into(),
            s.contact_email.clone().into(),
            "--webroot".into(),
            "--webroot-path".into(),
            s.webroot_path.clone().into(),
            "--non-interactive".into(),
            "--agree-tos".into(),
            "--keep".into(),
            "--allow-subset-of-names".into(),
            "--deploy-hook".into(),
            s.deploy_hook.clone().into(),
            "--cert-name".into(),
            group.canonical_name().into_string().into(),
            "--config-dir".into(),
            s.config_dir.clone().into(),
        ];
        if s.staging {
            args.push("--staging".into());
        }
        for domain in group.domains() {
            args.push("--domain".into());
            args.push(domain.into());
        }
        args
    }

    /// Arguments for `certbot delete`
    fn delete_args(&self, name: &CertName) -> Vec<OsString> {
        vec![
            "delete".into(),
            "--non-interactive".into(),
            "--cert-name".into(),
            name.as_str().into(),
            "--config-dir".into(),
            self.settings.config_dir.clone().into(),
        ]
    }

    /// Arguments for `certbot certificates`
    fn list_args(&self) -> Vec<OsString> {
        vec![
            "certificates".into(),
            "--config-dir".into(),
            self.settings.config_dir.clone().into(),
        ]
    }

    /// Live directory of a certificate, if the name is usable as a path segment
    fn live_path(&self, name: &CertName) -> Option<PathBuf> {
        let name = name.as_str();
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
            return None;
        }
        Some(self.settings.live_dir.join(name))
    }

    /// Run certbot with a timeout, killing the child if the budget is exceeded
    async fn run(&self, command: &'static str, args: Vec<OsString>) -> Result<Output, AuthorityError> {
        trace!(command = command, args = ?args, "Running certbot");

        let mut cmd = Command::new(&self.settings.certbot_path);
        cmd.args(&args)
            .envs(self.settings.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.settings.timeout, cmd.output()).await {
            Err(_) => Err(AuthorityError::Timeout {
                command,
                timeout: self.settings.timeout,
            }),
            Ok(Err(source)) => Err(AuthorityError::Spawn {
                program: self.settings.certbot_path.clone(),
                source,
            }),
            Ok(Ok(output)) => Ok(output),
        }
    }
}

#[async_trait]
impl CertificateAuthority for CertbotClient {
    async fn request_certificate(&self, group: &DomainGroup) -> Result<(), AuthorityError> {
        let start = Instant::now();
        let output = self.run("certonly", self.request_args(group)).await?;

        if output.status.success() {
            info!(
                cert_name = %group.canonical_name(),
                domains = %group,
                elapsed_secs = start.elapsed().as_secs(),
                "Obtained certificate"
            );
            Ok(())
        } else {
            let stderr = diagnostic(&output.stderr);
            error!(
                cert_name = %group.canonical_name(),
                domains = %group,
                stderr = %stderr,
                "Failed to obtain certificate"
            );
            Err(AuthorityError::CommandFailed {
                command: "certonly",
                status: output.status.code(),
                stderr,
            })
        }
    }

    async fn remove_certificate(&self, name: &CertName) -> Result<(), AuthorityError> {
        let output = self.run("delete", self.delete_args(name)).await?;

        if output.status.success() {
            info!(cert_name = %name, "Deleted certificate from certbot");
            return Ok(());
        }

        let stderr = diagnostic(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        if stderr.contains(NOT_FOUND_MARKER) || stdout.contains(NOT_FOUND_MARKER) {
            warn!(cert_name = %name, "Certificate to delete is unknown to certbot");
            return Err(AuthorityError::NotFound(name.clone()));
        }

        error!(cert_name = %name, stderr = %stderr, "Failed to delete certificate from certbot");
        Err(AuthorityError::CommandFailed {
            command: "delete",
            status: output.status.code(),
            stderr,
        })
    }

    async fn list_certificates(&self) -> Result<Vec<IssuedCertificate>, AuthorityError> {
        let output = self.run("certificates", self.list_args()).await?;

        if !output.status.success() {
            let stderr = diagnostic(&output.stderr);
            error!(stderr = %stderr, "Listing certificates managed by certbot failed");
            return Err(AuthorityError::CommandFailed {
                command: "certificates",
                status: output.status.code(),
                stderr,
            });
        }

        let certs = parse_certificates(&String::from_utf8_lossy(&output.stdout));
        debug!(count = certs.len(), "Listed certbot certificates");
        Ok(certs)
    }

    async fn read_certificate_data(
        &self,
        name: &CertName,
    ) -> Result<Option<Vec<u8>>, AuthorityError> {
        match self.live_path(name) {
            Some(dir) => read_live_dir(&dir).await,
            None => {
                warn!(cert_name = %name, "Certificate name is not usable as a directory name");
                Ok(None)
            }
        }
    }
}

/// Load `fullchain.pem` followed by `privkey.pem` from a Certbot live directory.
///
/// Returns `None` if the directory holds no `fullchain.pem`. A chain without
/// a key is an error.
pub async fn read_live_dir(dir: &Path) -> Result<Option<Vec<u8>>, AuthorityError> {
    let chain_path = dir.join("fullchain.pem");
    let key_path = dir.join("privkey.pem");

    let mut data = match tokio::fs::read(&chain_path).await {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            trace!(path = %chain_path.display(), "No certificate chain found");
            return Ok(None);
        }
        Err(source) => {
            return Err(AuthorityError::Io {
                path: chain_path,
                source,
            })
        }
    };

    let key = tokio::fs::read(&key_path)
        .await
        .map_err(|source| AuthorityError::Io {
            path: key_path,
            source,
        })?;

    data.extend_from_slice(&key);
    Ok(Some(data))
}

/// Parse the output of `certbot certificates`.
///
/// ```text
/// Found the following certs:
///   Certificate Name: example.com
///     Serial Number: 3c1f...
///     Domains: example.com www.example.com
///     Expiry Date: 2024-06-01 12:00:00+00:00 (VALID: 89 days)
/// ```
fn parse_certificates(output: &str) -> Vec<IssuedCertificate> {
    let mut certs: Vec<IssuedCertificate> = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if let Some(name) = line.strip_prefix("Certificate Name:") {
            let name = name.trim();
            if !name.is_empty() {
                certs.push(IssuedCertificate {
                    name: CertName::new(name),
                    domains: Vec::new(),
                });
            }
        } else if let Some(domains) = line.strip_prefix("Domains:") {
            if let Some(current) = certs.last_mut() {
                current.domains = domains
                    .split_whitespace()
                    .map(|d| d.to_ascii_lowercase())
                    .collect();
            }
        }
    }

    certs
}

/// Trimmed, bounded stderr text
fn diagnostic(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= MAX_DIAGNOSTIC_LEN {
        return text.to_string();
    }
    // Keep the tail: certbot prints the actual failure last
    let mut start = text.len() - MAX_DIAGNOSTIC_LEN;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
