//! Certbot deploy hook
//!
//! Certbot runs `certsync deploy-hook` after every successful issuance or
//! renewal with `RENEWED_LINEAGE` pointing at `<config_dir>/live/<name>`.
//! The hook copies the fresh bundle into storage so renewals made by
//! `certbot renew` reach consumers without waiting for the next pass.

use std::path::Path;

use tracing::info;

use certsync_common::{CertName, DomainGroup};

use crate::authority::read_live_dir;
use crate::error::DeployError;
use crate::storage::CertificateStorage;

/// Store the bundle of one Certbot lineage directory.
///
/// Returns the certificate name the bundle was stored under.
pub async fn deploy_lineage(
    lineage: &Path,
    storage: &dyn CertificateStorage,
) -> Result<CertName, DeployError> {
    let dir_name = lineage
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DeployError::InvalidLineage(lineage.to_path_buf()))?;

    // Lineage names are canonical names, possibly with a `-0001` suffix
    let name = DomainGroup::new([dir_name])?.canonical_name();

    let data = read_live_dir(lineage)
        .await?
        .ok_or_else(|| DeployError::MissingMaterial(lineage.to_path_buf()))?;

    storage.put(&name, &data).await?;

    info!(
        cert_name = %name,
        lineage = %lineage.display(),
        bytes = data.len(),
        "Deployed renewed certificate"
    );
    Ok(name)
}
