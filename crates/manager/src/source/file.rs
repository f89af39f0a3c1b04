//! Domain groups from a local TOML file
//!
//! ```toml
//! [[group]]
//! domains = ["a.example.com", "www.a.example.com"]
//!
//! [[group]]
//! domains = ["b.example.com"]
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{DomainSource, SourceGroups};
use crate::error::SourceError;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DomainsFile {
    #[serde(default, rename = "group")]
    groups: Vec<GroupEntry>,
}

#[derive(Debug, Deserialize)]
struct GroupEntry {
    #[serde(default)]
    domains: Vec<String>,
}

/// Reads desired domain groups from a TOML file on every pass
#[derive(Debug, Clone)]
pub struct FileDomainSource {
    path: PathBuf,
}

impl FileDomainSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DomainSource for FileDomainSource {
    async fn list_desired_groups(&self) -> Result<SourceGroups, SourceError> {
        let content =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|source| SourceError::Read {
                    path: self.path.clone(),
                    source,
                })?;

        let file: DomainsFile = toml::from_str(&content).map_err(|source| SourceError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let mut groups = SourceGroups::default();
        for (index, entry) in file.groups.iter().enumerate() {
            let origin = format!("{} group #{}", self.path.display(), index);
            groups.push_raw(&origin, &entry.domains);
        }

        debug!(
            path = %self.path.display(),
            groups = groups.len(),
            rejected = groups.rejected.len(),
            "Read domain groups from file"
        );
        Ok(groups)
    }
}
