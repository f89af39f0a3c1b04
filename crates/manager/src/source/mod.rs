//! Domain configuration sources
//!
//! A source yields the desired domain groups. It is read fresh on every
//! pass; nothing is cached between passes.
//!
//! Groups that fail validation (no domains, unusable hostnames) never reach
//! the diff. When the first hostname of a rejected group is still usable the
//! source reports it as a [`RejectedGroup`], so the certificate it names is
//! protected instead of looking undesired. Anything that prevents the source
//! from being read at all is a [`SourceError`] and aborts the pass.

mod consul;
mod file;

pub use consul::ConsulDomainSource;
pub use file::FileDomainSource;

use async_trait::async_trait;
use tracing::warn;

use certsync_common::{CertName, DomainError, DomainGroup};

use crate::error::SourceError;

/// A group the source could not accept, and the certificate it refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedGroup {
    pub name: CertName,
    pub reason: String,
}

/// Everything a source yielded for one pass
#[derive(Debug, Clone, Default)]
pub struct SourceGroups {
    pub groups: Vec<DomainGroup>,
    pub rejected: Vec<RejectedGroup>,
}

impl SourceGroups {
    /// Validate one raw entry, keeping track of rejects.
    ///
    /// `origin` names the entry in log output (file index, Consul key).
    pub fn push_raw<S: AsRef<str>>(&mut self, origin: &str, domains: &[S]) {
        match DomainGroup::new(domains) {
            Ok(group) => self.groups.push(group),
            Err(e) => self.reject(origin, domains, e),
        }
    }

    fn reject<S: AsRef<str>>(&mut self, origin: &str, domains: &[S], error: DomainError) {
        match DomainGroup::intended_name(domains) {
            Some(name) => {
                warn!(origin = origin, cert_name = %name, error = %error, "Rejecting domain group, keeping its certificate");
                self.rejected.push(RejectedGroup {
                    name,
                    reason: format!("invalid domain group from {}: {}", origin, error),
                });
            }
            None => warn!(origin = origin, error = %error, "Rejecting domain group"),
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.rejected.is_empty()
    }
}

impl From<Vec<DomainGroup>> for SourceGroups {
    fn from(groups: Vec<DomainGroup>) -> Self {
        Self {
            groups,
            rejected: Vec::new(),
        }
    }
}

/// Source of desired domain groups
#[async_trait]
pub trait DomainSource: Send + Sync {
    /// Enumerate the desired domain groups.
    ///
    /// No groups and no rejects means nothing is desired. Errors mean the
    /// desired state cannot be determined.
    async fn list_desired_groups(&self) -> Result<SourceGroups, SourceError>;
}
