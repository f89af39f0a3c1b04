//! Type-safe identifier newtypes for certsync.
//!
//! These types keep certificate names and pass identifiers from being mixed
//! up with plain domain strings.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use uuid::Uuid;

/// Canonical certificate name.
///
/// The canonical name is the first domain of a [`DomainGroup`](crate::DomainGroup).
/// It is passed to Certbot as `--cert-name` and used as the storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertName(String);

impl CertName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CertName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CertName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CertName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for CertName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CertName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Unique identifier of one reconciliation pass.
///
/// Attached to every log line emitted during the pass so interleaved output
/// from cron and watch invocations can be told apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PassId(String);

impl PassId {
    /// Create a new random pass ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PassId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
