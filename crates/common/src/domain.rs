//! Domain groups: the unit of desired state.
//!
//! A domain group is an ordered, non-empty list of hostnames that share one
//! certificate. The first hostname is the canonical name of the certificate.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::ids::CertName;

/// Ordered, non-empty set of hostnames covered by one certificate.
///
/// Hostnames are normalised on construction (trimmed, lowercased, trailing
/// dot removed) and de-duplicated keeping the first occurrence, so the
/// canonical name is stable for a given input order.
///
/// Equality ignores order: two groups are equal when they cover the same
/// set of hostnames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct DomainGroup {
    domains: Vec<String>,
}

impl DomainGroup {
    /// Build a domain group from a list of hostnames.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::EmptyGroup`] when no hostnames are given and
    /// [`DomainError::InvalidDomain`] for hostnames that cannot be used as a
    /// certificate name.
    pub fn new<I, S>(domains: I) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = BTreeSet::new();
        let mut normalised = Vec::new();

        for raw in domains {
            let domain = normalise(raw.as_ref())?;
            if seen.insert(domain.clone()) {
                normalised.push(domain);
            }
        }

        if normalised.is_empty() {
            return Err(DomainError::EmptyGroup);
        }

        Ok(Self {
            domains: normalised,
        })
    }

    /// The canonical certificate name (first hostname)
    pub fn canonical_name(&self) -> CertName {
        CertName::new(self.domains[0].clone())
    }

    /// Hostnames in declaration order
    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// Number of hostnames in the group
    pub fn len(&self) -> usize {
        self.domains.len()
    }

    /// Whether the group has no hostnames. Never true once constructed.
    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    /// The canonical name a list of hostnames would produce, looking only
    /// at the first entry.
    ///
    /// Lets callers identify the certificate a group refers to even when a
    /// later hostname makes the group itself invalid.
    pub fn intended_name<I, S>(domains: I) -> Option<CertName>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let first = domains.into_iter().next()?;
        normalise(first.as_ref()).ok().map(CertName::new)
    }

    /// Hostnames as an order-independent set
    pub fn domain_set(&self) -> BTreeSet<&str> {
        self.domains.iter().map(String::as_str).collect()
    }

    /// Whether this group covers exactly the given hostnames.
    pub fn covers_exactly<S: AsRef<str>>(&self, other: &[S]) -> bool {
        let theirs: BTreeSet<&str> = other.iter().map(AsRef::as_ref).collect();
        self.domain_set() == theirs
    }
}

impl PartialEq for DomainGroup {
    fn eq(&self, other: &Self) -> bool {
        self.domain_set() == other.domain_set()
    }
}

impl Eq for DomainGroup {}

impl fmt::Display for DomainGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.domains.join(","))
    }
}

/// Parses the comma-separated form used on the command line,
/// e.g. `example.com,www.example.com`.
impl FromStr for DomainGroup {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.split(',').filter(|d| !d.trim().is_empty()))
    }
}

impl TryFrom<Vec<String>> for DomainGroup {
    type Error = DomainError;

    fn try_from(domains: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(domains)
    }
}

impl From<DomainGroup> for Vec<String> {
    fn from(group: DomainGroup) -> Self {
        group.domains
    }
}

fn normalise(raw: &str) -> Result<String, DomainError> {
    let domain = raw.trim().trim_end_matches('.').to_ascii_lowercase();

    if domain.is_empty() {
        return Err(DomainError::InvalidDomain {
            domain: raw.to_string(),
            reason: "empty hostname",
        });
    }
    if domain.starts_with('.') || domain.contains("..") {
        return Err(DomainError::InvalidDomain {
            domain: raw.to_string(),
            reason: "empty label",
        });
    }
    if domain
        .chars()
        .any(|c| c.is_whitespace() || c == '/' || c == '\\' || c == ',')
    {
        return Err(DomainError::InvalidDomain {
            domain: raw.to_string(),
            reason: "forbidden character",
        });
    }

    Ok(domain)
}
