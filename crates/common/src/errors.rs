//! Errors for domain-group construction.

use thiserror::Error;

/// Errors raised when building a [`DomainGroup`](crate::DomainGroup).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// A group must contain at least one hostname.
    #[error("domain group has no domains")]
    EmptyGroup,

    /// A hostname is unusable as a certificate name or storage key.
    #[error("invalid domain {domain:?}: {reason}")]
    InvalidDomain {
        domain: String,
        reason: &'static str,
    },
}
