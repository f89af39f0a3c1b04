//! Shared types for certsync.
//!
//! - [`DomainGroup`]: an ordered, non-empty list of hostnames sharing one certificate
//! - [`CertName`]: the canonical certificate name derived from a group
//! - [`PassId`]: identifier attached to the logs of one reconciliation pass

pub mod domain;
pub mod errors;
pub mod ids;

pub use domain::DomainGroup;
pub use errors::DomainError;
pub use ids::{CertName, PassId};
