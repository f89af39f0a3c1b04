//! certsync: keeps Certbot-issued certificates in line with desired domain
//! groups.
//!
//! Desired groups come from Consul instance documents or a TOML file, plus
//! operator-pinned groups. Each reconciliation pass diffs them against the
//! certificates Certbot knows about, requests what is missing or changed,
//! removes what is no longer wanted, and keeps a copy of every issued bundle
//! in storage (Consul KV or a directory) for load balancers to pick up.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────────┐   ┌──────────────────────┐
//! │ DomainSource │──▶│    Reconciler    │──▶│ CertificateAuthority │
//! │ consul/file  │   │ plan ▶ execute   │   │ certbot              │
//! └──────────────┘   └────────┬─────────┘   └──────────────────────┘
//!                             │
//!                             ▼
//!                   ┌────────────────────┐
//!                   │ CertificateStorage │
//!                   │ consul/directory   │
//!                   └────────────────────┘
//! ```

pub mod app;
pub mod authority;
pub mod consul;
pub mod deploy;
pub mod error;
pub mod metrics;
pub mod reconcile;
pub mod scheduler;
pub mod source;
pub mod storage;

pub use authority::{CertbotClient, CertbotSettings, CertificateAuthority, IssuedCertificate};
pub use error::{
    AuthorityError, ConsulError, DeployError, MetricsError, ReconcileError, SetupError,
    SourceError, StorageError,
};
pub use reconcile::{FailureKind, PassSummary, Plan, Reconciler};
pub use scheduler::PassScheduler;
pub use source::{DomainSource, RejectedGroup, SourceGroups};
pub use storage::CertificateStorage;
