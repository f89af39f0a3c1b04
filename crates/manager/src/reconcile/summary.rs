//! Per-pass outcome report

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use certsync_common::{CertName, PassId};

/// Category of a per-name failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Desired state for the name was ambiguous
    Conflict,
    /// The source entry for the name was not a valid domain group
    InvalidGroup,
    /// Certificate request failed
    Request,
    /// Certificate was issued but could not be stored
    StorageWrite,
    /// Certificate removal failed
    Remove,
    /// Certificate was removed but its stored copy could not be deleted
    StorageDelete,
    /// Stored copy could not be checked
    StorageCheck,
    /// Stored copy could not be restored
    Repair,
    /// Orphaned stored copy could not be deleted
    Prune,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conflict => "conflict",
            Self::InvalidGroup => "invalid_group",
            Self::Request => "request",
            Self::StorageWrite => "storage_write",
            Self::Remove => "remove",
            Self::StorageDelete => "storage_delete",
            Self::StorageCheck => "storage_check",
            Self::Repair => "repair",
            Self::Prune => "prune",
        }
    }
}

/// One failed name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassFailure {
    pub name: CertName,
    pub kind: FailureKind,
    pub reason: String,
}

/// Outcome counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassCounts {
    pub added: usize,
    pub removed: usize,
    pub repaired: usize,
    pub pruned: usize,
    pub unchanged: usize,
    pub retained: usize,
    pub failed_add: usize,
    pub failed_remove: usize,
    pub failed_repair: usize,
    pub conflicts: usize,
    pub rejected: usize,
}

impl PassCounts {
    /// Counter values keyed by outcome label
    pub fn by_outcome(&self) -> [(&'static str, usize); 11] {
        [
            ("added", self.added),
            ("removed", self.removed),
            ("repaired", self.repaired),
            ("pruned", self.pruned),
            ("unchanged", self.unchanged),
            ("retained", self.retained),
            ("failed_add", self.failed_add),
            ("failed_remove", self.failed_remove),
            ("failed_repair", self.failed_repair),
            ("conflicts", self.conflicts),
            ("rejected", self.rejected),
        ]
    }
}

/// Report of one reconciliation pass.
///
/// In a dry run the success counters describe planned actions.
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub pass_id: PassId,
    pub started_at: DateTime<Utc>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub dry_run: bool,
    pub counts: PassCounts,
    pub failures: Vec<PassFailure>,
    /// Removals that found the certificate already gone
    pub already_absent: Vec<CertName>,
}

fn serialize_millis<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

impl PassSummary {
    pub fn new(pass_id: PassId, dry_run: bool) -> Self {
        Self {
            pass_id,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            dry_run,
            counts: PassCounts::default(),
            failures: Vec::new(),
            already_absent: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Record a failure and bump the matching counter
    pub fn record_failure(&mut self, name: CertName, kind: FailureKind, reason: impl Into<String>) {
        match kind {
            FailureKind::Conflict => self.counts.conflicts += 1,
            FailureKind::InvalidGroup => self.counts.rejected += 1,
            FailureKind::Request | FailureKind::StorageWrite => self.counts.failed_add += 1,
            FailureKind::Remove | FailureKind::StorageDelete | FailureKind::Prune => {
                self.counts.failed_remove += 1
            }
            FailureKind::StorageCheck | FailureKind::Repair => self.counts.failed_repair += 1,
        }
        self.failures.push(PassFailure {
            name,
            kind,
            reason: reason.into(),
        });
    }

    /// Failures of one kind
    pub fn failures_of(&self, kind: FailureKind) -> impl Iterator<Item = &PassFailure> {
        self.failures.iter().filter(move |f| f.kind == kind)
    }

    /// Emit the summary through tracing
    pub fn log(&self) {
        for failure in &self.failures {
            warn!(
                pass_id = %self.pass_id,
                cert_name = %failure.name,
                kind = failure.kind.as_str(),
                reason = %failure.reason,
                "Certificate not reconciled"
            );
        }
        for name in &self.already_absent {
            info!(pass_id = %self.pass_id, cert_name = %name, "Certificate was already absent at removal");
        }

        let c = &self.counts;
        info!(
            pass_id = %self.pass_id,
            dry_run = self.dry_run,
            duration_ms = self.duration.as_millis() as u64,
            added = c.added,
            removed = c.removed,
            repaired = c.repaired,
            pruned = c.pruned,
            unchanged = c.unchanged,
            retained = c.retained,
            failed_add = c.failed_add,
            failed_remove = c.failed_remove,
            failed_repair = c.failed_repair,
            conflicts = c.conflicts,
            rejected = c.rejected,
            "Reconciliation pass complete"
        );
    }
}
