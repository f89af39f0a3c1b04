//! Reconciliation engine
//!
//! A pass reads the desired groups and the authority inventory, computes a
//! [`Plan`], compares the stored copy of every unchanged certificate with
//! the material the authority holds, and then runs
//! the resulting actions with bounded concurrency. Failures are isolated
//! per canonical name and recorded in the [`PassSummary`]; only an
//! unreadable source or inventory aborts a pass.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tracing::{debug, info, info_span, warn, Instrument};

use certsync_common::{CertName, DomainGroup, PassId};

use super::plan::{compute, ActualSet, DesiredSet, IssueAction, Plan, SkippedName};
use super::summary::{FailureKind, PassFailure, PassSummary};
use crate::authority::CertificateAuthority;
use crate::error::{AuthorityError, ReconcileError};
use crate::source::DomainSource;
use crate::storage::CertificateStorage;

/// Upper bound for concurrent actions
pub const MAX_CONCURRENCY: usize = 64;

/// One unit of work, always keyed by a single canonical name
#[derive(Debug)]
enum Job {
    Issue(IssueAction),
    Remove(CertName),
    Repair(CertName),
    Prune(CertName),
}

impl Job {
    fn name(&self) -> CertName {
        match self {
            Self::Issue(action) => action.name(),
            Self::Remove(name) | Self::Repair(name) | Self::Prune(name) => name.clone(),
        }
    }
}

/// State of the stored copy of an issued, desired certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoredCopy {
    Current,
    Missing,
    Stale,
}

#[derive(Debug)]
enum JobOutcome {
    Added,
    Removed { already_absent: bool },
    Repaired,
    Pruned,
    Failed(PassFailure),
}

/// Converges certificates and storage towards the desired domain groups
pub struct Reconciler {
    authority: Arc<dyn CertificateAuthority>,
    source: Arc<dyn DomainSource>,
    storage: Arc<dyn CertificateStorage>,
    always_kept: Vec<DomainGroup>,
    max_concurrency: usize,
    dry_run: bool,
    prune_orphans: bool,
}

impl Reconciler {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        source: Arc<dyn DomainSource>,
        storage: Arc<dyn CertificateStorage>,
    ) -> Self {
        Self {
            authority,
            source,
            storage,
            always_kept: Vec::new(),
            max_concurrency: 1,
            dry_run: false,
            prune_orphans: true,
        }
    }

    /// Groups that are always desired and never removed
    pub fn with_additional_domains(mut self, groups: Vec<DomainGroup>) -> Self {
        self.always_kept = groups;
        self
    }

    /// Maximum number of actions in flight, clamped to `1..=64`
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.clamp(1, MAX_CONCURRENCY);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_prune_orphans(mut self, prune_orphans: bool) -> Self {
        self.prune_orphans = prune_orphans;
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Compute the plan for the current state without acting on it.
    ///
    /// # Errors
    ///
    /// Fails when the desired groups or the authority inventory cannot be
    /// read. Storage errors are recorded per name in the plan.
    pub async fn plan(&self) -> Result<Plan, ReconcileError> {
        let source_groups = self.source.list_desired_groups().await?;
        let desired = DesiredSet::from_source(source_groups, &self.always_kept);

        let inventory = self
            .authority
            .list_certificates()
            .await
            .map_err(ReconcileError::Inventory)?;
        let actual = ActualSet::new(inventory);

        debug!(
            desired = desired.len(),
            actual = actual.len(),
            "Read desired and actual state"
        );

        let mut plan = compute(&desired, &actual);
        self.verify_stored_copies(&mut plan).await;
        if self.prune_orphans {
            self.find_orphans(&desired, &actual, &mut plan).await;
        }
        Ok(plan)
    }

    /// Move unchanged names whose stored copy is missing or out of date
    /// into the repair list
    async fn verify_stored_copies(&self, plan: &mut Plan) {
        let mut unchanged = Vec::with_capacity(plan.unchanged.len());
        for name in std::mem::take(&mut plan.unchanged) {
            match self.stored_copy(&name).await {
                Ok(StoredCopy::Current) => unchanged.push(name),
                Ok(StoredCopy::Missing) => {
                    debug!(cert_name = %name, "Stored copy missing");
                    plan.repair.push(name);
                }
                Ok(StoredCopy::Stale) => {
                    info!(cert_name = %name, "Stored copy differs from issued certificate");
                    plan.repair.push(name);
                }
                Err(reason) => plan.storage_errors.push(SkippedName { name, reason }),
            }
        }
        plan.unchanged = unchanged;
    }

    async fn stored_copy(&self, name: &CertName) -> Result<StoredCopy, String> {
        let Some(stored) = self.storage.get(name).await.map_err(|e| e.to_string())? else {
            return Ok(StoredCopy::Missing);
        };
        match self.authority.read_certificate_data(name).await {
            Ok(Some(issued)) if issued == stored => Ok(StoredCopy::Current),
            Ok(Some(_)) => Ok(StoredCopy::Stale),
            Ok(None) => Err("no certificate material to compare the stored copy with".to_string()),
            Err(e) => Err(format!("cannot read issued certificate: {}", e)),
        }
    }

    /// Stored copies with no certificate behind them and no desire for one
    async fn find_orphans(&self, desired: &DesiredSet, actual: &ActualSet, plan: &mut Plan) {
        match self.storage.list_names().await {
            Ok(stored) => {
                plan.prune = stored
                    .into_iter()
                    .filter(|name| !actual.contains(name) && !desired.protects(name))
                    .collect();
            }
            Err(e) => warn!(error = %e, "Cannot list stored certificates, skipping orphan cleanup"),
        }
    }

    /// Run one reconciliation pass
    pub async fn run_pass(&self) -> Result<PassSummary, ReconcileError> {
        let pass_id = PassId::new();
        let span = info_span!("pass", pass_id = %pass_id, dry_run = self.dry_run);
        self.run_pass_inner(pass_id).instrument(span).await
    }

    async fn run_pass_inner(&self, pass_id: PassId) -> Result<PassSummary, ReconcileError> {
        let start = Instant::now();
        let mut summary = PassSummary::new(pass_id, self.dry_run);

        let plan = match self.plan().await {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "Reconciliation pass aborted");
                return Err(e);
            }
        };

        info!(
            issue = plan.issue.len(),
            remove = plan.remove.len(),
            repair = plan.repair.len(),
            prune = plan.prune.len(),
            unchanged = plan.unchanged.len(),
            "Computed reconciliation plan"
        );

        summary.counts.unchanged = plan.unchanged.len();
        summary.counts.retained = plan.retained.len();
        for name in &plan.retained {
            debug!(cert_name = %name, "Keeping undesired certificate");
        }
        for conflict in &plan.conflicts {
            summary.record_failure(conflict.name.clone(), FailureKind::Conflict, &conflict.reason);
        }
        for skipped in &plan.rejected {
            summary.record_failure(skipped.name.clone(), FailureKind::InvalidGroup, &skipped.reason);
        }
        for skipped in &plan.storage_errors {
            summary.record_failure(skipped.name.clone(), FailureKind::StorageCheck, &skipped.reason);
        }

        let jobs = Self::jobs(plan);
        let outcomes: Vec<(CertName, JobOutcome)> = stream::iter(jobs)
            .map(|job| async move {
                let name = job.name();
                let outcome = self.execute(job).await;
                (name, outcome)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await;

        for (name, outcome) in outcomes {
            match outcome {
                JobOutcome::Added => summary.counts.added += 1,
                JobOutcome::Removed { already_absent } => {
                    summary.counts.removed += 1;
                    if already_absent {
                        summary.already_absent.push(name);
                    }
                }
                JobOutcome::Repaired => summary.counts.repaired += 1,
                JobOutcome::Pruned => summary.counts.pruned += 1,
                JobOutcome::Failed(failure) => {
                    summary.record_failure(failure.name, failure.kind, failure.reason)
                }
            }
        }

        summary.failures.sort_by(|a, b| a.name.cmp(&b.name));
        summary.already_absent.sort();
        summary.duration = start.elapsed();
        summary.log();
        Ok(summary)
    }

    /// Flatten a plan into jobs, at most one per canonical name
    fn jobs(plan: Plan) -> Vec<Job> {
        let mut seen = BTreeSet::new();
        plan.issue
            .into_iter()
            .map(Job::Issue)
            .chain(plan.remove.into_iter().map(Job::Remove))
            .chain(plan.repair.into_iter().map(Job::Repair))
            .chain(plan.prune.into_iter().map(Job::Prune))
            .filter(|job| {
                let fresh = seen.insert(job.name());
                if !fresh {
                    warn!(cert_name = %job.name(), "Dropping second action for the same certificate");
                }
                fresh
            })
            .collect()
    }

    async fn execute(&self, job: Job) -> JobOutcome {
        if self.dry_run {
            return Self::simulate(job);
        }
        match job {
            Job::Issue(action) => self.issue(action).await,
            Job::Remove(name) => self.remove(name).await,
            Job::Repair(name) => self.repair(name).await,
            Job::Prune(name) => self.prune(name).await,
        }
    }

    fn simulate(job: Job) -> JobOutcome {
        match job {
            Job::Issue(action) => {
                info!(cert_name = %action.name(), domains = %action.group, reason = ?action.reason, "Would request certificate");
                JobOutcome::Added
            }
            Job::Remove(name) => {
                info!(cert_name = %name, "Would remove certificate");
                JobOutcome::Removed {
                    already_absent: false,
                }
            }
            Job::Repair(name) => {
                info!(cert_name = %name, "Would restore stored copy");
                JobOutcome::Repaired
            }
            Job::Prune(name) => {
                info!(cert_name = %name, "Would delete orphaned stored copy");
                JobOutcome::Pruned
            }
        }
    }

    /// Request, then store. Nothing is stored unless issuance succeeded.
    async fn issue(&self, action: IssueAction) -> JobOutcome {
        let name = action.name();
        info!(cert_name = %name, domains = %action.group, reason = ?action.reason, "Requesting certificate");

        let missing = action.missing_domains();
        if !missing.is_empty() {
            warn!(
                cert_name = %name,
                missing = %missing.join(","),
                "Certificate covers only part of its group, hostnames likely fail validation"
            );
        }

        if let Err(e) = self.authority.request_certificate(&action.group).await {
            return failed(name, FailureKind::Request, e.to_string());
        }

        match self.copy_to_storage(&name).await {
            Ok(()) => {
                info!(cert_name = %name, "Certificate issued and stored");
                JobOutcome::Added
            }
            Err(reason) => failed(
                name,
                FailureKind::StorageWrite,
                format!("issued but not stored: {}", reason),
            ),
        }
    }

    async fn remove(&self, name: CertName) -> JobOutcome {
        info!(cert_name = %name, "Removing certificate");

        let already_absent = match self.authority.remove_certificate(&name).await {
            Ok(()) => false,
            Err(AuthorityError::NotFound(_)) => true,
            Err(e) => return failed(name, FailureKind::Remove, e.to_string()),
        };

        match self.storage.delete(&name).await {
            Ok(()) => JobOutcome::Removed { already_absent },
            Err(e) => failed(
                name,
                FailureKind::StorageDelete,
                format!("removed but stored copy remains: {}", e),
            ),
        }
    }

    async fn repair(&self, name: CertName) -> JobOutcome {
        info!(cert_name = %name, "Restoring stored copy");
        match self.copy_to_storage(&name).await {
            Ok(()) => JobOutcome::Repaired,
            Err(reason) => failed(name, FailureKind::Repair, reason),
        }
    }

    async fn prune(&self, name: CertName) -> JobOutcome {
        info!(cert_name = %name, "Deleting orphaned stored copy");
        match self.storage.delete(&name).await {
            Ok(()) => JobOutcome::Pruned,
            Err(e) => failed(name, FailureKind::Prune, e.to_string()),
        }
    }

    /// Read the issued material and write it to storage
    async fn copy_to_storage(&self, name: &CertName) -> Result<(), String> {
        let data = match self.authority.read_certificate_data(name).await {
            Ok(Some(data)) => data,
            Ok(None) => return Err("no certificate material found".to_string()),
            Err(e) => return Err(e.to_string()),
        };
        self.storage.put(name, &data).await.map_err(|e| e.to_string())
    }
}

fn failed(name: CertName, kind: FailureKind, reason: String) -> JobOutcome {
    JobOutcome::Failed(PassFailure { name, kind, reason })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::IssueReason;

    fn group(domains: &[&str]) -> DomainGroup {
        DomainGroup::new(domains).unwrap()
    }

    #[test]
    fn test_jobs_deduplicate_names() {
        let plan = Plan {
            issue: vec![IssueAction {
                group: group(&["a.example.com"]),
                reason: IssueReason::New,
            }],
            remove: vec![CertName::new("b.example.com")],
            repair: vec![CertName::new("a.example.com")],
            prune: vec![CertName::new("c.example.com")],
            ..Default::default()
        };

        let jobs = Reconciler::jobs(plan);
        assert_eq!(jobs.len(), 3);
        assert!(matches!(jobs[0], Job::Issue(_)));
        assert!(matches!(jobs[1], Job::Remove(_)));
        assert!(matches!(jobs[2], Job::Prune(_)));
    }

    #[test]
    fn test_simulate_never_fails() {
        let outcome = Reconciler::simulate(Job::Remove(CertName::new("a.example.com")));
        assert!(matches!(
            outcome,
            JobOutcome::Removed {
                already_absent: false
            }
        ));
    }
}
