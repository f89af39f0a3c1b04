//! Desired/actual snapshots and the diff between them.
//!
//! Everything here is pure: snapshots are built from values read at the
//! start of a pass and [`compute`] never performs I/O.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use tracing::{trace, warn};

use certsync_common::{CertName, DomainGroup};

use crate::authority::IssuedCertificate;
use crate::source::SourceGroups;

/// Snapshot of the desired state for one pass
#[derive(Debug, Clone, Default)]
pub struct DesiredSet {
    groups: BTreeMap<CertName, DomainGroup>,
    pinned: BTreeSet<CertName>,
    conflicts: BTreeMap<CertName, String>,
    rejected: BTreeMap<CertName, String>,
}

impl DesiredSet {
    /// Merge valid source groups with the operator's always-kept groups.
    pub fn build(source: Vec<DomainGroup>, always_kept: &[DomainGroup]) -> Self {
        Self::from_source(source.into(), always_kept)
    }

    /// Merge everything a source yielded with the always-kept groups.
    ///
    /// Identical duplicates collapse into one entry. Groups that share a
    /// canonical name but cover different domains make that name a
    /// conflict: it is dropped from the desired groups for this pass. Names
    /// of rejected source entries are dropped the same way, so their
    /// certificates are neither requested nor removed.
    pub fn from_source(source: SourceGroups, always_kept: &[DomainGroup]) -> Self {
        let pinned: BTreeSet<CertName> = always_kept.iter().map(DomainGroup::canonical_name).collect();
        let mut groups: BTreeMap<CertName, DomainGroup> = BTreeMap::new();
        let mut conflicts: BTreeMap<CertName, String> = BTreeMap::new();

        for group in always_kept.iter().cloned().chain(source.groups) {
            let name = group.canonical_name();

            if let Some(reason) = conflicts.get_mut(&name) {
                reason.push_str(&format!(" vs [{}]", group));
                continue;
            }

            match groups.entry(name) {
                Entry::Vacant(slot) => {
                    slot.insert(group);
                }
                Entry::Occupied(existing) if *existing.get() == group => {
                    trace!(cert_name = %existing.key(), "Ignoring duplicate domain group");
                }
                Entry::Occupied(existing) => {
                    let (name, first) = existing.remove_entry();
                    warn!(
                        cert_name = %name,
                        first = %first,
                        second = %group,
                        "Conflicting domain groups share a certificate name"
                    );
                    conflicts.insert(
                        name,
                        format!("conflicting domain sets [{}] vs [{}]", first, group),
                    );
                }
            }
        }

        let mut rejected: BTreeMap<CertName, String> = BTreeMap::new();
        for reject in source.rejected {
            if groups.remove(&reject.name).is_some() {
                trace!(cert_name = %reject.name, "Withholding group shadowed by a rejected entry");
            }
            match rejected.entry(reject.name) {
                Entry::Vacant(slot) => {
                    slot.insert(reject.reason);
                }
                Entry::Occupied(mut existing) => {
                    existing.get_mut().push_str("; ");
                    existing.get_mut().push_str(&reject.reason);
                }
            }
        }

        Self {
            groups,
            pinned,
            conflicts,
            rejected,
        }
    }

    pub fn get(&self, name: &CertName) -> Option<&DomainGroup> {
        self.groups.get(name)
    }

    pub fn contains(&self, name: &CertName) -> bool {
        self.groups.contains_key(name)
    }

    /// Whether the name is on the always-kept allow-list
    pub fn is_pinned(&self, name: &CertName) -> bool {
        self.pinned.contains(name)
    }

    pub fn is_conflicted(&self, name: &CertName) -> bool {
        self.conflicts.contains_key(name)
    }

    /// Whether a source entry for the name was rejected
    pub fn is_rejected(&self, name: &CertName) -> bool {
        self.rejected.contains_key(name)
    }

    /// Whether the name must never be removed this pass
    pub fn protects(&self, name: &CertName) -> bool {
        self.contains(name)
            || self.is_pinned(name)
            || self.is_conflicted(name)
            || self.is_rejected(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = (&CertName, &DomainGroup)> {
        self.groups.iter()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = (&CertName, &String)> {
        self.conflicts.iter()
    }

    pub fn rejected(&self) -> impl Iterator<Item = (&CertName, &String)> {
        self.rejected.iter()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Snapshot of the certificates known to the authority client
#[derive(Debug, Clone, Default)]
pub struct ActualSet {
    certs: BTreeMap<CertName, IssuedCertificate>,
}

impl ActualSet {
    pub fn new(certs: Vec<IssuedCertificate>) -> Self {
        Self {
            certs: certs
                .into_iter()
                .map(|cert| (cert.name.clone(), cert))
                .collect(),
        }
    }

    pub fn get(&self, name: &CertName) -> Option<&IssuedCertificate> {
        self.certs.get(name)
    }

    pub fn contains(&self, name: &CertName) -> bool {
        self.certs.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &CertName> {
        self.certs.keys()
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}

/// Why a certificate is (re-)requested
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueReason {
    /// No certificate exists under this name
    New,
    /// A certificate exists but covers different domains
    DomainsChanged { previous: Vec<String> },
}

/// A certificate to request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueAction {
    pub group: DomainGroup,
    pub reason: IssueReason,
}

impl IssueAction {
    pub fn name(&self) -> CertName {
        self.group.canonical_name()
    }

    /// Desired hostnames absent from an existing certificate that covers a
    /// strict subset of the group.
    ///
    /// Non-empty when a previous request dropped hostnames that failed
    /// validation, which tends to repeat on every pass.
    pub fn missing_domains(&self) -> Vec<&str> {
        let IssueReason::DomainsChanged { previous } = &self.reason else {
            return Vec::new();
        };
        let wanted = self.group.domain_set();
        let issued: BTreeSet<&str> = previous.iter().map(String::as_str).collect();
        if !issued.is_subset(&wanted) {
            return Vec::new();
        }
        wanted.difference(&issued).copied().collect()
    }
}

/// A name that was set aside, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedName {
    pub name: CertName,
    pub reason: String,
}

/// Actions for one pass.
///
/// Every canonical name appears in at most one action list, so actions can
/// run concurrently without two operations ever targeting the same name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    /// Certificates to request
    pub issue: Vec<IssueAction>,
    /// Certificates to remove from the authority and storage
    pub remove: Vec<CertName>,
    /// Issued certificates whose stored copy is missing or stale
    pub repair: Vec<CertName>,
    /// Stored copies with no certificate behind them and no desire for one
    pub prune: Vec<CertName>,
    /// Issued, desired, stored: nothing to do
    pub unchanged: Vec<CertName>,
    /// Issued but undesired names kept by the allow-list, a conflict or a
    /// rejected source entry
    pub retained: Vec<CertName>,
    /// Names skipped because the desired state is ambiguous
    pub conflicts: Vec<SkippedName>,
    /// Names skipped because their source entry was invalid
    pub rejected: Vec<SkippedName>,
    /// Names whose stored copy could not be verified
    pub storage_errors: Vec<SkippedName>,
}

impl Plan {
    /// Whether the pass would call the authority client or write storage
    pub fn has_actions(&self) -> bool {
        !(self.issue.is_empty()
            && self.remove.is_empty()
            && self.repair.is_empty()
            && self.prune.is_empty())
    }

    /// Names the pass will act on
    pub fn action_names(&self) -> BTreeSet<CertName> {
        self.issue
            .iter()
            .map(IssueAction::name)
            .chain(self.remove.iter().cloned())
            .chain(self.repair.iter().cloned())
            .chain(self.prune.iter().cloned())
            .collect()
    }
}

/// Diff desired against actual.
///
/// Storage is not consulted here: names that are desired and issued with
/// matching domains land in `unchanged`, and the engine later moves those
/// whose stored copy is missing or differs into `repair`.
pub fn compute(desired: &DesiredSet, actual: &ActualSet) -> Plan {
    let mut plan = Plan::default();

    for (name, group) in desired.groups() {
        match actual.get(name) {
            None => plan.issue.push(IssueAction {
                group: group.clone(),
                reason: IssueReason::New,
            }),
            Some(cert) if !group.covers_exactly(&cert.domains) => plan.issue.push(IssueAction {
                group: group.clone(),
                reason: IssueReason::DomainsChanged {
                    previous: cert.domains.clone(),
                },
            }),
            Some(_) => plan.unchanged.push(name.clone()),
        }
    }

    for name in actual.names() {
        if desired.contains(name) {
            continue;
        }
        if desired.protects(name) {
            plan.retained.push(name.clone());
        } else {
            plan.remove.push(name.clone());
        }
    }

    plan.conflicts = desired
        .conflicts()
        .map(|(name, reason)| SkippedName {
            name: name.clone(),
            reason: reason.clone(),
        })
        .collect();
    plan.rejected = desired
        .rejected()
        .map(|(name, reason)| SkippedName {
            name: name.clone(),
            reason: reason.clone(),
        })
        .collect();

    plan
}
