//! Desired-state reconciliation
//!
//! Each pass is stateless: desired and actual snapshots are rebuilt from
//! the source and the authority client, diffed into a [`Plan`], and the
//! plan is executed by the [`Reconciler`]. Anything that fails is simply
//! picked up again by the next pass.

mod engine;
mod plan;
mod summary;

pub use engine::{Reconciler, MAX_CONCURRENCY};
pub use plan::{
    compute, ActualSet, DesiredSet, IssueAction, IssueReason, Plan, SkippedName,
};
pub use summary::{FailureKind, PassCounts, PassFailure, PassSummary};
