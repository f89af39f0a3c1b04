//! Pass scheduling
//!
//! Runs reconciliation passes once or on a fixed interval, reporting each
//! pass through the log and the optional metrics textfile.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::metrics::TextfileExporter;
use crate::reconcile::{PassSummary, Reconciler};

/// Default interval between passes (1 hour)
pub const DEFAULT_PASS_INTERVAL: Duration = Duration::from_secs(3600);

/// Minimum interval between passes (1 minute)
const MIN_PASS_INTERVAL: Duration = Duration::from_secs(60);

/// Drives [`Reconciler`] passes
pub struct PassScheduler {
    reconciler: Arc<Reconciler>,
    exporter: Option<TextfileExporter>,
    pass_interval: Duration,
}

impl PassScheduler {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            exporter: None,
            pass_interval: DEFAULT_PASS_INTERVAL,
        }
    }

    /// Set the pass interval
    ///
    /// The interval is clamped to a minimum of 1 minute so a misconfigured
    /// loop cannot hammer the ACME server.
    pub fn with_interval(mut self, pass_interval: Duration) -> Self {
        self.pass_interval = pass_interval.max(MIN_PASS_INTERVAL);
        self
    }

    /// Write metrics to a textfile after every pass
    pub fn with_exporter(mut self, exporter: TextfileExporter) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn pass_interval(&self) -> Duration {
        self.pass_interval
    }

    /// Run a single pass and report it
    pub async fn run_once(&self) -> Result<PassSummary, ReconcileError> {
        let result = self.reconciler.run_pass().await;
        self.report(&result);
        result
    }

    /// Run passes until `shutdown` flips to `true`.
    ///
    /// The first pass starts immediately. A pass in progress when shutdown
    /// is requested runs to completion.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.pass_interval.as_secs(),
            max_concurrency = self.reconciler.max_concurrency(),
            dry_run = self.reconciler.is_dry_run(),
            "Starting reconciliation loop"
        );

        let mut ticker = interval(self.pass_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("Shutdown sender dropped");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    // Failures are already reported; the next tick retries
                    let _ = self.run_once().await;
                }
            }
        }

        info!("Reconciliation loop stopped");
    }

    fn report(&self, result: &Result<PassSummary, ReconcileError>) {
        let Some(exporter) = &self.exporter else {
            return;
        };

        match result {
            Ok(summary) => exporter.metrics().observe(summary),
            Err(_) => exporter.metrics().observe_aborted(),
        }

        if let Err(e) = exporter.write() {
            warn!(error = %e, path = %exporter.path().display(), "Failed to write metrics textfile");
        }
    }
}
