//! Pass metrics in Prometheus text format
//!
//! certsync runs as a one-shot job or a slow loop, so there is no scrape
//! endpoint. After every pass the current values are written to a textfile
//! for node_exporter's textfile collector.

use std::io::Write;
use std::path::{Path, PathBuf};

use prometheus::{
    Encoder, Gauge, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use tracing::debug;

use crate::error::MetricsError;
use crate::reconcile::PassSummary;

/// How a pass ended, for the `result` label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassResult {
    Clean,
    Failures,
    Aborted,
}

impl PassResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Failures => "failures",
            Self::Aborted => "aborted",
        }
    }

    pub fn of(summary: &PassSummary) -> Self {
        if summary.has_failures() {
            Self::Failures
        } else {
            Self::Clean
        }
    }
}

/// Reconciliation metrics, registered in a private registry
#[derive(Clone)]
pub struct PassMetrics {
    registry: Registry,
    outcomes: IntGaugeVec,
    failures: IntGauge,
    passes_total: IntCounterVec,
    last_pass_timestamp: Gauge,
    last_pass_duration: Gauge,
}

impl PassMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let outcomes = IntGaugeVec::new(
            Opts::new(
                "certsync_pass_outcomes",
                "Certificates per outcome in the last completed pass",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(outcomes.clone()))?;

        let failures = IntGauge::new(
            "certsync_pass_failures",
            "Names that failed to reconcile in the last completed pass",
        )?;
        registry.register(Box::new(failures.clone()))?;

        let passes_total = IntCounterVec::new(
            Opts::new("certsync_passes_total", "Reconciliation passes by result"),
            &["result"],
        )?;
        registry.register(Box::new(passes_total.clone()))?;

        let last_pass_timestamp = Gauge::new(
            "certsync_last_pass_timestamp_seconds",
            "Unix time the last completed pass started",
        )?;
        registry.register(Box::new(last_pass_timestamp.clone()))?;

        let last_pass_duration = Gauge::new(
            "certsync_last_pass_duration_seconds",
            "Wall-clock duration of the last completed pass",
        )?;
        registry.register(Box::new(last_pass_duration.clone()))?;

        Ok(Self {
            registry,
            outcomes,
            failures,
            passes_total,
            last_pass_timestamp,
            last_pass_duration,
        })
    }

    /// Record a completed pass
    pub fn observe(&self, summary: &PassSummary) {
        for (outcome, count) in summary.counts.by_outcome() {
            self.outcomes
                .with_label_values(&[outcome])
                .set(i64::try_from(count).unwrap_or(i64::MAX));
        }
        self.failures
            .set(i64::try_from(summary.failures.len()).unwrap_or(i64::MAX));
        self.last_pass_timestamp
            .set(summary.started_at.timestamp() as f64);
        self.last_pass_duration.set(summary.duration.as_secs_f64());
        self.passes_total
            .with_label_values(&[PassResult::of(summary).as_str()])
            .inc();
    }

    /// Record a pass that aborted before acting
    pub fn observe_aborted(&self) {
        self.passes_total
            .with_label_values(&[PassResult::Aborted.as_str()])
            .inc();
    }

    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}

/// Writes [`PassMetrics`] to a textfile after each pass
pub struct TextfileExporter {
    path: PathBuf,
    metrics: PassMetrics,
}

impl TextfileExporter {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, MetricsError> {
        Ok(Self {
            path: path.into(),
            metrics: PassMetrics::new()?,
        })
    }

    pub fn metrics(&self) -> &PassMetrics {
        &self.metrics
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the textfile with the current values.
    ///
    /// The file is renamed into place so the collector never reads a
    /// partial write.
    pub fn write(&self) -> Result<(), MetricsError> {
        let text = self.metrics.encode_text()?;
        let write_err = |source: std::io::Error| MetricsError::Write {
            path: self.path.clone(),
            source,
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
        file.write_all(text.as_bytes()).map_err(write_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o644))
                .map_err(write_err)?;
        }

        file.persist(&self.path).map_err(|e| write_err(e.error))?;
        debug!(path = %self.path.display(), "Wrote metrics textfile");
        Ok(())
    }
}
