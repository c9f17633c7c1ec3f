/*!
Observability infrastructure for Codekeep.

Structured logging through `tracing-subscriber`, plus optional Prometheus
counters for the backup jobs behind the `metrics` feature.
*/

#[cfg(feature = "metrics")]
use prometheus::{core::Collector, Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry as TracingRegistry};

use crate::{CodekeepError, Result};

/// Filter directives used when `RUST_LOG` is not set
pub fn default_directives(verbose: bool) -> String {
    let level = if verbose { "debug" } else { "info" };
    format!("codekeep={level},codekeep_core={level},codekeep_retry={level}")
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over [`default_directives`]. With `json` set,
/// events are emitted as one JSON object per line.
///
/// # Errors
/// Fails if a global subscriber is already installed.
pub fn init_logging(verbose: bool, json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    BackupMetrics::global();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));
    let registry = TracingRegistry::default().with(filter);

    let installed = if json {
        set_global_default(
            registry.with(
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_current_span(false),
            ),
        )
    } else {
        set_global_default(registry.with(fmt::layer().with_target(verbose)))
    };

    installed.map_err(|e| {
        CodekeepError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!(json, verbose, "Logging initialized");
    Ok(())
}

#[cfg(feature = "metrics")]
static METRICS: OnceLock<BackupMetrics> = OnceLock::new();

/// Counters and histograms for the backup jobs
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct BackupMetrics {
    pub snapshots_total: Counter,
    pub snapshot_failures_total: Counter,
    pub snapshot_size_bytes: Histogram,
    pub pruned_objects_total: Counter,
    pub prune_failures_total: Counter,
    pub dispatch_misses_total: Counter,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn register<C>(registry: &Registry, collector: C) -> Result<C>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| CodekeepError::validation(format!("Failed to register metric: {e}")))?;
    Ok(collector)
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| CodekeepError::validation(format!("Failed to create {name} metric: {e}")))?;
    register(registry, counter)
}

#[cfg(feature = "metrics")]
impl BackupMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let snapshot_size_bytes = Histogram::with_opts(
            HistogramOpts::new(
                "codekeep_snapshot_size_bytes",
                "Size of serialized backup archives in bytes",
            )
            .buckets(prometheus::exponential_buckets(1024.0, 4.0, 10).map_err(|e| {
                CodekeepError::validation(format!("Invalid histogram buckets: {e}"))
            })?),
        )
        .map_err(|e| {
            CodekeepError::validation(format!("Failed to create snapshot_size_bytes metric: {e}"))
        })?;

        Ok(Self {
            snapshots_total: counter(
                &registry,
                "codekeep_snapshots_total",
                "Backup archives written",
            )?,
            snapshot_failures_total: counter(
                &registry,
                "codekeep_snapshot_failures_total",
                "Backup runs that failed",
            )?,
            snapshot_size_bytes: register(&registry, snapshot_size_bytes)?,
            pruned_objects_total: counter(
                &registry,
                "codekeep_pruned_objects_total",
                "Archive objects deleted by retention",
            )?,
            prune_failures_total: counter(
                &registry,
                "codekeep_prune_failures_total",
                "Retention runs that failed",
            )?,
            dispatch_misses_total: counter(
                &registry,
                "codekeep_dispatch_misses_total",
                "Scheduled events with no registered handler",
            )?,
            registry,
        })
    }

    /// Get or initialize the process-wide metrics
    pub fn global() -> &'static BackupMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize Codekeep metrics"))
    }

    pub fn record_snapshot(&self, size_bytes: usize) {
        self.snapshots_total.inc();
        self.snapshot_size_bytes.observe(size_bytes as f64);
    }

    pub fn record_snapshot_failure(&self) {
        self.snapshot_failures_total.inc();
    }

    pub fn record_pruned(&self, count: usize) {
        self.pruned_objects_total.inc_by(count as f64);
    }

    pub fn record_prune_failure(&self) {
        self.prune_failures_total.inc();
    }

    pub fn record_dispatch_miss(&self) {
        self.dispatch_misses_total.inc();
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| CodekeepError::validation(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| CodekeepError::validation(format!("Metrics are not valid UTF-8: {e}")))
    }
}
